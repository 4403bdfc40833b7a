#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use stow_config::{ExpirationMode, RemoteConfig, SessionConfig};
use stow_redis::{KeyLayout, MemoryStore, StrategyContext, ValueStore};
use stow_session::{ManualScheduler, RepositoryContext, Result, SessionDeleter};
use tokio_util::sync::CancellationToken;

/// Deleter that records every call.
#[derive(Default)]
pub struct RecordingDeleter {
    deleted: Mutex<Vec<(String, bool)>>,
    scheduled: Mutex<Vec<(String, bool)>>,
}

impl RecordingDeleter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deleted(&self) -> Vec<(String, bool)> {
        self.deleted.lock().clone()
    }

    pub fn scheduled(&self) -> Vec<(String, bool)> {
        self.scheduled.lock().clone()
    }
}

impl SessionDeleter for RecordingDeleter {
    fn delete(&self, id: &str, expired: bool) -> Result<()> {
        self.deleted.lock().push((id.to_string(), expired));
        Ok(())
    }

    fn delete_async(&self, id: &str, expired: bool) {
        self.scheduled.lock().push((id.to_string(), expired));
    }
}

pub fn remote_config(mode: ExpirationMode) -> SessionConfig {
    SessionConfig::new()
        .with_namespace("app")
        .with_max_inactive_interval(60)
        .with_remote(RemoteConfig::new().with_expiration(mode))
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub scheduler: Arc<ManualScheduler>,
    pub deleter: Arc<RecordingDeleter>,
    pub keys: KeyLayout,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            scheduler: Arc::new(ManualScheduler::new()),
            deleter: RecordingDeleter::new(),
            keys: KeyLayout::new("stow:", "app"),
        }
    }

    pub fn repository_context(&self, config: SessionConfig) -> RepositoryContext {
        RepositoryContext {
            config: Arc::new(config),
            scheduler: self.scheduler.clone(),
            deleter: self.deleter.clone(),
        }
    }

    pub fn strategy_context(&self) -> StrategyContext {
        let store: Arc<dyn ValueStore> = self.store.clone();
        StrategyContext::new(
            &self.repository_context(remote_config(ExpirationMode::Notification)),
            store,
            self.keys.clone(),
        )
    }
}

/// Sleeper that records requested delays and returns immediately.
pub fn recording_sleeper() -> (stow_redis::Sleeper, Arc<Mutex<Vec<Duration>>>) {
    let delays = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&delays);
    let sleeper: stow_redis::Sleeper = Arc::new(move |delay: Duration, cancel: &CancellationToken| {
        recorded.lock().push(delay);
        !cancel.is_cancelled()
    });
    (sleeper, delays)
}

/// Poll `check` until it holds or two seconds pass.
pub fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}
