//! Event-driven expiration.
//!
//! Each expiring session gets a companion marker key whose TTL is exactly
//! the session's inactivity timeout. The backend expires the marker natively
//! and publishes an event; the subscriber turns that event into an
//! asynchronous delete through the manager. The session hash outlives its
//! marker by [`SAFETY_MARGIN`] so the delete can still read it.
//!
//! The backend only expires keys lazily (on access) or by sampling, so
//! sessions are also filed into per-minute buckets. A sweep touches the
//! markers of the previous minute's bucket, which makes the backend notice
//! and publish their expiry on time.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use stow_session::{Error, Result, SessionData, SessionDeleter, TaskHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{ExpirationStrategy, SAFETY_MARGIN, StrategyContext, interval};
use crate::keys::{KeyLayout, round_down_minute};
use crate::store::{MessageListener, StoreError};

/// Name of the one-shot task running the expiry subscription.
pub const SUBSCRIBER_TASK: &str = "session-expiry-subscriber";

/// Name of the periodic bucket sweep.
pub const BUCKET_SWEEP_TASK: &str = "session-expiry-bucket-sweep";

pub const BUCKET_SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Pattern matching key-expiry events of every database.
pub const EXPIRED_EVENT_PATTERN: &str = "__keyevent@*__:expired";

/// Delays between subscription attempts, in milliseconds.
pub const BACKOFF_LADDER_MS: [u64; 13] = [
    1000, 1000, 2000, 3000, 5000, 8000, 13000, 21000, 34000, 55000, 89000, 144000, 233000,
];

const MINUTE: Duration = Duration::from_secs(60);
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Waits for a retry delay. Returns `false` when `cancel` fired first.
pub type Sleeper = Arc<dyn Fn(Duration, &CancellationToken) -> bool + Send + Sync>;

fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + delay;
    while !cancel.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
    false
}

/// Position on the subscription retry ladder.
#[derive(Debug, Default)]
pub struct Backoff {
    step: usize,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next delay, or `None` once the ladder is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let ms = BACKOFF_LADDER_MS.get(self.step)?;
        self.step += 1;
        Some(Duration::from_millis(*ms))
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Delays handed out since the last reset.
    pub fn attempts(&self) -> usize {
        self.step
    }
}

/// Turns marker expiry events into session deletes.
struct ExpiryListener {
    keys: KeyLayout,
    deleter: Arc<dyn SessionDeleter>,
    backoff: Arc<Mutex<Backoff>>,
}

impl MessageListener for ExpiryListener {
    fn on_subscribed(&self, pattern: &str) {
        self.backoff.lock().reset();
        info!(pattern, "Subscribed to key-expiry events");
    }

    fn on_message(&self, _channel: &str, key: &str) {
        let Some(id) = self.keys.id_from_marker(key) else {
            trace!(key, "Ignoring expiry of unrelated key");
            return;
        };
        debug!(session_id = %id, "Session marker expired");
        self.deleter.delete_async(id, true);
    }
}

/// Keep the expiry subscription alive until cancelled.
///
/// Transient failures are retried along [`BACKOFF_LADDER_MS`]; a successful
/// subscription resets the ladder. Exhausting it, or any other failure,
/// ends the loop with an error.
fn subscription_loop(ctx: &StrategyContext, sleeper: &Sleeper, cancel: &CancellationToken) -> Result<()> {
    let backoff = Arc::new(Mutex::new(Backoff::new()));
    let listener = ExpiryListener {
        keys: ctx.keys.clone(),
        deleter: Arc::clone(&ctx.deleter),
        backoff: Arc::clone(&backoff),
    };

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let last_error = match ctx.store.psubscribe(EXPIRED_EVENT_PATTERN, &listener, cancel) {
            Ok(()) if cancel.is_cancelled() => return Ok(()),
            Ok(()) => "subscription ended by the backend".to_string(),
            Err(StoreError::Closed) => {
                debug!("Store closed, ending expiry subscription");
                return Ok(());
            }
            Err(e) if ctx.store.is_transient_failure(&e) => e.to_string(),
            Err(e) => {
                error!(error = %e, "Expiry subscription failed");
                return Err(Error::SubscriptionFailed(e.to_string()));
            }
        };

        let next = backoff.lock().next_delay();
        let Some(delay) = next else {
            error!(
                attempts = BACKOFF_LADDER_MS.len(),
                error = %last_error,
                "Expiry subscription retries exhausted"
            );
            return Err(Error::SubscriptionExhausted {
                attempts: BACKOFF_LADDER_MS.len(),
                last_error,
            });
        };

        warn!(
            delay_ms = delay.as_millis() as u64,
            attempt = backoff.lock().attempts(),
            error = %last_error,
            "Expiry subscription lost, retrying"
        );
        if !sleeper(delay, cancel) {
            return Ok(());
        }
    }
}

/// Touch every marker filed in the previous minute's bucket.
fn sweep_bucket(ctx: &StrategyContext, now: i64) -> Result<usize> {
    let minute = round_down_minute(now) - MINUTE.as_millis() as i64;
    let bucket = ctx.keys.bucket_key(minute);

    let mut touched = 0;
    while let Some(id) = ctx.store.spop(&bucket)? {
        ctx.store.exists(&ctx.keys.marker_key(&id))?;
        touched += 1;
    }
    ctx.store.del(&bucket)?;

    if touched > 0 {
        debug!(bucket = %bucket, touched, "Swept expiry bucket");
    }
    Ok(touched)
}

/// Expiration driven by the backend's key-expiry events.
pub struct NotificationExpiration {
    ctx: StrategyContext,
    sleeper: Sleeper,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl NotificationExpiration {
    pub fn new(ctx: StrategyContext) -> Self {
        Self {
            ctx,
            sleeper: Arc::new(sleep_unless_cancelled),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Replace how retry delays are waited out.
    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Run the subscription loop on the calling thread until `cancel` fires
    /// or the loop fails.
    pub fn run_subscriber(&self, cancel: &CancellationToken) -> Result<()> {
        subscription_loop(&self.ctx, &self.sleeper, cancel)
    }

    /// Run one bucket sweep as of `now`. Returns how many markers it touched.
    pub fn sweep_expired_buckets(&self, now: i64) -> Result<usize> {
        sweep_bucket(&self.ctx, now)
    }

    fn bucket_for(&self, session: &SessionData) -> Option<String> {
        session
            .expires_at()
            .map(|at| self.ctx.keys.bucket_key(round_down_minute(at)))
    }
}

impl ExpirationStrategy for NotificationExpiration {
    fn session_touched(&self, session: &SessionData) -> Result<()> {
        let id = session.id();
        let marker = self.ctx.keys.marker_key(id);

        let Some(expires_at) = session.expires_at() else {
            self.ctx.store.del(&marker)?;
            return self.ctx.renew_session_ttl(session);
        };

        let minute = round_down_minute(expires_at);
        let bucket = self.ctx.keys.bucket_key(minute);
        let bucket_expiry = minute + (MINUTE + SAFETY_MARGIN).as_millis() as i64;
        self.ctx.store.sadd(&bucket, id)?;
        self.ctx.store.expire_at(&bucket, bucket_expiry)?;

        self.ctx.store.set(&marker, b"")?;
        self.ctx.store.expire(&marker, interval(session))?;

        self.ctx.renew_session_ttl(session)
    }

    fn session_deleted(&self, session: &SessionData) -> Result<()> {
        self.ctx.store.del(&self.ctx.keys.marker_key(session.id()))?;
        if let Some(bucket) = self.bucket_for(session) {
            self.ctx.store.srem(&bucket, session.id())?;
        }
        Ok(())
    }

    fn session_id_change(&self, session: &SessionData) -> Result<()> {
        let Some(new_id) = session.new_id() else {
            return Ok(());
        };
        let Some(bucket) = self.bucket_for(session) else {
            return Ok(());
        };

        let old_marker = self.ctx.keys.marker_key(session.id());
        let new_marker = self.ctx.keys.marker_key(new_id);
        match self.ctx.store.rename(&old_marker, &new_marker) {
            Ok(()) => {}
            Err(StoreError::NoSuchKey(_)) => {
                debug!(session_id = %session.id(), "Expiry marker already gone");
            }
            Err(e) => return Err(e.into()),
        }

        self.ctx.store.srem(&bucket, session.id())?;
        self.ctx.store.sadd(&bucket, new_id)?;
        Ok(())
    }

    fn start_expired_sessions_task(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }

        let ctx = self.ctx.clone();
        let sleeper = Arc::clone(&self.sleeper);
        tasks.push(self.ctx.scheduler.submit(
            SUBSCRIBER_TASK,
            Box::new(move |cancel| {
                if let Err(e) = subscription_loop(&ctx, &sleeper, &cancel) {
                    error!(error = %e, "Expiry subscriber stopped; sessions will only expire by TTL");
                }
            }),
        ));

        let ctx = self.ctx.clone();
        tasks.push(self.ctx.scheduler.schedule_at_fixed_rate(
            BUCKET_SWEEP_TASK,
            Arc::new(move || {
                if let Err(e) = sweep_bucket(&ctx, stow_session::now_millis()) {
                    warn!(error = %e, "Expiry bucket sweep failed");
                }
            }),
            BUCKET_SWEEP_PERIOD,
        ));

        info!("Notification expiration started");
        Ok(())
    }

    fn requires_expiry_notifications(&self) -> bool {
        true
    }

    fn close(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.cancel();
        }
    }
}
