//! Process-local session repository.
//!
//! Sessions live in two maps (timing records and attributes) keyed by the
//! namespaced id. A periodic task scans every session and deletes the ones
//! past their inactivity timeout. Each scan costs O(active sessions), which
//! is fine at modest scale and the reason this repository is not meant for
//! large deployments. Nothing is shared with other nodes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::attribute::AttributeValue;
use crate::data::{SessionData, now_millis};
use crate::error::Result;
use crate::repository::{CommitTransaction, RepositoryContext, SessionDeleter, SessionRepository};
use crate::scheduler::TaskHandle;

/// Name of the periodic expiry scan.
pub const CLEANUP_TASK: &str = "in-memory-session-cleanup";

#[derive(Debug, Clone)]
struct StoredSession {
    data: SessionData,
    /// Set once some caller won `prepare_remove`.
    invalid: bool,
}

#[derive(Debug, Default)]
struct InMemoryState {
    sessions: RwLock<HashMap<String, StoredSession>>,
    attributes: RwLock<HashMap<String, HashMap<String, AttributeValue>>>,
}

impl InMemoryState {
    /// Ids (without namespace) of live sessions expired at `now`.
    fn expired_ids(&self, prefix: &str, now: i64) -> Vec<String> {
        self.sessions
            .read()
            .iter()
            .filter(|(_, s)| !s.invalid && s.data.is_expired(now))
            .filter_map(|(key, _)| key.strip_prefix(prefix).map(str::to_string))
            .collect()
    }
}

/// Remove expired sessions through the deleter. Returns how many were found.
fn scan_expired(
    state: &InMemoryState,
    prefix: &str,
    deleter: &dyn SessionDeleter,
    now: i64,
) -> usize {
    let expired = state.expired_ids(prefix, now);
    for id in &expired {
        debug!(session_id = %id, "Cleaning up expired session");
        if let Err(e) = deleter.delete(id, true) {
            warn!(session_id = %id, error = %e, "Failed to delete expired session");
        }
    }
    if !expired.is_empty() {
        debug!(count = expired.len(), "Cleaned up expired sessions");
    }
    expired.len()
}

/// Session repository backed by process-local maps.
pub struct InMemoryRepository {
    ctx: RepositoryContext,
    prefix: String,
    state: Arc<InMemoryState>,
    cleanup: Mutex<Option<TaskHandle>>,
}

impl InMemoryRepository {
    pub fn new(ctx: RepositoryContext) -> Self {
        let prefix = ctx.namespaced("");
        Self {
            ctx,
            prefix,
            state: Arc::new(InMemoryState::default()),
            cleanup: Mutex::new(None),
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    /// Number of stored sessions, including ones being removed.
    pub fn len(&self) -> usize {
        self.state.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.sessions.read().is_empty()
    }

    /// Run one expiry scan immediately.
    pub fn cleanup_expired(&self, now: i64) -> usize {
        scan_expired(&self.state, &self.prefix, self.ctx.deleter.as_ref(), now)
    }
}

impl SessionRepository for InMemoryRepository {
    fn get(&self, id: &str) -> Result<Option<SessionData>> {
        let sessions = self.state.sessions.read();
        match sessions.get(&self.key(id)) {
            Some(stored) if !stored.invalid => Ok(Some(stored.data.clone())),
            Some(_) => {
                trace!(session_id = %id, "Session is being removed");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn store(&self, session: &SessionData) -> Result<()> {
        let mut sessions = self.state.sessions.write();
        sessions
            .entry(self.key(session.id()))
            .and_modify(|stored| stored.data = session.clone())
            .or_insert_with(|| StoredSession {
                data: session.clone(),
                invalid: false,
            });
        Ok(())
    }

    fn get_attribute(&self, session: &SessionData, name: &str) -> Result<Option<AttributeValue>> {
        Ok(self
            .state
            .attributes
            .read()
            .get(&self.key(session.id()))
            .and_then(|attrs| attrs.get(name))
            .cloned())
    }

    fn set_attribute(
        &self,
        session: &SessionData,
        name: &str,
        value: &AttributeValue,
    ) -> Result<()> {
        self.state
            .attributes
            .write()
            .entry(self.key(session.id()))
            .or_default()
            .insert(name.to_string(), value.clone());
        Ok(())
    }

    fn remove_attribute(&self, session: &SessionData, name: &str) -> Result<()> {
        if let Some(attrs) = self.state.attributes.write().get_mut(&self.key(session.id())) {
            attrs.remove(name);
        }
        Ok(())
    }

    fn get_all_keys(&self, session: &SessionData) -> Result<BTreeSet<String>> {
        Ok(self
            .state
            .attributes
            .read()
            .get(&self.key(session.id()))
            .map(|attrs| attrs.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn remove(&self, session: &SessionData) -> Result<()> {
        let key = self.key(session.id());
        self.state.sessions.write().remove(&key);
        self.state.attributes.write().remove(&key);
        Ok(())
    }

    fn prepare_remove(&self, session: &SessionData) -> Result<bool> {
        let mut sessions = self.state.sessions.write();
        match sessions.get_mut(&self.key(session.id())) {
            Some(stored) if !stored.invalid => {
                stored.invalid = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn start_commit(&self, session: &SessionData) -> Result<Box<dyn CommitTransaction + '_>> {
        Ok(Box::new(InMemoryTransaction {
            repository: self,
            session: session.clone(),
            added: Vec::new(),
            removed: Vec::new(),
        }))
    }

    fn session_id_change(&self, session: &SessionData) -> Result<()> {
        let Some(new_id) = session.new_id() else {
            return Ok(());
        };
        let old_key = self.key(session.id());
        let new_key = self.key(new_id);

        let mut sessions = self.state.sessions.write();
        let mut attributes = self.state.attributes.write();
        if let Some(mut stored) = sessions.remove(&old_key) {
            stored.data = session.clone();
            stored.data.swap_id();
            sessions.insert(new_key.clone(), stored);
        }
        if let Some(attrs) = attributes.remove(&old_key) {
            attributes.insert(new_key, attrs);
        }
        Ok(())
    }

    fn owned_session_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .state
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| !s.invalid)
            .filter_map(|(key, _)| key.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }

    fn start(&self) -> Result<()> {
        let mut cleanup = self.cleanup.lock();
        if cleanup.is_some() {
            return Ok(());
        }

        let state = Arc::clone(&self.state);
        let deleter = Arc::clone(&self.ctx.deleter);
        let prefix = self.prefix.clone();
        let handle = self.ctx.scheduler.schedule_at_fixed_rate(
            CLEANUP_TASK,
            Arc::new(move || {
                scan_expired(&state, &prefix, deleter.as_ref(), now_millis());
            }),
            self.ctx.config.in_memory.cleanup_interval(),
        );
        *cleanup = Some(handle);
        Ok(())
    }

    fn close(&self) {
        if let Some(handle) = self.cleanup.lock().take() {
            handle.cancel();
        }
    }

    fn is_distributed(&self) -> bool {
        false
    }
}

/// Buffered changes applied to the in-memory maps on commit.
struct InMemoryTransaction<'a> {
    repository: &'a InMemoryRepository,
    session: SessionData,
    added: Vec<(String, AttributeValue)>,
    removed: Vec<String>,
}

impl CommitTransaction for InMemoryTransaction<'_> {
    fn add_attribute(&mut self, name: &str, value: &AttributeValue) {
        self.added.push((name.to_string(), value.clone()));
    }

    fn remove_attribute(&mut self, name: &str) {
        self.removed.push(name.to_string());
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let key = self.repository.key(self.session.id());
        if !self.added.is_empty() || !self.removed.is_empty() {
            let mut attributes = self.repository.state.attributes.write();
            let attrs = attributes.entry(key).or_default();
            for name in &self.removed {
                attrs.remove(name);
            }
            for (name, value) in self.added {
                attrs.insert(name, value);
            }
        }
        self.repository.store(&self.session)
    }

    fn is_distributing(&self) -> bool {
        false
    }

    fn is_set_all_attributes(&self) -> bool {
        false
    }
}
