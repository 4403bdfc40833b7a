//! Session lookup, creation and deletion.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use stow_config::SessionConfig;
use tracing::{debug, info, warn};

use crate::data::{SessionData, now_millis};
use crate::error::{Error, Result};
use crate::facade::{SessionFacade, SessionState};
use crate::id::{SessionIdProvider, UuidIdProvider};
use crate::memory::InMemoryRepository;
use crate::notifier::{SessionNotifier, TracingNotifier};
use crate::repository::{RepositoryContext, SessionDeleter, SessionRepository};
use crate::scheduler::Scheduler;

/// Name of the one-shot task used by [`SessionManager::delete_async`].
pub const DELETE_TASK: &str = "session-delete";

#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    pub(crate) created: AtomicU64,
    pub(crate) retrieved: AtomicU64,
    pub(crate) missing: AtomicU64,
    pub(crate) expired: AtomicU64,
    pub(crate) deleted: AtomicU64,
    pub(crate) conflicts: AtomicU64,
    pub(crate) failovers: AtomicU64,
    pub(crate) commits: AtomicU64,
    pub(crate) id_changes: AtomicU64,
}

/// Session manager statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Sessions created.
    pub created: u64,
    /// Lookups that found a live session.
    pub retrieved: u64,
    /// Lookups for ids the repository did not know.
    pub missing: u64,
    /// Sessions found expired on lookup.
    pub expired: u64,
    /// Sessions destroyed through `delete`.
    pub deleted: u64,
    /// Destroy attempts that lost the ownership claim.
    pub invalidation_conflicts: u64,
    /// Sticky sessions picked up from another node.
    pub failovers: u64,
    /// Façade commits.
    pub commits: u64,
    /// Session id rotations.
    pub id_changes: u64,
}

/// Collaborators shared by the manager and every façade it hands out.
pub(crate) struct SessionContext {
    pub(crate) config: Arc<SessionConfig>,
    pub(crate) repository: Arc<dyn SessionRepository>,
    pub(crate) notifier: Arc<dyn SessionNotifier>,
    pub(crate) counters: SessionCounters,
}

impl SessionContext {
    pub(crate) fn invalidation_conflict(&self, session: &SessionData, expiry: bool) {
        self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
        if expiry {
            debug!(
                session_id = %session.id(),
                "Expired session already removed by another actor"
            );
        } else {
            warn!(
                session_id = %session.id(),
                "Invalidation conflict: session already removed by another actor"
            );
        }
    }
}

/// [`SessionDeleter`] bound to a manager after it has been built.
///
/// Holds a weak reference so repositories never keep their manager alive.
#[derive(Default)]
struct ManagerLink {
    manager: OnceLock<Weak<SessionManager>>,
}

impl ManagerLink {
    fn bind(&self, manager: &Arc<SessionManager>) {
        let _ = self.manager.set(Arc::downgrade(manager));
    }

    fn upgrade(&self) -> Option<Arc<SessionManager>> {
        self.manager.get().and_then(Weak::upgrade)
    }
}

impl SessionDeleter for ManagerLink {
    fn delete(&self, id: &str, expired: bool) -> Result<()> {
        match self.upgrade() {
            Some(manager) => manager.delete(id, expired),
            None => {
                debug!(session_id = %id, "Session manager gone, skipping delete");
                Ok(())
            }
        }
    }

    fn delete_async(&self, id: &str, expired: bool) {
        match self.upgrade() {
            Some(manager) => manager.delete_async(id, expired),
            None => debug!(session_id = %id, "Session manager gone, skipping delete"),
        }
    }
}

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    config: SessionConfig,
    scheduler: Arc<dyn Scheduler>,
    notifier: Arc<dyn SessionNotifier>,
    id_provider: Arc<dyn SessionIdProvider>,
}

impl SessionManagerBuilder {
    pub fn new(config: SessionConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            config,
            scheduler,
            notifier: Arc::new(TracingNotifier),
            id_provider: Arc::new(UuidIdProvider),
        }
    }

    pub fn notifier(mut self, notifier: Arc<dyn SessionNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn id_provider(mut self, provider: Arc<dyn SessionIdProvider>) -> Self {
        self.id_provider = provider;
        self
    }

    /// Build the manager around the repository returned by `build_repository`,
    /// then start the repository's background work.
    pub fn build<F>(self, build_repository: F) -> Result<Arc<SessionManager>>
    where
        F: FnOnce(RepositoryContext) -> Result<Arc<dyn SessionRepository>>,
    {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let link = Arc::new(ManagerLink::default());

        let repository = build_repository(RepositoryContext {
            config: Arc::clone(&config),
            scheduler: Arc::clone(&self.scheduler),
            deleter: link.clone(),
        })?;

        let manager = Arc::new(SessionManager {
            ctx: Arc::new(SessionContext {
                config,
                repository,
                notifier: self.notifier,
                counters: SessionCounters::default(),
            }),
            scheduler: self.scheduler,
            id_provider: self.id_provider,
            closed: AtomicBool::new(false),
        });
        link.bind(&manager);

        manager.ctx.repository.start()?;
        info!(
            namespace = %manager.ctx.config.namespace,
            distributed = manager.ctx.repository.is_distributed(),
            "Session manager started"
        );
        Ok(manager)
    }

    /// Build the manager with a process-local repository.
    pub fn build_in_memory(self) -> Result<Arc<SessionManager>> {
        self.build(|ctx| Ok(Arc::new(InMemoryRepository::new(ctx)) as Arc<dyn SessionRepository>))
    }
}

/// Resolves, creates and deletes sessions.
///
/// Owns the repository and the scheduler; the repository reaches back into
/// the manager only through the [`SessionDeleter`] it was built with.
pub struct SessionManager {
    ctx: Arc<SessionContext>,
    scheduler: Arc<dyn Scheduler>,
    id_provider: Arc<dyn SessionIdProvider>,
    closed: AtomicBool,
}

impl SessionManager {
    pub fn builder(config: SessionConfig, scheduler: Arc<dyn Scheduler>) -> SessionManagerBuilder {
        SessionManagerBuilder::new(config, scheduler)
    }

    /// Build a manager with the default notifier and id provider.
    pub fn new<F>(
        config: SessionConfig,
        scheduler: Arc<dyn Scheduler>,
        build_repository: F,
    ) -> Result<Arc<Self>>
    where
        F: FnOnce(RepositoryContext) -> Result<Arc<dyn SessionRepository>>,
    {
        SessionManagerBuilder::new(config, scheduler).build(build_repository)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    pub fn repository(&self) -> &Arc<dyn SessionRepository> {
        &self.ctx.repository
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Resolve the session for a request.
    ///
    /// `requested_id` is the id extracted from the request, if any. A live
    /// session with that id is returned; an expired one is deleted. When
    /// nothing usable is found and `create_if_absent` is set, a new session
    /// is created under a fresh id.
    pub fn get_session(
        &self,
        requested_id: Option<&str>,
        create_if_absent: bool,
    ) -> Result<Option<SessionFacade>> {
        self.ensure_open()?;
        let now = now_millis();

        if let Some(id) = requested_id {
            match self.ctx.repository.get(id)? {
                Some(data) if data.is_expired(now) => {
                    debug!(session_id = %id, "Requested session has expired");
                    self.ctx.counters.expired.fetch_add(1, Ordering::Relaxed);
                    SessionFacade::new(data, Arc::clone(&self.ctx)).do_invalidate(true)?;
                }
                Some(mut data) => {
                    self.check_owner(&mut data);
                    data.set_new(false);
                    data.set_last_accessed_time(now);
                    self.ctx.counters.retrieved.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(SessionFacade::new(data, Arc::clone(&self.ctx))));
                }
                None => {
                    debug!(session_id = %id, "Requested session not found");
                    self.ctx.counters.missing.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if !create_if_absent {
            return Ok(None);
        }
        self.create_session(now).map(Some)
    }

    fn create_session(&self, now: i64) -> Result<SessionFacade> {
        let config = &self.ctx.config;
        let mut data = SessionData::new(self.id_provider.new_id(), now, config.max_inactive_interval)
            .with_mandatory_remote_keys(config.mandatory_remote_keys.clone());
        data.set_new(true);
        if config.sticky {
            data.set_previous_owner(Some(config.node_id.clone()));
        }

        self.ctx.repository.store(&data)?;
        self.ctx.notifier.session_created(&data);
        self.ctx.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %data.id(), "Session created");

        Ok(SessionFacade::new(data, Arc::clone(&self.ctx)))
    }

    /// In sticky mode, take ownership and count sessions that moved here.
    fn check_owner(&self, data: &mut SessionData) {
        let config = &self.ctx.config;
        if !config.sticky {
            return;
        }
        if let Some(owner) = data.previous_owner()
            && owner != config.node_id
        {
            warn!(
                session_id = %data.id(),
                previous_owner = %owner,
                node = %config.node_id,
                "Session failed over from another node"
            );
            self.ctx.counters.failovers.fetch_add(1, Ordering::Relaxed);
        }
        data.set_previous_owner(Some(config.node_id.clone()));
    }

    /// Destroy a session by id. Unknown ids are ignored.
    pub fn delete(&self, id: &str, expired: bool) -> Result<()> {
        let Some(data) = self.ctx.repository.get(id)? else {
            debug!(session_id = %id, "Session to delete not found");
            return Ok(());
        };
        let session = SessionFacade::new(data, Arc::clone(&self.ctx));
        session.do_invalidate(expired)?;
        if session.state() == SessionState::Invalid {
            self.ctx.counters.deleted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Destroy a session by id on the scheduler.
    pub fn delete_async(self: &Arc<Self>, id: &str, expired: bool) {
        let manager = Arc::downgrade(self);
        let id = id.to_string();
        self.scheduler.submit(
            DELETE_TASK,
            Box::new(move |_token| {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                if let Err(e) = manager.delete(&id, expired) {
                    warn!(session_id = %id, error = %e, "Background session delete failed");
                }
            }),
        );
    }

    /// Record that a destroy attempt lost the ownership claim.
    pub fn invalidation_conflict(&self, session: &SessionData, expiry: bool) {
        self.ctx.invalidation_conflict(session, expiry);
    }

    /// Rotate the session to a fresh id. Returns the new id.
    pub fn switch_session_id(&self, session: &SessionFacade) -> Result<String> {
        self.ensure_open()?;
        session.ensure_valid()?;
        let new_id = self.id_provider.new_id();

        let mut data = session.shared().data.write();
        data.set_new_id(new_id.clone());
        if let Err(e) = self.ctx.repository.session_id_change(&data) {
            data.clear_new_id();
            return Err(e);
        }
        let old_id = data.swap_id().unwrap_or_default();

        self.ctx.notifier.session_id_changed(&data, &old_id);
        self.ctx.counters.id_changes.fetch_add(1, Ordering::Relaxed);
        info!(old_id = %old_id, session_id = %new_id, "Session id changed");
        Ok(new_id)
    }

    /// Commit the façades used by a finished request.
    ///
    /// Only the first façade of each session to lock commits, unless
    /// `commit_on_all_concurrent` is set. Every façade is attempted; the
    /// first error is returned.
    pub fn request_finished(&self, sessions: &[&SessionFacade]) -> Result<()> {
        let commit_all = self.ctx.config.commit_on_all_concurrent;
        let mut first_error = None;

        for session in sessions {
            if !commit_all && !session.check_used_and_lock() {
                debug!(session_id = %session.id(), "Concurrent façade already committing");
                continue;
            }
            if let Err(e) = session.commit() {
                warn!(session_id = %session.id(), error = %e, "Session commit failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> ManagerStats {
        let c = &self.ctx.counters;
        ManagerStats {
            created: c.created.load(Ordering::Relaxed),
            retrieved: c.retrieved.load(Ordering::Relaxed),
            missing: c.missing.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            deleted: c.deleted.load(Ordering::Relaxed),
            invalidation_conflicts: c.conflicts.load(Ordering::Relaxed),
            failovers: c.failovers.load(Ordering::Relaxed),
            commits: c.commits.load(Ordering::Relaxed),
            id_changes: c.id_changes.load(Ordering::Relaxed),
        }
    }

    /// Stop background work and close the repository. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ctx.repository.close();
        info!(namespace = %self.ctx.config.namespace, "Session manager closed");
    }
}
