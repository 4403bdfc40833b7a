//! Eviction engines for the remote repository.
//!
//! The backend only expires keys natively; something has to notice that a
//! session went idle and destroy it through the manager so listeners fire.
//! Two engines do this:
//! - [`NotificationExpiration`] reacts to the backend's key-expiry events
//! - [`SortedSetExpiration`] polls a score-ordered index
//!
//! Either way the session hash itself carries a TTL padded by
//! [`SAFETY_MARGIN`], so a session nobody deleted still disappears.

mod notification;
mod sorted_set;

pub use notification::{
    BACKOFF_LADDER_MS, BUCKET_SWEEP_PERIOD, BUCKET_SWEEP_TASK, Backoff, EXPIRED_EVENT_PATTERN,
    NotificationExpiration, SUBSCRIBER_TASK, Sleeper,
};
pub use sorted_set::{CLEANUP_TASK, NEVER_EXPIRES_SCORE, SortedSetExpiration, cleanup_period};

use std::sync::Arc;
use std::time::Duration;

use stow_config::ExpirationMode;
use stow_session::{RepositoryContext, Result, Scheduler, SessionData, SessionDeleter};
use tracing::trace;

use crate::keys::KeyLayout;
use crate::store::ValueStore;

/// Extra lifetime given to session hashes beyond their inactivity timeout.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(300);

/// Keeps the remote store free of idle sessions.
pub trait ExpirationStrategy: Send + Sync {
    /// The session was stored; renew its expiry bookkeeping.
    fn session_touched(&self, session: &SessionData) -> Result<()>;

    /// The session was removed; drop its bookkeeping. `session` carries the
    /// timing last stored, not an unstored access.
    fn session_deleted(&self, session: &SessionData) -> Result<()>;

    /// Move bookkeeping from `session.id()` to its pending new id. Timing is
    /// the stored one, as for [`session_deleted`](Self::session_deleted).
    fn session_id_change(&self, session: &SessionData) -> Result<()>;

    /// Start the background work that finds expired sessions.
    fn start_expired_sessions_task(&self) -> Result<()>;

    /// The default inactivity timeout changed.
    fn configuration_changed(&self, _max_inactive_interval: i32) {}

    /// Whether the backend must publish key-expiry events.
    fn requires_expiry_notifications(&self) -> bool {
        false
    }

    /// Cancel background work. Idempotent.
    fn close(&self);
}

/// Collaborators shared by a strategy and its background tasks.
#[derive(Clone)]
pub struct StrategyContext {
    pub store: Arc<dyn ValueStore>,
    pub keys: KeyLayout,
    pub scheduler: Arc<dyn Scheduler>,
    pub deleter: Arc<dyn SessionDeleter>,
}

impl StrategyContext {
    pub fn new(repository: &RepositoryContext, store: Arc<dyn ValueStore>, keys: KeyLayout) -> Self {
        Self {
            store,
            keys,
            scheduler: Arc::clone(&repository.scheduler),
            deleter: Arc::clone(&repository.deleter),
        }
    }

    /// Give the session hash a TTL of its timeout plus the safety margin, or
    /// none for sessions that never expire.
    pub(crate) fn renew_session_ttl(&self, session: &SessionData) -> Result<()> {
        let key = self.keys.session_key(session.id());
        if session.never_expires() {
            self.store.persist(&key)?;
        } else {
            let ttl = interval(session) + SAFETY_MARGIN;
            trace!(session_id = %session.id(), ttl_secs = ttl.as_secs(), "Renewing session TTL");
            self.store.expire(&key, ttl)?;
        }
        Ok(())
    }
}

/// Inactivity timeout of a session as a duration. Zero for non-expiring ones.
pub(crate) fn interval(session: &SessionData) -> Duration {
    Duration::from_secs(u64::try_from(session.max_inactive_interval()).unwrap_or(0))
}

/// Build the strategy selected by configuration.
pub fn build_strategy(
    mode: ExpirationMode,
    ctx: StrategyContext,
    max_inactive_interval: i32,
) -> Box<dyn ExpirationStrategy> {
    match mode {
        ExpirationMode::Notification => Box::new(NotificationExpiration::new(ctx)),
        ExpirationMode::SortedSet => Box::new(SortedSetExpiration::new(ctx, max_inactive_interval)),
    }
}
