//! Repository abstraction over session storage backends.
//!
//! A [`SessionRepository`] persists [`SessionData`] and its attributes.
//! Attribute changes made through a façade reach the repository in one
//! [`CommitTransaction`].

use std::collections::BTreeSet;
use std::sync::Arc;

use stow_config::SessionConfig;

use crate::attribute::AttributeValue;
use crate::data::SessionData;
use crate::error::Result;
use crate::scheduler::Scheduler;

/// Storage backend for sessions.
///
/// Calls for different session ids may run concurrently from any thread.
/// Concurrent calls for the same id are last-write-wins per attribute.
/// Every call is blocking.
pub trait SessionRepository: Send + Sync {
    /// Load a session. `Ok(None)` when it does not exist or is being removed.
    fn get(&self, id: &str) -> Result<Option<SessionData>>;

    /// Persist the timing fields of a session.
    fn store(&self, session: &SessionData) -> Result<()>;

    fn get_attribute(&self, session: &SessionData, name: &str) -> Result<Option<AttributeValue>>;

    /// Write one attribute immediately, outside any transaction.
    fn set_attribute(&self, session: &SessionData, name: &str, value: &AttributeValue)
    -> Result<()>;

    fn remove_attribute(&self, session: &SessionData, name: &str) -> Result<()>;

    /// Names of all attributes stored for the session.
    fn get_all_keys(&self, session: &SessionData) -> Result<BTreeSet<String>>;

    /// Delete the session and all of its attributes.
    fn remove(&self, session: &SessionData) -> Result<()>;

    /// Claim ownership of the session's destruction.
    ///
    /// Returns `false` when another actor already claimed it; the caller must
    /// then not destroy the session.
    fn prepare_remove(&self, session: &SessionData) -> Result<bool>;

    /// Begin collecting attribute changes for one commit.
    fn start_commit(&self, session: &SessionData) -> Result<Box<dyn CommitTransaction + '_>>;

    /// Move the session from `session.id()` to its pending `new_id`.
    fn session_id_change(&self, session: &SessionData) -> Result<()>;

    /// Ids of sessions held by this node.
    fn owned_session_ids(&self) -> Result<Vec<String>>;

    /// Start background work (expiry scans, subscriptions).
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Stop background work and release the backend.
    fn close(&self);

    /// Whether sessions are visible to other nodes.
    fn is_distributed(&self) -> bool;
}

/// Attribute changes for one session, applied together by [`commit`].
///
/// [`commit`]: CommitTransaction::commit
pub trait CommitTransaction {
    fn add_attribute(&mut self, name: &str, value: &AttributeValue);

    fn remove_attribute(&mut self, name: &str);

    /// Apply the collected changes and persist the session's timing fields.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Whether the changes become visible to other nodes.
    fn is_distributing(&self) -> bool;

    /// Whether the repository needs every attribute, not just the changed ones.
    fn is_set_all_attributes(&self) -> bool;
}

/// Callback used by repositories and expiration strategies to delete
/// sessions through the manager that owns them.
pub trait SessionDeleter: Send + Sync {
    fn delete(&self, id: &str, expired: bool) -> Result<()>;

    /// Schedule [`delete`](SessionDeleter::delete) in the background.
    fn delete_async(&self, id: &str, expired: bool);
}

/// Collaborators handed to a repository when it is built.
#[derive(Clone)]
pub struct RepositoryContext {
    pub config: Arc<SessionConfig>,
    pub scheduler: Arc<dyn Scheduler>,
    pub deleter: Arc<dyn SessionDeleter>,
}

impl RepositoryContext {
    /// Namespaced key for a session id.
    pub fn namespaced(&self, id: &str) -> String {
        format!("{}:{}", self.config.namespace, id)
    }
}
