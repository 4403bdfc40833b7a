//! Narrow facade over the remote key-value backend.
//!
//! The session engine never talks to a wire client directly. Whatever client
//! is deployed (single node, cluster, sentinel) is wrapped in a
//! [`ValueStore`]; topology selection is the wrapper's concern.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Errors reported by a [`ValueStore`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Wrong value type at key {0}")]
    WrongType(String),

    #[error("No such key: {0}")]
    NoSuchKey(String),

    #[error("Store is closed")]
    Closed,
}

impl StoreError {
    /// Whether the failure may go away on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

impl From<StoreError> for stow_session::Error {
    fn from(e: StoreError) -> Self {
        stow_session::Error::backend(e.to_string(), e.is_transient())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One hash command inside a keyed transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TxCommand {
    HSet { field: String, value: Vec<u8> },
    HMSet(Vec<(String, Vec<u8>)>),
    HDel(Vec<String>),
}

/// Receiver for pattern subscription messages.
pub trait MessageListener: Send + Sync {
    /// The subscription is established.
    fn on_subscribed(&self, _pattern: &str) {}

    fn on_message(&self, channel: &str, message: &str);
}

/// Blocking key-value operations used by the remote repository.
///
/// Every call may block on the network. Values are raw bytes; members of
/// sets and sorted sets are UTF-8 strings.
pub trait ValueStore: Send + Sync {
    // ── Strings ─────────────────────────────────────────────────────

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    // ── Hashes ──────────────────────────────────────────────────────

    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Vec<u8>>>;

    fn hset(&self, key: &str, field: &str, value: &[u8]) -> StoreResult<()>;

    /// Set a field only if it is absent. Returns whether it was set.
    fn hsetnx(&self, key: &str, field: &str, value: &[u8]) -> StoreResult<bool>;

    /// Values of `fields`, in order.
    fn hmget(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<Vec<u8>>>>;

    fn hmset(&self, key: &str, fields: &[(String, Vec<u8>)]) -> StoreResult<()>;

    /// Returns how many fields were removed.
    fn hdel(&self, key: &str, fields: &[&str]) -> StoreResult<usize>;

    fn hkeys(&self, key: &str) -> StoreResult<Vec<String>>;

    // ── Sets ────────────────────────────────────────────────────────

    fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;

    fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;

    fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Remove and return an arbitrary member.
    fn spop(&self, key: &str) -> StoreResult<Option<String>>;

    // ── Sorted sets ─────────────────────────────────────────────────

    /// Add or re-score a member. Returns whether it was added.
    fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool>;

    /// Returns how many members were removed (0 or 1).
    fn zrem(&self, key: &str, member: &str) -> StoreResult<usize>;

    /// Members with `min <= score <= max`, lowest score first.
    fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>>;

    /// Members by rank; negative indexes count from the end.
    fn zrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;

    // ── Keys ────────────────────────────────────────────────────────

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Expire at an absolute epoch millisecond.
    fn expire_at(&self, key: &str, at_millis: i64) -> StoreResult<bool>;

    /// Remove any TTL from the key.
    fn persist(&self, key: &str) -> StoreResult<bool>;

    /// Fails with [`StoreError::NoSuchKey`] when `from` does not exist.
    fn rename(&self, from: &str, to: &str) -> StoreResult<()>;

    fn del(&self, key: &str) -> StoreResult<bool>;

    fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Apply hash commands to one key atomically.
    fn transaction(&self, key: &str, commands: Vec<TxCommand>) -> StoreResult<()>;

    // ── Pub/sub ─────────────────────────────────────────────────────

    /// Subscribe to channels matching `pattern` and deliver messages to
    /// `listener`. Blocks until `cancel` fires (`Ok`) or the subscription
    /// fails (`Err`).
    fn psubscribe(
        &self,
        pattern: &str,
        listener: &dyn MessageListener,
        cancel: &CancellationToken,
    ) -> StoreResult<()>;

    /// Returns how many subscribers received the message.
    fn publish(&self, channel: &str, message: &str) -> StoreResult<usize>;

    /// Turn on native key-expiry events.
    fn enable_expiry_notifications(&self) -> StoreResult<()> {
        Ok(())
    }

    fn close(&self);

    /// Whether `err` may succeed on retry.
    fn is_transient_failure(&self, err: &StoreError) -> bool {
        err.is_transient()
    }
}
