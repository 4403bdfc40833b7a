//! Remote session repository for stow.
//!
//! Sessions live in a shared key-value backend so that any node of a
//! cluster can serve any request. The backend is reached through the
//! [`ValueStore`] facade, which a deployment implements over its client of
//! choice. The `testing` feature adds `MemoryStore`, an in-process test
//! double with native key expiry and pattern subscriptions.
//!
//! Expired sessions are found by one of two engines, selected by
//! [`stow_config::ExpirationMode`]:
//! - [`NotificationExpiration`] listens for the backend's key-expiry events
//! - [`SortedSetExpiration`] polls a score-ordered index
//!
//! # Example
//!
//! ```rust,ignore
//! use stow_config::{RemoteConfig, SessionConfig};
//! use stow_redis::RemoteRepository;
//! use stow_session::{SessionManager, TokioScheduler};
//!
//! let store: Arc<dyn ValueStore> = Arc::new(client);
//! let config = SessionConfig::new().with_remote(RemoteConfig::new());
//! let manager = SessionManager::builder(config, scheduler)
//!     .build(RemoteRepository::factory(store))?;
//! ```

mod encoding;
mod expiration;
mod keys;
#[cfg(any(test, feature = "testing"))]
mod memory;
mod repository;
mod store;

pub use encoding::{
    CREATION_TIME, DecodeError, INVALID_SESSION, LAST_ACCESSED, MAX_INACTIVE_INTERVAL, OWNER,
    RESERVED_PREFIX, Timing, decode_timing, encode_timing,
};
pub use expiration::{
    BACKOFF_LADDER_MS, BUCKET_SWEEP_PERIOD, BUCKET_SWEEP_TASK, Backoff, CLEANUP_TASK,
    EXPIRED_EVENT_PATTERN, ExpirationStrategy, NEVER_EXPIRES_SCORE, NotificationExpiration,
    SAFETY_MARGIN, SUBSCRIBER_TASK, Sleeper, SortedSetExpiration, StrategyContext,
    build_strategy, cleanup_period,
};
pub use keys::{KeyLayout, is_valid_id, round_down_minute};
#[cfg(any(test, feature = "testing"))]
pub use memory::{EXPIRED_CHANNEL, MemoryStore};
pub use repository::RemoteRepository;
pub use store::{MessageListener, StoreError, StoreResult, TxCommand, ValueStore};
