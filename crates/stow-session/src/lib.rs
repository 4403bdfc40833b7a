//! Session lifecycle engine.
//!
//! This crate provides the backend-independent half of stow:
//! - [`SessionManager`] resolves, creates, rotates and deletes sessions
//! - [`SessionFacade`] caches attributes per use and commits the diff in one
//!   transaction
//! - [`SessionRepository`] is the storage seam; [`InMemoryRepository`] is the
//!   process-local implementation
//! - [`Scheduler`] runs background work; [`TokioScheduler`] backs it with tokio
//!
//! # Example
//!
//! ```rust,ignore
//! use stow_session::{SessionManager, TokioScheduler};
//! use stow_config::SessionConfig;
//!
//! let scheduler = Arc::new(TokioScheduler::try_current().unwrap());
//! let manager = SessionManager::builder(SessionConfig::new(), scheduler)
//!     .build_in_memory()?;
//!
//! let session = manager.get_session(None, true)?.unwrap();
//! session.set_attribute("user", "alice")?;
//! manager.request_finished(&[&session])?;
//! ```

mod attribute;
mod data;
mod error;
mod facade;
mod id;
mod manager;
mod memory;
mod notifier;
mod repository;
mod scheduler;

pub use attribute::{AttributeValue, is_immutable};
pub use data::{SessionData, now_millis};
pub use error::{Error, Result};
pub use facade::{SessionFacade, SessionState};
pub use id::{SessionIdProvider, UuidIdProvider};
pub use manager::{DELETE_TASK, ManagerStats, SessionManager, SessionManagerBuilder};
pub use memory::{CLEANUP_TASK, InMemoryRepository};
pub use notifier::{NoopNotifier, SessionNotifier, TracingNotifier};
pub use repository::{CommitTransaction, RepositoryContext, SessionDeleter, SessionRepository};
pub use scheduler::{OneShotTask, PeriodicTask, Scheduler, TaskHandle, TokioScheduler};

#[cfg(any(test, feature = "testing"))]
pub use id::SequentialIdProvider;
#[cfg(any(test, feature = "testing"))]
pub use notifier::{NotifierEvent, RecordingNotifier};
#[cfg(any(test, feature = "testing"))]
pub use scheduler::ManualScheduler;
