//! Configuration for the stow session store.
//!
//! Provides TOML-based configuration with:
//! - Session defaults (namespace, inactivity timeout, replication trigger)
//! - Sticky-session and concurrent-commit flags
//! - Remote backend topology, resolved once into a [`BackendTarget`]
//!
//! The resulting [`SessionConfig`] is immutable and shared by every
//! component as an `Arc`.

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{CONFIG_ENV_VAR, load_config, load_config_file};
pub use error::{ConfigError, Result};
pub use types::*;
