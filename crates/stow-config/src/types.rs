//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! namespace = "shop"
//! max_inactive_interval = 1800
//! replication_trigger = "set_and_non_primitive_get"
//! mandatory_remote_keys = ["cart"]
//!
//! [in_memory]
//! cleanup_interval_secs = 60
//!
//! [remote]
//! mode = "cluster"
//! addresses = ["10.0.0.1:6379", "10.0.0.2:6379"]
//! expiration = "sorted_set"
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Default session inactivity timeout in seconds (30 minutes).
pub const DEFAULT_MAX_INACTIVE_INTERVAL: i32 = 1800;

/// Default namespace when none is configured.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default prefix prepended to every remote key.
pub const DEFAULT_KEY_PREFIX: &str = "stow:";

// ─────────────────────────────────────────────────────────────────────────────
// Session Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration for a session manager and its repository.
///
/// The value is immutable once built; components receive it as an
/// `Arc<SessionConfig>` at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Namespace isolating sessions of one application from another.
    pub namespace: String,

    /// Default inactivity timeout for new sessions, in seconds.
    /// `0` means sessions never expire.
    pub max_inactive_interval: i32,

    /// Whether a plain read of a mutable attribute counts as a write.
    pub replication_trigger: ReplicationTrigger,

    /// Commit every concurrent façade instead of only the first one to lock.
    pub commit_on_all_concurrent: bool,

    /// Track the owning node so failover can be detected.
    pub sticky: bool,

    /// Identifier of this node, written as the owner marker in sticky mode.
    pub node_id: String,

    /// Attribute names that are never cached locally.
    pub mandatory_remote_keys: BTreeSet<String>,

    /// In-process repository settings.
    pub in_memory: InMemoryConfig,

    /// Remote repository settings. `None` selects the in-process repository.
    pub remote: Option<RemoteConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_inactive_interval: DEFAULT_MAX_INACTIVE_INTERVAL,
            replication_trigger: ReplicationTrigger::default(),
            commit_on_all_concurrent: false,
            sticky: false,
            node_id: default_node_id(),
            mandatory_remote_keys: BTreeSet::new(),
            in_memory: InMemoryConfig::default(),
            remote: None,
        }
    }
}

impl SessionConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: SessionConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(ConfigError::MissingField {
                field: "namespace".to_string(),
                context: "session config".to_string(),
            });
        }
        if self.in_memory.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "in_memory.cleanup_interval_secs must be positive".to_string(),
            ));
        }
        if let Some(remote) = &self.remote {
            remote.resolve_target()?;
        }
        Ok(())
    }

    /// Whether the configured backend shares sessions across nodes.
    pub fn is_distributed(&self) -> bool {
        self.remote.is_some()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_max_inactive_interval(mut self, secs: i32) -> Self {
        self.max_inactive_interval = secs;
        self
    }

    pub fn with_replication_trigger(mut self, trigger: ReplicationTrigger) -> Self {
        self.replication_trigger = trigger;
        self
    }

    pub fn with_commit_on_all_concurrent(mut self, enabled: bool) -> Self {
        self.commit_on_all_concurrent = enabled;
        self
    }

    /// Enable sticky-session tracking under the given node identifier.
    pub fn with_sticky(mut self, node_id: impl Into<String>) -> Self {
        self.sticky = true;
        self.node_id = node_id.into();
        self
    }

    pub fn with_mandatory_remote_key(mut self, name: impl Into<String>) -> Self {
        self.mandatory_remote_keys.insert(name.into());
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.in_memory.cleanup_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = Some(remote);
        self
    }
}

fn default_node_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Policy deciding whether reading an attribute marks it for re-persistence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationTrigger {
    /// Only explicit sets are replicated.
    #[default]
    Set,
    /// Sets, plus reads of values that are not immutable scalars.
    SetAndNonPrimitiveGet,
}

/// Settings for the process-local repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryConfig {
    /// Seconds between full expiry scans.
    pub cleanup_interval_secs: u64,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 60,
        }
    }
}

impl InMemoryConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Remote Backend Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Settings for the remote key-value repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Topology of the backend.
    pub mode: ClusterMode,

    /// Backend addresses as `host:port` (`[v6]:port` for IPv6).
    pub addresses: Vec<String>,

    /// Master name, required for sentinel mode.
    pub master_name: Option<String>,

    /// Prefix prepended to every key.
    pub key_prefix: String,

    /// Which eviction engine keeps remote sessions bounded.
    pub expiration: ExpirationMode,

    /// Per-command timeout in milliseconds.
    pub timeout_ms: u64,

    /// Connection pool size handed to the client.
    pub pool_size: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            mode: ClusterMode::Single,
            addresses: vec!["localhost:6379".to_string()],
            master_name: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            expiration: ExpirationMode::Notification,
            timeout_ms: 2000,
            pool_size: 100,
        }
    }
}

impl RemoteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: ClusterMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_master_name(mut self, name: impl Into<String>) -> Self {
        self.master_name = Some(name.into());
        self
    }

    pub fn with_expiration(mut self, expiration: ExpirationMode) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Resolve the configured topology into a connection target.
    ///
    /// Called once at startup; every error here is fatal.
    pub fn resolve_target(&self) -> Result<BackendTarget> {
        if self.addresses.is_empty() {
            return Err(ConfigError::MissingField {
                field: "addresses".to_string(),
                context: "remote config".to_string(),
            });
        }
        let addresses = self
            .addresses
            .iter()
            .map(|a| BackendAddress::parse(a))
            .collect::<Result<Vec<_>>>()?;

        match self.mode {
            ClusterMode::Single => {
                if addresses.len() != 1 {
                    return Err(ConfigError::Invalid(format!(
                        "single mode expects exactly one address, got {}",
                        addresses.len()
                    )));
                }
                Ok(BackendTarget::Single(addresses.into_iter().next().ok_or_else(
                    || ConfigError::Invalid("no address".to_string()),
                )?))
            }
            ClusterMode::Cluster => Ok(BackendTarget::Cluster(addresses)),
            ClusterMode::Sentinel => {
                let master_name = self.master_name.clone().ok_or_else(|| {
                    ConfigError::MissingField {
                        field: "master_name".to_string(),
                        context: "sentinel remote config".to_string(),
                    }
                })?;
                Ok(BackendTarget::Sentinel {
                    master_name,
                    sentinels: addresses,
                })
            }
        }
    }
}

/// Backend topology.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMode {
    #[default]
    Single,
    Cluster,
    Sentinel,
}

/// Eviction engine used by the remote repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpirationMode {
    /// React to the backend's native key-expiry events.
    #[default]
    Notification,
    /// Periodically scan a score-ordered index.
    SortedSet,
}

/// A parsed `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAddress {
    pub host: String,
    pub port: u16,
}

impl BackendAddress {
    pub fn parse(address: &str) -> Result<Self> {
        let invalid = |reason: &str| ConfigError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = address.trim();
        let (host, port) = if let Some(rest) = trimmed.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("unclosed '['"))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| invalid("missing port"))?;
            (host, port)
        } else {
            trimmed
                .rsplit_once(':')
                .ok_or_else(|| invalid("missing port"))?
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("port is not a number"))?;
        if port == 0 {
            return Err(invalid("port must be non-zero"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Connection target resolved from [`RemoteConfig`].
///
/// The client implementation matches on this once when it is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTarget {
    Single(BackendAddress),
    Cluster(Vec<BackendAddress>),
    Sentinel {
        master_name: String,
        sentinels: Vec<BackendAddress>,
    },
}
