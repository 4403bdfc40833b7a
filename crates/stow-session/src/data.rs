//! Session identity and timing record.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Identity and timing record persisted by a repository.
///
/// Equality and hashing only consider `id` and `creation_time`. Timing
/// changes never affect equality, so it must not be used to detect
/// freshness.
#[derive(Debug, Clone)]
pub struct SessionData {
    id: String,
    new_id: Option<String>,
    creation_time: i64,
    last_accessed_time: i64,
    max_inactive_interval: i32,
    is_new: bool,
    previous_owner: Option<String>,
    mandatory_remote_keys: BTreeSet<String>,
}

impl SessionData {
    /// Create a record whose last access is its creation.
    pub fn new(id: impl Into<String>, creation_time: i64, max_inactive_interval: i32) -> Self {
        Self::restored(id, creation_time, creation_time, max_inactive_interval)
    }

    /// Rebuild a record read back from a repository.
    pub fn restored(
        id: impl Into<String>,
        creation_time: i64,
        last_accessed_time: i64,
        max_inactive_interval: i32,
    ) -> Self {
        Self {
            id: id.into(),
            new_id: None,
            creation_time,
            last_accessed_time,
            max_inactive_interval,
            is_new: false,
            previous_owner: None,
            mandatory_remote_keys: BTreeSet::new(),
        }
    }

    pub fn with_mandatory_remote_keys(mut self, keys: BTreeSet<String>) -> Self {
        self.mandatory_remote_keys = keys;
        self
    }

    pub fn with_previous_owner(mut self, owner: Option<String>) -> Self {
        self.previous_owner = owner;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pending id while a rotation is in flight.
    pub fn new_id(&self) -> Option<&str> {
        self.new_id.as_deref()
    }

    /// The id the session will carry once any pending rotation completes.
    pub fn effective_id(&self) -> &str {
        self.new_id.as_deref().unwrap_or(&self.id)
    }

    pub fn creation_time(&self) -> i64 {
        self.creation_time
    }

    pub fn last_accessed_time(&self) -> i64 {
        self.last_accessed_time
    }

    pub fn max_inactive_interval(&self) -> i32 {
        self.max_inactive_interval
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn previous_owner(&self) -> Option<&str> {
        self.previous_owner.as_deref()
    }

    pub fn mandatory_remote_keys(&self) -> &BTreeSet<String> {
        &self.mandatory_remote_keys
    }

    pub fn is_mandatory_remote(&self, name: &str) -> bool {
        self.mandatory_remote_keys.contains(name)
    }

    pub fn set_last_accessed_time(&mut self, millis: i64) {
        self.last_accessed_time = millis;
    }

    pub fn set_max_inactive_interval(&mut self, secs: i32) {
        self.max_inactive_interval = secs;
    }

    pub fn set_new(&mut self, is_new: bool) {
        self.is_new = is_new;
    }

    pub fn set_previous_owner(&mut self, owner: Option<String>) {
        self.previous_owner = owner;
    }

    /// Record the id the session is being rotated to.
    pub fn set_new_id(&mut self, id: impl Into<String>) {
        self.new_id = Some(id.into());
    }

    /// Abandon a pending rotation.
    pub fn clear_new_id(&mut self) {
        self.new_id = None;
    }

    /// Complete a pending rotation. Returns the replaced id.
    pub fn swap_id(&mut self) -> Option<String> {
        let new_id = self.new_id.take()?;
        Some(std::mem::replace(&mut self.id, new_id))
    }

    /// Whether the session never expires on inactivity.
    pub fn never_expires(&self) -> bool {
        self.max_inactive_interval <= 0
    }

    /// Epoch millisecond at which the session expires, if it can.
    pub fn expires_at(&self) -> Option<i64> {
        if self.never_expires() {
            None
        } else {
            Some(self.last_accessed_time + i64::from(self.max_inactive_interval) * 1000)
        }
    }

    /// Whether the session has been inactive longer than allowed at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        self.max_inactive_interval > 0
            && (now - self.last_accessed_time) > i64::from(self.max_inactive_interval) * 1000
    }
}

impl PartialEq for SessionData {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.creation_time == other.creation_time
    }
}

impl Eq for SessionData {}

impl Hash for SessionData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.creation_time.hash(state);
    }
}
