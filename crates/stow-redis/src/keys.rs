//! Backend key layout.
//!
//! All keys of a namespace share the base `{key_prefix}{namespace}:`. Session
//! ids are wrapped in braces so a session's hash and its expiry marker hash
//! to the same cluster slot.
//!
//! | key | use |
//! |-----|-----|
//! | `<base>{<id>}` | session hash |
//! | `<base>expire:{<id>}` | expiry marker (notification strategy) |
//! | `<base>expirations:<minute-ms>` | expiry bucket (notification strategy) |
//! | `<base>all-sessions` | expiry index (sorted-set strategy) |

const MINUTE_MS: i64 = 60_000;

/// Round an epoch millisecond down to the start of its minute.
pub fn round_down_minute(millis: i64) -> i64 {
    millis - millis % MINUTE_MS
}

/// Whether `id` can be embedded in a key. Ids containing braces would break
/// the slot tag and are never looked up.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(['{', '}'])
}

/// Key builder for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    base: String,
    marker_base: String,
}

impl KeyLayout {
    pub fn new(key_prefix: &str, namespace: &str) -> Self {
        let base = format!("{key_prefix}{namespace}:");
        let marker_base = format!("{base}expire:");
        Self { base, marker_base }
    }

    pub fn session_key(&self, id: &str) -> String {
        format!("{}{{{id}}}", self.base)
    }

    pub fn marker_key(&self, id: &str) -> String {
        format!("{}{{{id}}}", self.marker_base)
    }

    /// Bucket for sessions expiring during the minute starting at `minute`.
    pub fn bucket_key(&self, minute: i64) -> String {
        format!("{}expirations:{minute}", self.base)
    }

    pub fn sorted_set_key(&self) -> String {
        format!("{}all-sessions", self.base)
    }

    /// Session id of an expiry marker key, if `key` is one of ours.
    pub fn id_from_marker<'k>(&self, key: &'k str) -> Option<&'k str> {
        key.strip_prefix(self.marker_base.as_str())
            .and_then(unwrap_tag)
    }

    /// Session id of a session hash key, if `key` is one of ours.
    pub fn id_from_session_key<'k>(&self, key: &'k str) -> Option<&'k str> {
        key.strip_prefix(self.base.as_str()).and_then(unwrap_tag)
    }
}

fn unwrap_tag(tagged: &str) -> Option<&str> {
    tagged
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|id| is_valid_id(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_round_down_minute() {
        assert_eq!(round_down_minute(1234), 0);
        assert_eq!(round_down_minute(62_000), 60_000);
        assert_eq!(round_down_minute(60_000), 60_000);
    }

    #[test]
    fn test_layout() {
        let keys = KeyLayout::new("stow:", "app");
        assert_eq!(keys.session_key("abc"), "stow:app:{abc}");
        assert_eq!(keys.marker_key("abc"), "stow:app:expire:{abc}");
        assert_eq!(keys.bucket_key(60_000), "stow:app:expirations:60000");
        assert_eq!(keys.sorted_set_key(), "stow:app:all-sessions");
    }

    #[test]
    fn test_id_extraction() {
        let keys = KeyLayout::new("stow:", "app");
        assert_eq!(keys.id_from_marker("stow:app:expire:{abc}"), Some("abc"));
        assert_eq!(keys.id_from_marker("stow:other:expire:{abc}"), None);
        assert_eq!(keys.id_from_marker("stow:app:{abc}"), None);
        assert_eq!(keys.id_from_session_key("stow:app:{abc}"), Some("abc"));
        assert_eq!(keys.id_from_session_key("stow:app:expire:{abc}"), None);
    }

    #[test]
    fn test_invalid_ids() {
        assert!(is_valid_id("abc"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("a{b"));
        assert!(!is_valid_id("a}b"));
    }

    proptest! {
        #[test]
        fn prop_round_down_minute(ms in 0i64..i64::MAX / 2) {
            let minute = round_down_minute(ms);
            prop_assert_eq!(minute % 60_000, 0);
            prop_assert!(minute <= ms && ms - minute < 60_000);
        }

        #[test]
        fn prop_marker_round_trip(id in "[a-zA-Z0-9_-]{1,40}") {
            let keys = KeyLayout::new("stow:", "ns");
            let marker = keys.marker_key(&id);
            prop_assert_eq!(keys.id_from_marker(&marker), Some(id.as_str()));
        }
    }
}
