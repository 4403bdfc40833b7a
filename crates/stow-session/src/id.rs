//! Session id generation.

/// Source of fresh session ids.
///
/// Extracting and propagating ids (cookies, URLs) is the caller's concern;
/// the manager only needs new ones.
pub trait SessionIdProvider: Send + Sync {
    fn new_id(&self) -> String;
}

/// Random UUIDv4 ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdProvider;

impl SessionIdProvider for UuidIdProvider {
    fn new_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

/// Deterministic ids `<prefix>1`, `<prefix>2`, ... for tests.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default)]
pub struct SequentialIdProvider {
    prefix: String,
    next: std::sync::atomic::AtomicU64,
}

#[cfg(any(test, feature = "testing"))]
impl SequentialIdProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: std::sync::atomic::AtomicU64::new(1),
        }
    }
}

#[cfg(any(test, feature = "testing"))]
impl SessionIdProvider for SequentialIdProvider {
    fn new_id(&self) -> String {
        let n = self
            .next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!("{}{}", self.prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_brace_free() {
        let provider = UuidIdProvider;
        let a = provider.new_id();
        let b = provider.new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(!a.contains('{') && !a.contains('}'));
    }

    #[test]
    fn test_sequential_ids() {
        let provider = SequentialIdProvider::new("s");
        assert_eq!(provider.new_id(), "s1");
        assert_eq!(provider.new_id(), "s2");
    }
}
