//! Attribute values.

/// Value stored under a session attribute name.
///
/// Values are JSON documents so they can be persisted by any repository.
pub type AttributeValue = serde_json::Value;

/// Whether a value belongs to the immutable allowlist.
///
/// Strings, numbers, booleans and null cannot be mutated behind the
/// session's back, so reading them never needs re-persisting. Arrays and
/// objects can.
pub fn is_immutable(value: &AttributeValue) -> bool {
    !matches!(value, AttributeValue::Array(_) | AttributeValue::Object(_))
}
