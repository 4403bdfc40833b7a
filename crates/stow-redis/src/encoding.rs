//! Session hash field codec.
//!
//! Timing fields are fixed-width big-endian integers. This layout is read by
//! every node of a rolling upgrade, so field names, order and widths must
//! not change.

use stow_session::{AttributeValue, Error, SessionData};

pub const LAST_ACCESSED: &str = "#:lastAccessed";
pub const MAX_INACTIVE_INTERVAL: &str = "#:maxInactiveInterval";
pub const CREATION_TIME: &str = "#:creationTime";
pub const INVALID_SESSION: &str = "#:invalidSession";
pub const OWNER: &str = "#:owner";

/// Prefix reserved for repository metadata fields.
pub const RESERVED_PREFIX: &str = "#:";

/// Fields read by a session lookup, in `hmget` order.
pub const LOOKUP_FIELDS: [&str; 5] = [
    LAST_ACCESSED,
    MAX_INACTIVE_INTERVAL,
    CREATION_TIME,
    INVALID_SESSION,
    OWNER,
];

/// Value written to [`INVALID_SESSION`] by the removal claim.
pub const INVALID_FLAG: &[u8] = b"1";

/// A stored session record could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("field {field} is {actual} bytes, expected {expected}")]
    FieldWidth {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("field {0} is missing")]
    MissingField(&'static str),

    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::Decode(e.to_string())
    }
}

pub fn encode_i64(value: i64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

pub fn encode_i32(value: i32) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

pub fn decode_i64(field: &'static str, bytes: &[u8]) -> Result<i64, DecodeError> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| DecodeError::FieldWidth {
        field,
        expected: 8,
        actual: bytes.len(),
    })?;
    Ok(i64::from_be_bytes(array))
}

pub fn decode_i32(field: &'static str, bytes: &[u8]) -> Result<i32, DecodeError> {
    let array: [u8; 4] = bytes.try_into().map_err(|_| DecodeError::FieldWidth {
        field,
        expected: 4,
        actual: bytes.len(),
    })?;
    Ok(i32::from_be_bytes(array))
}

/// Timing fields of a session, in layout order.
pub fn encode_timing(session: &SessionData) -> Vec<(String, Vec<u8>)> {
    vec![
        (
            LAST_ACCESSED.to_string(),
            encode_i64(session.last_accessed_time()),
        ),
        (
            MAX_INACTIVE_INTERVAL.to_string(),
            encode_i32(session.max_inactive_interval()),
        ),
        (
            CREATION_TIME.to_string(),
            encode_i64(session.creation_time()),
        ),
    ]
}

/// Timing values decoded from a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub last_accessed: i64,
    pub max_inactive_interval: i32,
    pub creation_time: i64,
}

/// Decode the three timing fields.
///
/// All absent means the session does not exist (`Ok(None)`). Some present
/// and some absent, or any field of the wrong width, is corruption.
pub fn decode_timing(
    last_accessed: Option<&[u8]>,
    max_inactive_interval: Option<&[u8]>,
    creation_time: Option<&[u8]>,
) -> Result<Option<Timing>, DecodeError> {
    match (last_accessed, max_inactive_interval, creation_time) {
        (None, None, None) => Ok(None),
        (Some(la), Some(mii), Some(ct)) => Ok(Some(Timing {
            last_accessed: decode_i64(LAST_ACCESSED, la)?,
            max_inactive_interval: decode_i32(MAX_INACTIVE_INTERVAL, mii)?,
            creation_time: decode_i64(CREATION_TIME, ct)?,
        })),
        (None, _, _) => Err(DecodeError::MissingField(LAST_ACCESSED)),
        (_, None, _) => Err(DecodeError::MissingField(MAX_INACTIVE_INTERVAL)),
        (_, _, None) => Err(DecodeError::MissingField(CREATION_TIME)),
    }
}

pub fn decode_owner(bytes: &[u8]) -> Result<String, DecodeError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8(OWNER))
}

/// Reject attribute names that collide with metadata fields.
pub fn check_attribute_name(name: &str) -> Result<(), Error> {
    if name.starts_with(RESERVED_PREFIX) {
        return Err(Error::InvalidAttribute(format!(
            "'{name}' uses the reserved prefix '{RESERVED_PREFIX}'"
        )));
    }
    Ok(())
}

pub fn encode_attribute(value: &AttributeValue) -> Result<Vec<u8>, Error> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode_attribute(bytes: &[u8]) -> Result<AttributeValue, Error> {
    Ok(serde_json::from_slice(bytes)?)
}
