//! Error taxonomy for the memory engine
//!
//! Every failure surfaced by the public API is one of the kinds below. Kinds
//! carry a stable machine-readable code and map onto process exit codes for
//! CLI bindings.

use std::fmt;

/// Engine error kinds.
#[derive(Debug)]
pub enum MemoryError {
    /// Input failed validation (empty principal, bad importance, unknown
    /// config key, malformed filter).
    InvalidArgument { field: String, reason: String },

    /// The referenced memory or session does not exist.
    NotFound(String),

    /// The referenced entity belongs to a different user.
    Forbidden(String),

    /// A request id was replayed within the dedup window with a different
    /// payload.
    Conflict(String),

    /// Content or metadata exceeds its size bound.
    TooLarge {
        what: String,
        size: usize,
        max: usize,
    },

    /// A stored frame failed magic/version/CRC checks or could not be
    /// decoded. Isolated to the offending record; scans continue past it.
    CorruptRecord(String),

    /// Persistence failure. Fatal for the call (after the retry policy),
    /// recoverable for the process.
    Io(String),

    /// The per-call deadline elapsed before the operation produced a durable
    /// effect.
    Timeout(String),

    /// The session exists but holds no memories to summarize.
    SessionEmpty(String),

    /// A bug. The process must remain resumable from disk after one of these.
    Internal(anyhow::Error),
}

impl MemoryError {
    /// Stable machine-readable code for client dispatch.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::TooLarge { .. } => "TOO_LARGE",
            Self::CorruptRecord(_) => "CORRUPT_RECORD",
            Self::Io(_) => "IO",
            Self::Timeout(_) => "TIMEOUT",
            Self::SessionEmpty(_) => "SESSION_EMPTY",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Process exit code for CLI bindings: 0 success, 2 invalid argument,
    /// 3 not found, 4 conflict/forbidden, 5 I/O, 6 timeout, 1 other.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgument { .. } | Self::TooLarge { .. } => 2,
            Self::NotFound(_) | Self::SessionEmpty(_) => 3,
            Self::Conflict(_) | Self::Forbidden(_) => 4,
            Self::Io(_) | Self::CorruptRecord(_) => 5,
            Self::Timeout(_) => 6,
            Self::Internal(_) => 1,
        }
    }

    /// True for persistence failures eligible for the backoff retry.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Detailed human-readable message.
    pub fn message(&self) -> String {
        match self {
            Self::InvalidArgument { field, reason } => {
                format!("invalid input for '{field}': {reason}")
            }
            Self::NotFound(what) => format!("not found: {what}"),
            Self::Forbidden(what) => format!("forbidden: {what}"),
            Self::Conflict(what) => format!("conflict: {what}"),
            Self::TooLarge { what, size, max } => {
                format!("{what} too large: {size} bytes (max {max})")
            }
            Self::CorruptRecord(detail) => format!("corrupt record: {detail}"),
            Self::Io(detail) => format!("I/O failure: {detail}"),
            Self::Timeout(op) => format!("deadline exceeded during {op}"),
            Self::SessionEmpty(id) => format!("session {id} has no memories"),
            Self::Internal(err) => format!("internal error: {err:#}"),
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for MemoryError {}

impl From<std::io::Error> for MemoryError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<anyhow::Error> for MemoryError {
    fn from(err: anyhow::Error) -> Self {
        // Preserve the kind when an anyhow chain wraps one of ours.
        match err.downcast::<MemoryError>() {
            Ok(inner) => inner,
            Err(err) => match err.downcast::<std::io::Error>() {
                Ok(io) => Self::Io(io.to_string()),
                Err(err) => Self::Internal(err),
            },
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            MemoryError::invalid("user_id", "empty").code(),
            "INVALID_ARGUMENT"
        );
        assert_eq!(
            MemoryError::NotFound("memory x".into()).code(),
            "NOT_FOUND"
        );
        assert_eq!(
            MemoryError::CorruptRecord("bad crc".into()).code(),
            "CORRUPT_RECORD"
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MemoryError::invalid("f", "r").exit_code(), 2);
        assert_eq!(MemoryError::NotFound("x".into()).exit_code(), 3);
        assert_eq!(MemoryError::Forbidden("x".into()).exit_code(), 4);
        assert_eq!(MemoryError::Io("disk".into()).exit_code(), 5);
        assert_eq!(MemoryError::Timeout("save".into()).exit_code(), 6);
        assert_eq!(
            MemoryError::Internal(anyhow::anyhow!("bug")).exit_code(),
            1
        );
    }

    #[test]
    fn test_anyhow_roundtrip_preserves_kind() {
        let err: anyhow::Error = MemoryError::Forbidden("session s1".into()).into();
        let back: MemoryError = err.into();
        assert_eq!(back.code(), "FORBIDDEN");
    }
}
