/// Domain error taxonomy. Every variant renders as a human-readable
/// message suitable for direct display to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input: bad date, name too long, bad email/phone format,
    /// duration out of bounds.
    Validation(String),
    /// Referenced entity does not exist.
    NotFound(&'static str),
    /// Overlapping interval, slot already booked, slot in use, or
    /// semester mismatch. Names the conflicting entity where feasible.
    Conflict(String),
    /// Missing identity, wrong secret code, or identity does not own the
    /// resource.
    Forbidden(&'static str),
    /// Exhausted an internal invariant (e.g. secret-code generation).
    Internal(&'static str),
    /// Capacity limit reached.
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable category, used as the wire error code and
    /// the metrics status label.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::Internal(_) => "internal",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "{msg}"),
            EngineError::NotFound(what) => write!(f, "Could not find {what}"),
            EngineError::Conflict(msg) => write!(f, "{msg}"),
            EngineError::Forbidden(msg) => write!(f, "{msg}"),
            EngineError::Internal(msg) => write!(f, "internal error: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
