use thiserror::Error;

/// Core error types for keyguard entities and events
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid key event type: {0}")]
    InvalidEventType(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a new InvalidEventType error
    pub fn invalid_event_type(event_type: impl Into<String>) -> Self {
        Self::InvalidEventType(event_type.into())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Failure talking to the origin store.
///
/// Absence is never an error: origin lookups return `Ok(None)` when the
/// entity does not exist, so callers can tell "definitely missing" apart from
/// "could not check right now".
#[derive(Debug, Error)]
pub enum OriginError {
    /// The origin could not be reached or refused the query.
    #[error("Origin unavailable: {0}")]
    Unavailable(String),

    /// The origin did not answer within the allotted time.
    #[error("Origin timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A row came back but could not be decoded into an entity.
    #[error("Origin returned malformed data: {0}")]
    Malformed(String),

    /// Adapter-specific failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OriginError {
    /// Create an Unavailable error from a string.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        OriginError::Unavailable(msg.into())
    }

    /// Create a Malformed error from a string.
    pub fn malformed(msg: impl Into<String>) -> Self {
        OriginError::Malformed(msg.into())
    }

    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}
