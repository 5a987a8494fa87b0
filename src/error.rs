use std::fmt;

/// Classification of a failed backend call. Retry policy depends only on
/// this, never on the concrete failure that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeout, connection failure, 408/429 or 5xx-equivalent. Retryable.
    Transient,
    /// Auth, quota, malformed request, or an unusable response. Not retryable.
    Permanent,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Image backend call failed ({kind}): {message}")]
pub struct BackendError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid character spec: {0}")]
pub struct ValidationError(pub String);

/// Request-level failures. Per-variant failures never surface here; they are
/// recorded in their slot instead.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Anchor generation failed: {0}")]
    AnchorFailed(#[source] BackendError),
}
