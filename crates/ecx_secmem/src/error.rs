use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecMemError {
    #[error("Secure allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Destination buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    #[error("Length mismatch: expected {expected} bytes, got {got}")]
    InvalidSize { expected: usize, got: usize },

    #[error("Secret buffer already disposed")]
    ObjectDisposed,
}
