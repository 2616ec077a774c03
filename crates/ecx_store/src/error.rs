use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Persisted state failed outer integrity check")]
    TamperedStateDetected,

    #[error("Persisted state bound to a different membership or device")]
    AssociatedDataMismatch,

    #[error("Unsupported container version {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid state container: {0}")]
    InvalidContainer(String),

    #[error("State I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Keychain access failed: {0}")]
    Keychain(String),

    #[error(transparent)]
    Crypto(#[from] ecx_crypto::CryptoFailure),

    #[error("Operation cancelled")]
    Cancelled,
}

/// The single translation point into the engine-facing taxonomy.
impl From<StoreError> for ecx_crypto::CoreError {
    fn from(err: StoreError) -> Self {
        use ecx_crypto::StorageFailure;
        match err {
            StoreError::TamperedStateDetected => {
                StorageFailure::TamperedStateDetected.into()
            }
            StoreError::AssociatedDataMismatch => {
                StorageFailure::AssociatedDataMismatch.into()
            }
            StoreError::UnsupportedVersion(v) => StorageFailure::UnsupportedVersion(v).into(),
            StoreError::InvalidContainer(msg) => StorageFailure::InvalidContainer(msg).into(),
            StoreError::Io(e) => StorageFailure::IoError(e.to_string()).into(),
            StoreError::Keychain(msg) => StorageFailure::IoError(msg).into(),
            StoreError::Crypto(c) => ecx_crypto::CoreError::Crypto(c),
            StoreError::Cancelled => {
                StorageFailure::IoError("operation cancelled".into()).into()
            }
        }
    }
}
