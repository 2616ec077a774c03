//! Failure taxonomy for the protocol core.
//!
//! Every low-level failure is mapped exactly once into one of the kinds
//! below at the boundary where it occurs; intermediate layers never
//! translate. [`CoreError`] is the single enum callers see.

use thiserror::Error;

/// What went wrong inside a cryptographic primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoFailureKind {
    InvalidKeyLength,
    InvalidSignature,
    AuthTagMismatch,
    KdfFailed,
    RngFailed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Crypto failure ({kind:?}): {detail}")]
pub struct CryptoFailure {
    pub kind: CryptoFailureKind,
    pub detail: String,
}

impl CryptoFailure {
    pub fn new(kind: CryptoFailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Why a handshake was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFault {
    /// The peer's signed pre-key signature did not verify under its
    /// identity key.
    PeerSpkSignature,
    /// The two parties did not derive the same root key; detected as an
    /// auth-tag failure on the first envelope.
    Mismatch,
    /// The initiating envelope carried no handshake prelude.
    MissingPrelude,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolFailure {
    #[error("Handshake failed: {0:?}")]
    HandshakeFailed(HandshakeFault),

    #[error("Chain gap of {gap} messages exceeds the forward bound")]
    ChainGapTooLarge { gap: u64 },

    #[error("Message counter exhausted; a DH ratchet is required")]
    NonceCounterOverflow,

    #[error("Envelope replayed or outside the tolerated window (chain {chain_id}, index {index})")]
    ReplayOrOutOfWindow { chain_id: u32, index: u32 },

    #[error("Session state mismatch: {0}")]
    StateMismatch(String),
}

/// Persistence-side failures, surfaced through the engine unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageFailure {
    #[error("Persisted state failed outer integrity check")]
    TamperedStateDetected,

    #[error("Persisted state bound to a different membership or device")]
    AssociatedDataMismatch,

    #[error("Unsupported persisted-state version {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid state container: {0}")]
    InvalidContainer(String),

    #[error("State I/O failed: {0}")]
    IoError(String),
}

/// The one error type the engine's public operations return.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Crypto(#[from] CryptoFailure),

    #[error(transparent)]
    Protocol(#[from] ProtocolFailure),

    #[error(transparent)]
    Storage(#[from] StorageFailure),

    #[error("Session is closed")]
    ObjectDisposed,
}

impl From<ecx_secmem::SecMemError> for CoreError {
    fn from(err: ecx_secmem::SecMemError) -> Self {
        match err {
            ecx_secmem::SecMemError::ObjectDisposed => CoreError::ObjectDisposed,
            other => CoreError::InvalidInput(other.to_string()),
        }
    }
}

impl From<ecx_proto::EnvelopeError> for CoreError {
    fn from(err: ecx_proto::EnvelopeError) -> Self {
        CoreError::InvalidInput(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
