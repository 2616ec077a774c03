//! Ecliptix protocol core: identity material, X3DH handshake, double
//! ratchet and the session engine the application drives.
//!
//! Layering, bottom up:
//!
//!   [`primitives`] — thin wrappers over the crypto crates
//!   [`identity`]   — per-installation key store and public bundles
//!   [`handshake`]  — initial key agreement producing a root key
//!   [`chain`]      — per-direction KDF chains with skipped-key caching
//!   [`ratchet`]    — the connection state machine (DH ratchet, replay,
//!                    tamper accounting)
//!   [`session`]    — the public engine: sessions by id, wire envelopes,
//!                    persistence and status queues
//!
//! Nothing in this crate performs I/O; persistence and the keychain live in
//! `ecx_store`, the wire framing in `ecx_proto`.

pub mod chain;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod primitives;
pub mod ratchet;
pub mod session;

pub use error::{
    CoreError, CoreResult, CryptoFailure, CryptoFailureKind, HandshakeFault, ProtocolFailure,
    StorageFailure,
};
pub use identity::{IdentityKeyStore, OpkPublic, PublicBundle};
pub use ratchet::ConnectionState;
pub use session::{
    ConnectivityEvent, ConnectivityIntent, Criticality, EngineConfig, PersistenceEvent,
    ProtocolEngine, SessionId,
};
