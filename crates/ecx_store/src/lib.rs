//! Secure persistence and restoration for the Ecliptix protocol engine.
//!
//! [`container`] seals serialized session state into a tamper-evident file
//! bound to the installation; [`keychain`] is the platform security
//! provider behind it; [`persister`] drains the engine's persistence queue
//! with critical/debounced semantics; [`restore`] plans how a connection
//! comes back after a restart.
//!
//! Everything here is async and cancellable; nothing here holds a session
//! lock. The engine snapshots state under its lock, this crate writes it.

pub mod cancel;
pub mod container;
pub mod error;
pub mod keychain;
pub mod persister;
pub mod restore;

pub use cancel::CancelToken;
pub use container::{StampedState, StateBinding, StateContainer, CONTAINER_MAGIC, CONTAINER_VERSION};
pub use error::StoreError;
pub use keychain::{session_key_id, KeyringProvider, MemoryProvider, SecurityProvider, KEYCHAIN_SERVICE};
pub use persister::{SessionPersister, DEBOUNCE_WINDOW};
pub use restore::{
    RestorationConfig, RestorationPlanner, RestorationResult, RestorationStrategy,
    RestoreTransport,
};
