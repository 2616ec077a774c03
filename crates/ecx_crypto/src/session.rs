//! Public engine surface: sessions keyed by id, one lock per session.
//!
//! All cryptographic work is synchronous and happens under the session's
//! exclusive mutex; persistence and status consumers run elsewhere and are
//! fed through bounded queues. A state snapshot is taken under the lock and
//! the lock released before anything touches I/O, so the lock is never held
//! across a suspension point.
//!
//! Every state-advancing operation emits a persistence event. Handshakes,
//! DH ratchets and out-of-order chain synchronisation are critical (saved
//! immediately by the consumer); plain sends and in-order receives are
//! debounced.

use std::collections::HashMap;
use std::sync::Arc;

use ecx_proto::{HandshakePrelude, SessionEnvelope};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use crate::error::{
    CoreError, CoreResult, CryptoFailureKind, HandshakeFault, ProtocolFailure, StorageFailure,
};
use crate::handshake;
use crate::identity::{IdentityKeyStore, PublicBundle};
use crate::ratchet::{
    ConnectionState, InboundMessage, PersistedConnection, RatchetConnection,
};

pub type SessionId = String;

const SESSION_STATE_VERSION: u32 = 1;

/// Session state transitions, published for the connectivity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityIntent {
    Handshaking,
    Established,
    Closed,
    Faulted,
}

impl From<ConnectionState> for ConnectivityIntent {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Uninitialized | ConnectionState::Handshaking => {
                ConnectivityIntent::Handshaking
            }
            ConnectionState::Established => ConnectivityIntent::Established,
            ConnectionState::Closed => ConnectivityIntent::Closed,
            ConnectionState::Faulted => ConnectivityIntent::Faulted,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectivityEvent {
    pub session_id: SessionId,
    pub intent: ConnectivityIntent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    /// Save immediately.
    Critical,
    /// Coalesce with neighbours inside the debounce window.
    Debounced,
}

/// A serialized session snapshot on its way to the secure container.
pub struct PersistenceEvent {
    pub session_id: SessionId,
    pub blob: Zeroizing<Vec<u8>>,
    pub criticality: Criticality,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Session key from the password login, mixed into the handshake KDF
    /// salt when the installation is user-bound.
    pub handshake_salt_seed: Option<[u8; 32]>,
    /// Depth of the persistence and status queues.
    pub queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handshake_salt_seed: None,
            queue_depth: 64,
        }
    }
}

pub struct ProtocolEngine {
    identity: Arc<IdentityKeyStore>,
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<RatchetConnection>>>>,
    persist_tx: mpsc::Sender<PersistenceEvent>,
    status_tx: mpsc::Sender<ConnectivityEvent>,
    salt_seed: Option<[u8; 32]>,
}

impl ProtocolEngine {
    pub fn new(
        identity: Arc<IdentityKeyStore>,
        config: EngineConfig,
    ) -> (
        Self,
        mpsc::Receiver<PersistenceEvent>,
        mpsc::Receiver<ConnectivityEvent>,
    ) {
        let (persist_tx, persist_rx) = mpsc::channel(config.queue_depth);
        let (status_tx, status_rx) = mpsc::channel(config.queue_depth);
        (
            Self {
                identity,
                sessions: RwLock::new(HashMap::new()),
                persist_tx,
                status_tx,
                salt_seed: config.handshake_salt_seed,
            },
            persist_rx,
            status_rx,
        )
    }

    pub fn identity(&self) -> &Arc<IdentityKeyStore> {
        &self.identity
    }

    // ── Handshake operations ─────────────────────────────────────────────

    /// Initiate towards a peer bundle. Returns the wire bytes of the first
    /// envelope (handshake prelude included) and the new session id.
    pub fn initiate(
        &self,
        peer: &PublicBundle,
        opk_id: Option<u32>,
    ) -> CoreResult<(Vec<u8>, SessionId)> {
        let start = handshake::initiate(
            &self.identity,
            peer,
            opk_id,
            self.salt_seed.as_ref(),
        )?;
        let transcript = start.result.transcript_hash;
        let prelude = HandshakePrelude {
            sender_id_ed_pub: self.identity.id_ed_public(),
            sender_id_x_pub: self.identity.id_x_public(),
            ephemeral_pub: start.ephemeral_pub,
            opk_id: start.opk_id,
        };

        let peer_spk = start.peer_spk_pub;
        let mut conn = RatchetConnection::establish_initiator(start.result, peer_spk)?;

        // The first envelope carries no payload; it exists to complete the
        // handshake. The transcript hash rides as associated data, so a
        // root-key mismatch surfaces as an auth failure on the other side.
        let out = conn.produce_outbound(&[], &transcript)?;
        let envelope = SessionEnvelope {
            sender_dh_public: out.sender_dh_public,
            message_index: out.message_index,
            previous_chain_length: out.previous_chain_length,
            prelude: Some(prelude),
            ciphertext: out.ciphertext,
            tag: out.tag,
        };

        let session_id = uuid::Uuid::new_v4().to_string();
        let blob = Self::snapshot(&session_id, &conn)?;
        self.sessions
            .write()
            .insert(session_id.clone(), Arc::new(Mutex::new(conn)));

        self.emit_status(&session_id, ConnectivityIntent::Established);
        self.emit_persist(&session_id, blob, Criticality::Critical);

        tracing::debug!(session = %session_id, "session initiated");
        Ok((envelope.encode(), session_id))
    }

    /// Accept an initiator's first envelope. `expected_opk` cross-checks the
    /// pre-key id the transport claims was consumed.
    pub fn accept(
        &self,
        initiator_envelope: &[u8],
        expected_opk: Option<u32>,
    ) -> CoreResult<SessionId> {
        let envelope = SessionEnvelope::decode(initiator_envelope)?;
        let prelude = envelope.prelude.as_ref().ok_or(CoreError::Protocol(
            ProtocolFailure::HandshakeFailed(HandshakeFault::MissingPrelude),
        ))?;
        if expected_opk.is_some() && expected_opk != prelude.opk_id {
            return Err(CoreError::InvalidInput(format!(
                "envelope consumed pre-key {:?}, transport claimed {:?}",
                prelude.opk_id, expected_opk
            )));
        }

        let result = handshake::respond(&self.identity, prelude, self.salt_seed.as_ref())?;
        let transcript = result.transcript_hash;
        let mut conn = RatchetConnection::establish_responder(result)?;

        let inbound = InboundMessage {
            sender_dh_public: envelope.sender_dh_public,
            message_index: envelope.message_index,
            previous_chain_length: envelope.previous_chain_length,
            ciphertext: &envelope.ciphertext,
            tag: envelope.tag,
        };
        conn.consume_inbound(&inbound, &transcript).map_err(|err| {
            // A failed first decrypt means the two sides did not derive the
            // same root key.
            match err {
                CoreError::Crypto(ref c) if c.kind == CryptoFailureKind::AuthTagMismatch => {
                    CoreError::Protocol(ProtocolFailure::HandshakeFailed(
                        HandshakeFault::Mismatch,
                    ))
                }
                other => other,
            }
        })?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let blob = Self::snapshot(&session_id, &conn)?;
        self.sessions
            .write()
            .insert(session_id.clone(), Arc::new(Mutex::new(conn)));

        self.emit_status(&session_id, ConnectivityIntent::Established);
        self.emit_persist(&session_id, blob, Criticality::Critical);

        tracing::debug!(session = %session_id, "session accepted");
        Ok(session_id)
    }

    // ── Message operations ───────────────────────────────────────────────

    pub fn send(
        &self,
        session_id: &str,
        plaintext: &[u8],
        aad: &[u8],
    ) -> CoreResult<Vec<u8>> {
        let session = self.session(session_id)?;
        let mut conn = session.lock();

        let key_before = conn.sending_dh_public();
        let result = conn.produce_outbound(plaintext, aad);
        let out = self.after_op(session_id, &mut conn, result)?;
        let ratcheted = conn.sending_dh_public() != key_before;

        let blob = Self::snapshot(session_id, &conn)?;
        drop(conn);

        self.emit_persist(
            session_id,
            blob,
            if ratcheted {
                Criticality::Critical
            } else {
                Criticality::Debounced
            },
        );

        let envelope = SessionEnvelope {
            sender_dh_public: out.sender_dh_public,
            message_index: out.message_index,
            previous_chain_length: out.previous_chain_length,
            prelude: None,
            ciphertext: out.ciphertext,
            tag: out.tag,
        };
        Ok(envelope.encode())
    }

    pub fn receive(
        &self,
        session_id: &str,
        envelope_bytes: &[u8],
        aad: &[u8],
    ) -> CoreResult<Zeroizing<Vec<u8>>> {
        let envelope = SessionEnvelope::decode(envelope_bytes)?;
        if envelope.prelude.is_some() {
            return Err(CoreError::InvalidInput(
                "handshake envelope on an established session".into(),
            ));
        }

        let session = self.session(session_id)?;
        let mut conn = session.lock();

        let skipped_before = conn.receiving_skipped_len();
        let inbound = InboundMessage {
            sender_dh_public: envelope.sender_dh_public,
            message_index: envelope.message_index,
            previous_chain_length: envelope.previous_chain_length,
            ciphertext: &envelope.ciphertext,
            tag: envelope.tag,
        };
        let result = conn.consume_inbound(&inbound, aad);
        let plaintext = self.after_op(session_id, &mut conn, result)?;

        // A ratchet or any skipped-key movement is a chain synchronisation.
        let synced = conn.receiving_skipped_len() != skipped_before
            || envelope.message_index == 0;

        let blob = Self::snapshot(session_id, &conn)?;
        drop(conn);

        self.emit_persist(
            session_id,
            blob,
            if synced {
                Criticality::Critical
            } else {
                Criticality::Debounced
            },
        );
        Ok(plaintext)
    }

    // ── State operations ─────────────────────────────────────────────────

    pub fn export_state(&self, session_id: &str) -> CoreResult<Zeroizing<Vec<u8>>> {
        let session = self.session(session_id)?;
        let conn = session.lock();
        Self::snapshot(session_id, &conn)
    }

    pub fn import_state(&self, blob: &[u8]) -> CoreResult<SessionId> {
        let persisted: PersistedSession = serde_json::from_slice(blob)
            .map_err(|e| CoreError::InvalidInput(format!("session state: {e}")))?;
        if persisted.version != SESSION_STATE_VERSION {
            return Err(StorageFailure::UnsupportedVersion(persisted.version).into());
        }

        let conn = RatchetConnection::from_persisted(&persisted.connection)?;
        let session_id = persisted.session_id;
        self.sessions
            .write()
            .insert(session_id.clone(), Arc::new(Mutex::new(conn)));
        self.emit_status(&session_id, ConnectivityIntent::Established);
        tracing::debug!(session = %session_id, "session imported");
        Ok(session_id)
    }

    pub fn close(&self, session_id: &str) {
        let removed = self.sessions.write().remove(session_id);
        if let Some(session) = removed {
            session.lock().close();
            self.emit_status(session_id, ConnectivityIntent::Closed);
            tracing::debug!(session = %session_id, "session closed");
        }
    }

    pub fn status(&self, session_id: &str) -> CoreResult<ConnectivityIntent> {
        let session = self.session(session_id)?;
        let state = session.lock().state();
        Ok(state.into())
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn session(&self, session_id: &str) -> CoreResult<Arc<Mutex<RatchetConnection>>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or(CoreError::ObjectDisposed)
    }

    /// Propagate an operation result, turning a freshly faulted connection
    /// into a status event and dropping it from the session map.
    fn after_op<T>(
        &self,
        session_id: &str,
        conn: &mut RatchetConnection,
        result: CoreResult<T>,
    ) -> CoreResult<T> {
        if conn.state() == ConnectionState::Faulted {
            self.emit_status(session_id, ConnectivityIntent::Faulted);
            self.sessions.write().remove(session_id);
        }
        result
    }

    fn snapshot(session_id: &str, conn: &RatchetConnection) -> CoreResult<Zeroizing<Vec<u8>>> {
        let persisted = PersistedSession {
            version: SESSION_STATE_VERSION,
            session_id: session_id.to_string(),
            connection: conn.to_persisted()?,
        };
        let bytes = serde_json::to_vec(&persisted)
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        Ok(Zeroizing::new(bytes))
    }

    fn emit_status(&self, session_id: &str, intent: ConnectivityIntent) {
        let event = ConnectivityEvent {
            session_id: session_id.to_string(),
            intent,
        };
        if self.status_tx.try_send(event).is_err() {
            tracing::warn!(session = %session_id, "status queue full; event dropped");
        }
    }

    fn emit_persist(
        &self,
        session_id: &str,
        blob: Zeroizing<Vec<u8>>,
        criticality: Criticality,
    ) {
        let event = PersistenceEvent {
            session_id: session_id.to_string(),
            blob,
            criticality,
        };
        if self.persist_tx.try_send(event).is_err() {
            tracing::warn!(
                session = %session_id,
                ?criticality,
                "persistence queue full; snapshot dropped"
            );
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PersistedSession {
    version: u32,
    session_id: SessionId,
    connection: PersistedConnection,
}
