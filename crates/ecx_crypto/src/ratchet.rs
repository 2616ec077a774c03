//! Double ratchet connection: two KDF chains plus a Diffie-Hellman ratchet.
//!
//! State separation:
//!   root key        — rotated on every DH ratchet step
//!   sending chain   — advanced once per outbound message
//!   receiving chain — advanced once per inbound message
//!   message key     — derived from a chain, used once, then wiped
//!
//! A DH ratchet fires when the peer's ephemeral public key changes: the
//! receive side rotates first (on the envelope that carries the new key),
//! the send side rotates with a freshly generated key pair on the next
//! outbound message. Forward secrecy comes from deleting old chain keys;
//! post-compromise security from the DH rotation.
//!
//! Chain ids count ratchet steps per direction and feed the nonce; both
//! parties track them in lockstep, so nonces reconstruct deterministically
//! and `(chain id, index)` never repeats within a session.

use std::collections::BTreeMap;

use ecx_secmem::SecretBuf;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

use crate::chain::ChainStep;
use crate::error::{
    CoreError, CoreResult, CryptoFailureKind, ProtocolFailure, StorageFailure,
};
use crate::handshake::HandshakeResult;
use crate::primitives;

/// Accepted `(chain id, index)` pairs remembered for replay rejection.
pub const REPLAY_WINDOW: usize = 1024;

/// Retired receive chains whose skipped keys stay resolvable.
const RETIRED_CHAINS_KEPT: usize = 2;

/// Auth-tag failures tolerated within [`TAMPER_WINDOW`] receives.
const TAMPER_LIMIT: usize = 3;
const TAMPER_WINDOW: u64 = 64;

const NONCE_SALT_INFO: &[u8] = b"ecliptix-nonce-salt";

// Chain derivation labels are bound to the traffic direction relative to
// the session initiator so both parties derive byte-identical chains.
const INITIATOR_TO_RESPONDER_INFO: &[u8] = b"ecliptix-send-ratchet";
const RESPONDER_TO_INITIATOR_INFO: &[u8] = b"ecliptix-recv-ratchet";

const CONNECTION_STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Uninitialized,
    Handshaking,
    Established,
    Closed,
    Faulted,
}

/// Outbound envelope fields before wire framing.
#[derive(Debug)]
pub struct OutboundMessage {
    pub sender_dh_public: [u8; 32],
    pub message_index: u32,
    pub previous_chain_length: u32,
    pub ciphertext: Vec<u8>,
    pub tag: [u8; 16],
}

/// Inbound envelope fields after wire parsing.
pub struct InboundMessage<'a> {
    pub sender_dh_public: [u8; 32],
    pub message_index: u32,
    pub previous_chain_length: u32,
    pub ciphertext: &'a [u8],
    pub tag: [u8; 16],
}

// ── Replay window ────────────────────────────────────────────────────────────

/// Flat fixed-capacity ring of accepted `(chain id, index)` pairs.
struct ReplayWindow {
    entries: Vec<(u32, u32)>,
    head: usize,
}

impl ReplayWindow {
    fn new() -> Self {
        Self {
            entries: Vec::with_capacity(REPLAY_WINDOW),
            head: 0,
        }
    }

    fn contains(&self, chain_id: u32, index: u32) -> bool {
        self.entries.iter().any(|e| *e == (chain_id, index))
    }

    fn insert(&mut self, chain_id: u32, index: u32) {
        if self.entries.len() < REPLAY_WINDOW {
            self.entries.push((chain_id, index));
        } else {
            self.entries[self.head] = (chain_id, index);
            self.head = (self.head + 1) % REPLAY_WINDOW;
        }
    }
}

// ── Retired receive chains ───────────────────────────────────────────────────

struct RetiredChain {
    peer_dh_public: [u8; 32],
    chain_id: u32,
    skipped: BTreeMap<u32, SecretBuf>,
}

// ── Connection ───────────────────────────────────────────────────────────────

pub struct RatchetConnection {
    state: ConnectionState,
    is_initiator: bool,
    root_key: SecretBuf,
    sending: ChainStep,
    sending_dh_secret: SecretBuf,
    sending_dh_public: [u8; 32],
    receiving: ChainStep,
    peer_dh_public: Option<[u8; 32]>,
    dh_ratchet_pending: bool,
    send_chain_id: u32,
    next_send_chain_id: u32,
    recv_chain_id: u32,
    next_recv_chain_id: u32,
    previous_chain_length: u32,
    nonce_salt: [u8; 12],
    replay: ReplayWindow,
    retired: Vec<RetiredChain>,
    tamper_events: Vec<u64>,
    recv_ops: u64,
    transcript_hash: [u8; 32],
}

fn kdf_root(
    root: &SecretBuf,
    dh_shared: &[u8; 32],
    info: &[u8],
) -> CoreResult<(SecretBuf, SecretBuf)> {
    let mut ikm = Zeroizing::new([0u8; 64]);
    root.read_into(&mut ikm[..32])?;
    ikm[32..].copy_from_slice(dh_shared);

    let mut okm = Zeroizing::new([0u8; 64]);
    primitives::hkdf_expand(None, &*ikm, info, &mut *okm)?;

    let new_root = SecretBuf::from_bytes(&okm[..32])?;
    let chain_key = SecretBuf::from_bytes(&okm[32..])?;
    Ok((new_root, chain_key))
}

impl RatchetConnection {
    /// Initiator side: seeds the connection from the handshake result and
    /// immediately ratchets the send chain against the peer's signed
    /// pre-key, so the first envelope already carries a ratcheted key.
    pub fn establish_initiator(
        hs: HandshakeResult,
        peer_spk_pub: [u8; 32],
    ) -> CoreResult<Self> {
        let mut conn = Self::base(hs, true)?;
        conn.peer_dh_public = Some(peer_spk_pub);
        let secret = conn.current_dh_secret()?;
        conn.send_ratchet_with(secret)?;
        conn.state = ConnectionState::Established;
        Ok(conn)
    }

    /// Responder side: the signed pre-key pair is the initial ratchet key;
    /// the first inbound envelope triggers the receive-side ratchet.
    pub fn establish_responder(hs: HandshakeResult) -> CoreResult<Self> {
        let mut conn = Self::base(hs, false)?;
        conn.state = ConnectionState::Established;
        Ok(conn)
    }

    fn base(hs: HandshakeResult, is_initiator: bool) -> CoreResult<Self> {
        let mut nonce_salt = [0u8; 12];
        {
            let mut root_bytes = Zeroizing::new([0u8; 32]);
            hs.root_key.read_into(&mut *root_bytes)?;
            primitives::hkdf_expand(None, &*root_bytes, NONCE_SALT_INFO, &mut nonce_salt)?;
        }

        Ok(Self {
            state: ConnectionState::Handshaking,
            is_initiator,
            root_key: hs.root_key,
            sending: ChainStep::inactive(),
            sending_dh_secret: hs.initial_sending_dh_secret,
            sending_dh_public: hs.initial_sending_dh_public,
            receiving: ChainStep::inactive(),
            peer_dh_public: None,
            dh_ratchet_pending: false,
            send_chain_id: 0,
            next_send_chain_id: 0,
            recv_chain_id: 0,
            next_recv_chain_id: 0,
            previous_chain_length: 0,
            nonce_salt,
            replay: ReplayWindow::new(),
            retired: Vec::new(),
            tamper_events: Vec::new(),
            recv_ops: 0,
            transcript_hash: hs.transcript_hash,
        })
    }

    fn current_dh_secret(&self) -> CoreResult<StaticSecret> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        self.sending_dh_secret.read_into(&mut *bytes)?;
        Ok(StaticSecret::from(*bytes))
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn transcript_hash(&self) -> [u8; 32] {
        self.transcript_hash
    }

    pub fn sending_dh_public(&self) -> [u8; 32] {
        self.sending_dh_public
    }

    pub fn receiving_skipped_len(&self) -> usize {
        self.receiving.skipped_len()
    }

    fn ensure_established(&self) -> CoreResult<()> {
        match self.state {
            ConnectionState::Established => Ok(()),
            ConnectionState::Closed => Err(CoreError::ObjectDisposed),
            ConnectionState::Faulted => Err(ProtocolFailure::StateMismatch(
                "session is faulted".into(),
            )
            .into()),
            other => Err(ProtocolFailure::StateMismatch(format!(
                "session not established (state {other:?})"
            ))
            .into()),
        }
    }

    fn chain_info(sender_is_initiator: bool) -> &'static [u8] {
        if sender_is_initiator {
            INITIATOR_TO_RESPONDER_INFO
        } else {
            RESPONDER_TO_INITIATOR_INFO
        }
    }

    fn make_nonce(&self, chain_id: u32, index: u32) -> [u8; 12] {
        let mut nonce = self.nonce_salt;
        let word = (u64::from(chain_id) << 32) | u64::from(index);
        for (b, w) in nonce[4..12].iter_mut().zip(word.to_be_bytes()) {
            *b ^= w;
        }
        nonce
    }

    fn build_aad(
        prefix: &[u8],
        dh_public: &[u8; 32],
        index: u32,
        previous_chain_length: u32,
    ) -> Vec<u8> {
        let mut aad = Vec::with_capacity(prefix.len() + 40);
        aad.extend_from_slice(prefix);
        aad.extend_from_slice(dh_public);
        aad.extend_from_slice(&index.to_be_bytes());
        aad.extend_from_slice(&previous_chain_length.to_be_bytes());
        aad
    }

    /// Tear the session down after a fatal failure; all secrets are wiped.
    pub fn fault(&mut self) {
        self.wipe();
        self.state = ConnectionState::Faulted;
    }

    /// Orderly shutdown; all secrets are wiped.
    pub fn close(&mut self) {
        self.wipe();
        self.state = ConnectionState::Closed;
    }

    fn wipe(&mut self) {
        self.root_key.dispose();
        self.sending_dh_secret.dispose();
        self.sending = ChainStep::inactive();
        self.receiving = ChainStep::inactive();
        self.retired.clear();
    }

    // ── DH ratchet ───────────────────────────────────────────────────────

    fn send_ratchet_with(&mut self, new_secret: StaticSecret) -> CoreResult<()> {
        let peer = self.peer_dh_public.ok_or_else(|| {
            ProtocolFailure::StateMismatch("send ratchet without a peer key".into())
        })?;
        let new_public = *x25519_dalek::PublicKey::from(&new_secret).as_bytes();

        let dh_shared = primitives::x25519(&new_secret, &peer)?;
        let info = Self::chain_info(self.is_initiator);
        let (new_root, new_ck) = kdf_root(&self.root_key, &dh_shared, info)?;

        if self.sending.is_active() {
            self.previous_chain_length = self.sending.current_index();
        }
        self.root_key = new_root;
        self.sending.activate(new_ck);
        self.sending_dh_secret = SecretBuf::from_bytes(new_secret.as_bytes())?;
        self.sending_dh_public = new_public;
        self.send_chain_id = self.next_send_chain_id;
        self.next_send_chain_id += 1;
        self.dh_ratchet_pending = false;
        Ok(())
    }

    fn send_ratchet(&mut self) -> CoreResult<()> {
        let (secret, _) = primitives::x25519_keygen();
        self.send_ratchet_with(secret)
    }

    fn receive_ratchet(
        &mut self,
        new_peer_pub: [u8; 32],
        previous_chain_length: u32,
    ) -> CoreResult<()> {
        // Derive and park whatever the old chain still owes us before it
        // retires; bounds apply, and on failure nothing has rotated yet.
        if self.receiving.is_active() {
            self.receiving.cache_through(previous_chain_length)?;
        }

        let own_secret = self.current_dh_secret()?;
        let dh_shared = primitives::x25519(&own_secret, &new_peer_pub).map_err(|e| {
            if e.kind == CryptoFailureKind::InvalidSignature {
                // A low-order key from the peer is hostile; the session is
                // unrecoverable.
                self.fault();
            }
            e
        })?;
        let info = Self::chain_info(!self.is_initiator);
        let (new_root, new_ck) = kdf_root(&self.root_key, &dh_shared, info)?;

        if self.receiving.is_active() {
            let old_pub = self.peer_dh_public.unwrap_or_default();
            self.retired.push(RetiredChain {
                peer_dh_public: old_pub,
                chain_id: self.recv_chain_id,
                skipped: self.receiving.drain_skipped(),
            });
            if self.retired.len() > RETIRED_CHAINS_KEPT {
                self.retired.remove(0);
            }
        }

        self.root_key = new_root;
        self.receiving.activate(new_ck);
        self.recv_chain_id = self.next_recv_chain_id;
        self.next_recv_chain_id += 1;
        self.peer_dh_public = Some(new_peer_pub);
        self.dh_ratchet_pending = true;
        Ok(())
    }

    // ── Send path ────────────────────────────────────────────────────────

    pub fn produce_outbound(
        &mut self,
        plaintext: &[u8],
        aad_prefix: &[u8],
    ) -> CoreResult<OutboundMessage> {
        self.ensure_established()?;

        if self.dh_ratchet_pending || !self.sending.is_active() {
            self.send_ratchet()?;
        }

        let mk = match self.sending.advance() {
            Ok(mk) => mk,
            Err(err) => {
                if matches!(
                    err,
                    CoreError::Protocol(ProtocolFailure::NonceCounterOverflow)
                ) {
                    self.fault();
                }
                return Err(err);
            }
        };

        let nonce = self.make_nonce(self.send_chain_id, mk.index);
        let aad = Self::build_aad(
            aad_prefix,
            &self.sending_dh_public,
            mk.index,
            self.previous_chain_length,
        );
        let (ciphertext, tag) = primitives::aes_gcm_encrypt(&mk.key, &nonce, &aad, plaintext)?;

        Ok(OutboundMessage {
            sender_dh_public: self.sending_dh_public,
            message_index: mk.index,
            previous_chain_length: self.previous_chain_length,
            ciphertext,
            tag,
        })
    }

    // ── Receive path ─────────────────────────────────────────────────────

    pub fn consume_inbound(
        &mut self,
        msg: &InboundMessage<'_>,
        aad_prefix: &[u8],
    ) -> CoreResult<Zeroizing<Vec<u8>>> {
        self.ensure_established()?;
        self.recv_ops += 1;

        let on_current_chain = self.peer_dh_public == Some(msg.sender_dh_public);

        if !on_current_chain {
            if let Some(pos) = self
                .retired
                .iter()
                .position(|r| r.peer_dh_public == msg.sender_dh_public)
            {
                return self.consume_from_retired(pos, msg, aad_prefix);
            }
            self.receive_ratchet(msg.sender_dh_public, msg.previous_chain_length)?;
        }

        let index = msg.message_index;
        let chain_id = self.recv_chain_id;
        let aad = Self::build_aad(
            aad_prefix,
            &msg.sender_dh_public,
            index,
            msg.previous_chain_length,
        );
        let nonce = self.make_nonce(chain_id, index);

        if self.replay.contains(chain_id, index) {
            return Err(ProtocolFailure::ReplayOrOutOfWindow { chain_id, index }.into());
        }

        if index < self.receiving.current_index() {
            // Late envelope: only a cached skipped key can still decrypt it.
            let mk = self
                .receiving
                .take_skipped(index)
                .ok_or(ProtocolFailure::ReplayOrOutOfWindow { chain_id, index })?;
            match primitives::aes_gcm_decrypt(&mk.key, &nonce, &aad, msg.ciphertext, &msg.tag) {
                Ok(pt) => {
                    self.replay.insert(chain_id, index);
                    Ok(pt)
                }
                Err(err) => {
                    self.receiving.restore_skipped(&mk)?;
                    self.record_tamper();
                    Err(err.into())
                }
            }
        } else {
            let snapshot = self.receiving.snapshot()?.ok_or_else(|| {
                ProtocolFailure::StateMismatch("receive chain not keyed".into())
            })?;
            let derived = if index == self.receiving.current_index() {
                self.receiving.advance()
            } else {
                self.receiving.derive_up_to(index)
            };
            let mk = match derived {
                Ok(mk) => mk,
                Err(err) => {
                    if matches!(
                        err,
                        CoreError::Protocol(ProtocolFailure::NonceCounterOverflow)
                    ) {
                        self.fault();
                    }
                    return Err(err);
                }
            };
            match primitives::aes_gcm_decrypt(&mk.key, &nonce, &aad, msg.ciphertext, &msg.tag) {
                Ok(pt) => {
                    self.replay.insert(chain_id, index);
                    Ok(pt)
                }
                Err(err) => {
                    // The chain must not move for an envelope that failed
                    // authentication.
                    self.receiving.restore(snapshot)?;
                    self.record_tamper();
                    Err(err.into())
                }
            }
        }
    }

    fn consume_from_retired(
        &mut self,
        pos: usize,
        msg: &InboundMessage<'_>,
        aad_prefix: &[u8],
    ) -> CoreResult<Zeroizing<Vec<u8>>> {
        let chain_id = self.retired[pos].chain_id;
        let index = msg.message_index;

        if self.replay.contains(chain_id, index) {
            return Err(ProtocolFailure::ReplayOrOutOfWindow { chain_id, index }.into());
        }
        let key_buf = self.retired[pos]
            .skipped
            .remove(&index)
            .ok_or(ProtocolFailure::ReplayOrOutOfWindow { chain_id, index })?;
        let mut key = Zeroizing::new([0u8; 32]);
        key_buf.read_into(&mut *key)?;

        let nonce = self.make_nonce(chain_id, index);
        let aad = Self::build_aad(
            aad_prefix,
            &msg.sender_dh_public,
            index,
            msg.previous_chain_length,
        );
        match primitives::aes_gcm_decrypt(&key, &nonce, &aad, msg.ciphertext, &msg.tag) {
            Ok(pt) => {
                self.replay.insert(chain_id, index);
                Ok(pt)
            }
            Err(err) => {
                self.retired[pos]
                    .skipped
                    .insert(index, SecretBuf::from_bytes(&*key)?);
                self.record_tamper();
                Err(err.into())
            }
        }
    }

    fn record_tamper(&mut self) {
        let cutoff = self.recv_ops.saturating_sub(TAMPER_WINDOW);
        self.tamper_events.retain(|&at| at > cutoff);
        self.tamper_events.push(self.recv_ops);
        if self.tamper_events.len() >= TAMPER_LIMIT {
            tracing::warn!(
                events = self.tamper_events.len(),
                "repeated authentication failures; faulting session"
            );
            self.fault();
        }
    }

    // ── Persistence ──────────────────────────────────────────────────────

    pub fn to_persisted(&self) -> CoreResult<PersistedConnection> {
        if self.state != ConnectionState::Established {
            return Err(CoreError::ObjectDisposed);
        }

        let mut root = Zeroizing::new([0u8; 32]);
        self.root_key.read_into(&mut *root)?;
        let mut dh_secret = Zeroizing::new([0u8; 32]);
        self.sending_dh_secret.read_into(&mut *dh_secret)?;

        Ok(PersistedConnection {
            version: CONNECTION_STATE_VERSION,
            is_initiator: self.is_initiator,
            root_key: ByteBuf::from(root.to_vec()),
            sending: persist_chain(&self.sending)?,
            sending_dh_secret: ByteBuf::from(dh_secret.to_vec()),
            sending_dh_public: ByteBuf::from(self.sending_dh_public.to_vec()),
            receiving: persist_chain(&self.receiving)?,
            peer_dh_public: self
                .peer_dh_public
                .map(|p| ByteBuf::from(p.to_vec())),
            dh_ratchet_pending: self.dh_ratchet_pending,
            send_chain_id: self.send_chain_id,
            next_send_chain_id: self.next_send_chain_id,
            recv_chain_id: self.recv_chain_id,
            next_recv_chain_id: self.next_recv_chain_id,
            previous_chain_length: self.previous_chain_length,
            nonce_salt: ByteBuf::from(self.nonce_salt.to_vec()),
            replay: self.replay.entries.clone(),
            retired: self
                .retired
                .iter()
                .map(|r| {
                    Ok(PersistedRetired {
                        peer_dh_public: ByteBuf::from(r.peer_dh_public.to_vec()),
                        chain_id: r.chain_id,
                        skipped: persist_skipped(&r.skipped)?,
                    })
                })
                .collect::<CoreResult<Vec<_>>>()?,
            tamper_events: self.tamper_events.clone(),
            recv_ops: self.recv_ops,
            transcript_hash: ByteBuf::from(self.transcript_hash.to_vec()),
        })
    }

    pub fn from_persisted(persisted: &PersistedConnection) -> CoreResult<Self> {
        if persisted.version != CONNECTION_STATE_VERSION {
            return Err(StorageFailure::UnsupportedVersion(persisted.version).into());
        }

        let mut replay = ReplayWindow::new();
        for (chain_id, index) in &persisted.replay {
            replay.insert(*chain_id, *index);
        }

        let mut retired = Vec::with_capacity(persisted.retired.len());
        for r in &persisted.retired {
            retired.push(RetiredChain {
                peer_dh_public: fixed::<32>("retired peer key", &r.peer_dh_public)?,
                chain_id: r.chain_id,
                skipped: restore_skipped(&r.skipped)?,
            });
        }

        Ok(Self {
            state: ConnectionState::Established,
            is_initiator: persisted.is_initiator,
            root_key: SecretBuf::from_bytes(&persisted.root_key)?,
            sending: restore_chain(&persisted.sending)?,
            sending_dh_secret: SecretBuf::from_bytes(&persisted.sending_dh_secret)?,
            sending_dh_public: fixed::<32>("sending dh public", &persisted.sending_dh_public)?,
            receiving: restore_chain(&persisted.receiving)?,
            peer_dh_public: match &persisted.peer_dh_public {
                Some(p) => Some(fixed::<32>("peer dh public", p)?),
                None => None,
            },
            dh_ratchet_pending: persisted.dh_ratchet_pending,
            send_chain_id: persisted.send_chain_id,
            next_send_chain_id: persisted.next_send_chain_id,
            recv_chain_id: persisted.recv_chain_id,
            next_recv_chain_id: persisted.next_recv_chain_id,
            previous_chain_length: persisted.previous_chain_length,
            nonce_salt: fixed::<12>("nonce salt", &persisted.nonce_salt)?,
            replay,
            retired,
            tamper_events: persisted.tamper_events.clone(),
            recv_ops: persisted.recv_ops,
            transcript_hash: fixed::<32>("transcript hash", &persisted.transcript_hash)?,
        })
    }
}

fn fixed<const N: usize>(field: &str, bytes: &[u8]) -> CoreResult<[u8; N]> {
    bytes.try_into().map_err(|_| {
        CoreError::InvalidInput(format!("{field} must be {N} bytes, got {}", bytes.len()))
    })
}

fn persist_chain(chain: &ChainStep) -> CoreResult<PersistedChain> {
    Ok(PersistedChain {
        chain_key: chain.chain_key_bytes()?.map(|k| ByteBuf::from(k.to_vec())),
        current_index: chain.current_index(),
        skipped: chain
            .skipped_entries()?
            .into_iter()
            .map(|(index, key)| PersistedSkipped {
                index,
                key: ByteBuf::from(key.to_vec()),
            })
            .collect(),
    })
}

fn restore_chain(persisted: &PersistedChain) -> CoreResult<ChainStep> {
    let chain_key = match &persisted.chain_key {
        Some(k) => Some(SecretBuf::from_bytes(k)?),
        None => None,
    };
    let skipped = persisted
        .skipped
        .iter()
        .map(|s| Ok((s.index, SecretBuf::from_bytes(&s.key)?)))
        .collect::<CoreResult<BTreeMap<_, _>>>()?;
    Ok(ChainStep::from_parts(
        chain_key,
        persisted.current_index,
        skipped,
    ))
}

fn persist_skipped(
    skipped: &BTreeMap<u32, SecretBuf>,
) -> CoreResult<Vec<PersistedSkipped>> {
    skipped
        .iter()
        .map(|(index, buf)| {
            let mut key = Zeroizing::new([0u8; 32]);
            buf.read_into(&mut *key)?;
            Ok(PersistedSkipped {
                index: *index,
                key: ByteBuf::from(key.to_vec()),
            })
        })
        .collect()
}

fn restore_skipped(
    persisted: &[PersistedSkipped],
) -> CoreResult<BTreeMap<u32, SecretBuf>> {
    persisted
        .iter()
        .map(|s| Ok((s.index, SecretBuf::from_bytes(&s.key)?)))
        .collect()
}

// ── Persisted forms ──────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistedSkipped {
    pub index: u32,
    pub key: ByteBuf,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistedChain {
    pub chain_key: Option<ByteBuf>,
    pub current_index: u32,
    pub skipped: Vec<PersistedSkipped>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistedRetired {
    pub peer_dh_public: ByteBuf,
    pub chain_id: u32,
    pub skipped: Vec<PersistedSkipped>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistedConnection {
    pub version: u32,
    pub is_initiator: bool,
    pub root_key: ByteBuf,
    pub sending: PersistedChain,
    pub sending_dh_secret: ByteBuf,
    pub sending_dh_public: ByteBuf,
    pub receiving: PersistedChain,
    pub peer_dh_public: Option<ByteBuf>,
    pub dh_ratchet_pending: bool,
    pub send_chain_id: u32,
    pub next_send_chain_id: u32,
    pub recv_chain_id: u32,
    pub next_recv_chain_id: u32,
    pub previous_chain_length: u32,
    pub nonce_salt: ByteBuf,
    pub replay: Vec<(u32, u32)>,
    pub retired: Vec<PersistedRetired>,
    pub tamper_events: Vec<u64>,
    pub recv_ops: u64,
    pub transcript_hash: ByteBuf,
}
