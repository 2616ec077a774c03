//! X3DH-style initial key agreement.
//!
//! The initiator works from the peer's published bundle; the responder runs
//! the mirror-image derivation from the handshake prelude on the first
//! envelope. Both arrive at the same 32-byte root key and transcript hash,
//! or the first AEAD decrypt fails and the handshake is reported as a
//! mismatch.
//!
//! DH shares, with a single ephemeral key `EK` throughout:
//!
//!   DH1 = DH(IK_A, SPK_B)      — mutual authentication
//!   DH2 = DH(EK,   IK_B)       — forward secrecy
//!   DH3 = DH(EK,   SPK_B)      — replay protection
//!   DH4 = DH(EK,   OPK_B)      — one-time forward secrecy [if offered]
//!
//!   root = HKDF(salt, DH1 || DH2 || DH3 [|| DH4], "ecliptix-x3dh-v1")
//!
//! The salt is 32 zero bytes, or the session key from the password login
//! when the installation is user-bound. The transcript hash commits to
//! every public input without revealing any secret.

use ecx_proto::HandshakePrelude;
use ecx_secmem::SecretBuf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{CoreError, CoreResult, HandshakeFault, ProtocolFailure};
use crate::identity::{IdentityKeyStore, PublicBundle};
use crate::primitives;

pub const X3DH_INFO: &[u8] = b"ecliptix-x3dh-v1";

const ZERO_SALT: [u8; 32] = [0u8; 32];

/// Everything a ratchet connection needs to come alive. Lives only long
/// enough to seed the connection.
#[derive(Debug)]
pub struct HandshakeResult {
    pub root_key: SecretBuf,
    pub initial_sending_dh_secret: SecretBuf,
    pub initial_sending_dh_public: [u8; 32],
    pub transcript_hash: [u8; 32],
}

/// Initiator-side output: the handshake result plus the prelude fields the
/// first envelope must carry.
#[derive(Debug)]
pub struct InitiatorStart {
    pub result: HandshakeResult,
    pub ephemeral_pub: [u8; 32],
    pub opk_id: Option<u32>,
    /// The peer key the first send-side ratchet runs against.
    pub peer_spk_pub: [u8; 32],
}

fn derive_root(
    ikm: &[u8],
    salt_seed: Option<&[u8; 32]>,
) -> CoreResult<SecretBuf> {
    let salt = salt_seed.map(|s| &s[..]).unwrap_or(&ZERO_SALT);
    let mut okm = Zeroizing::new([0u8; 32]);
    primitives::hkdf_expand(Some(salt), ikm, X3DH_INFO, &mut *okm)?;
    Ok(SecretBuf::from_bytes(&*okm)?)
}

fn transcript_hash(
    initiator_id_ed: &[u8; 32],
    responder_id_ed: &[u8; 32],
    ephemeral_pub: &[u8; 32],
    responder_spk_pub: &[u8; 32],
    opk_pub: Option<&[u8; 32]>,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(initiator_id_ed);
    hasher.update(responder_id_ed);
    hasher.update(ephemeral_pub);
    hasher.update(responder_spk_pub);
    if let Some(opk) = opk_pub {
        hasher.update(opk);
    }
    hasher.finalize().into()
}

/// Initiate towards a peer bundle. `opk_id` selects one of the bundle's
/// one-time pre-keys; `None` runs the three-share variant.
pub fn initiate(
    local: &IdentityKeyStore,
    peer: &PublicBundle,
    opk_id: Option<u32>,
    salt_seed: Option<&[u8; 32]>,
) -> CoreResult<InitiatorStart> {
    peer.verify_spk().map_err(|_| {
        CoreError::Protocol(ProtocolFailure::HandshakeFailed(
            HandshakeFault::PeerSpkSignature,
        ))
    })?;

    let opk = match opk_id {
        Some(id) => Some(peer.opk(id).copied().ok_or_else(|| {
            CoreError::InvalidInput(format!("peer bundle has no one-time pre-key {id}"))
        })?),
        None => None,
    };

    let (ek_secret, ek_public) = primitives::x25519_keygen();
    let ik_a = local.id_x_secret()?;

    let dh1 = primitives::x25519(&ik_a, &peer.spk_pub)?;
    let dh2 = primitives::x25519(&ek_secret, &peer.id_x_pub)?;
    let dh3 = primitives::x25519(&ek_secret, &peer.spk_pub)?;

    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 4));
    ikm.extend_from_slice(&*dh1);
    ikm.extend_from_slice(&*dh2);
    ikm.extend_from_slice(&*dh3);
    if let Some(opk) = &opk {
        let dh4 = primitives::x25519(&ek_secret, &opk.public)?;
        ikm.extend_from_slice(&*dh4);
    }

    let root_key = derive_root(&ikm, salt_seed)?;
    let transcript = transcript_hash(
        &local.id_ed_public(),
        &peer.id_ed_pub,
        ek_public.as_bytes(),
        &peer.spk_pub,
        opk.as_ref().map(|o| &o.public),
    );

    let (send_secret, send_public) = primitives::x25519_keygen();

    Ok(InitiatorStart {
        result: HandshakeResult {
            root_key,
            initial_sending_dh_secret: SecretBuf::from_bytes(send_secret.as_bytes())?,
            initial_sending_dh_public: *send_public.as_bytes(),
            transcript_hash: transcript,
        },
        ephemeral_pub: *ek_public.as_bytes(),
        opk_id: opk.map(|o| o.id),
        peer_spk_pub: peer.spk_pub,
    })
}

/// Responder side: reconstruct the root key from the prelude of the first
/// envelope. Consumes the selected one-time pre-key; the consumption is
/// durable regardless of whether the rest of the handshake succeeds.
pub fn respond(
    local: &IdentityKeyStore,
    prelude: &HandshakePrelude,
    salt_seed: Option<&[u8; 32]>,
) -> CoreResult<HandshakeResult> {
    let spk_secret = local.spk_secret()?;
    let ik_b = local.id_x_secret()?;

    let opk_secret = match prelude.opk_id {
        Some(id) => Some(local.consume_opk(id)?),
        None => None,
    };

    let dh1 = primitives::x25519(&spk_secret, &prelude.sender_id_x_pub)?;
    let dh2 = primitives::x25519(&ik_b, &prelude.ephemeral_pub)?;
    let dh3 = primitives::x25519(&spk_secret, &prelude.ephemeral_pub)?;

    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 4));
    ikm.extend_from_slice(&*dh1);
    ikm.extend_from_slice(&*dh2);
    ikm.extend_from_slice(&*dh3);

    let opk_pub = if let Some(opk_secret) = &opk_secret {
        let dh4 = primitives::x25519(opk_secret, &prelude.ephemeral_pub)?;
        ikm.extend_from_slice(&*dh4);
        Some(*x25519_dalek::PublicKey::from(opk_secret).as_bytes())
    } else {
        None
    };

    let root_key = derive_root(&ikm, salt_seed)?;
    let spk_public = local.spk_public();
    let transcript = transcript_hash(
        &prelude.sender_id_ed_pub,
        &local.id_ed_public(),
        &prelude.ephemeral_pub,
        &spk_public,
        opk_pub.as_ref(),
    );

    Ok(HandshakeResult {
        root_key,
        initial_sending_dh_secret: SecretBuf::from_bytes(spk_secret.as_bytes())?,
        initial_sending_dh_public: spk_public,
        transcript_hash: transcript,
    })
}
