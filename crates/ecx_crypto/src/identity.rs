//! Installation identity: long-term keys, signed pre-key, one-time pre-keys.
//!
//! One store per installation, process-wide lifetime, mutated only under its
//! own lock. Secret scalars live in locked memory and leave it only as
//! short-lived `StaticSecret`/`SigningKey` values that zeroize on drop.
//!
//! The signed pre-key rotates on a policy decided outside the engine;
//! [`IdentityKeyStore::reissue_signed_prekey`] is the rotation primitive.
//! One-time pre-keys are consumed at most once; a successful
//! [`IdentityKeyStore::consume_opk`] removes the entry atomically and the
//! caller is expected to persist the store afterwards.

use std::collections::BTreeMap;

use ecx_secmem::SecretBuf;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

use crate::error::{CoreError, CoreResult, CryptoFailure, CryptoFailureKind, StorageFailure};
use crate::primitives;

/// Upper bound on stored one-time pre-keys.
pub const MAX_OPK_COUNT: usize = 10_000;

const IDENTITY_STATE_VERSION: u32 = 1;

// ── Public bundle ────────────────────────────────────────────────────────────

/// One published one-time pre-key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpkPublic {
    pub id: u32,
    pub public: [u8; 32],
}

/// What the owner publishes; what peers consume to initiate a handshake.
#[derive(Debug, Clone)]
pub struct PublicBundle {
    pub id_ed_pub: [u8; 32],
    pub id_x_pub: [u8; 32],
    pub spk_pub: [u8; 32],
    pub spk_signature: [u8; 64],
    pub ephemeral_pub: Option<[u8; 32]>,
    pub opks: Vec<OpkPublic>,
}

impl PublicBundle {
    pub fn opk(&self, id: u32) -> Option<&OpkPublic> {
        self.opks.iter().find(|o| o.id == id)
    }

    /// Verify the signed pre-key signature under the bundle's identity key.
    pub fn verify_spk(&self) -> Result<(), CryptoFailure> {
        primitives::ed25519_verify(&self.id_ed_pub, &self.spk_pub, &self.spk_signature)
    }

    /// Hex fingerprint of the identity key, grouped for manual comparison.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(self.id_ed_pub);
        let hex = hex::encode(&digest[..20]);
        hex.as_bytes()
            .chunks(4)
            .map(|c| std::str::from_utf8(c).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ── Store ────────────────────────────────────────────────────────────────────

struct SignedPreKeyMaterial {
    public: [u8; 32],
    secret: SecretBuf,
    signature: [u8; 64],
}

struct OneTimePreKey {
    public: [u8; 32],
    secret: SecretBuf,
}

struct Inner {
    id_ed_public: [u8; 32],
    id_ed_secret: SecretBuf,
    id_x_public: [u8; 32],
    id_x_secret: SecretBuf,
    spk: SignedPreKeyMaterial,
    opks: BTreeMap<u32, OneTimePreKey>,
    next_opk_id: u32,
}

pub struct IdentityKeyStore {
    inner: Mutex<Inner>,
}

fn keygen_failure(err: impl std::fmt::Display) -> CoreError {
    CoreError::Crypto(CryptoFailure::new(
        CryptoFailureKind::RngFailed,
        format!("key generation failed: {err}"),
    ))
}

fn x25519_pair_locked() -> CoreResult<(SecretBuf, [u8; 32])> {
    let (secret, public) = primitives::x25519_keygen();
    let locked = SecretBuf::from_bytes(secret.as_bytes()).map_err(keygen_failure)?;
    Ok((locked, *public.as_bytes()))
}

fn static_secret_from(buf: &SecretBuf) -> CoreResult<StaticSecret> {
    let mut bytes = Zeroizing::new([0u8; 32]);
    buf.read_into(&mut *bytes)?;
    Ok(StaticSecret::from(*bytes))
}

impl IdentityKeyStore {
    /// Generate fresh identity material with `opk_count` one-time pre-keys.
    pub fn create(opk_count: usize) -> CoreResult<Self> {
        if opk_count > MAX_OPK_COUNT {
            return Err(CoreError::InvalidInput(format!(
                "one-time pre-key count {opk_count} exceeds the {MAX_OPK_COUNT} cap"
            )));
        }

        let ed = primitives::ed25519_keygen();
        let id_ed_public = ed.verifying_key().to_bytes();
        let id_ed_secret = SecretBuf::from_bytes(&ed.to_bytes()).map_err(keygen_failure)?;

        let (id_x_secret, id_x_public) = x25519_pair_locked()?;

        let (spk_secret, spk_public) = x25519_pair_locked()?;
        let signature = {
            let mut ed_bytes = Zeroizing::new([0u8; 32]);
            id_ed_secret.read_into(&mut *ed_bytes)?;
            primitives::ed25519_sign(&ed_bytes, &spk_public)
        };

        let mut inner = Inner {
            id_ed_public,
            id_ed_secret,
            id_x_public,
            id_x_secret,
            spk: SignedPreKeyMaterial {
                public: spk_public,
                secret: spk_secret,
                signature,
            },
            opks: BTreeMap::new(),
            next_opk_id: 0,
        };
        mint_into(&mut inner, opk_count)?;

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// A fresh snapshot of the public material, all stored one-time pre-keys
    /// included.
    pub fn bundle(&self) -> PublicBundle {
        let inner = self.inner.lock();
        PublicBundle {
            id_ed_pub: inner.id_ed_public,
            id_x_pub: inner.id_x_public,
            spk_pub: inner.spk.public,
            spk_signature: inner.spk.signature,
            ephemeral_pub: None,
            opks: inner
                .opks
                .iter()
                .map(|(id, opk)| OpkPublic {
                    id: *id,
                    public: opk.public,
                })
                .collect(),
        }
    }

    pub fn id_ed_public(&self) -> [u8; 32] {
        self.inner.lock().id_ed_public
    }

    pub fn id_x_public(&self) -> [u8; 32] {
        self.inner.lock().id_x_public
    }

    pub fn spk_public(&self) -> [u8; 32] {
        self.inner.lock().spk.public
    }

    /// Remove and return the one-time pre-key secret for `id`. Single-use:
    /// a second call with the same id reports the key as unknown.
    pub fn consume_opk(&self, id: u32) -> CoreResult<StaticSecret> {
        let mut inner = self.inner.lock();
        let opk = inner
            .opks
            .remove(&id)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown one-time pre-key id {id}")))?;
        static_secret_from(&opk.secret)
    }

    /// Rotate the signed pre-key: new X25519 pair, re-signed under the
    /// identity key. The previous pre-key is wiped.
    pub fn reissue_signed_prekey(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        let (secret, public) = x25519_pair_locked()?;
        let signature = {
            let mut ed_bytes = Zeroizing::new([0u8; 32]);
            inner.id_ed_secret.read_into(&mut *ed_bytes)?;
            primitives::ed25519_sign(&ed_bytes, &public)
        };
        inner.spk = SignedPreKeyMaterial {
            public,
            secret,
            signature,
        };
        Ok(())
    }

    /// Top up the one-time pre-key pool. Returns the new ids.
    pub fn mint_opks(&self, count: usize) -> CoreResult<Vec<u32>> {
        let mut inner = self.inner.lock();
        if inner.opks.len() + count > MAX_OPK_COUNT {
            return Err(CoreError::InvalidInput(format!(
                "minting {count} one-time pre-keys would exceed the {MAX_OPK_COUNT} cap"
            )));
        }
        let first = inner.next_opk_id;
        mint_into(&mut inner, count)?;
        Ok((first..first + count as u32).collect())
    }

    pub fn opk_count(&self) -> usize {
        self.inner.lock().opks.len()
    }

    pub(crate) fn id_x_secret(&self) -> CoreResult<StaticSecret> {
        static_secret_from(&self.inner.lock().id_x_secret)
    }

    pub(crate) fn spk_secret(&self) -> CoreResult<StaticSecret> {
        static_secret_from(&self.inner.lock().spk.secret)
    }

    // ── Persistence ──────────────────────────────────────────────────────

    pub fn to_persisted(&self) -> CoreResult<Vec<u8>> {
        let inner = self.inner.lock();

        let mut buf32 = Zeroizing::new([0u8; 32]);

        inner.id_ed_secret.read_into(&mut *buf32)?;
        let id_ed_secret = ByteBuf::from(buf32.to_vec());
        inner.id_x_secret.read_into(&mut *buf32)?;
        let id_x_secret = ByteBuf::from(buf32.to_vec());
        inner.spk.secret.read_into(&mut *buf32)?;
        let spk_secret = ByteBuf::from(buf32.to_vec());

        let mut opks = Vec::with_capacity(inner.opks.len());
        for (id, opk) in &inner.opks {
            opk.secret.read_into(&mut *buf32)?;
            opks.push(PersistedOpk {
                id: *id,
                public: ByteBuf::from(opk.public.to_vec()),
                secret: ByteBuf::from(buf32.to_vec()),
            });
        }

        let persisted = PersistedIdentity {
            version: IDENTITY_STATE_VERSION,
            id_ed_public: ByteBuf::from(inner.id_ed_public.to_vec()),
            id_ed_secret,
            id_x_public: ByteBuf::from(inner.id_x_public.to_vec()),
            id_x_secret,
            spk_public: ByteBuf::from(inner.spk.public.to_vec()),
            spk_secret,
            spk_signature: ByteBuf::from(inner.spk.signature.to_vec()),
            next_opk_id: inner.next_opk_id,
            opks,
        };

        serde_json::to_vec(&persisted).map_err(|e| CoreError::InvalidInput(e.to_string()))
    }

    pub fn from_persisted(bytes: &[u8]) -> CoreResult<Self> {
        let persisted: PersistedIdentity = serde_json::from_slice(bytes)
            .map_err(|e| CoreError::InvalidInput(format!("identity state: {e}")))?;
        if persisted.version != IDENTITY_STATE_VERSION {
            return Err(CoreError::Storage(StorageFailure::UnsupportedVersion(
                persisted.version,
            )));
        }

        let id_ed_public = fixed::<32>("id_ed_public", &persisted.id_ed_public)?;
        let id_x_public = fixed::<32>("id_x_public", &persisted.id_x_public)?;
        let spk_public = fixed::<32>("spk_public", &persisted.spk_public)?;
        let spk_signature = fixed::<64>("spk_signature", &persisted.spk_signature)?;

        // Invariant: the stored pre-key signature must verify under the
        // stored identity key.
        primitives::ed25519_verify(&id_ed_public, &spk_public, &spk_signature)?;

        let mut opks = BTreeMap::new();
        for opk in &persisted.opks {
            let public = fixed::<32>("opk public", &opk.public)?;
            let secret = locked_fixed::<32>("opk secret", &opk.secret)?;
            if opks.insert(opk.id, OneTimePreKey { public, secret }).is_some() {
                return Err(CoreError::InvalidInput(format!(
                    "duplicate one-time pre-key id {}",
                    opk.id
                )));
            }
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                id_ed_public,
                id_ed_secret: locked_fixed::<32>("id_ed_secret", &persisted.id_ed_secret)?,
                id_x_public,
                id_x_secret: locked_fixed::<32>("id_x_secret", &persisted.id_x_secret)?,
                spk: SignedPreKeyMaterial {
                    public: spk_public,
                    secret: locked_fixed::<32>("spk_secret", &persisted.spk_secret)?,
                    signature: spk_signature,
                },
                opks,
                next_opk_id: persisted.next_opk_id,
            }),
        })
    }
}

fn mint_into(inner: &mut Inner, count: usize) -> CoreResult<()> {
    for _ in 0..count {
        let (secret, public) = x25519_pair_locked()?;
        let id = inner.next_opk_id;
        inner.next_opk_id = inner.next_opk_id.wrapping_add(1);
        inner.opks.insert(id, OneTimePreKey { public, secret });
    }
    Ok(())
}

fn fixed<const N: usize>(field: &str, bytes: &[u8]) -> CoreResult<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| CoreError::InvalidInput(format!("{field} must be {N} bytes, got {}", bytes.len())))
}

fn locked_fixed<const N: usize>(field: &str, bytes: &[u8]) -> CoreResult<SecretBuf> {
    if bytes.len() != N {
        return Err(CoreError::InvalidInput(format!(
            "{field} must be {N} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(SecretBuf::from_bytes(bytes)?)
}

// ── Persisted form ───────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PersistedOpk {
    id: u32,
    public: ByteBuf,
    secret: ByteBuf,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PersistedIdentity {
    version: u32,
    id_ed_public: ByteBuf,
    id_ed_secret: ByteBuf,
    id_x_public: ByteBuf,
    id_x_secret: ByteBuf,
    spk_public: ByteBuf,
    spk_secret: ByteBuf,
    spk_signature: ByteBuf,
    next_opk_id: u32,
    opks: Vec<PersistedOpk>,
}
