//! Thin wrappers over the cryptographic primitives the engine uses.
//!
//! Everything here is deterministic given its inputs except the CSPRNG.
//! No wrapper logs, and no wrapper leaves secret bytes in a buffer it
//! allocated: intermediate key material is `Zeroizing` and wiped on return.
//!
//! X25519 public keys are checked against the known low-order point
//! encodings and the all-zero shared secret before any result is used.

use aes_gcm::{
    aead::{generic_array::GenericArray, AeadInPlace, KeyInit},
    Aes256Gcm,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{CryptoFailure, CryptoFailureKind};

pub const X25519_KEY_LEN: usize = 32;
pub const ED25519_SIG_LEN: usize = 64;
pub const AES_GCM_NONCE_LEN: usize = 12;
pub const AES_GCM_TAG_LEN: usize = 16;
pub const HMAC_SHA512_LEN: usize = 64;

// ── Randomness ───────────────────────────────────────────────────────────────

pub fn random(n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    OsRng.fill_bytes(&mut out);
    out
}

pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

// ── X25519 ───────────────────────────────────────────────────────────────────

/// The canonical low-order point encodings on Curve25519 (high bit masked).
/// A peer offering any of these is attempting a contributory-behaviour
/// bypass; the exchange is rejected before any key material is derived.
const LOW_ORDER_POINTS: [[u8; 32]; 7] = [
    // 0 (neutral element family)
    [
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00,
    ],
    // 1
    [
        0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00,
    ],
    // point of order 8
    [
        0xe0, 0xeb, 0x7a, 0x7c, 0x3b, 0x41, 0xb8, 0xae, 0x16, 0x56, 0xe3, 0xfa, 0xf1, 0x9f, 0xc4,
        0x6a, 0xda, 0x09, 0x8d, 0xeb, 0x9c, 0x32, 0xb1, 0xfd, 0x86, 0x62, 0x05, 0x16, 0x5f, 0x49,
        0xb8, 0x00,
    ],
    // point of order 8
    [
        0x5f, 0x9c, 0x95, 0xbc, 0xa3, 0x50, 0x8c, 0x24, 0xb1, 0xd0, 0xb1, 0x55, 0x9c, 0x83, 0xef,
        0x5b, 0x04, 0x44, 0x5c, 0xc4, 0x58, 0x1c, 0x8e, 0x86, 0xd8, 0x22, 0x4e, 0xdd, 0xd0, 0x9f,
        0x11, 0x57,
    ],
    // p - 1
    [
        0xec, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // p
    [
        0xed, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // p + 1
    [
        0xee, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
];

/// Reject low-order public keys. X25519 ignores the top bit, so the check
/// compares against the masked encoding.
pub fn reject_low_order(public: &[u8; 32]) -> Result<(), CryptoFailure> {
    let mut masked = *public;
    masked[31] &= 0x7f;
    let mut hit = 0u8;
    for point in &LOW_ORDER_POINTS {
        hit |= masked.ct_eq(point).unwrap_u8();
    }
    if hit != 0 {
        return Err(CryptoFailure::new(
            CryptoFailureKind::InvalidSignature,
            "low-order X25519 public key",
        ));
    }
    Ok(())
}

pub fn x25519_keygen() -> (StaticSecret, X25519Public) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    (secret, public)
}

/// Diffie-Hellman with contributory-behaviour enforcement.
pub fn x25519(
    secret: &StaticSecret,
    peer_public: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>, CryptoFailure> {
    reject_low_order(peer_public)?;
    let shared = secret.diffie_hellman(&X25519Public::from(*peer_public));
    if !shared.was_contributory() {
        return Err(CryptoFailure::new(
            CryptoFailureKind::InvalidSignature,
            "non-contributory X25519 exchange",
        ));
    }
    Ok(Zeroizing::new(*shared.as_bytes()))
}

// ── Ed25519 ──────────────────────────────────────────────────────────────────

pub fn ed25519_keygen() -> ed25519_dalek::SigningKey {
    ed25519_dalek::SigningKey::generate(&mut OsRng)
}

pub fn ed25519_sign(secret: &[u8; 32], msg: &[u8]) -> [u8; 64] {
    use ed25519_dalek::Signer;
    ed25519_dalek::SigningKey::from_bytes(secret)
        .sign(msg)
        .to_bytes()
}

pub fn ed25519_verify(public: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> Result<(), CryptoFailure> {
    let vk = ed25519_dalek::VerifyingKey::from_bytes(public).map_err(|e| {
        CryptoFailure::new(CryptoFailureKind::InvalidKeyLength, e.to_string())
    })?;
    let sig = ed25519_dalek::Signature::from_bytes(sig);
    vk.verify_strict(msg, &sig).map_err(|_| {
        CryptoFailure::new(CryptoFailureKind::InvalidSignature, "Ed25519 verify failed")
    })
}

// ── HKDF-SHA256 ──────────────────────────────────────────────────────────────

pub fn hkdf_expand(
    salt: Option<&[u8]>,
    ikm: &[u8],
    info: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoFailure> {
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, out)
        .map_err(|e| CryptoFailure::new(CryptoFailureKind::KdfFailed, e.to_string()))
}

// ── AES-256-GCM ──────────────────────────────────────────────────────────────

/// Encrypt in place conceptually; returns (ciphertext, detached 16-byte tag).
pub fn aes_gcm_encrypt(
    key: &[u8; 32],
    nonce: &[u8; AES_GCM_NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; AES_GCM_TAG_LEN]), CryptoFailure> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoFailure::new(CryptoFailureKind::InvalidKeyLength, e.to_string()))?;
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, &mut buffer)
        .map_err(|_| CryptoFailure::new(CryptoFailureKind::KdfFailed, "AES-GCM encrypt failed"))?;
    Ok((buffer, tag.into()))
}

pub fn aes_gcm_decrypt(
    key: &[u8; 32],
    nonce: &[u8; AES_GCM_NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; AES_GCM_TAG_LEN],
) -> Result<Zeroizing<Vec<u8>>, CryptoFailure> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoFailure::new(CryptoFailureKind::InvalidKeyLength, e.to_string()))?;
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            &mut buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| {
            CryptoFailure::new(CryptoFailureKind::AuthTagMismatch, "AES-GCM tag mismatch")
        })?;
    Ok(Zeroizing::new(buffer))
}

// ── HMAC-SHA512 ──────────────────────────────────────────────────────────────

pub fn hmac_sha512(key: &[u8], data: &[u8]) -> Result<[u8; HMAC_SHA512_LEN], CryptoFailure> {
    let mut mac = <Hmac<Sha512> as hmac::Mac>::new_from_slice(key)
        .map_err(|e| CryptoFailure::new(CryptoFailureKind::InvalidKeyLength, e.to_string()))?;
    mac.update(data);
    let mut out = [0u8; HMAC_SHA512_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Constant-time equality. Differing lengths compare unequal without
/// inspecting content.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

// ── Argon2id ─────────────────────────────────────────────────────────────────

/// Argon2id cost parameters. The defaults are the engine-wide policy;
/// overrides are clamped into the documented bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2idParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Argon2idParams {
    pub const MIN_MEMORY_KIB: u32 = 19_456;
    pub const MAX_MEMORY_KIB: u32 = 1_048_576;
    pub const MIN_ITERATIONS: u32 = 2;
    pub const MAX_ITERATIONS: u32 = 10;
    pub const MIN_PARALLELISM: u32 = 1;
    pub const MAX_PARALLELISM: u32 = 8;

    pub fn clamped(self) -> Self {
        Self {
            memory_kib: self
                .memory_kib
                .clamp(Self::MIN_MEMORY_KIB, Self::MAX_MEMORY_KIB),
            iterations: self
                .iterations
                .clamp(Self::MIN_ITERATIONS, Self::MAX_ITERATIONS),
            parallelism: self
                .parallelism
                .clamp(Self::MIN_PARALLELISM, Self::MAX_PARALLELISM),
        }
    }
}

impl Default for Argon2idParams {
    fn default() -> Self {
        Self {
            memory_kib: 65_536,
            iterations: 4,
            parallelism: 2,
        }
    }
}

/// Derive `len` bytes from `password` and `salt`. `associated_data` binds
/// the derivation to a context (the device id); it is hashed to the 32-byte
/// cap Argon2 places on associated data.
pub fn argon2id(
    password: &[u8],
    salt: &[u8],
    params: Argon2idParams,
    associated_data: &[u8],
    len: usize,
) -> Result<Zeroizing<Vec<u8>>, CryptoFailure> {
    use argon2::{Algorithm, Argon2, AssociatedData, ParamsBuilder, Version};
    use sha2::Digest;

    let params = params.clamped();
    let mut builder = ParamsBuilder::new();
    builder
        .m_cost(params.memory_kib)
        .t_cost(params.iterations)
        .p_cost(params.parallelism)
        .output_len(len);
    if !associated_data.is_empty() {
        let digest = Sha256::digest(associated_data);
        let ad = AssociatedData::new(&digest)
            .map_err(|e| CryptoFailure::new(CryptoFailureKind::KdfFailed, e.to_string()))?;
        builder.data(ad);
    }
    let built = builder
        .build()
        .map_err(|e| CryptoFailure::new(CryptoFailureKind::KdfFailed, e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, built);

    let mut out = Zeroizing::new(vec![0u8; len]);
    argon
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| CryptoFailure::new(CryptoFailureKind::KdfFailed, e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x25519_exchange_is_symmetric() {
        let (a_sk, a_pk) = x25519_keygen();
        let (b_sk, b_pk) = x25519_keygen();
        let ab = x25519(&a_sk, b_pk.as_bytes()).unwrap();
        let ba = x25519(&b_sk, a_pk.as_bytes()).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn low_order_points_rejected() {
        let (sk, _) = x25519_keygen();
        for point in &LOW_ORDER_POINTS {
            let err = x25519(&sk, point).unwrap_err();
            assert_eq!(err.kind, CryptoFailureKind::InvalidSignature);
        }
        // High-bit variants are the same points on the wire.
        let mut with_high_bit = LOW_ORDER_POINTS[1];
        with_high_bit[31] |= 0x80;
        assert!(x25519(&sk, &with_high_bit).is_err());
    }

    #[test]
    fn ed25519_sign_verify_roundtrip() {
        let sk = ed25519_keygen();
        let public = sk.verifying_key().to_bytes();
        let sig = ed25519_sign(&sk.to_bytes(), b"bundle");
        ed25519_verify(&public, b"bundle", &sig).unwrap();
        assert!(ed25519_verify(&public, b"tampered", &sig).is_err());
    }

    #[test]
    fn aes_gcm_detached_roundtrip_and_tamper() {
        let key = random_array::<32>();
        let nonce = random_array::<12>();
        let (ct, tag) = aes_gcm_encrypt(&key, &nonce, b"aad", b"payload").unwrap();
        let pt = aes_gcm_decrypt(&key, &nonce, b"aad", &ct, &tag).unwrap();
        assert_eq!(&pt[..], b"payload");

        let mut bad = ct.clone();
        bad[0] ^= 1;
        let err = aes_gcm_decrypt(&key, &nonce, b"aad", &bad, &tag).unwrap_err();
        assert_eq!(err.kind, CryptoFailureKind::AuthTagMismatch);

        let err = aes_gcm_decrypt(&key, &nonce, b"other aad", &ct, &tag).unwrap_err();
        assert_eq!(err.kind, CryptoFailureKind::AuthTagMismatch);
    }

    #[test]
    fn ct_eq_handles_length_mismatch() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"abcd"));
    }

    #[test]
    fn argon2id_params_clamp() {
        let params = Argon2idParams {
            memory_kib: 1,
            iterations: 100,
            parallelism: 0,
        }
        .clamped();
        assert_eq!(params.memory_kib, Argon2idParams::MIN_MEMORY_KIB);
        assert_eq!(params.iterations, Argon2idParams::MAX_ITERATIONS);
        assert_eq!(params.parallelism, Argon2idParams::MIN_PARALLELISM);
    }

    #[test]
    fn argon2id_binds_associated_data() {
        let fast = Argon2idParams {
            memory_kib: Argon2idParams::MIN_MEMORY_KIB,
            iterations: 2,
            parallelism: 1,
        };
        let a = argon2id(b"pw", &[7u8; 32], fast, b"device-a", 32).unwrap();
        let b = argon2id(b"pw", &[7u8; 32], fast, b"device-b", 32).unwrap();
        let a2 = argon2id(b"pw", &[7u8; 32], fast, b"device-a", 32).unwrap();
        assert_ne!(*a, *b);
        assert_eq!(*a, *a2);
    }
}
