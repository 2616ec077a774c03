//! Tamper-evident on-disk state container.
//!
//! Layout, all multi-byte integers little-endian:
//!
//! ```text
//! magic "ECLIPTIX_SECURE_V1" | version u32
//! | salt_len u32  | salt (32)
//! | nonce_len u32 | nonce (12)
//! | tag_len u32   | gcm_tag (16)
//! | ad_len u32    | associated_data
//! | ct_len u32    | ciphertext
//! |-- outer HMAC-SHA-512 (64) over every byte above --|
//! ```
//!
//! `associated_data = version_u32 || membership_id || device_id` binds the
//! file to an installation. The AEAD key is Argon2id over the membership id
//! (device id as Argon2 associated data); the outer HMAC key lives in the
//! OS keychain, so a copied file fails integrity on another machine before
//! anything is decrypted.
//!
//! Writes go to `<path>.tmp.<uuid>`, fsync, then an atomic rename: a crash
//! before the rename leaves the previous file intact, a crash between the
//! rename and the keychain write leaves a file that is still decryptable by
//! re-deriving the key.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ecx_crypto::primitives::{self, Argon2idParams};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use zeroize::Zeroizing;

use crate::cancel::CancelToken;
use crate::error::StoreError;
use crate::keychain::{session_key_id, SecurityProvider};

pub const CONTAINER_MAGIC: &[u8] = b"ECLIPTIX_SECURE_V1";
pub const CONTAINER_VERSION: u32 = 1;

const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HMAC_LEN: usize = 64;

const DELETE_ATTEMPTS: u32 = 3;
const DELETE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Identifies whose state a container holds.
#[derive(Debug, Clone)]
pub struct StateBinding {
    pub connect_id: String,
    pub membership_id: Vec<u8>,
    pub device_id: Vec<u8>,
}

#[derive(Clone)]
pub struct StateContainer {
    path: PathBuf,
    provider: Arc<dyn SecurityProvider>,
    params: Argon2idParams,
}

impl StateContainer {
    pub fn new(path: impl Into<PathBuf>, provider: Arc<dyn SecurityProvider>) -> Self {
        Self {
            path: path.into(),
            provider,
            params: Argon2idParams::default(),
        }
    }

    pub fn with_params(mut self, params: Argon2idParams) -> Self {
        self.params = params.clamped();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    // ── Async surface ────────────────────────────────────────────────────

    pub async fn save_state(
        &self,
        plaintext: Zeroizing<Vec<u8>>,
        binding: &StateBinding,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        cancel.check()?;
        let this = self.clone();
        let binding = binding.clone();
        let cancel = cancel.clone();
        spawn_blocking(move || this.save_blocking(&plaintext, &binding, &cancel)).await
    }

    pub async fn load_state(
        &self,
        binding: &StateBinding,
        cancel: &CancelToken,
    ) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        cancel.check()?;
        let this = self.clone();
        let binding = binding.clone();
        let cancel = cancel.clone();
        spawn_blocking(move || this.load_blocking(&binding, &cancel)).await
    }

    pub async fn delete_state(&self, connect_id: &str) -> Result<(), StoreError> {
        let this = self.clone();
        let connect_id = connect_id.to_string();
        spawn_blocking(move || this.delete_blocking(&connect_id)).await
    }

    // ── Write path ───────────────────────────────────────────────────────

    fn save_blocking(
        &self,
        plaintext: &[u8],
        binding: &StateBinding,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        self.save_with_password(plaintext, &binding.membership_id, binding, cancel)
    }

    fn save_with_password(
        &self,
        plaintext: &[u8],
        password: &[u8],
        binding: &StateBinding,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        let salt = self.provider.random(SALT_LEN);
        let enc_key = self.derive_key(password, &salt, &binding.device_id)?;
        cancel.check()?;

        let nonce_vec = self.provider.random(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = as_fixed("nonce", &nonce_vec)?;
        let ad = associated_data(&binding.membership_id, &binding.device_id);
        let (ciphertext, tag) =
            primitives::aes_gcm_encrypt(&enc_key, &nonce, &ad, plaintext)?;

        let mut body =
            Vec::with_capacity(CONTAINER_MAGIC.len() + 4 * 6 + SALT_LEN + NONCE_LEN + TAG_LEN + ad.len() + ciphertext.len());
        body.extend_from_slice(CONTAINER_MAGIC);
        body.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
        put_field(&mut body, &salt);
        put_field(&mut body, &nonce);
        put_field(&mut body, &tag);
        put_field(&mut body, &ad);
        put_field(&mut body, &ciphertext);

        let hmac_key = self.provider.get_or_create_hmac_key()?;
        let mac = primitives::hmac_sha512(&hmac_key, &body)?;
        body.extend_from_slice(&mac);

        cancel.check()?;
        atomic_write(&self.path, &body)?;

        self.provider
            .store_key(&session_key_id(&binding.connect_id), &enc_key[..])?;
        tracing::debug!(path = %self.path.display(), bytes = body.len(), "state saved");
        Ok(())
    }

    // ── Read path ────────────────────────────────────────────────────────

    fn load_blocking(
        &self,
        binding: &StateBinding,
        cancel: &CancelToken,
    ) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        let bytes = fs::read(&self.path)?;
        if bytes.len() <= HMAC_LEN {
            return Err(StoreError::InvalidContainer(
                "shorter than the integrity trailer".into(),
            ));
        }

        // Integrity first; a tampered file is never parsed further, let
        // alone decrypted.
        let (body, mac) = bytes.split_at(bytes.len() - HMAC_LEN);
        let hmac_key = self.provider.get_or_create_hmac_key()?;
        let expected_mac = primitives::hmac_sha512(&hmac_key, body)?;
        if !primitives::ct_eq(mac, &expected_mac) {
            return Err(StoreError::TamperedStateDetected);
        }

        let parsed = parse_body(body)?;
        let expected_ad = associated_data(&binding.membership_id, &binding.device_id);
        if !primitives::ct_eq(&parsed.ad, &expected_ad) {
            return Err(StoreError::AssociatedDataMismatch);
        }
        cancel.check()?;

        // Key retrieval: keychain first, Argon2 re-derivation on a miss.
        // A malformed keychain entry counts as a miss, not a hard failure.
        let keychain_key = self
            .provider
            .load_key(&session_key_id(&binding.connect_id))?
            .and_then(|k| as_fixed_zeroizing("keychain key", &k).ok());

        let mut last_err = None;
        if let Some(key) = keychain_key {
            match primitives::aes_gcm_decrypt(&key, &parsed.nonce, &parsed.ad, &parsed.ciphertext, &parsed.tag)
            {
                Ok(pt) => return Ok(pt),
                Err(e) => last_err = Some(e),
            }
        }

        let derived = self.derive_key(&binding.membership_id, &parsed.salt, &binding.device_id)?;
        match primitives::aes_gcm_decrypt(
            &derived,
            &parsed.nonce,
            &parsed.ad,
            &parsed.ciphertext,
            &parsed.tag,
        ) {
            Ok(pt) => return Ok(pt),
            Err(e) => last_err = Some(e),
        }

        // One legacy attempt: early installs derived the key from the
        // connect id. On success the container is rewritten with the
        // current derivation immediately.
        cancel.check()?;
        let legacy =
            self.derive_key(binding.connect_id.as_bytes(), &parsed.salt, &binding.device_id)?;
        if let Ok(pt) = primitives::aes_gcm_decrypt(
            &legacy,
            &parsed.nonce,
            &parsed.ad,
            &parsed.ciphertext,
            &parsed.tag,
        ) {
            tracing::warn!(
                path = %self.path.display(),
                "legacy key derivation detected; migrating container"
            );
            self.save_blocking(&pt, binding, cancel)?;
            return Ok(pt);
        }

        Err(last_err
            .map(StoreError::Crypto)
            .unwrap_or_else(|| StoreError::InvalidContainer("no usable key".into())))
    }

    // ── Delete path ──────────────────────────────────────────────────────

    fn delete_blocking(&self, connect_id: &str) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            match fs::remove_file(&self.path) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => {
                    attempt += 1;
                    if attempt >= DELETE_ATTEMPTS {
                        return Err(e.into());
                    }
                    std::thread::sleep(DELETE_RETRY_DELAY);
                }
            }
        }
        self.provider.delete_key(&session_key_id(connect_id))
    }

    fn derive_key(
        &self,
        password: &[u8],
        salt: &[u8],
        device_id: &[u8],
    ) -> Result<Zeroizing<[u8; 32]>, StoreError> {
        let okm = primitives::argon2id(password, salt, self.params, device_id, 32)?;
        as_fixed_zeroizing("derived key", &okm)
    }

    /// Legacy-derivation writer, kept for migration tests.
    #[cfg(test)]
    fn save_with_legacy_key(
        &self,
        plaintext: &[u8],
        binding: &StateBinding,
    ) -> Result<(), StoreError> {
        self.save_with_password(
            plaintext,
            binding.connect_id.as_bytes(),
            binding,
            &CancelToken::new(),
        )
    }
}

async fn spawn_blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, StoreError> + Send + 'static,
) -> Result<T, StoreError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::InvalidContainer(format!("blocking task failed: {e}")))?
}

fn associated_data(membership_id: &[u8], device_id: &[u8]) -> Vec<u8> {
    let mut ad = Vec::with_capacity(4 + membership_id.len() + device_id.len());
    ad.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
    ad.extend_from_slice(membership_id);
    ad.extend_from_slice(device_id);
    ad
}

fn put_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u32).to_le_bytes());
    out.extend_from_slice(field);
}

fn as_fixed<const N: usize>(field: &str, bytes: &[u8]) -> Result<[u8; N], StoreError> {
    bytes
        .try_into()
        .map_err(|_| StoreError::InvalidContainer(format!("{field} must be {N} bytes")))
}

fn as_fixed_zeroizing<const N: usize>(
    field: &str,
    bytes: &[u8],
) -> Result<Zeroizing<[u8; N]>, StoreError> {
    Ok(Zeroizing::new(as_fixed::<N>(field, bytes)?))
}

// ── Body parsing ─────────────────────────────────────────────────────────────

struct ParsedBody {
    salt: Vec<u8>,
    nonce: [u8; NONCE_LEN],
    tag: [u8; TAG_LEN],
    ad: Vec<u8>,
    ciphertext: Vec<u8>,
}

struct BodyReader<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], StoreError> {
        if self.body.len() - self.pos < n {
            return Err(StoreError::InvalidContainer(format!(
                "truncated at offset {}",
                self.pos
            )));
        }
        let out = &self.body[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_u32(&mut self) -> Result<u32, StoreError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn take_field(&mut self, expected: Option<usize>) -> Result<Vec<u8>, StoreError> {
        let len = self.take_u32()? as usize;
        if let Some(expected) = expected {
            if len != expected {
                return Err(StoreError::InvalidContainer(format!(
                    "field length {len}, expected {expected}"
                )));
            }
        }
        Ok(self.take(len)?.to_vec())
    }
}

fn parse_body(body: &[u8]) -> Result<ParsedBody, StoreError> {
    let mut r = BodyReader { body, pos: 0 };

    if r.take(CONTAINER_MAGIC.len())? != CONTAINER_MAGIC {
        return Err(StoreError::InvalidContainer("bad magic".into()));
    }
    let version = r.take_u32()?;
    if version != CONTAINER_VERSION {
        return Err(StoreError::UnsupportedVersion(version));
    }

    let salt = r.take_field(Some(SALT_LEN))?;
    let nonce = as_fixed::<NONCE_LEN>("nonce", &r.take_field(Some(NONCE_LEN))?)?;
    let tag = as_fixed::<TAG_LEN>("tag", &r.take_field(Some(TAG_LEN))?)?;
    let ad = r.take_field(None)?;
    let ciphertext = r.take_field(None)?;

    if r.pos != body.len() {
        return Err(StoreError::InvalidContainer(format!(
            "{} trailing bytes",
            body.len() - r.pos
        )));
    }

    Ok(ParsedBody {
        salt,
        nonce,
        tag,
        ad,
        ciphertext,
    })
}

// ── Atomic write ─────────────────────────────────────────────────────────────

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(&parent)?;
    }

    let tmp = path.with_file_name(format!(
        "{}.tmp.{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".into()),
        uuid::Uuid::new_v4()
    ));

    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        if !parent.as_os_str().is_empty() {
            fs::set_permissions(&parent, fs::Permissions::from_mode(0o700))?;
        }
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    #[cfg(unix)]
    if !parent.as_os_str().is_empty() {
        if let Ok(dir) = fs::File::open(&parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

// ── Timestamped payload ──────────────────────────────────────────────────────

/// What actually goes into the container as plaintext: the serialized state
/// plus the instant it was recorded, which the restoration planner uses for
/// its staleness check.
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StampedState {
    pub saved_at: DateTime<Utc>,
    pub state: ByteBuf,
}

impl StampedState {
    pub fn now(state: &[u8]) -> Self {
        Self {
            saved_at: Utc::now(),
            state: ByteBuf::from(state.to_vec()),
        }
    }

    pub fn encode(&self) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        Ok(Zeroizing::new(serde_json::to_vec(self).map_err(|e| {
            StoreError::InvalidContainer(format!("stamp encode: {e}"))
        })?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes)
            .map_err(|e| StoreError::InvalidContainer(format!("stamp decode: {e}")))
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.saved_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::MemoryProvider;
    use ecx_crypto::CryptoFailureKind;
    use tempfile::tempdir;

    fn fast_params() -> Argon2idParams {
        Argon2idParams {
            memory_kib: Argon2idParams::MIN_MEMORY_KIB,
            iterations: 2,
            parallelism: 1,
        }
    }

    fn setup(dir: &Path) -> (StateContainer, StateBinding, Arc<MemoryProvider>) {
        let provider = Arc::new(MemoryProvider::new());
        let container = StateContainer::new(dir.join("session.ecx"), provider.clone())
            .with_params(fast_params());
        let binding = StateBinding {
            connect_id: "conn-1".into(),
            membership_id: b"membership-aaaa".to_vec(),
            device_id: b"device-zzzz".to_vec(),
        };
        (container, binding, provider)
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let (container, binding, provider) = setup(dir.path());
        let cancel = CancelToken::new();

        container
            .save_state(Zeroizing::new(b"session state".to_vec()), &binding, &cancel)
            .await
            .unwrap();
        assert!(container.exists());
        assert!(provider.contains(&session_key_id("conn-1")));

        let loaded = container.load_state(&binding, &cancel).await.unwrap();
        assert_eq!(&loaded[..], b"session state");
    }

    #[tokio::test]
    async fn every_bit_flip_is_detected() {
        let dir = tempdir().unwrap();
        let (container, binding, _provider) = setup(dir.path());
        let cancel = CancelToken::new();

        container
            .save_state(Zeroizing::new(b"guarded".to_vec()), &binding, &cancel)
            .await
            .unwrap();
        let original = fs::read(container.path()).unwrap();

        // A sweep across the file, one flipped bit per position sampled.
        for offset in (0..original.len()).step_by(7) {
            let mut damaged = original.clone();
            damaged[offset] ^= 0x01;
            fs::write(container.path(), &damaged).unwrap();

            let err = container.load_state(&binding, &cancel).await.unwrap_err();
            assert!(
                matches!(err, StoreError::TamperedStateDetected),
                "offset {offset}: {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn wrong_binding_is_ad_mismatch() {
        let dir = tempdir().unwrap();
        let (container, binding, _provider) = setup(dir.path());
        let cancel = CancelToken::new();

        container
            .save_state(Zeroizing::new(b"bound".to_vec()), &binding, &cancel)
            .await
            .unwrap();

        let other = StateBinding {
            membership_id: b"membership-bbbb".to_vec(),
            ..binding.clone()
        };
        let err = container.load_state(&other, &cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::AssociatedDataMismatch));

        let other_device = StateBinding {
            device_id: b"device-elsewhere".to_vec(),
            ..binding
        };
        let err = container
            .load_state(&other_device, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AssociatedDataMismatch));
    }

    #[tokio::test]
    async fn version_bump_is_rejected() {
        let dir = tempdir().unwrap();
        let (container, binding, provider) = setup(dir.path());
        let cancel = CancelToken::new();

        container
            .save_state(Zeroizing::new(b"v1".to_vec()), &binding, &cancel)
            .await
            .unwrap();

        // Rewrite the version field and re-seal with a fresh valid HMAC so
        // only the version check can object.
        let mut bytes = fs::read(container.path()).unwrap();
        let body_len = bytes.len() - HMAC_LEN;
        bytes[CONTAINER_MAGIC.len()..CONTAINER_MAGIC.len() + 4]
            .copy_from_slice(&2u32.to_le_bytes());
        let hmac_key = provider.get_or_create_hmac_key().unwrap();
        let mac = primitives::hmac_sha512(&hmac_key, &bytes[..body_len]).unwrap();
        bytes[body_len..].copy_from_slice(&mac);
        fs::write(container.path(), &bytes).unwrap();

        let err = container.load_state(&binding, &cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedVersion(2)));
    }

    #[tokio::test]
    async fn keychain_miss_falls_back_to_argon2() {
        let dir = tempdir().unwrap();
        let (container, binding, provider) = setup(dir.path());
        let cancel = CancelToken::new();

        container
            .save_state(Zeroizing::new(b"rederivable".to_vec()), &binding, &cancel)
            .await
            .unwrap();
        provider.delete_key(&session_key_id("conn-1")).unwrap();

        let loaded = container.load_state(&binding, &cancel).await.unwrap();
        assert_eq!(&loaded[..], b"rederivable");
    }

    #[tokio::test]
    async fn legacy_derivation_migrates_on_load() {
        let dir = tempdir().unwrap();
        let (container, binding, provider) = setup(dir.path());
        let cancel = CancelToken::new();

        container
            .save_with_legacy_key(b"old style", &binding)
            .unwrap();
        // Make sure the keychain cannot short-circuit the migration path.
        provider.delete_key(&session_key_id("conn-1")).unwrap();
        let before = fs::read(container.path()).unwrap();

        let loaded = container.load_state(&binding, &cancel).await.unwrap();
        assert_eq!(&loaded[..], b"old style");

        // The container was rewritten under the membership derivation.
        let after = fs::read(container.path()).unwrap();
        assert_ne!(before, after);
        provider.delete_key(&session_key_id("conn-1")).unwrap();
        let reloaded = container.load_state(&binding, &cancel).await.unwrap();
        assert_eq!(&reloaded[..], b"old style");
    }

    #[tokio::test]
    async fn delete_removes_file_and_keychain_entry() {
        let dir = tempdir().unwrap();
        let (container, binding, provider) = setup(dir.path());
        let cancel = CancelToken::new();

        container
            .save_state(Zeroizing::new(b"gone soon".to_vec()), &binding, &cancel)
            .await
            .unwrap();
        container.delete_state("conn-1").await.unwrap();
        assert!(!container.exists());
        assert!(!provider.contains(&session_key_id("conn-1")));

        // Deleting a missing file is not an error.
        container.delete_state("conn-1").await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_save_leaves_no_file() {
        let dir = tempdir().unwrap();
        let (container, binding, _provider) = setup(dir.path());
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = container
            .save_state(Zeroizing::new(b"never".to_vec()), &binding, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert!(!container.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_mode_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let (container, binding, _provider) = setup(dir.path());

        container
            .save_state(
                Zeroizing::new(b"private".to_vec()),
                &binding,
                &CancelToken::new(),
            )
            .await
            .unwrap();
        let mode = fs::metadata(container.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn stamped_state_roundtrip() {
        let stamped = StampedState::now(b"payload");
        let encoded = stamped.encode().unwrap();
        let decoded = StampedState::decode(&encoded).unwrap();
        assert_eq!(&decoded.state[..], b"payload");
        assert!(decoded.age() < chrono::Duration::seconds(5));
    }
}
