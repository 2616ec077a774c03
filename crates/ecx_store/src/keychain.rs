//! Platform security provider: OS keychain access plus the CSPRNG.
//!
//! Key ids are namespaced `ecliptix_key_<connectId>`; the outer-HMAC key
//! lives under a single well-known id. The keyring payloads are base64
//! because most platform credential stores want text.

use std::collections::HashMap;

use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::error::StoreError;

pub const KEYCHAIN_SERVICE: &str = "Ecliptix";
const HMAC_KEY_ID: &str = "ecliptix_hmac_key";
const HMAC_KEY_LEN: usize = 64;

pub fn session_key_id(connect_id: &str) -> String {
    format!("ecliptix_key_{connect_id}")
}

pub trait SecurityProvider: Send + Sync {
    fn random(&self, n: usize) -> Vec<u8>;
    fn store_key(&self, id: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn load_key(&self, id: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError>;
    fn delete_key(&self, id: &str) -> Result<(), StoreError>;

    /// The process-wide outer-HMAC key; created on first use.
    fn get_or_create_hmac_key(&self) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        if let Some(key) = self.load_key(HMAC_KEY_ID)? {
            return Ok(key);
        }
        let key = self.random(HMAC_KEY_LEN);
        self.store_key(HMAC_KEY_ID, &key)?;
        Ok(Zeroizing::new(key))
    }
}

// ── OS keychain ──────────────────────────────────────────────────────────────

pub struct KeyringProvider {
    service: String,
}

impl KeyringProvider {
    pub fn new() -> Self {
        Self {
            service: KEYCHAIN_SERVICE.to_string(),
        }
    }

    fn entry(&self, id: &str) -> Result<keyring::Entry, StoreError> {
        keyring::Entry::new(&self.service, id)
            .map_err(|e| StoreError::Keychain(format!("keyring init: {e}")))
    }
}

impl Default for KeyringProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityProvider for KeyringProvider {
    fn random(&self, n: usize) -> Vec<u8> {
        ecx_crypto::primitives::random(n)
    }

    fn store_key(&self, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        self.entry(id)?
            .set_password(&STANDARD.encode(bytes))
            .map_err(|e| StoreError::Keychain(format!("store {id}: {e}")))
    }

    fn load_key(&self, id: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        match self.entry(id)?.get_password() {
            Ok(encoded) => {
                let decoded = STANDARD
                    .decode(&encoded)
                    .map_err(|e| StoreError::Keychain(format!("decode {id}: {e}")))?;
                Ok(Some(Zeroizing::new(decoded)))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StoreError::Keychain(format!("load {id}: {e}"))),
        }
    }

    fn delete_key(&self, id: &str) -> Result<(), StoreError> {
        match self.entry(id)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Keychain(format!("delete {id}: {e}"))),
        }
    }
}

// ── In-memory provider ───────────────────────────────────────────────────────

/// Test double; also useful on platforms without a credential store.
#[derive(Default)]
pub struct MemoryProvider {
    keys: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.keys.lock().contains_key(id)
    }
}

impl SecurityProvider for MemoryProvider {
    fn random(&self, n: usize) -> Vec<u8> {
        ecx_crypto::primitives::random(n)
    }

    fn store_key(&self, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.keys.lock().insert(id.to_string(), bytes.to_vec());
        Ok(())
    }

    fn load_key(&self, id: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        Ok(self.keys.lock().get(id).map(|k| Zeroizing::new(k.clone())))
    }

    fn delete_key(&self, id: &str) -> Result<(), StoreError> {
        self.keys.lock().remove(id);
        Ok(())
    }
}
