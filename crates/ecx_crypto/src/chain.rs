//! Symmetric KDF chain with bounded out-of-order tolerance.
//!
//! Each step consumes the chain key and produces a one-shot message key:
//!
//!   mk      = HKDF(ck, "ecliptix-msg")
//!   next_ck = HKDF(ck, "ecliptix-chain")
//!
//! Keys derived ahead of time for not-yet-seen indices go into the skipped
//! cache; both the cache size and the forward jump are bounded so a hostile
//! peer cannot force unbounded work or memory. Every stored skipped key is
//! wiped on removal and on chain destruction.

use std::collections::BTreeMap;

use ecx_secmem::SecretBuf;
use zeroize::Zeroizing;

use crate::error::{CoreResult, ProtocolFailure};
use crate::primitives;

pub const MAX_SKIPPED_PER_CHAIN: usize = 1024;
pub const MAX_FORWARD_GAP: u32 = 2000;

const CHAIN_INFO: &[u8] = b"ecliptix-chain";
const MSG_INFO: &[u8] = b"ecliptix-msg";

/// A one-shot message key plus the chain index it belongs to. Wiped on drop;
/// callers must not outlive the encrypt/decrypt call with it.
#[derive(Debug)]
pub struct MessageKey {
    pub index: u32,
    pub key: Zeroizing<[u8; 32]>,
}

/// Rollback point for a failed decrypt: the chain key and index exactly as
/// they were before derivation.
pub struct ChainSnapshot {
    chain_key: Zeroizing<[u8; 32]>,
    index: u32,
}

pub struct ChainStep {
    chain_key: Option<SecretBuf>,
    current_index: u32,
    skipped: BTreeMap<u32, SecretBuf>,
}

impl ChainStep {
    /// A chain that has not been keyed yet (responder's send chain before
    /// the first ratchet, receiver's chain before the first envelope).
    pub fn inactive() -> Self {
        Self {
            chain_key: None,
            current_index: 0,
            skipped: BTreeMap::new(),
        }
    }

    pub fn activate(&mut self, chain_key: SecretBuf) {
        debug_assert!(self.skipped.is_empty(), "retire skipped keys before rekeying");
        self.chain_key = Some(chain_key);
        self.current_index = 0;
    }

    pub fn is_active(&self) -> bool {
        self.chain_key.is_some()
    }

    pub fn current_index(&self) -> u32 {
        self.current_index
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    fn step(&mut self) -> CoreResult<MessageKey> {
        let ck = self
            .chain_key
            .as_ref()
            .ok_or_else(|| ProtocolFailure::StateMismatch("chain not keyed".into()))?;
        if self.current_index == u32::MAX {
            return Err(ProtocolFailure::NonceCounterOverflow.into());
        }

        let mut ck_bytes = Zeroizing::new([0u8; 32]);
        ck.read_into(&mut *ck_bytes)?;

        let mut mk = Zeroizing::new([0u8; 32]);
        primitives::hkdf_expand(None, &*ck_bytes, MSG_INFO, &mut *mk)?;
        let mut next = Zeroizing::new([0u8; 32]);
        primitives::hkdf_expand(None, &*ck_bytes, CHAIN_INFO, &mut *next)?;

        self.chain_key = Some(SecretBuf::from_bytes(&*next)?);
        let index = self.current_index;
        self.current_index += 1;
        Ok(MessageKey { index, key: mk })
    }

    /// Derive the key for the current index and move the chain forward.
    pub fn advance(&mut self) -> CoreResult<MessageKey> {
        self.step()
    }

    /// Derive forward to `target`, caching every key in between. Returns the
    /// key for `target` itself. The chain is only mutated if the whole run
    /// fits inside the bounds.
    pub fn derive_up_to(&mut self, target: u32) -> CoreResult<MessageKey> {
        if target < self.current_index {
            return Err(ProtocolFailure::StateMismatch(format!(
                "derive_up_to went backwards: {} < {}",
                target, self.current_index
            ))
            .into());
        }
        let gap = u64::from(target) - u64::from(self.current_index);
        if gap > u64::from(MAX_FORWARD_GAP) {
            return Err(ProtocolFailure::ChainGapTooLarge { gap }.into());
        }
        if self.skipped.len() as u64 + gap > MAX_SKIPPED_PER_CHAIN as u64 {
            return Err(ProtocolFailure::ChainGapTooLarge { gap }.into());
        }

        while self.current_index < target {
            let mk = self.step()?;
            self.skipped
                .insert(mk.index, SecretBuf::from_bytes(&*mk.key)?);
        }
        self.step()
    }

    /// Cache message keys for every index up to `end` (exclusive), leaving
    /// the chain positioned at `end`. Used when a chain retires after a DH
    /// ratchet with messages still in flight.
    pub fn cache_through(&mut self, end: u32) -> CoreResult<()> {
        if end <= self.current_index {
            return Ok(());
        }
        let gap = u64::from(end) - u64::from(self.current_index);
        if gap > u64::from(MAX_FORWARD_GAP)
            || self.skipped.len() as u64 + gap > MAX_SKIPPED_PER_CHAIN as u64
        {
            return Err(ProtocolFailure::ChainGapTooLarge { gap }.into());
        }
        while self.current_index < end {
            let mk = self.step()?;
            self.skipped
                .insert(mk.index, SecretBuf::from_bytes(&*mk.key)?);
        }
        Ok(())
    }

    /// Atomically remove and return a cached skipped key.
    pub fn take_skipped(&mut self, index: u32) -> Option<MessageKey> {
        let buf = self.skipped.remove(&index)?;
        let mut key = Zeroizing::new([0u8; 32]);
        buf.read_into(&mut *key).ok()?;
        Some(MessageKey { index, key })
    }

    /// Put a skipped key back after a decrypt failure so the envelope can be
    /// retried by the caller.
    pub fn restore_skipped(&mut self, mk: &MessageKey) -> CoreResult<()> {
        self.skipped
            .insert(mk.index, SecretBuf::from_bytes(&*mk.key)?);
        Ok(())
    }

    /// Move every cached skipped key out, e.g. when the chain retires after
    /// a DH ratchet.
    pub fn drain_skipped(&mut self) -> BTreeMap<u32, SecretBuf> {
        std::mem::take(&mut self.skipped)
    }

    pub fn snapshot(&self) -> CoreResult<Option<ChainSnapshot>> {
        match &self.chain_key {
            None => Ok(None),
            Some(ck) => {
                let mut bytes = Zeroizing::new([0u8; 32]);
                ck.read_into(&mut *bytes)?;
                Ok(Some(ChainSnapshot {
                    chain_key: bytes,
                    index: self.current_index,
                }))
            }
        }
    }

    /// Roll back to a snapshot taken before a failed decrypt. Keys cached in
    /// between are dropped (they were derived for the rejected envelope).
    pub fn restore(&mut self, snapshot: ChainSnapshot) -> CoreResult<()> {
        self.skipped.split_off(&snapshot.index);
        self.chain_key = Some(SecretBuf::from_bytes(&*snapshot.chain_key)?);
        self.current_index = snapshot.index;
        Ok(())
    }

    // ── Persistence accessors ────────────────────────────────────────────

    pub(crate) fn chain_key_bytes(&self) -> CoreResult<Option<Zeroizing<[u8; 32]>>> {
        match &self.chain_key {
            None => Ok(None),
            Some(ck) => {
                let mut bytes = Zeroizing::new([0u8; 32]);
                ck.read_into(&mut *bytes)?;
                Ok(Some(bytes))
            }
        }
    }

    pub(crate) fn skipped_entries(&self) -> CoreResult<Vec<(u32, Zeroizing<[u8; 32]>)>> {
        let mut out = Vec::with_capacity(self.skipped.len());
        for (index, buf) in &self.skipped {
            let mut bytes = Zeroizing::new([0u8; 32]);
            buf.read_into(&mut *bytes)?;
            out.push((*index, bytes));
        }
        Ok(out)
    }

    pub(crate) fn from_parts(
        chain_key: Option<SecretBuf>,
        current_index: u32,
        skipped: BTreeMap<u32, SecretBuf>,
    ) -> Self {
        Self {
            chain_key,
            current_index,
            skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed_chain() -> ChainStep {
        let mut chain = ChainStep::inactive();
        chain.activate(SecretBuf::from_bytes(&[7u8; 32]).unwrap());
        chain
    }

    #[test]
    fn advance_produces_distinct_keys_and_increments() {
        let mut chain = keyed_chain();
        let k0 = chain.advance().unwrap();
        let k1 = chain.advance().unwrap();
        assert_eq!(k0.index, 0);
        assert_eq!(k1.index, 1);
        assert_ne!(*k0.key, *k1.key);
        assert_eq!(chain.current_index(), 2);
    }

    #[test]
    fn two_chains_from_same_key_agree() {
        let mut a = keyed_chain();
        let mut b = keyed_chain();
        for _ in 0..16 {
            assert_eq!(*a.advance().unwrap().key, *b.advance().unwrap().key);
        }
    }

    #[test]
    fn derive_up_to_caches_intermediate_keys() {
        let mut sender = keyed_chain();
        let mut receiver = keyed_chain();

        let keys: Vec<_> = (0..5).map(|_| sender.advance().unwrap()).collect();

        // Receiver sees message 4 first.
        let k4 = receiver.derive_up_to(4).unwrap();
        assert_eq!(*k4.key, *keys[4].key);
        assert_eq!(receiver.skipped_len(), 4);

        for expected in &keys[..4] {
            let got = receiver.take_skipped(expected.index).unwrap();
            assert_eq!(*got.key, *expected.key);
        }
        assert_eq!(receiver.skipped_len(), 0);
        assert!(receiver.take_skipped(2).is_none());
    }

    #[test]
    fn forward_gap_bound_enforced() {
        let mut chain = keyed_chain();
        let err = chain.derive_up_to(MAX_FORWARD_GAP + 1).unwrap_err();
        assert!(matches!(
            err,
            crate::error::CoreError::Protocol(ProtocolFailure::ChainGapTooLarge { .. })
        ));
        // Nothing advanced.
        assert_eq!(chain.current_index(), 0);
        assert_eq!(chain.skipped_len(), 0);
    }

    #[test]
    fn skipped_cache_bound_enforced() {
        let mut chain = keyed_chain();
        let err = chain.derive_up_to(MAX_SKIPPED_PER_CHAIN as u32 + 1).unwrap_err();
        assert!(matches!(
            err,
            crate::error::CoreError::Protocol(ProtocolFailure::ChainGapTooLarge { .. })
        ));
        assert_eq!(chain.skipped_len(), 0);
    }

    #[test]
    fn overflow_is_fatal() {
        let mut chain = ChainStep::from_parts(
            Some(SecretBuf::from_bytes(&[1u8; 32]).unwrap()),
            u32::MAX,
            BTreeMap::new(),
        );
        let err = chain.advance().unwrap_err();
        assert!(matches!(
            err,
            crate::error::CoreError::Protocol(ProtocolFailure::NonceCounterOverflow)
        ));
    }

    #[test]
    fn snapshot_restore_rolls_back_one_step() {
        let mut chain = keyed_chain();
        chain.advance().unwrap();

        let snapshot = chain.snapshot().unwrap().unwrap();
        let k1 = chain.advance().unwrap();
        chain.restore(snapshot).unwrap();
        assert_eq!(chain.current_index(), 1);

        // Re-deriving yields the same key the rejected attempt used.
        let k1_again = chain.advance().unwrap();
        assert_eq!(*k1.key, *k1_again.key);
    }

    #[test]
    fn inactive_chain_refuses_to_step() {
        let mut chain = ChainStep::inactive();
        assert!(chain.advance().is_err());
    }
}
