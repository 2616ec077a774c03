//! Restart and tamper scenarios across the engine and the store.
//!
//! Covers:
//!  1. Restart: export after two messages, persist through the container,
//!     reload, import, and keep talking with unchanged counters
//!  2. Tamper: a single damaged byte in the persisted file is fatal, the
//!     file is not rewritten and the keychain entry survives untouched
//!  3. Fresh restoration wired through the planner after a fault

use std::sync::Arc;

use async_trait::async_trait;
use ecx_crypto::primitives::Argon2idParams;
use ecx_crypto::{EngineConfig, IdentityKeyStore, ProtocolEngine};
use ecx_store::{
    session_key_id, CancelToken, MemoryProvider, RestorationConfig, RestorationPlanner,
    RestorationStrategy, RestoreTransport, StampedState, StateBinding, StateContainer,
    StoreError,
};
use zeroize::Zeroizing;

fn engine(opks: usize) -> ProtocolEngine {
    let identity = Arc::new(IdentityKeyStore::create(opks).unwrap());
    let (engine, _persist, _status) = ProtocolEngine::new(identity, EngineConfig::default());
    engine
}

fn fast_params() -> Argon2idParams {
    Argon2idParams {
        memory_kib: Argon2idParams::MIN_MEMORY_KIB,
        iterations: 2,
        parallelism: 1,
    }
}

fn binding(connect_id: &str) -> StateBinding {
    StateBinding {
        connect_id: connect_id.to_string(),
        membership_id: b"membership-0001".to_vec(),
        device_id: b"device-0001".to_vec(),
    }
}

// ─── Scenario 1: restart ────────────────────────────────────────────────────

#[tokio::test]
async fn restart_resumes_exactly_where_it_left_off() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let container = StateContainer::new(dir.path().join("alice.ecx"), provider.clone())
        .with_params(fast_params());
    let cancel = CancelToken::new();
    let binding = binding("alice-conn");

    let alice = engine(0);
    let bob = engine(2);
    let bundle = bob.identity().bundle();
    let opk = bundle.opks[0].id;
    let (first, a_session) = alice.initiate(&bundle, Some(opk)).unwrap();
    let b_session = bob.accept(&first, Some(opk)).unwrap();

    let m1 = alice.send(&a_session, b"m1", b"").unwrap();
    bob.receive(&b_session, &m1, b"").unwrap();
    let m2 = alice.send(&a_session, b"m2", b"").unwrap();
    bob.receive(&b_session, &m2, b"").unwrap();

    // Persist, "restart" the process, reload.
    let exported = alice.export_state(&a_session).unwrap();
    let stamped = StampedState::now(&exported).encode().unwrap();
    container
        .save_state(Zeroizing::new(stamped.to_vec()), &binding, &cancel)
        .await
        .unwrap();

    drop(alice);
    let alice = engine(0);
    let plaintext = container.load_state(&binding, &cancel).await.unwrap();
    let restored = StampedState::decode(&plaintext).unwrap();
    let revived = alice.import_state(&restored.state).unwrap();
    assert_eq!(revived, a_session);

    // The imported counters line up: the next message decrypts first try.
    let before = alice.export_state(&revived).unwrap();
    assert_eq!(&*before, &*exported);

    let m3 = alice.send(&revived, b"m3", b"").unwrap();
    assert_eq!(&bob.receive(&b_session, &m3, b"").unwrap()[..], b"m3");
}

// ─── Scenario 2: tamper ─────────────────────────────────────────────────────

#[tokio::test]
async fn single_byte_tamper_is_fatal_and_nondestructive() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let container = StateContainer::new(dir.path().join("alice.ecx"), provider.clone())
        .with_params(fast_params());
    let cancel = CancelToken::new();
    let binding = binding("alice-conn");

    container
        .save_state(Zeroizing::new(b"session blob".to_vec()), &binding, &cancel)
        .await
        .unwrap();

    // Flip the second-to-last byte, inside the HMAC trailer.
    let mut bytes = std::fs::read(container.path()).unwrap();
    let target = bytes.len() - 2;
    bytes[target] ^= 0x40;
    std::fs::write(container.path(), &bytes).unwrap();

    let err = container.load_state(&binding, &cancel).await.unwrap_err();
    assert!(matches!(err, StoreError::TamperedStateDetected));

    // The damaged file was left as-is and the keychain entry survived.
    assert_eq!(std::fs::read(container.path()).unwrap(), bytes);
    assert!(provider.contains(&session_key_id("alice-conn")));
}

// ─── Scenario 3: fault → fresh restoration ──────────────────────────────────

struct ReconnectTransport {
    alice: ProtocolEngine,
    bob: ProtocolEngine,
}

#[async_trait]
impl RestoreTransport for ReconnectTransport {
    async fn local_restore(&self, _state: &[u8]) -> Result<bool, StoreError> {
        // The data center refused the cached session.
        Ok(false)
    }

    async fn fresh_connect(&self, _connect_id: &str) -> Result<Vec<u8>, StoreError> {
        let bundle = self.bob.identity().bundle();
        let (first, session) = self
            .alice
            .initiate(&bundle, None)
            .map_err(|e| StoreError::InvalidContainer(e.to_string()))?;
        self.bob
            .accept(&first, None)
            .map_err(|e| StoreError::InvalidContainer(e.to_string()))?;
        let state = self
            .alice
            .export_state(&session)
            .map_err(|e| StoreError::InvalidContainer(e.to_string()))?;
        Ok(state.to_vec())
    }
}

#[tokio::test]
async fn planner_reestablishes_after_rejected_state() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let container = StateContainer::new(dir.path().join("conn.ecx"), provider.clone())
        .with_params(fast_params());
    let cancel = CancelToken::new();
    let binding = binding("conn-77");

    // Seed a cached-but-unacceptable state.
    let stale = StampedState::now(b"previous-session").encode().unwrap();
    container
        .save_state(Zeroizing::new(stale.to_vec()), &binding, &cancel)
        .await
        .unwrap();

    let transport = ReconnectTransport {
        alice: engine(0),
        bob: engine(1),
    };
    let planner = RestorationPlanner::new(container.clone(), RestorationConfig::default());
    let result = planner.restore(&binding, &transport, &cancel).await;

    assert!(result.success);
    assert_eq!(result.strategy_used, RestorationStrategy::LocalFirst);
    assert!(result.required_fresh_connection);
    assert!(!result.state_was_synced);

    // The fresh session state was persisted and imports cleanly.
    let plaintext = container.load_state(&binding, &cancel).await.unwrap();
    let stamped = StampedState::decode(&plaintext).unwrap();
    let restorer = engine(0);
    restorer.import_state(&stamped.state).unwrap();
}
