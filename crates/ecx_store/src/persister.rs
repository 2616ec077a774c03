//! Consumes the engine's persistence queue and writes session snapshots
//! through the secure container.
//!
//! Events arrive FIFO per session. Critical snapshots (handshake complete,
//! DH ratchet, chain synchronisation) are written immediately; debounced
//! snapshots coalesce inside a 100 ms window, with only the newest blob of
//! a session surviving the window. The engine already released the session
//! lock by the time an event reaches this task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ecx_crypto::primitives::Argon2idParams;
use ecx_crypto::{Criticality, PersistenceEvent, SessionId};
use tokio::sync::mpsc;
use tokio::time::Instant;
use zeroize::Zeroizing;

use crate::cancel::CancelToken;
use crate::container::{StampedState, StateBinding, StateContainer};
use crate::keychain::SecurityProvider;

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

pub struct SessionPersister {
    base_dir: PathBuf,
    provider: Arc<dyn SecurityProvider>,
    membership_id: Vec<u8>,
    device_id: Vec<u8>,
    params: Argon2idParams,
    debounce: Duration,
}

impl SessionPersister {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        provider: Arc<dyn SecurityProvider>,
        membership_id: Vec<u8>,
        device_id: Vec<u8>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            provider,
            membership_id,
            device_id,
            params: Argon2idParams::default(),
            debounce: DEBOUNCE_WINDOW,
        }
    }

    pub fn with_params(mut self, params: Argon2idParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn container_for(&self, session_id: &str) -> StateContainer {
        StateContainer::new(
            self.base_dir.join(format!("{session_id}.ecx")),
            self.provider.clone(),
        )
        .with_params(self.params)
    }

    pub fn binding_for(&self, session_id: &str) -> StateBinding {
        StateBinding {
            connect_id: session_id.to_string(),
            membership_id: self.membership_id.clone(),
            device_id: self.device_id.clone(),
        }
    }

    /// Drive the queue until the sender closes or the token cancels.
    /// Cancellation drops pending debounced snapshots on the floor; the
    /// next state-advancing operation re-emits them anyway.
    pub async fn run(self, mut rx: mpsc::Receiver<PersistenceEvent>, cancel: CancelToken) {
        let mut pending: HashMap<SessionId, (Zeroizing<Vec<u8>>, Instant)> = HashMap::new();

        loop {
            let next_deadline = pending.values().map(|(_, at)| *at).min();
            let flush_timer = async {
                match next_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = rx.recv() => match event {
                    None => {
                        self.flush(&mut pending, None).await;
                        return;
                    }
                    Some(event) => match event.criticality {
                        Criticality::Critical => {
                            // The critical blob supersedes anything queued.
                            pending.remove(&event.session_id);
                            self.save(&event.session_id, &event.blob).await;
                        }
                        Criticality::Debounced => {
                            let deadline = pending
                                .get(&event.session_id)
                                .map(|(_, at)| *at)
                                .unwrap_or_else(|| Instant::now() + self.debounce);
                            pending.insert(event.session_id, (event.blob, deadline));
                        }
                    },
                },
                _ = flush_timer => {
                    self.flush(&mut pending, Some(Instant::now())).await;
                },
                _ = cancel.cancelled() => {
                    tracing::debug!(dropped = pending.len(), "persister cancelled");
                    return;
                }
            }
        }
    }

    /// Write out everything due at `now`, or everything when draining.
    async fn flush(
        &self,
        pending: &mut HashMap<SessionId, (Zeroizing<Vec<u8>>, Instant)>,
        now: Option<Instant>,
    ) {
        let due: Vec<SessionId> = pending
            .iter()
            .filter(|(_, (_, at))| now.map(|n| *at <= n).unwrap_or(true))
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in due {
            if let Some((blob, _)) = pending.remove(&session_id) {
                self.save(&session_id, &blob).await;
            }
        }
    }

    async fn save(&self, session_id: &str, blob: &[u8]) {
        let stamped = match StampedState::now(blob).encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(session = %session_id, %err, "snapshot encode failed");
                return;
            }
        };
        let container = self.container_for(session_id);
        let binding = self.binding_for(session_id);
        if let Err(err) = container
            .save_state(
                Zeroizing::new(stamped.to_vec()),
                &binding,
                &CancelToken::new(),
            )
            .await
        {
            tracing::error!(session = %session_id, %err, "snapshot write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::MemoryProvider;
    use tempfile::tempdir;

    fn fast_params() -> Argon2idParams {
        Argon2idParams {
            memory_kib: Argon2idParams::MIN_MEMORY_KIB,
            iterations: 2,
            parallelism: 1,
        }
    }

    fn persister(dir: &std::path::Path) -> SessionPersister {
        SessionPersister::new(
            dir,
            Arc::new(MemoryProvider::new()),
            b"member".to_vec(),
            b"device".to_vec(),
        )
        .with_params(fast_params())
        .with_debounce(Duration::from_millis(50))
    }

    fn event(session: &str, blob: &[u8], criticality: Criticality) -> PersistenceEvent {
        PersistenceEvent {
            session_id: session.to_string(),
            blob: Zeroizing::new(blob.to_vec()),
            criticality,
        }
    }

    async fn read_state(p: &SessionPersister, session: &str) -> Vec<u8> {
        let container = p.container_for(session);
        let binding = p.binding_for(session);
        let plaintext = container
            .load_state(&binding, &CancelToken::new())
            .await
            .unwrap();
        StampedState::decode(&plaintext).unwrap().state.to_vec()
    }

    #[tokio::test]
    async fn critical_event_is_written_immediately() {
        let dir = tempdir().unwrap();
        let p = persister(dir.path());

        let (tx, rx) = mpsc::channel(8);
        let cancel = CancelToken::new();
        let container = p.container_for("s1");
        let binding = p.binding_for("s1");
        let handle = tokio::spawn(p.run(rx, cancel.clone()));

        tx.send(event("s1", b"critical-blob", Criticality::Critical))
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        let plaintext = container
            .load_state(&binding, &CancelToken::new())
            .await
            .unwrap();
        let stamped = StampedState::decode(&plaintext).unwrap();
        assert_eq!(&stamped.state[..], b"critical-blob");
    }

    #[tokio::test]
    async fn debounced_events_coalesce_to_newest() {
        let dir = tempdir().unwrap();
        let p = persister(dir.path());
        let probe = SessionPersister {
            base_dir: p.base_dir.clone(),
            provider: p.provider.clone(),
            membership_id: p.membership_id.clone(),
            device_id: p.device_id.clone(),
            params: p.params,
            debounce: p.debounce,
        };

        let (tx, rx) = mpsc::channel(8);
        let cancel = CancelToken::new();
        let handle = tokio::spawn(p.run(rx, cancel.clone()));

        tx.send(event("s2", b"version-1", Criticality::Debounced))
            .await
            .unwrap();
        tx.send(event("s2", b"version-2", Criticality::Debounced))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(read_state(&probe, "s2").await, b"version-2");

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn drain_on_close_writes_pending() {
        let dir = tempdir().unwrap();
        let p = persister(dir.path());
        let probe = SessionPersister {
            base_dir: p.base_dir.clone(),
            provider: p.provider.clone(),
            membership_id: p.membership_id.clone(),
            device_id: p.device_id.clone(),
            params: p.params,
            debounce: p.debounce,
        };

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(p.run(rx, CancelToken::new()));
        tx.send(event("s3", b"pending", Criticality::Debounced))
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(read_state(&probe, "s3").await, b"pending");
    }
}
