//! State-restoration planner.
//!
//! Decides how a connection comes back after a disconnect, restart or
//! partial state loss: resume from the local container, or establish fresh.
//! The planner only sequences attempts; cryptographic policy lives in the
//! engine, transport behaviour behind [`RestoreTransport`].

use std::time::Instant;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::cancel::CancelToken;
use crate::container::{StampedState, StateBinding, StateContainer};
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorationStrategy {
    LocalFirst,
    ServerFirst,
    Hybrid,
    Fresh,
}

#[derive(Debug, Clone)]
pub struct RestorationConfig {
    pub preferred: RestorationStrategy,
    /// Local state older than this is not offered to the server at all.
    pub local_state_max_age: Duration,
    /// Deadline for the sync attempt under the Hybrid strategy.
    pub state_sync_timeout: Duration,
}

impl Default for RestorationConfig {
    fn default() -> Self {
        Self {
            preferred: RestorationStrategy::LocalFirst,
            local_state_max_age: Duration::from_secs(24 * 60 * 60),
            state_sync_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct RestorationResult {
    pub success: bool,
    pub strategy_used: RestorationStrategy,
    pub duration: Duration,
    pub required_fresh_connection: bool,
    pub state_was_synced: bool,
    pub error_message: Option<String>,
}

/// What the planner drives. `local_restore` offers cached state to the data
/// center and reports whether it was accepted; `fresh_connect` performs a
/// full handshake and returns the new serialized state.
#[async_trait]
pub trait RestoreTransport: Send + Sync {
    async fn local_restore(&self, state: &[u8]) -> Result<bool, StoreError>;
    async fn fresh_connect(&self, connect_id: &str) -> Result<Vec<u8>, StoreError>;
}

pub struct RestorationPlanner {
    container: StateContainer,
    config: RestorationConfig,
}

impl RestorationPlanner {
    pub fn new(container: StateContainer, config: RestorationConfig) -> Self {
        Self { container, config }
    }

    pub async fn restore(
        &self,
        binding: &StateBinding,
        transport: &dyn RestoreTransport,
        cancel: &CancelToken,
    ) -> RestorationResult {
        let started = Instant::now();

        let outcome = self.plan(binding, transport, cancel).await;
        let duration = started.elapsed();

        match outcome {
            Ok((strategy, fresh, synced)) => RestorationResult {
                success: true,
                strategy_used: strategy,
                duration,
                required_fresh_connection: fresh,
                state_was_synced: synced,
                error_message: None,
            },
            Err((strategy, err)) => RestorationResult {
                success: false,
                strategy_used: strategy,
                duration,
                required_fresh_connection: true,
                state_was_synced: false,
                error_message: Some(err.to_string()),
            },
        }
    }

    /// Returns (strategy used, required fresh connection, state was synced).
    async fn plan(
        &self,
        binding: &StateBinding,
        transport: &dyn RestoreTransport,
        cancel: &CancelToken,
    ) -> Result<(RestorationStrategy, bool, bool), (RestorationStrategy, StoreError)> {
        let mut strategy = self.config.preferred;

        let stamped = if self.container.exists() {
            match self.container.load_state(binding, cancel).await {
                Ok(plaintext) => match StampedState::decode(&plaintext) {
                    Ok(stamped) => Some(stamped),
                    Err(err) => {
                        tracing::warn!(%err, "local state unreadable; falling back to fresh");
                        None
                    }
                },
                Err(err @ StoreError::Cancelled) => return Err((strategy, err)),
                Err(err) => {
                    tracing::warn!(%err, "local state rejected; falling back to fresh");
                    None
                }
            }
        } else {
            None
        };

        let stamped = match stamped {
            None => {
                strategy = RestorationStrategy::Fresh;
                return self
                    .fresh(binding, transport, cancel)
                    .await
                    .map(|_| (strategy, true, false))
                    .map_err(|e| (strategy, e));
            }
            Some(stamped) => stamped,
        };

        let max_age = ChronoDuration::from_std(self.config.local_state_max_age)
            .unwrap_or_else(|_| ChronoDuration::days(1));
        if stamped.age() > max_age {
            // The server does not accept stale state; go straight to fresh.
            strategy = RestorationStrategy::ServerFirst;
            return self
                .fresh(binding, transport, cancel)
                .await
                .map(|_| (strategy, true, false))
                .map_err(|e| (strategy, e));
        }

        match strategy {
            RestorationStrategy::LocalFirst => {
                let accepted = self
                    .try_local(&stamped, transport, cancel, None)
                    .await
                    .unwrap_or(false);
                if accepted {
                    Ok((strategy, false, true))
                } else {
                    self.fresh(binding, transport, cancel)
                        .await
                        .map(|_| (strategy, true, false))
                        .map_err(|e| (strategy, e))
                }
            }
            RestorationStrategy::Hybrid => {
                let accepted = self
                    .try_local(
                        &stamped,
                        transport,
                        cancel,
                        Some(self.config.state_sync_timeout),
                    )
                    .await
                    .unwrap_or(false);
                if accepted {
                    Ok((strategy, false, true))
                } else {
                    self.fresh(binding, transport, cancel)
                        .await
                        .map(|_| (strategy, true, false))
                        .map_err(|e| (strategy, e))
                }
            }
            RestorationStrategy::ServerFirst | RestorationStrategy::Fresh => self
                .fresh(binding, transport, cancel)
                .await
                .map(|_| (strategy, true, false))
                .map_err(|e| (strategy, e)),
        }
    }

    async fn try_local(
        &self,
        stamped: &StampedState,
        transport: &dyn RestoreTransport,
        cancel: &CancelToken,
        deadline: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let attempt = async {
            tokio::select! {
                accepted = transport.local_restore(&stamped.state) => accepted,
                _ = cancel.cancelled() => Err(StoreError::Cancelled),
            }
        };
        match deadline {
            None => attempt.await,
            Some(timeout) => match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!("state sync deadline elapsed");
                    Ok(false)
                }
            },
        }
    }

    async fn fresh(
        &self,
        binding: &StateBinding,
        transport: &dyn RestoreTransport,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        cancel.check()?;
        let new_state = tokio::select! {
            state = transport.fresh_connect(&binding.connect_id) => state?,
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
        };

        let stamped = StampedState::now(&new_state).encode()?;
        self.container
            .save_state(Zeroizing::new(stamped.to_vec()), binding, cancel)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::MemoryProvider;
    use ecx_crypto::primitives::Argon2idParams;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct ScriptedTransport {
        accept_local: bool,
        local_delay: Option<Duration>,
        fresh_state: Vec<u8>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl ScriptedTransport {
        fn new(accept_local: bool) -> Self {
            Self {
                accept_local,
                local_delay: None,
                fresh_state: b"fresh-state".to_vec(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl RestoreTransport for ScriptedTransport {
        async fn local_restore(&self, _state: &[u8]) -> Result<bool, StoreError> {
            self.calls.lock().push("local");
            if let Some(delay) = self.local_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.accept_local)
        }

        async fn fresh_connect(&self, _connect_id: &str) -> Result<Vec<u8>, StoreError> {
            self.calls.lock().push("fresh");
            Ok(self.fresh_state.clone())
        }
    }

    fn fast_params() -> Argon2idParams {
        Argon2idParams {
            memory_kib: Argon2idParams::MIN_MEMORY_KIB,
            iterations: 2,
            parallelism: 1,
        }
    }

    fn setup(dir: &std::path::Path) -> (StateContainer, StateBinding) {
        let provider = Arc::new(MemoryProvider::new());
        let container =
            StateContainer::new(dir.join("state.ecx"), provider).with_params(fast_params());
        let binding = StateBinding {
            connect_id: "conn-r".into(),
            membership_id: b"member".to_vec(),
            device_id: b"device".to_vec(),
        };
        (container, binding)
    }

    async fn seed_state(container: &StateContainer, binding: &StateBinding, saved_at_offset: ChronoDuration) {
        let mut stamped = StampedState::now(b"cached-session");
        stamped.saved_at = stamped.saved_at - saved_at_offset;
        container
            .save_state(
                Zeroizing::new(stamped.encode().unwrap().to_vec()),
                binding,
                &CancelToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn no_local_state_goes_fresh() {
        let dir = tempdir().unwrap();
        let (container, binding) = setup(dir.path());
        let planner = RestorationPlanner::new(container.clone(), RestorationConfig::default());
        let transport = ScriptedTransport::new(true);

        let result = planner
            .restore(&binding, &transport, &CancelToken::new())
            .await;
        assert!(result.success);
        assert_eq!(result.strategy_used, RestorationStrategy::Fresh);
        assert!(result.required_fresh_connection);
        assert!(!result.state_was_synced);
        assert_eq!(transport.calls(), vec!["fresh"]);
        // The fresh state was stored for next time.
        assert!(container.exists());
    }

    #[tokio::test]
    async fn local_first_resumes_cached_state() {
        let dir = tempdir().unwrap();
        let (container, binding) = setup(dir.path());
        seed_state(&container, &binding, ChronoDuration::zero()).await;

        let planner = RestorationPlanner::new(container, RestorationConfig::default());
        let transport = ScriptedTransport::new(true);

        let result = planner
            .restore(&binding, &transport, &CancelToken::new())
            .await;
        assert!(result.success);
        assert_eq!(result.strategy_used, RestorationStrategy::LocalFirst);
        assert!(result.state_was_synced);
        assert!(!result.required_fresh_connection);
        assert_eq!(transport.calls(), vec!["local"]);
    }

    #[tokio::test]
    async fn rejected_local_state_falls_back_to_fresh() {
        let dir = tempdir().unwrap();
        let (container, binding) = setup(dir.path());
        seed_state(&container, &binding, ChronoDuration::zero()).await;

        let planner = RestorationPlanner::new(container, RestorationConfig::default());
        let transport = ScriptedTransport::new(false);

        let result = planner
            .restore(&binding, &transport, &CancelToken::new())
            .await;
        assert!(result.success);
        assert_eq!(result.strategy_used, RestorationStrategy::LocalFirst);
        assert!(result.required_fresh_connection);
        assert!(!result.state_was_synced);
        assert_eq!(transport.calls(), vec!["local", "fresh"]);
    }

    #[tokio::test]
    async fn stale_state_goes_server_first() {
        let dir = tempdir().unwrap();
        let (container, binding) = setup(dir.path());
        seed_state(&container, &binding, ChronoDuration::days(3)).await;

        let planner = RestorationPlanner::new(container, RestorationConfig::default());
        let transport = ScriptedTransport::new(true);

        let result = planner
            .restore(&binding, &transport, &CancelToken::new())
            .await;
        assert!(result.success);
        assert_eq!(result.strategy_used, RestorationStrategy::ServerFirst);
        assert!(result.required_fresh_connection);
        assert_eq!(transport.calls(), vec!["fresh"]);
    }

    #[tokio::test]
    async fn hybrid_times_out_into_fresh() {
        let dir = tempdir().unwrap();
        let (container, binding) = setup(dir.path());
        seed_state(&container, &binding, ChronoDuration::zero()).await;

        let planner = RestorationPlanner::new(
            container,
            RestorationConfig {
                preferred: RestorationStrategy::Hybrid,
                state_sync_timeout: Duration::from_millis(20),
                ..RestorationConfig::default()
            },
        );
        let mut transport = ScriptedTransport::new(true);
        transport.local_delay = Some(Duration::from_secs(5));

        let result = planner
            .restore(&binding, &transport, &CancelToken::new())
            .await;
        assert!(result.success);
        assert_eq!(result.strategy_used, RestorationStrategy::Hybrid);
        assert!(result.required_fresh_connection);
        assert_eq!(transport.calls(), vec!["local", "fresh"]);
    }

    #[tokio::test]
    async fn cancellation_stops_the_plan() {
        let dir = tempdir().unwrap();
        let (container, binding) = setup(dir.path());

        let planner = RestorationPlanner::new(container.clone(), RestorationConfig::default());
        let transport = ScriptedTransport::new(true);
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = planner.restore(&binding, &transport, &cancel).await;
        assert!(!result.success);
        assert!(result.error_message.is_some());
        // No state was written for the cancelled attempt.
        assert!(!container.exists());
    }
}
