//! One-shot spawn signal shared by a connection's reader and its waiters.

use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{RelayError, Result};

#[derive(Debug, Clone)]
enum SpawnState {
    Pending,
    Spawned,
    Failed(RelayError),
    Closed,
}

/// Resolves exactly once: spawned, failed, or closed.
///
/// Later triggers are no-ops. Any number of tasks may wait; each observes the same
/// outcome, including tasks that start waiting after it resolved.
#[derive(Debug)]
pub struct SpawnSignal {
    state: watch::Sender<SpawnState>,
}

impl Default for SpawnSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl SpawnSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SpawnState::Pending);
        Self { state }
    }

    /// Mark the login sequence complete. Returns false if already resolved.
    pub fn fire(&self) -> bool {
        self.resolve(SpawnState::Spawned)
    }

    /// Resolve with a fatal error. Returns false if already resolved.
    pub fn fail(&self, error: RelayError) -> bool {
        self.resolve(SpawnState::Failed(error))
    }

    /// Resolve with [`RelayError::ConnectionClosed`]. Returns false if already resolved.
    pub fn close(&self) -> bool {
        self.resolve(SpawnState::Closed)
    }

    pub fn is_spawned(&self) -> bool {
        matches!(*self.state.borrow(), SpawnState::Spawned)
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(*self.state.borrow(), SpawnState::Pending)
    }

    fn resolve(&self, outcome: SpawnState) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, SpawnState::Pending) {
                *state = outcome;
                true
            } else {
                false
            }
        })
    }

    /// Wait until the signal resolves.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let outcome = match rx.wait_for(|state| !matches!(state, SpawnState::Pending)).await {
            Ok(state) => state.clone(),
            // The sender lives in `self`, so this only happens during teardown.
            Err(_) => SpawnState::Closed,
        };
        match outcome {
            SpawnState::Spawned => Ok(()),
            SpawnState::Failed(error) => Err(error),
            SpawnState::Pending | SpawnState::Closed => Err(RelayError::ConnectionClosed),
        }
    }

    /// Wait until the signal resolves or `cancel` fires.
    pub async fn wait_until(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(RelayError::ConnectionClosed),
            result = self.wait() => result,
        }
    }

    /// Wait until the signal resolves or `duration` elapses.
    pub async fn wait_timeout(&self, duration: Duration) -> Result<()> {
        match tokio::time::timeout(duration, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout { duration }),
        }
    }
}
