//! TTL heartbeat
//!
//! Reports `passing` for the registration's check every half-TTL so the
//! backend never sees the TTL lapse while the process is alive. The first
//! failed update stops the loop; there is no retry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::model::{HealthCheckId, HealthCheckSpec, HealthStatus};
use crate::backend::DiscoveryBackend;
use crate::error::{Error, Result};

/// Lifecycle of the heartbeat task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Running,
    /// An update failed; the loop has exited
    Failed,
    /// Cancelled by the owner
    Stopped,
}

/// Periodic health reporter for one registered check
pub struct HealthHeartbeat {
    backend: Arc<dyn DiscoveryBackend>,
    check_id: HealthCheckId,
    interval: Duration,
    state_tx: watch::Sender<HeartbeatState>,
}

impl HealthHeartbeat {
    #[must_use]
    pub fn new(
        backend: Arc<dyn DiscoveryBackend>,
        check_id: HealthCheckId,
        check: &HealthCheckSpec,
    ) -> Self {
        let (state_tx, _) = watch::channel(HeartbeatState::Running);
        Self {
            backend,
            check_id,
            interval: check.heartbeat_interval(),
            state_tx,
        }
    }

    /// Observe state transitions; stays valid after the task exits
    #[must_use]
    pub fn state(&self) -> watch::Receiver<HeartbeatState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the heartbeat loop in the background
    pub fn spawn(self, cancel_token: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(cancel_token).await })
    }

    /// Run until cancelled (`Ok`) or the first failed update (`Err`)
    pub async fn run(self, cancel_token: CancellationToken) -> Result<()> {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            check_id = %self.check_id,
            interval = ?self.interval,
            "Health heartbeat started"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel_token.cancelled() => {
                    self.state_tx.send_replace(HeartbeatState::Stopped);
                    info!(check_id = %self.check_id, "Health heartbeat stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(source) = self
                        .backend
                        .update_health(&self.check_id, HealthStatus::Passing)
                        .await
                    {
                        self.state_tx.send_replace(HeartbeatState::Failed);
                        error!(
                            check_id = %self.check_id,
                            error = %source,
                            "Health update failed, heartbeat exiting"
                        );
                        return Err(Error::Heartbeat {
                            check_id: self.check_id.to_string(),
                            source,
                        });
                    }
                    debug!(check_id = %self.check_id, "Health update sent");
                }
            }
        }
    }
}
