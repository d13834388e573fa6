//! Membership watcher
//!
//! Follows the passing instances of this service and reports new arrivals.
//! Only the most recent entry of each snapshot is inspected, so departures
//! and out-of-order joins are not detected.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::model::{MembershipSnapshot, ServiceEntry, ServiceId, WatchQuery};
use crate::backend::DiscoveryBackend;
use crate::error::{Error, Result};

/// Events published by the watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MembershipEvent {
    /// Another instance became the latest passing entry
    InstanceJoined(ServiceEntry),
}

pub struct MembershipWatcher {
    backend: Arc<dyn DiscoveryBackend>,
    query: WatchQuery,
    self_id: ServiceId,
    event_tx: broadcast::Sender<MembershipEvent>,
}

impl MembershipWatcher {
    #[must_use]
    pub fn new(
        backend: Arc<dyn DiscoveryBackend>,
        query: WatchQuery,
        self_id: ServiceId,
        event_tx: broadcast::Sender<MembershipEvent>,
    ) -> Self {
        Self {
            backend,
            query,
            self_id,
            event_tx,
        }
    }

    pub fn spawn(self, cancel_token: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(cancel_token).await })
    }

    /// Consume the watch stream until cancelled or it fails.
    ///
    /// A stream error or the stream ending is returned as an error; the
    /// subscription is never restarted.
    pub async fn run(self, cancel_token: CancellationToken) -> Result<()> {
        let service = self.query.service.clone();
        let mut snapshots = self.backend.watch(self.query.clone());

        info!(service = %service, self_id = %self.self_id, "Membership watcher started");

        loop {
            let next = tokio::select! {
                biased;
                () = cancel_token.cancelled() => {
                    info!(service = %service, "Membership watcher stopped");
                    return Ok(());
                }
                next = snapshots.next() => next,
            };

            match next {
                Some(Ok(snapshot)) => self.handle_snapshot(&snapshot),
                Some(Err(source)) => {
                    error!(service = %service, error = %source, "Membership watch failed");
                    return Err(Error::Watch { service, source });
                }
                None => {
                    error!(service = %service, "Membership watch stream ended");
                    return Err(Error::WatchClosed { service });
                }
            }
        }
    }

    fn handle_snapshot(&self, snapshot: &MembershipSnapshot) {
        debug!(
            service = %self.query.service,
            instances = snapshot.entries.len(),
            "Membership snapshot received"
        );

        let Some(entry) = joined_instance(snapshot, &self.self_id) else {
            return;
        };

        info!(
            service = %self.query.service,
            instance_id = %entry.instance_id,
            address = %entry.address,
            port = entry.port,
            tags = ?entry.tags,
            "Instance joined"
        );

        // Err only means nobody is subscribed
        let _ = self
            .event_tx
            .send(MembershipEvent::InstanceJoined(entry.clone()));
    }
}

/// Latest entry of `snapshot` if it belongs to another instance
#[must_use]
pub fn joined_instance<'a>(
    snapshot: &'a MembershipSnapshot,
    self_id: &ServiceId,
) -> Option<&'a ServiceEntry> {
    snapshot
        .latest()
        .filter(|entry| entry.instance_id != self_id.as_str())
}
