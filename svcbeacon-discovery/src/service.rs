//! Service bring-up and shutdown
//!
//! [`Service::start`] runs the registration sequence in the foreground and
//! only then spawns the background tasks. [`RunningService::shutdown`]
//! cancels them and removes the registration under the same id it was
//! created with.

use std::net::SocketAddr;
use std::sync::Arc;

use svcbeacon_core::Settings;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::DiscoveryBackend;
use crate::discovery::{
    HealthCheckSpec, HealthHeartbeat, HeartbeatState, MembershipEvent, MembershipWatcher,
    Registrar, RegistrationRecord, ServiceDescriptor, ServiceId, WatchQuery,
};
use crate::error::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 64;

type TaskHandle = JoinHandle<Result<()>>;

/// A service that has not been registered yet
pub struct Service {
    settings: Settings,
    backend: Arc<dyn DiscoveryBackend>,
    listener: Option<TcpListener>,
}

impl Service {
    #[must_use]
    pub fn new(settings: Settings, backend: Arc<dyn DiscoveryBackend>) -> Self {
        Self {
            settings,
            backend,
            listener: None,
        }
    }

    /// Register an already bound listener instead of binding a new one
    #[must_use]
    pub fn with_listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Bind, register, then start the heartbeat and (if enabled) the watcher.
    ///
    /// Nothing runs in the background unless registration succeeded.
    pub async fn start(self) -> Result<RunningService> {
        let Self {
            settings,
            backend,
            listener,
        } = self;

        let mut descriptor = ServiceDescriptor::from(&settings.service);
        let check = HealthCheckSpec::new(settings.discovery.health_check_ttl);

        let listener = match listener {
            Some(listener) => listener,
            None => Registrar::bind(&descriptor.address, descriptor.port).await?,
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::RegistrationBuild(format!("could not read listener address: {e}")))?;

        let record = Registrar::resolve_record(&mut descriptor, &check, &listener)?;
        Registrar::new(Arc::clone(&backend)).register(&record).await?;

        let cancel_token = CancellationToken::new();

        let heartbeat = HealthHeartbeat::new(Arc::clone(&backend), record.check_id.clone(), &record.check);
        let heartbeat_state = heartbeat.state();
        let heartbeat_task = heartbeat.spawn(cancel_token.child_token());

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let watcher_task = if settings.discovery.enable_watch {
            let watcher = MembershipWatcher::new(
                Arc::clone(&backend),
                WatchQuery::service(record.service.name.clone()),
                record.id.clone(),
                event_tx.clone(),
            );
            Some(watcher.spawn(cancel_token.child_token()))
        } else {
            debug!(service = %record.service.name, "Membership watch disabled");
            None
        };

        Ok(RunningService {
            record,
            local_addr,
            listener: Some(listener),
            backend,
            cancel_token,
            heartbeat_state,
            event_tx,
            heartbeat_task: Some(heartbeat_task),
            watcher_task,
        })
    }
}

/// A registered service with its background tasks running
///
/// Dropping it cancels the tasks but leaves the registration in place; the
/// backend removes it once the TTL lapses. Call [`Self::shutdown`] to
/// deregister right away.
pub struct RunningService {
    record: RegistrationRecord,
    local_addr: SocketAddr,
    listener: Option<TcpListener>,
    backend: Arc<dyn DiscoveryBackend>,
    cancel_token: CancellationToken,
    heartbeat_state: watch::Receiver<HeartbeatState>,
    event_tx: broadcast::Sender<MembershipEvent>,
    heartbeat_task: Option<TaskHandle>,
    watcher_task: Option<TaskHandle>,
}

impl RunningService {
    #[must_use]
    pub fn record(&self) -> &RegistrationRecord {
        &self.record
    }

    #[must_use]
    pub fn service_id(&self) -> &ServiceId {
        &self.record.id
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Hand the bound listener to the request server; `None` after the first call
    pub fn take_listener(&mut self) -> Option<TcpListener> {
        self.listener.take()
    }

    /// Receive membership events; nothing is ever sent when the watch is disabled
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.event_tx.subscribe()
    }

    #[must_use]
    pub fn heartbeat_state(&self) -> watch::Receiver<HeartbeatState> {
        self.heartbeat_state.clone()
    }

    /// Resolve when the first background task ends.
    ///
    /// Returns its error if it failed. Returns `Ok` right away when no task
    /// is left to wait on.
    pub async fn wait(&mut self) -> Result<()> {
        if self.heartbeat_task.is_none() && self.watcher_task.is_none() {
            return Ok(());
        }

        tokio::select! {
            result = join_task(&mut self.heartbeat_task) => result,
            result = join_task(&mut self.watcher_task) => result,
        }
    }

    /// Cancel both tasks, wait for them, then deregister
    pub async fn shutdown(mut self) -> Result<()> {
        info!(service_id = %self.record.id, "Shutting down service");
        self.cancel_token.cancel();

        let tasks = [
            ("heartbeat", self.heartbeat_task.take()),
            ("watcher", self.watcher_task.take()),
        ];
        for (task, handle) in tasks {
            let Some(handle) = handle else { continue };
            match handle.await {
                Ok(Ok(())) => debug!(task, "Background task stopped"),
                Ok(Err(e)) => warn!(task, error = %e, "Background task had already failed"),
                Err(e) => warn!(task, error = %e, "Background task panicked or was aborted"),
            }
        }

        self.backend
            .deregister(&self.record.id)
            .await
            .map_err(|source| Error::Deregistration {
                service_id: self.record.id.to_string(),
                source,
            })?;

        info!(service_id = %self.record.id, "Service deregistered");
        Ok(())
    }
}

impl Drop for RunningService {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Await a task slot, clearing it once the task has finished.
/// An empty slot never resolves.
async fn join_task(slot: &mut Option<TaskHandle>) -> Result<()> {
    let Some(handle) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let result = handle.await;
    *slot = None;
    result?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockDiscoveryBackend;
    use crate::discovery::{MembershipSnapshot, ServiceEntry};
    use crate::error::BackendError;
    use futures::{stream, StreamExt};
    use std::sync::Mutex;
    use std::time::Duration;
    use svcbeacon_core::{DiscoveryBackendConfig, DiscoverySettings, ServiceSettings};

    type CallLog = Arc<Mutex<Vec<String>>>;

    fn settings(enable_watch: bool) -> Settings {
        Settings {
            service: ServiceSettings {
                name: "svc.one".to_string(),
                address: "127.0.0.1".to_string(),
                port: 0,
                tags: vec!["go".to_string(), "service".to_string()],
            },
            discovery: DiscoverySettings {
                backend: DiscoveryBackendConfig::default(),
                health_check_ttl: Duration::from_secs(10),
                enable_watch,
            },
        }
    }

    /// Backend that records register, heartbeat and deregister calls
    fn recording_backend(log: &CallLog) -> MockDiscoveryBackend {
        let mut backend = MockDiscoveryBackend::new();

        let calls = Arc::clone(log);
        backend.expect_register().returning(move |record| {
            calls.lock().unwrap().push(format!("register:{}", record.id));
            Ok(())
        });
        let calls = Arc::clone(log);
        backend.expect_update_health().returning(move |check_id, _| {
            calls.lock().unwrap().push(format!("update_health:{check_id}"));
            Ok(())
        });
        let calls = Arc::clone(log);
        backend.expect_deregister().returning(move |service_id| {
            calls.lock().unwrap().push(format!("deregister:{service_id}"));
            Ok(())
        });
        backend
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_registers_bound_port() {
        let log = CallLog::default();
        let mut backend = recording_backend(&log);
        backend.expect_watch().never();

        let running = Service::new(settings(false), Arc::new(backend)).start().await.unwrap();
        let port = running.local_addr().port();
        assert_ne!(port, 0);
        assert_eq!(running.record().service.port, port);
        assert_eq!(running.service_id().as_str(), format!("svc-one-{port}"));
        assert_eq!(running.record().check_id.as_str(), format!("svc-one-{port}_health"));

        tokio::time::sleep(Duration::from_secs(1)).await;

        let calls = log.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                format!("register:svc-one-{port}"),
                format!("update_health:svc-one-{port}_health"),
            ]
        );
        assert_eq!(*running.heartbeat_state().borrow(), HeartbeatState::Running);
    }

    #[tokio::test]
    async fn test_register_failure_starts_nothing() {
        let mut backend = MockDiscoveryBackend::new();
        backend
            .expect_register()
            .times(1)
            .returning(|_| Err(BackendError::Network("connection refused".to_string())));
        backend.expect_update_health().never();
        backend.expect_watch().never();
        backend.expect_deregister().never();

        let result = Service::new(settings(true), Arc::new(backend)).start().await;
        assert!(matches!(result, Err(Error::Registration { .. })));
    }

    #[tokio::test]
    async fn test_bind_failure_skips_registration() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = settings(false);
        config.service.port = taken.local_addr().unwrap().port();

        let mut backend = MockDiscoveryBackend::new();
        backend.expect_register().never();
        backend.expect_update_health().never();

        let result = Service::new(config, Arc::new(backend)).start().await;
        assert!(matches!(result, Err(Error::Listen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_disabled_heartbeat_still_runs() {
        let log = CallLog::default();
        let mut backend = recording_backend(&log);
        backend.expect_watch().never();

        let running = Service::new(settings(false), Arc::new(backend)).start().await.unwrap();

        // updates at 0s, 5s and 10s
        tokio::time::sleep(Duration::from_secs(11)).await;
        let heartbeats = log
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with("update_health:"))
            .count();
        assert_eq!(heartbeats, 3);

        running.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_enabled_reports_new_instance() {
        let log = CallLog::default();
        let mut backend = recording_backend(&log);
        backend
            .expect_watch()
            .withf(|query| query.service == "svc.one")
            .times(1)
            .returning(|_| {
                let other = ServiceEntry {
                    instance_id: "svc-one-1".to_string(),
                    address: "10.0.0.2".to_string(),
                    port: 1,
                    tags: vec![],
                };
                stream::iter(vec![Ok(MembershipSnapshot::new(vec![other]))])
                    .chain(stream::pending())
                    .boxed()
            });

        let running = Service::new(settings(true), Arc::new(backend)).start().await.unwrap();
        let mut events = running.subscribe();

        let MembershipEvent::InstanceJoined(entry) = events.recv().await.unwrap();
        assert_eq!(entry.instance_id, "svc-one-1");

        running.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_deregisters_same_id() {
        let log = CallLog::default();
        let mut backend = recording_backend(&log);
        backend.expect_watch().returning(|_| stream::pending().boxed());

        let running = Service::new(settings(true), Arc::new(backend)).start().await.unwrap();
        let service_id = running.service_id().clone();
        let state = running.heartbeat_state();

        tokio::time::sleep(Duration::from_secs(1)).await;
        running.shutdown().await.unwrap();

        let calls = log.lock().unwrap().clone();
        assert_eq!(calls.first(), Some(&format!("register:{service_id}")));
        assert_eq!(calls.last(), Some(&format!("deregister:{service_id}")));
        assert_eq!(*state.borrow(), HeartbeatState::Stopped);

        // Nothing after shutdown
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(log.lock().unwrap().len(), calls.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_heartbeat_failure() {
        let mut backend = MockDiscoveryBackend::new();
        backend.expect_register().returning(|_| Ok(()));
        backend
            .expect_update_health()
            .returning(|_, _| Err(BackendError::Network("agent gone".to_string())));
        backend.expect_deregister().times(1).returning(|_| Ok(()));

        let mut running = Service::new(settings(false), Arc::new(backend)).start().await.unwrap();

        let err = running.wait().await.unwrap_err();
        assert!(matches!(err, Error::Heartbeat { .. }));
        assert_eq!(*running.heartbeat_state().borrow(), HeartbeatState::Failed);

        // Both slots are empty now
        running.wait().await.unwrap();
        running.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_watch_failure() {
        let log = CallLog::default();
        let mut backend = recording_backend(&log);
        backend.expect_watch().times(1).returning(|_| {
            stream::iter(vec![Err(BackendError::Network("watch dropped".to_string()))])
                .chain(stream::pending())
                .boxed()
        });

        let mut running = Service::new(settings(true), Arc::new(backend)).start().await.unwrap();
        let service_id = running.service_id().clone();

        let err = running.wait().await.unwrap_err();
        assert!(matches!(err, Error::Watch { ref service, .. } if service == "svc.one"));

        // The heartbeat keeps its slot and is stopped by shutdown
        running.shutdown().await.unwrap();
        assert_eq!(
            log.lock().unwrap().last(),
            Some(&format!("deregister:{service_id}"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_watch_closed() {
        let log = CallLog::default();
        let mut backend = recording_backend(&log);
        backend
            .expect_watch()
            .times(1)
            .returning(|_| stream::empty().boxed());

        let mut running = Service::new(settings(true), Arc::new(backend)).start().await.unwrap();

        let err = running.wait().await.unwrap_err();
        assert!(matches!(err, Error::WatchClosed { ref service } if service == "svc.one"));
        assert_eq!(*running.heartbeat_state().borrow(), HeartbeatState::Running);

        running.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_take_listener_once() {
        let log = CallLog::default();
        let backend = recording_backend(&log);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut running = Service::new(settings(false), Arc::new(backend))
            .with_listener(listener)
            .start()
            .await
            .unwrap();

        assert_eq!(running.local_addr().port(), port);
        assert!(running.take_listener().is_some());
        assert!(running.take_listener().is_none());
    }
}
