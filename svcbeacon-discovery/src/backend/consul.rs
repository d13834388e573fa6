//! Consul agent HTTP client
//!
//! Speaks the v1 agent and health endpoints. Membership watches are long
//! polls ("blocking queries") keyed on the `X-Consul-Index` header.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use svcbeacon_core::DiscoveryBackendConfig;
use url::Url;

use super::{DiscoveryBackend, SnapshotStream};
use crate::discovery::model::{
    backend_duration, HealthCheckId, HealthStatus, MembershipSnapshot, RegistrationRecord,
    ServiceEntry, ServiceId, WatchQuery,
};
use crate::error::BackendError;

/// Timeout for non-blocking agent calls in seconds
const REQUEST_TIMEOUT_SECS: u64 = 10;

const CONNECT_TIMEOUT_SECS: u64 = 5;

/// How long the server may hold a blocking query open
pub const DEFAULT_WATCH_WAIT: Duration = Duration::from_secs(300);

/// Extra client-side time on top of the server-side wait
const WATCH_TIMEOUT_SLACK: Duration = Duration::from_secs(30);

const INDEX_HEADER: &str = "X-Consul-Index";

/// Note attached to every TTL update
const HEALTH_UPDATE_OUTPUT: &str = "healthy";

/// Consul client
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    base_url: Url,
    client: Client,
    watch_wait: Duration,
}

impl ConsulClient {
    /// Create a client for `scheme://address`
    pub fn new(config: &DiscoveryBackendConfig) -> Result<Self, BackendError> {
        let raw = config.base_url();
        let base_url = Url::parse(&raw)
            .map_err(|e| BackendError::InvalidConfig(format!("invalid backend address '{raw}': {e}")))?;

        if !matches!(base_url.scheme(), "http" | "https") || base_url.cannot_be_a_base() {
            return Err(BackendError::InvalidConfig(format!(
                "unsupported backend URL '{raw}'"
            )));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| BackendError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            client,
            watch_wait: DEFAULT_WATCH_WAIT,
        })
    }

    /// Override the blocking query wait time
    #[must_use]
    pub fn with_watch_wait(mut self, wait: Duration) -> Self {
        self.watch_wait = wait;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build an endpoint URL; each segment is percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| BackendError::InvalidConfig(format!("'{}' cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// One blocking query; returns the snapshot and the index it reflects
    async fn fetch_membership(
        &self,
        query: &WatchQuery,
        index: u64,
    ) -> Result<(MembershipSnapshot, u64), BackendError> {
        let url = self.endpoint(&["v1", "health", "service", &query.service])?;

        let mut request = self
            .client
            .get(url)
            .timeout(self.watch_wait + WATCH_TIMEOUT_SLACK)
            .query(&[
                ("index", index.to_string()),
                ("wait", backend_duration(self.watch_wait)),
            ]);
        if query.passing_only {
            request = request.query(&[("passing", "true")]);
        }

        let response = check_response(request.send().await?)?;

        let new_index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .ok_or_else(|| BackendError::Parse(format!("missing or invalid {INDEX_HEADER} header")))?;

        let bytes = response.bytes().await?;
        let entries: Vec<HealthEntry> = serde_json::from_slice(&bytes)?;

        let snapshot = MembershipSnapshot::new(entries.into_iter().map(ServiceEntry::from).collect());
        Ok((snapshot, new_index))
    }
}

/// Check HTTP response status before processing body
fn check_response(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        return Err(BackendError::Http {
            status,
            url: response.url().to_string(),
        });
    }
    Ok(response)
}

#[async_trait]
impl DiscoveryBackend for ConsulClient {
    async fn register(&self, record: &RegistrationRecord) -> Result<(), BackendError> {
        let url = self.endpoint(&["v1", "agent", "service", "register"])?;
        let response = self
            .client
            .put(url)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .json(&AgentServiceRegistration::from(record))
            .send()
            .await?;
        check_response(response)?;
        Ok(())
    }

    async fn deregister(&self, service_id: &ServiceId) -> Result<(), BackendError> {
        let url = self.endpoint(&["v1", "agent", "service", "deregister", service_id.as_str()])?;
        let response = self
            .client
            .put(url)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await?;
        check_response(response)?;
        Ok(())
    }

    async fn update_health(
        &self,
        check_id: &HealthCheckId,
        status: HealthStatus,
    ) -> Result<(), BackendError> {
        let url = self.endpoint(&["v1", "agent", "check", "update", check_id.as_str()])?;
        let response = self
            .client
            .put(url)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .json(&json!({
                "Status": status.as_str(),
                "Output": HEALTH_UPDATE_OUTPUT,
            }))
            .send()
            .await?;
        check_response(response)?;
        Ok(())
    }

    fn watch(&self, query: WatchQuery) -> SnapshotStream {
        let state = WatchState {
            client: self.clone(),
            query,
            index: 0,
        };

        stream::try_unfold(state, next_snapshot).boxed()
    }
}

struct WatchState {
    client: ConsulClient,
    query: WatchQuery,
    index: u64,
}

/// Block until the membership index moves, then yield the new snapshot
async fn next_snapshot(
    mut state: WatchState,
) -> Result<Option<(MembershipSnapshot, WatchState)>, BackendError> {
    loop {
        let (snapshot, new_index) = state
            .client
            .fetch_membership(&state.query, state.index)
            .await?;

        let previous = state.index;
        // An index that moves backwards means the server state was reset
        state.index = if new_index < previous { 0 } else { new_index };

        if previous != 0 && new_index == previous {
            // Wait expired without a change
            continue;
        }

        return Ok(Some((snapshot, state)));
    }
}

/// Body of `PUT /v1/agent/service/register`
#[derive(Debug, Serialize)]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Tags")]
    tags: &'a [String],
    #[serde(rename = "Address")]
    address: &'a str,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Check")]
    check: AgentServiceCheck<'a>,
}

#[derive(Debug, Serialize)]
struct AgentServiceCheck<'a> {
    #[serde(rename = "CheckID")]
    check_id: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_critical_service_after: String,
    #[serde(rename = "FailuresBeforeCritical")]
    failures_before_critical: u32,
    #[serde(rename = "TLSSkipVerify")]
    tls_skip_verify: bool,
}

impl<'a> From<&'a RegistrationRecord> for AgentServiceRegistration<'a> {
    fn from(record: &'a RegistrationRecord) -> Self {
        Self {
            id: record.id.as_str(),
            name: &record.service.name,
            tags: &record.service.tags,
            address: &record.service.address,
            port: record.service.port,
            check: AgentServiceCheck {
                check_id: record.check_id.as_str(),
                ttl: backend_duration(record.check.ttl),
                deregister_critical_service_after: backend_duration(
                    record.check.deregister_critical_service_after,
                ),
                failures_before_critical: record.check.failures_before_critical,
                tls_skip_verify: record.check.tls_skip_verify,
            },
        }
    }
}

/// Element of `GET /v1/health/service/{name}`
#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: AgentService,
}

#[derive(Debug, Deserialize)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port", default)]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Option<Vec<String>>,
}

impl From<HealthEntry> for ServiceEntry {
    fn from(entry: HealthEntry) -> Self {
        let service = entry.service;
        Self {
            instance_id: service.id,
            address: service.address,
            port: service.port,
            tags: service.tags.unwrap_or_default(),
        }
    }
}
