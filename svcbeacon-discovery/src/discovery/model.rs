//! Registration and membership data model

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use svcbeacon_core::config::{FALLBACK_HEALTH_CHECK_TTL, MIN_HEALTH_CHECK_TTL};
use svcbeacon_core::ServiceSettings;

/// Consecutive failed checks before the backend marks the service critical
pub const FAILURES_BEFORE_CRITICAL: u32 = 3;

/// Suffix appended to a [`ServiceId`] to form its [`HealthCheckId`]
pub const HEALTH_CHECK_SUFFIX: &str = "_health";

/// What gets registered: name, address, port and tags of this instance
///
/// `port` may be 0 until the listener is bound; [`Registrar::resolve_record`]
/// overwrites it with the OS-assigned port.
///
/// [`Registrar::resolve_record`]: super::registrar::Registrar::resolve_record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
}

impl ServiceDescriptor {
    #[must_use]
    pub fn service_id(&self) -> ServiceId {
        ServiceId::derive(&self.name, self.port)
    }
}

impl From<&ServiceSettings> for ServiceDescriptor {
    fn from(settings: &ServiceSettings) -> Self {
        Self {
            name: settings.name.clone(),
            address: settings.address.clone(),
            port: settings.port,
            tags: settings.tags.clone(),
        }
    }
}

/// Stable key under which a single instance is registered
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    /// `name` with dots replaced by dashes, then `-<port>`
    #[must_use]
    pub fn derive(name: &str, port: u16) -> Self {
        Self(format!("{}-{port}", name.replace('.', "-")).trim().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn check_id(&self) -> HealthCheckId {
        HealthCheckId(format!("{}{HEALTH_CHECK_SUFFIX}", self.0))
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the TTL check attached to a registration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HealthCheckId(String);

impl HealthCheckId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HealthCheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// TTL health check definition sent with the registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSpec {
    pub ttl: Duration,
    pub failures_before_critical: u32,
    pub deregister_critical_service_after: Duration,
    pub tls_skip_verify: bool,
}

impl HealthCheckSpec {
    /// Build a check for `ttl`; values under 5s are replaced by the 8s fallback
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        let ttl = if ttl < MIN_HEALTH_CHECK_TTL {
            FALLBACK_HEALTH_CHECK_TTL
        } else {
            ttl
        };

        Self {
            ttl,
            failures_before_critical: FAILURES_BEFORE_CRITICAL,
            deregister_critical_service_after: ttl,
            tls_skip_verify: true,
        }
    }

    /// Cadence of health updates: half the TTL
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.ttl / 2
    }
}

/// Encode a duration the way the backend parses it ("10s", "1500ms")
#[must_use]
pub fn backend_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Everything sent in the single register call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub id: ServiceId,
    pub check_id: HealthCheckId,
    pub service: ServiceDescriptor,
    pub check: HealthCheckSpec,
}

impl RegistrationRecord {
    /// Derive both identifiers from the (already bound) descriptor
    #[must_use]
    pub fn new(service: ServiceDescriptor, check: HealthCheckSpec) -> Self {
        let id = service.service_id();
        let check_id = id.check_id();
        Self {
            id,
            check_id,
            service,
            check,
        }
    }
}

/// Status reported by a TTL update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
}

impl HealthStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passing => "passing",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Kind of backend change a watch subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Service,
}

/// Filter describing which membership changes to observe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchQuery {
    pub kind: WatchKind,
    pub service: String,
    pub passing_only: bool,
}

impl WatchQuery {
    /// Passing instances of the named service
    #[must_use]
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            kind: WatchKind::Service,
            service: name.into(),
            passing_only: true,
        }
    }
}

/// One live instance as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub instance_id: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
}

/// Passing instances of a service at one point in time, in backend order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipSnapshot {
    pub entries: Vec<ServiceEntry>,
}

impl MembershipSnapshot {
    #[must_use]
    pub fn new(entries: Vec<ServiceEntry>) -> Self {
        Self { entries }
    }

    /// Most recently reported entry
    #[must_use]
    pub fn latest(&self) -> Option<&ServiceEntry> {
        self.entries.last()
    }
}
