//! Service registration, TTL heartbeat and membership watch

pub mod heartbeat;
pub mod model;
pub mod registrar;
pub mod watcher;

pub use heartbeat::{HealthHeartbeat, HeartbeatState};
pub use model::{
    HealthCheckId, HealthCheckSpec, HealthStatus, MembershipSnapshot, RegistrationRecord,
    ServiceDescriptor, ServiceEntry, ServiceId, WatchKind, WatchQuery,
};
pub use registrar::Registrar;
pub use watcher::{MembershipEvent, MembershipWatcher};
