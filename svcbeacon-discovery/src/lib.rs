pub mod backend;
pub mod discovery;
pub mod error;
pub mod service;

pub use backend::{ConsulClient, DiscoveryBackend};
pub use discovery::{
    HealthHeartbeat, HeartbeatState, MembershipEvent, MembershipWatcher, Registrar,
    RegistrationRecord, ServiceDescriptor, ServiceId,
};
pub use error::{BackendError, Error, Result};
pub use service::{RunningService, Service};
