//! Discovery backend capability
//!
//! The registration path only needs four remote operations. Implementations
//! are shared between the registrar and both background tasks through an
//! `Arc<dyn DiscoveryBackend>`, so every call must be safe to issue
//! concurrently.

pub mod consul;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::discovery::model::{
    HealthCheckId, HealthStatus, MembershipSnapshot, RegistrationRecord, ServiceId, WatchQuery,
};
use crate::error::BackendError;

pub use consul::ConsulClient;

/// Infinite, non-restartable sequence of membership snapshots.
/// The first error item is also the last item.
pub type SnapshotStream = BoxStream<'static, Result<MembershipSnapshot, BackendError>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    async fn register(&self, record: &RegistrationRecord) -> Result<(), BackendError>;

    async fn deregister(&self, service_id: &ServiceId) -> Result<(), BackendError>;

    async fn update_health(
        &self,
        check_id: &HealthCheckId,
        status: HealthStatus,
    ) -> Result<(), BackendError>;

    /// Subscribe to membership changes; nothing is requested until polled
    fn watch(&self, query: WatchQuery) -> SnapshotStream;
}
