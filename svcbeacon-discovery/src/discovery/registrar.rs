//! Listener binding and service registration
//!
//! Bring-up order is fixed: bind, read the bound port back, derive the
//! identifiers from it, then register. The identifiers computed here are the
//! ones every later heartbeat and the final deregister use.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info};

use super::model::{HealthCheckSpec, RegistrationRecord, ServiceDescriptor};
use crate::backend::DiscoveryBackend;
use crate::error::{Error, Result};

/// Registers this instance with the discovery backend
pub struct Registrar {
    backend: Arc<dyn DiscoveryBackend>,
}

impl Registrar {
    #[must_use]
    pub fn new(backend: Arc<dyn DiscoveryBackend>) -> Self {
        Self { backend }
    }

    /// Open a TCP listener on `address:port`; port 0 asks the OS for one
    pub async fn bind(address: &str, port: u16) -> Result<TcpListener> {
        let bind_address = join_host_port(address, port);
        TcpListener::bind(&bind_address)
            .await
            .map_err(|source| Error::Listen {
                address: bind_address,
                source,
            })
    }

    /// Build the registration record from the listener's real address.
    ///
    /// Overwrites `descriptor.port` with the bound port.
    pub fn resolve_record(
        descriptor: &mut ServiceDescriptor,
        check: &HealthCheckSpec,
        listener: &TcpListener,
    ) -> Result<RegistrationRecord> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::RegistrationBuild(format!("could not read listener address: {e}")))?;

        Self::resolve_record_for(descriptor, check, &local_addr.to_string())
    }

    /// Same as [`Self::resolve_record`], from a `host:port` string
    pub fn resolve_record_for(
        descriptor: &mut ServiceDescriptor,
        check: &HealthCheckSpec,
        bound_address: &str,
    ) -> Result<RegistrationRecord> {
        let (host, port) = split_host_port(bound_address)?;
        descriptor.port = port;

        let record = RegistrationRecord::new(descriptor.clone(), check.clone());

        debug!(
            bound_host = %host,
            address = %record.service.address,
            port = record.service.port,
            service_id = %record.id,
            check_id = %record.check_id,
            "Service configured for registration"
        );

        Ok(record)
    }

    /// Single register call; a failure is returned as is, never retried
    pub async fn register(&self, record: &RegistrationRecord) -> Result<()> {
        self.backend
            .register(record)
            .await
            .map_err(|source| Error::Registration {
                service_id: record.id.to_string(),
                source,
            })?;

        info!(
            service = %record.service.name,
            service_id = %record.id,
            address = %record.service.address,
            port = record.service.port,
            "Service registered"
        );
        Ok(())
    }
}

/// `host:port`, bracketing IPv6 literals
fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts
pub fn split_host_port(address: &str) -> Result<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::RegistrationBuild(format!("missing port in address '{address}'")))?;

    let host = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .ok_or_else(|| Error::RegistrationBuild(format!("unbalanced brackets in address '{address}'")))?,
        None if host.contains(':') => {
            return Err(Error::RegistrationBuild(format!(
                "too many colons in address '{address}'"
            )));
        }
        None => host,
    };

    if host.trim().is_empty() {
        return Err(Error::RegistrationBuild(format!(
            "could not resolve host from address '{address}'"
        )));
    }

    let port = port.trim();
    if port.is_empty() {
        return Err(Error::RegistrationBuild(format!(
            "could not resolve port from address '{address}'"
        )));
    }
    let port = port.parse::<u16>().map_err(|e| {
        Error::RegistrationBuild(format!("port '{port}' is not a valid integer: {e}"))
    })?;

    Ok((host.to_string(), port))
}
