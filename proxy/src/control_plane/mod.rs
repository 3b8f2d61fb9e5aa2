//! The control plane is the opaque external collaborator that hands out
//! ephemeral client certificates and server endpoints. Its wire protocol
//! is explicitly out of scope; this module only defines the shape callers
//! need and a trait boundary so the Resolver never talks to it directly.

#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod remote;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::ResolveError;
use crate::instance_id::InstanceId;

/// Everything a [`Dialer`](crate::dialer::Dialer) needs to open a
/// mutually-authenticated TLS tunnel to an instance.
/// Immutable once returned; a refresh produces a brand new value that
/// atomically replaces the cached one.
#[derive(Clone)]
pub struct ConnectionInfo {
    pub ip_address: IpAddr,
    pub tls_client_config: Arc<rustls::ClientConfig>,
    pub not_after: SystemTime,
}

impl std::fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("ip_address", &self.ip_address)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// The control-plane client boundary: production code talks to a real
/// HTTP backend, tests talk to a mock.
#[async_trait]
pub trait Api: Send + Sync {
    async fn resolve_connection_info(
        &self,
        id: &InstanceId,
    ) -> Result<ConnectionInfo, ResolveError>;
}

/// Selects between the real control-plane client and test doubles.
#[derive(Clone)]
pub enum ControlPlaneBackend {
    Remote(Arc<remote::RemoteApi>),
    #[cfg(any(test, feature = "testing"))]
    Mock(Arc<mock::MockApi>),
}

#[async_trait]
impl Api for ControlPlaneBackend {
    async fn resolve_connection_info(
        &self,
        id: &InstanceId,
    ) -> Result<ConnectionInfo, ResolveError> {
        match self {
            ControlPlaneBackend::Remote(api) => api.resolve_connection_info(id).await,
            #[cfg(any(test, feature = "testing"))]
            ControlPlaneBackend::Mock(api) => api.resolve_connection_info(id).await,
        }
    }
}
