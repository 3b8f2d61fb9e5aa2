//! Dialer: obtains a current `ConnectionInfo` from the Resolver and opens
//! a mutually-authenticated TLS 1.3 tunnel to it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::DialError;
use crate::instance_id::InstanceId;
use crate::resolver::Resolve;

/// A trait object can only name one non-auto trait, so `AsyncRead` and
/// `AsyncWrite` are bundled behind this marker trait with a blanket impl
/// rather than named directly in the `dyn` below.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A byte stream to a dialed instance. `TlsStream` erases the concrete
/// `tokio_rustls` type behind the traits the splicer needs.
pub type Stream = Box<dyn AsyncStream>;

/// Anything the Connection Manager can use to turn an instance id into a
/// live byte stream. Represented as a trait so test doubles can stand in
/// for a real network dial in tests.
#[async_trait]
pub trait Dial: Send + Sync {
    async fn dial(&self, id: &InstanceId) -> Result<Stream, DialError>;
    async fn close(&self);
}

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Dialer {
    resolver: Arc<dyn Resolve>,
}

impl Dialer {
    pub fn new(resolver: Arc<dyn Resolve>) -> Self {
        Self { resolver }
    }

    async fn dial_inner(&self, id: &InstanceId) -> Result<Stream, DialError> {
        let info = self.resolver.resolve(id).await?;
        let addr = SocketAddr::new(info.ip_address, 5432);

        let tcp = TcpStream::connect(addr).await.map_err(|e| DialError::Connect {
            instance: id.clone(),
            addr: info.ip_address,
            source: e,
        })?;
        let _ = tcp.set_nodelay(true);

        let connector = TlsConnector::from(info.tls_client_config.clone());
        let server_name = rustls::pki_types::ServerName::IpAddress(info.ip_address.into());

        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| DialError::Tls {
                instance: id.clone(),
                source: e,
            })?;

        debug!(instance = %id, addr = %addr, "dialed instance");
        Ok(Box::new(tls))
    }
}

#[async_trait]
impl Dial for Dialer {
    async fn dial(&self, id: &InstanceId) -> Result<Stream, DialError> {
        tokio::time::timeout(DIAL_TIMEOUT, self.dial_inner(id))
            .await
            .unwrap_or_else(|_| {
                Err(DialError::Timeout {
                    instance: id.clone(),
                    timeout: DIAL_TIMEOUT,
                })
            })
    }

    async fn close(&self) {
        self.resolver.close().await;
    }
}
