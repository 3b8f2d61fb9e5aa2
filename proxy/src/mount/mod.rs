//! A Socket Mount is a bound listener for one instance: either a loopback
//! TCP port or a Unix domain socket directory. The Connection Manager
//! accepts from it without needing to know which kind it's dealing with.

mod tcp;
pub(crate) mod unix;

pub(crate) use unix::UnixMount;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::config::ListenSpec;
use crate::error::MountError;
use crate::instance_id::InstanceId;

/// An accepted client connection plus whatever diagnostic context the
/// mount kind can offer about where it came from.
pub enum Accepted {
    Tcp(TcpStream, std::net::SocketAddr),
    Unix(tokio::net::UnixStream),
}

#[async_trait]
pub trait Mount: Send + Sync {
    /// Blocks until a client connects or the listener errors out.
    async fn accept(&self) -> std::io::Result<Accepted>;

    /// Where this mount is listening, for logs and `/readiness` reporting.
    fn describe(&self) -> String;

    /// Stops accepting new connections and releases the underlying
    /// listener. Idempotent: a second call is a no-op. Does not wait for
    /// connections already accepted to finish.
    fn close(&self);
}

/// Opens a listener for `spec` on behalf of `instance`. Callers opening
/// several mounts in one configuration pass should keep the already-open
/// ones around and drop them all if a later one fails, since a partially
/// bound configuration is not a valid state to serve from.
pub async fn open(instance: &InstanceId, spec: &ListenSpec) -> Result<Box<dyn Mount>, MountError> {
    match spec {
        ListenSpec::Tcp { address, port } => {
            let mount = tcp::TcpMount::bind(*address, *port).await?;
            Ok(Box::new(mount))
        }
        ListenSpec::Unix { dir } => {
            let mount = unix::UnixMount::bind(instance, dir).await?;
            Ok(Box::new(mount))
        }
    }
}
