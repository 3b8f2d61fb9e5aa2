use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::TcpKeepalive;
use tokio::net::{TcpListener, TcpStream};

use crate::error::MountError;

use super::{Accepted, Mount};

const KEEPALIVE: Duration = Duration::from_secs(30);

pub struct TcpMount {
    listener: Mutex<Option<Arc<TcpListener>>>,
    addr: SocketAddr,
}

impl TcpMount {
    pub async fn bind(address: IpAddr, port: u16) -> Result<Self, MountError> {
        let addr = SocketAddr::new(address, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| MountError::Tcp { addr, source })?;
        let addr = listener.local_addr().map_err(|source| MountError::Tcp { addr, source })?;
        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            addr,
        })
    }

    fn apply_keepalive(stream: &TcpStream) {
        let sock = socket2::SockRef::from(stream);
        let keepalive = TcpKeepalive::new().with_time(KEEPALIVE);
        let _ = sock.set_tcp_keepalive(&keepalive);
    }
}

#[async_trait]
impl Mount for TcpMount {
    async fn accept(&self) -> std::io::Result<Accepted> {
        let listener = match self.listener.lock().as_ref() {
            Some(listener) => Arc::clone(listener),
            None => return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "mount closed")),
        };
        let (stream, peer) = listener.accept().await?;
        Self::apply_keepalive(&stream);
        Ok(Accepted::Tcp(stream, peer))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    fn close(&self) {
        self.listener.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn binding_port_zero_picks_an_ephemeral_port() {
        let mount = TcpMount::bind("127.0.0.1".parse().unwrap(), 0).await.unwrap();
        assert_ne!(mount.addr.port(), 0);
    }

    #[tokio::test]
    async fn accepts_a_connecting_client() {
        let mount = TcpMount::bind("127.0.0.1".parse().unwrap(), 0).await.unwrap();
        let addr = mount.addr;

        let server = tokio::spawn(async move {
            match mount.accept().await.unwrap() {
                Accepted::Tcp(mut stream, _peer) => {
                    let mut buf = [0u8; 4];
                    stream.read_exact(&mut buf).await.unwrap();
                    stream.write_all(&buf).await.unwrap();
                }
                Accepted::Unix(_) => panic!("tcp mount accepted a unix connection"),
            }
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_accepts() {
        let mount = TcpMount::bind("127.0.0.1".parse().unwrap(), 0).await.unwrap();
        mount.close();
        mount.close();
        assert!(mount.accept().await.is_err());
    }
}
