//! Bidirectional byte copy between a client and a dialed instance, with
//! first-error-wins teardown and exactly one terminal diagnostic per
//! connection.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

/// Why a spliced connection ended. Each direction reports its own cause;
/// we don't collapse both sides onto a single "client" error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    ClientEof,
    ServerEof,
    ClientError,
    ServerError,
}

impl Cause {
    fn log_name(self) -> &'static str {
        match self {
            Cause::ClientEof => "client-EOF",
            Cause::ServerEof => "server-EOF",
            Cause::ClientError => "client-error",
            Cause::ServerError => "server-error",
        }
    }
}

const BUF_SIZE: usize = 16 * 1024;

async fn pump<R, W>(mut from: R, mut to: W, eof: Cause, err: Cause) -> Cause
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) => return eof,
            Ok(n) => n,
            Err(_) => return err,
        };
        if let Err(_) = to.write_all(&buf[..n]).await {
            return err;
        }
    }
}

/// Splices `client` and `server` until either side reports EOF or an
/// error, then shuts both down and emits exactly one terminal log line.
/// The `(client, server)` pair is consumed; callers don't interact with
/// either stream again afterwards.
pub async fn splice<C, S>(mut client: C, mut server: S)
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_r, client_w) = tokio::io::split(&mut client);
    let (server_r, server_w) = tokio::io::split(&mut server);

    let client_to_server = pump(client_r, server_w, Cause::ClientEof, Cause::ClientError);
    let server_to_client = pump(server_r, client_w, Cause::ServerEof, Cause::ServerError);

    let cause = tokio::select! {
        cause = client_to_server => cause,
        cause = server_to_client => cause,
    };

    let _ = client.shutdown().await;
    let _ = server.shutdown().await;

    info!(cause = cause.log_name(), "connection closed");
}

/// Error-returning variant used where the caller (e.g. the Connection
/// Manager) wants to know the terminal cause rather than only log it.
pub async fn splice_reporting<C, S>(client: C, server: S) -> io::Result<Cause>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut client = client;
    let mut server = server;
    let (client_r, client_w) = tokio::io::split(&mut client);
    let (server_r, server_w) = tokio::io::split(&mut server);

    let client_to_server = pump(client_r, server_w, Cause::ClientEof, Cause::ClientError);
    let server_to_client = pump(server_r, client_w, Cause::ServerEof, Cause::ServerError);

    let cause = tokio::select! {
        cause = client_to_server => cause,
        cause = server_to_client => cause,
    };

    let _ = client.shutdown().await;
    let _ = server.shutdown().await;

    info!(cause = cause.log_name(), "connection closed");
    Ok(cause)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn forwards_bytes_in_both_directions() {
        let (mut client_side, client) = duplex(64);
        let (mut server_side, server) = duplex(64);

        let handle = tokio::spawn(splice_reporting(client, server));

        client_side.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server_side.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        client_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client_side);
        drop(server_side);
        let cause = handle.await.unwrap().unwrap();
        assert!(matches!(cause, Cause::ClientEof | Cause::ServerEof | Cause::ClientError | Cause::ServerError));
    }

    #[tokio::test]
    async fn client_eof_terminates_splice() {
        let (client_side, client) = duplex(64);
        let (_server_side, server) = duplex(64);

        let handle = tokio::spawn(splice_reporting(client, server));
        drop(client_side);

        let cause = handle.await.unwrap().unwrap();
        assert_eq!(cause, Cause::ClientEof);
    }
}
