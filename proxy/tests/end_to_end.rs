//! Full-stack test: a real TCP client talks to the proxy's listener, the
//! proxy dials a real (self-signed) TLS server standing in for the
//! instance, and bytes are spliced end to end.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use proxy::config::{Config, GlobalDefaults, InstanceBinding};
use proxy::control_plane::mock::MockApi;
use proxy::control_plane::{Api, ControlPlaneBackend};
use proxy::dialer::Dialer;
use proxy::instance_id::InstanceId;
use proxy::resolver::{RefreshMode, Resolver};
use proxy::Manager;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn instance(short: &str) -> InstanceId {
    InstanceId::parse(&format!("projects/p/locations/r/clusters/c/instances/{short}")).unwrap()
}

/// Stands up a TLS echo server on `addr`, backed by a freshly generated
/// self-signed certificate. Stands in for a real database instance.
async fn spawn_tls_echo_server(addr: IpAddr) {
    let cert = rcgen::generate_simple_self_signed(vec![addr.to_string()]).unwrap();
    let cert_der = cert.cert.der().clone();
    let key_der = rustls::pki_types::PrivateKeyDer::try_from(cert.key_pair.serialize_der())
        .expect("rcgen emits a der-encodable key");

    let server_config = rustls::ServerConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_protocol_versions(&[&rustls::version::TLS13])
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert_der], key_der)
    .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind(std::net::SocketAddr::new(addr, 5432)).await.unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut buf = [0u8; 4096];
                loop {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if tls.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
}

async fn build_manager(
    listen_addr: IpAddr,
    listen_port: u16,
    upstream_addr: IpAddr,
    max_connections: u64,
) -> (Arc<Manager>, InstanceId) {
    let id = instance("e2e");
    let mock = Arc::new(MockApi::new());
    mock.set_ok(id.clone(), upstream_addr, Duration::from_secs(60));

    let api: Arc<dyn Api> = Arc::new(ControlPlaneBackend::Mock(mock));
    let resolver = Resolver::new(api, RefreshMode::Lazy);
    let dialer: Arc<dyn proxy::dialer::Dial> = Arc::new(Dialer::new(resolver));

    let config = Config::build(
        vec![InstanceBinding::new(id.clone())],
        GlobalDefaults {
            tcp_address: listen_addr,
            tcp_port_base: listen_port,
            max_connections,
            wait_on_close: Duration::from_secs(2),
            ..GlobalDefaults::default()
        },
        None,
        None,
        proxy::config::CredentialSource::AmbientDefault,
        None,
        None,
    )
    .unwrap();

    let manager = Manager::new(&config, dialer).await.unwrap();
    (Arc::new(manager), id)
}

#[tokio::test]
async fn client_traffic_is_spliced_through_to_dialed_instance() {
    let loopback: IpAddr = "127.0.0.1".parse().unwrap();
    spawn_tls_echo_server(loopback).await;

    let (manager, _id) = build_manager(loopback, 18432, loopback, 0).await;
    let cancel = CancellationToken::new();
    let serve_manager = Arc::clone(&manager);
    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = serve_manager.serve(serve_cancel, || {}).await;
    });

    // Give the accept loop a moment to start before dialing in.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = tokio::net::TcpStream::connect(std::net::SocketAddr::new(loopback, 18432))
        .await
        .unwrap();
    client.write_all(b"hello, instance").await.unwrap();
    let mut buf = [0u8; 15];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello, instance");

    drop(client);
    cancel.cancel();
    manager.close().await.unwrap();
}

#[tokio::test]
async fn max_connections_limit_rejects_additional_clients() {
    // A distinct loopback address so this test's upstream on port 5432
    // doesn't collide with the other end-to-end test's.
    let upstream: IpAddr = "127.0.0.2".parse().unwrap();
    spawn_tls_echo_server(upstream).await;

    let (manager, _id) = build_manager("127.0.0.1".parse().unwrap(), 18433, upstream, 1).await;
    let cancel = CancellationToken::new();
    let serve_manager = Arc::clone(&manager);
    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = serve_manager.serve(serve_cancel, || {}).await;
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    // First connection is admitted and kept open.
    let mut first = tokio::net::TcpStream::connect(("127.0.0.1", 18433)).await.unwrap();
    first.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    first.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");

    // Second connection arrives while the first is still open and should
    // be rejected (closed without any bytes exchanged) since max_connections=1.
    let mut second = tokio::net::TcpStream::connect(("127.0.0.1", 18433)).await.unwrap();
    let mut one_byte = [0u8; 1];
    let read_result = second.read(&mut one_byte).await;
    assert!(matches!(read_result, Ok(0)), "expected the rejected connection to see eof");

    drop(first);
    drop(second);
    cancel.cancel();
    manager.close().await.unwrap();
}

#[tokio::test]
async fn close_stops_accepting_new_connections() {
    let upstream: IpAddr = "127.0.0.3".parse().unwrap();
    spawn_tls_echo_server(upstream).await;

    let (manager, _id) = build_manager("127.0.0.1".parse().unwrap(), 18434, upstream, 0).await;
    let cancel = CancellationToken::new();
    let serve_manager = Arc::clone(&manager);
    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = serve_manager.serve(serve_cancel, || {}).await;
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    cancel.cancel();
    manager.close().await.unwrap();

    // The listener itself must be gone, not just idle: a client connecting
    // after close() either fails to connect or sees eof immediately,
    // rather than completing a handshake and then hanging.
    let addr = std::net::SocketAddr::new("127.0.0.1".parse().unwrap(), 18434);
    match tokio::net::TcpStream::connect(addr).await {
        Err(_) => {}
        Ok(mut stream) => {
            let mut one_byte = [0u8; 1];
            let result =
                tokio::time::timeout(Duration::from_secs(2), stream.read(&mut one_byte)).await;
            assert!(matches!(result, Ok(Ok(0))), "expected connection refused or immediate eof");
        }
    }
}
