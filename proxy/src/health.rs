//! Health Endpoint: `/startup`, `/readiness`, `/liveness` over plain
//! HTTP/1.1. `/readiness` dials and closes every registered instance on
//! every request; the health server reflects Connection Manager state,
//! it doesn't cache or approximate it.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::manager::Manager;

/// Set by the Connection Manager once every accept loop is running.
/// `/startup` reports 503 until then.
#[derive(Clone, Default)]
pub struct ReadyFlag(Arc<AtomicBool>);

impl ReadyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub async fn serve(
    addr: SocketAddr,
    manager: Arc<Manager>,
    ready: ReadyFlag,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, _peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "health server accept error");
                continue;
            }
        };

        let manager = Arc::clone(&manager);
        let ready = ready.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let manager = Arc::clone(&manager);
                let ready = ready.clone();
                async move { Ok::<_, Infallible>(route(req, manager, ready).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "health connection error");
            }
        });
    }
}

async fn route(
    req: Request<hyper::body::Incoming>,
    manager: Arc<Manager>,
    ready: ReadyFlag,
) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/startup" => {
            if ready.is_ready() {
                respond(StatusCode::OK, "ok")
            } else {
                respond(StatusCode::SERVICE_UNAVAILABLE, "not started")
            }
        }
        "/liveness" => respond(StatusCode::OK, "ok"),
        "/readiness" => readiness(&manager, &ready).await,
        _ => respond(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn readiness(manager: &Arc<Manager>, ready: &ReadyFlag) -> Response<Full<Bytes>> {
    if !ready.is_ready() {
        return respond(StatusCode::SERVICE_UNAVAILABLE, "not started");
    }

    let (open, max) = manager.conn_count();
    if max > 0 && open >= max {
        return respond(StatusCode::SERVICE_UNAVAILABLE, "at connection limit");
    }

    match manager.check_connections().await {
        Ok(()) => respond(StatusCode::OK, "ok"),
        Err(e) => {
            warn!(error = %e, "readiness check_connections failed");
            respond(StatusCode::SERVICE_UNAVAILABLE, "instance check failed")
        }
    }
}

fn respond(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("static response is well-formed")
}
