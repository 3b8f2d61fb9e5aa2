//! Admin Endpoint: `localhost`-only HTTP server exposing `/quitquitquit`
//! and, when enabled, a profiling route.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AdminConfig;

/// Set specifically when `/quitquitquit` fires, so a caller can tell "shut
/// down because a client hit the admin endpoint" apart from "shut down
/// because of SIGTERM/SIGINT" even though both cancel the same root token.
#[derive(Clone, Default)]
pub struct QuitFlag(Arc<AtomicBool>);

impl QuitFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn was_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub async fn serve(
    addr: SocketAddr,
    config: AdminConfig,
    cancel: CancellationToken,
    quit_flag: QuitFlag,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let config = Arc::new(config);

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "admin server accept error");
                continue;
            }
        };

        if !peer.ip().is_loopback() {
            warn!(peer = %peer, "rejecting non-loopback admin connection");
            continue;
        }

        let config = Arc::clone(&config);
        let cancel = cancel.clone();
        let quit_flag = quit_flag.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let config = Arc::clone(&config);
                let cancel = cancel.clone();
                let quit_flag = quit_flag.clone();
                async move { Ok::<_, Infallible>(route(req, config, cancel, quit_flag)) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "admin connection error");
            }
        });
    }
}

fn route(
    req: Request<hyper::body::Incoming>,
    config: Arc<AdminConfig>,
    cancel: CancellationToken,
    quit_flag: QuitFlag,
) -> Response<Full<Bytes>> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/quitquitquit") => {
            if !config.quit_enabled {
                return respond(StatusCode::NOT_FOUND, "not found");
            }
            // Idempotent: cancelling an already-cancelled token is a no-op,
            // and setting the flag twice is harmless.
            info!("quitquitquit received, initiating shutdown");
            quit_flag.0.store(true, Ordering::SeqCst);
            cancel.cancel();
            respond(StatusCode::OK, "shutting down")
        }
        (&Method::GET, "/quitquitquit") => respond(StatusCode::BAD_REQUEST, "use POST"),
        (_, path) if path.starts_with("/debug/pprof/") => {
            if config.profiling_enabled {
                respond(StatusCode::NOT_IMPLEMENTED, "profiling not linked in")
            } else {
                respond(StatusCode::NOT_FOUND, "not found")
            }
        }
        _ => respond(StatusCode::NOT_FOUND, "not found"),
    }
}

fn respond(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("static response is well-formed")
}
