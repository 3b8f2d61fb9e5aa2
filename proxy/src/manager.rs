//! Connection Manager: owns every Socket Mount, admits or rejects
//! incoming clients against a global connection cap, and drives graceful
//! shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dialer::Dial;
use crate::error::MultiError;
use crate::instance_id::InstanceId;
use crate::mount::{self, Accepted, Mount};
use crate::splice;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct RegisteredMount {
    instance: InstanceId,
    mount: Arc<dyn Mount>,
}

pub struct Manager {
    dialer: Arc<dyn Dial>,
    mounts: Vec<RegisteredMount>,
    max_connections: u64,
    wait_on_close: Duration,
    open_connections: Arc<AtomicU64>,
}

impl Manager {
    /// Binds every instance's Socket Mount up front. If any binding fails,
    /// every mount already opened in this pass is dropped (closing its
    /// listener) before the error is returned.
    pub async fn new(
        config: &Config,
        dialer: Arc<dyn Dial>,
    ) -> Result<Self, crate::error::StartupError> {
        let specs = config.resolved_listen_specs()?;

        let mut mounts = Vec::with_capacity(config.instances.len());
        for (binding, spec) in config.instances.iter().zip(specs.iter()) {
            match mount::open(&binding.id, spec).await {
                Ok(mount) => mounts.push(RegisteredMount {
                    instance: binding.id.clone(),
                    mount: Arc::from(mount),
                }),
                Err(e) => {
                    error!(instance = %binding.id, error = %e, "failed to open socket mount, unwinding prior mounts");
                    mounts.clear();
                    return Err(e);
                }
            }
        }

        Ok(Self {
            dialer,
            mounts,
            max_connections: config.global.max_connections,
            wait_on_close: config.global.wait_on_close,
            open_connections: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Runs every mount's accept loop until `cancel` fires or a loop
    /// returns a non-transient error. Calls `on_ready` once every loop has
    /// started.
    pub async fn serve(
        &self,
        cancel: CancellationToken,
        on_ready: impl FnOnce() + Send + 'static,
    ) -> std::io::Result<()> {
        let mut tasks = tokio::task::JoinSet::new();

        for registered in &self.mounts {
            let instance = registered.instance.clone();
            let mount = Arc::clone(&registered.mount);
            let dialer = Arc::clone(&self.dialer);
            let open_connections = Arc::clone(&self.open_connections);
            let max_connections = self.max_connections;
            let cancel_child = cancel.clone();

            tasks.spawn(async move {
                accept_loop(
                    instance,
                    mount,
                    dialer,
                    open_connections,
                    max_connections,
                    cancel_child,
                )
                .await
            });
        }

        on_ready();

        let mut first_error = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                joined = tasks.join_next() => {
                    match joined {
                        Some(Ok(Err(e))) => {
                            if first_error.is_none() {
                                first_error = Some(e);
                            }
                            cancel.cancel();
                        }
                        Some(Ok(Ok(()))) => {}
                        Some(Err(join_err)) => {
                            warn!(error = %join_err, "accept loop task panicked");
                        }
                        None => break,
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Dials and immediately closes every registered instance, aggregating
    /// failures. Used by the Health Endpoint's `/readiness` route.
    pub async fn check_connections(&self) -> Result<(), MultiError> {
        let mut errors = MultiError::new();
        for registered in &self.mounts {
            if let Err(e) = self.dialer.dial(&registered.instance).await {
                errors.push(e);
            }
        }
        errors.into_result()
    }

    pub fn conn_count(&self) -> (u64, u64) {
        (self.open_connections.load(Ordering::Relaxed), self.max_connections)
    }

    /// Graceful shutdown: close every Socket Mount's listener so no new
    /// client can connect, close the Dialer (which in turn stops the
    /// Resolver's background refresh), then poll the open-connection
    /// counter until it reaches zero or `wait_on_close` elapses.
    pub async fn close(&self) -> Result<(), MultiError> {
        for registered in &self.mounts {
            registered.mount.close();
        }

        self.dialer.close().await;

        if self.wait_on_close > Duration::ZERO {
            let deadline = tokio::time::Instant::now() + self.wait_on_close;
            while self.open_connections.load(Ordering::Relaxed) > 0 {
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
            }
        }

        let remaining = self.open_connections.load(Ordering::Relaxed);
        if remaining > 0 {
            let mut errors = MultiError::new();
            errors.push(crate::error::ShutdownTimeout {
                remaining,
                waited: self.wait_on_close,
            });
            return errors.into_result();
        }
        Ok(())
    }
}

async fn accept_loop(
    instance: InstanceId,
    mount: Arc<dyn Mount>,
    dialer: Arc<dyn Dial>,
    open_connections: Arc<AtomicU64>,
    max_connections: u64,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!(instance = %instance, mount = %mount.describe(), "accept loop started");
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = mount.accept() => accepted,
        };

        let accepted = match accepted {
            Ok(a) => a,
            Err(e) if is_transient(&e) => {
                warn!(instance = %instance, error = %e, "transient accept error, retrying");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
            Err(e) => {
                error!(instance = %instance, error = %e, "fatal accept error");
                return Err(e);
            }
        };

        let instance = instance.clone();
        let dialer = Arc::clone(&dialer);
        let open_connections = Arc::clone(&open_connections);

        tokio::spawn(async move {
            handle_connection(instance, accepted, dialer, open_connections, max_connections).await;
        });
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

async fn handle_connection(
    instance: InstanceId,
    accepted: Accepted,
    dialer: Arc<dyn Dial>,
    open_connections: Arc<AtomicU64>,
    max_connections: u64,
) {
    let new_count = open_connections.fetch_add(1, Ordering::Relaxed) + 1;
    crate::metrics::record_connection_opened();
    if max_connections > 0 && new_count > max_connections {
        warn!(instance = %instance, max = max_connections, "connection limit reached, rejecting client");
        open_connections.fetch_sub(1, Ordering::Relaxed);
        crate::metrics::record_connection_closed();
        drop_accepted(accepted);
        return;
    }

    let server = match dialer.dial(&instance).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(instance = %instance, error = %e, "dial failed, closing client");
            crate::metrics::record_dial_failure(&instance);
            open_connections.fetch_sub(1, Ordering::Relaxed);
            crate::metrics::record_connection_closed();
            drop_accepted(accepted);
            return;
        }
    };

    splice_accepted(accepted, server).await;
    open_connections.fetch_sub(1, Ordering::Relaxed);
    crate::metrics::record_connection_closed();
}

fn drop_accepted(accepted: Accepted) {
    match accepted {
        Accepted::Tcp(stream, _) => drop(stream),
        Accepted::Unix(stream) => drop(stream),
    }
}

async fn splice_accepted(accepted: Accepted, server: crate::dialer::Stream) {
    match accepted {
        Accepted::Tcp(client, _) => pump(client, server).await,
        Accepted::Unix(client) => pump(client, server).await,
    }
}

async fn pump<C>(client: C, server: crate::dialer::Stream)
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    splice::splice(client, server).await;
}
