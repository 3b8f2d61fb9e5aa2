//! Thin demonstration binary: wires a `Config` together from a handful of
//! flags, starts the Connection Manager and the health/admin HTTP
//! servers, and waits for a shutdown signal. Not a replacement for a
//! real CLI's flag/envvar/config-file layering — just enough to
//! smoke-test the engine end to end.

use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use camino::Utf8PathBuf;
use proxy::config::{
    AdminConfig, Config, CredentialSource, FuseConfig, GlobalDefaults, HealthConfig,
    InstanceBinding,
};
use proxy::control_plane::remote::RemoteApi;
use proxy::control_plane::{Api, ControlPlaneBackend};
use proxy::dialer::Dialer;
use proxy::instance_id::InstanceId;
use proxy::resolver::{RefreshMode, Resolver};
use proxy::{fuse, health, signals, Manager};

#[derive(Parser, Debug)]
#[command(name = "proxy", about = "Local authenticating database proxy")]
struct Args {
    /// Instance identifiers to proxy, in `projects/.../instances/...` form.
    #[arg(long = "instance", required = true)]
    instances: Vec<String>,

    /// Control-plane API base URL.
    #[arg(long, env = "PROXY_CONTROL_PLANE_URL")]
    control_plane_url: url::Url,

    /// Bearer token used to authenticate to the control plane.
    #[arg(long, env = "PROXY_BEARER_TOKEN")]
    bearer_token: Option<String>,

    #[arg(long, default_value = "127.0.0.1")]
    health_address: IpAddr,

    #[arg(long, default_value_t = proxy::config::DEFAULT_HEALTH_PORT)]
    health_port: u16,

    #[arg(long, default_value_t = proxy::config::DEFAULT_ADMIN_PORT)]
    admin_port: u16,

    #[arg(long)]
    enable_quit: bool,

    #[arg(long, default_value_t = 0)]
    max_connections: u64,

    /// Enables FUSE mode: mounts on-demand sockets under this directory
    /// instead of opening one static listener per instance. Requires
    /// `--fuse-socket-dir` and is mutually exclusive with static listeners.
    #[arg(long, requires = "fuse_socket_dir")]
    fuse_mount_root: Option<Utf8PathBuf>,

    #[arg(long, requires = "fuse_mount_root")]
    fuse_socket_dir: Option<Utf8PathBuf>,
}

const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_STARTUP_ERROR: u8 = 3;
const EXIT_QUITQUITQUIT: u8 = 4;
const EXIT_SIGTERM_UNCONFIGURED: u8 = 143;

#[tokio::main]
async fn main() -> ExitCode {
    let _logging_guard = proxy::logging::init();
    let args = Args::parse();

    let bindings: Result<Vec<InstanceBinding>, _> = args
        .instances
        .iter()
        .map(|s| InstanceId::parse(s).map(InstanceBinding::new))
        .collect();
    let bindings = match bindings {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "invalid instance identifier");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let credentials = match args.bearer_token {
        Some(tok) => CredentialSource::BearerToken(tok),
        None => CredentialSource::AmbientDefault,
    };

    let fuse_config = match (&args.fuse_mount_root, &args.fuse_socket_dir) {
        (Some(mount_root), Some(socket_dir)) => Some(FuseConfig {
            mount_root: mount_root.clone(),
            socket_dir: socket_dir.clone(),
        }),
        _ => None,
    };

    let config = match Config::build(
        bindings,
        GlobalDefaults {
            max_connections: args.max_connections,
            ..GlobalDefaults::default()
        },
        Some(HealthConfig {
            address: args.health_address,
            port: args.health_port,
        }),
        Some(AdminConfig {
            port: args.admin_port,
            quit_enabled: args.enable_quit,
            profiling_enabled: false,
        }),
        credentials.clone(),
        None,
        fuse_config,
    ) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let api: Arc<dyn Api> = Arc::new(ControlPlaneBackend::Remote(Arc::new(RemoteApi::new(
        args.control_plane_url,
        credentials,
        None,
    ))));
    let resolver = Resolver::new(api, RefreshMode::Background);
    let dialer: Arc<dyn proxy::dialer::Dial> = Arc::new(Dialer::new(resolver));

    let cancel = CancellationToken::new();
    signals::install(cancel.clone());

    let quit_flag = proxy::admin::QuitFlag::new();
    if let Some(admin_cfg) = config.admin.clone() {
        let addr = std::net::SocketAddr::new(IpAddr::from([127, 0, 0, 1]), admin_cfg.port);
        let cancel = cancel.clone();
        let quit_flag = quit_flag.clone();
        tokio::spawn(async move {
            if let Err(e) = proxy::admin::serve(addr, admin_cfg, cancel, quit_flag).await {
                error!(error = %e, "admin server exited");
            }
        });
    }

    // FUSE mode provisions on-demand sockets per lookup and is mutually
    // exclusive with the static listener list the Connection Manager
    // otherwise owns, so it runs its own path here instead of going
    // through `Manager`. The health server reflects `Manager` state and
    // isn't meaningful for on-demand sockets, so it's skipped in this mode.
    if let Some(fuse_cfg) = config.fuse.clone() {
        let mount = match fuse::mount(fuse_cfg, dialer).await {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "failed to mount fuse directory");
                return ExitCode::from(EXIT_STARTUP_ERROR);
            }
        };

        cancel.cancelled().await;
        if let Err(e) = mount.close().await {
            error!(error = %e, "errors unmounting fuse directory");
        }
        info!("shutdown complete");
        return if quit_flag.was_triggered() {
            ExitCode::from(EXIT_QUITQUITQUIT)
        } else {
            ExitCode::from(EXIT_SIGTERM_UNCONFIGURED)
        };
    }

    let manager = match Manager::new(&config, dialer).await {
        Ok(m) => Arc::new(m),
        Err(e) => {
            error!(error = %e, "failed to start connection manager");
            return ExitCode::from(EXIT_STARTUP_ERROR);
        }
    };

    let ready = health::ReadyFlag::new();

    if let Some(health_cfg) = &config.health {
        let addr = std::net::SocketAddr::new(health_cfg.address, health_cfg.port);
        let manager = Arc::clone(&manager);
        let ready = ready.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(addr, manager, ready, cancel).await {
                error!(error = %e, "health server exited");
            }
        });
    }

    let ready_for_callback = ready.clone();
    let serve_result = manager
        .serve(cancel.clone(), move || ready_for_callback.mark_ready())
        .await;

    if let Err(e) = serve_result {
        error!(error = %e, "connection manager stopped with error");
    }

    if let Err(e) = manager.close().await {
        error!(error = %e, "errors during shutdown");
    }

    info!("shutdown complete");

    if quit_flag.was_triggered() {
        ExitCode::from(EXIT_QUITQUITQUIT)
    } else {
        ExitCode::from(EXIT_SIGTERM_UNCONFIGURED)
    }
}
