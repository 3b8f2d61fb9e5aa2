//! Admin Endpoint: `/quitquitquit` gating and idempotence, `/debug/pprof`
//! gating, loopback-only acceptance.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use proxy::admin::{self, QuitFlag};
use proxy::config::AdminConfig;
use tokio_util::sync::CancellationToken;

async fn spawn_admin(port: u16, config: AdminConfig) -> (CancellationToken, QuitFlag) {
    let cancel = CancellationToken::new();
    let quit_flag = QuitFlag::new();
    let addr = SocketAddr::new("127.0.0.1".parse::<IpAddr>().unwrap(), port);
    let serve_cancel = cancel.clone();
    let serve_quit_flag = quit_flag.clone();
    tokio::spawn(async move {
        let _ = admin::serve(addr, config, serve_cancel, serve_quit_flag).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (cancel, quit_flag)
}

async fn post(port: u16, path: &str) -> (u16, String) {
    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}{path}"))
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap();
    (status, body)
}

async fn get(port: u16, path: &str) -> u16 {
    reqwest::get(format!("http://127.0.0.1:{port}{path}"))
        .await
        .unwrap()
        .status()
        .as_u16()
}

#[tokio::test]
async fn quitquitquit_cancels_the_root_token_and_is_idempotent() {
    let (cancel, quit_flag) = spawn_admin(
        19091,
        AdminConfig {
            port: 19091,
            quit_enabled: true,
            profiling_enabled: false,
        },
    )
    .await;

    let (status, _) = post(19091, "/quitquitquit").await;
    assert_eq!(status, 200);
    assert!(cancel.is_cancelled());
    assert!(quit_flag.was_triggered());

    // A second call after shutdown was already triggered must not error.
    let (status, _) = post(19091, "/quitquitquit").await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn quitquitquit_is_not_found_when_disabled() {
    spawn_admin(
        19092,
        AdminConfig {
            port: 19092,
            quit_enabled: false,
            profiling_enabled: false,
        },
    )
    .await;

    let (status, _) = post(19092, "/quitquitquit").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn quitquitquit_rejects_get() {
    spawn_admin(
        19093,
        AdminConfig {
            port: 19093,
            quit_enabled: true,
            profiling_enabled: false,
        },
    )
    .await;

    assert_eq!(get(19093, "/quitquitquit").await, 400);
}

#[tokio::test]
async fn pprof_route_reports_not_implemented_when_profiling_enabled() {
    spawn_admin(
        19094,
        AdminConfig {
            port: 19094,
            quit_enabled: false,
            profiling_enabled: true,
        },
    )
    .await;

    assert_eq!(get(19094, "/debug/pprof/heap").await, 501);
}

#[tokio::test]
async fn pprof_route_is_not_found_when_profiling_disabled() {
    spawn_admin(
        19095,
        AdminConfig {
            port: 19095,
            quit_enabled: false,
            profiling_enabled: false,
        },
    )
    .await;

    assert_eq!(get(19095, "/debug/pprof/heap").await, 404);
}
