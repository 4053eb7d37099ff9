//! End to end: relay router on loopback, bridge attached through the
//! tunnel orchestrator, public requests replayed against a local service.

mod common;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::routing::{any, get};
use axum::{body::Bytes, http::HeaderMap, Router};
use burrow::bridge::{self, ChannelEnd};
use burrow::config::BurrowConfig;
use burrow::provision::ContextStatus;
use burrow::proxy::LocalService;
use burrow::session::SessionPhase;
use burrow::store::{SessionMap, SessionRecord, SessionStore};
use burrow::tunnel::{Tunnel, TunnelOptions};
use burrow_relay::{router, RelayConfig, RelayState};
use burrow_shared::protocol::CHANNEL_PATH;
use common::{FakeProvisioner, MemoryStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::net::TcpListener;

async fn start_relay() -> SocketAddr {
    let state = RelayState::new(RelayConfig::default());
    state.spawn_reaper();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state);
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

fn echo_app() -> Router {
    Router::new().fallback(any(
        |method: axum::http::Method, uri: axum::http::Uri, headers: HeaderMap, body: Bytes| async move {
            let tag = headers
                .get("x-tag")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let mut out = format!("{} {} {}|", method, uri, tag).into_bytes();
            out.extend_from_slice(&body);
            ([("x-local", "1")], out)
        },
    ))
}

/// Accepts the channel upgrade, then closes it after `after`
async fn start_closing_relay(after: Duration) -> SocketAddr {
    let app = Router::new().route(
        CHANNEL_PATH,
        get(move |ws: WebSocketUpgrade| async move {
            ws.on_upgrade(move |mut socket| async move {
                tokio::time::sleep(after).await;
                let _ = socket.send(Message::Close(None)).await;
            })
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

fn tagged_app(tag: &'static str) -> Router {
    Router::new().fallback(any(move || async move { tag }))
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn persisted(port: u16, id: &str) -> SessionMap {
    let mut map = SessionMap::new();
    map.insert(
        port,
        SessionRecord {
            id: id.to_string(),
            created_at: chrono::Utc::now() - chrono::Duration::minutes(5),
        },
    );
    map
}

async fn get_text(relay: SocketAddr, path: &str) -> String {
    http()
        .get(format!("http://{}{}", relay, path))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap()
}

async fn serve_on(listener: TcpListener, app: Router) {
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
}

fn http() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

fn relay_file() -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    std::fs::write(file.path(), b"relay").unwrap();
    file
}

fn config(relay_binary: &NamedTempFile) -> BurrowConfig {
    let mut config = BurrowConfig::default();
    config.relay_binary = Some(relay_binary.path().to_path_buf());
    config.connect.attempts = 3;
    config.connect.initial_backoff_ms = 20;
    config
}

async fn open(
    port: u16,
    auto_shutdown: bool,
    relay: SocketAddr,
) -> (Tunnel, Arc<FakeProvisioner>, Arc<MemoryStore>) {
    let binary = relay_file();
    let provisioner = Arc::new(FakeProvisioner::new(&format!("http://{}", relay)));
    let store = Arc::new(MemoryStore::default());
    let tunnel = Tunnel::open(
        TunnelOptions { port, auto_shutdown },
        &config(&binary),
        provisioner.clone(),
        store.clone(),
    )
    .await
    .unwrap();
    (tunnel, provisioner, store)
}

#[tokio::test]
async fn test_public_request_reaches_local_service() {
    let relay = start_relay().await;
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = local.local_addr().unwrap().port();
    serve_on(local, echo_app()).await;

    let (tunnel, provisioner, store) = open(port, true, relay).await;
    assert_eq!(tunnel.url(), format!("http://{}", relay));
    assert_eq!(tunnel.phase(), SessionPhase::Ready);
    assert_eq!(provisioner.count("create"), 1);
    assert!(store.load().unwrap().contains_key(&port));

    let resp = http()
        .post(format!("http://{}/api/items?x=1", relay))
        .header("x-tag", "abc")
        .body(vec![0u8, 0xFF, 0x10])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-local"], "1");
    let mut expected = b"POST /api/items?x=1 abc|".to_vec();
    expected.extend_from_slice(&[0, 0xFF, 0x10]);
    assert_eq!(resp.bytes().await.unwrap().to_vec(), expected);
}

#[tokio::test]
async fn test_local_failure_keeps_channel_usable() {
    let relay = start_relay().await;
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let (_tunnel, _provisioner, _store) = open(port, true, relay).await;

    let resp = http().get(format!("http://{}/", relay)).send().await.unwrap();
    assert_eq!(resp.status(), 502);
    assert!(resp.text().await.unwrap().contains("Failed to reach local service"));

    let local = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    serve_on(local, echo_app()).await;

    let resp = http().get(format!("http://{}/again", relay)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.text().await.unwrap().starts_with("GET /again"));
}

#[tokio::test]
async fn test_shutdown_closes_channel_and_stops_context() {
    let relay = start_relay().await;
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = local.local_addr().unwrap().port();
    serve_on(local, echo_app()).await;

    let (mut tunnel, provisioner, _store) = open(port, true, relay).await;
    let context_id = tunnel.session().context_id.clone();

    tunnel.shutdown().await.unwrap();
    tunnel.shutdown().await.unwrap();
    assert_eq!(provisioner.count("stop"), 1);
    assert!(provisioner.calls().contains(&format!("stop {}", context_id)));
    assert_eq!(tunnel.phase(), SessionPhase::Stopped);

    let mut status = 0;
    for _ in 0..100 {
        let resp = http().get(format!("http://{}/", relay)).send().await.unwrap();
        status = resp.status().as_u16();
        if resp.text().await.unwrap().contains("No tunnel client connected") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, 502);
}

#[tokio::test]
async fn test_second_channel_takes_over_without_ending_session() {
    let relay = start_relay().await;
    let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = first.local_addr().unwrap().port();
    serve_on(first, tagged_app("one")).await;
    let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let second_port = second.local_addr().unwrap().port();
    serve_on(second, tagged_app("two")).await;

    let (mut tunnel, provisioner, _store) = open(port, true, relay).await;
    assert_eq!(get_text(relay, "/").await, "one");

    let url = bridge::channel_url(tunnel.url(), CHANNEL_PATH).unwrap();
    let _other = bridge::connect(&url, LocalService::with_host("127.0.0.1", second_port).unwrap())
        .await
        .unwrap();

    let mut body = String::new();
    for _ in 0..50 {
        body = get_text(relay, "/").await;
        if body == "two" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(body, "two");

    // The superseded bridge is not closed, so nothing stops the context
    assert!(tokio::time::timeout(Duration::from_millis(300), tunnel.closed()).await.is_err());
    assert_eq!(provisioner.count("stop"), 0);
    assert_eq!(tunnel.phase(), SessionPhase::Ready);
}

#[tokio::test]
async fn test_channel_end_triggers_auto_shutdown() {
    let relay = start_closing_relay(Duration::from_millis(200)).await;
    let (mut tunnel, provisioner, _store) = open(3000, true, relay).await;

    let end = tokio::time::timeout(Duration::from_secs(5), tunnel.supervise())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(end, ChannelEnd::Closed(_)));
    assert_eq!(provisioner.count("stop"), 1);
    assert_eq!(tunnel.phase(), SessionPhase::Stopped);
}

#[tokio::test]
async fn test_without_auto_shutdown_context_survives_channel_end() {
    let relay = start_closing_relay(Duration::from_millis(200)).await;
    let (mut tunnel, provisioner, _store) = open(3000, false, relay).await;

    tokio::time::timeout(Duration::from_secs(5), tunnel.supervise())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(provisioner.count("stop"), 0);
}

#[tokio::test]
async fn test_reused_context_with_running_relay_is_not_redeployed() {
    let relay = start_relay().await;
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = local.local_addr().unwrap().port();
    serve_on(local, tagged_app("reused")).await;

    let binary = relay_file();
    let provisioner = Arc::new(
        FakeProvisioner::new(&format!("http://{}", relay)).with_context("sbx_old", ContextStatus::Running),
    );
    let store = Arc::new(MemoryStore::with(persisted(port, "sbx_old")));

    let tunnel = Tunnel::open(
        TunnelOptions {
            port,
            auto_shutdown: true,
        },
        &config(&binary),
        provisioner.clone(),
        store,
    )
    .await
    .unwrap();

    assert!(tunnel.session().reused);
    assert_eq!(tunnel.session().context_id, "sbx_old");
    assert_eq!(provisioner.count("create"), 0);
    assert_eq!(provisioner.count("write"), 0);
    assert_eq!(provisioner.count("run"), 0);
    assert_eq!(tunnel.phase(), SessionPhase::Ready);
    assert_eq!(get_text(relay, "/").await, "reused");
}

#[tokio::test]
async fn test_reused_context_without_relay_is_redeployed() {
    let closed_port = free_port();
    let binary = relay_file();
    let provisioner = Arc::new(
        FakeProvisioner::new(&format!("http://127.0.0.1:{}", closed_port))
            .with_context("sbx_old", ContextStatus::Running),
    );
    let store = Arc::new(MemoryStore::with(persisted(3000, "sbx_old")));

    let result = Tunnel::open(
        TunnelOptions {
            port: 3000,
            auto_shutdown: false,
        },
        &config(&binary),
        provisioner.clone(),
        store,
    )
    .await;

    assert!(result.is_err());
    assert_eq!(provisioner.count("create"), 0);
    assert_eq!(provisioner.count("write"), 1);
    assert_eq!(provisioner.count("run"), 2);
    assert_eq!(provisioner.count("stop"), 0);
}

#[tokio::test]
async fn test_missing_relay_binary_fails_before_provisioning() {
    let provisioner = Arc::new(FakeProvisioner::new("http://127.0.0.1:1"));
    let store = Arc::new(MemoryStore::default());
    let mut config = BurrowConfig::default();
    config.relay_binary = Some("/nonexistent/burrow-relay".into());

    let result = Tunnel::open(
        TunnelOptions {
            port: 3000,
            auto_shutdown: true,
        },
        &config,
        provisioner.clone(),
        store,
    )
    .await;
    assert!(result.is_err());
    assert!(provisioner.calls().is_empty());
}

#[tokio::test]
async fn test_unreachable_relay_is_channel_error_and_stops_context() {
    let closed_port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let binary = relay_file();
    let provisioner = Arc::new(FakeProvisioner::new(&format!("http://127.0.0.1:{}", closed_port)));
    let store = Arc::new(MemoryStore::default());

    let result = Tunnel::open(
        TunnelOptions {
            port: 3000,
            auto_shutdown: true,
        },
        &config(&binary),
        provisioner.clone(),
        store,
    )
    .await;
    assert!(matches!(result, Err(burrow_shared::Error::Channel(_))));
    assert_eq!(provisioner.count("stop"), 1);
}
