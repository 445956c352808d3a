//! End-to-end viewer over a real socket: upgrade, frames, control messages.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use talaria_agent::aggregator::{Aggregator, Providers, SnapshotCache, HTTP_SNAPSHOT_TTL};
use talaria_agent::http::router;
use talaria_agent::hub::{Hub, HubHandle};
use talaria_agent::process::ProcessTracker;
use talaria_agent::providers::ConnectionTable;
use talaria_agent::session::Gate;
use talaria_agent::state::AppState;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

async fn serve() -> (SocketAddr, AppState, HubHandle) {
    let aggregator = Arc::new(Aggregator::new(Providers::zeroed()));
    let (hub, _task) = Hub::spawn(aggregator.clone(), Duration::from_millis(100));
    let state = AppState {
        hub: hub.clone(),
        snapshots: Arc::new(SnapshotCache::new(aggregator, HTTP_SNAPSHOT_TTL)),
        gate: Arc::new(Gate::new(bcrypt::hash("pw", 4).unwrap())),
        connections: Arc::new(ConnectionTable::new(Arc::new(ProcessTracker::host()))),
        theme: Arc::from("dark"),
        secure_cookies: false,
        trust_proxy_headers: false,
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state, hub)
}

#[tokio::test]
async fn upgrade_without_session_is_refused() {
    let (addr, _state, hub) = serve().await;
    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect_err("must not upgrade");
    assert!(err.to_string().contains("401"), "{err}");
    assert_eq!(hub.viewer_count().await, 0);
}

#[tokio::test]
async fn viewer_streams_snapshots_and_sets_rate() {
    let (addr, state, hub) = serve().await;
    let session = state.gate.sessions.create();

    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut().insert(
        "cookie",
        format!("talaria_session={}", session.token).parse().unwrap(),
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();

    let text = loop {
        match timeout(Duration::from_secs(3), ws.next()).await {
            Ok(Some(Ok(Message::Text(t)))) => break t,
            Ok(Some(Ok(_))) => continue,
            other => panic!("expected a snapshot frame, got {other:?}"),
        }
    };
    let snap: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(snap["client_count"], 1);

    ws.send(Message::Text(r#"{"action":"set_rate","rate":2000}"#.into()))
        .await
        .unwrap();
    let mut rate = None;
    for _ in 0..50 {
        rate = hub.rate().await;
        if rate == Some(Duration::from_millis(2000)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(rate, Some(Duration::from_millis(2000)));

    ws.close(None).await.unwrap();
    for _ in 0..50 {
        if hub.viewer_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("viewer was not unregistered after close");
}

#[tokio::test]
async fn oversized_control_message_drops_the_viewer() {
    let (addr, state, hub) = serve().await;
    let session = state.gate.sessions.create();
    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut().insert(
        "cookie",
        format!("talaria_session={}", session.token).parse().unwrap(),
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();
    for _ in 0..100 {
        if hub.viewer_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(hub.viewer_count().await, 1);
    let _ = ws.send(Message::Text("x".repeat(4096))).await;

    for _ in 0..100 {
        if hub.viewer_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("viewer survived an oversized frame");
}
