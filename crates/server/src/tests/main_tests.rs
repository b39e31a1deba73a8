use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use engine::{EngineConfig, SyncEngine};
use shared::{
    domain::{CorrelationId, UserId},
    protocol::ServerFrame,
};
use store::Store;

use super::{build_router, AppState};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn test_state() -> (axum::Router, Store, Arc<SyncEngine>) {
    let store = Store::new("sqlite::memory:").await.expect("db");
    let engine = SyncEngine::new(store.clone(), EngineConfig::default());
    let app = build_router(Arc::new(AppState {
        store: store.clone(),
        engine: Arc::clone(&engine),
    }));
    (app, store, engine)
}

fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (app, _store, _engine) = test_state().await;
    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn login_rejects_blank_usernames() {
    let (app, _store, _engine) = test_state().await;

    let response = app
        .clone()
        .oneshot(json_post("/login", serde_json::json!({"username": "  "})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(json_post("/login", serde_json::json!({"username": "alice"})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn group_history_requires_membership() {
    let (app, store, _engine) = test_state().await;
    let alice = store.create_user("alice").await.expect("user");
    let bob = store.create_user("bob").await.expect("user");
    let outsider = store.create_user("mallory").await.expect("user");

    let response = app
        .clone()
        .oneshot(json_post(
            "/groups",
            serde_json::json!({"user_id": alice.0, "name": "ops", "member_ids": [bob.0]}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/history/group/1?user_id={}", outsider.0))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .oneshot(
            Request::get(format!("/history/group/1?user_id={}", bob.0))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn roster_changes_require_the_owner() {
    let (app, store, _engine) = test_state().await;
    let alice = store.create_user("alice").await.expect("user");
    let bob = store.create_user("bob").await.expect("user");
    let group = store.create_group("ops", alice, &[bob]).await.expect("group");

    // bob may leave on his own
    let response = app
        .clone()
        .oneshot(
            Request::delete(format!(
                "/groups/{}/members/{}?user_id={}",
                group.0, bob.0, bob.0
            ))
            .body(Body::empty())
            .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // but may not evict the owner
    let response = app
        .oneshot(
            Request::delete(format!(
                "/groups/{}/members/{}?user_id={}",
                group.0, alice.0, bob.0
            ))
            .body(Body::empty())
            .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

async fn spawn_app() -> (SocketAddr, Store, Arc<SyncEngine>) {
    let (app, store, engine) = test_state().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, store, engine)
}

async fn connect(addr: SocketAddr, identity: UserId) -> WsClient {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("connect");
    let register =
        serde_json::json!({"type": "register", "payload": {"identity": identity.0}}).to_string();
    ws.send(WsMessage::Text(register)).await.expect("register");
    ws
}

async fn wait_online(engine: &SyncEngine, identity: UserId) {
    for _ in 0..100 {
        if engine.registry.is_online(identity) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session for {} never registered", identity.0);
}

async fn next_frame(ws: &mut WsClient) -> ServerFrame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame wait timed out")
            .expect("stream ended")
            .expect("socket error");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(&text).expect("server frame");
        }
    }
}

#[tokio::test]
async fn websocket_send_reaches_both_parties() {
    let (addr, store, engine) = spawn_app().await;
    let alice = store.create_user("alice").await.expect("user");
    let bob = store.create_user("bob").await.expect("user");

    let mut alice_ws = connect(addr, alice).await;
    let mut bob_ws = connect(addr, bob).await;
    wait_online(&engine, alice).await;
    wait_online(&engine, bob).await;

    // a malformed frame must not tear down the session
    alice_ws
        .send(WsMessage::Text("not json".into()))
        .await
        .expect("send");

    let correlation_id = CorrelationId::generate();
    let send = serde_json::json!({
        "type": "send",
        "payload": {
            "target": {"user": {"user_id": bob.0}},
            "body": "hello over the wire",
            "kind": "text",
            "correlation_id": correlation_id,
        }
    });
    alice_ws
        .send(WsMessage::Text(send.to_string()))
        .await
        .expect("send");

    match next_frame(&mut alice_ws).await {
        ServerFrame::Saved {
            correlation_id: got,
            message,
            ..
        } => {
            assert_eq!(got, correlation_id);
            assert_eq!(message.body, "hello over the wire");
        }
        other => panic!("unexpected frame: {other:?}"),
    }
    match next_frame(&mut alice_ws).await {
        ServerFrame::Delivered { .. } => {}
        other => panic!("unexpected frame: {other:?}"),
    }
    match next_frame(&mut bob_ws).await {
        ServerFrame::Received { message } => {
            assert_eq!(message.sender_id, alice);
            assert_eq!(message.correlation_id, correlation_id);
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}
