//! End-to-end relay tests over real websockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use tether_relay::{LogPushGateway, RelayConfig, RelayState, TokenStore, router};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const VIEWER_TOKEN: &str = "viewer-token-1";

async fn start_relay() -> (SocketAddr, Arc<RelayState>) {
    let auth = TokenStore::new();
    auth.seed_viewer(VIEWER_TOKEN, "robin");
    let state = Arc::new(RelayState::new(
        RelayConfig::default(),
        auth,
        Arc::new(LogPushGateway),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr, path: &str) -> WsStream {
    let (stream, _response) = connect_async(format!("ws://{addr}{path}"))
        .await
        .expect("websocket connect");
    stream
}

async fn send(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn recv(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Close(_) => panic!("connection closed while waiting for frame"),
            _ => continue,
        }
    }
}

async fn auth(ws: &mut WsStream, token: &str) {
    send(ws, json!({"type": "auth", "token": token})).await;
    let reply = recv(ws).await;
    assert_eq!(reply["type"], "auth_ok", "auth failed: {reply}");
}

#[tokio::test]
async fn unauthenticated_frames_are_rejected_and_closed() {
    let (addr, _state) = start_relay().await;
    let mut ws = connect(addr, "/ws/viewer").await;

    send(&mut ws, json!({"type": "list_sessions"})).await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply["type"], "auth_error");
}

#[tokio::test]
async fn viewer_token_cannot_authenticate_as_workstation() {
    let (addr, _state) = start_relay().await;
    let mut ws = connect(addr, "/ws/workstation").await;

    send(&mut ws, json!({"type": "auth", "token": VIEWER_TOKEN})).await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply["type"], "auth_error");
}

#[tokio::test]
async fn late_subscribe_replays_then_goes_live_and_sees_the_end() {
    let (addr, state) = start_relay().await;
    let credential = state.auth.issue_workstation("robin");

    let mut workstation = connect(addr, "/ws/workstation").await;
    auth(&mut workstation, &credential).await;
    send(
        &mut workstation,
        json!({"type": "session_start", "session_id": "s3", "name": "refactor", "cwd": "/work"}),
    )
    .await;
    for text in ["one", "two", "three"] {
        send(
            &mut workstation,
            json!({"type": "session_message", "session_id": "s3", "role": "assistant", "content": text}),
        )
        .await;
    }

    let mut viewer = connect(addr, "/ws/viewer").await;
    auth(&mut viewer, VIEWER_TOKEN).await;
    // The session already exists, so the first frame may be the
    // sessions_list broadcast triggered by session_start — tolerate it by
    // requesting the list explicitly and waiting for a non-empty one.
    send(&mut viewer, json!({"type": "list_sessions"})).await;
    loop {
        let frame = recv(&mut viewer).await;
        if frame["type"] == "sessions_list" {
            assert_eq!(frame["sessions"][0]["id"], "s3");
            break;
        }
    }

    send(&mut viewer, json!({"type": "subscribe", "session_id": "s3"})).await;
    let frame = recv(&mut viewer).await;
    assert_eq!(frame["type"], "session_status");
    assert_eq!(frame["status"], "running");
    for expected in ["one", "two", "three"] {
        let frame = recv(&mut viewer).await;
        assert_eq!(frame["type"], "session_message");
        assert_eq!(frame["content"], expected);
    }

    // Live forwarding after replay, in order.
    send(
        &mut workstation,
        json!({"type": "session_message", "session_id": "s3", "role": "assistant", "content": "live"}),
    )
    .await;
    let frame = recv(&mut viewer).await;
    assert_eq!(frame["content"], "live");

    // Viewer input reaches the owning workstation.
    send(
        &mut viewer,
        json!({"type": "send_input", "session_id": "s3", "text": "run tests"}),
    )
    .await;
    let frame = recv(&mut workstation).await;
    assert_eq!(frame["type"], "send_input");
    assert_eq!(frame["text"], "run tests");

    // Workstation disconnect ends the session for subscribers.
    drop(workstation);
    loop {
        let frame = recv(&mut viewer).await;
        if frame["type"] == "session_status" {
            assert_eq!(frame["status"], "ended");
            break;
        }
    }
}

#[tokio::test]
async fn cross_user_subscribe_gets_an_error() {
    let (addr, state) = start_relay().await;
    state.auth.seed_viewer("mallory-token", "mallory");
    let credential = state.auth.issue_workstation("robin");

    let mut workstation = connect(addr, "/ws/workstation").await;
    auth(&mut workstation, &credential).await;
    send(
        &mut workstation,
        json!({"type": "session_start", "session_id": "secret", "name": "x", "cwd": "/w"}),
    )
    .await;

    let mut viewer = connect(addr, "/ws/viewer").await;
    auth(&mut viewer, "mallory-token").await;
    send(
        &mut viewer,
        json!({"type": "subscribe", "session_id": "secret"}),
    )
    .await;
    let frame = recv(&mut viewer).await;
    assert_eq!(frame["type"], "error");
}

#[tokio::test]
async fn pairing_flow_issues_a_working_credential() {
    let (addr, _state) = start_relay().await;
    let http = reqwest::Client::new();
    let base = format!("http://{addr}");

    let begin: Value = http
        .post(format!("{base}/pair"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let code = begin["code"].as_str().unwrap().to_string();
    assert_eq!(begin["expires_in"], 600);

    // Unverified code: pending.
    let poll = http.get(format!("{base}/pair/{code}")).send().await.unwrap();
    assert_eq!(poll.status(), reqwest::StatusCode::ACCEPTED);

    // Viewer verifies the code.
    let verify = http
        .post(format!("{base}/pair/verify"))
        .bearer_auth(VIEWER_TOKEN)
        .json(&json!({ "code": code }))
        .send()
        .await
        .unwrap();
    assert_eq!(verify.status(), reqwest::StatusCode::OK);

    // Credential handed over once.
    let ready: Value = http
        .get(format!("{base}/pair/{code}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let credential = ready["token"].as_str().unwrap().to_string();

    let gone = http.get(format!("{base}/pair/{code}")).send().await.unwrap();
    assert_eq!(gone.status(), reqwest::StatusCode::GONE);

    // And the credential authenticates a workstation connection.
    let mut workstation = connect(addr, "/ws/workstation").await;
    auth(&mut workstation, &credential).await;
}

#[tokio::test]
async fn pair_verify_requires_a_viewer_principal() {
    let (addr, _state) = start_relay().await;
    let http = reqwest::Client::new();
    let base = format!("http://{addr}");

    let begin: Value = http
        .post(format!("{base}/pair"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let code = begin["code"].as_str().unwrap();

    let unauthorized = http
        .post(format!("{base}/pair/verify"))
        .json(&json!({ "code": code }))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_reports_counters() {
    let (addr, _state) = start_relay().await;
    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
}
