// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::disallowed_macros,
    clippy::uninlined_format_args
)]

use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use treq_server::Config;

async fn bind_local() -> Option<TcpListener> {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => Some(listener),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => None,
        Err(e) => panic!("Failed to bind test listener: {e}"),
    }
}

async fn start_test_server(
    workspace: &std::path::Path,
) -> Option<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = bind_local().await?;
    let addr = listener.local_addr().unwrap();

    let mut config = Config::default();
    config.workspace.root = workspace.to_string_lossy().into_owned();

    let server_handle = tokio::spawn(async move {
        let (app, _state) = treq_server::server::create_app(config).unwrap();
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    Some((addr, server_handle))
}

async fn echo_ws(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        if let AxumMessage::Text(text) = message {
            if socket.send(AxumMessage::Text(text)).await.is_err() {
                break;
            }
        }
    }
}

/// Upstream WebSocket echo server for the proxy to talk to.
async fn start_ws_upstream() -> Option<SocketAddr> {
    let listener = bind_local().await?;
    let addr = listener.local_addr().unwrap();

    let router = Router::new()
        .route("/echo", get(|ws: WebSocketUpgrade| async move { ws.on_upgrade(echo_ws) }));
    let _ = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service()).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    Some(addr)
}

async fn next_envelope(
    stream: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(3), stream.next())
            .await
            .expect("timed out waiting for envelope")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_ws_session_proxy_round_trip_and_replay() {
    let workspace = tempfile::tempdir().unwrap();
    let (Some((addr, _server)), Some(upstream)) =
        (start_test_server(workspace.path()).await, start_ws_upstream().await)
    else {
        eprintln!("Skipping: local TCP bind not permitted");
        return;
    };
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    // Open a proxied session against the upstream echo endpoint.
    let opened = client
        .post(format!("{base}/execute/ws"))
        .json(&serde_json::json!({ "content": format!("GET ws://{upstream}/echo\n") }))
        .send()
        .await
        .unwrap();
    assert_eq!(opened.status(), StatusCode::OK);
    let opened: serde_json::Value = opened.json().await.unwrap();
    let ws_session_id = opened["wsSessionId"].as_str().unwrap().to_string();
    assert_eq!(opened["lastSeq"], 1);

    // Attach, send one frame, and watch it go out and come back.
    let (mut socket, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/ws/session/{ws_session_id}"
    ))
    .await
    .unwrap();

    socket.send(Message::Text("hello".into())).await.unwrap();

    let outbound = next_envelope(&mut socket).await;
    assert_eq!(outbound["type"], "session.outbound");
    assert_eq!(outbound["payload"]["text"], "hello");
    assert_eq!(outbound["seq"], 2);

    let inbound = next_envelope(&mut socket).await;
    assert_eq!(inbound["type"], "session.inbound");
    assert_eq!(inbound["payload"]["text"], "hello");
    assert_eq!(inbound["seq"], 3);

    // Binary frames are answered with an error envelope, not a teardown.
    socket.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
    let error = next_envelope(&mut socket).await;
    assert_eq!(error["type"], "session.error");
    assert_eq!(error["payload"]["code"], "WS_BINARY_UNSUPPORTED");

    let _ = socket.close(None).await;

    // Reconnect and replay the full history; the session survived.
    let (mut socket, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/ws/session/{ws_session_id}?afterSeq=0"
    ))
    .await
    .unwrap();

    let types: Vec<String> = {
        let mut collected = Vec::new();
        loop {
            let envelope = next_envelope(&mut socket).await;
            let envelope_type = envelope["type"].as_str().unwrap().to_string();
            let done = envelope_type == "session.replay.end";
            collected.push(envelope_type);
            if done {
                break;
            }
        }
        collected
    };
    assert_eq!(
        types,
        vec![
            "session.opened",
            "session.outbound",
            "session.inbound",
            "session.error",
            "session.replay.end",
        ]
    );
    let _ = socket.close(None).await;

    // Explicit close removes the session.
    let closed =
        client.delete(format!("{base}/ws/session/{ws_session_id}")).send().await.unwrap();
    assert_eq!(closed.status(), StatusCode::NO_CONTENT);

    let gone = client.delete(format!("{base}/ws/session/{ws_session_id}")).send().await.unwrap();
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = gone.json().await.unwrap();
    assert_eq!(body["error"]["code"], "WS_SESSION_NOT_FOUND");
}

#[tokio::test]
async fn test_execute_ws_rejects_http_urls() {
    let workspace = tempfile::tempdir().unwrap();
    let Some((addr, _server)) = start_test_server(workspace.path()).await else {
        eprintln!("Skipping: local TCP bind not permitted");
        return;
    };
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/execute/ws"))
        .json(&serde_json::json!({ "content": "GET http://example.com/\n" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_event_ws_stream_delivers_envelopes() {
    let workspace = tempfile::tempdir().unwrap();
    let Some((addr, _server)) = start_test_server(workspace.path()).await else {
        eprintln!("Skipping: local TCP bind not permitted");
        return;
    };
    let client = reqwest::Client::new();

    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/event/ws")).await.unwrap();

    let connected = next_envelope(&mut socket).await;
    assert_eq!(connected["type"], "connected");

    // A failing execute still produces its run's event sequence.
    let _ = client
        .post(format!("http://{addr}/execute"))
        .json(&serde_json::json!({ "content": "GET http://127.0.0.1:1/\n" }))
        .send()
        .await
        .unwrap();

    let first = next_envelope(&mut socket).await;
    assert_eq!(first["type"], "executionStarted");
    assert_eq!(first["seq"], 1);

    let second = next_envelope(&mut socket).await;
    assert_eq!(second["type"], "parseStarted");
    assert_eq!(second["seq"], 2);

    let _ = socket.close(None).await;
}
