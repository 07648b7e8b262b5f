// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::disallowed_macros,
    clippy::uninlined_format_args
)]

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::time::Duration;
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

/// Tiny upstream the engine can talk to.
async fn start_upstream() -> Option<SocketAddr> {
    let listener = bind_local().await?;
    let addr = listener.local_addr().unwrap();

    let router = Router::new()
        .route(
            "/hello",
            get(|headers: axum::http::HeaderMap| async move {
                headers.get("authorization").map_or_else(
                    || "anonymous".to_string(),
                    |v| v.to_str().unwrap_or_default().to_string(),
                )
            }),
        )
        .route("/cookie", get(|| async { ([("set-cookie", "s=1; Path=/")], "cookie set") }))
        .route(
            "/echo-cookie",
            get(|headers: axum::http::HeaderMap| async move {
                headers
                    .get("cookie")
                    .map_or_else(String::new, |v| v.to_str().unwrap_or_default().to_string())
            }),
        );

    let _ = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service()).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    Some(addr)
}

#[tokio::test]
async fn test_health_and_capabilities() {
    let workspace = tempfile::tempdir().unwrap();
    let Some((addr, _server)) = start_test_server(workspace.path()).await else {
        eprintln!("Skipping: local TCP bind not permitted");
        return;
    };
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["healthy"], true);

    let capabilities: serde_json::Value = client
        .get(format!("http://{addr}/capabilities"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(capabilities["features"]["streamingBodies"], false);
    assert_eq!(capabilities["features"]["wsProxy"], true);
}

#[tokio::test]
async fn test_session_lifecycle_and_redaction() {
    let workspace = tempfile::tempdir().unwrap();
    let Some((addr, _server)) = start_test_server(workspace.path()).await else {
        eprintln!("Skipping: local TCP bind not permitted");
        return;
    };
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let created = client
        .post(format!("{base}/session"))
        .json(&serde_json::json!({ "variables": { "apiToken": "abc", "url": "http://x" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let session_id = created.json::<serde_json::Value>().await.unwrap()["sessionId"]
        .as_str()
        .unwrap()
        .to_string();

    let state: serde_json::Value = client
        .get(format!("{base}/session/{session_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["variables"]["apiToken"], "[REDACTED]");
    assert_eq!(state["variables"]["url"], "http://x");
    assert_eq!(state["snapshotVersion"], 1);

    let updated: serde_json::Value = client
        .put(format!("{base}/session/{session_id}/variables"))
        .json(&serde_json::json!({ "variables": { "url": "http://y" }, "mode": "merge" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["snapshotVersion"], 2);
    assert_eq!(updated["variables"]["url"], "http://y");
    assert_eq!(updated["variables"]["apiToken"], "[REDACTED]");

    let deleted = client.delete(format!("{base}/session/{session_id}")).send().await.unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let gone = client.get(format!("{base}/session/{session_id}")).send().await.unwrap();
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = gone.json().await.unwrap();
    assert_eq!(body["error"]["code"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn test_execute_with_session_variables_and_cookies() {
    let workspace = tempfile::tempdir().unwrap();
    let (Some((addr, _server)), Some(upstream)) =
        (start_test_server(workspace.path()).await, start_upstream().await)
    else {
        eprintln!("Skipping: local TCP bind not permitted");
        return;
    };
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let session_id = client
        .post(format!("{base}/session"))
        .json(&serde_json::json!({ "variables": { "token": "abc" } }))
        .send()
        .await
        .unwrap()
        .json::<serde_json::Value>()
        .await
        .unwrap()["sessionId"]
        .as_str()
        .unwrap()
        .to_string();

    // Scenario: session variable + request variable interpolate into the
    // outgoing request; no mutation happened, so snapshotVersion stays 1.
    let envelope: serde_json::Value = client
        .post(format!("{base}/execute"))
        .json(&serde_json::json!({
            "content": "GET {{baseUrl}}/hello\nAuthorization: Bearer {{token}}\n",
            "variables": { "baseUrl": format!("http://{upstream}") },
            "sessionId": session_id,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(envelope["response"]["status"], 200);
    assert_eq!(envelope["response"]["body"], "Bearer abc");
    assert_eq!(envelope["session"]["snapshotVersion"], 1);
    assert_eq!(envelope["response"]["bodyMode"], "buffered");
    assert_eq!(envelope["response"]["encoding"], "utf-8");

    // Upstream sets a cookie: snapshotVersion bumps exactly once and the
    // next request in the session carries it.
    let envelope: serde_json::Value = client
        .post(format!("{base}/execute"))
        .json(&serde_json::json!({
            "content": format!("GET http://{upstream}/cookie\n"),
            "sessionId": session_id,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(envelope["session"]["snapshotVersion"], 2);
    assert_eq!(envelope["session"]["cookieCount"], 1);

    let state: serde_json::Value = client
        .get(format!("{base}/session/{session_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["cookieCount"], 1);

    let envelope: serde_json::Value = client
        .post(format!("{base}/execute"))
        .json(&serde_json::json!({
            "content": format!("GET http://{upstream}/echo-cookie\n"),
            "sessionId": session_id,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(envelope["response"]["body"], "s=1");
    assert_eq!(envelope["session"]["snapshotVersion"], 2);
}

#[tokio::test]
async fn test_execute_path_traversal_is_403() {
    let workspace = tempfile::tempdir().unwrap();
    let Some((addr, _server)) = start_test_server(workspace.path()).await else {
        eprintln!("Skipping: local TCP bind not permitted");
        return;
    };
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/execute"))
        .json(&serde_json::json!({ "path": "../etc/passwd" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "PATH_OUTSIDE_WORKSPACE");
}

#[tokio::test]
async fn test_execute_validation_errors() {
    let workspace = tempfile::tempdir().unwrap();
    let Some((addr, _server)) = start_test_server(workspace.path()).await else {
        eprintln!("Skipping: local TCP bind not permitted");
        return;
    };
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let response =
        client.post(format!("{base}/execute")).json(&serde_json::json!({})).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "CONTENT_OR_PATH_REQUIRED");

    let response = client
        .post(format!("{base}/execute"))
        .json(&serde_json::json!({ "content": "GET http://x/\n", "sessionId": "nope" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client
        .post(format!("{base}/execute"))
        .json(&serde_json::json!({ "content": "GET http://x/\n", "timeoutMs": 5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_flow_lifecycle() {
    let workspace = tempfile::tempdir().unwrap();
    let (Some((addr, _server)), Some(upstream)) =
        (start_test_server(workspace.path()).await, start_upstream().await)
    else {
        eprintln!("Skipping: local TCP bind not permitted");
        return;
    };
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let created = client
        .post(format!("{base}/flows"))
        .json(&serde_json::json!({ "label": "smoke" }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let flow_id =
        created.json::<serde_json::Value>().await.unwrap()["flowId"].as_str().unwrap().to_string();

    let envelope: serde_json::Value = client
        .post(format!("{base}/execute"))
        .json(&serde_json::json!({
            "content": format!("GET http://{upstream}/hello\n"),
            "flowId": flow_id,
            "reqLabel": "step-1",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let req_exec_id = envelope["reqExecId"].as_str().unwrap().to_string();

    let record: serde_json::Value = client
        .get(format!("{base}/flows/{flow_id}/executions/{req_exec_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(record["status"], "success");
    assert_eq!(record["label"], "step-1");
    assert_eq!(record["response"]["status"], 200);

    let finished: serde_json::Value = client
        .post(format!("{base}/flows/{flow_id}/finish"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(finished["summary"]["total"], 1);
    assert_eq!(finished["summary"]["succeeded"], 1);
    assert_eq!(finished["summary"]["failed"], 0);

    // Finished flows accept no more executions.
    let rejected = client
        .post(format!("{base}/execute"))
        .json(&serde_json::json!({
            "content": format!("GET http://{upstream}/hello\n"),
            "flowId": flow_id,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = rejected.json().await.unwrap();
    assert_eq!(body["error"]["code"], "FLOW_FINISHED");
}

#[tokio::test]
async fn test_parse_with_diagnostics() {
    let workspace = tempfile::tempdir().unwrap();
    let Some((addr, _server)) = start_test_server(workspace.path()).await else {
        eprintln!("Skipping: local TCP bind not permitted");
        return;
    };
    let client = reqwest::Client::new();

    let response: serde_json::Value = client
        .post(format!("http://{addr}/parse"))
        .json(&serde_json::json!({
            "content": "GET http://x/\nAccept: a\naccept: b\n",
            "includeDiagnostics": true,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["requests"].as_array().unwrap().len(), 1);
    assert_eq!(response["diagnostics"][0]["code"], "duplicate-header");
    assert_eq!(response["diagnostics"][0]["severity"], "warning");
}

#[tokio::test]
async fn test_workspace_listing_and_requests() {
    let workspace = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(workspace.path().join("api")).unwrap();
    std::fs::write(
        workspace.path().join("api/users.http"),
        "### List users\nGET http://x/users\n",
    )
    .unwrap();
    std::fs::write(workspace.path().join("readme.txt"), "not a request file").unwrap();

    let Some((addr, _server)) = start_test_server(workspace.path()).await else {
        eprintln!("Skipping: local TCP bind not permitted");
        return;
    };
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let files: serde_json::Value =
        client.get(format!("{base}/workspace/files")).send().await.unwrap().json().await.unwrap();
    assert_eq!(files["files"][0]["path"], "api/users.http");

    let requests: serde_json::Value = client
        .get(format!("{base}/workspace/requests"))
        .query(&[("path", "api/users.http")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(requests["requests"][0]["method"], "GET");
    assert_eq!(requests["requests"][0]["name"], "List users");
}

#[tokio::test]
async fn test_sse_stream_opens_with_connected() {
    let workspace = tempfile::tempdir().unwrap();
    let Some((addr, _server)) = start_test_server(workspace.path()).await else {
        eprintln!("Skipping: local TCP bind not permitted");
        return;
    };
    let client = reqwest::Client::new();

    let response =
        client.get(format!("http://{addr}/event")).send().await.unwrap();
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .starts_with("text/event-stream"));

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    use futures_util::StreamExt;
    let first = tokio::time::timeout(Duration::from_secs(2), stream.next()).await;
    if let Ok(Some(Ok(chunk))) = first {
        body.extend_from_slice(&chunk);
    }
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("event: connected"), "unexpected SSE preamble: {text}");
}

#[tokio::test]
async fn test_import_curl_preview_and_apply() {
    let workspace = tempfile::tempdir().unwrap();
    let Some((addr, _server)) = start_test_server(workspace.path()).await else {
        eprintln!("Skipping: local TCP bind not permitted");
        return;
    };
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let preview = client
        .post(format!("{base}/import/curl/preview"))
        .json(&serde_json::json!({ "content": "curl -X POST https://api.test/x -d a=1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(preview.status(), StatusCode::OK);
    let body: serde_json::Value = preview.json().await.unwrap();
    assert!(body["content"].as_str().unwrap().contains("POST https://api.test/x"));

    let apply = client
        .post(format!("{base}/import/curl/apply"))
        .json(&serde_json::json!({
            "content": "curl https://api.test/y",
            "targetPath": "imported/y.http",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(apply.status(), StatusCode::OK);
    let written =
        std::fs::read_to_string(workspace.path().join("imported/y.http")).unwrap();
    assert!(written.contains("GET https://api.test/y"));

    // Error findings without force are blocked.
    let blocked = client
        .post(format!("{base}/import/curl/apply"))
        .json(&serde_json::json!({ "content": "curl -X POST", "targetPath": "imported/z.http" }))
        .send()
        .await
        .unwrap();
    assert_eq!(blocked.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
