// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{sse, IntoResponse, Response, Sse},
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    services::ServeDir,
    set_header::SetResponseHeaderLayer,
    trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer},
};
use tracing::{debug, info, warn};

use treq_api::{
    Capabilities, CapabilityFeatures, CreateFlowRequest, CreateFlowResponse,
    CreateSessionRequest, CreateSessionResponse, ExecuteRequest, ExecuteResponse,
    FinishFlowResponse, HealthResponse, ImportApplyResponse, ImportRequest, LoginRequest,
    OpenWsSessionRequest, OpenWsSessionResponse, ParseRequest, RunScriptRequest,
    UpdateVariablesRequest,
};
use treq_core::{Error, ErrorKind};
use treq_engine::HttpEngine;

use crate::auth::{self, ScriptTokens, WebSessions};
use crate::config::Config;
use crate::error::{bind_json, ApiError, ApiResult};
use crate::events::EventFilter;
use crate::scope;
use crate::service::Service;
use crate::sse::{open_event_stream, StreamFrame};
use crate::state::AppState;
use crate::ws_session::{self, OpenParams, WsSessionManager};
use crate::{import, scripts};

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse { healthy: true, version: env!("CARGO_PKG_VERSION").to_string() })
}

async fn capabilities_handler() -> impl IntoResponse {
    Json(Capabilities {
        protocol: "treq/1".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        features: CapabilityFeatures {
            streaming_bodies: false,
            sse: true,
            ws_proxy: true,
            importers: true,
            scripts: true,
            control_frames: true,
        },
    })
}

async fn doc_handler() -> impl IntoResponse {
    Json(crate::doc::openapi_document())
}

// --- Auth ---

async fn login_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<LoginRequest>, axum::extract::rejection::JsonRejection>,
) -> ApiResult<Response> {
    let request = bind_json(body)?;
    let Some(server_token) = &app_state.config.auth.token else {
        return Err(Error::validation("cookie auth requires a configured server token").into());
    };
    if !app_state.config.auth.allow_cookie_auth {
        return Err(Error::validation("cookie auth is disabled").into());
    }
    if request.token != *server_token {
        warn!("Rejected web login with a bad token");
        return Err(Error::new(ErrorKind::Unauthorized, "invalid token").into());
    }

    let web_session_id = app_state.web_sessions.create();
    let cookie = auth::session_cookie(
        &web_session_id,
        app_state.web_sessions.ttl_ms() / 1000,
        auth::is_https(&headers),
    );
    info!("Web login succeeded");
    Ok(([(header::SET_COOKIE, cookie)], StatusCode::NO_CONTENT).into_response())
}

async fn logout_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Some(web_session_id) = auth::cookie_value(&headers, auth::SESSION_COOKIE) {
        app_state.web_sessions.remove(web_session_id);
    }
    let clear = auth::session_cookie("", 0, auth::is_https(&headers));
    ([(header::SET_COOKIE, clear)], StatusCode::NO_CONTENT).into_response()
}

// --- Parse / execute ---

async fn parse_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    body: Result<Json<ParseRequest>, axum::extract::rejection::JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    scope::require_full_access(&auth, "parse sources")?;
    let request = bind_json(body)?;
    Ok(Json(app_state.service.parse_source(request).await?))
}

async fn execute_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    body: Result<Json<ExecuteRequest>, axum::extract::rejection::JsonRejection>,
) -> ApiResult<Json<ExecuteResponse>> {
    let request = bind_json(body)?;
    scope::check_execute_scope(&auth, request.flow_id.as_deref(), request.session_id.as_deref())?;
    Ok(Json(app_state.service.execute(request).await?))
}

// --- Sessions ---

async fn create_session_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    body: Result<Json<CreateSessionRequest>, axum::extract::rejection::JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    scope::require_full_access(&auth, "create sessions")?;
    let request = bind_json(body)?;
    let session = app_state.service.create_session(request.variables)?;
    Ok((StatusCode::CREATED, Json(CreateSessionResponse { session_id: session.id.clone() })))
}

async fn get_session_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    scope::check_session_scope(&auth, &id)?;
    Ok(Json(app_state.service.session_state(&id)?))
}

async fn update_session_variables_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    Path(id): Path<String>,
    body: Result<Json<UpdateVariablesRequest>, axum::extract::rejection::JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    scope::check_session_scope(&auth, &id)?;
    let request = bind_json(body)?;
    Ok(Json(app_state.service.update_session_variables(&id, request).await?))
}

async fn delete_session_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    scope::require_full_access(&auth, "delete sessions")?;
    app_state.service.delete_session(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Flows ---

async fn create_flow_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    body: Result<Json<CreateFlowRequest>, axum::extract::rejection::JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    scope::require_full_access(&auth, "create flows")?;
    let request = bind_json(body)?;
    let flow = app_state.service.create_flow(request)?;
    Ok((StatusCode::CREATED, Json(CreateFlowResponse { flow_id: flow.id.clone() })))
}

async fn finish_flow_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    Path(flow_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    scope::require_full_access(&auth, "finish flows")?;
    let summary = app_state.service.finish_flow(&flow_id)?;
    Ok(Json(FinishFlowResponse { flow_id, summary }))
}

async fn get_execution_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    Path((flow_id, req_exec_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    scope::check_flow_scope(&auth, &flow_id)?;
    Ok(Json(app_state.service.get_execution(&flow_id, &req_exec_id)?))
}

// --- Workspace ---

#[derive(Debug, Default, Deserialize)]
struct WorkspaceFilesQuery {
    ignore: Option<String>,
}

async fn workspace_files_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    Query(query): Query<WorkspaceFilesQuery>,
) -> ApiResult<impl IntoResponse> {
    scope::require_full_access(&auth, "list the workspace")?;
    Ok(Json(app_state.service.list_workspace_files(query.ignore.as_deref())?))
}

#[derive(Debug, Deserialize)]
struct WorkspaceRequestsQuery {
    path: String,
}

async fn workspace_requests_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    Query(query): Query<WorkspaceRequestsQuery>,
) -> ApiResult<impl IntoResponse> {
    scope::require_full_access(&auth, "list the workspace")?;
    Ok(Json(app_state.service.workspace_requests(&query.path).await?))
}

// --- Event streams ---

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventStreamQuery {
    session_id: Option<String>,
    flow_id: Option<String>,
    after_seq: Option<u64>,
}

fn event_filter_for(
    app_state: &AppState,
    auth: &auth::AuthContext,
    query: &EventStreamQuery,
) -> ApiResult<EventFilter> {
    scope::check_event_scope(auth, query.session_id.as_deref(), query.flow_id.as_deref())?;
    if app_state.config.auth.token.is_some()
        && query.session_id.is_none()
        && query.flow_id.is_none()
    {
        return Err(Error::validation(
            "a sessionId or flowId filter is required when authentication is enabled",
        )
        .into());
    }
    Ok(EventFilter { session_id: query.session_id.clone(), flow_id: query.flow_id.clone() })
}

fn frame_to_sse_event(frame: &StreamFrame) -> sse::Event {
    match frame {
        StreamFrame::Envelope(envelope) => {
            let data = serde_json::to_string(envelope).unwrap_or_else(|_| "{}".to_string());
            sse::Event::default()
                .event(envelope.event_type.as_str())
                .id(format!("{}-{}", envelope.run_id, envelope.seq))
                .data(data)
        },
        StreamFrame::Connected(payload) | StreamFrame::Heartbeat(payload) => sse::Event::default()
            .event(frame.event_name())
            .data(payload.to_string()),
    }
}

async fn event_sse_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    Query(query): Query<EventStreamQuery>,
) -> ApiResult<Sse<impl futures::Stream<Item = Result<sse::Event, Infallible>>>> {
    let filter = event_filter_for(&app_state, &auth, &query)?;
    let frames = open_event_stream(&app_state.service, filter, query.after_seq);
    let stream =
        UnboundedReceiverStream::new(frames).map(|frame| Ok(frame_to_sse_event(&frame)));
    Ok(Sse::new(stream))
}

fn frame_to_ws_text(frame: &StreamFrame) -> Option<String> {
    match frame {
        StreamFrame::Envelope(envelope) => serde_json::to_string(envelope).ok(),
        StreamFrame::Connected(payload) | StreamFrame::Heartbeat(payload) => Some(
            serde_json::json!({ "type": frame.event_name(), "payload": payload }).to_string(),
        ),
    }
}

async fn event_ws_loop(mut socket: WebSocket, mut frames: mpsc::UnboundedReceiver<StreamFrame>) {
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let Some(text) = frame_to_ws_text(&frame) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            },
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // The event socket is one-way; other client frames are ignored.
                    Some(Ok(_)) => {},
                }
            },
        }
    }
    debug!("Event WS connection ended");
}

async fn event_ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    Query(query): Query<EventStreamQuery>,
) -> Response {
    let filter = match event_filter_for(&app_state, &auth, &query) {
        Ok(filter) => filter,
        Err(err) => return err.into_response(),
    };
    let frames = open_event_stream(&app_state.service, filter, query.after_seq);
    ws.on_upgrade(move |socket| event_ws_loop(socket, frames))
}

// --- WS sessions ---

async fn execute_ws_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    body: Result<Json<OpenWsSessionRequest>, axum::extract::rejection::JsonRejection>,
) -> ApiResult<Json<OpenWsSessionResponse>> {
    let request = bind_json(body)?;
    scope::check_execute_scope(&auth, request.flow_id.as_deref(), request.session_id.as_deref())?;

    let url = app_state.service.resolve_ws_target(&request).await?;
    let (upstream, reader) = ws_session::connect_upstream(&url).await?;
    let (session, opened) = app_state
        .ws_sessions
        .open(OpenParams {
            upstream,
            upstream_url: url.clone(),
            subprotocol: request.subprotocol,
            flow_id: request.flow_id,
            req_exec_id: None,
            replay_buffer_size: request.replay_buffer_size,
            idle_timeout_ms: request.idle_timeout_ms,
        })
        .await?;
    ws_session::spawn_upstream_pump(
        Arc::clone(&app_state.ws_sessions),
        session.id.clone(),
        reader,
    );

    Ok(Json(OpenWsSessionResponse {
        ws_session_id: session.id.clone(),
        url,
        last_seq: opened.seq,
        subprotocol: session.subprotocol.clone(),
    }))
}

fn check_ws_session_scope(
    auth: &auth::AuthContext,
    session: &crate::ws_session::WsSession,
) -> ApiResult<()> {
    if let Some(token) = auth.script() {
        if session.flow_id.as_deref() != Some(token.flow_id.as_str()) {
            return Err(Error::new(
                ErrorKind::ScopeViolation,
                format!("script token is scoped to flow {}", token.flow_id),
            )
            .into());
        }
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsAttachQuery {
    after_seq: Option<u64>,
}

async fn client_session_loop(
    app_state: Arc<AppState>,
    ws_session_id: String,
    after_seq: Option<u64>,
    mut socket: WebSocket,
) {
    let Ok(session) = app_state.ws_sessions.get(&ws_session_id) else { return };
    let (tx, mut envelopes) = mpsc::unbounded_channel();
    session.attach_client(tx);

    // Replay first; live envelopes queued meanwhile are deduplicated by the
    // per-session seq floor (session seqs are strictly increasing).
    let mut seq_floor = 0;
    if let Some(after) = after_seq {
        let replayed = app_state.ws_sessions.replay(&ws_session_id, after).unwrap_or_default();
        for envelope in replayed {
            seq_floor = seq_floor.max(envelope.seq);
            let Ok(text) = serde_json::to_string(&envelope) else { continue };
            if socket.send(Message::Text(text.into())).await.is_err() {
                session.detach_client();
                return;
            }
        }
    }

    loop {
        tokio::select! {
            envelope = envelopes.recv() => {
                let Some(envelope) = envelope else { break };
                if envelope.seq <= seq_floor {
                    continue;
                }
                let Ok(text) = serde_json::to_string(&envelope) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            },
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if app_state
                            .ws_sessions
                            .send(&ws_session_id, text.to_string())
                            .await
                            .is_err()
                        {
                            break;
                        }
                    },
                    Some(Ok(Message::Binary(_))) => {
                        let _ = app_state.ws_sessions.record_binary(&ws_session_id, "outbound");
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {},
                }
            },
        }
    }
    // The session stays alive for later replay; only the delivery channel goes.
    session.detach_client();
    debug!(ws_session_id = %ws_session_id, "Client detached from WS session");
}

async fn ws_attach_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    Path(ws_session_id): Path<String>,
    Query(query): Query<WsAttachQuery>,
) -> Response {
    let session = match app_state.ws_sessions.get(&ws_session_id) {
        Ok(session) => session,
        Err(err) => return ApiError(err).into_response(),
    };
    if let Err(err) = check_ws_session_scope(&auth, &session) {
        return err.into_response();
    }
    ws.on_upgrade(move |socket| {
        client_session_loop(app_state, ws_session_id, query.after_seq, socket)
    })
}

async fn ws_close_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    Path(ws_session_id): Path<String>,
) -> ApiResult<StatusCode> {
    let session = app_state.ws_sessions.get(&ws_session_id)?;
    check_ws_session_scope(&auth, &session)?;
    app_state.ws_sessions.close(&ws_session_id, 1000, "closed by client", true).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Importers ---

async fn import_preview_handler(
    State(_app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    Path(kind): Path<String>,
    body: Result<Json<ImportRequest>, axum::extract::rejection::JsonRejection>,
) -> ApiResult<Response> {
    scope::require_full_access(&auth, "use importers")?;
    let request = bind_json(body)?;
    let outcome = import::convert(&kind, &request.content)?;

    let status = if outcome.has_errors() && !request.force {
        StatusCode::UNPROCESSABLE_ENTITY
    } else if outcome.is_partial() {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome.into_preview())).into_response())
}

async fn import_apply_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    Path(kind): Path<String>,
    body: Result<Json<ImportRequest>, axum::extract::rejection::JsonRejection>,
) -> ApiResult<Response> {
    scope::require_full_access(&auth, "use importers")?;
    let request = bind_json(body)?;
    let outcome = import::convert(&kind, &request.content)?;

    if outcome.has_errors() && !request.force {
        return Ok((StatusCode::UNPROCESSABLE_ENTITY, Json(outcome.into_preview())).into_response());
    }

    let target = request
        .target_path
        .as_deref()
        .ok_or_else(|| Error::validation("targetPath is required for apply"))?;
    let resolved =
        crate::workspace::resolve_new_path(app_state.service.workspace_root(), target)?;
    tokio::fs::write(&resolved, &outcome.content)
        .await
        .map_err(|e| Error::internal(format!("writing {target}: {e}")))?;
    info!(path = %target, imported = outcome.imported, "Applied import");

    let status = if outcome.is_partial() { StatusCode::MULTI_STATUS } else { StatusCode::OK };
    let response = ImportApplyResponse {
        path: target.to_string(),
        imported: outcome.imported,
        skipped: outcome.skipped,
        diagnostics: outcome.diagnostics,
    };
    Ok((status, Json(response)).into_response())
}

// --- Scripts ---

async fn run_script_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<auth::AuthContext>,
    body: Result<Json<RunScriptRequest>, axum::extract::rejection::JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    scope::require_full_access(&auth, "spawn scripts")?;
    let request = bind_json(body)?;
    Ok(Json(scripts::run_script(&app_state, request).await?))
}

// --- CORS ---

/// Matches `http://localhost:*`-style wildcard patterns and exact origins.
fn origin_matches_pattern(origin: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(prefix_without_port) = pattern.strip_suffix(":*") {
        let Some(rest) = origin.strip_prefix(prefix_without_port) else {
            return false;
        };
        let Some(port_str) = rest.strip_prefix(':') else {
            return false;
        };
        return !port_str.is_empty() && port_str.chars().all(|c| c.is_ascii_digit());
    }

    origin == pattern
}

fn create_cors_layer(config: &Config) -> CorsLayer {
    use axum::http::{HeaderValue, Method};

    // Local tooling is always allowed; the config adds to this set.
    let mut patterns: Vec<String> = [
        "http://localhost",
        "https://localhost",
        "http://localhost:*",
        "https://localhost:*",
        "http://127.0.0.1",
        "https://127.0.0.1",
        "http://127.0.0.1:*",
        "https://127.0.0.1:*",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();
    patterns.extend(config.cors.allowed_origins.iter().cloned());
    if let Some(web_url) = &config.server.web_url {
        patterns.push(web_url.trim_end_matches('/').to_string());
    }

    info!(allowed_origins = ?patterns, "CORS configured with origin allowlist");

    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _request_parts| {
        let Ok(origin_str) = origin.to_str() else {
            return false;
        };
        patterns.iter().any(|pattern| origin_matches_pattern(origin_str, pattern))
    });

    // Credentials are allowed, so headers must be listed explicitly — a
    // wildcard would be rejected by browsers.
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}

#[cfg(test)]
mod cors_tests {
    use super::origin_matches_pattern;

    #[test]
    fn cors_wildcard_port_matches_localhost_port_only() {
        assert!(origin_matches_pattern("http://localhost:8080", "http://localhost:*"));
        assert!(origin_matches_pattern("https://localhost:12345", "https://localhost:*"));

        assert!(!origin_matches_pattern("http://localhost", "http://localhost:*"));
        assert!(!origin_matches_pattern("http://localhost:abc", "http://localhost:*"));
        assert!(!origin_matches_pattern("http://localhost123:8080", "http://localhost:*"));
        assert!(!origin_matches_pattern("http://127.0.0.1:8080", "http://localhost:*"));
    }

    #[test]
    fn cors_exact_match_only() {
        assert!(origin_matches_pattern("https://example.com", "https://example.com"));
        assert!(!origin_matches_pattern("https://example.com:443", "https://example.com"));
        assert!(!origin_matches_pattern("https://example.com", "https://example.com:*"));
    }
}

// --- App assembly ---

fn spawn_sweepers(app_state: &Arc<AppState>) {
    let sessions = app_state.service.sessions();
    app_state.register_task(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let _ = sessions.sweep_expired();
        }
    }));

    let ws_sessions = Arc::clone(&app_state.ws_sessions);
    app_state.register_task(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let _ = ws_sessions.sweep_idle().await;
        }
    }));
}

/// Creates the Axum application with all routes and middleware.
///
/// # Errors
///
/// Returns an error if the configured workspace root does not exist.
pub fn create_app(config: Config) -> Result<(Router, Arc<AppState>), Box<dyn std::error::Error>> {
    let config = Arc::new(config);

    let engine = Arc::new(HttpEngine::new());
    let service = Arc::new(Service::new(&config, engine, Vec::new())?);
    let ws_sessions = Arc::new(WsSessionManager::new(
        config.limits.max_ws_sessions,
        config.limits.ws_replay_buffer_size,
        config.limits.ws_idle_timeout_ms,
    ));
    let script_tokens = Arc::new(ScriptTokens::new(
        config.auth.token.clone(),
        config.auth.script_token_ttl_ms,
    ));
    let web_sessions = Arc::new(WebSessions::new(config.limits.session_ttl_ms));

    let app_state = Arc::new(AppState::new(
        Arc::clone(&config),
        service,
        ws_sessions,
        script_tokens,
        web_sessions,
    ));
    spawn_sweepers(&app_state);

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/capabilities", get(capabilities_handler))
        .route("/doc", get(doc_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/parse", post(parse_handler))
        .route("/execute", post(execute_handler))
        .route("/execute/ws", post(execute_ws_handler))
        .route("/ws/session/{id}", get(ws_attach_handler).delete(ws_close_handler))
        .route("/session", post(create_session_handler))
        .route("/session/{id}", get(get_session_handler).delete(delete_session_handler))
        .route("/session/{id}/variables", put(update_session_variables_handler))
        .route("/flows", post(create_flow_handler))
        .route("/flows/{flow_id}/finish", post(finish_flow_handler))
        .route("/flows/{flow_id}/executions/{req_exec_id}", get(get_execution_handler))
        .route("/workspace/files", get(workspace_files_handler))
        .route("/workspace/requests", get(workspace_requests_handler))
        .route("/event", get(event_sse_handler))
        .route("/event/ws", get(event_ws_handler))
        .route("/import/{kind}/preview", post(import_preview_handler))
        .route("/import/{kind}/apply", post(import_apply_handler))
        .route("/scripts/run", post(run_script_handler));

    if let Some(web_dir) = &config.server.web_dir {
        router = router.nest_service("/ui", ServeDir::new(web_dir));
    }

    let cors_layer = create_cors_layer(&config);

    let router = router
        .with_state(Arc::clone(&app_state))
        .layer(middleware::from_fn_with_state(Arc::clone(&app_state), auth::auth_middleware))
        .layer(
            TraceLayer::new_for_http()
                // Keep per-request logs out of INFO hot paths; surface failures at WARN.
                .on_response(DefaultOnResponse::new().level(tracing::Level::DEBUG))
                .on_failure(DefaultOnFailure::new().level(tracing::Level::WARN)),
        )
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            header::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("referrer-policy"),
            header::HeaderValue::from_static("no-referrer"),
        ))
        .layer(cors_layer);

    Ok((router, app_state))
}

/// Starts the HTTP server and blocks until shutdown.
///
/// # Errors
///
/// Returns an error if the address cannot be parsed or bound.
///
/// # Panics
///
/// Panics if the Ctrl+C or SIGTERM handlers cannot be installed (critical
/// OS failure).
pub async fn start_server(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let (app, app_state) = create_app(config.clone())?;

    let addr: SocketAddr = config.server.address().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "Starting HTTP API server");

    if config.auth.token.is_none() && !addr.ip().is_loopback() {
        warn!(
            address = %addr,
            "Serving on a non-loopback address without auth.token; every caller is trusted"
        );
    }

    // These expect() calls are justified and documented in the # Panics section.
    #[allow(clippy::expect_used)]
    let shutdown_signal = async {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {
                info!("Received CTRL-C signal, initiating graceful shutdown");
            },
            () = terminate => {
                info!("Received SIGTERM signal, initiating graceful shutdown");
            },
        }
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    app_state.shutdown().await;
    Ok(())
}
