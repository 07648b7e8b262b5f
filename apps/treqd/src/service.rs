// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The service facade: parse, execute, session, flow, and workspace
//! operations, with event emission and path safety in one place.
//!
//! The session lock is held from lookup through the engine call, so every
//! suspension inside an execute is ordered within its session. Flow-scoped
//! events draw their `seq` from the flow so flow subscribers see a gap-free
//! stream; everything else is sequenced per run by the bus.

use opentelemetry::global;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use treq_api::{
    CreateFlowRequest, EventType, ExecuteRequest, ExecuteResponse, ExecutionError,
    ExecutionRecord, ExecutionStatus, FlowSummary, Limits, ParseRequest, ParseResponse,
    ParsedRequestInfo, RequestIdentity, ResolvedPaths, ResponseInfo, SessionStateResponse,
    SourceDescriptor, Timing, UpdateVariablesRequest, WorkspaceFilesResponse,
    WorkspaceRequestsResponse,
};
use treq_core::hooks::{ExecutionHook, HookContext, HookPoint, HookRecord};
use treq_core::id::{self, now_millis};
use treq_core::{Error, ErrorKind, Result};
use treq_engine::{interpolate, CookieStore, Engine, EngineEvent, RunOptions};
use treq_parser::HttpRequest;

use crate::config::{Config, LimitsConfig};
use crate::events::{EmitParams, EventBus, EventFilter};
use crate::flow::{Flow, FlowStore, StoredExecution};
use crate::session::{rfc3339_millis, Session, SessionStore};
use crate::workspace;

/// Caller-supplied execute timeouts must stay within these bounds.
const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 300_000;

const fn engine_event_type(event: &EngineEvent) -> EventType {
    match event {
        EngineEvent::ParseStarted => EventType::ParseStarted,
        EngineEvent::ParseFinished { .. } => EventType::ParseFinished,
        EngineEvent::InterpolateStarted => EventType::InterpolateStarted,
        EngineEvent::InterpolateFinished { .. } => EventType::InterpolateFinished,
        EngineEvent::CompileStarted => EventType::CompileStarted,
        EngineEvent::CompileFinished => EventType::CompileFinished,
        EngineEvent::FetchStarted { .. } => EventType::FetchStarted,
        EngineEvent::FetchFinished { .. } => EventType::FetchFinished,
        EngineEvent::Error { .. } => EventType::Error,
    }
}

/// Emits every event of one run with consistent ids. When a flow is
/// attached, sequences come from the flow counter (producer-supplied).
struct RunEmitter {
    bus: Arc<EventBus>,
    run_id: String,
    session_id: Option<String>,
    flow: Option<Arc<Flow>>,
    req_exec_id: Option<String>,
}

impl RunEmitter {
    fn emit(&self, event_type: EventType, payload: Value) {
        let _ = self.bus.emit(EmitParams {
            run_id: self.run_id.clone(),
            session_id: self.session_id.clone(),
            flow_id: self.flow.as_ref().map(|flow| flow.id.clone()),
            req_exec_id: self.req_exec_id.clone(),
            event_type,
            seq: self.flow.as_ref().map(|flow| flow.next_seq()),
            payload,
        });
    }
}

/// The service layer shared by every transport.
pub struct Service {
    workspace_root: PathBuf,
    workspace_ignore: Vec<String>,
    limits: LimitsConfig,
    sessions: Arc<SessionStore>,
    flows: Arc<FlowStore>,
    bus: Arc<EventBus>,
    engine: Arc<dyn Engine>,
    hooks: Vec<Arc<dyn ExecutionHook>>,
    executions_counter: opentelemetry::metrics::Counter<u64>,
    execution_duration_histogram: opentelemetry::metrics::Histogram<f64>,
}

impl Service {
    /// Builds the service. The workspace root must exist.
    pub fn new(
        config: &Config,
        engine: Arc<dyn Engine>,
        hooks: Vec<Arc<dyn ExecutionHook>>,
    ) -> Result<Self> {
        let workspace_root = workspace::canonical_root(&config.workspace.root)?;
        let meter = global::meter("treqd_service");
        Ok(Self {
            workspace_root,
            workspace_ignore: config.workspace.ignore.clone(),
            limits: config.limits.clone(),
            sessions: Arc::new(SessionStore::new(
                config.limits.max_sessions,
                config.limits.session_ttl_ms,
            )),
            flows: Arc::new(FlowStore::new()),
            bus: Arc::new(EventBus::new(config.limits.event_replay_buffer_size)),
            engine,
            hooks,
            executions_counter: meter
                .u64_counter("executions")
                .with_description("Requests dispatched through the engine")
                .build(),
            execution_duration_histogram: meter
                .f64_histogram("execution.duration")
                .with_description("Execution wall time in seconds")
                .with_unit("s")
                .build(),
        })
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        Arc::clone(&self.sessions)
    }

    pub fn flows(&self) -> Arc<FlowStore> {
        Arc::clone(&self.flows)
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn workspace_root(&self) -> &PathBuf {
        &self.workspace_root
    }

    pub const fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    fn validate_timeout(&self, timeout_ms: Option<u64>) -> Result<Duration> {
        match timeout_ms {
            None => Ok(Duration::from_millis(self.limits.default_timeout_ms)),
            Some(ms) if (MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&ms) => {
                Ok(Duration::from_millis(ms))
            },
            Some(ms) => Err(Error::with_details(
                ErrorKind::Validation,
                format!("timeoutMs must be between {MIN_TIMEOUT_MS} and {MAX_TIMEOUT_MS}"),
                serde_json::json!({ "timeoutMs": ms }),
            )),
        }
    }

    /// Resolves the request source: exactly one of `content`/`path`.
    async fn load_source(
        &self,
        content: Option<&str>,
        path: Option<&str>,
    ) -> Result<(String, Option<PathBuf>, Option<String>)> {
        match (content, path) {
            (Some(_), Some(_)) => Err(Error::new(
                ErrorKind::ContentOrPathRequired,
                "exactly one of content or path must be provided",
            )),
            (None, None) => Err(Error::new(
                ErrorKind::ContentOrPathRequired,
                "one of content or path is required",
            )),
            (Some(text), None) => Ok((text.to_string(), None, None)),
            (None, Some(relative)) => {
                let resolved = workspace::resolve_path(&self.workspace_root, relative)?;
                let text = tokio::fs::read_to_string(&resolved).await.map_err(|e| {
                    Error::new(ErrorKind::FileNotFound, format!("file {relative}: {e}"))
                })?;
                Ok((text, Some(resolved), Some(relative.to_string())))
            },
        }
    }

    fn select_request(
        requests: Vec<HttpRequest>,
        name: Option<&str>,
        index: Option<usize>,
    ) -> Result<(HttpRequest, usize)> {
        if name.is_some() && index.is_some() {
            return Err(Error::validation(
                "requestName and requestIndex are mutually exclusive",
            ));
        }
        let count = requests.len();
        if let Some(name) = name {
            let position = requests
                .iter()
                .position(|request| request.name.as_deref() == Some(name))
                .ok_or_else(|| {
                    Error::new(ErrorKind::RequestNotFound, format!("request {name} not found"))
                })?;
            let mut requests = requests;
            return Ok((requests.swap_remove(position), position));
        }
        let index = index.unwrap_or(0);
        if index >= count {
            return Err(Error::with_details(
                ErrorKind::RequestIndexOutOfRange,
                format!("request index {index} out of range (source has {count})"),
                serde_json::json!({ "index": index, "count": count }),
            ));
        }
        let mut requests = requests;
        Ok((requests.swap_remove(index), index))
    }

    async fn run_hooks(
        &self,
        point: HookPoint,
        cx: &HookContext,
        value: &Value,
        records: &mut Vec<HookRecord>,
    ) {
        for hook in &self.hooks {
            let started = Instant::now();
            let result = match point {
                HookPoint::Setup => hook.setup(cx).await.map(|()| true),
                HookPoint::RequestBefore => hook.request_before(cx, value).await.map(|()| true),
                HookPoint::ResponseAfter => hook.response_after(cx, value).await.map(|()| true),
                HookPoint::Validate => hook.validate(cx, value).await,
                HookPoint::Teardown => hook.teardown(cx).await.map(|()| true),
            };
            if let Err(error) = &result {
                warn!(hook = hook.name(), point = point.as_str(), error = %error, "Execution hook failed");
            }
            records.push(HookRecord::capture(point, hook.name(), started, result));
        }
    }

    /// Central orchestration for `POST /execute`: resolve the source,
    /// select a request, run it under the session lock, and record the
    /// outcome.
    #[allow(clippy::too_many_lines)]
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse> {
        let timeout = self.validate_timeout(request.timeout_ms)?;
        let base_path = request
            .base_path
            .as_deref()
            .map(|relative| workspace::resolve_path(&self.workspace_root, relative))
            .transpose()?;

        let (text, source_file, source_relative) =
            self.load_source(request.content.as_deref(), request.path.as_deref()).await?;

        let parsed = treq_parser::parse(&text)
            .map_err(|e| Error::new(ErrorKind::Parse, e.to_string()))?;
        if parsed.is_empty() {
            return Err(Error::new(ErrorKind::NoRequestsFound, "source contains no requests"));
        }
        let (selected, index) = Self::select_request(
            parsed,
            request.request_name.as_deref(),
            request.request_index,
        )?;

        let flow = request.flow_id.as_deref().map(|id| self.flows.get_or_err(id)).transpose()?;
        if let Some(flow) = &flow {
            if flow.is_finished() {
                return Err(Error::new(
                    ErrorKind::FlowFinished,
                    format!("flow {} is finished", flow.id),
                ));
            }
        }
        let session =
            request.session_id.as_deref().map(|id| self.sessions.get_or_err(id)).transpose()?;

        let run_id = id::generate();
        let req_exec_id = flow.as_ref().map(|_| id::generate());
        let source = match &source_relative {
            Some(path) => SourceDescriptor::File {
                path: path.clone(),
                request_name: request.request_name.clone(),
                request_index: request.request_index,
            },
            None => SourceDescriptor::Content {
                request_name: request.request_name.clone(),
                request_index: request.request_index,
            },
        };

        let emitter = Arc::new(RunEmitter {
            bus: Arc::clone(&self.bus),
            run_id: run_id.clone(),
            session_id: session.as_ref().map(|s| s.id.clone()),
            flow: flow.clone(),
            req_exec_id: req_exec_id.clone(),
        });

        let started_ms = now_millis();
        let started_instant = Instant::now();
        emitter.emit(
            EventType::ExecutionStarted,
            serde_json::json!({
                "label": request.req_label,
                "method": selected.method,
                "source": serde_json::to_value(&source).unwrap_or(Value::Null),
            }),
        );

        // Steps 5–8 run under the session lock: no other execute or variable
        // update may interleave on this session.
        let _session_guard = match &session {
            Some(session) => Some(session.lock_ops().await),
            None => None,
        };
        if let Some(session) = &session {
            let _ = session.touch();
        }

        let mut variables: Map<String, Value> =
            session.as_ref().map(|s| s.variables()).unwrap_or_default();
        if let Some(extra) = &request.variables {
            variables.extend(extra.clone());
        }

        let hook_cx = HookContext {
            run_id: run_id.clone(),
            session_id: session.as_ref().map(|s| s.id.clone()),
            flow_id: flow.as_ref().map(|f| f.id.clone()),
            label: request.req_label.clone(),
        };
        let mut hook_records: Vec<HookRecord> = Vec::new();
        self.run_hooks(HookPoint::Setup, &hook_cx, &Value::Null, &mut hook_records).await;

        let request_headers: Vec<(String, String)> = selected
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), interpolate(value, &variables)))
            .collect();
        let url_preview = interpolate(&selected.url, &variables);
        let request_descriptor = serde_json::json!({
            "method": selected.method,
            "url": url_preview,
            "headers": request_headers,
        });
        self.run_hooks(HookPoint::RequestBefore, &hook_cx, &request_descriptor, &mut hook_records)
            .await;

        let event_emitter = Arc::clone(&emitter);
        let run_options = RunOptions {
            variables,
            base_path: base_path
                .clone()
                .or_else(|| source_file.as_ref().and_then(|f| f.parent().map(PathBuf::from)))
                .or_else(|| Some(self.workspace_root.clone())),
            timeout,
            follow_redirects: request.follow_redirects.unwrap_or(true),
            validate_ssl: request.validate_ssl.unwrap_or(true),
            max_body_bytes: self.limits.max_body_bytes,
            cookies: session.as_ref().map(|s| {
                let jar: Arc<dyn CookieStore> = s.cookies();
                jar
            }),
            on_event: Some(Arc::new(move |event: EngineEvent| {
                event_emitter.emit(engine_event_type(&event), event.payload());
            })),
        };

        let engine_result = self.engine.run_string(&selected.raw, run_options).await;
        let ended_ms = now_millis();
        let duration_ms = u64::try_from(started_instant.elapsed().as_millis()).unwrap_or(u64::MAX);
        let timing = Timing {
            started_at: rfc3339_millis(started_ms),
            ended_at: rfc3339_millis(ended_ms),
            duration_ms,
        };

        let engine_response = match engine_result {
            Ok(engine_response) => engine_response,
            Err(err) => {
                let stage = err
                    .details()
                    .and_then(|d| d["stage"].as_str())
                    .unwrap_or("execute")
                    .to_string();
                if let (Some(flow), Some(req_exec_id)) = (&flow, &req_exec_id) {
                    let record = ExecutionRecord {
                        req_exec_id: req_exec_id.clone(),
                        label: request.req_label.clone(),
                        source,
                        method: selected.method.clone(),
                        url: url_preview,
                        request_headers,
                        response: None,
                        timing: Some(timing),
                        status: ExecutionStatus::Failed,
                        error: Some(ExecutionError {
                            stage,
                            message: err.message().to_string(),
                        }),
                        hooks: hook_records.clone(),
                    };
                    if let Err(attach_err) =
                        flow.attach(StoredExecution { record, started_ms, ended_ms })
                    {
                        warn!(flow_id = %flow.id, error = %attach_err, "Could not attach failed execution");
                    }
                }
                emitter.emit(
                    EventType::ExecutionFinished,
                    serde_json::json!({ "status": "failed", "durationMs": duration_ms }),
                );
                self.run_hooks(HookPoint::Teardown, &hook_cx, &Value::Null, &mut hook_records)
                    .await;
                self.executions_counter
                    .add(1, &[opentelemetry::KeyValue::new("status", "failed")]);
                return Err(err);
            },
        };

        if engine_response.cookies_changed {
            if let Some(session) = &session {
                let snapshot_version = session.bump_snapshot();
                emitter.emit(
                    EventType::SessionUpdated,
                    serde_json::json!({
                        "variablesChanged": false,
                        "cookiesChanged": true,
                        "snapshotVersion": snapshot_version,
                    }),
                );
            }
        }

        let response_info = ResponseInfo {
            status: engine_response.status,
            headers: engine_response.headers,
            body: engine_response.body,
            ttfb_ms: engine_response.ttfb_ms,
        };
        let response_descriptor = serde_json::to_value(&response_info).unwrap_or(Value::Null);
        self.run_hooks(HookPoint::ResponseAfter, &hook_cx, &response_descriptor, &mut hook_records)
            .await;
        self.run_hooks(HookPoint::Validate, &hook_cx, &response_descriptor, &mut hook_records)
            .await;

        if let (Some(flow), Some(req_exec_id)) = (&flow, &req_exec_id) {
            let record = ExecutionRecord {
                req_exec_id: req_exec_id.clone(),
                label: request.req_label.clone(),
                source: source.clone(),
                method: engine_response.method.clone(),
                url: engine_response.url.clone(),
                request_headers: request_headers.clone(),
                response: Some(response_info.clone()),
                timing: Some(timing.clone()),
                status: ExecutionStatus::Success,
                error: None,
                hooks: hook_records.clone(),
            };
            flow.attach(StoredExecution { record, started_ms, ended_ms })?;
        }

        emitter.emit(
            EventType::ExecutionFinished,
            serde_json::json!({
                "status": "success",
                "statusCode": engine_response.status,
                "durationMs": duration_ms,
            }),
        );
        self.run_hooks(HookPoint::Teardown, &hook_cx, &Value::Null, &mut hook_records).await;

        self.executions_counter.add(1, &[opentelemetry::KeyValue::new("status", "success")]);
        self.execution_duration_histogram
            .record(started_instant.elapsed().as_secs_f64(), &[]);
        info!(
            run_id = %run_id,
            method = %engine_response.method,
            status = engine_response.status,
            duration_ms,
            "Execution completed"
        );

        Ok(ExecuteResponse {
            run_id,
            req_exec_id,
            flow_id: flow.as_ref().map(|f| f.id.clone()),
            session: session.as_ref().map(|s| s.descriptor()),
            request: RequestIdentity {
                method: engine_response.method,
                url: engine_response.url,
                name: selected.name,
                index,
            },
            paths: ResolvedPaths {
                workspace_root: self.workspace_root.to_string_lossy().into_owned(),
                path: source_relative,
                base_path: request.base_path,
            },
            response: response_info,
            limits: Limits { max_body_bytes: self.limits.max_body_bytes },
            timing,
            hooks: hook_records,
        })
    }

    // --- Sessions ---

    pub fn create_session(&self, variables: Option<Map<String, Value>>) -> Result<Arc<Session>> {
        self.sessions.create(variables)
    }

    pub fn session_state(&self, id: &str) -> Result<SessionStateResponse> {
        Ok(self.sessions.get_or_err(id)?.state_response())
    }

    /// Applies a variable update under the session lock and announces it.
    pub async fn update_session_variables(
        &self,
        id: &str,
        update: UpdateVariablesRequest,
    ) -> Result<SessionStateResponse> {
        let session = self.sessions.get_or_err(id)?;
        let _guard = session.lock_ops().await;
        let _ = session.touch();
        session.apply_variables(update.variables, update.mode);
        let snapshot_version = session.bump_snapshot();
        let _ = self.bus.emit(EmitParams {
            run_id: id::generate(),
            session_id: Some(session.id.clone()),
            flow_id: None,
            req_exec_id: None,
            event_type: EventType::SessionUpdated,
            seq: None,
            payload: serde_json::json!({
                "variablesChanged": true,
                "cookiesChanged": false,
                "snapshotVersion": snapshot_version,
            }),
        });
        Ok(session.state_response())
    }

    pub fn delete_session(&self, id: &str) -> Result<()> {
        self.sessions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::new(ErrorKind::SessionNotFound, format!("session {id} not found")))
    }

    // --- Flows ---

    pub fn create_flow(&self, request: CreateFlowRequest) -> Result<Arc<Flow>> {
        if let Some(session_id) = &request.session_id {
            let _ = self.sessions.get_or_err(session_id)?;
        }
        let flow = self.flows.create(request.session_id, request.label, request.meta);
        let _ = self.bus.emit(EmitParams {
            run_id: flow.id.clone(),
            session_id: flow.session_id.clone(),
            flow_id: Some(flow.id.clone()),
            req_exec_id: None,
            event_type: EventType::FlowStarted,
            seq: Some(flow.next_seq()),
            payload: serde_json::json!({ "label": flow.label }),
        });
        Ok(flow)
    }

    pub fn finish_flow(&self, id: &str) -> Result<FlowSummary> {
        let flow = self.flows.get_or_err(id)?;
        let summary = flow.finish()?;
        let _ = self.bus.emit(EmitParams {
            run_id: flow.id.clone(),
            session_id: flow.session_id.clone(),
            flow_id: Some(flow.id.clone()),
            req_exec_id: None,
            event_type: EventType::FlowFinished,
            seq: Some(flow.next_seq()),
            payload: serde_json::to_value(summary).unwrap_or(Value::Null),
        });
        Ok(summary)
    }

    pub fn get_execution(&self, flow_id: &str, req_exec_id: &str) -> Result<ExecutionRecord> {
        self.flows.get_or_err(flow_id)?.execution(req_exec_id)
    }

    // --- Parse & workspace ---

    pub async fn parse_source(&self, request: ParseRequest) -> Result<ParseResponse> {
        let (text, _, _) =
            self.load_source(request.content.as_deref(), request.path.as_deref()).await?;
        let requests = treq_parser::parse(&text)
            .map_err(|e| Error::new(ErrorKind::Parse, e.to_string()))?;
        let infos = requests
            .iter()
            .enumerate()
            .map(|(index, request)| ParsedRequestInfo {
                index,
                name: request.name.clone(),
                method: request.method.clone(),
                url: request.url.clone(),
                start_line: request.meta.start_line,
                end_line: request.meta.end_line,
            })
            .collect();
        let diagnostics =
            request.include_diagnostics.then(|| treq_parser::analyze(&text));
        Ok(ParseResponse { requests: infos, diagnostics })
    }

    pub fn list_workspace_files(&self, extra_ignore: Option<&str>) -> Result<WorkspaceFilesResponse> {
        let mut ignore = self.workspace_ignore.clone();
        if let Some(extra) = extra_ignore {
            ignore.extend(extra.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()));
        }
        Ok(WorkspaceFilesResponse {
            files: workspace::list_http_files(&self.workspace_root, &ignore)?,
        })
    }

    pub async fn workspace_requests(&self, path: &str) -> Result<WorkspaceRequestsResponse> {
        let parsed = self
            .parse_source(ParseRequest {
                content: None,
                path: Some(path.to_string()),
                include_diagnostics: false,
            })
            .await?;
        Ok(WorkspaceRequestsResponse { path: path.to_string(), requests: parsed.requests })
    }

    /// Resolves a workspace-relative path through the safety gate.
    pub fn resolve_workspace_path(&self, input: &str) -> Result<PathBuf> {
        workspace::resolve_path(&self.workspace_root, input)
    }

    /// Resolves a `POST /execute/ws` body to the interpolated upstream URL,
    /// applying the same source rules as `execute`. The URL must use a
    /// `ws://` or `wss://` scheme.
    pub async fn resolve_ws_target(
        &self,
        request: &treq_api::OpenWsSessionRequest,
    ) -> Result<String> {
        if let Some(flow_id) = &request.flow_id {
            let flow = self.flows.get_or_err(flow_id)?;
            if flow.is_finished() {
                return Err(Error::new(
                    ErrorKind::FlowFinished,
                    format!("flow {flow_id} is finished"),
                ));
            }
        }
        let session =
            request.session_id.as_deref().map(|id| self.sessions.get_or_err(id)).transpose()?;

        let (text, _, _) =
            self.load_source(request.content.as_deref(), request.path.as_deref()).await?;
        let parsed = treq_parser::parse(&text)
            .map_err(|e| Error::new(ErrorKind::Parse, e.to_string()))?;
        if parsed.is_empty() {
            return Err(Error::new(ErrorKind::NoRequestsFound, "source contains no requests"));
        }
        let (selected, _) = Self::select_request(
            parsed,
            request.request_name.as_deref(),
            request.request_index,
        )?;

        let mut variables: Map<String, Value> =
            session.as_ref().map(|s| s.variables()).unwrap_or_default();
        if let Some(extra) = &request.variables {
            variables.extend(extra.clone());
        }
        let url = interpolate(&selected.url, &variables);
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(Error::validation(format!(
                "WS sessions require a ws:// or wss:// URL, got {url}"
            )));
        }
        Ok(url)
    }

    /// Subscribes to the event bus (transport layers attach SSE/WS here).
    pub fn subscribe_events(
        &self,
        filter: EventFilter,
    ) -> (u64, tokio::sync::mpsc::UnboundedReceiver<treq_api::EventEnvelope>) {
        self.bus.subscribe(filter)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use treq_api::{BodyDescriptor, BodyEncoding, BodyMode, MergeMode};
    use treq_engine::EngineResponse;

    /// Engine stand-in: records the options it saw, optionally "receives"
    /// a Set-Cookie, optionally fails.
    struct MockEngine {
        set_cookie: Option<String>,
        fail_stage: Option<&'static str>,
        seen: std::sync::Mutex<Vec<(String, Map<String, Value>)>>,
    }

    impl MockEngine {
        fn ok() -> Self {
            Self { set_cookie: None, fail_stage: None, seen: std::sync::Mutex::new(Vec::new()) }
        }

        fn with_cookie(cookie: &str) -> Self {
            Self {
                set_cookie: Some(cookie.to_string()),
                fail_stage: None,
                seen: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn failing(stage: &'static str) -> Self {
            Self {
                set_cookie: None,
                fail_stage: Some(stage),
                seen: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Engine for MockEngine {
        async fn run_string(&self, raw: &str, options: RunOptions) -> Result<EngineResponse> {
            self.seen.lock().unwrap().push((raw.to_string(), options.variables.clone()));
            if let Some(sink) = &options.on_event {
                sink(EngineEvent::FetchStarted {
                    method: "GET".to_string(),
                    url: "http://mock/".to_string(),
                });
                sink(EngineEvent::FetchFinished { status: 200, duration_ms: 1 });
            }
            if let Some(stage) = self.fail_stage {
                return Err(Error::execute(stage, "mock failure"));
            }
            let cookies_changed = match (&self.set_cookie, &options.cookies) {
                (Some(cookie), Some(jar)) => {
                    let url = url::Url::parse("http://mock/").unwrap();
                    jar.store_response_cookies(&url, &[cookie.clone()]) > 0
                },
                _ => false,
            };
            Ok(EngineResponse {
                method: "GET".to_string(),
                url: "http://mock/".to_string(),
                status: 200,
                headers: vec![("content-type".to_string(), "text/plain".to_string())],
                body: BodyDescriptor {
                    body_mode: BodyMode::Buffered,
                    encoding: BodyEncoding::Utf8,
                    body: "ok".to_string(),
                    body_bytes: 2,
                    truncated: false,
                },
                ttfb_ms: Some(1),
                duration_ms: 1,
                cookies_changed,
            })
        }
    }

    fn service_with(engine: Arc<dyn Engine>) -> (tempfile::TempDir, Service) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("api.http"), "GET http://file/\n").unwrap();
        let mut config = Config::default();
        config.workspace.root = dir.path().to_string_lossy().into_owned();
        let service = Service::new(&config, engine, Vec::new()).unwrap();
        (dir, service)
    }

    fn content_request(content: &str) -> ExecuteRequest {
        ExecuteRequest { content: Some(content.to_string()), ..ExecuteRequest::default() }
    }

    #[tokio::test]
    async fn execute_merges_session_and_request_variables_request_wins() {
        let engine = Arc::new(MockEngine::ok());
        let (_dir, service) = service_with(Arc::<MockEngine>::clone(&engine));
        let session = service
            .create_session(Some(
                serde_json::json!({ "a": "session", "b": "session" })
                    .as_object()
                    .cloned()
                    .unwrap(),
            ))
            .unwrap();

        let mut request = content_request("GET http://x/\n");
        request.session_id = Some(session.id.clone());
        request.variables =
            Some(serde_json::json!({ "b": "request" }).as_object().cloned().unwrap());
        let _ = service.execute(request).await.unwrap();

        let seen = engine.seen.lock().unwrap();
        let (_, variables) = &seen[0];
        assert_eq!(variables["a"], "session");
        assert_eq!(variables["b"], "request");
    }

    #[tokio::test]
    async fn execute_requires_exactly_one_source() {
        let (_dir, service) = service_with(Arc::new(MockEngine::ok()));
        let err = service.execute(ExecuteRequest::default()).await.unwrap_err();
        assert_eq!(err.code(), "CONTENT_OR_PATH_REQUIRED");

        let mut both = content_request("GET http://x/\n");
        both.path = Some("api.http".to_string());
        let err = service.execute(both).await.unwrap_err();
        assert_eq!(err.code(), "CONTENT_OR_PATH_REQUIRED");
    }

    #[tokio::test]
    async fn execute_rejects_traversal_with_403_kind() {
        let (_dir, service) = service_with(Arc::new(MockEngine::ok()));
        let mut request = ExecuteRequest::default();
        request.path = Some("../etc/passwd".to_string());
        let err = service.execute(request).await.unwrap_err();
        assert_eq!(err.code(), "PATH_OUTSIDE_WORKSPACE");
        assert_eq!(err.http_status(), 403);
    }

    #[tokio::test]
    async fn selection_errors_are_precise() {
        let (_dir, service) = service_with(Arc::new(MockEngine::ok()));

        let err = service.execute(content_request("# only comments\n")).await.unwrap_err();
        assert_eq!(err.code(), "NO_REQUESTS_FOUND");

        let mut by_name = content_request("GET http://x/\n");
        by_name.request_name = Some("missing".to_string());
        assert_eq!(service.execute(by_name).await.unwrap_err().code(), "REQUEST_NOT_FOUND");

        let mut by_index = content_request("GET http://x/\n");
        by_index.request_index = Some(3);
        assert_eq!(
            service.execute(by_index).await.unwrap_err().code(),
            "REQUEST_INDEX_OUT_OF_RANGE"
        );

        let mut both = content_request("GET http://x/\n");
        both.request_name = Some("a".to_string());
        both.request_index = Some(0);
        assert_eq!(service.execute(both).await.unwrap_err().code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn timeout_bounds_are_enforced() {
        let (_dir, service) = service_with(Arc::new(MockEngine::ok()));
        for bad in [50_u64, 300_001] {
            let mut request = content_request("GET http://x/\n");
            request.timeout_ms = Some(bad);
            assert_eq!(service.execute(request).await.unwrap_err().code(), "VALIDATION_ERROR");
        }
    }

    #[tokio::test]
    async fn cookie_mutation_bumps_snapshot_and_emits_session_updated_once() {
        let engine = Arc::new(MockEngine::with_cookie("s=1; Path=/"));
        let (_dir, service) = service_with(engine);
        let session = service.create_session(None).unwrap();
        let (_, mut rx) = service.subscribe_events(EventFilter::default());

        let mut request = content_request("GET http://mock/\n");
        request.session_id = Some(session.id.clone());
        let response = service.execute(request).await.unwrap();

        assert_eq!(response.session.as_ref().unwrap().snapshot_version, 2);
        assert_eq!(response.session.as_ref().unwrap().cookie_count, 1);

        let mut session_updated = 0;
        while let Ok(envelope) = rx.try_recv() {
            if envelope.event_type == EventType::SessionUpdated {
                session_updated += 1;
                assert_eq!(envelope.payload["cookiesChanged"], true);
                assert_eq!(envelope.payload["variablesChanged"], false);
            }
        }
        assert_eq!(session_updated, 1);

        // A second identical execute does not re-announce the cookie.
        let mut again = content_request("GET http://mock/\n");
        again.session_id = Some(session.id.clone());
        let response = service.execute(again).await.unwrap();
        assert_eq!(response.session.unwrap().snapshot_version, 2);
    }

    #[tokio::test]
    async fn no_session_mutation_keeps_snapshot_at_one_without_events() {
        let (_dir, service) = service_with(Arc::new(MockEngine::ok()));
        let session = service
            .create_session(Some(serde_json::json!({ "token": "abc" }).as_object().cloned().unwrap()))
            .unwrap();
        let (_, mut rx) = service.subscribe_events(EventFilter::default());

        let mut request = content_request("GET http://mock/\n");
        request.session_id = Some(session.id.clone());
        let response = service.execute(request).await.unwrap();

        assert_eq!(response.session.unwrap().snapshot_version, 1);
        while let Ok(envelope) = rx.try_recv() {
            assert_ne!(envelope.event_type, EventType::SessionUpdated);
        }
    }

    #[tokio::test]
    async fn flow_attach_and_finish_summary() {
        let (_dir, service) = service_with(Arc::new(MockEngine::ok()));
        let flow = service.create_flow(CreateFlowRequest::default()).unwrap();

        let mut request = content_request("GET http://mock/\n");
        request.flow_id = Some(flow.id.clone());
        let response = service.execute(request).await.unwrap();
        let req_exec_id = response.req_exec_id.unwrap();

        let record = service.get_execution(&flow.id, &req_exec_id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.response.as_ref().unwrap().status, 200);

        let summary = service.finish_flow(&flow.id).unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);

        let mut late = content_request("GET http://mock/\n");
        late.flow_id = Some(flow.id.clone());
        assert_eq!(service.execute(late).await.unwrap_err().code(), "FLOW_FINISHED");
    }

    #[tokio::test]
    async fn flow_scoped_events_are_gap_free() {
        let (_dir, service) = service_with(Arc::new(MockEngine::ok()));
        let flow = service.create_flow(CreateFlowRequest::default()).unwrap();
        let (_, mut rx) = service
            .subscribe_events(EventFilter { session_id: None, flow_id: Some(flow.id.clone()) });

        let mut request = content_request("GET http://mock/\n");
        request.flow_id = Some(flow.id.clone());
        let _ = service.execute(request).await.unwrap();
        let _ = service.finish_flow(&flow.id).unwrap();

        let mut seqs = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            seqs.push(envelope.seq);
        }
        // executionStarted .. executionFinished plus flowFinished, all from
        // the flow counter (flowStarted was seq 1, before subscribing).
        let expected: Vec<u64> = (2..=u64::try_from(seqs.len()).unwrap() + 1).collect();
        assert_eq!(seqs, expected);
    }

    #[tokio::test]
    async fn engine_failure_surfaces_and_records_failed_execution() {
        let (_dir, service) = service_with(Arc::new(MockEngine::failing("fetch")));
        let flow = service.create_flow(CreateFlowRequest::default()).unwrap();

        let mut request = content_request("GET http://mock/\n");
        request.flow_id = Some(flow.id.clone());
        let err = service.execute(request).await.unwrap_err();
        assert_eq!(err.code(), "EXECUTE_ERROR");

        let summary = service.finish_flow(&flow.id).unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn update_variables_bumps_snapshot_and_emits() {
        let (_dir, service) = service_with(Arc::new(MockEngine::ok()));
        let session = service.create_session(None).unwrap();
        let (_, mut rx) = service.subscribe_events(EventFilter::default());

        let state = service
            .update_session_variables(
                &session.id,
                UpdateVariablesRequest {
                    variables: serde_json::json!({ "a": 1 }).as_object().cloned().unwrap(),
                    mode: MergeMode::Merge,
                },
            )
            .await
            .unwrap();
        assert_eq!(state.snapshot_version, 2);

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.event_type, EventType::SessionUpdated);
        assert_eq!(envelope.payload["variablesChanged"], true);
    }

    #[tokio::test]
    async fn execute_from_workspace_file() {
        let (_dir, service) = service_with(Arc::new(MockEngine::ok()));
        let mut request = ExecuteRequest::default();
        request.path = Some("api.http".to_string());
        let response = service.execute(request).await.unwrap();
        assert_eq!(response.paths.path.as_deref(), Some("api.http"));
        assert_eq!(response.response.status, 200);
    }
}
