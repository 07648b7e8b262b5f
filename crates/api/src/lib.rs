// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! treq-api: the wire contract of the treq service.
//!
//! Everything in this crate serializes as camelCase JSON and is shared by
//! the server, the SDK clients, and the test tooling. Breaking a shape here
//! is a protocol change.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// Re-export the diagnostics wire types so clients depend on one crate.
pub use treq_core::HookRecord;
pub use treq_parser::{Diagnostic, DiagnosticCode, Severity};

// --- Event envelopes ---

/// The closed set of event types carried by [`EventEnvelope`].
///
/// `connected` and `heartbeat` are SSE/WS control frames: they are emitted
/// outside the bus and carry no `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    Connected,
    Heartbeat,
    ParseStarted,
    ParseFinished,
    InterpolateStarted,
    InterpolateFinished,
    CompileStarted,
    CompileFinished,
    FetchStarted,
    FetchFinished,
    ExecutionStarted,
    ExecutionFinished,
    SessionUpdated,
    FlowStarted,
    FlowFinished,
    Error,
}

impl EventType {
    /// Wire name, also used for the SSE `event:` field.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Heartbeat => "heartbeat",
            Self::ParseStarted => "parseStarted",
            Self::ParseFinished => "parseFinished",
            Self::InterpolateStarted => "interpolateStarted",
            Self::InterpolateFinished => "interpolateFinished",
            Self::CompileStarted => "compileStarted",
            Self::CompileFinished => "compileFinished",
            Self::FetchStarted => "fetchStarted",
            Self::FetchFinished => "fetchFinished",
            Self::ExecutionStarted => "executionStarted",
            Self::ExecutionFinished => "executionFinished",
            Self::SessionUpdated => "sessionUpdated",
            Self::FlowStarted => "flowStarted",
            Self::FlowFinished => "flowFinished",
            Self::Error => "error",
        }
    }
}

/// Outer record for every bus event.
///
/// `seq` is monotonic and unique per `runId`; flow-scoped producers supply
/// their own flow-wide sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// RFC3339 emission timestamp.
    pub ts: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_exec_id: Option<String>,
    pub seq: u64,
    /// The original event fields.
    pub payload: Value,
}

// --- Error body ---

/// `{"error":{"code","message","details"?}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&treq_core::Error> for ErrorBody {
    fn from(err: &treq_core::Error) -> Self {
        Self {
            error: ErrorDetail {
                code: err.code().to_string(),
                message: err.message().to_string(),
                details: err.details().cloned(),
            },
        }
    }
}

// --- Body pipeline descriptors ---

/// Whether any body bytes were collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyMode {
    None,
    Buffered,
}

/// Encoding of the `body` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyEncoding {
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

/// Collected response body with truncation accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyDescriptor {
    pub body_mode: BodyMode,
    pub encoding: BodyEncoding,
    pub body: String,
    pub body_bytes: usize,
    pub truncated: bool,
}

// --- Execute ---

/// Variable update semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    #[default]
    Merge,
    Replace,
}

/// Body of `POST /execute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    /// Literal `.http` content. Exactly one of `content`/`path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Workspace-relative `.http` file path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Select the request by `# @name`; exclusive with `requestIndex`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_label: Option<String>,
    /// Request-level variables; win over session variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
    /// 100 – 300 000 ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Workspace-relative base for `< file` body references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_redirects: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_ssl: Option<bool>,
}

/// Identity of the request that was selected for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestIdentity {
    pub method: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub index: usize,
}

/// Resolved filesystem paths of the execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPaths {
    pub workspace_root: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
}

/// Session summary embedded in responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub id: String,
    pub snapshot_version: u64,
    pub cookie_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseInfo {
    pub status: u16,
    /// Lower-cased header names in arrival order; `set-cookie` repeats.
    pub headers: Vec<(String, String)>,
    #[serde(flatten)]
    pub body: BodyDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfb_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    pub max_body_bytes: usize,
}

/// Envelope returned by `POST /execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_exec_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionDescriptor>,
    pub request: RequestIdentity,
    pub paths: ResolvedPaths,
    pub response: ResponseInfo,
    pub limits: Limits,
    pub timing: Timing,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookRecord>,
}

// --- Sessions ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
}

/// Redacted session state returned by `GET /session/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStateResponse {
    pub session_id: String,
    /// Variables with sensitive values replaced by `"[REDACTED]"`.
    pub variables: Value,
    pub cookie_count: usize,
    pub created_at: String,
    pub last_used_at: u64,
    pub snapshot_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateVariablesRequest {
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub mode: MergeMode,
}

// --- Flows ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlowRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlowResponse {
    pub flow_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishFlowResponse {
    pub flow_id: String,
    pub summary: FlowSummary,
}

/// Execution lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// Where the executed request came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SourceDescriptor {
    File {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_index: Option<usize>,
    },
    Content {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_index: Option<usize>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    pub stage: String,
    pub message: String,
}

/// Immutable per-execution record kept by the flow tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub req_exec_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub source: SourceDescriptor,
    pub method: String,
    pub url: String,
    /// Outgoing headers after interpolation.
    pub request_headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<Timing>,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookRecord>,
}

// --- Parse & workspace ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub include_diagnostics: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedRequestInfo {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub method: String,
    pub url: String,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseResponse {
    pub requests: Vec<ParsedRequestInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Vec<Diagnostic>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceFile {
    /// Workspace-relative path using `/` separators.
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceFilesResponse {
    pub files: Vec<WorkspaceFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRequestsResponse {
    pub path: String,
    pub requests: Vec<ParsedRequestInfo>,
}

// --- WS sessions ---

/// Envelope types on a proxied WebSocket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WsEnvelopeType {
    #[serde(rename = "session.opened")]
    Opened,
    #[serde(rename = "session.inbound")]
    Inbound,
    #[serde(rename = "session.outbound")]
    Outbound,
    #[serde(rename = "session.closed")]
    Closed,
    #[serde(rename = "session.error")]
    Error,
    #[serde(rename = "session.replay.end")]
    ReplayEnd,
}

/// One frame on the client side of a WS session, `seq`-ordered per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub envelope_type: WsEnvelopeType,
    pub ws_session_id: String,
    pub seq: u64,
    pub ts: String,
    pub payload: Value,
}

/// Body of `POST /execute/ws`: selects a `ws://`/`wss://` request the same
/// way `POST /execute` selects an HTTP one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenWsSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subprotocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_buffer_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenWsSessionResponse {
    pub ws_session_id: String,
    /// Resolved upstream URL.
    pub url: String,
    pub last_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subprotocol: Option<String>,
}

// --- Auth ---

/// Decoded script-token payload. On the wire:
/// `script.<base64url(payload)>.<base64url(hmac-sha256)>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptTokenPayload {
    pub jti: String,
    pub flow_id: String,
    pub session_id: String,
    pub created_at: u64,
    pub expires_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub token: String,
}

// --- Scripts ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunScriptRequest {
    /// One of the whitelisted runners (`node`, `npm`, `npx`, `deno`, `bun`).
    pub runner: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    /// 100 – 300 000 ms, applied to the whole child process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunScriptResponse {
    pub exit_code: i32,
    pub session_id: String,
    pub flow_id: String,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
}

// --- Imports ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    /// A cURL command line or a Postman collection JSON document.
    pub content: String,
    /// Workspace-relative target for `apply`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    /// Apply even when error-severity diagnostics exist.
    #[serde(default)]
    pub force: bool,
}

/// Per-item importer finding. Unlike analyzer [`Diagnostic`]s these have no
/// source range — they refer to items of the foreign format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportDiagnostic {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportPreviewResponse {
    /// Generated `.http` content.
    pub content: String,
    pub imported: usize,
    pub skipped: usize,
    pub diagnostics: Vec<ImportDiagnostic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportApplyResponse {
    pub path: String,
    pub imported: usize,
    pub skipped: usize,
    pub diagnostics: Vec<ImportDiagnostic>,
}

// --- Meta ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
}

/// Feature advertisement for clients (`GET /capabilities`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub protocol: String,
    pub version: String,
    pub features: CapabilityFeatures,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityFeatures {
    /// Response bodies are buffered up to `maxBodyBytes`, never streamed.
    pub streaming_bodies: bool,
    pub sse: bool,
    pub ws_proxy: bool,
    pub importers: bool,
    pub scripts: bool,
    /// SSE/WS event streams may interleave `connected`/`heartbeat` control
    /// frames that carry no `seq`.
    pub control_frames: bool,
}
