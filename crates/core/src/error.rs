// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for treq.
//!
//! Every error that can cross the API boundary carries a stable `code` that
//! clients are allowed to match on, plus a human message. The HTTP status
//! mapping lives here too so the server and the SDKs agree on it.

use serde_json::Value;
use thiserror::Error;

/// The closed set of error kinds exposed by the service.
///
/// Kinds map 1:1 onto the stable wire codes returned in
/// `{"error":{"code",...}}` envelopes. Adding a variant here is a protocol
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PathOutsideWorkspace,
    SessionNotFound,
    SessionLimitReached,
    Validation,
    Parse,
    Execute,
    RequestNotFound,
    RequestIndexOutOfRange,
    NoRequestsFound,
    ContentOrPathRequired,
    FlowNotFound,
    FlowFinished,
    ExecutionNotFound,
    FileNotFound,
    WsSessionNotFound,
    WsSessionLimitReached,
    WsReplayGap,
    WsBinaryUnsupported,
    Unauthorized,
    ScopeViolation,
    Internal,
}

impl ErrorKind {
    /// Stable wire code for this kind.
    pub const fn code(self) -> &'static str {
        match self {
            Self::PathOutsideWorkspace => "PATH_OUTSIDE_WORKSPACE",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionLimitReached => "SESSION_LIMIT_REACHED",
            Self::Validation => "VALIDATION_ERROR",
            Self::Parse => "PARSE_ERROR",
            Self::Execute => "EXECUTE_ERROR",
            Self::RequestNotFound => "REQUEST_NOT_FOUND",
            Self::RequestIndexOutOfRange => "REQUEST_INDEX_OUT_OF_RANGE",
            Self::NoRequestsFound => "NO_REQUESTS_FOUND",
            Self::ContentOrPathRequired => "CONTENT_OR_PATH_REQUIRED",
            Self::FlowNotFound => "FLOW_NOT_FOUND",
            Self::FlowFinished => "FLOW_FINISHED",
            Self::ExecutionNotFound => "EXECUTION_NOT_FOUND",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::WsSessionNotFound => "WS_SESSION_NOT_FOUND",
            Self::WsSessionLimitReached => "WS_SESSION_LIMIT_REACHED",
            Self::WsReplayGap => "WS_REPLAY_GAP",
            Self::WsBinaryUnsupported => "WS_BINARY_UNSUPPORTED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::ScopeViolation => "SCOPE_VIOLATION",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// HTTP status this kind maps to.
    pub const fn http_status(self) -> u16 {
        match self {
            Self::SessionNotFound
            | Self::RequestNotFound
            | Self::FlowNotFound
            | Self::ExecutionNotFound
            | Self::FileNotFound
            | Self::WsSessionNotFound => 404,
            Self::PathOutsideWorkspace | Self::ScopeViolation => 403,
            Self::SessionLimitReached | Self::WsSessionLimitReached => 429,
            Self::Unauthorized => 401,
            Self::Internal => 500,
            // Validation and the remaining domain errors are caller mistakes.
            Self::Validation
            | Self::Parse
            | Self::Execute
            | Self::RequestIndexOutOfRange
            | Self::NoRequestsFound
            | Self::ContentOrPathRequired
            | Self::FlowFinished
            | Self::WsReplayGap
            | Self::WsBinaryUnsupported => 400,
        }
    }
}

/// Domain error carrying a stable code, a message, and optional structured
/// details surfaced to clients.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    details: Option<Value>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), details: None }
    }

    pub fn with_details(kind: ErrorKind, message: impl Into<String>, details: Value) -> Self {
        Self { kind, message: message.into(), details: Some(details) }
    }

    /// Shorthand for `VALIDATION_ERROR`, the most common caller mistake.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Wraps an engine or I/O failure as `EXECUTE_ERROR`, preserving the
    /// cause message.
    pub fn execute(stage: &str, cause: impl std::fmt::Display) -> Self {
        Self::with_details(
            ErrorKind::Execute,
            format!("{stage}: {cause}"),
            serde_json::json!({ "stage": stage }),
        )
    }

    pub fn internal(cause: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Internal, cause.to_string())
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub const fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }
}

/// Convenience type alias for Results using the treq [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorKind::PathOutsideWorkspace.code(), "PATH_OUTSIDE_WORKSPACE");
        assert_eq!(ErrorKind::WsReplayGap.code(), "WS_REPLAY_GAP");
        assert_eq!(ErrorKind::Internal.code(), "INTERNAL_ERROR");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ErrorKind::SessionNotFound.http_status(), 404);
        assert_eq!(ErrorKind::PathOutsideWorkspace.http_status(), 403);
        assert_eq!(ErrorKind::SessionLimitReached.http_status(), 429);
        assert_eq!(ErrorKind::WsSessionLimitReached.http_status(), 429);
        assert_eq!(ErrorKind::Parse.http_status(), 400);
        assert_eq!(ErrorKind::Unauthorized.http_status(), 401);
        assert_eq!(ErrorKind::Internal.http_status(), 500);
    }

    #[test]
    fn execute_wrapping_preserves_cause_and_stage() {
        let err = Error::execute("execute", "connection refused");
        assert_eq!(err.code(), "EXECUTE_ERROR");
        assert!(err.message().contains("connection refused"));
        assert_eq!(err.details().and_then(|d| d["stage"].as_str()), Some("execute"));
    }
}
