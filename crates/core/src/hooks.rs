// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Execution hook interface.
//!
//! Hooks observe and decorate request execution at fixed points. They are
//! injected at service construction; a failing hook is recorded on the
//! execution but never fails the surrounding execute.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

/// Named points in the execution lifecycle a hook can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    Setup,
    RequestBefore,
    ResponseAfter,
    Validate,
    Teardown,
}

impl HookPoint {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::RequestBefore => "request.before",
            Self::ResponseAfter => "response.after",
            Self::Validate => "validate",
            Self::Teardown => "teardown",
        }
    }
}

/// Context shared with every hook invocation.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub run_id: String,
    pub session_id: Option<String>,
    pub flow_id: Option<String>,
    pub label: Option<String>,
}

/// Outcome of a single hook invocation, recorded on the execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HookRecord {
    pub hook: String,
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl HookRecord {
    /// Builds a record from a hook result, timing it against `started`.
    pub fn capture(
        point: HookPoint,
        name: &str,
        started: Instant,
        result: std::result::Result<bool, String>,
    ) -> Self {
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match result {
            Ok(passed) => {
                Self { hook: point.as_str().to_string(), name: name.to_string(), passed, error: None, duration_ms }
            },
            Err(error) => Self {
                hook: point.as_str().to_string(),
                name: name.to_string(),
                passed: false,
                error: Some(error),
                duration_ms,
            },
        }
    }
}

/// A plugin hook observing request execution.
///
/// All methods default to no-ops so implementations only override the
/// points they care about. Errors are plain strings; they end up in the
/// execution's hook records verbatim.
#[async_trait]
pub trait ExecutionHook: Send + Sync {
    /// Stable hook name used in records and reports.
    fn name(&self) -> &str;

    /// Runs once before the request is handed to the engine.
    async fn setup(&self, cx: &HookContext) -> std::result::Result<(), String> {
        let _ = cx;
        Ok(())
    }

    /// May inspect (not rewrite) the outgoing request descriptor.
    async fn request_before(
        &self,
        cx: &HookContext,
        request: &Value,
    ) -> std::result::Result<(), String> {
        let _ = (cx, request);
        Ok(())
    }

    /// Observes the response descriptor after the body pipeline ran.
    async fn response_after(
        &self,
        cx: &HookContext,
        response: &Value,
    ) -> std::result::Result<(), String> {
        let _ = (cx, response);
        Ok(())
    }

    /// Judges the response; `Ok(false)` marks the hook as not passed
    /// without being an error.
    async fn validate(&self, cx: &HookContext, response: &Value) -> std::result::Result<bool, String> {
        let _ = (cx, response);
        Ok(true)
    }

    /// Runs after the execution record is complete.
    async fn teardown(&self, cx: &HookContext) -> std::result::Result<(), String> {
        let _ = cx;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_records_failures_without_panicking() {
        let record = HookRecord::capture(
            HookPoint::Validate,
            "assert-status",
            Instant::now(),
            Err("status was 500".to_string()),
        );
        assert_eq!(record.hook, "validate");
        assert!(!record.passed);
        assert_eq!(record.error.as_deref(), Some("status was 500"));
    }

    #[test]
    fn capture_records_validate_verdict() {
        let record =
            HookRecord::capture(HookPoint::Validate, "assert-status", Instant::now(), Ok(false));
        assert!(!record.passed);
        assert!(record.error.is_none());
    }
}
