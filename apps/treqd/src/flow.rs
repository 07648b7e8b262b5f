// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Flow tracker: groups executions for observer-style tracing.
//!
//! Execution records are immutable once attached. Flow-scoped events use a
//! flow-wide sequence (allocated here) so subscribers filtered by flow see a
//! gap-free stream across all of the flow's runs.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use indexmap::IndexMap;
use treq_api::{ExecutionRecord, ExecutionStatus, FlowSummary};
use treq_core::id::{self, now_millis};
use treq_core::{Error, ErrorKind, Result};

/// Execution record plus the numeric timing the summary needs.
#[derive(Debug, Clone)]
pub struct StoredExecution {
    pub record: ExecutionRecord,
    pub started_ms: u64,
    pub ended_ms: u64,
}

struct FlowInner {
    executions: IndexMap<String, StoredExecution>,
    finished: bool,
    summary: Option<FlowSummary>,
}

/// One correlation group of executions.
pub struct Flow {
    pub id: String,
    pub label: Option<String>,
    pub session_id: Option<String>,
    pub meta: Option<Value>,
    pub created_at_ms: u64,
    inner: Mutex<FlowInner>,
    next_seq: AtomicU64,
}

impl Flow {
    fn new(session_id: Option<String>, label: Option<String>, meta: Option<Value>) -> Self {
        Self {
            id: id::generate(),
            label,
            session_id,
            meta,
            created_at_ms: now_millis(),
            inner: Mutex::new(FlowInner {
                executions: IndexMap::new(),
                finished: false,
                summary: None,
            }),
            next_seq: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FlowInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Allocates the next flow-scoped event sequence number.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Attaches a completed execution. Rejected once the flow is finished.
    pub fn attach(&self, execution: StoredExecution) -> Result<()> {
        let mut inner = self.lock();
        if inner.finished {
            return Err(Error::new(
                ErrorKind::FlowFinished,
                format!("flow {} is finished; executions can no longer be attached", self.id),
            ));
        }
        let req_exec_id = execution.record.req_exec_id.clone();
        let _ = inner.executions.insert(req_exec_id.clone(), execution);
        drop(inner);
        debug!(flow_id = %self.id, req_exec_id = %req_exec_id, "Attached execution to flow");
        Ok(())
    }

    pub fn execution(&self, req_exec_id: &str) -> Result<ExecutionRecord> {
        self.lock().executions.get(req_exec_id).map(|stored| stored.record.clone()).ok_or_else(
            || {
                Error::new(
                    ErrorKind::ExecutionNotFound,
                    format!("execution {req_exec_id} not found in flow {}", self.id),
                )
            },
        )
    }

    pub fn execution_ids(&self) -> Vec<String> {
        self.lock().executions.keys().cloned().collect()
    }

    /// Finalizes the flow and computes its summary. `durationMs` spans the
    /// earliest start to the latest end of the attached executions.
    pub fn finish(&self) -> Result<FlowSummary> {
        let mut inner = self.lock();
        if inner.finished {
            return Err(Error::new(
                ErrorKind::FlowFinished,
                format!("flow {} is already finished", self.id),
            ));
        }

        let total = inner.executions.len();
        let succeeded = inner
            .executions
            .values()
            .filter(|stored| stored.record.status == ExecutionStatus::Success)
            .count();
        let failed = inner
            .executions
            .values()
            .filter(|stored| stored.record.status == ExecutionStatus::Failed)
            .count();
        let earliest = inner.executions.values().map(|stored| stored.started_ms).min();
        let latest = inner.executions.values().map(|stored| stored.ended_ms).max();
        let duration_ms = match (earliest, latest) {
            (Some(start), Some(end)) => end.saturating_sub(start),
            _ => 0,
        };

        let summary = FlowSummary { total, succeeded, failed, duration_ms };
        inner.finished = true;
        inner.summary = Some(summary);
        Ok(summary)
    }

    pub fn summary(&self) -> Option<FlowSummary> {
        self.lock().summary
    }
}

/// A thread-safe store of flows.
#[derive(Default)]
pub struct FlowStore {
    flows: Mutex<HashMap<String, Arc<Flow>>>,
}

impl FlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Flow>>> {
        self.flows.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn create(
        &self,
        session_id: Option<String>,
        label: Option<String>,
        meta: Option<Value>,
    ) -> Arc<Flow> {
        let flow = Arc::new(Flow::new(session_id, label, meta));
        let _ = self.lock().insert(flow.id.clone(), Arc::clone(&flow));
        flow
    }

    pub fn get(&self, id: &str) -> Option<Arc<Flow>> {
        self.lock().get(id).cloned()
    }

    pub fn get_or_err(&self, id: &str) -> Result<Arc<Flow>> {
        self.get(id)
            .ok_or_else(|| Error::new(ErrorKind::FlowNotFound, format!("flow {id} not found")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use treq_api::SourceDescriptor;

    fn stored(req_exec_id: &str, status: ExecutionStatus, start: u64, end: u64) -> StoredExecution {
        StoredExecution {
            record: ExecutionRecord {
                req_exec_id: req_exec_id.to_string(),
                label: None,
                source: SourceDescriptor::Content { request_name: None, request_index: Some(0) },
                method: "GET".to_string(),
                url: "http://x/".to_string(),
                request_headers: Vec::new(),
                response: None,
                timing: None,
                status,
                error: None,
                hooks: Vec::new(),
            },
            started_ms: start,
            ended_ms: end,
        }
    }

    #[test]
    fn summary_counts_and_span() {
        let store = FlowStore::new();
        let flow = store.create(None, Some("smoke".into()), None);
        flow.attach(stored("e1", ExecutionStatus::Success, 100, 150)).unwrap();
        flow.attach(stored("e2", ExecutionStatus::Failed, 120, 400)).unwrap();
        flow.attach(stored("e3", ExecutionStatus::Success, 90, 130)).unwrap();

        let summary = flow.finish().unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded + summary.failed, summary.total);
        assert_eq!(summary.duration_ms, 310);
    }

    #[test]
    fn attach_after_finish_is_rejected() {
        let flow = FlowStore::new().create(None, None, None);
        let _ = flow.finish().unwrap();
        let err = flow.attach(stored("e1", ExecutionStatus::Success, 0, 1)).unwrap_err();
        assert_eq!(err.code(), "FLOW_FINISHED");
    }

    #[test]
    fn double_finish_is_rejected() {
        let flow = FlowStore::new().create(None, None, None);
        let _ = flow.finish().unwrap();
        assert_eq!(flow.finish().unwrap_err().code(), "FLOW_FINISHED");
    }

    #[test]
    fn execution_lookup() {
        let flow = FlowStore::new().create(None, None, None);
        flow.attach(stored("e1", ExecutionStatus::Success, 0, 1)).unwrap();
        assert_eq!(flow.execution("e1").unwrap().req_exec_id, "e1");
        assert_eq!(flow.execution("nope").unwrap_err().code(), "EXECUTION_NOT_FOUND");
    }

    #[test]
    fn flow_seq_is_gap_free() {
        let flow = FlowStore::new().create(None, None, None);
        assert_eq!((flow.next_seq(), flow.next_seq(), flow.next_seq()), (1, 2, 3));
    }

    #[test]
    fn empty_flow_summary_is_zeroed() {
        let flow = FlowStore::new().create(None, None, None);
        let summary = flow.finish().unwrap();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.duration_ms, 0);
    }
}
