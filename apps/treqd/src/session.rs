// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Execution sessions: a server-held bag of variables plus a cookie jar.
//!
//! Invariant: at most one execution or variable update is in flight per
//! session. The per-session lock is a fair tokio mutex, so queued
//! operations run in arrival order — an in-flight execute always completes
//! before a queued variable update is applied.

use opentelemetry::global;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use time::format_description::well_known::Rfc3339;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, info};

use treq_api::{MergeMode, SessionDescriptor, SessionStateResponse};
use treq_core::id::{self, now_millis};
use treq_core::redact;
use treq_core::{Error, ErrorKind, Result};
use treq_engine::{CookieStore, MemoryCookieJar};

/// Convert epoch milliseconds to an RFC3339 string for the wire.
pub fn rfc3339_millis(ms: u64) -> String {
    i128::from(ms)
        .checked_mul(1_000_000)
        .and_then(|nanos| time::OffsetDateTime::from_unix_timestamp_nanos(nanos).ok())
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string())
}

/// Current time as an RFC3339 string.
pub fn rfc3339_now() -> String {
    rfc3339_millis(now_millis())
}

/// One execution session.
pub struct Session {
    pub id: String,
    created_at_ms: u64,
    variables: Mutex<Map<String, Value>>,
    jar: Arc<MemoryCookieJar>,
    op_lock: AsyncMutex<()>,
    last_used_at: AtomicU64,
    snapshot_version: AtomicU64,
}

impl Session {
    fn new(initial_variables: Option<Map<String, Value>>) -> Self {
        let now = now_millis();
        Self {
            id: id::generate(),
            created_at_ms: now,
            variables: Mutex::new(initial_variables.unwrap_or_default()),
            jar: Arc::new(MemoryCookieJar::new()),
            op_lock: AsyncMutex::new(()),
            last_used_at: AtomicU64::new(now),
            snapshot_version: AtomicU64::new(1),
        }
    }

    /// Serializes executes and variable updates on this session (FIFO).
    pub async fn lock_ops(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }

    /// Bumps `lastUsedAt` monotonically: same-millisecond touches still
    /// produce a strictly increasing timeline.
    pub fn touch(&self) -> u64 {
        let now = now_millis();
        let mut current = self.last_used_at.load(Ordering::Relaxed);
        loop {
            let next = now.max(current + 1);
            match self.last_used_at.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn last_used_at(&self) -> u64 {
        self.last_used_at.load(Ordering::Relaxed)
    }

    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version.load(Ordering::Relaxed)
    }

    /// Increments `snapshotVersion` and returns the new value. Called for
    /// every observer-visible mutation of variables or cookies.
    pub fn bump_snapshot(&self) -> u64 {
        self.snapshot_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn variables(&self) -> Map<String, Value> {
        self.variables.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Applies a variable update. Merge keeps unrelated keys; replace leaves
    /// only the provided ones.
    pub fn apply_variables(&self, update: Map<String, Value>, mode: MergeMode) {
        let mut variables =
            self.variables.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match mode {
            MergeMode::Merge => variables.extend(update),
            MergeMode::Replace => *variables = update,
        }
    }

    pub fn cookies(&self) -> Arc<MemoryCookieJar> {
        Arc::clone(&self.jar)
    }

    pub fn cookie_count(&self) -> usize {
        self.jar.cookie_count()
    }

    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            id: self.id.clone(),
            snapshot_version: self.snapshot_version(),
            cookie_count: self.cookie_count(),
        }
    }

    /// Client-facing state with sensitive variable values redacted.
    pub fn state_response(&self) -> SessionStateResponse {
        let mut variables = Value::Object(self.variables());
        redact::redact_in_place(&mut variables);
        SessionStateResponse {
            session_id: self.id.clone(),
            variables,
            cookie_count: self.cookie_count(),
            created_at: rfc3339_millis(self.created_at_ms),
            last_used_at: self.last_used_at(),
            snapshot_version: self.snapshot_version(),
        }
    }
}

/// A thread-safe store for all live sessions.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    max_sessions: usize,
    ttl_ms: u64,
    // Metrics
    sessions_active_gauge: opentelemetry::metrics::Gauge<u64>,
    sessions_created_counter: opentelemetry::metrics::Counter<u64>,
    sessions_evicted_counter: opentelemetry::metrics::Counter<u64>,
    sessions_expired_counter: opentelemetry::metrics::Counter<u64>,
}

impl SessionStore {
    pub fn new(max_sessions: usize, ttl_ms: u64) -> Self {
        let meter = global::meter("treqd_sessions");
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
            ttl_ms,
            sessions_active_gauge: meter
                .u64_gauge("sessions.active")
                .with_description("Number of live sessions")
                .build(),
            sessions_created_counter: meter
                .u64_counter("sessions.created")
                .with_description("Total number of sessions created")
                .build(),
            sessions_evicted_counter: meter
                .u64_counter("sessions.evicted")
                .with_description("Sessions evicted by the LRU cap")
                .build(),
            sessions_expired_counter: meter
                .u64_counter("sessions.expired")
                .with_description("Sessions removed by the TTL sweeper")
                .build(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Creates a session, evicting the least-recently-used one when the
    /// store is at capacity.
    pub fn create(&self, initial_variables: Option<Map<String, Value>>) -> Result<Arc<Session>> {
        let session = Arc::new(Session::new(initial_variables));
        let mut sessions = self.lock();

        if self.max_sessions == 0 {
            return Err(Error::new(ErrorKind::SessionLimitReached, "session store is disabled"));
        }
        while sessions.len() >= self.max_sessions {
            let Some(victim_id) = sessions
                .values()
                .min_by_key(|candidate| candidate.last_used_at())
                .map(|candidate| candidate.id.clone())
            else {
                break;
            };
            let _ = sessions.remove(&victim_id);
            self.sessions_evicted_counter.add(1, &[]);
            info!(session_id = %victim_id, "Evicted least-recently-used session");
        }

        let _ = sessions.insert(session.id.clone(), Arc::clone(&session));
        self.sessions_created_counter.add(1, &[]);
        self.sessions_active_gauge.record(sessions.len() as u64, &[]);
        drop(sessions);

        debug!(session_id = %session.id, "Created session");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().get(id).cloned()
    }

    pub fn get_or_err(&self, id: &str) -> Result<Arc<Session>> {
        self.get(id)
            .ok_or_else(|| Error::new(ErrorKind::SessionNotFound, format!("session {id} not found")))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.lock();
        let removed = sessions.remove(id);
        self.sessions_active_gauge.record(sessions.len() as u64, &[]);
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes sessions idle past the TTL. Returns the removed ids.
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = now_millis();
        let mut sessions = self.lock();
        let expired: Vec<String> = sessions
            .values()
            .filter(|session| now.saturating_sub(session.last_used_at()) > self.ttl_ms)
            .map(|session| session.id.clone())
            .collect();
        for id in &expired {
            let _ = sessions.remove(id);
            self.sessions_expired_counter.add(1, &[]);
        }
        self.sessions_active_gauge.record(sessions.len() as u64, &[]);
        drop(sessions);

        if !expired.is_empty() {
            info!(count = expired.len(), "Swept expired sessions");
        }
        expired
    }
}
