// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! In-memory event bus with per-run sequencing and bounded replay.
//!
//! Subscribers receive envelopes over unbounded channels; a subscriber whose
//! receiver is gone is silently dropped on the next emit. The replay ring
//! keeps the most recent envelopes so late subscribers can catch up with
//! `afterSeq`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use treq_api::{EventEnvelope, EventType};
use treq_core::id::now_millis;

/// Run-counter entries idle longer than this are eligible for GC.
const RUN_GC_AGE_MS: u64 = 5 * 60 * 1000;
/// GC only kicks in once this many runs are tracked.
const RUN_GC_THRESHOLD: usize = 100;
/// Fraction of emits that trigger a GC pass once over the threshold.
const RUN_GC_PROBABILITY: f64 = 0.01;

/// Subscription filter. An unset field matches any value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub session_id: Option<String>,
    pub flow_id: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        if let Some(session_id) = &self.session_id {
            if envelope.session_id.as_deref() != Some(session_id.as_str()) {
                return false;
            }
        }
        if let Some(flow_id) = &self.flow_id {
            if envelope.flow_id.as_deref() != Some(flow_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Everything `emit` needs to build an envelope.
#[derive(Debug, Clone)]
pub struct EmitParams {
    pub run_id: String,
    pub session_id: Option<String>,
    pub flow_id: Option<String>,
    pub req_exec_id: Option<String>,
    pub event_type: EventType,
    /// Producer-supplied sequence; the per-run counter assigns one if unset.
    pub seq: Option<u64>,
    pub payload: serde_json::Value,
}

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

struct RunCounter {
    next_seq: u64,
    last_used_ms: u64,
}

struct BusInner {
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber_id: u64,
    replay: VecDeque<EventEnvelope>,
    runs: HashMap<String, RunCounter>,
}

/// The shared event bus.
pub struct EventBus {
    inner: Mutex<BusInner>,
    replay_capacity: usize,
}

impl EventBus {
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
                replay: VecDeque::new(),
                runs: HashMap::new(),
            }),
            replay_capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Registers a subscriber and returns its id plus the delivery channel.
    /// The channel closing is how a subscriber "throws": it gets dropped on
    /// the next matching emit.
    pub fn subscribe(&self, filter: EventFilter) -> (u64, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        let _ = inner.subscribers.insert(id, Subscriber { filter, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        let _ = self.lock().subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Emits an event: assigns `seq`, appends to the replay ring, and
    /// dispatches to matching subscribers in registration order.
    pub fn emit(&self, params: EmitParams) -> EventEnvelope {
        let now = now_millis();
        let mut inner = self.lock();

        let seq = params.seq.unwrap_or_else(|| {
            let counter = inner
                .runs
                .entry(params.run_id.clone())
                .or_insert(RunCounter { next_seq: 1, last_used_ms: now });
            let seq = counter.next_seq;
            counter.next_seq += 1;
            counter.last_used_ms = now;
            seq
        });

        let envelope = EventEnvelope {
            event_type: params.event_type,
            ts: crate::session::rfc3339_millis(now),
            run_id: params.run_id,
            session_id: params.session_id,
            flow_id: params.flow_id,
            req_exec_id: params.req_exec_id,
            seq,
            payload: params.payload,
        };

        inner.replay.push_back(envelope.clone());
        while inner.replay.len() > self.replay_capacity {
            let _ = inner.replay.pop_front();
        }

        // Long-running processes accumulate run counters; shed stale ones
        // occasionally instead of on every emit.
        if inner.runs.len() > RUN_GC_THRESHOLD && rand::random::<f64>() < RUN_GC_PROBABILITY {
            inner.runs.retain(|_, counter| now.saturating_sub(counter.last_used_ms) < RUN_GC_AGE_MS);
        }

        // Dispatch outside the lock so a slow receiver cannot stall emits.
        let mut targets: Vec<(u64, mpsc::UnboundedSender<EventEnvelope>)> = inner
            .subscribers
            .iter()
            .filter(|(_, subscriber)| subscriber.filter.matches(&envelope))
            .map(|(id, subscriber)| (*id, subscriber.tx.clone()))
            .collect();
        targets.sort_by_key(|(id, _)| *id);
        drop(inner);

        let mut dead: Vec<u64> = Vec::new();
        for (id, tx) in targets {
            if tx.send(envelope.clone()).is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let mut inner = self.lock();
            for id in dead {
                let _ = inner.subscribers.remove(&id);
                debug!(subscriber_id = id, "Dropped dead event subscriber");
            }
        }

        envelope
    }

    /// Buffered envelopes with `seq > after_seq` matching the filter, in
    /// buffer order.
    pub fn replay(&self, filter: &EventFilter, after_seq: u64) -> Vec<EventEnvelope> {
        self.lock()
            .replay
            .iter()
            .filter(|envelope| envelope.seq > after_seq && filter.matches(envelope))
            .cloned()
            .collect()
    }

    /// Drops every subscriber; their receivers close immediately.
    pub fn close_all(&self) {
        self.lock().subscribers.clear();
    }
}
