// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Event stream assembly shared by the SSE and WS event endpoints.
//!
//! A stream opens with a `connected` control frame, replays buffered
//! envelopes past `afterSeq`, then interleaves live envelopes with 30 s
//! `heartbeat` control frames. Control frames carry no `seq`; consumers
//! must tolerate them between envelopes.

use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use treq_api::EventEnvelope;

use crate::events::EventFilter;
use crate::service::Service;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// One frame on an event stream: either a control message or an envelope.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Connected(serde_json::Value),
    Heartbeat(serde_json::Value),
    Envelope(EventEnvelope),
}

impl StreamFrame {
    /// SSE `event:` field / WS `type` value.
    pub fn event_name(&self) -> &str {
        match self {
            Self::Connected(_) => "connected",
            Self::Heartbeat(_) => "heartbeat",
            Self::Envelope(envelope) => envelope.event_type.as_str(),
        }
    }
}

fn envelope_key(envelope: &EventEnvelope) -> (String, u64) {
    (envelope.run_id.clone(), envelope.seq)
}

/// Subscribes to the bus and returns a channel of stream frames. The
/// feeder task unsubscribes deterministically when the receiver is
/// dropped (client disconnect) or the bus closes.
pub fn open_event_stream(
    service: &Service,
    filter: EventFilter,
    after_seq: Option<u64>,
) -> mpsc::UnboundedReceiver<StreamFrame> {
    let bus = service.bus();
    let (subscriber_id, mut events) = bus.subscribe(filter.clone());
    // Snapshot the replay after subscribing so nothing is lost in between;
    // envelopes that land in both are deduplicated below.
    let replayed = after_seq.map(|after| bus.replay(&filter, after)).unwrap_or_default();
    let mut seen: HashSet<(String, u64)> = replayed.iter().map(envelope_key).collect();

    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tokio::spawn(async move {
        let connected = StreamFrame::Connected(serde_json::json!({
            "ts": crate::session::rfc3339_now(),
            "afterSeq": after_seq,
        }));
        if tx.send(connected).is_err() {
            bus.unsubscribe(subscriber_id);
            return;
        }
        for envelope in replayed {
            if tx.send(StreamFrame::Envelope(envelope)).is_err() {
                bus.unsubscribe(subscriber_id);
                return;
            }
        }

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_envelope = events.recv() => {
                    let Some(envelope) = maybe_envelope else { break };
                    // Drop the duplicate if the envelope was already replayed.
                    if seen.remove(&envelope_key(&envelope)) {
                        continue;
                    }
                    if tx.send(StreamFrame::Envelope(envelope)).is_err() {
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    let frame = StreamFrame::Heartbeat(serde_json::json!({
                        "ts": crate::session::rfc3339_now(),
                    }));
                    if tx.send(frame).is_err() {
                        break;
                    }
                },
            }
        }

        bus.unsubscribe(subscriber_id);
        debug!(subscriber_id, "Event stream feeder ended");
    });

    rx
}
