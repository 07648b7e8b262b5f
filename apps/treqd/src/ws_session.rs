// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Proxied WebSocket sessions.
//!
//! Each WS-session owns one upstream socket and a bounded ring of recent
//! envelopes. Envelope `seq` is strictly increasing per session and follows
//! upstream arrival order; clients that reconnect replay with `afterSeq`.
//! Binary frames are answered with a `session.error` envelope — the session
//! itself survives them.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use opentelemetry::global;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use treq_api::{WsEnvelope, WsEnvelopeType};
use treq_core::id::{self, now_millis};
use treq_core::{Error, ErrorKind, Result};

use crate::session::rfc3339_millis;

/// Close code sent when the session cap rejects a new upstream.
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
/// Close code used by the idle sweeper and server shutdown.
const CLOSE_GOING_AWAY: u16 = 1001;

/// The upstream side of a WS-session, behind a trait so tests can fake it.
#[async_trait]
pub trait UpstreamSocket: Send {
    async fn send_text(&mut self, text: String) -> std::result::Result<(), String>;
    async fn close(&mut self, code: u16, reason: String) -> std::result::Result<(), String>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Real upstream backed by tokio-tungstenite.
pub struct TungsteniteUpstream {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl UpstreamSocket for TungsteniteUpstream {
    async fn send_text(&mut self, text: String) -> std::result::Result<(), String> {
        self.sink.send(Message::Text(text.into())).await.map_err(|e| e.to_string())
    }

    async fn close(&mut self, code: u16, reason: String) -> std::result::Result<(), String> {
        let frame = CloseFrame { code: CloseCode::from(code), reason: reason.into() };
        let _ = self.sink.send(Message::Close(Some(frame))).await;
        self.sink.close().await.map_err(|e| e.to_string())
    }
}

/// Connects to an upstream `ws://`/`wss://` URL, returning the writable
/// half plus the frame stream the caller must pump.
///
/// # Errors
///
/// Returns `EXECUTE_ERROR` (stage `ws-connect`) when the handshake fails.
pub async fn connect_upstream(
    url: &str,
) -> Result<(Box<dyn UpstreamSocket>, SplitStream<WsStream>)> {
    let (stream, _response) =
        connect_async(url).await.map_err(|e| Error::execute("ws-connect", e))?;
    let (sink, reader) = stream.split();
    Ok((Box::new(TungsteniteUpstream { sink }), reader))
}

struct WsInner {
    buffer: VecDeque<WsEnvelope>,
    last_seq: u64,
    client: Option<mpsc::UnboundedSender<WsEnvelope>>,
}

/// One proxied session.
pub struct WsSession {
    pub id: String,
    pub upstream_url: String,
    pub subprotocol: Option<String>,
    pub flow_id: Option<String>,
    pub req_exec_id: Option<String>,
    pub replay_buffer_size: usize,
    pub idle_timeout_ms: u64,
    upstream: AsyncMutex<Box<dyn UpstreamSocket>>,
    inner: Mutex<WsInner>,
    last_activity_ms: AtomicU64,
}

impl std::fmt::Debug for WsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSession")
            .field("id", &self.id)
            .field("upstream_url", &self.upstream_url)
            .field("subprotocol", &self.subprotocol)
            .field("flow_id", &self.flow_id)
            .field("req_exec_id", &self.req_exec_id)
            .field("replay_buffer_size", &self.replay_buffer_size)
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .finish_non_exhaustive()
    }
}

impl WsSession {
    fn lock(&self) -> std::sync::MutexGuard<'_, WsInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn touch(&self) {
        self.last_activity_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn last_seq(&self) -> u64 {
        self.lock().last_seq
    }

    fn envelope(&self, seq: u64, envelope_type: WsEnvelopeType, payload: Value) -> WsEnvelope {
        WsEnvelope {
            envelope_type,
            ws_session_id: self.id.clone(),
            seq,
            ts: rfc3339_millis(now_millis()),
            payload,
        }
    }

    /// Allocates the next seq, buffers the envelope, and delivers it to the
    /// attached client (if any).
    fn emit(&self, envelope_type: WsEnvelopeType, payload: Value) -> WsEnvelope {
        self.touch();
        let mut inner = self.lock();
        inner.last_seq += 1;
        let envelope = self.envelope(inner.last_seq, envelope_type, payload);

        inner.buffer.push_back(envelope.clone());
        while inner.buffer.len() > self.replay_buffer_size {
            let _ = inner.buffer.pop_front();
        }

        let delivery_failed =
            inner.client.as_ref().is_some_and(|client| client.send(envelope.clone()).is_err());
        if delivery_failed {
            inner.client = None;
        }
        envelope
    }

    /// Allocates a seq without buffering — used for per-call synthetic
    /// envelopes (`session.replay.end`, replay-gap errors).
    fn emit_transient(&self, envelope_type: WsEnvelopeType, payload: Value) -> WsEnvelope {
        let mut inner = self.lock();
        inner.last_seq += 1;
        self.envelope(inner.last_seq, envelope_type, payload)
    }

    /// Attaches (or replaces) the client-facing delivery channel.
    pub fn attach_client(&self, tx: mpsc::UnboundedSender<WsEnvelope>) {
        self.lock().client = Some(tx);
    }

    pub fn detach_client(&self) {
        self.lock().client = None;
    }
}

struct WsMetrics {
    active_gauge: opentelemetry::metrics::Gauge<u64>,
    opened_counter: opentelemetry::metrics::Counter<u64>,
    closed_counter: opentelemetry::metrics::Counter<u64>,
    frames_counter: opentelemetry::metrics::Counter<u64>,
}

/// Parameters for [`WsSessionManager::open`].
pub struct OpenParams {
    pub upstream: Box<dyn UpstreamSocket>,
    pub upstream_url: String,
    pub subprotocol: Option<String>,
    pub flow_id: Option<String>,
    pub req_exec_id: Option<String>,
    pub replay_buffer_size: Option<usize>,
    pub idle_timeout_ms: Option<u64>,
}

/// Registry of live WS-sessions with caps and idle sweeping.
pub struct WsSessionManager {
    sessions: Mutex<HashMap<String, Arc<WsSession>>>,
    max_sessions: usize,
    default_replay_buffer_size: usize,
    default_idle_timeout_ms: u64,
    metrics: WsMetrics,
}

impl WsSessionManager {
    pub fn new(max_sessions: usize, replay_buffer_size: usize, idle_timeout_ms: u64) -> Self {
        let meter = global::meter("treqd_ws_sessions");
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
            default_replay_buffer_size: replay_buffer_size.max(1),
            default_idle_timeout_ms: idle_timeout_ms,
            metrics: WsMetrics {
                active_gauge: meter
                    .u64_gauge("ws_sessions.active")
                    .with_description("Number of live proxied WebSocket sessions")
                    .build(),
                opened_counter: meter
                    .u64_counter("ws_sessions.opened")
                    .with_description("Total WS sessions opened")
                    .build(),
                closed_counter: meter
                    .u64_counter("ws_sessions.closed")
                    .with_description("Total WS sessions closed")
                    .build(),
                frames_counter: meter
                    .u64_counter("ws_sessions.frames")
                    .with_description("Frames proxied through WS sessions")
                    .build(),
            },
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<WsSession>>> {
        self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Result<Arc<WsSession>> {
        self.lock().get(id).cloned().ok_or_else(|| {
            Error::new(ErrorKind::WsSessionNotFound, format!("WS session {id} not found"))
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Registers a session and emits its `session.opened` envelope
    /// (`lastSeq = 1`). At the cap, the new upstream is closed with 1013.
    pub async fn open(&self, params: OpenParams) -> Result<(Arc<WsSession>, WsEnvelope)> {
        let mut upstream = params.upstream;
        if self.lock().len() >= self.max_sessions {
            let _ = upstream.close(CLOSE_TRY_AGAIN_LATER, "session limit reached".into()).await;
            return Err(Error::new(
                ErrorKind::WsSessionLimitReached,
                format!("WS session limit ({}) reached", self.max_sessions),
            ));
        }

        let session = Arc::new(WsSession {
            id: id::generate(),
            upstream_url: params.upstream_url,
            subprotocol: params.subprotocol,
            flow_id: params.flow_id,
            req_exec_id: params.req_exec_id,
            replay_buffer_size: params
                .replay_buffer_size
                .unwrap_or(self.default_replay_buffer_size)
                .max(1),
            idle_timeout_ms: params.idle_timeout_ms.unwrap_or(self.default_idle_timeout_ms),
            upstream: AsyncMutex::new(upstream),
            inner: Mutex::new(WsInner { buffer: VecDeque::new(), last_seq: 0, client: None }),
            last_activity_ms: AtomicU64::new(now_millis()),
        });

        let opened = session.emit(
            WsEnvelopeType::Opened,
            serde_json::json!({
                "upstreamUrl": session.upstream_url,
                "subprotocol": session.subprotocol,
                "replayBufferSize": session.replay_buffer_size,
                "idleTimeoutMs": session.idle_timeout_ms,
            }),
        );

        let mut sessions = self.lock();
        let _ = sessions.insert(session.id.clone(), Arc::clone(&session));
        self.metrics.opened_counter.add(1, &[]);
        self.metrics.active_gauge.record(sessions.len() as u64, &[]);
        drop(sessions);

        info!(ws_session_id = %session.id, upstream = %session.upstream_url, "WS session opened");
        Ok((session, opened))
    }

    /// Forwards a client text frame to the upstream and emits
    /// `session.outbound`. Upstream failures become `session.error`
    /// envelopes without tearing the session down.
    pub async fn send(&self, id: &str, text: String) -> Result<()> {
        let session = self.get(id)?;
        self.metrics.frames_counter.add(1, &[opentelemetry::KeyValue::new("direction", "outbound")]);

        let send_result = {
            let mut upstream = session.upstream.lock().await;
            upstream.send_text(text.clone()).await
        };
        match send_result {
            Ok(()) => {
                let _ = session
                    .emit(WsEnvelopeType::Outbound, serde_json::json!({ "text": text }));
            },
            Err(message) => {
                warn!(ws_session_id = %id, error = %message, "Upstream send failed");
                let _ = session.emit(
                    WsEnvelopeType::Error,
                    serde_json::json!({ "code": "WS_UPSTREAM_ERROR", "message": message }),
                );
            },
        }
        Ok(())
    }

    /// Records a text frame that arrived from the upstream.
    pub fn record_inbound(&self, id: &str, text: &str) -> Result<WsEnvelope> {
        let session = self.get(id)?;
        self.metrics.frames_counter.add(1, &[opentelemetry::KeyValue::new("direction", "inbound")]);
        Ok(session.emit(WsEnvelopeType::Inbound, serde_json::json!({ "text": text })))
    }

    /// Binary frames are unsupported in either direction; the session is
    /// not torn down.
    pub fn record_binary(&self, id: &str, direction: &str) -> Result<WsEnvelope> {
        let session = self.get(id)?;
        Ok(session.emit(
            WsEnvelopeType::Error,
            serde_json::json!({ "code": "WS_BINARY_UNSUPPORTED", "direction": direction }),
        ))
    }

    /// Buffered envelopes with `seq > after_seq`, terminated by
    /// `session.replay.end`. If `after_seq` predates the oldest buffered
    /// envelope, a single `WS_REPLAY_GAP` error replaces the replay.
    pub fn replay(&self, id: &str, after_seq: u64) -> Result<Vec<WsEnvelope>> {
        let session = self.get(id)?;

        let (mut envelopes, gap) = {
            let inner = session.lock();
            match inner.buffer.front() {
                Some(oldest) if after_seq + 1 < oldest.seq => (Vec::new(), true),
                _ => (
                    inner
                        .buffer
                        .iter()
                        .filter(|envelope| envelope.seq > after_seq)
                        .cloned()
                        .collect::<Vec<_>>(),
                    false,
                ),
            }
        };

        if gap {
            envelopes.push(session.emit_transient(
                WsEnvelopeType::Error,
                serde_json::json!({
                    "code": "WS_REPLAY_GAP",
                    "message": format!("afterSeq {after_seq} is older than the replay buffer"),
                }),
            ));
        }
        let count = if gap { 0 } else { envelopes.len() };
        envelopes.push(session.emit_transient(
            WsEnvelopeType::ReplayEnd,
            serde_json::json!({ "afterSeq": after_seq, "count": count }),
        ));
        Ok(envelopes)
    }

    /// Closes the upstream, emits `session.closed`, and removes the entry.
    pub async fn close(&self, id: &str, code: u16, reason: &str, was_clean: bool) -> Result<()> {
        let session = {
            let mut sessions = self.lock();
            let session = sessions.remove(id).ok_or_else(|| {
                Error::new(ErrorKind::WsSessionNotFound, format!("WS session {id} not found"))
            })?;
            self.metrics.closed_counter.add(1, &[]);
            self.metrics.active_gauge.record(sessions.len() as u64, &[]);
            session
        };

        let _ = session.emit(
            WsEnvelopeType::Closed,
            serde_json::json!({ "code": code, "reason": reason, "wasClean": was_clean }),
        );
        let close_result = {
            let mut upstream = session.upstream.lock().await;
            upstream.close(code, reason.to_string()).await
        };
        if let Err(e) = close_result {
            debug!(ws_session_id = %id, error = %e, "Upstream close failed");
        }
        session.detach_client();
        info!(ws_session_id = %id, code, "WS session closed");
        Ok(())
    }

    /// Closes sessions idle past their timeout with 1001. Returns their ids.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let now = now_millis();
        let idle: Vec<String> = self
            .lock()
            .values()
            .filter(|session| {
                now.saturating_sub(session.last_activity_ms()) > session.idle_timeout_ms
            })
            .map(|session| session.id.clone())
            .collect();
        for id in &idle {
            let _ = self.close(id, CLOSE_GOING_AWAY, "idle timeout", true).await;
        }
        idle
    }

    /// Shuts every session down with a clean going-away close.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.lock().keys().cloned().collect();
        for id in ids {
            let _ = self.close(&id, CLOSE_GOING_AWAY, "server shutting down", true).await;
        }
    }
}

/// Pumps frames from the upstream reader into the manager until the
/// upstream goes away.
pub fn spawn_upstream_pump(
    manager: Arc<WsSessionManager>,
    session_id: String,
    mut reader: SplitStream<WsStream>,
) {
    let _ = tokio::spawn(async move {
        while let Some(message) = reader.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if manager.record_inbound(&session_id, text.as_str()).is_err() {
                        break;
                    }
                },
                Ok(Message::Binary(_)) => {
                    let _ = manager.record_binary(&session_id, "inbound");
                },
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map_or((1000, String::new()), |f| (u16::from(f.code), f.reason.to_string()));
                    let _ = manager.close(&session_id, code, &reason, true).await;
                    break;
                },
                Ok(_) => {},
                Err(e) => {
                    if let Ok(session) = manager.get(&session_id) {
                        let _ = session.emit(
                            WsEnvelopeType::Error,
                            serde_json::json!({
                                "code": "WS_UPSTREAM_ERROR",
                                "message": e.to_string(),
                            }),
                        );
                    }
                    let _ = manager.close(&session_id, 1006, "upstream error", false).await;
                    break;
                },
            }
        }
        debug!(ws_session_id = %session_id, "Upstream pump ended");
    });
}
