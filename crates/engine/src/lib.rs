// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! treq-engine: executes a single `.http` request block.
//!
//! The engine sits behind the [`Engine`] trait so the service (and its
//! tests) never depend on a concrete HTTP client. The default
//! [`HttpEngine`] interpolates variables, dispatches via reqwest, runs the
//! bounded body pipeline, and reports cookie mutations through the
//! session's [`CookieStore`] capability.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

use treq_core::{Error, Result};

pub mod body;
pub mod cookies;
pub mod interpolate;

pub use body::{read_body, BodyDescriptor, BodyEncoding, BodyMode};
pub use cookies::{CookieStore, MemoryCookieJar};
pub use interpolate::{interpolate, interpolate_counting};

/// Lifecycle events the engine emits while running a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ParseStarted,
    ParseFinished { request_count: usize },
    InterpolateStarted,
    InterpolateFinished { substitutions: usize },
    CompileStarted,
    CompileFinished,
    FetchStarted { method: String, url: String },
    FetchFinished { status: u16, duration_ms: u64 },
    Error { stage: String, message: String },
}

impl EngineEvent {
    /// Wire name of the event type.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ParseStarted => "parseStarted",
            Self::ParseFinished { .. } => "parseFinished",
            Self::InterpolateStarted => "interpolateStarted",
            Self::InterpolateFinished { .. } => "interpolateFinished",
            Self::CompileStarted => "compileStarted",
            Self::CompileFinished => "compileFinished",
            Self::FetchStarted { .. } => "fetchStarted",
            Self::FetchFinished { .. } => "fetchFinished",
            Self::Error { .. } => "error",
        }
    }

    /// Event fields as a JSON payload.
    pub fn payload(&self) -> Value {
        match self {
            Self::ParseStarted
            | Self::InterpolateStarted
            | Self::CompileStarted
            | Self::CompileFinished => serde_json::json!({}),
            Self::ParseFinished { request_count } => {
                serde_json::json!({ "requestCount": request_count })
            },
            Self::InterpolateFinished { substitutions } => {
                serde_json::json!({ "substitutions": substitutions })
            },
            Self::FetchStarted { method, url } => {
                serde_json::json!({ "method": method, "url": url })
            },
            Self::FetchFinished { status, duration_ms } => {
                serde_json::json!({ "status": status, "durationMs": duration_ms })
            },
            Self::Error { stage, message } => {
                serde_json::json!({ "stage": stage, "message": message })
            },
        }
    }
}

/// Callback receiving [`EngineEvent`]s as they happen.
pub type EventSink = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// Per-run options.
#[derive(Clone)]
pub struct RunOptions {
    /// Fully merged variables (session < request).
    pub variables: Map<String, Value>,
    /// Base directory for resolving `< file` body references.
    pub base_path: Option<PathBuf>,
    pub timeout: Duration,
    pub follow_redirects: bool,
    pub validate_ssl: bool,
    /// Body pipeline cap; bytes past this are discarded.
    pub max_body_bytes: usize,
    pub cookies: Option<Arc<dyn CookieStore>>,
    pub on_event: Option<EventSink>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            variables: Map::new(),
            base_path: None,
            timeout: Duration::from_secs(30),
            follow_redirects: true,
            validate_ssl: true,
            max_body_bytes: 1024 * 1024,
            cookies: None,
            on_event: None,
        }
    }
}

impl RunOptions {
    fn emit(&self, event: EngineEvent) {
        if let Some(sink) = &self.on_event {
            sink(event);
        }
    }
}

/// Result of a dispatched request after the body pipeline ran.
#[derive(Debug, Clone)]
pub struct EngineResponse {
    pub method: String,
    /// Fully resolved URL after interpolation and redirects were applied.
    pub url: String,
    pub status: u16,
    /// Response headers with lower-cased names, in arrival order.
    /// `set-cookie` stays multi-valued as repeated entries.
    pub headers: Vec<(String, String)>,
    pub body: BodyDescriptor,
    pub ttfb_ms: Option<u64>,
    pub duration_ms: u64,
    /// True when the response mutated the cookie store.
    pub cookies_changed: bool,
}

/// The execution engine contract consumed by the service layer.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Runs the first request block in `raw` and returns its response.
    async fn run_string(&self, raw: &str, options: RunOptions) -> Result<EngineResponse>;
}

/// The default reqwest-backed engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpEngine;

impl HttpEngine {
    pub const fn new() -> Self {
        Self
    }
}

fn execute_error(options: &RunOptions, stage: &str, cause: impl std::fmt::Display) -> Error {
    let message = cause.to_string();
    options.emit(EngineEvent::Error { stage: stage.to_string(), message: message.clone() });
    Error::execute(stage, message)
}

async fn resolve_body(
    options: &RunOptions,
    request: &treq_parser::HttpRequest,
) -> Result<Option<String>> {
    if let Some(file) = &request.body_file {
        let path = PathBuf::from(file);
        let resolved = if path.is_absolute() {
            path
        } else {
            options.base_path.clone().unwrap_or_else(|| PathBuf::from(".")).join(path)
        };
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| execute_error(options, "compile", format!("body file {file}: {e}")))?;
        return Ok(Some(interpolate(&content, &options.variables)));
    }
    Ok(request.body.clone())
}

#[async_trait]
impl Engine for HttpEngine {
    async fn run_string(&self, raw: &str, options: RunOptions) -> Result<EngineResponse> {
        let started = Instant::now();

        options.emit(EngineEvent::ParseStarted);
        let requests = treq_parser::parse(raw)
            .map_err(|e| execute_error(&options, "parse", e))?;
        options.emit(EngineEvent::ParseFinished { request_count: requests.len() });
        let request = requests
            .into_iter()
            .next()
            .ok_or_else(|| execute_error(&options, "parse", "no request in block"))?;

        options.emit(EngineEvent::InterpolateStarted);
        let (url_text, mut substitutions) =
            interpolate_counting(&request.url, &options.variables);
        let headers: Vec<(String, String)> = request
            .headers
            .iter()
            .map(|(name, value)| {
                let (resolved, count) = interpolate_counting(value, &options.variables);
                substitutions += count;
                (name.clone(), resolved)
            })
            .collect();
        let body = resolve_body(&options, &request).await?.map(|text| {
            let (resolved, count) = interpolate_counting(&text, &options.variables);
            substitutions += count;
            resolved
        });
        options.emit(EngineEvent::InterpolateFinished { substitutions });

        options.emit(EngineEvent::CompileStarted);
        let url = Url::parse(&url_text)
            .map_err(|e| execute_error(&options, "compile", format!("invalid URL {url_text}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(execute_error(
                &options,
                "compile",
                format!("unsupported URL scheme {}", url.scheme()),
            ));
        }
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| execute_error(&options, "compile", e))?;

        let redirect = if options.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        let client = reqwest::Client::builder()
            .redirect(redirect)
            .danger_accept_invalid_certs(!options.validate_ssl)
            .timeout(options.timeout)
            .build()
            .map_err(|e| execute_error(&options, "compile", e))?;

        let mut builder = client.request(method.clone(), url.clone());
        let mut has_cookie_header = false;
        for (name, value) in &headers {
            if name.eq_ignore_ascii_case("cookie") {
                has_cookie_header = true;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !has_cookie_header {
            if let Some(header) = options.cookies.as_ref().and_then(|jar| jar.cookie_header(&url)) {
                builder = builder.header(reqwest::header::COOKIE, header);
            }
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        options.emit(EngineEvent::CompileFinished);

        options.emit(EngineEvent::FetchStarted {
            method: method.to_string(),
            url: url.to_string(),
        });
        let response = builder.send().await.map_err(|e| execute_error(&options, "fetch", e))?;
        let ttfb_ms = u64::try_from(started.elapsed().as_millis()).ok();

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let mut response_headers: Vec<(String, String)> = Vec::new();
        let mut set_cookie: Vec<String> = Vec::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            if name == &reqwest::header::SET_COOKIE {
                set_cookie.push(value.clone());
            }
            response_headers.push((name.as_str().to_lowercase(), value));
        }

        let descriptor = read_body(Box::pin(response.bytes_stream()), options.max_body_bytes)
            .await
            .map_err(|e| execute_error(&options, "body", e))?;

        let cookies_changed = match (&options.cookies, set_cookie.is_empty()) {
            (Some(jar), false) => jar.store_response_cookies(&final_url, &set_cookie) > 0,
            _ => false,
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        options.emit(EngineEvent::FetchFinished { status, duration_ms });
        debug!(
            method = %method,
            url = %final_url,
            status,
            duration_ms,
            body_bytes = descriptor.body_bytes,
            truncated = descriptor.truncated,
            "Request dispatched"
        );

        Ok(EngineResponse {
            method: method.to_string(),
            url: final_url.to_string(),
            status,
            headers: response_headers,
            body: descriptor,
            ttfb_ms,
            duration_ms,
            cookies_changed,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> Option<SocketAddr> {
        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return None,
            Err(e) => panic!("failed to bind test listener: {e}"),
        };
        let addr = listener.local_addr().unwrap();
        let _ = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service()).await.unwrap();
        });
        Some(addr)
    }

    #[tokio::test]
    async fn runs_request_with_interpolation_and_emits_event_sequence() {
        let router = Router::new().route(
            "/hello",
            get(|headers: axum::http::HeaderMap| async move {
                headers.get("authorization").map_or_else(
                    || "anonymous".to_string(),
                    |v| v.to_str().unwrap_or_default().to_string(),
                )
            }),
        );
        let Some(addr) = serve(router).await else {
            eprintln!("Skipping engine test: local TCP bind not permitted");
            return;
        };

        let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let mut variables = Map::new();
        let _ = variables.insert("baseUrl".into(), Value::String(format!("http://{addr}")));
        let _ = variables.insert("token".into(), Value::String("abc".into()));

        let options = RunOptions {
            variables,
            on_event: Some(Arc::new(move |event: EngineEvent| {
                sink_events.lock().unwrap().push(event.name());
            })),
            ..RunOptions::default()
        };

        let raw = "GET {{baseUrl}}/hello\nAuthorization: Bearer {{token}}\n";
        let response = HttpEngine::new().run_string(raw, options).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body.body, "Bearer abc");
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "parseStarted",
                "parseFinished",
                "interpolateStarted",
                "interpolateFinished",
                "compileStarted",
                "compileFinished",
                "fetchStarted",
                "fetchFinished",
            ]
        );
    }

    #[tokio::test]
    async fn cookie_round_trip_through_store() {
        let router = Router::new()
            .route(
                "/set",
                get(|| async {
                    ([("set-cookie", "s=1; Path=/")], "ok")
                }),
            )
            .route(
                "/echo",
                get(|headers: axum::http::HeaderMap| async move {
                    headers
                        .get("cookie")
                        .map_or_else(String::new, |v| v.to_str().unwrap_or_default().to_string())
                }),
            );
        let Some(addr) = serve(router).await else {
            eprintln!("Skipping engine test: local TCP bind not permitted");
            return;
        };

        let jar: Arc<dyn CookieStore> = Arc::new(MemoryCookieJar::new());
        let options = RunOptions { cookies: Some(Arc::clone(&jar)), ..RunOptions::default() };
        let first = HttpEngine::new()
            .run_string(&format!("GET http://{addr}/set\n"), options.clone())
            .await
            .unwrap();
        assert!(first.cookies_changed);
        assert_eq!(jar.cookie_count(), 1);

        let second = HttpEngine::new()
            .run_string(&format!("GET http://{addr}/echo\n"), options)
            .await
            .unwrap();
        assert!(!second.cookies_changed);
        assert_eq!(second.body.body, "s=1");
    }

    #[tokio::test]
    async fn fetch_failure_is_execute_error_with_stage() {
        // Port 1 is essentially never listening.
        let err = HttpEngine::new()
            .run_string("GET http://127.0.0.1:1/\n", RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EXECUTE_ERROR");
        assert_eq!(err.details().and_then(|d| d["stage"].as_str()), Some("fetch"));
    }

    #[tokio::test]
    async fn non_http_scheme_is_rejected_at_compile() {
        let err = HttpEngine::new()
            .run_string("GET ftp://example.com/\n", RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.details().and_then(|d| d["stage"].as_str()), Some("compile"));
    }
}
