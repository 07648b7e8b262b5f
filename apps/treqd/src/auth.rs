// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Authentication: static bearer tokens, HMAC-signed scoped script tokens,
//! and cookie web-sessions.
//!
//! Credentials are evaluated in that order. With no server token configured
//! every caller is trusted — the loopback developer mode. The server token
//! doubles as the HMAC key for script tokens, so revoking it invalidates
//! every outstanding script token at once.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use treq_api::ScriptTokenPayload;
use treq_core::id::{self, now_millis};
use treq_core::{Error, ErrorKind, Result};

use crate::error::ApiError;
use crate::state::AppState;

/// Name of the browser web-session cookie.
pub const SESSION_COOKIE: &str = "treq_session";

const SCRIPT_PREFIX: &str = "script.";
const LEGACY_SCRIPT_PREFIX: &str = "script_";

type HmacSha256 = Hmac<Sha256>;

/// How the current request authenticated.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// No server token configured; every caller is trusted.
    Anonymous,
    /// Static server bearer token.
    Bearer,
    /// Scoped script token with its decoded payload.
    Script(ScriptTokenPayload),
    /// Browser cookie web-session.
    WebSession { web_session_id: String },
}

/// Request-scoped authentication context, inserted by the middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub method: AuthMethod,
}

impl AuthContext {
    pub const fn anonymous() -> Self {
        Self { method: AuthMethod::Anonymous }
    }

    /// The script-token payload, when this request used one.
    pub const fn script(&self) -> Option<&ScriptTokenPayload> {
        match &self.method {
            AuthMethod::Script(payload) => Some(payload),
            _ => None,
        }
    }

    pub const fn method_name(&self) -> &'static str {
        match self.method {
            AuthMethod::Anonymous => "anonymous",
            AuthMethod::Bearer => "bearer",
            AuthMethod::Script(_) => "script",
            AuthMethod::WebSession { .. } => "web-session",
        }
    }
}

fn unauthorized(message: &str) -> Error {
    Error::new(ErrorKind::Unauthorized, message)
}

fn sign(secret: &str, payload_b64: &str) -> Result<Vec<u8>> {
    // HMAC accepts keys of any length; this only fails on an API misuse.
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(Error::internal)?;
    mac.update(payload_b64.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Issues, validates, and revokes scoped script tokens.
///
/// The active-`jti` set is the revocation mechanism: a token is only valid
/// while its id is present.
pub struct ScriptTokens {
    secret: Option<String>,
    ttl_ms: u64,
    active: Mutex<HashMap<String, u64>>,
}

impl ScriptTokens {
    pub fn new(secret: Option<String>, ttl_ms: u64) -> Self {
        Self { secret, ttl_ms, active: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Issues a token scoped to one flow and one session.
    ///
    /// # Errors
    ///
    /// Fails with `VALIDATION_ERROR` when no server token is configured —
    /// there is no key to sign with.
    pub fn issue(&self, flow_id: &str, session_id: &str) -> Result<(String, ScriptTokenPayload)> {
        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| Error::validation("script tokens require a configured server token"))?;

        let now = now_millis();
        let payload = ScriptTokenPayload {
            jti: id::generate(),
            flow_id: flow_id.to_string(),
            session_id: session_id.to_string(),
            created_at: now,
            expires_at: now.saturating_add(self.ttl_ms),
        };
        let payload_b64 = URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&payload).map_err(Error::internal)?);
        let signature_b64 = URL_SAFE_NO_PAD.encode(sign(secret, &payload_b64)?);

        let _ = self.lock().insert(payload.jti.clone(), payload.expires_at);
        debug!(jti = %payload.jti, flow_id = %flow_id, session_id = %session_id, "Issued script token");
        Ok((format!("{SCRIPT_PREFIX}{payload_b64}.{signature_b64}"), payload))
    }

    /// Validates a raw token: signature (constant-time), expiry, and active
    /// `jti`. Accepts the legacy underscore-separated form.
    pub fn validate(&self, raw: &str) -> Result<ScriptTokenPayload> {
        let secret =
            self.secret.as_deref().ok_or_else(|| unauthorized("script tokens not enabled"))?;

        let (payload_b64, signature_b64) = if let Some(rest) = raw.strip_prefix(SCRIPT_PREFIX) {
            rest.split_once('.').ok_or_else(|| unauthorized("malformed script token"))?
        } else if let Some(rest) = raw.strip_prefix(LEGACY_SCRIPT_PREFIX) {
            rest.rsplit_once('_').ok_or_else(|| unauthorized("malformed script token"))?
        } else {
            return Err(unauthorized("not a script token"));
        };

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| unauthorized("malformed script token signature"))?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| unauthorized("script token verification failed"))?;
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&signature).map_err(|_| unauthorized("invalid script token signature"))?;

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| unauthorized("malformed script token payload"))?;
        let payload: ScriptTokenPayload = serde_json::from_slice(&payload_bytes)
            .map_err(|_| unauthorized("malformed script token payload"))?;

        let now = now_millis();
        if now >= payload.expires_at {
            return Err(unauthorized("script token expired"));
        }
        if !self.lock().contains_key(&payload.jti) {
            return Err(unauthorized("script token revoked"));
        }

        self.maybe_sweep(now);
        Ok(payload)
    }

    pub fn revoke(&self, jti: &str) {
        if self.lock().remove(jti).is_some() {
            debug!(jti = %jti, "Revoked script token");
        }
    }

    // Expired jtis accumulate only until the next busy period; sweep
    // opportunistically rather than with a dedicated timer.
    fn maybe_sweep(&self, now: u64) {
        let mut active = self.lock();
        if active.len() > 64 && rand::random::<f64>() < 0.05 {
            active.retain(|_, expires_at| *expires_at > now);
        }
    }
}

/// Browser web-sessions with sliding expiry.
pub struct WebSessions {
    ttl_ms: u64,
    sessions: Mutex<HashMap<String, u64>>,
}

impl WebSessions {
    pub fn new(ttl_ms: u64) -> Self {
        Self { ttl_ms, sessions: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub const fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn create(&self) -> String {
        let web_session_id = id::generate();
        let _ = self.lock().insert(web_session_id.clone(), now_millis());
        web_session_id
    }

    /// Returns true when the session is live, refreshing its sliding
    /// expiry. Dead sessions are removed on sight.
    pub fn touch(&self, web_session_id: &str) -> bool {
        let now = now_millis();
        let mut sessions = self.lock();
        match sessions.get_mut(web_session_id) {
            Some(last_accessed) if now.saturating_sub(*last_accessed) < self.ttl_ms => {
                *last_accessed = now;
                true
            },
            Some(_) => {
                let _ = sessions.remove(web_session_id);
                false
            },
            None => false,
        }
    }

    pub fn remove(&self, web_session_id: &str) {
        let _ = self.lock().remove(web_session_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Extracts a named cookie from the `Cookie` headers.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get_all(header::COOKIE).iter().find_map(|header_value| {
        header_value.to_str().ok().and_then(|cookies| {
            cookies.split(';').map(str::trim).find_map(|pair| {
                pair.split_once('=')
                    .and_then(|(k, v)| (k == name).then_some(v))
            })
        })
    })
}

/// Whether the request arrived over HTTPS. The server itself terminates
/// plain HTTP, so this is the reverse proxy's `X-Forwarded-Proto` call.
pub fn is_https(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"))
}

/// Builds the `Set-Cookie` value for a web-session (or for clearing one
/// when `max_age_secs` is zero).
pub fn session_cookie(value: &str, max_age_secs: u64, secure: bool) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={value}; HttpOnly; SameSite=Strict; Path=/; Max-Age={max_age_secs}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Paths reachable without credentials.
fn is_public_path(path: &str) -> bool {
    matches!(path, "/health" | "/capabilities" | "/doc" | "/auth/login")
        || path.starts_with("/ui")
}

/// Authentication middleware: resolves the caller's credential into an
/// [`AuthContext`] request extension, or answers 401.
pub async fn auth_middleware(
    State(app_state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();

    let Some(server_token) = app_state.config.auth.token.clone() else {
        let _ = req.extensions_mut().insert(AuthContext::anonymous());
        return next.run(req).await;
    };

    if is_public_path(&path) {
        let _ = req.extensions_mut().insert(AuthContext::anonymous());
        return next.run(req).await;
    }

    let context = resolve_credential(&app_state, &server_token, req.headers());
    match context {
        Ok(context) => {
            debug!(method = context.method_name(), path = %path, "Authenticated request");
            let _ = req.extensions_mut().insert(context);
            next.run(req).await
        },
        Err(err) => {
            warn!(path = %path, reason = %err.message(), "Rejected unauthenticated request");
            ApiError(err).into_response()
        },
    }
}

fn resolve_credential(
    app_state: &AppState,
    server_token: &str,
    headers: &HeaderMap,
) -> Result<AuthContext> {
    if let Some(token) = bearer_token(headers) {
        if token == server_token {
            return Ok(AuthContext { method: AuthMethod::Bearer });
        }
        if token.starts_with(SCRIPT_PREFIX) || token.starts_with(LEGACY_SCRIPT_PREFIX) {
            let payload = app_state.script_tokens.validate(token)?;
            return Ok(AuthContext { method: AuthMethod::Script(payload) });
        }
        return Err(unauthorized("invalid bearer token"));
    }

    if app_state.config.auth.allow_cookie_auth {
        if let Some(web_session_id) = cookie_value(headers, SESSION_COOKIE) {
            if app_state.web_sessions.touch(web_session_id) {
                return Ok(AuthContext {
                    method: AuthMethod::WebSession { web_session_id: web_session_id.to_string() },
                });
            }
            return Err(unauthorized("web session expired"));
        }
    }

    Err(unauthorized("missing credentials"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tokens() -> ScriptTokens {
        ScriptTokens::new(Some("server-secret".to_string()), 60_000)
    }

    #[test]
    fn issued_token_validates_to_its_payload() {
        let tokens = tokens();
        let (raw, payload) = tokens.issue("f1", "s1").unwrap();
        assert!(raw.starts_with("script."));
        let validated = tokens.validate(&raw).unwrap();
        assert_eq!(validated, payload);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let tokens = tokens();
        let (raw, _) = tokens.issue("f1", "s1").unwrap();
        let rest = raw.strip_prefix("script.").unwrap();
        let (_, signature) = rest.split_once('.').unwrap();
        let forged_payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&ScriptTokenPayload {
                jti: "forged".to_string(),
                flow_id: "other".to_string(),
                session_id: "other".to_string(),
                created_at: 0,
                expires_at: u64::MAX,
            })
            .unwrap(),
        );
        let forged = format!("script.{forged_payload}.{signature}");
        assert_eq!(tokens.validate(&forged).unwrap_err().code(), "UNAUTHORIZED");
    }

    #[test]
    fn wrong_key_signature_is_rejected() {
        let issuer = ScriptTokens::new(Some("key-a".to_string()), 60_000);
        let verifier = ScriptTokens::new(Some("key-b".to_string()), 60_000);
        let (raw, _) = issuer.issue("f1", "s1").unwrap();
        assert!(verifier.validate(&raw).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let tokens = ScriptTokens::new(Some("server-secret".to_string()), 0);
        let (raw, _) = tokens.issue("f1", "s1").unwrap();
        assert!(tokens.validate(&raw).unwrap_err().message().contains("expired"));
    }

    #[test]
    fn revoked_jti_is_rejected() {
        let tokens = tokens();
        let (raw, payload) = tokens.issue("f1", "s1").unwrap();
        tokens.revoke(&payload.jti);
        assert!(tokens.validate(&raw).unwrap_err().message().contains("revoked"));
    }

    #[test]
    fn legacy_underscore_form_is_accepted() {
        let tokens = tokens();
        let (raw, payload) = tokens.issue("f1", "s1").unwrap();
        let rest = raw.strip_prefix("script.").unwrap();
        let (payload_b64, signature_b64) = rest.split_once('.').unwrap();
        let legacy = format!("script_{payload_b64}_{signature_b64}");
        assert_eq!(tokens.validate(&legacy).unwrap(), payload);
    }

    #[test]
    fn web_session_sliding_expiry() {
        let sessions = WebSessions::new(60_000);
        let id = sessions.create();
        assert!(sessions.touch(&id));
        assert!(sessions.touch(&id));

        let dead = WebSessions::new(0);
        let id = dead.create();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(!dead.touch(&id));
        assert!(dead.is_empty());
    }

    #[test]
    fn session_cookie_shape() {
        let cookie = session_cookie("abc", 1800, false);
        assert_eq!(cookie, "treq_session=abc; HttpOnly; SameSite=Strict; Path=/; Max-Age=1800");
        assert!(session_cookie("abc", 1800, true).ends_with("; Secure"));
    }
}
