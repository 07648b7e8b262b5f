// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Scope enforcement for script tokens.
//!
//! Bearer, cookie, and anonymous callers are unrestricted. Script tokens
//! are confined to the flow and session they were issued for: executes and
//! variable updates must carry exactly the scoped ids, and everything
//! administrative is off limits.

use tracing::warn;

use treq_core::{Error, ErrorKind, Result};

use crate::auth::AuthContext;

fn scope_violation(message: String) -> Error {
    Error::new(ErrorKind::ScopeViolation, message)
}

/// Rejects script tokens outright. Used by session create/delete, flow
/// create, workspace listing, parse, importers, script spawning, and
/// config surfaces.
pub fn require_full_access(auth: &AuthContext, operation: &str) -> Result<()> {
    if auth.script().is_some() {
        warn!(operation, "Blocked script token from privileged operation");
        return Err(scope_violation(format!("script tokens may not {operation}")));
    }
    Ok(())
}

/// Gate for execute-style calls: a script token must carry exactly its own
/// `flowId` and `sessionId`.
pub fn check_execute_scope(
    auth: &AuthContext,
    flow_id: Option<&str>,
    session_id: Option<&str>,
) -> Result<()> {
    let Some(token) = auth.script() else { return Ok(()) };
    if flow_id != Some(token.flow_id.as_str()) {
        return Err(scope_violation(format!(
            "script token is scoped to flow {}",
            token.flow_id
        )));
    }
    if session_id != Some(token.session_id.as_str()) {
        return Err(scope_violation(format!(
            "script token is scoped to session {}",
            token.session_id
        )));
    }
    Ok(())
}

/// Gate for session-variable updates on `/session/{id}`.
pub fn check_session_scope(auth: &AuthContext, session_id: &str) -> Result<()> {
    let Some(token) = auth.script() else { return Ok(()) };
    if session_id != token.session_id {
        return Err(scope_violation(format!(
            "script token is scoped to session {}",
            token.session_id
        )));
    }
    Ok(())
}

/// Gate for execution-detail reads under `/flows/{id}`.
pub fn check_flow_scope(auth: &AuthContext, flow_id: &str) -> Result<()> {
    let Some(token) = auth.script() else { return Ok(()) };
    if flow_id != token.flow_id {
        return Err(scope_violation(format!(
            "script token is scoped to flow {}",
            token.flow_id
        )));
    }
    Ok(())
}

/// Gate for event subscriptions: every provided filter id must match the
/// token's scope, and at least one must be provided.
pub fn check_event_scope(
    auth: &AuthContext,
    session_filter: Option<&str>,
    flow_filter: Option<&str>,
) -> Result<()> {
    let Some(token) = auth.script() else { return Ok(()) };
    if session_filter.is_none() && flow_filter.is_none() {
        return Err(scope_violation(
            "script tokens must subscribe with their scoped sessionId or flowId".to_string(),
        ));
    }
    if session_filter.is_some_and(|id| id != token.session_id) {
        return Err(scope_violation(format!(
            "script token is scoped to session {}",
            token.session_id
        )));
    }
    if flow_filter.is_some_and(|id| id != token.flow_id) {
        return Err(scope_violation(format!("script token is scoped to flow {}", token.flow_id)));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::auth::AuthMethod;
    use treq_api::ScriptTokenPayload;

    fn script_auth() -> AuthContext {
        AuthContext {
            method: AuthMethod::Script(ScriptTokenPayload {
                jti: "j1".to_string(),
                flow_id: "f1".to_string(),
                session_id: "s1".to_string(),
                created_at: 0,
                expires_at: u64::MAX,
            }),
        }
    }

    #[test]
    fn bearer_is_unrestricted() {
        let auth = AuthContext { method: AuthMethod::Bearer };
        assert!(require_full_access(&auth, "create sessions").is_ok());
        assert!(check_execute_scope(&auth, None, None).is_ok());
    }

    #[test]
    fn script_is_blocked_from_privileged_operations() {
        let err = require_full_access(&script_auth(), "create sessions").unwrap_err();
        assert_eq!(err.code(), "SCOPE_VIOLATION");
        assert_eq!(err.http_status(), 403);
    }

    #[test]
    fn execute_scope_requires_exact_ids() {
        let auth = script_auth();
        assert!(check_execute_scope(&auth, Some("f1"), Some("s1")).is_ok());
        // Wrong flow with the right session is still a violation.
        assert!(check_execute_scope(&auth, Some("f2"), Some("s1")).is_err());
        assert!(check_execute_scope(&auth, Some("f1"), Some("s2")).is_err());
        assert!(check_execute_scope(&auth, None, Some("s1")).is_err());
    }

    #[test]
    fn session_and_flow_scopes() {
        let auth = script_auth();
        assert!(check_session_scope(&auth, "s1").is_ok());
        assert!(check_session_scope(&auth, "s2").is_err());
        assert!(check_flow_scope(&auth, "f1").is_ok());
        assert!(check_flow_scope(&auth, "f2").is_err());
    }

    #[test]
    fn event_scope_needs_a_matching_filter() {
        let auth = script_auth();
        assert!(check_event_scope(&auth, None, None).is_err());
        assert!(check_event_scope(&auth, Some("s1"), None).is_ok());
        assert!(check_event_scope(&auth, None, Some("f1")).is_ok());
        assert!(check_event_scope(&auth, Some("s2"), None).is_err());
        assert!(check_event_scope(&auth, Some("s1"), Some("f2")).is_err());
    }
}
