// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Static OpenAPI 3.0.3 document for `GET /doc`.
//!
//! Hand-maintained: the surface is small and stable enough that generated
//! schemas would add more tooling than value. Keep this in sync with the
//! routes in `server.rs`.

use serde_json::{json, Value};

fn error_response(description: &str) -> Value {
    json!({
        "description": description,
        "content": { "application/json": { "schema": { "$ref": "#/components/schemas/ErrorBody" } } }
    })
}

/// Builds the OpenAPI document.
#[allow(clippy::too_many_lines)]
pub fn openapi_document() -> Value {
    json!({
        "openapi": "3.0.3",
        "info": {
            "title": "treq server API",
            "description": "Local request-execution service for .http files: sessions, flows, event streams, and proxied WebSocket sessions.",
            "version": env!("CARGO_PKG_VERSION"),
            "license": { "name": "MPL-2.0" }
        },
        "components": {
            "securitySchemes": {
                "bearer": { "type": "http", "scheme": "bearer" },
                "cookie": { "type": "apiKey", "in": "cookie", "name": "treq_session" }
            },
            "schemas": {
                "ErrorBody": {
                    "type": "object",
                    "required": ["error"],
                    "properties": {
                        "error": {
                            "type": "object",
                            "required": ["code", "message"],
                            "properties": {
                                "code": { "type": "string" },
                                "message": { "type": "string" },
                                "details": {}
                            }
                        }
                    }
                },
                "EventEnvelope": {
                    "type": "object",
                    "required": ["type", "ts", "runId", "seq", "payload"],
                    "properties": {
                        "type": { "type": "string" },
                        "ts": { "type": "string", "format": "date-time" },
                        "runId": { "type": "string" },
                        "sessionId": { "type": "string" },
                        "flowId": { "type": "string" },
                        "reqExecId": { "type": "string" },
                        "seq": { "type": "integer", "format": "int64" },
                        "payload": { "type": "object" }
                    }
                }
            }
        },
        "paths": {
            "/health": {
                "get": { "summary": "Liveness probe", "responses": { "200": { "description": "healthy" } } }
            },
            "/capabilities": {
                "get": { "summary": "Protocol and feature advertisement", "responses": { "200": { "description": "capabilities" } } }
            },
            "/doc": {
                "get": { "summary": "This document", "responses": { "200": { "description": "OpenAPI 3.0.3" } } }
            },
            "/auth/login": {
                "post": { "summary": "Exchange the server token for a web-session cookie", "responses": { "204": { "description": "cookie set" }, "401": error_response("bad token") } }
            },
            "/auth/logout": {
                "post": { "summary": "Destroy the web-session", "responses": { "204": { "description": "cookie cleared" } } }
            },
            "/parse": {
                "post": { "summary": "Parse .http content or a workspace file", "responses": { "200": { "description": "parse result" }, "400": error_response("parse failure"), "403": error_response("path outside workspace") } }
            },
            "/execute": {
                "post": { "summary": "Execute one request from content or a workspace file", "responses": { "200": { "description": "execute envelope" }, "400": error_response("validation/parse/execute failure"), "403": error_response("path or scope violation"), "404": error_response("missing session/flow/file") } }
            },
            "/execute/ws": {
                "post": { "summary": "Open a proxied WebSocket session for a ws:// request", "responses": { "200": { "description": "WS session opened" }, "429": error_response("WS session limit reached") } }
            },
            "/ws/session/{wsSessionId}": {
                "get": { "summary": "Attach to a WS session (WebSocket upgrade, ?afterSeq= replays)", "responses": { "101": { "description": "switching protocols" }, "404": error_response("unknown WS session") } },
                "delete": { "summary": "Close a WS session", "responses": { "204": { "description": "closed" } } }
            },
            "/session": {
                "post": { "summary": "Create a session", "responses": { "201": { "description": "session id" } } }
            },
            "/session/{id}": {
                "get": { "summary": "Read session state (redacted variables)", "responses": { "200": { "description": "session state" }, "404": error_response("unknown session") } },
                "delete": { "summary": "Delete a session", "responses": { "204": { "description": "deleted" } } }
            },
            "/session/{id}/variables": {
                "put": { "summary": "Merge or replace session variables", "responses": { "200": { "description": "updated state" } } }
            },
            "/flows": {
                "post": { "summary": "Create a flow", "responses": { "201": { "description": "flow id" } } }
            },
            "/flows/{flowId}/finish": {
                "post": { "summary": "Finalize a flow and compute its summary", "responses": { "200": { "description": "summary" }, "400": error_response("already finished") } }
            },
            "/flows/{flowId}/executions/{reqExecId}": {
                "get": { "summary": "Read one execution record", "responses": { "200": { "description": "execution record" }, "404": error_response("unknown flow or execution") } }
            },
            "/workspace/files": {
                "get": { "summary": "List .http files in the workspace (?ignore= adds globs)", "responses": { "200": { "description": "file list" } } }
            },
            "/workspace/requests": {
                "get": { "summary": "List requests in one workspace file (?path=)", "responses": { "200": { "description": "request identities" } } }
            },
            "/event": {
                "get": { "summary": "Server-sent event stream (?sessionId= ?flowId= ?afterSeq=); interleaves connected/heartbeat control frames", "responses": { "200": { "description": "text/event-stream" } } }
            },
            "/event/ws": {
                "get": { "summary": "Event stream over WebSocket, one JSON envelope per frame", "responses": { "101": { "description": "switching protocols" } } }
            },
            "/import/{kind}/preview": {
                "post": { "summary": "Convert a cURL command or Postman collection to .http (no writes)", "responses": { "200": { "description": "clean" }, "207": { "description": "partial" }, "422": error_response("error findings without force") } }
            },
            "/import/{kind}/apply": {
                "post": { "summary": "Convert and write into the workspace", "responses": { "200": { "description": "written" }, "207": { "description": "partial, written" }, "422": error_response("error findings without force") } }
            },
            "/scripts/run": {
                "post": { "summary": "Run a whitelisted script runner with a scoped token", "responses": { "200": { "description": "script outcome" }, "400": error_response("unknown runner") } }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_is_openapi_303_with_all_core_paths() {
        let doc = openapi_document();
        assert_eq!(doc["openapi"], "3.0.3");
        for path in [
            "/health",
            "/capabilities",
            "/parse",
            "/execute",
            "/execute/ws",
            "/session",
            "/flows",
            "/event",
            "/event/ws",
            "/scripts/run",
        ] {
            assert!(doc["paths"].get(path).is_some(), "missing path {path}");
        }
    }
}
