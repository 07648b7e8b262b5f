// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Whitelisted script/test-runner spawning.
//!
//! A spawned script receives a fresh scoped token in `TREQ_TOKEN` plus the
//! ids it is confined to; the token's `jti` is revoked the moment the child
//! exits, so leaked tokens die with the process.

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use treq_api::{CreateFlowRequest, RunScriptRequest, RunScriptResponse};
use treq_core::{Error, Result};

use crate::state::AppState;

/// The fixed set of runners a client may spawn. Anything else is rejected;
/// this is the only subprocess surface the server has.
pub const ALLOWED_RUNNERS: [&str; 5] = ["node", "npm", "npx", "deno", "bun"];

const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 300_000;
/// Captured output is tailed to keep responses bounded.
const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(OUTPUT_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

/// Runs a whitelisted script runner to completion and returns its outcome.
///
/// # Errors
///
/// `VALIDATION_ERROR` for non-whitelisted runners or bad timeouts,
/// `EXECUTE_ERROR` when spawning fails or the timeout fires.
pub async fn run_script(
    app_state: &AppState,
    request: RunScriptRequest,
) -> Result<RunScriptResponse> {
    if !ALLOWED_RUNNERS.contains(&request.runner.as_str()) {
        return Err(Error::validation(format!(
            "runner {} is not allowed (expected one of {})",
            request.runner,
            ALLOWED_RUNNERS.join(", ")
        )));
    }
    let timeout_ms = match request.timeout_ms {
        None => DEFAULT_SCRIPT_TIMEOUT_MS,
        Some(ms) if (100..=300_000).contains(&ms) => ms,
        Some(ms) => {
            return Err(Error::validation(format!("timeoutMs {ms} outside 100..=300000")));
        },
    };

    let service = &app_state.service;
    let session = match &request.session_id {
        Some(id) => service.sessions().get_or_err(id)?,
        None => service.create_session(None)?,
    };
    let flow = match &request.flow_id {
        Some(id) => service.flows().get_or_err(id)?,
        None => service.create_flow(CreateFlowRequest {
            session_id: Some(session.id.clone()),
            label: Some(format!("script:{}", request.runner)),
            meta: None,
        })?,
    };

    let (token, payload) = app_state.script_tokens.issue(&flow.id, &session.id)?;
    let server_url = format!("http://{}", app_state.config.server.address());

    let started = Instant::now();
    let mut child = tokio::process::Command::new(&request.runner)
        .args(&request.args)
        .current_dir(service.workspace_root())
        .env("TREQ_SERVER_URL", &server_url)
        .env("TREQ_TOKEN", &token)
        .env("TREQ_FLOW_ID", &flow.id)
        .env("TREQ_SESSION_ID", &session.id)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            app_state.script_tokens.revoke(&payload.jti);
            Error::execute("script", format!("spawning {}: {e}", request.runner))
        })?;

    info!(runner = %request.runner, flow_id = %flow.id, session_id = %session.id, "Spawned script");

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let wait = async {
        let mut out = child.stdout.take();
        let mut err = child.stderr.take();
        // Drain both pipes concurrently so neither can fill and stall the child.
        let _ = tokio::join!(
            async {
                if let Some(out) = out.as_mut() {
                    let _ = out.read_to_end(&mut stdout).await;
                }
            },
            async {
                if let Some(err) = err.as_mut() {
                    let _ = err.read_to_end(&mut stderr).await;
                }
            },
        );
        child.wait().await
    };

    let status = match tokio::time::timeout(Duration::from_millis(timeout_ms), wait).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            app_state.script_tokens.revoke(&payload.jti);
            return Err(Error::execute("script", format!("waiting for {}: {e}", request.runner)));
        },
        Err(_) => {
            let _ = child.kill().await;
            app_state.script_tokens.revoke(&payload.jti);
            warn!(runner = %request.runner, timeout_ms, "Script timed out and was killed");
            return Err(Error::execute(
                "script",
                format!("{} timed out after {timeout_ms} ms", request.runner),
            ));
        },
    };

    // The token dies with the process.
    app_state.script_tokens.revoke(&payload.jti);

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let exit_code = status.code().unwrap_or(-1);
    info!(runner = %request.runner, exit_code, duration_ms, "Script finished");

    Ok(RunScriptResponse {
        exit_code,
        session_id: session.id.clone(),
        flow_id: flow.id.clone(),
        duration_ms,
        stdout: tail(&stdout),
        stderr: tail(&stderr),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_is_fixed() {
        assert!(ALLOWED_RUNNERS.contains(&"node"));
        assert!(!ALLOWED_RUNNERS.contains(&"bash"));
        assert!(!ALLOWED_RUNNERS.contains(&"sh"));
    }

    #[test]
    fn tail_keeps_the_end() {
        let mut data = vec![b'a'; OUTPUT_TAIL_BYTES + 10];
        data.extend_from_slice(b"the end");
        let tailed = tail(&data);
        assert!(tailed.ends_with("the end"));
        assert!(tailed.len() <= OUTPUT_TAIL_BYTES + 7);
    }
}
