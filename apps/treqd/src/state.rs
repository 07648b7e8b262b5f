// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::auth::{ScriptTokens, WebSessions};
use crate::config::Config;
use crate::service::Service;
use crate::ws_session::WsSessionManager;

/// Shared application state: the service facade plus the auth and
/// WS-session registries, all owned here so teardown is explicit.
pub struct AppState {
    pub config: Arc<Config>,
    pub service: Arc<Service>,
    pub ws_sessions: Arc<WsSessionManager>,
    pub script_tokens: Arc<ScriptTokens>,
    pub web_sessions: Arc<WebSessions>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        service: Arc<Service>,
        ws_sessions: Arc<WsSessionManager>,
        script_tokens: Arc<ScriptTokens>,
        web_sessions: Arc<WebSessions>,
    ) -> Self {
        Self {
            config,
            service,
            ws_sessions,
            script_tokens,
            web_sessions,
            background_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Tracks a sweeper task so shutdown can stop it.
    pub fn register_task(&self, handle: JoinHandle<()>) {
        self.background_tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handle);
    }

    /// Orderly teardown: stop timers, hang up subscribers, close WS
    /// sessions with a clean code.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.background_tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for handle in handles {
            handle.abort();
        }
        self.service.bus().close_all();
        self.ws_sessions.close_all().await;
        info!("Server state shut down");
    }
}
