// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;

mod auth;
mod cli;
mod config;
mod doc;
mod error;
mod events;
mod flow;
mod import;
mod logging;
mod scope;
mod scripts;
mod server;
mod service;
mod session;
mod sse;
mod state;
mod telemetry;
mod workspace;
mod ws_session;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    cli::handle_command(&cli, |log_config| logging::init_logging(log_config)).await;
}
