#![forbid(unsafe_code)]

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

mod bridge;
mod cli;
mod config;
mod control;
mod diff;
mod emoji;
mod irc;
mod parser;
mod slack;
mod state;

use bridge::SessionEnd;
use cli::Cli;
use config::Config;

fn init_tracing(config: &Config) {
    let default_filter = if config.debug {
        "slackirc=debug,info"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    if !config.log_suffix.is_empty() {
        info!(suffix = %config.log_suffix, "logging with identity suffix");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match Config::from_cli(cli) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("slackirc: {err}");
            return ExitCode::from(1);
        }
    };
    init_tracing(&config);

    let listener = match TcpListener::bind((config.ip.as_str(), config.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("slackirc: cannot listen on {}:{}: {err}", config.ip, config.port);
            return ExitCode::from(1);
        }
    };
    info!("listening on {}:{}", config.ip, config.port);

    // Dormant until an IRC client attaches; each attachment runs one
    // bridge session, and a disconnect drops us back here.
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return ExitCode::SUCCESS;
            }
        };
        let stream = match accepted {
            Ok((stream, addr)) => {
                info!("irc client attached from {addr}");
                stream
            }
            Err(err) => {
                error!("accept failed: {err}");
                continue;
            }
        };

        match bridge::run_session(&listener, stream, config.clone()).await {
            SessionEnd::ClientGone => {
                info!("session over, dormant again");
            }
            SessionEnd::Shutdown => {
                info!("shutting down");
                return ExitCode::SUCCESS;
            }
            SessionEnd::FatalAuth(err) => {
                eprintln!("slackirc: slack rejected the credentials: {err}");
                return ExitCode::from(1);
            }
            SessionEnd::SlackGaveUp(err) => {
                error!("giving up on slack: {err}");
                return ExitCode::from(2);
            }
        }
    }
}
