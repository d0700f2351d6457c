use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{RemoteStore, SessionConfig, SessionController, SessionEvent};
use shared::domain::OperatorId;
use tokio::io::BufReader;
use tracing::warn;

mod commands;
mod console;
mod render;

use commands::OperatorCommand;
use console::Console;

#[derive(Parser, Debug)]
#[command(about = "Drive a rover through the hosted device store")]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    /// Connect to this device on startup.
    #[arg(long)]
    device: Option<String>,
    /// Label shown to other operators; a guest label is generated when omitted.
    #[arg(long)]
    operator: Option<String>,
    #[arg(long, default_value_t = 100)]
    resend_ms: u64,
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            resend_interval: Duration::from_millis(self.resend_ms.max(1)),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            ..SessionConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let store = RemoteStore::new(&args.server_url)
        .with_context(|| format!("invalid --server-url {}", args.server_url))?;
    if let Err(error) = store.health_check().await {
        warn!(%error, server_url = %args.server_url, "operator: store is not reachable yet");
    }

    let controller = SessionController::new(Arc::new(store), args.session_config());
    let operator = args
        .operator
        .clone()
        .unwrap_or_else(|| OperatorId::guest().to_string());
    println!("operating as {operator}; type `help` for commands");

    let mut events = controller.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if matches!(event, SessionEvent::StateChanged(_)) {
                continue;
            }
            println!("* {}", render::describe_event(&event));
        }
    });

    let console = Console::new(controller, operator);
    let first = args.device.clone().map(|device| OperatorCommand::Connect {
        device,
        operator: None,
    });
    let input = BufReader::new(tokio::io::stdin());
    let outcome = console.serve(first, input, interrupted()).await;

    event_task.abort();
    outcome
}

async fn interrupted() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "operator: cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
