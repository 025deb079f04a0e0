mod cli;

use anyhow::Context;
use arbor::infrastructure::config::ArborConfig;
use arbor::infrastructure::logging::init_logging;
use arbor::router::RequestRouter;
use arbor::SessionRegistry;
use clap::Parser;
use cli::Cli;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config =
        ArborConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let registry = Arc::new(SessionRegistry::new(config));

    for dir in &cli.register {
        match registry.register_workdir(dir) {
            Ok(key) => log::info!("Registered workdir {}", key.as_path().display()),
            Err(e) => log::warn!("Could not register workdir {}: {e}", dir.display()),
        }
    }

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(write_lines(out_rx));

    let events_tx = out_tx.clone();
    let subscription = registry.events().observe_all(move |event| {
        match serde_json::to_value(&event) {
            Ok(value) => {
                let _ = events_tx.send(value);
            }
            Err(e) => log::warn!("Dropping unserializable {} event: {e}", event.kind().as_str()),
        }
    });

    serve(Arc::clone(&registry), out_tx).await;

    subscription.cancel();
    registry.shutdown().await;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        log::warn!("Output writer did not drain before exit");
    }
    log::info!("arbor stopped");
    Ok(())
}

/// Reads requests until stdin closes or the process is interrupted. Session input
/// verbs keep their arrival order; the rest run concurrently.
async fn serve(registry: Arc<SessionRegistry>, out: UnboundedSender<Value>) {
    let mut router = RequestRouter::new(registry, out);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => router.submit(&line),
                Ok(None) => {
                    log::info!("stdin closed, shutting down");
                    break;
                }
                Err(e) => {
                    log::error!("Failed to read request: {e}");
                    break;
                }
            },
            _ = &mut interrupted => {
                log::info!("Interrupted, shutting down");
                break;
            }
        }
    }
}

/// The only task that touches stdout, so lines never interleave.
async fn write_lines(mut rx: UnboundedReceiver<Value>) {
    let mut stdout = tokio::io::stdout();
    while let Some(value) = rx.recv().await {
        let mut line = value.to_string();
        line.push('\n');
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            log::error!("Failed to write to stdout: {e}");
            break;
        }
        let _ = stdout.flush().await;
    }
}
