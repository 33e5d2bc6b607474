use anyhow::Context;
use clap::{Parser, Subcommand};
use mq_rs::telemetry::{init_logging, LogConfig};
use mq_rs::{handler_fn, QueueClient, QueueConfig};
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mq-rs")]
#[command(about = "Publish to and consume from Kafka/Redpanda topics", long_about = None)]
struct Cli {
    /// Path to the YAML queue configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish JSON lines read from stdin
    Produce {
        /// Topic to publish to instead of the configured default
        #[arg(short, long)]
        topic: Option<String>,
    },
    /// Print consumed payloads to stdout until Ctrl-C
    Consume,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&LogConfig {
        level: if cli.debug { "debug" } else { "info" }.to_string(),
        json: cli.json_logs,
        ..LogConfig::default()
    })?;

    let mut config = QueueConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    match cli.command {
        Command::Produce { .. } => config.consumer.enable = false,
        Command::Consume => config.producer.enable = false,
    }

    let cancel = CancellationToken::new();
    let client = QueueClient::init(cancel.clone(), &config)
        .await
        .context("Failed to start queue client")?;

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            ctrl_c.cancel();
        }
    });

    match cli.command {
        Command::Produce { topic } => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut sent = 0usize;
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => line?,
                };
                let Some(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }

                let message: Value = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Skipping invalid JSON line: {}", e);
                        continue;
                    }
                };
                match &topic {
                    Some(topic) => client.put_to_topic(topic, &message).await?,
                    None => client.put(&message).await?,
                }
                sent += 1;
            }
            info!(sent, "Finished reading stdin");
        }
        Command::Consume => {
            client.register_handler(handler_fn(|payload| {
                println!("{}", String::from_utf8_lossy(payload));
            }))?;
            cancel.cancelled().await;
        }
    }

    let report = client.shutdown().await;
    if !report.is_clean() {
        warn!(?report, "Queue client did not shut down cleanly");
    }
    Ok(())
}
