//! Tickcast
//!
//! Run the snapshot stream, or watch one.
//!
//! # Configuration
//!
//! Settings come from `--config <file>`, the default config locations, and
//! `TICKCAST_*` environment variables. `RUST_LOG` overrides the log level.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tickcast::config::generate_default_config;
use tickcast::demo::FactorySimulator;
use tickcast::{Config, LoggingConfig, Producer, ReconnectPolicy, StreamServer, Subscriber};

#[derive(Parser)]
#[command(name = "tickcast")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Push periodic telemetry snapshots to local WebSocket subscribers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the stream with the built-in factory simulator as the source
    Serve {
        /// Interface to listen on
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Snapshots per second (1-60)
        #[arg(long)]
        hz: Option<f64>,
        /// Report this many initial snapshots as unavailable
        #[arg(long, default_value = "0")]
        warmup: u32,
    },

    /// Connect to a stream and print each snapshot
    Watch {
        /// Server address
        #[arg(default_value = "127.0.0.1:8470")]
        addr: String,
        /// Stop after this many snapshots
        #[arg(short = 'n', long)]
        count: Option<u64>,
        /// Print full snapshot JSON instead of a summary line
        #[arg(long)]
        raw: bool,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };

    match cli.command {
        Commands::Serve {
            host,
            port,
            hz,
            warmup,
        } => {
            init_logging(&config.logging);
            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(hz) = hz {
                config.producer.cadence_hz = hz;
            }
            serve(config, warmup).await
        }
        Commands::Watch { addr, count, raw } => {
            init_logging(&config.logging);
            watch(&addr, count, raw).await
        }
        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("failed to write {:?}", path))?;
                    println!("Wrote default config to {:?}", path);
                }
                None => print!("{}", content),
            }
            Ok(())
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("tickcast={}", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn serve(config: Config, warmup: u32) -> anyhow::Result<()> {
    tracing::info!("Tickcast v{}", env!("CARGO_PKG_VERSION"));

    let server = Arc::new(StreamServer::new(config.server.clone()));
    server
        .start()
        .await
        .context("failed to start snapshot stream")?;

    let source = FactorySimulator::new(config.producer.cadence_hz).with_warmup(warmup);
    let producer = Producer::spawn(Arc::clone(&server), source, &config.producer);

    shutdown_signal().await;

    tracing::info!("Shutting down...");
    let stats = producer.stop().await;
    server.stop().await;

    tracing::info!(
        published = stats.published,
        unavailable = stats.unavailable,
        "Tickcast shutdown complete"
    );
    Ok(())
}

async fn watch(addr: &str, count: Option<u64>, raw: bool) -> anyhow::Result<()> {
    let policy = ReconnectPolicy::default();
    let mut attempt = 0;
    let mut received = 0u64;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        match Subscriber::connect(addr).await {
            Ok(mut subscriber) => {
                tracing::info!("Connected to ws://{}", addr);
                attempt = 0;

                loop {
                    tokio::select! {
                        _ = &mut ctrl_c => return Ok(()),
                        next = subscriber.next_snapshot::<serde_json::Value>() => match next {
                            Ok(snapshot) => {
                                received += 1;
                                print_snapshot(&snapshot, subscriber.latency_ms(), raw);
                                if count.is_some_and(|limit| received >= limit) {
                                    return Ok(());
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Stream ended: {}", e);
                                break;
                            }
                        },
                    }
                }
            }
            Err(e) => tracing::warn!("Could not connect to {}: {}", addr, e),
        }

        attempt += 1;
        let delay = match policy.delay(attempt) {
            Some(delay) => delay,
            None => anyhow::bail!("giving up after {} reconnection attempts", policy.max_attempts),
        };
        tracing::info!(
            "Reconnecting in {:.1}s (attempt {}/{})",
            delay.as_secs_f64(),
            attempt,
            policy.max_attempts
        );

        tokio::select! {
            _ = &mut ctrl_c => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn print_snapshot(snapshot: &serde_json::Value, latency_ms: Option<f64>, raw: bool) {
    if raw {
        println!("{}", snapshot);
        return;
    }

    let tick = snapshot
        .get("gameTick")
        .and_then(|t| t.as_u64())
        .map(|t| t.to_string())
        .unwrap_or_else(|| "-".to_string());
    let planets = snapshot
        .get("planets")
        .and_then(|p| p.as_object())
        .map(|p| p.len())
        .unwrap_or(0);
    let latency = latency_ms
        .map(|ms| format!("{:.0}ms", ms))
        .unwrap_or_else(|| "n/a".to_string());

    println!("tick={} planets={} latency={}", tick, planets, latency);
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
