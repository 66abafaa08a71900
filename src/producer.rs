//! Snapshot Production
//!
//! The boundary between an external collector and the streaming server. A
//! [`SnapshotSource`] hands over one opaque, serializable snapshot per tick;
//! the [`Producer`] task drives it at a fixed cadence and broadcasts each
//! snapshot stamped with the wall-clock time it was taken.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ProducerConfig;
use crate::server::StreamServer;

/// Errors reported by a snapshot source
#[derive(Debug, Error)]
pub enum SourceError {
    /// No snapshot can be produced this tick; the tick is skipped
    #[error("Snapshot unavailable: {0}")]
    Unavailable(String),
}

/// Supplier of telemetry snapshots
#[async_trait]
pub trait SnapshotSource: Send {
    /// Snapshot type; must serialize as a JSON object
    type Snapshot: Serialize + Send + Sync;

    /// Short name used in logs
    fn name(&self) -> &str;

    /// Take one snapshot
    async fn collect(&mut self) -> Result<Self::Snapshot, SourceError>;
}

/// Current Unix time in fractional seconds
pub fn unix_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Snapshot with a top-level `timestamp` field added
///
/// Subscribers use the timestamp to estimate stream latency.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedSnapshot<T> {
    /// Unix time in seconds
    pub timestamp: f64,
    #[serde(flatten)]
    pub snapshot: T,
}

impl<T> TimestampedSnapshot<T> {
    pub fn now(snapshot: T) -> Self {
        Self {
            timestamp: unix_seconds(),
            snapshot,
        }
    }
}

/// Counters reported when a producer stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub ticks: u64,
    pub published: u64,
    pub unavailable: u64,
}

/// Background task that broadcasts one snapshot per tick
pub struct Producer {
    handle: JoinHandle<ProducerStats>,
    stop: watch::Sender<bool>,
}

impl Producer {
    /// Start ticking `source` into `server`
    pub fn spawn<S>(server: Arc<StreamServer>, source: S, config: &ProducerConfig) -> Self
    where
        S: SnapshotSource + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let period = config.interval();

        tracing::info!(
            source = source.name(),
            period_ms = period.as_millis() as u64,
            "Starting snapshot producer"
        );

        let handle = tokio::spawn(run(server, source, period, stop_rx));
        Self { handle, stop }
    }

    /// Stop ticking and return the counters
    pub async fn stop(self) -> ProducerStats {
        let _ = self.stop.send(true);
        match self.handle.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(error = %e, "Producer task failed");
                ProducerStats::default()
            }
        }
    }
}

async fn run<S>(
    server: Arc<StreamServer>,
    mut source: S,
    period: std::time::Duration,
    mut stop: watch::Receiver<bool>,
) -> ProducerStats
where
    S: SnapshotSource,
{
    let mut stats = ProducerStats::default();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }
        stats.ticks += 1;

        match source.collect().await {
            Ok(snapshot) => {
                let report = server.broadcast(&TimestampedSnapshot::now(snapshot)).await;
                if report.dropped > 0 {
                    tracing::debug!(
                        delivered = report.delivered,
                        dropped = report.dropped,
                        "Dropped subscribers during broadcast"
                    );
                }
                stats.published += 1;
            }
            Err(SourceError::Unavailable(reason)) => {
                tracing::debug!(source = source.name(), reason = %reason, "Snapshot unavailable, skipping tick");
                stats.unavailable += 1;
            }
        }
    }

    tracing::info!(
        ticks = stats.ticks,
        published = stats.published,
        unavailable = stats.unavailable,
        "Snapshot producer stopped"
    );
    stats
}
