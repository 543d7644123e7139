//! Router statistics
//!
//! Accumulates operation counts and store size deltas between stats ticks
//! and hands a [`StatsReport`] to the monitoring collaborator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::membership::NodeId;
use crate::store::StoreDelta;

/// Stats for one interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub timestamp: DateTime<Utc>,
    pub node: String,
    /// Operations received during the interval
    pub ops: u64,
    /// Approximate throughput; 0 when the interval is too short to measure
    pub ops_per_sec: f64,
    pub bytes_delta: i64,
    pub keys_delta: i64,
    pub interval_ms: u64,
}

/// Monitoring collaborator
#[async_trait]
pub trait Monitor: Send + Sync {
    async fn report(&self, report: StatsReport) -> Result<()>;
}

/// Monitor that writes each report as a JSON log line
#[derive(Debug, Default)]
pub struct LogMonitor;

#[async_trait]
impl Monitor for LogMonitor {
    async fn report(&self, report: StatsReport) -> Result<()> {
        let line = serde_json::to_string(&report).map_err(|e| Error::Internal(e.to_string()))?;
        tracing::info!(target: "wolfring::stats", "{}", line);
        Ok(())
    }
}

/// Intervals shorter than this report zero throughput
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Per-interval accumulator
#[derive(Debug)]
pub struct StatsCollector {
    node: String,
    ops: u64,
    delta: StoreDelta,
    last_tick: Instant,
}

impl StatsCollector {
    pub fn new(node: &NodeId) -> Self {
        Self {
            node: node.to_string(),
            ops: 0,
            delta: StoreDelta::default(),
            last_tick: Instant::now(),
        }
    }

    pub fn record_op(&mut self) {
        self.ops += 1;
    }

    pub fn record_delta(&mut self, delta: StoreDelta) {
        self.delta.merge(delta);
    }

    /// Close the current interval at `now` and start the next one
    pub fn tick(&mut self, now: Instant) -> StatsReport {
        let elapsed = now.saturating_duration_since(self.last_tick);
        let ops_per_sec = if elapsed < MIN_INTERVAL {
            0.0
        } else {
            self.ops as f64 / elapsed.as_secs_f64()
        };

        let report = StatsReport {
            timestamp: Utc::now(),
            node: self.node.clone(),
            ops: self.ops,
            ops_per_sec,
            bytes_delta: self.delta.bytes,
            keys_delta: self.delta.keys,
            interval_ms: elapsed.as_millis() as u64,
        };

        self.ops = 0;
        self.delta = StoreDelta::default();
        self.last_tick = now;
        report
    }
}
