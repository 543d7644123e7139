//! Round-trip estimation from Ping/Pong probes
//!
//! Smoothed average and mean deviation, updated per sample:
//! `var = (1-β)·var + β·|avg - s|`, `avg = (1-α)·avg + α·s`,
//! `RTO = avg + K·var`, floored at a configured minimum.

use std::time::Duration;

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;

/// Per-node RTT estimator
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Smoothed RTT in microseconds
    avg: Option<f64>,
    /// Mean deviation in microseconds
    var: f64,
    k: f64,
    min_rto: Duration,
}

impl RttEstimator {
    pub fn new(k: f64, min_rto: Duration) -> Self {
        Self {
            avg: None,
            var: 0.0,
            k,
            min_rto,
        }
    }

    /// Fold a new round-trip sample into the estimate
    pub fn sample(&mut self, rtt: Duration) {
        let s = rtt.as_micros() as f64;
        match self.avg {
            None => {
                self.avg = Some(s);
                self.var = s / 2.0;
            }
            Some(avg) => {
                self.var = (1.0 - BETA) * self.var + BETA * (avg - s).abs();
                self.avg = Some((1.0 - ALPHA) * avg + ALPHA * s);
            }
        }
    }

    /// Smoothed RTT, if any sample was taken
    pub fn average(&self) -> Option<Duration> {
        self.avg.map(|a| Duration::from_micros(a as u64))
    }

    /// Retransmission timeout
    pub fn rto(&self) -> Duration {
        match self.avg {
            Some(avg) => {
                let rto = Duration::from_micros((avg + self.k * self.var) as u64);
                rto.max(self.min_rto)
            }
            None => self.min_rto,
        }
    }
}
