//! Status aggregation: per-job speed/eta and the moving-average total.

use crate::engine::tunables::LONG_TIME;
use crate::engine::types::{human_eta, human_size, StatusSnapshot};
use std::collections::VecDeque;
use std::time::Duration;

/// Fixed-size moving average over the most recent speed samples, including
/// the current one. Averages over however many samples have been recorded
/// so far once fewer than the capacity are available.
pub struct MovingAverage {
    samples: VecDeque<f64>,
    cap: usize,
}

impl MovingAverage {
    pub fn new(cap: usize) -> Self {
        Self { samples: VecDeque::with_capacity(cap), cap: cap.max(1) }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

/// Bytes per second for one job between two ticks.
pub fn job_speed(received: u64, last_received: u64, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        return 0.0;
    }
    (received.saturating_sub(last_received)) as f64 / elapsed.as_secs_f64()
}

/// Remaining time for one job at its current speed.
pub fn job_eta(length: u64, received: u64, speed: f64) -> Duration {
    if speed <= 0.0 {
        return LONG_TIME;
    }
    let remaining = length.saturating_sub(received) as f64;
    Duration::from_secs_f64((remaining / speed).max(0.0))
}

/// Builds the externally visible status snapshot for one tick.
#[allow(clippy::too_many_arguments)]
pub fn build_snapshot(
    id: i64,
    rebuilding: bool,
    avg_speed: f64,
    written: u64,
    total_length: i64,
    conns: usize,
    eta: Duration,
) -> StatusSnapshot {
    let percent = if total_length > 0 {
        (written as f64 / total_length as f64) * 100.0
    } else {
        0.0
    };
    StatusSnapshot {
        id,
        rebuilding,
        speed: format!("{}/s", human_size(avg_speed)),
        written: human_size(written as f64),
        percent,
        conns,
        eta: human_eta(eta),
    }
}
