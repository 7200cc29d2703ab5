// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Download progress reporting. The observer is injected from outside;
//! the store only computes the numbers.

use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct DownloadProgress {
    /// Bytes downloaded for the current blob.
    pub current: i64,
    /// Total bytes for the current blob, -1 when unknown.
    pub total: i64,
    /// 0-based index of the blob in flight.
    pub blob_index: i32,
    pub blob_count: i32,
    pub bytes_per_second: f64,
    /// -1 when unknown.
    pub eta_seconds: f64,
}

pub type ProgressFn = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

/// Exponential-moving-average download speed, α = 0.3, updated at most
/// every 100 ms.
pub struct SpeedTracker {
    ema: f64,
    last_update: Instant,
    last_bytes: i64,
}

const ALPHA: f64 = 0.3;
const MIN_INTERVAL: Duration = Duration::from_millis(100);

impl SpeedTracker {
    pub fn new() -> Self {
        SpeedTracker {
            ema: 0.0,
            last_update: Instant::now(),
            last_bytes: 0,
        }
    }

    /// Feed the running byte counter; returns the smoothed rate when the
    /// sample interval elapsed, `None` when it is too soon to update.
    pub fn update(&mut self, bytes: i64) -> Option<f64> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update);
        if elapsed < MIN_INTERVAL {
            return None;
        }
        let delta = (bytes - self.last_bytes).max(0) as f64;
        let instant_rate = delta / elapsed.as_secs_f64();
        self.ema = if self.ema == 0.0 {
            instant_rate
        } else {
            ALPHA * instant_rate + (1.0 - ALPHA) * self.ema
        };
        self.last_update = now;
        self.last_bytes = bytes;
        Some(self.ema)
    }

    pub fn rate(&self) -> f64 {
        self.ema
    }

    /// Estimated seconds remaining for the current blob, -1 if unknowable.
    pub fn eta(&self, current: i64, total: i64) -> f64 {
        if total <= 0 || self.ema <= 0.0 || current >= total {
            return -1.0;
        }
        (total - current) as f64 / self.ema
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}
