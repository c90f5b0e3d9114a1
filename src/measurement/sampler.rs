//! Averaged lock-in acquisition at a single field point.

use crate::config::ScanTiming;
use crate::instrument::LockIn;
use anyhow::Result;
use std::time::Duration;

/// Mean of the X and Y outputs over one acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockInAverage {
    /// In-phase output (V)
    pub x: f64,
    /// Quadrature output (V)
    pub y: f64,
}

/// Wait time before sampling: `multiplier` time constants, rounded to 0.01 s.
pub fn settle_delay(time_constant_secs: f64, multiplier: f64) -> Duration {
    let secs = (time_constant_secs * multiplier * 100.0).round() / 100.0;
    Duration::from_secs_f64(secs.max(0.0))
}

/// Takes a fixed number of lock-in readings and averages them.
pub struct AcquisitionSampler {
    lockin: LockIn,
    samples: usize,
    interval: Duration,
}

impl AcquisitionSampler {
    /// Sampler taking at least one reading per point.
    pub fn new(lockin: LockIn, samples: usize, interval: Duration) -> Self {
        Self {
            lockin,
            samples: samples.max(1),
            interval,
        }
    }

    /// Sampler configured from the scan timing settings.
    pub fn from_timing(lockin: LockIn, timing: &ScanTiming) -> Self {
        Self::new(lockin, timing.samples_per_point, timing.sample_interval())
    }

    /// Wait `settle`, then read X and Y `samples` times, pausing `interval`
    /// before each reading. Every reading contributes to the mean.
    pub async fn sample(&self, settle: Duration) -> Result<LockInAverage> {
        tokio::time::sleep(settle).await;
        let (mut sum_x, mut sum_y) = (0.0, 0.0);
        for _ in 0..self.samples {
            tokio::time::sleep(self.interval).await;
            let (x, y) = self.lockin.read_xy().await?;
            sum_x += x;
            sum_y += y;
        }
        let n = self.samples as f64;
        Ok(LockInAverage {
            x: sum_x / n,
            y: sum_y / n,
        })
    }
}
