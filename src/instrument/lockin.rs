//! SR830 lock-in amplifier commands.
//!
//! Sensitivity and time constant are addressed by index on the instrument
//! (`SENS`, `OFLT`). The tables below map those indices to labels and seconds.

use super::capabilities::{query_f64, query_index, ScpiEndpoint};
use anyhow::{anyhow, Result};
use log::debug;
use serde::Serialize;
use std::sync::Arc;

/// Sensitivity labels for `SENS` indices 0..=26.
pub const SENSITIVITY_LABELS: [&str; 27] = [
    "2nV", "5nV", "10nV", "20nV", "50nV", "100nV", "200nV", "500nV", "1uV", "2uV", "5uV", "10uV",
    "20uV", "50uV", "100uV", "200uV", "500uV", "1mV", "2mV", "5mV", "10mV", "20mV", "50mV",
    "100mV", "200mV", "500mV", "1V/uA",
];

/// Time constant labels for `OFLT` indices 0..=19.
pub const TIME_CONSTANT_LABELS: [&str; 20] = [
    "10us", "30us", "100us", "300us", "1ms", "3ms", "10ms", "30ms", "100ms", "300ms", "1s", "3s",
    "10s", "30s", "100s", "300s", "1ks", "3ks", "10ks", "30ks",
];

/// Time constants in seconds for `OFLT` indices 0..=19.
pub const TIME_CONSTANT_SECONDS: [f64; 20] = [
    10e-6, 30e-6, 100e-6, 300e-6, 1e-3, 3e-3, 10e-3, 30e-3, 100e-3, 300e-3, 1.0, 3.0, 10.0, 30.0,
    100.0, 300.0, 1e3, 3e3, 10e3, 30e3,
];

/// Snapshot of the lock-in front panel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockInStatus {
    pub x: f64,
    pub y: f64,
    pub reference_hz: f64,
    pub sensitivity: &'static str,
    pub time_constant: &'static str,
    pub time_constant_secs: f64,
}

/// Command wrapper around an SR830 endpoint.
#[derive(Clone)]
pub struct LockIn {
    endpoint: Arc<dyn ScpiEndpoint>,
}

impl LockIn {
    pub fn new(endpoint: Arc<dyn ScpiEndpoint>) -> Self {
        Self { endpoint }
    }

    /// One reading of the X and Y outputs.
    pub async fn read_xy(&self) -> Result<(f64, f64)> {
        let x = query_f64(self.endpoint.as_ref(), "OUTP? 1").await?;
        let y = query_f64(self.endpoint.as_ref(), "OUTP? 2").await?;
        Ok((x, y))
    }

    /// Reference (modulation) frequency in Hz.
    pub async fn reference_frequency(&self) -> Result<f64> {
        query_f64(self.endpoint.as_ref(), "FREQ?").await
    }

    pub async fn sensitivity_index(&self) -> Result<usize> {
        let index = query_index(self.endpoint.as_ref(), "SENS?").await?;
        checked(index, SENSITIVITY_LABELS.len(), "sensitivity")
    }

    pub async fn time_constant_index(&self) -> Result<usize> {
        let index = query_index(self.endpoint.as_ref(), "OFLT?").await?;
        checked(index, TIME_CONSTANT_SECONDS.len(), "time constant")
    }

    /// Current time constant in seconds.
    pub async fn time_constant_secs(&self) -> Result<f64> {
        Ok(TIME_CONSTANT_SECONDS[self.time_constant_index().await?])
    }

    /// Step the sensitivity one index up or down, clamped to the table. Returns the new index.
    pub async fn step_sensitivity(&self, up: bool) -> Result<usize> {
        let current = self.sensitivity_index().await?;
        let next = step(current, up, SENSITIVITY_LABELS.len() - 1);
        if next != current {
            self.endpoint.write(&format!("SENS {next}")).await?;
            debug!("Lock-in sensitivity {}", SENSITIVITY_LABELS[next]);
        }
        Ok(next)
    }

    /// Step the time constant one index up or down, clamped to the table. Returns the new index.
    pub async fn step_time_constant(&self, up: bool) -> Result<usize> {
        let current = self.time_constant_index().await?;
        let next = step(current, up, TIME_CONSTANT_SECONDS.len() - 1);
        if next != current {
            self.endpoint.write(&format!("OFLT {next}")).await?;
            debug!("Lock-in time constant {}", TIME_CONSTANT_LABELS[next]);
        }
        Ok(next)
    }

    pub async fn auto_phase(&self) -> Result<()> {
        self.endpoint.write("APHS").await
    }

    pub async fn status(&self) -> Result<LockInStatus> {
        let (x, y) = self.read_xy().await?;
        let reference_hz = self.reference_frequency().await?;
        let sensitivity = self.sensitivity_index().await?;
        let time_constant = self.time_constant_index().await?;
        Ok(LockInStatus {
            x,
            y,
            reference_hz,
            sensitivity: SENSITIVITY_LABELS[sensitivity],
            time_constant: TIME_CONSTANT_LABELS[time_constant],
            time_constant_secs: TIME_CONSTANT_SECONDS[time_constant],
        })
    }
}

fn checked(index: usize, len: usize, what: &str) -> Result<usize> {
    if index < len {
        Ok(index)
    } else {
        Err(anyhow!("lock-in reported {what} index {index}, expected < {len}"))
    }
}

fn step(current: usize, up: bool, max: usize) -> usize {
    if up {
        (current + 1).min(max)
    } else {
        current.saturating_sub(1)
    }
}
