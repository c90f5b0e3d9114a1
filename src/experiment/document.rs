//! Documents describing the progress of a campaign.
//!
//! The orchestrator publishes one document per milestone on a broadcast
//! channel. Displays and loggers subscribe; nobody has to listen.
//!
//! # Document Flow
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── TemperatureDoc (1 per temperature)
//!    │       │
//!    │       └── FrequencyDoc (1 per frequency)
//!    │               │
//!    │               ├── PointDoc (N, one per field)
//!    │               ├── RefreshDoc (every few points)
//!    │               └── SkipDoc (0 or 1)
//!    │
//! StopDoc (1)
//! ```

use crate::measurement::MeasurementRecord;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new unique run ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Everything a campaign reports, in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanDocument {
    /// Campaign accepted
    Start(StartDoc),
    /// Temperature step reached
    Temperature(TemperatureDoc),
    /// Frequency sweep started
    Frequency(FrequencyDoc),
    /// Field point measured
    Point(PointDoc),
    /// Plot refresh due
    Refresh(RefreshDoc),
    /// Frequency skipped
    Skip(SkipDoc),
    /// Campaign ended
    Stop(StopDoc),
}

impl ScanDocument {
    /// Get the run UID this document belongs to
    pub fn run_uid(&self) -> &str {
        match self {
            ScanDocument::Start(d) => &d.run_uid,
            ScanDocument::Temperature(d) => &d.run_uid,
            ScanDocument::Frequency(d) => &d.run_uid,
            ScanDocument::Point(d) => &d.run_uid,
            ScanDocument::Refresh(d) => &d.run_uid,
            ScanDocument::Skip(d) => &d.run_uid,
            ScanDocument::Stop(d) => &d.run_uid,
        }
    }

    /// Get the timestamp in nanoseconds
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            ScanDocument::Start(d) => d.time_ns,
            ScanDocument::Temperature(d) => d.time_ns,
            ScanDocument::Frequency(d) => d.time_ns,
            ScanDocument::Point(d) => d.time_ns,
            ScanDocument::Refresh(d) => d.time_ns,
            ScanDocument::Skip(d) => d.time_ns,
            ScanDocument::Stop(d) => d.time_ns,
        }
    }
}

/// Start document - what the campaign intends to do
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDoc {
    /// Run this document belongs to
    pub run_uid: String,
    /// Emission time, ns since the Unix epoch
    pub time_ns: u64,
    /// Sample being measured
    pub sample_id: String,
    /// Temperature setpoints in visiting order; empty means "current"
    pub temperatures: Vec<f64>,
    /// Frequencies in GHz, ascending
    pub frequencies: Vec<f64>,
}

impl StartDoc {
    /// Start document with no temperatures or frequencies yet.
    pub fn new(run_uid: &str, sample_id: &str) -> Self {
        Self {
            run_uid: run_uid.to_string(),
            time_ns: now_ns(),
            sample_id: sample_id.to_string(),
            temperatures: Vec::new(),
            frequencies: Vec::new(),
        }
    }

    /// Set the temperature setpoints.
    pub fn with_temperatures(mut self, temperatures: impl IntoIterator<Item = f64>) -> Self {
        self.temperatures = temperatures.into_iter().collect();
        self
    }

    /// Set the frequencies.
    pub fn with_frequencies(mut self, frequencies: impl IntoIterator<Item = f64>) -> Self {
        self.frequencies = frequencies.into_iter().collect();
        self
    }
}

/// The cryostat reached a temperature step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureDoc {
    /// Run this document belongs to
    pub run_uid: String,
    /// Emission time, ns since the Unix epoch
    pub time_ns: u64,
    /// Temperature read back, rounded to 0.1 K
    pub kelvin: f64,
    /// Whether a ramp and settle was needed
    pub ramped: bool,
}

/// A frequency sweep started writing to `path`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyDoc {
    /// Run this document belongs to
    pub run_uid: String,
    /// Emission time, ns since the Unix epoch
    pub time_ns: u64,
    /// RF frequency (GHz)
    pub frequency_ghz: f64,
    /// Expected resonance field including the shift (G)
    pub resonance_field: f64,
    /// Interpolated linewidth (G)
    pub linewidth: f64,
    /// Field points planned for the sweep
    pub points: usize,
    /// File the sweep writes to
    pub path: PathBuf,
}

/// One measured field point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointDoc {
    /// Run this document belongs to
    pub run_uid: String,
    /// Emission time, ns since the Unix epoch
    pub time_ns: u64,
    /// Index of the point within its frequency sweep
    pub seq_num: usize,
    /// Row written to the file
    pub record: MeasurementRecord,
}

/// Enough new points have been written to redraw `path`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshDoc {
    /// Run this document belongs to
    pub run_uid: String,
    /// Emission time, ns since the Unix epoch
    pub time_ns: u64,
    /// File to redraw
    pub path: PathBuf,
    /// Points written so far in this sweep
    pub points: usize,
}

/// The operator cut a frequency sweep short
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipDoc {
    /// Run this document belongs to
    pub run_uid: String,
    /// Emission time, ns since the Unix epoch
    pub time_ns: u64,
    /// RF frequency (GHz)
    pub frequency_ghz: f64,
    /// Points written before the skip took effect
    pub acquired: usize,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Ran to completion
    Success,
    /// Cancelled by the operator
    Abort,
    /// Stopped by an error
    Fail,
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDoc {
    /// Run this document belongs to
    pub run_uid: String,
    /// Emission time, ns since the Unix epoch
    pub time_ns: u64,
    /// How the run ended
    pub exit_status: ExitStatus,
    /// Reason for abort/failure
    pub reason: String,
    /// Total points written
    pub num_points: usize,
}

impl StopDoc {
    /// Completed run.
    pub fn success(run_uid: &str, num_points: usize) -> Self {
        Self::with_status(run_uid, ExitStatus::Success, "", num_points)
    }

    /// Cancelled run.
    pub fn abort(run_uid: &str, reason: &str, num_points: usize) -> Self {
        Self::with_status(run_uid, ExitStatus::Abort, reason, num_points)
    }

    /// Failed run.
    pub fn fail(run_uid: &str, reason: &str, num_points: usize) -> Self {
        Self::with_status(run_uid, ExitStatus::Fail, reason, num_points)
    }

    fn with_status(run_uid: &str, exit_status: ExitStatus, reason: &str, num_points: usize) -> Self {
        Self {
            run_uid: run_uid.to_string(),
            time_ns: now_ns(),
            exit_status,
            reason: reason.to_string(),
            num_points,
        }
    }
}
