//! One field point of an FMR sweep and how it is acquired.

pub mod sampler;

pub use sampler::{settle_delay, AcquisitionSampler, LockInAverage};

use serde::{Deserialize, Serialize};

/// A row of a measurement file.
///
/// Field names serialize to the column headers of the CSV output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    #[serde(rename = "Temp(K)")]
    pub temperature_k: f64,
    #[serde(rename = "RF Freq(GHz)")]
    pub frequency_ghz: f64,
    #[serde(rename = "Field(G)")]
    pub field_gauss: f64,
    #[serde(rename = "Lockin_X_Ave")]
    pub lockin_x: f64,
    #[serde(rename = "Lockin_Y_Ave")]
    pub lockin_y: f64,
    /// Lock-in time constant in seconds
    #[serde(rename = "TimeConst")]
    pub time_constant: f64,
}

/// Column headers, in file order.
pub const HEADER: [&str; 6] = [
    "Temp(K)",
    "RF Freq(GHz)",
    "Field(G)",
    "Lockin_X_Ave",
    "Lockin_Y_Ave",
    "TimeConst",
];
