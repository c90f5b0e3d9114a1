//! Layered configuration using Figment
//!
//! Configuration is assembled from, in increasing order of precedence:
//! 1. Built-in defaults (the values the rig is usually run with)
//! 2. A TOML file (`config/fmr_daq.toml` unless another path is given)
//! 3. Environment variables prefixed with `FMR_DAQ_`, using `__` between sections
//!
//! ```text
//! FMR_DAQ_APPLICATION__LOG_LEVEL=debug
//! FMR_DAQ_STORAGE__SAMPLE_ID=YIG35
//! FMR_DAQ_CAMPAIGN__RESONANCES="10: 2400, 12: 3050"
//! ```
//!
//! The `[campaign]` section holds the free-text campaign input exactly as an
//! operator types it; it is parsed and validated by
//! [`CampaignConfig::parse`](crate::experiment::campaign::CampaignConfig::parse).

use crate::error::{AppResult, DaqError};
use crate::experiment::plans::Spacing;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/fmr_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Output location and sample naming
    #[serde(default)]
    pub storage: StorageConfig,
    /// Instrument addresses
    #[serde(default)]
    pub instruments: InstrumentConfig,
    /// Ramp rates, settle timeouts and acquisition timing
    #[serde(default)]
    pub scan: ScanTiming,
    /// Free-text campaign input
    #[serde(default)]
    pub campaign: CampaignInput,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "PPMS FMR Measurement".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Where CSV files go and how they are named.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory; files land in `{output_dir}/{sample_id}/`
    pub output_dir: PathBuf,
    /// Sample identifier used as directory and file name prefix
    pub sample_id: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("FMR_Data"),
            sample_id: "Test".to_string(),
        }
    }
}

impl StorageConfig {
    /// Directory holding every file of the current sample.
    pub fn sample_dir(&self) -> PathBuf {
        self.output_dir.join(&self.sample_id)
    }
}

/// VISA resource strings of the SCPI instruments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// SR830 lock-in amplifier
    pub lockin: String,
    /// N5183 RF signal generator
    pub rf_source: String,
    /// 6221 AC current source used for field modulation
    pub ac_source: String,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            lockin: "GPIB0::8::INSTR".to_string(),
            rf_source: "GPIB0::11::INSTR".to_string(),
            ac_source: "GPIB0::27::INSTR".to_string(),
        }
    }
}

/// Timing and rate parameters of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTiming {
    /// Field ramp rate in gauss per second
    pub field_rate_gauss_per_sec: f64,
    /// Temperature ramp rate in kelvin per minute
    pub temperature_rate_k_per_min: f64,
    /// Timeout for the first field of every frequency to settle
    pub field_settle_timeout_secs: u64,
    /// Timeout for a temperature step to settle
    pub temperature_settle_timeout_secs: u64,
    /// Pause between two frequencies
    pub inter_frequency_delay_ms: u64,
    /// Lock-in readings averaged per field point
    pub samples_per_point: usize,
    /// Spacing between two lock-in readings
    pub sample_interval_ms: u64,
    /// Settle delay per point, in lock-in time constants
    pub settle_time_constants: f64,
    /// Emit a display refresh every this many points
    pub refresh_every: usize,
}

impl Default for ScanTiming {
    fn default() -> Self {
        Self {
            field_rate_gauss_per_sec: 100.0,
            temperature_rate_k_per_min: 20.0,
            field_settle_timeout_secs: 240,
            temperature_settle_timeout_secs: 5400,
            inter_frequency_delay_ms: 2000,
            samples_per_point: 5,
            sample_interval_ms: 100,
            settle_time_constants: 5.0,
            refresh_every: 2,
        }
    }
}

impl ScanTiming {
    /// Field settle timeout as a `Duration`.
    pub fn field_settle_timeout(&self) -> Duration {
        Duration::from_secs(self.field_settle_timeout_secs)
    }

    /// Temperature settle timeout as a `Duration`.
    pub fn temperature_settle_timeout(&self) -> Duration {
        Duration::from_secs(self.temperature_settle_timeout_secs)
    }

    /// Pause between frequencies as a `Duration`.
    pub fn inter_frequency_delay(&self) -> Duration {
        Duration::from_millis(self.inter_frequency_delay_ms)
    }

    /// Spacing between lock-in readings as a `Duration`.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// Campaign parameters as typed by the operator.
///
/// Everything is kept as text so that a typo is reported as a
/// [`DaqError::Configuration`] by the campaign parser rather than as an opaque
/// deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignInput {
    /// Temperature to field-shift pairs, `"T1: S1, T2: S2"`. Empty means "current temperature".
    pub temperatures: String,
    /// Frequency (GHz) to resonance field (G) pairs, `"F1: H1, F2: H2"`
    pub resonances: String,
    /// Peak-to-peak linewidth at the lowest frequency (G)
    pub linewidth_low: String,
    /// Peak-to-peak linewidth at the highest frequency (G)
    pub linewidth_high: String,
    /// Fixed field step (G); empty or zero derives it from the linewidth
    pub field_step: String,
    /// Field shift used when no temperature list is given
    pub field_shift: String,
    /// Field spacing strategy
    pub spacing: Spacing,
    /// Start with descending fields and frequencies
    pub reverse: bool,
}

impl Default for CampaignInput {
    fn default() -> Self {
        Self {
            temperatures: "21: 3, 22: 4".to_string(),
            resonances: "19: 6000, 20: 6001".to_string(),
            linewidth_low: "4".to_string(),
            linewidth_high: "5".to_string(),
            field_step: String::new(),
            field_shift: "0".to_string(),
            spacing: Spacing::default(),
            reverse: false,
        }
    }
}

impl Settings {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path; a missing file leaves the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FMR_DAQ_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate values that deserialize fine but cannot drive a campaign.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.storage.sample_id.trim().is_empty() {
            return Err(DaqError::Configuration(
                "storage.sample_id cannot be empty".to_string(),
            ));
        }

        let scan = &self.scan;
        if !(scan.field_rate_gauss_per_sec.is_finite() && scan.field_rate_gauss_per_sec > 0.0) {
            return Err(DaqError::Configuration(format!(
                "scan.field_rate_gauss_per_sec must be > 0, got {}",
                scan.field_rate_gauss_per_sec
            )));
        }
        if !(scan.temperature_rate_k_per_min.is_finite() && scan.temperature_rate_k_per_min > 0.0)
        {
            return Err(DaqError::Configuration(format!(
                "scan.temperature_rate_k_per_min must be > 0, got {}",
                scan.temperature_rate_k_per_min
            )));
        }
        if scan.samples_per_point == 0 {
            return Err(DaqError::Configuration(
                "scan.samples_per_point must be > 0".to_string(),
            ));
        }
        if !(scan.settle_time_constants.is_finite() && scan.settle_time_constants >= 0.0) {
            return Err(DaqError::Configuration(format!(
                "scan.settle_time_constants must be finite and >= 0, got {}",
                scan.settle_time_constants
            )));
        }
        if scan.refresh_every == 0 {
            return Err(DaqError::Configuration(
                "scan.refresh_every must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.scan.samples_per_point, 5);
        assert_eq!(settings.scan.sample_interval(), Duration::from_millis(100));
        assert_eq!(settings.instruments.lockin, "GPIB0::8::INSTR");
    }

    #[test]
    fn missing_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.storage.sample_id, "Test");
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[storage]
output_dir = "/data/fmr"
sample_id = "LSC313"

[scan]
field_rate_gauss_per_sec = 50.0
temperature_rate_k_per_min = 7.0
field_settle_timeout_secs = 240
temperature_settle_timeout_secs = 7200
inter_frequency_delay_ms = 2000
samples_per_point = 5
sample_interval_ms = 100
settle_time_constants = 5.0
refresh_every = 2

[campaign]
temperatures = ""
resonances = "10: 2400"
linewidth_low = "12"
linewidth_high = "12"
field_step = ""
field_shift = "0"
spacing = "equal"
reverse = true
"#
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.storage.sample_dir(), PathBuf::from("/data/fmr/LSC313"));
        assert_eq!(settings.scan.field_rate_gauss_per_sec, 50.0);
        assert_eq!(settings.campaign.spacing, Spacing::Equal);
        assert!(settings.campaign.reverse);
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let mut settings = Settings::default();
        settings.application.log_level = "chatty".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn zero_samples_is_rejected() {
        let mut settings = Settings::default();
        settings.scan.samples_per_point = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn infinite_settle_multiplier_is_rejected() {
        let mut settings = Settings::default();
        settings.scan.settle_time_constants = f64::INFINITY;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("settle_time_constants"));

        settings.scan.settle_time_constants = f64::NAN;
        assert!(settings.validate().is_err());

        settings.scan.settle_time_constants = 0.0;
        settings.validate().unwrap();
    }
}
