//! The set of instruments a campaign drives.

use super::ac_source::AcSource;
use super::capabilities::{FieldControl, TemperatureControl};
use super::lockin::{LockIn, LockInStatus};
use super::rf_source::RfSource;
use crate::error::{AppResult, DaqError, HardwareContext};
use crate::experiment::campaign::round1;
use log::info;
use serde::Serialize;
use std::sync::Arc;

/// Largest field magnitude accepted for a manual setpoint.
pub const MAX_FIELD_GAUSS: f64 = 15000.0;
/// Lowest temperature accepted for a manual setpoint.
pub const MIN_TEMPERATURE_K: f64 = 2.0;
/// Highest temperature accepted for a manual setpoint.
pub const MAX_TEMPERATURE_K: f64 = 310.0;

/// Field and temperature controllers plus the three SCPI instruments.
#[derive(Clone)]
pub struct Rig {
    pub field: Arc<dyn FieldControl>,
    pub temperature: Arc<dyn TemperatureControl>,
    pub lockin: LockIn,
    pub rf: RfSource,
    pub ac: AcSource,
}

/// Everything the front panel shows at once.
#[derive(Debug, Clone, Serialize)]
pub struct RigStatus {
    pub field_gauss: f64,
    pub temperature_k: f64,
    pub lockin: LockInStatus,
    pub rf_frequency_ghz: f64,
    pub rf_power_dbm: i64,
    pub rf_output: bool,
    pub ac_frequency_hz: f64,
    pub ac_amplitude_ma: f64,
    pub ac_output: bool,
}

impl Rig {
    /// Start a manual field ramp. The target is rounded to 0.1 G and must
    /// satisfy `|H| <= 15000 G`.
    pub async fn ramp_field(&self, gauss: f64, rate_gauss_per_sec: f64) -> AppResult<()> {
        let gauss = round1(gauss);
        if !gauss.is_finite() || gauss.abs() > MAX_FIELD_GAUSS {
            return Err(DaqError::Configuration(format!(
                "target field {gauss} G exceeds {MAX_FIELD_GAUSS} G"
            )));
        }
        info!("Manual field ramp to {gauss} G");
        self.field
            .set_field(gauss, rate_gauss_per_sec)
            .await
            .hardware("ramping field")
    }

    /// Start a manual temperature ramp. The target is rounded to 0.1 K and
    /// must lie within 2..=310 K.
    pub async fn ramp_temperature(&self, kelvin: f64, rate_k_per_min: f64) -> AppResult<()> {
        let kelvin = round1(kelvin);
        if !(MIN_TEMPERATURE_K..=MAX_TEMPERATURE_K).contains(&kelvin) {
            return Err(DaqError::Configuration(format!(
                "target temperature {kelvin} K is outside {MIN_TEMPERATURE_K}..{MAX_TEMPERATURE_K} K"
            )));
        }
        info!("Manual temperature ramp to {kelvin} K");
        self.temperature
            .set_temperature(kelvin, rate_k_per_min)
            .await
            .hardware("ramping temperature")
    }

    pub async fn status(&self) -> AppResult<RigStatus> {
        let field_gauss = round1(self.field.field().await.hardware("reading field")?);
        let temperature = self
            .temperature
            .temperature()
            .await
            .hardware("reading temperature")?;
        Ok(RigStatus {
            field_gauss,
            temperature_k: (temperature * 100.0).round() / 100.0,
            lockin: self.lockin.status().await.hardware("reading lock-in")?,
            rf_frequency_ghz: self.rf.frequency_ghz().await.hardware("reading RF frequency")?,
            rf_power_dbm: self.rf.power_dbm().await.hardware("reading RF power")?,
            rf_output: self.rf.output_enabled().await.hardware("reading RF output")?,
            ac_frequency_hz: self.ac.frequency_hz().await.hardware("reading AC frequency")?,
            ac_amplitude_ma: self.ac.amplitude_ma().await.hardware("reading AC amplitude")?,
            ac_output: self.ac.output_enabled().await.hardware("reading AC output")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::error::DaqError;
    use crate::instrument::mock::SimulatedRig;

    #[tokio::test]
    async fn manual_field_limit() {
        let sim = SimulatedRig::new(300.0, vec![(10.0, 2400.0)], 16.0);
        let err = sim.rig.ramp_field(15000.1, 100.0).await.unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert_eq!(sim.ppms.count_calls("set_field"), 0);

        sim.rig.ramp_field(-14999.96, 100.0).await.unwrap();
        assert_eq!(sim.ppms.current_field(), -15000.0);
    }

    #[tokio::test]
    async fn manual_temperature_limits() {
        let sim = SimulatedRig::new(300.0, vec![(10.0, 2400.0)], 16.0);
        assert!(sim.rig.ramp_temperature(1.9, 7.0).await.is_err());
        assert!(sim.rig.ramp_temperature(310.1, 7.0).await.is_err());
        sim.rig.ramp_temperature(2.0, 7.0).await.unwrap();
        assert_eq!(sim.ppms.count_calls("set_temperature"), 1);
    }

    #[tokio::test]
    async fn hardware_failure_is_attributed() {
        let sim = SimulatedRig::new(300.0, vec![(10.0, 2400.0)], 16.0);
        sim.ppms.inject_next_failure();
        let err = sim.rig.ramp_field(100.0, 100.0).await.unwrap_err();
        assert!(err.to_string().contains("ramping field"));
    }

    #[tokio::test]
    async fn status_collects_every_instrument() {
        let sim = SimulatedRig::new(300.0, vec![(10.0, 2400.0)], 16.0);
        sim.rig.ramp_field(2400.0, 100.0).await.unwrap();
        let status = sim.rig.status().await.unwrap();
        assert_eq!(status.field_gauss, 2400.0);
        assert_eq!(status.temperature_k, 300.0);
        assert_eq!(status.lockin.time_constant, "1ms");
        assert!(status.rf_output);
        assert_eq!(status.ac_amplitude_ma, 100.0);
    }
}
