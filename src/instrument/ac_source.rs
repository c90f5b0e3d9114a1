//! 6221-style AC current source driving the modulation coils.

use super::capabilities::{is_on, query_f64, ScpiEndpoint};
use crate::experiment::campaign::round1;
use anyhow::Result;
use log::info;
use std::sync::Arc;
use std::time::Duration;

/// Compliance voltage applied whenever the waveform is configured.
pub const COMPLIANCE_VOLTS: u32 = 105;

/// Command wrapper around the modulation current source.
#[derive(Clone)]
pub struct AcSource {
    endpoint: Arc<dyn ScpiEndpoint>,
    arm_delay: Duration,
}

impl AcSource {
    pub fn new(endpoint: Arc<dyn ScpiEndpoint>) -> Self {
        Self {
            endpoint,
            arm_delay: Duration::from_secs(1),
        }
    }

    /// Pause between arming and starting the waveform.
    pub fn with_arm_delay(mut self, delay: Duration) -> Self {
        self.arm_delay = delay;
        self
    }

    /// Configure waveform frequency and amplitude. The amplitude is given in mA.
    pub async fn configure(&self, frequency_hz: f64, amplitude_ma: f64) -> Result<()> {
        self.endpoint
            .write(&format!(":SOUR:WAVE:FREQ {frequency_hz}"))
            .await?;
        self.endpoint
            .write(&format!(":SOUR:CURR:COMP {COMPLIANCE_VOLTS}"))
            .await?;
        self.endpoint
            .write(&format!(":SOUR:WAVE:AMPL {}", amplitude_ma / 1000.0))
            .await
    }

    pub async fn frequency_hz(&self) -> Result<f64> {
        Ok(round1(query_f64(self.endpoint.as_ref(), ":SOUR:WAVE:FREQ?").await?))
    }

    /// Amplitude in mA rounded to 0.1.
    pub async fn amplitude_ma(&self) -> Result<f64> {
        Ok(round1(
            1000.0 * query_f64(self.endpoint.as_ref(), ":SOUR:WAVE:AMPL?").await?,
        ))
    }

    pub async fn output_enabled(&self) -> Result<bool> {
        Ok(is_on(&self.endpoint.query(":OUTP:STAT?").await?))
    }

    /// Start or stop the waveform. Returns the new state.
    pub async fn toggle_output(&self) -> Result<bool> {
        if self.output_enabled().await? {
            self.endpoint.write(":SOUR:WAVE:ABOR").await?;
            info!("AC modulation OFF");
            return Ok(false);
        }

        for command in [
            ":SOUR:WAVE:ABOR",
            ":SOUR:WAVE:OFFS 0",
            ":SOUR:WAVE:PMAR:STAT ON",
            // effectively infinite duration
            ":SOUR:WAVE:DUR:TIME +9.9E+037",
            ":SOUR:WAVE:ARM",
        ] {
            self.endpoint.write(command).await?;
        }
        tokio::time::sleep(self.arm_delay).await;
        self.endpoint.write(":SOUR:WAVE:INIT").await?;
        info!("AC modulation ON");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::ScriptedEndpoint;

    #[tokio::test]
    async fn configure_converts_milliamps() {
        let endpoint = Arc::new(ScriptedEndpoint::new());
        let ac = AcSource::new(endpoint.clone());
        ac.configure(573.1, 100.0).await.unwrap();
        assert_eq!(
            endpoint.writes(),
            vec![
                ":SOUR:WAVE:FREQ 573.1",
                ":SOUR:CURR:COMP 105",
                ":SOUR:WAVE:AMPL 0.1"
            ]
        );
    }

    #[tokio::test]
    async fn amplitude_readback_is_in_milliamps() {
        let endpoint =
            Arc::new(ScriptedEndpoint::new().respond(":SOUR:WAVE:AMPL?", "1.000000E-01\n"));
        assert_eq!(AcSource::new(endpoint).amplitude_ma().await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn toggle_on_arms_then_starts() {
        let endpoint = Arc::new(ScriptedEndpoint::new().respond(":OUTP:STAT?", "0\n"));
        let ac = AcSource::new(endpoint.clone()).with_arm_delay(Duration::ZERO);
        assert!(ac.toggle_output().await.unwrap());
        let writes = endpoint.writes();
        assert_eq!(writes.first().map(String::as_str), Some(":SOUR:WAVE:ABOR"));
        assert_eq!(writes.last().map(String::as_str), Some(":SOUR:WAVE:INIT"));
        assert_eq!(writes.len(), 6);
    }

    #[tokio::test]
    async fn toggle_off_only_aborts() {
        let endpoint = Arc::new(ScriptedEndpoint::new().respond(":OUTP:STAT?", "1\n"));
        let ac = AcSource::new(endpoint.clone());
        assert!(!ac.toggle_output().await.unwrap());
        assert_eq!(endpoint.writes(), vec![":SOUR:WAVE:ABOR"]);
    }
}
