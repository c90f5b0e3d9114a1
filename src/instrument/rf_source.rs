//! N5183-style RF signal generator commands.

use super::capabilities::{is_on, query_f64, ScpiEndpoint};
use crate::experiment::campaign::round1;
use anyhow::Result;
use log::info;
use std::sync::Arc;

/// Command wrapper around the microwave source.
#[derive(Clone)]
pub struct RfSource {
    endpoint: Arc<dyn ScpiEndpoint>,
}

impl RfSource {
    pub fn new(endpoint: Arc<dyn ScpiEndpoint>) -> Self {
        Self { endpoint }
    }

    /// Set the CW frequency, rounded to 0.1 GHz.
    pub async fn set_frequency_ghz(&self, ghz: f64) -> Result<()> {
        self.endpoint
            .write(&format!(":SOUR:FREQ:CW {}GHz", round1(ghz)))
            .await
    }

    /// Set the output power, rounded to 0.1 dBm.
    pub async fn set_power_dbm(&self, dbm: f64) -> Result<()> {
        self.endpoint.write(&format!("POW {}", round1(dbm))).await
    }

    /// Frequency as reported by the source, in GHz rounded to 0.1.
    pub async fn frequency_ghz(&self) -> Result<f64> {
        Ok(round1(query_f64(self.endpoint.as_ref(), "FREQ?").await? / 1e9))
    }

    /// Output power as reported by the source, rounded to whole dBm.
    pub async fn power_dbm(&self) -> Result<i64> {
        Ok(query_f64(self.endpoint.as_ref(), "POW?").await?.round() as i64)
    }

    pub async fn output_enabled(&self) -> Result<bool> {
        Ok(is_on(&self.endpoint.query(":OUTP?").await?))
    }

    /// Flip the RF output. Modulation is switched off first so the carrier
    /// comes out unmodulated. Returns the new state.
    pub async fn toggle_output(&self) -> Result<bool> {
        self.endpoint.write(":OUTP:MOD OFF").await?;
        let enable = !self.output_enabled().await?;
        self.endpoint
            .write(if enable { ":OUTP ON" } else { ":OUTP OFF" })
            .await?;
        info!("RF output {}", if enable { "ON" } else { "OFF" });
        Ok(enable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::ScriptedEndpoint;

    #[tokio::test]
    async fn frequency_command_is_rounded() {
        let endpoint = Arc::new(ScriptedEndpoint::new());
        let rf = RfSource::new(endpoint.clone());
        rf.set_frequency_ghz(19.04).await.unwrap();
        rf.set_frequency_ghz(20.0).await.unwrap();
        assert_eq!(
            endpoint.writes(),
            vec![":SOUR:FREQ:CW 19GHz", ":SOUR:FREQ:CW 20GHz"]
        );
    }

    #[tokio::test]
    async fn readback_is_converted() {
        let endpoint = Arc::new(
            ScriptedEndpoint::new()
                .respond("FREQ?", "+1.9000000000000E+10\n")
                .respond("POW?", "+1.2400000000000E+01\n"),
        );
        let rf = RfSource::new(endpoint);
        assert_eq!(rf.frequency_ghz().await.unwrap(), 19.0);
        assert_eq!(rf.power_dbm().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn toggle_switches_modulation_off_first() {
        let endpoint = Arc::new(ScriptedEndpoint::new().respond(":OUTP?", "0\n"));
        let rf = RfSource::new(endpoint.clone());
        assert!(rf.toggle_output().await.unwrap());
        assert_eq!(endpoint.writes(), vec![":OUTP:MOD OFF", ":OUTP ON"]);
    }
}
