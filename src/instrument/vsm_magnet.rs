//! VSM electromagnet driven through its hex-word controller.
//!
//! Setting a field selects the high-field range and ramp mode, programs the
//! ramp rate (`CONTR`) and target (`CONTO`), then waits for the controller to
//! report stable (`CONST?` returning 2 three times in a row). When a
//! gaussmeter is attached the residual error is measured and the target is
//! over-set by that error once.

use super::capabilities::{FieldControl, ScpiEndpoint};
use super::hex_codec;
use crate::experiment::campaign::round1;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Consecutive "stable" readings required before a field counts as settled.
const STABLE_READINGS: usize = 3;
const STABLE_CODE: u32 = 2;

/// Electromagnet controller plus optional Hall probe.
pub struct VsmMagnet {
    controller: Arc<dyn ScpiEndpoint>,
    gaussmeter: Option<Arc<dyn ScpiEndpoint>>,
    poll_interval: Duration,
    target: Mutex<Option<f64>>,
}

impl VsmMagnet {
    pub fn new(controller: Arc<dyn ScpiEndpoint>) -> Self {
        Self {
            controller,
            gaussmeter: None,
            poll_interval: Duration::from_millis(500),
            target: Mutex::new(None),
        }
    }

    /// Read the field from a gaussmeter and use it for overshoot correction.
    pub fn with_gaussmeter(mut self, gaussmeter: Arc<dyn ScpiEndpoint>) -> Self {
        self.gaussmeter = Some(gaussmeter);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn command_target(&self, gauss: f64) -> Result<()> {
        self.controller
            .write(&format!("CONTO {}", hex_codec::encode(gauss)?))
            .await
    }

    async fn wait_stable(&self) -> Result<()> {
        let mut streak = 0;
        loop {
            let response = self.controller.query("CONST?").await?;
            let code = response
                .trim()
                .chars()
                .next()
                .and_then(|c| c.to_digit(10))
                .ok_or_else(|| anyhow!("CONST? returned '{}'", response.trim()))?;
            streak = if code == STABLE_CODE { streak + 1 } else { 0 };
            if streak == STABLE_READINGS {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn settle(&self) -> Result<()> {
        self.wait_stable().await?;

        let target = *self
            .target
            .lock()
            .map_err(|_| anyhow!("magnet target lock poisoned"))?;
        if let (Some(target), Some(gaussmeter)) = (target, &self.gaussmeter) {
            let measured = read_gaussmeter(gaussmeter.as_ref()).await?;
            let corrected = target + (target - measured);
            debug!("Field {measured} G for target {target} G, over-setting to {corrected} G");
            self.command_target(corrected).await?;
            self.wait_stable().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FieldControl for VsmMagnet {
    async fn set_field(&self, gauss: f64, rate_gauss_per_sec: f64) -> Result<()> {
        let rate = hex_codec::encode(rate_gauss_per_sec)?;
        self.controller.write("RANGE 0 ").await?;
        self.controller.write("CMODE 2 ").await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.controller.write(&format!("CONTR {rate}")).await?;
        self.command_target(gauss).await?;
        *self
            .target
            .lock()
            .map_err(|_| anyhow!("magnet target lock poisoned"))? = Some(gauss);
        info!("Magnet ramping to {gauss} G at {rate_gauss_per_sec} G/s");
        Ok(())
    }

    async fn field(&self) -> Result<f64> {
        match &self.gaussmeter {
            Some(gaussmeter) => read_gaussmeter(gaussmeter.as_ref()).await,
            None => read_controller_field(self.controller.as_ref()).await,
        }
    }

    async fn wait_for_field(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.settle())
            .await
            .map_err(|_| anyhow!("field not stable after {timeout:?}"))?
    }
}

/// `RDGFIELD?` answers a number followed by a two-character unit suffix.
async fn read_gaussmeter(gaussmeter: &dyn ScpiEndpoint) -> Result<f64> {
    let response = gaussmeter.query("RDGFIELD?").await?;
    let trimmed = response.trim_end_matches(['\r', '\n']);
    let number = trimmed
        .get(..trimmed.len().saturating_sub(2))
        .unwrap_or_default()
        .trim();
    let value: f64 = number
        .parse()
        .with_context(|| format!("RDGFIELD? returned '{trimmed}'"))?;
    Ok(round1(value))
}

/// The field word sits at characters 18..26 of the `READ?` response.
async fn read_controller_field(controller: &dyn ScpiEndpoint) -> Result<f64> {
    let response = controller.query("READ?").await?;
    match response.get(18..26) {
        Some(word) => hex_codec::decode(word),
        None => bail!("READ? response too short: '{}'", response.trim()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::ScriptedEndpoint;

    fn stable_controller() -> Arc<ScriptedEndpoint> {
        Arc::new(ScriptedEndpoint::new().respond("CONST?", "2\n"))
    }

    #[tokio::test]
    async fn set_field_programs_rate_then_target() {
        let controller = stable_controller();
        let magnet = VsmMagnet::new(controller.clone());
        magnet.set_field(1000.0, 4.0).await.unwrap();
        assert_eq!(
            controller.writes(),
            vec!["RANGE 0 ", "CMODE 2 ", "CONTR 03800000", "CONTO 0AFA0000"]
        );
    }

    #[tokio::test]
    async fn out_of_range_target_sends_nothing() {
        let controller = stable_controller();
        let magnet = VsmMagnet::new(controller.clone());
        assert!(magnet.set_field(50000.0, 4.0).await.is_err());
        assert!(controller.writes().is_empty());
    }

    #[tokio::test]
    async fn stable_needs_three_in_a_row() {
        let controller = Arc::new(
            ScriptedEndpoint::new()
                .respond_sequence("CONST?", ["2\n", "1\n", "2\n", "2\n", "2\n"]),
        );
        let magnet = VsmMagnet::new(controller.clone()).with_poll_interval(Duration::ZERO);
        magnet
            .wait_for_field(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(controller.queries().len(), 5);
    }

    #[tokio::test]
    async fn unstable_field_times_out() {
        let controller = Arc::new(ScriptedEndpoint::new().respond("CONST?", "1\n"));
        let magnet =
            VsmMagnet::new(controller).with_poll_interval(Duration::from_millis(5));
        let err = magnet
            .wait_for_field(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not stable"));
    }

    #[tokio::test]
    async fn gaussmeter_error_is_corrected_once() {
        let controller = stable_controller();
        let gaussmeter = Arc::new(ScriptedEndpoint::new().respond("RDGFIELD?", "996.0 G\r\n"));
        let magnet = VsmMagnet::new(controller.clone())
            .with_gaussmeter(gaussmeter)
            .with_poll_interval(Duration::ZERO);
        magnet.set_field(1000.0, 4.0).await.unwrap();
        magnet
            .wait_for_field(Duration::from_secs(1))
            .await
            .unwrap();
        let writes = controller.writes();
        assert_eq!(
            writes.last().map(String::as_str),
            Some(format!("CONTO {}", hex_codec::encode(1004.0).unwrap()).as_str())
        );
        assert_eq!(magnet.field().await.unwrap(), 996.0);
    }

    #[tokio::test]
    async fn controller_readback_decodes_word() {
        let response = format!("{}0afa0000{}", "0".repeat(18), "00\n");
        let controller = Arc::new(ScriptedEndpoint::new().respond("READ?", &response));
        let magnet = VsmMagnet::new(controller);
        assert_eq!(magnet.field().await.unwrap(), 1000.0);
    }
}
