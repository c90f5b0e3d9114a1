//! Capability traits for the instruments of an FMR rig.
//!
//! The campaign only ever talks to hardware through these traits. A PPMS
//! exposes both [`FieldControl`] and [`TemperatureControl`]; the lock-in, the
//! RF generator and the AC current source are all plain [`ScpiEndpoint`]s
//! wrapped by small command helpers in the sibling modules.
//!
//! Every call blocks (asynchronously) until the instrument has answered. The
//! `wait_for_*` calls block until the setpoint is stable and may take minutes.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Capability for magnets whose field can be set and read back.
#[async_trait]
pub trait FieldControl: Send + Sync {
    /// Start ramping to `gauss` at `rate_gauss_per_sec`; returns once the command is accepted.
    async fn set_field(&self, gauss: f64, rate_gauss_per_sec: f64) -> Result<()>;

    /// Current field in gauss.
    async fn field(&self) -> Result<f64>;

    /// Block until the field setpoint is reached or `timeout` expires.
    async fn wait_for_field(&self, timeout: Duration) -> Result<()>;
}

/// Capability for cryostats whose temperature can be set and read back.
#[async_trait]
pub trait TemperatureControl: Send + Sync {
    /// Start ramping to `kelvin` at `rate_k_per_min`.
    async fn set_temperature(&self, kelvin: f64, rate_k_per_min: f64) -> Result<()>;

    /// Current temperature in kelvin.
    async fn temperature(&self) -> Result<f64>;

    /// Block until the temperature is stable or `timeout` expires.
    async fn wait_for_temperature(&self, timeout: Duration) -> Result<()>;
}

/// Message-based instrument speaking SCPI-style text commands.
#[async_trait]
pub trait ScpiEndpoint: Send + Sync {
    /// Send a command without reading a response.
    async fn write(&self, command: &str) -> Result<()>;

    /// Send a command and return the raw response.
    async fn query(&self, command: &str) -> Result<String>;

    /// Query instrument identity (`*IDN?`).
    async fn identify(&self) -> Result<String> {
        Ok(self.query("*IDN?").await?.trim().to_string())
    }
}

/// Query `command` and parse the trimmed response as a number.
pub async fn query_f64(endpoint: &dyn ScpiEndpoint, command: &str) -> Result<f64> {
    let response = endpoint.query(command).await?;
    response
        .trim()
        .parse::<f64>()
        .with_context(|| format!("'{command}' returned non-numeric '{}'", response.trim()))
}

/// Query `command` and parse the trimmed response as an index.
pub async fn query_index(endpoint: &dyn ScpiEndpoint, command: &str) -> Result<usize> {
    let response = endpoint.query(command).await?;
    response
        .trim()
        .parse::<usize>()
        .map_err(|_| anyhow!("'{command}' returned '{}', expected an index", response.trim()))
}

/// Whether a `0`/`1` status response reports "on".
pub fn is_on(response: &str) -> bool {
    response.contains('1')
}
