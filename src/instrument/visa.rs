//! VISA transport for the SCPI instruments (GPIB, USB, LAN).
//!
//! VISA calls block, so every write and query runs on the blocking thread
//! pool. Resource strings look like `GPIB0::8::INSTR`.

use super::capabilities::ScpiEndpoint;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use std::sync::{Arc, Mutex};
use visa_rs::prelude::*;

/// An open VISA session.
pub struct VisaEndpoint {
    resource: String,
    session: Arc<Mutex<Instrument>>,
}

impl VisaEndpoint {
    /// Open `resource` and log its identity.
    pub async fn open(resource: &str) -> Result<Self> {
        let resource_name = resource.to_string();
        let session = tokio::task::spawn_blocking(move || -> Result<Instrument> {
            let rm = DefaultRM::new().context("Failed to create VISA resource manager")?;
            let c_string =
                CString::new(resource_name.as_str()).context("Failed to create CString")?;
            rm.open(&c_string.into(), AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                .with_context(|| format!("Failed to open VISA resource {resource_name}"))
        })
        .await
        .context("VISA open task panicked")??;

        let endpoint = Self {
            resource: resource.to_string(),
            session: Arc::new(Mutex::new(session)),
        };
        let identity = endpoint.identify().await?;
        info!("{resource}: {identity}");
        Ok(endpoint)
    }

    async fn transact(&self, command: &str, read_reply: bool) -> Result<String> {
        let session = self.session.clone();
        let line = format!("{command}\n");
        let resource = self.resource.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || {
            let instrument = session
                .lock()
                .map_err(|_| anyhow!("VISA session for {resource} poisoned"))?;
            (&*instrument)
                .write_all(line.as_bytes())
                .with_context(|| format!("VISA write '{command}' to {resource} failed"))?;
            if !read_reply {
                debug!("{resource} <- {command}");
                return Ok(String::new());
            }
            let mut reply = String::new();
            BufReader::new(&*instrument)
                .read_line(&mut reply)
                .with_context(|| format!("VISA read after '{command}' from {resource} failed"))?;
            debug!("{resource} {command} -> {}", reply.trim());
            Ok(reply)
        })
        .await
        .context("VISA I/O task panicked")?
    }
}

#[async_trait]
impl ScpiEndpoint for VisaEndpoint {
    async fn write(&self, command: &str) -> Result<()> {
        self.transact(command, false).await.map(|_| ())
    }

    async fn query(&self, command: &str) -> Result<String> {
        self.transact(command, true).await
    }
}
