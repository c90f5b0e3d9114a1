//! Campaign execution.
//!
//! [`ScanOrchestrator`] is the operator-side handle: it validates a campaign,
//! spawns one background worker for it and relays abort/skip requests. The
//! worker walks temperatures, then frequencies, then fields:
//!
//! ```text
//! Idle ──start──▶ Running ──(all points | abort | error)──▶ Idle
//!                   │  ▲
//!                   └──┘ one field point
//! ```
//!
//! Abort and skip are polled before every field move, so an instrument call
//! already in flight is the only work that cannot be interrupted. Rows are
//! flushed one by one and are never rolled back.

use super::campaign::{round1, CampaignConfig, TemperatureStep};
use super::control::{ScanControl, ScanPhase, ScanState, ScanStatus};
use super::document::{
    new_uid, now_ns, FrequencyDoc, PointDoc, RefreshDoc, ScanDocument, SkipDoc, StartDoc, StopDoc,
    TemperatureDoc,
};
use super::plans::FrequencySweep;
use crate::config::{Settings, StorageConfig};
use crate::data::storage::{storage_error, CsvResultWriter, ResultWriter, RunTag};
use crate::error::{AppResult, DaqError, HardwareContext};
use crate::instrument::Rig;
use crate::measurement::{settle_delay, AcquisitionSampler, MeasurementRecord};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// How a campaign that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignOutcome {
    /// Every temperature and frequency was visited
    Completed,
    /// The operator cancelled the campaign
    Aborted,
}

/// Result of a finished campaign.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignSummary {
    /// UID shared by every document of the run
    pub run_uid: String,
    /// How the campaign ended
    pub outcome: CampaignOutcome,
    /// Rows written across all files
    pub points_written: usize,
    /// Every file written, in order
    pub files: Vec<PathBuf>,
}

type WriterFactory = Box<dyn Fn(&StorageConfig) -> Box<dyn ResultWriter> + Send + Sync>;

/// Starts campaigns on a background task and relays operator requests.
pub struct ScanOrchestrator {
    rig: Rig,
    settings: Arc<Settings>,
    state: ScanState,
    documents: broadcast::Sender<ScanDocument>,
    writer_factory: WriterFactory,
    worker: Option<JoinHandle<AppResult<CampaignSummary>>>,
}

impl ScanOrchestrator {
    /// Orchestrator driving `rig` with CSV output per `settings`.
    pub fn new(rig: Rig, settings: Arc<Settings>) -> Self {
        let (documents, _) = broadcast::channel(1024);
        Self {
            rig,
            settings,
            state: ScanState::new(),
            documents,
            writer_factory: Box::new(|storage: &StorageConfig| {
                Box::new(CsvResultWriter::new(storage.sample_dir())) as Box<dyn ResultWriter>
            }),
            worker: None,
        }
    }

    /// Replace the CSV writer used for new campaigns.
    pub fn with_writer<F>(mut self, factory: F) -> Self
    where
        F: Fn(&StorageConfig) -> Box<dyn ResultWriter> + Send + Sync + 'static,
    {
        self.writer_factory = Box::new(factory);
        self
    }

    /// Token shared with the worker; cancelling it aborts the campaign.
    pub fn control(&self) -> ScanControl {
        self.state.control().clone()
    }

    /// Whether a campaign worker is still alive.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Validate `campaign` and start it in the background. Returns the run UID.
    ///
    /// Input and plan errors are reported here, before anything moves.
    pub fn start(&mut self, campaign: CampaignConfig) -> AppResult<String> {
        if self.is_running() {
            return Err(DaqError::AlreadyRunning);
        }
        campaign.validate_plans()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DaqError::Runtime(e.to_string()))?;

        let run_uid = new_uid();
        self.state.begin();
        let worker = CampaignWorker {
            run_uid: run_uid.clone(),
            sampler: AcquisitionSampler::from_timing(self.rig.lockin.clone(), &self.settings.scan),
            rig: self.rig.clone(),
            settings: self.settings.clone(),
            campaign,
            state: self.state.clone(),
            documents: self.documents.clone(),
            writer: (self.writer_factory)(&self.settings.storage),
            points_written: 0,
            files: Vec::new(),
        };
        info!("Starting campaign {run_uid}");
        self.worker = Some(runtime.spawn(worker.run()));
        Ok(run_uid)
    }

    /// Stop the campaign before its next field point.
    pub fn abort(&self) {
        if self.is_running() {
            info!("Abort requested");
            self.state.control().cancel();
        }
    }

    /// End the current frequency before its next field point.
    pub fn skip_frequency(&self) {
        if self.is_running() {
            info!("Skip of the current frequency requested");
            self.state.control().request_skip();
        } else {
            debug!("Skip ignored, no campaign running");
        }
    }

    /// Receiver for the live status snapshot.
    pub fn status(&self) -> watch::Receiver<ScanStatus> {
        self.state.subscribe()
    }

    /// Receiver for the documents of every later campaign.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanDocument> {
        self.documents.subscribe()
    }

    /// Wait for the current campaign to end.
    pub async fn wait(&mut self) -> AppResult<CampaignSummary> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| DaqError::Runtime("no campaign has been started".to_string()))?;
        worker
            .await
            .map_err(|e| DaqError::Runtime(format!("campaign task failed: {e}")))?
    }
}

enum SweepEnd {
    Completed,
    Skipped,
    Aborted,
}

struct CampaignWorker {
    run_uid: String,
    rig: Rig,
    settings: Arc<Settings>,
    campaign: CampaignConfig,
    state: ScanState,
    documents: broadcast::Sender<ScanDocument>,
    writer: Box<dyn ResultWriter>,
    sampler: AcquisitionSampler,
    points_written: usize,
    files: Vec<PathBuf>,
}

impl CampaignWorker {
    async fn run(mut self) -> AppResult<CampaignSummary> {
        let result = self.run_campaign().await;
        if let Err(err) = self.writer.finish().await {
            warn!("Closing the last measurement file failed: {err:#}");
        }
        self.state.end();

        match result {
            Ok(outcome) => {
                let stop = match outcome {
                    CampaignOutcome::Completed => {
                        info!(
                            "Campaign {} completed, {} points",
                            self.run_uid, self.points_written
                        );
                        StopDoc::success(&self.run_uid, self.points_written)
                    }
                    CampaignOutcome::Aborted => {
                        warn!(
                            "Campaign {} aborted after {} points",
                            self.run_uid, self.points_written
                        );
                        StopDoc::abort(&self.run_uid, "aborted by operator", self.points_written)
                    }
                };
                self.publish(ScanDocument::Stop(stop));
                Ok(CampaignSummary {
                    run_uid: self.run_uid,
                    outcome,
                    points_written: self.points_written,
                    files: self.files,
                })
            }
            Err(err) => {
                error!("Campaign {} failed: {err}", self.run_uid);
                self.publish(ScanDocument::Stop(StopDoc::fail(
                    &self.run_uid,
                    &err.to_string(),
                    self.points_written,
                )));
                Err(err)
            }
        }
    }

    /// Documents are informational; nobody listening is fine.
    fn publish(&self, document: ScanDocument) {
        let _ = self.documents.send(document);
    }

    fn control(&self) -> &ScanControl {
        self.state.control()
    }

    async fn run_campaign(&mut self) -> AppResult<CampaignOutcome> {
        let steps = if self.campaign.temperatures.is_empty() {
            let current = self.read_temperature().await?;
            info!("No temperature list, measuring at the current {current} K");
            vec![TemperatureStep {
                kelvin: current,
                field_shift: self.campaign.default_shift,
            }]
        } else {
            self.campaign.temperatures.clone()
        };

        self.publish(ScanDocument::Start(
            StartDoc::new(&self.run_uid, &self.settings.storage.sample_id)
                .with_temperatures(steps.iter().map(|step| step.kelvin))
                .with_frequencies(
                    self.campaign
                        .resonances
                        .points()
                        .iter()
                        .map(|point| point.frequency_ghz),
                ),
        ));

        for (index, step) in steps.iter().enumerate() {
            if self.control().is_cancelled() {
                return Ok(CampaignOutcome::Aborted);
            }
            let temperature = self.settle_temperature(step.kelvin).await?;
            let reverse = self.campaign.reverse_at(index);
            let plan = self.campaign.field_plan(step.field_shift, reverse)?;
            info!(
                "{temperature} K: {} frequencies, {} points, shift {} G{}",
                plan.sweeps().count(),
                plan.total_points(),
                step.field_shift,
                if reverse { ", reversed" } else { "" }
            );
            let tag = self.run_tag(temperature).await?;

            for sweep in plan.into_sweeps() {
                if self.control().is_cancelled() {
                    return Ok(CampaignOutcome::Aborted);
                }
                let tag = RunTag {
                    frequency_ghz: sweep.frequency_ghz,
                    ..tag.clone()
                };
                if let SweepEnd::Aborted = self.sweep_frequency(&sweep, &tag).await? {
                    return Ok(CampaignOutcome::Aborted);
                }
                debug!("Next frequency in {:?}", self.settings.scan.inter_frequency_delay());
                tokio::time::sleep(self.settings.scan.inter_frequency_delay()).await;
            }
        }
        Ok(CampaignOutcome::Completed)
    }

    async fn read_temperature(&self) -> AppResult<f64> {
        let kelvin = self
            .rig
            .temperature
            .temperature()
            .await
            .hardware("reading temperature")?;
        Ok(round1(kelvin))
    }

    /// Ramp to `target` unless already there at 0.1 K resolution, then return
    /// the temperature actually read back.
    async fn settle_temperature(&self, target: f64) -> AppResult<f64> {
        let current = self.read_temperature().await?;
        let ramped = round1(target) != current;
        if ramped {
            let timing = &self.settings.scan;
            self.state.update(|status| {
                status.phase = ScanPhase::SettlingTemperature;
                status.temperature_k = Some(current);
            });
            info!("Setting temperature {target} K, waiting to stabilize");
            self.rig
                .temperature
                .set_temperature(target, timing.temperature_rate_k_per_min)
                .await
                .hardware("setting temperature")?;
            self.rig
                .temperature
                .wait_for_temperature(timing.temperature_settle_timeout())
                .await
                .hardware("waiting for temperature")?;
        }

        let reached = self.read_temperature().await?;
        if ramped {
            info!("Stabilized at {reached} K");
        }
        self.state
            .update(|status| status.temperature_k = Some(reached));
        self.publish(ScanDocument::Temperature(TemperatureDoc {
            run_uid: self.run_uid.clone(),
            time_ns: now_ns(),
            kelvin: reached,
            ramped,
        }));
        Ok(reached)
    }

    async fn run_tag(&self, temperature: f64) -> AppResult<RunTag> {
        Ok(RunTag {
            sample_id: self.settings.storage.sample_id.clone(),
            temperature_k: temperature,
            frequency_ghz: 0.0,
            rf_power_dbm: self
                .rig
                .rf
                .power_dbm()
                .await
                .hardware("reading RF power")?,
            ac_current_ma: self
                .rig
                .ac
                .amplitude_ma()
                .await
                .hardware("reading modulation amplitude")?,
        })
    }

    async fn sweep_frequency(&mut self, sweep: &FrequencySweep, tag: &RunTag) -> AppResult<SweepEnd> {
        let timing = self.settings.scan.clone();
        let fields = sweep.fields.fields();
        let first = sweep.fields.first().ok_or_else(|| {
            DaqError::Plan(format!("{} GHz has no field points", sweep.frequency_ghz))
        })?;

        info!(
            "Scanning {} GHz: {} to {} G, center step {:?} G",
            sweep.frequency_ghz,
            first,
            fields[fields.len() - 1],
            sweep.fields.center_step()
        );
        self.state.update(|status| {
            status.phase = ScanPhase::ApproachingField;
            status.frequency_ghz = Some(sweep.frequency_ghz);
            status.field_index = None;
        });

        self.rig
            .rf
            .set_frequency_ghz(sweep.frequency_ghz)
            .await
            .hardware("setting RF frequency")?;
        let time_constant = self
            .rig
            .lockin
            .time_constant_secs()
            .await
            .hardware("reading lock-in time constant")?;
        let settle = settle_delay(time_constant, timing.settle_time_constants);

        self.rig
            .field
            .set_field(first, timing.field_rate_gauss_per_sec)
            .await
            .hardware("setting field")?;
        self.rig
            .field
            .wait_for_field(timing.field_settle_timeout())
            .await
            .hardware("waiting for field")?;

        let path = self.writer.begin(tag).await.map_err(storage_error)?;
        self.files.push(path.clone());
        self.publish(ScanDocument::Frequency(FrequencyDoc {
            run_uid: self.run_uid.clone(),
            time_ns: now_ns(),
            frequency_ghz: sweep.frequency_ghz,
            resonance_field: sweep.resonance_field,
            linewidth: sweep.linewidth,
            points: fields.len(),
            path: path.clone(),
        }));

        let mut end = SweepEnd::Completed;
        let mut acquired = 0;
        for (index, &field) in fields.iter().enumerate() {
            if self.control().is_cancelled() {
                info!("Aborting at {field} G of {} GHz", sweep.frequency_ghz);
                end = SweepEnd::Aborted;
                break;
            }
            if self.control().take_skip() {
                info!(
                    "Skipping the rest of {} GHz after {acquired} points",
                    sweep.frequency_ghz
                );
                self.publish(ScanDocument::Skip(SkipDoc {
                    run_uid: self.run_uid.clone(),
                    time_ns: now_ns(),
                    frequency_ghz: sweep.frequency_ghz,
                    acquired,
                }));
                end = SweepEnd::Skipped;
                break;
            }

            self.state.update(|status| {
                status.phase = ScanPhase::Sweeping;
                status.field_index = Some(index);
                status.field_gauss = Some(field);
            });
            self.rig
                .field
                .set_field(field, timing.field_rate_gauss_per_sec)
                .await
                .hardware("setting field")?;
            let average = self
                .sampler
                .sample(settle)
                .await
                .hardware("reading lock-in")?;

            let record = MeasurementRecord {
                temperature_k: tag.temperature_k,
                frequency_ghz: sweep.frequency_ghz,
                field_gauss: field,
                lockin_x: average.x,
                lockin_y: average.y,
                time_constant,
            };
            self.writer.append(&record).await.map_err(storage_error)?;
            acquired += 1;
            self.points_written += 1;
            let written = self.points_written;
            self.state.update(|status| status.points_written = written);
            self.publish(ScanDocument::Point(PointDoc {
                run_uid: self.run_uid.clone(),
                time_ns: now_ns(),
                seq_num: index,
                record,
            }));
            if acquired % timing.refresh_every.max(1) == 0 {
                self.publish(ScanDocument::Refresh(RefreshDoc {
                    run_uid: self.run_uid.clone(),
                    time_ns: now_ns(),
                    path: path.clone(),
                    points: acquired,
                }));
            }
        }

        // a skip requested after the last point belongs to no frequency
        self.control().take_skip();
        self.writer.finish().await.map_err(storage_error)?;
        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CampaignInput;
    use crate::instrument::mock::SimulatedRig;

    fn fast_settings(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.storage.output_dir = dir.to_path_buf();
        settings.storage.sample_id = "YIG".to_string();
        settings.scan.inter_frequency_delay_ms = 0;
        settings.scan.sample_interval_ms = 0;
        settings
    }

    fn campaign(temperatures: &str) -> CampaignConfig {
        CampaignConfig::parse(&CampaignInput {
            temperatures: temperatures.to_string(),
            resonances: "10: 2400, 12: 3000".to_string(),
            linewidth_low: "16".to_string(),
            linewidth_high: "16".to_string(),
            field_step: "4".to_string(),
            field_shift: "0".to_string(),
            spacing: crate::experiment::plans::Spacing::Equal,
            reverse: false,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn wait_without_start_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedRig::new(300.0, vec![(10.0, 2400.0)], 16.0);
        let mut orchestrator = ScanOrchestrator::new(sim.rig, Arc::new(fast_settings(dir.path())));
        assert!(matches!(
            orchestrator.wait().await,
            Err(DaqError::Runtime(_))
        ));
    }

    #[tokio::test]
    async fn empty_temperature_list_uses_current_temperature() {
        let dir = tempfile::tempdir().unwrap();
        let campaign = campaign("");
        let sim = SimulatedRig::for_campaign(295.04, &campaign);
        let mut orchestrator = ScanOrchestrator::new(sim.rig, Arc::new(fast_settings(dir.path())));

        orchestrator.start(campaign).unwrap();
        let summary = orchestrator.wait().await.unwrap();

        assert_eq!(summary.outcome, CampaignOutcome::Completed);
        assert_eq!(sim.ppms.count_calls("set_temperature"), 0);
        assert_eq!(summary.files.len(), 2);
        let name = summary.files[0].file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "YIG_295K_10p0GHz_12dBm_100p0mA.csv");
    }

    #[tokio::test]
    async fn status_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let campaign = campaign("300: 0");
        let sim = SimulatedRig::for_campaign(300.0, &campaign);
        let mut orchestrator = ScanOrchestrator::new(sim.rig, Arc::new(fast_settings(dir.path())));
        let status = orchestrator.status();

        orchestrator.start(campaign).unwrap();
        let summary = orchestrator.wait().await.unwrap();

        let status = status.borrow().clone();
        assert_eq!(status.phase, ScanPhase::Idle);
        assert_eq!(status.points_written, summary.points_written);
        assert!(!orchestrator.is_running());
    }
}
