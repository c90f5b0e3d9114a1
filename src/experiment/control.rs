//! Operator control of a running campaign.
//!
//! [`ScanControl`] is the cooperative cancellation token shared between the
//! operator side and the campaign worker. The worker polls it at every field
//! point; neither flag interrupts an instrument call already in progress.
//! [`ScanState`] adds the published status snapshot.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Default)]
struct ControlFlags {
    running: AtomicBool,
    skip: AtomicBool,
}

/// Running and skip flags of one orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ScanControl {
    flags: Arc<ControlFlags>,
}

impl ScanControl {
    /// Idle flags, no run armed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a new run as started and drop any stale skip request.
    pub fn arm(&self) {
        self.flags.skip.store(false, Ordering::SeqCst);
        self.flags.running.store(true, Ordering::SeqCst);
    }

    /// Request that the campaign stop before its next field point.
    pub fn cancel(&self) {
        self.flags.running.store(false, Ordering::SeqCst);
    }

    /// Whether a run is armed and not yet cancelled or ended.
    pub fn is_running(&self) -> bool {
        self.flags.running.load(Ordering::SeqCst)
    }

    /// Whether the current run should stop.
    pub fn is_cancelled(&self) -> bool {
        !self.is_running()
    }

    /// Request that the current frequency end before its next field point.
    pub fn request_skip(&self) {
        self.flags.skip.store(true, Ordering::SeqCst);
    }

    /// Consume a pending skip request.
    pub fn take_skip(&self) -> bool {
        self.flags.skip.swap(false, Ordering::SeqCst)
    }
}

/// What the worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    /// No campaign running
    #[default]
    Idle,
    /// Ramping to a temperature step and waiting for it
    SettlingTemperature,
    /// Moving to the first field of a frequency
    ApproachingField,
    /// Stepping through field points
    Sweeping,
}

/// Where the campaign currently is.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ScanStatus {
    /// Current activity
    pub phase: ScanPhase,
    /// Temperature of the step in progress (K)
    pub temperature_k: Option<f64>,
    /// Frequency being swept (GHz)
    pub frequency_ghz: Option<f64>,
    /// Index of the field point within its sweep
    pub field_index: Option<usize>,
    /// Field setpoint of that point (G)
    pub field_gauss: Option<f64>,
    /// Rows written since the run started
    pub points_written: usize,
}

/// Control flags plus status of the orchestrator's current run.
#[derive(Debug, Clone)]
pub struct ScanState {
    control: ScanControl,
    status: Arc<watch::Sender<ScanStatus>>,
}

impl Default for ScanState {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanState {
    /// Idle status with fresh control flags.
    pub fn new() -> Self {
        let (status, _) = watch::channel(ScanStatus::default());
        Self {
            control: ScanControl::new(),
            status: Arc::new(status),
        }
    }

    /// Flags shared with the worker.
    pub fn control(&self) -> &ScanControl {
        &self.control
    }

    /// Reset the status and arm the control flags for a new run.
    pub fn begin(&self) {
        self.status.send_replace(ScanStatus::default());
        self.control.arm();
    }

    /// Clear the running flag and return to idle.
    pub fn end(&self) {
        self.control.cancel();
        self.control.take_skip();
        self.status.send_modify(|status| {
            status.phase = ScanPhase::Idle;
            status.field_index = None;
        });
    }

    /// Receiver that sees every status change.
    pub fn subscribe(&self) -> watch::Receiver<ScanStatus> {
        self.status.subscribe()
    }

    /// Copy of the latest status.
    pub fn snapshot(&self) -> ScanStatus {
        self.status.borrow().clone()
    }

    /// Edit the status in place and notify subscribers.
    pub fn update(&self, change: impl FnOnce(&mut ScanStatus)) {
        self.status.send_modify(change);
    }
}
