//! Field-sweep campaigns.
//!
//! - **Plans** ([`plans`]): per-frequency field sequences, equal or
//!   center-dense spaced around the expected resonance
//! - **Campaigns** ([`campaign`]): the operator's parsed input and the plan
//!   for each temperature step
//! - **Orchestrator** ([`run_engine`]): walks temperatures, frequencies and
//!   fields on a background task
//! - **Documents** ([`document`]): progress milestones for displays
//!
//! # Example
//!
//! ```rust,ignore
//! use fmr_daq::experiment::{CampaignConfig, ScanOrchestrator};
//!
//! let campaign = CampaignConfig::parse(&settings.campaign)?;
//! let mut orchestrator = ScanOrchestrator::new(rig, settings);
//! orchestrator.start(campaign)?;
//!
//! // From another task
//! orchestrator.skip_frequency();
//!
//! let summary = orchestrator.wait().await?;
//! ```

pub mod campaign;
pub mod control;
pub mod document;
pub mod plans;
pub mod run_engine;

pub use campaign::{CampaignConfig, FrequencyPlan, LinewidthBounds, ResonancePoint, TemperatureStep};
pub use control::{ScanControl, ScanPhase, ScanStatus};
pub use document::{ExitStatus, ScanDocument, StartDoc, StopDoc};
pub use plans::{FieldPlan, FieldPlanGenerator, FieldSequence, FrequencySweep, Spacing};
pub use run_engine::{CampaignOutcome, CampaignSummary, ScanOrchestrator};
