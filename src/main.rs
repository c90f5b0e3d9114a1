//! # fmr_daq
//!
//! Command-line front end for FMR field-sweep campaigns.
//!
//! ## Usage
//!
//! ```bash
//! # Show the field points the configured campaign would visit
//! fmr_daq plan
//! fmr_daq plan --json
//!
//! # Run the configured campaign against the simulated rig
//! # (type `s` + Enter to skip a frequency, `q` or Ctrl-C to abort)
//! fmr_daq simulate
//!
//! # Resonance field and linewidth of a written sweep
//! fmr_daq estimate data/YIG/YIG_21K_19p0GHz_12dBm_100p0mA.csv
//! ```
//!
//! Every setting can be overridden from the environment, for example
//! `FMR_DAQ_CAMPAIGN__TEMPERATURES="20: 0, 30: -5"`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fmr_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use fmr_daq::data::{estimate, parse_file_name, read_records};
use fmr_daq::experiment::{
    CampaignConfig, FieldPlan, ScanControl, ScanDocument, ScanOrchestrator,
};
use fmr_daq::instrument::mock::SimulatedRig;
use tracing::{info, warn};
use serde::Serialize;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

/// Cryostat temperature the simulated rig starts at when nothing else is known.
const ROOM_TEMPERATURE_K: f64 = 300.0;

/// FMR field-sweep acquisition
#[derive(Parser)]
#[command(name = "fmr_daq")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the field plan of every temperature step
    Plan {
        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Run the configured campaign against the simulated rig
    Simulate {
        /// Starting cryostat temperature in K (defaults to the first step)
        #[arg(long)]
        temperature: Option<f64>,
    },

    /// Estimate resonance field and linewidth from a measurement file
    Estimate {
        /// CSV file written by a campaign
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Query the identity of the VISA instruments
    Instruments,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

    // RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level)),
        )
        .init();

    match cli.command {
        Commands::Plan { json } => print_plan(&settings, json),
        Commands::Simulate { temperature } => simulate(settings, temperature).await,
        Commands::Estimate { file, json } => print_estimate(&file, json),
        Commands::Instruments => {
            let identities = fmr_daq::instrument::identify_all(&settings.instruments).await?;
            for (resource, identity) in identities {
                println!("{resource}: {identity}");
            }
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct StepPlan {
    /// `None` when the campaign measures at the current temperature
    kelvin: Option<f64>,
    field_shift: f64,
    plan: FieldPlan,
}

fn step_plans(campaign: &CampaignConfig) -> Result<Vec<StepPlan>> {
    if campaign.temperatures.is_empty() {
        let plan = campaign.field_plan(campaign.default_shift, campaign.reverse)?;
        return Ok(vec![StepPlan {
            kelvin: None,
            field_shift: campaign.default_shift,
            plan,
        }]);
    }
    campaign
        .temperatures
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let plan = campaign.field_plan(step.field_shift, campaign.reverse_at(index))?;
            Ok(StepPlan {
                kelvin: Some(step.kelvin),
                field_shift: step.field_shift,
                plan,
            })
        })
        .collect()
}

fn print_plan(settings: &Settings, json: bool) -> Result<()> {
    let campaign = CampaignConfig::parse(&settings.campaign)?;
    let steps = step_plans(&campaign)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&steps)?);
        return Ok(());
    }

    for step in &steps {
        let temperature = step
            .kelvin
            .map_or_else(|| "current temperature".to_string(), |k| format!("{k} K"));
        println!(
            "{temperature}: shift {} G, {} points{}",
            step.field_shift,
            step.plan.total_points(),
            if step.plan.is_reversed() { ", descending" } else { "" }
        );
        for sweep in step.plan.sweeps() {
            let fields = sweep.fields.fields();
            println!(
                "  {:>6} GHz  Hres {:>8} G  ΔH {:>6} G  step {:>5} G  {:>4} points  {} .. {} G",
                sweep.frequency_ghz,
                sweep.resonance_field,
                sweep.linewidth,
                sweep.step,
                fields.len(),
                fields.first().copied().unwrap_or_default(),
                fields.last().copied().unwrap_or_default(),
            );
        }
    }
    Ok(())
}

async fn simulate(settings: Settings, temperature: Option<f64>) -> Result<()> {
    let campaign = CampaignConfig::parse(&settings.campaign)?;
    let start_k = temperature
        .or_else(|| campaign.temperatures.first().map(|step| step.kelvin))
        .unwrap_or(ROOM_TEMPERATURE_K);

    let sim = SimulatedRig::for_campaign(start_k, &campaign);
    let mut orchestrator = ScanOrchestrator::new(sim.rig, Arc::new(settings));
    let documents = orchestrator.subscribe();
    let control = orchestrator.control();

    let run_uid = orchestrator.start(campaign)?;
    info!("Simulated campaign {run_uid} started");
    println!("Type 's' + Enter to skip the current frequency, 'q' + Enter or Ctrl-C to abort.");

    spawn_operator_input(control.clone());
    let progress = tokio::spawn(print_progress(documents));
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting campaign");
            control.cancel();
        }
    });

    let result = orchestrator.wait().await;
    interrupt.abort();
    // closes the document channel so the display ends even without a Stop
    drop(orchestrator);
    let _ = progress.await;

    let summary = result?;
    println!(
        "Campaign {:?}: {} points in {} files",
        summary.outcome,
        summary.points_written,
        summary.files.len()
    );
    for file in &summary.files {
        println!("  {}", file.display());
    }
    Ok(())
}

/// Reads operator commands on a plain thread so a pending read never holds
/// up runtime shutdown.
fn spawn_operator_input(control: ScanControl) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match line.trim() {
                "s" => control.request_skip(),
                "q" => {
                    control.cancel();
                    break;
                }
                "" => {}
                other => eprintln!("Unknown command '{other}', use 's' or 'q'"),
            }
        }
    });
}

async fn print_progress(mut documents: tokio::sync::broadcast::Receiver<ScanDocument>) {
    loop {
        match documents.recv().await {
            Ok(ScanDocument::Temperature(doc)) => println!("{} K reached", doc.kelvin),
            Ok(ScanDocument::Frequency(doc)) => println!(
                "{} GHz: {} points around {} G -> {}",
                doc.frequency_ghz,
                doc.points,
                doc.resonance_field,
                doc.path.display()
            ),
            Ok(ScanDocument::Refresh(doc)) => println!("  {} points", doc.points),
            Ok(ScanDocument::Skip(doc)) => println!(
                "  skipped {} GHz after {} points",
                doc.frequency_ghz, doc.acquired
            ),
            Ok(ScanDocument::Stop(_)) | Err(RecvError::Closed) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => warn!("Progress display missed {missed} documents"),
        }
    }
}

fn print_estimate(file: &Path, json: bool) -> Result<()> {
    let records = read_records(file)?;
    let line = estimate(&records)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&line)?);
        return Ok(());
    }

    if let Some((kelvin, ghz)) = parse_file_name(file) {
        println!("{ghz} GHz at {kelvin} K, {} points", records.len());
    }
    println!("Resonance field: {:.1} G", line.resonance_field);
    println!("Linewidth:       {:.1} G", line.linewidth);
    println!(
        "Extrema:         {:.3e} at {} G, {:.3e} at {} G",
        line.signal_max, line.field_at_max, line.signal_min, line.field_at_min
    );
    Ok(())
}
