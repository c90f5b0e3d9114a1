//! Simulated instruments for tests and dry runs.
//!
//! - [`ScriptedEndpoint`]: a SCPI endpoint answering from a response table
//! - [`SimulatedPpms`]: field and temperature control with instant ramps
//! - [`SimulatedSignalGenerator`], [`SimulatedCurrentSource`]: stateful SCPI sources
//! - [`SimulatedLockIn`]: returns a Lorentzian-derivative signal for the
//!   current field and RF frequency
//! - [`SimulatedRig`]: all of the above wired into a [`Rig`]
//!
//! Every simulated device logs its calls and supports failure injection.

use super::ac_source::AcSource;
use super::capabilities::{FieldControl, ScpiEndpoint, TemperatureControl};
use super::lockin::{LockIn, SENSITIVITY_LABELS, TIME_CONSTANT_SECONDS};
use super::rf_source::RfSource;
use super::rig::Rig;
use crate::experiment::campaign::CampaignConfig;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_arg(command: &str, prefix: &str) -> Result<f64> {
    command
        .strip_prefix(prefix)
        .map(str::trim)
        .and_then(|arg| arg.parse().ok())
        .ok_or_else(|| anyhow!("malformed command '{command}'"))
}

/// SCPI endpoint answering queries from a table of canned responses.
///
/// A response registered with [`respond`](Self::respond) is returned for every
/// query; a sequence from [`respond_sequence`](Self::respond_sequence) is
/// consumed in order and its last entry then repeats.
#[derive(Default)]
pub struct ScriptedEndpoint {
    responses: Mutex<HashMap<String, VecDeque<String>>>,
    writes: Mutex<Vec<String>>,
    queries: Mutex<Vec<String>>,
    should_fail_next: AtomicBool,
}

impl ScriptedEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, command: &str, response: &str) -> Self {
        self.respond_sequence(command, [response])
    }

    pub fn respond_sequence<'a>(
        self,
        command: &str,
        responses: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        lock(&self.responses).insert(
            command.to_string(),
            responses.into_iter().map(str::to_string).collect(),
        );
        self
    }

    /// Fail the next write or query.
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<String> {
        lock(&self.writes).clone()
    }

    pub fn queries(&self) -> Vec<String> {
        lock(&self.queries).clone()
    }

    fn check_failure(&self) -> Result<()> {
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            bail!("Injected failure");
        }
        Ok(())
    }
}

#[async_trait]
impl ScpiEndpoint for ScriptedEndpoint {
    async fn write(&self, command: &str) -> Result<()> {
        self.check_failure()?;
        lock(&self.writes).push(command.to_string());
        Ok(())
    }

    async fn query(&self, command: &str) -> Result<String> {
        self.check_failure()?;
        lock(&self.queries).push(command.to_string());
        let mut responses = lock(&self.responses);
        let queue = responses
            .get_mut(command)
            .ok_or_else(|| anyhow!("no scripted response for '{command}'"))?;
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        response.ok_or_else(|| anyhow!("no scripted response for '{command}'"))
    }
}

#[derive(Debug, Clone, Copy)]
struct PpmsState {
    field: f64,
    temperature: f64,
    temperature_target: f64,
}

type CallHook = Box<dyn Fn(usize) + Send + Sync>;

/// PPMS stand-in: setpoints are reached instantly, waits only sleep.
pub struct SimulatedPpms {
    state: Mutex<PpmsState>,
    settle_time: Duration,
    call_log: Mutex<Vec<String>>,
    should_fail_next: AtomicBool,
    fail_on: Mutex<Option<(String, usize)>>,
    set_field_calls: AtomicUsize,
    on_set_field: Mutex<Option<CallHook>>,
}

impl SimulatedPpms {
    pub fn new(temperature: f64) -> Self {
        Self {
            state: Mutex::new(PpmsState {
                field: 0.0,
                temperature,
                temperature_target: temperature,
            }),
            settle_time: Duration::ZERO,
            call_log: Mutex::new(Vec::new()),
            should_fail_next: AtomicBool::new(false),
            fail_on: Mutex::new(None),
            set_field_calls: AtomicUsize::new(0),
            on_set_field: Mutex::new(None),
        }
    }

    /// Time every `wait_for_*` call takes.
    pub fn with_settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    /// Fail the next operation of any kind.
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Fail the `nth` (1-based) future call of `operation`, e.g. `"set_field"`.
    pub fn fail_on_call(&self, operation: &str, nth: usize) {
        *lock(&self.fail_on) = Some((operation.to_string(), nth));
    }

    /// Run `hook` after every successful `set_field`, with the running call count.
    pub fn on_set_field(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *lock(&self.on_set_field) = Some(Box::new(hook));
    }

    pub fn call_log(&self) -> Vec<String> {
        lock(&self.call_log).clone()
    }

    /// Number of logged calls whose name starts with `operation`.
    pub fn count_calls(&self, operation: &str) -> usize {
        lock(&self.call_log)
            .iter()
            .filter(|call| call.split_whitespace().next() == Some(operation))
            .count()
    }

    pub fn current_field(&self) -> f64 {
        lock(&self.state).field
    }

    fn record(&self, operation: &str, call: String) -> Result<()> {
        lock(&self.call_log).push(call);
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            bail!("Injected failure in {operation}");
        }
        let mut fail_on = lock(&self.fail_on);
        let triggered = match fail_on.as_mut() {
            Some((target, remaining)) if target.as_str() == operation => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            _ => false,
        };
        if triggered {
            *fail_on = None;
            bail!("Injected failure in {operation}");
        }
        Ok(())
    }
}

#[async_trait]
impl FieldControl for SimulatedPpms {
    async fn set_field(&self, gauss: f64, rate_gauss_per_sec: f64) -> Result<()> {
        self.record("set_field", format!("set_field {gauss} {rate_gauss_per_sec}"))?;
        lock(&self.state).field = gauss;
        let count = self.set_field_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = lock(&self.on_set_field).as_ref() {
            hook(count);
        }
        Ok(())
    }

    async fn field(&self) -> Result<f64> {
        Ok(self.current_field())
    }

    async fn wait_for_field(&self, timeout: Duration) -> Result<()> {
        self.record("wait_for_field", format!("wait_for_field {}", timeout.as_secs()))?;
        tokio::time::sleep(self.settle_time).await;
        Ok(())
    }
}

#[async_trait]
impl TemperatureControl for SimulatedPpms {
    async fn set_temperature(&self, kelvin: f64, rate_k_per_min: f64) -> Result<()> {
        self.record(
            "set_temperature",
            format!("set_temperature {kelvin} {rate_k_per_min}"),
        )?;
        lock(&self.state).temperature_target = kelvin;
        Ok(())
    }

    async fn temperature(&self) -> Result<f64> {
        Ok(lock(&self.state).temperature)
    }

    async fn wait_for_temperature(&self, timeout: Duration) -> Result<()> {
        self.record(
            "wait_for_temperature",
            format!("wait_for_temperature {}", timeout.as_secs()),
        )?;
        tokio::time::sleep(self.settle_time).await;
        let mut state = lock(&self.state);
        state.temperature = state.temperature_target;
        Ok(())
    }
}

#[derive(Debug)]
struct GeneratorState {
    frequency_hz: f64,
    power_dbm: f64,
    output: bool,
    modulation: bool,
}

/// Microwave source holding frequency, power and output state.
pub struct SimulatedSignalGenerator {
    state: Mutex<GeneratorState>,
}

impl Default for SimulatedSignalGenerator {
    fn default() -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                frequency_hz: 10e9,
                power_dbm: 12.0,
                output: true,
                modulation: false,
            }),
        }
    }
}

impl SimulatedSignalGenerator {
    pub fn frequency_ghz(&self) -> f64 {
        lock(&self.state).frequency_hz / 1e9
    }
}

#[async_trait]
impl ScpiEndpoint for SimulatedSignalGenerator {
    async fn write(&self, command: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(rest) = command.strip_prefix(":SOUR:FREQ:CW ") {
            let ghz = parse_arg(rest.trim_end_matches("GHz"), "")?;
            state.frequency_hz = ghz * 1e9;
        } else if command.starts_with("POW ") {
            state.power_dbm = parse_arg(command, "POW ")?;
        } else if command == ":OUTP:MOD OFF" {
            state.modulation = false;
        } else if command == ":OUTP ON" {
            state.output = true;
        } else if command == ":OUTP OFF" {
            state.output = false;
        } else {
            bail!("signal generator rejected '{command}'");
        }
        Ok(())
    }

    async fn query(&self, command: &str) -> Result<String> {
        let state = lock(&self.state);
        match command {
            "FREQ?" => Ok(format!("{:E}\n", state.frequency_hz)),
            "POW?" => Ok(format!("{:E}\n", state.power_dbm)),
            ":OUTP?" => Ok(format!("{}\n", u8::from(state.output))),
            ":OUTP:MOD?" => Ok(format!("{}\n", u8::from(state.modulation))),
            "*IDN?" => Ok("Agilent Technologies,N5183A,SIM0001,A.01\n".to_string()),
            _ => bail!("signal generator has no query '{command}'"),
        }
    }
}

#[derive(Debug)]
struct CurrentSourceState {
    frequency_hz: f64,
    amplitude_a: f64,
    running: bool,
}

/// Modulation current source.
pub struct SimulatedCurrentSource {
    state: Mutex<CurrentSourceState>,
}

impl Default for SimulatedCurrentSource {
    fn default() -> Self {
        Self {
            state: Mutex::new(CurrentSourceState {
                frequency_hz: 573.1,
                amplitude_a: 0.1,
                running: true,
            }),
        }
    }
}

#[async_trait]
impl ScpiEndpoint for SimulatedCurrentSource {
    async fn write(&self, command: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if command.starts_with(":SOUR:WAVE:FREQ ") {
            state.frequency_hz = parse_arg(command, ":SOUR:WAVE:FREQ ")?;
        } else if command.starts_with(":SOUR:WAVE:AMPL ") {
            state.amplitude_a = parse_arg(command, ":SOUR:WAVE:AMPL ")?;
        } else if command == ":SOUR:WAVE:ABOR" {
            state.running = false;
        } else if command == ":SOUR:WAVE:INIT" {
            state.running = true;
        } else if !(command.starts_with(":SOUR:WAVE:") || command.starts_with(":SOUR:CURR:COMP "))
        {
            bail!("current source rejected '{command}'");
        }
        Ok(())
    }

    async fn query(&self, command: &str) -> Result<String> {
        let state = lock(&self.state);
        match command {
            ":SOUR:WAVE:FREQ?" => Ok(format!("{:E}\n", state.frequency_hz)),
            ":SOUR:WAVE:AMPL?" => Ok(format!("{:E}\n", state.amplitude_a)),
            ":OUTP:STAT?" => Ok(format!("{}\n", u8::from(state.running))),
            "*IDN?" => Ok("KEITHLEY INSTRUMENTS INC.,MODEL 6221,SIM0001\n".to_string()),
            _ => bail!("current source has no query '{command}'"),
        }
    }
}

#[derive(Debug)]
struct LockInState {
    sensitivity: usize,
    time_constant: usize,
}

/// Lock-in whose X output is the field derivative of a Lorentzian absorption
/// line at the resonance of the current RF frequency.
pub struct SimulatedLockIn {
    ppms: Arc<SimulatedPpms>,
    rf: Arc<SimulatedSignalGenerator>,
    resonances: Vec<(f64, f64)>,
    linewidth: f64,
    amplitude: f64,
    state: Mutex<LockInState>,
}

impl SimulatedLockIn {
    pub fn new(
        ppms: Arc<SimulatedPpms>,
        rf: Arc<SimulatedSignalGenerator>,
        resonances: Vec<(f64, f64)>,
        linewidth: f64,
    ) -> Self {
        Self {
            ppms,
            rf,
            resonances,
            linewidth,
            amplitude: 1e-5,
            // 1 ms time constant keeps the per-point settle short
            state: Mutex::new(LockInState {
                sensitivity: 17,
                time_constant: 4,
            }),
        }
    }

    /// X and Y outputs for the present field and frequency.
    pub fn signal(&self) -> (f64, f64) {
        let frequency = self.rf.frequency_ghz();
        let resonance = self
            .resonances
            .iter()
            .min_by(|a, b| (a.0 - frequency).abs().total_cmp(&(b.0 - frequency).abs()))
            .map(|&(_, field)| field);
        let Some(resonance) = resonance else {
            return (0.0, 0.0);
        };
        // peak-to-peak derivative width to half width at half maximum
        let half_width = self.linewidth * 3f64.sqrt() / 2.0;
        if half_width <= 0.0 {
            return (0.0, 0.0);
        }
        let u = (self.ppms.current_field() - resonance) / half_width;
        let denominator = (1.0 + u * u).powi(2);
        let x = -self.amplitude * 2.0 * u / denominator;
        let y = 0.1 * self.amplitude * (1.0 - u * u) / denominator;
        (x, y)
    }
}

#[async_trait]
impl ScpiEndpoint for SimulatedLockIn {
    async fn write(&self, command: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if command.starts_with("SENS ") {
            let index = parse_arg(command, "SENS ")? as usize;
            if index >= SENSITIVITY_LABELS.len() {
                bail!("sensitivity index {index} out of range");
            }
            state.sensitivity = index;
        } else if command.starts_with("OFLT ") {
            let index = parse_arg(command, "OFLT ")? as usize;
            if index >= TIME_CONSTANT_SECONDS.len() {
                bail!("time constant index {index} out of range");
            }
            state.time_constant = index;
        } else if command != "APHS" {
            bail!("lock-in rejected '{command}'");
        }
        Ok(())
    }

    async fn query(&self, command: &str) -> Result<String> {
        match command {
            "OUTP? 1" => Ok(format!("{:E}\n", self.signal().0)),
            "OUTP? 2" => Ok(format!("{:E}\n", self.signal().1)),
            "FREQ?" => Ok("573.1\n".to_string()),
            "SENS?" => Ok(format!("{}\n", lock(&self.state).sensitivity)),
            "OFLT?" => Ok(format!("{}\n", lock(&self.state).time_constant)),
            "*IDN?" => Ok("Stanford_Research_Systems,SR830,s/n00000,ver1.07\n".to_string()),
            _ => bail!("lock-in has no query '{command}'"),
        }
    }
}

/// A complete simulated rig with handles on each device.
pub struct SimulatedRig {
    pub rig: Rig,
    pub ppms: Arc<SimulatedPpms>,
    pub lockin: Arc<SimulatedLockIn>,
    pub rf: Arc<SimulatedSignalGenerator>,
    pub ac: Arc<SimulatedCurrentSource>,
}

impl SimulatedRig {
    /// Build a rig at `temperature` whose lines sit at `resonances` (GHz, G).
    pub fn new(temperature: f64, resonances: Vec<(f64, f64)>, linewidth: f64) -> Self {
        Self::with_ppms(SimulatedPpms::new(temperature), resonances, linewidth)
    }

    /// Build a rig around a preconfigured PPMS.
    pub fn with_ppms(ppms: SimulatedPpms, resonances: Vec<(f64, f64)>, linewidth: f64) -> Self {
        let ppms = Arc::new(ppms);
        let rf = Arc::new(SimulatedSignalGenerator::default());
        let ac = Arc::new(SimulatedCurrentSource::default());
        let lockin = Arc::new(SimulatedLockIn::new(
            ppms.clone(),
            rf.clone(),
            resonances,
            linewidth,
        ));
        let rig = Rig {
            field: ppms.clone(),
            temperature: ppms.clone(),
            lockin: LockIn::new(lockin.clone()),
            rf: RfSource::new(rf.clone()),
            ac: AcSource::new(ac.clone()).with_arm_delay(Duration::ZERO),
        };
        Self {
            rig,
            ppms,
            lockin,
            rf,
            ac,
        }
    }

    /// Rig whose lines match a campaign's resonance list.
    pub fn for_campaign(temperature: f64, campaign: &CampaignConfig) -> Self {
        let resonances = campaign
            .resonances
            .points()
            .iter()
            .map(|point| (point.frequency_ghz, point.resonance_field))
            .collect();
        Self::new(temperature, resonances, campaign.linewidth.low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_sequence_repeats_last() {
        let endpoint = ScriptedEndpoint::new().respond_sequence("CONST?", ["1\n", "2\n"]);
        assert_eq!(endpoint.query("CONST?").await.unwrap(), "1\n");
        assert_eq!(endpoint.query("CONST?").await.unwrap(), "2\n");
        assert_eq!(endpoint.query("CONST?").await.unwrap(), "2\n");
        assert!(endpoint.query("READ?").await.is_err());
    }

    #[tokio::test]
    async fn scripted_failure_is_one_shot() {
        let endpoint = ScriptedEndpoint::new();
        endpoint.inject_next_failure();
        assert!(endpoint.write("APHS").await.is_err());
        assert!(endpoint.write("APHS").await.is_ok());
        assert_eq!(endpoint.writes(), vec!["APHS"]);
    }

    #[tokio::test]
    async fn ppms_fails_on_requested_call() {
        let ppms = SimulatedPpms::new(300.0);
        ppms.fail_on_call("set_field", 2);
        ppms.set_field(10.0, 100.0).await.unwrap();
        assert!(ppms.set_field(20.0, 100.0).await.is_err());
        ppms.set_field(30.0, 100.0).await.unwrap();
        assert_eq!(ppms.current_field(), 30.0);
        assert_eq!(ppms.count_calls("set_field"), 3);
    }

    #[tokio::test]
    async fn ppms_temperature_settles_on_wait() {
        let ppms = SimulatedPpms::new(300.0);
        ppms.set_temperature(20.0, 20.0).await.unwrap();
        assert_eq!(ppms.temperature().await.unwrap(), 300.0);
        ppms.wait_for_temperature(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ppms.temperature().await.unwrap(), 20.0);
    }

    #[tokio::test]
    async fn lockin_signal_changes_sign_across_resonance() {
        let sim = SimulatedRig::new(300.0, vec![(10.0, 2400.0)], 16.0);
        sim.rig.rf.set_frequency_ghz(10.0).await.unwrap();

        sim.ppms.set_field(2390.0, 100.0).await.unwrap();
        let (below, _) = sim.rig.lockin.read_xy().await.unwrap();
        sim.ppms.set_field(2410.0, 100.0).await.unwrap();
        let (above, _) = sim.rig.lockin.read_xy().await.unwrap();
        sim.ppms.set_field(2400.0, 100.0).await.unwrap();
        let (center, _) = sim.rig.lockin.read_xy().await.unwrap();

        assert!(below > 0.0);
        assert!(above < 0.0);
        assert!(center.abs() < 1e-12);
    }

    #[tokio::test]
    async fn sources_report_their_state() {
        let sim = SimulatedRig::new(300.0, vec![(10.0, 2400.0)], 16.0);
        sim.rig.rf.set_frequency_ghz(19.0).await.unwrap();
        assert_eq!(sim.rig.rf.frequency_ghz().await.unwrap(), 19.0);
        assert_eq!(sim.rig.rf.power_dbm().await.unwrap(), 12);
        assert_eq!(sim.rig.ac.amplitude_ma().await.unwrap(), 100.0);
        assert!(!sim.rig.ac.toggle_output().await.unwrap());
        assert!(sim.rig.ac.toggle_output().await.unwrap());
    }
}
