//! Campaign input parsing and validation.
//!
//! Operators describe a campaign with short comma/colon separated strings
//! (`"21: 3, 22: 4"` for temperatures and their field shifts,
//! `"19: 6000, 20: 6001"` for frequencies and their resonance fields). This
//! module turns that text into typed values before any instrument is touched,
//! so that a typo fails fast with [`DaqError::Configuration`].

use crate::config::CampaignInput;
use crate::error::{AppResult, DaqError};
use crate::experiment::plans::{FieldPlan, FieldPlanGenerator, Spacing};
use serde::Serialize;

/// Round the exact binary value to one decimal place.
///
/// Formatting is correctly rounded, so `0.35` (stored just below the tie)
/// becomes `0.3`. Scaling by ten first would round it up.
pub(crate) fn round1(value: f64) -> f64 {
    format!("{value:.1}").parse().unwrap_or(value)
}

/// Round to whole gauss, ties to even.
fn whole_gauss(value: f64) -> f64 {
    value.round_ties_even()
}

/// One temperature of a campaign and the field shift applied to every resonance field there.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureStep {
    /// Target temperature in kelvin, rounded to 0.1 K
    pub kelvin: f64,
    /// Offset added to every resonance field, in whole gauss
    pub field_shift: f64,
}

/// Expected resonance field at one frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResonancePoint {
    /// RF frequency in GHz
    pub frequency_ghz: f64,
    /// Expected resonance field in gauss
    pub resonance_field: f64,
}

/// Frequency to resonance-field map for one temperature.
///
/// Always non-empty, finite, and sorted by ascending frequency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrequencyPlan {
    points: Vec<ResonancePoint>,
}

impl FrequencyPlan {
    /// Build a plan from `(frequency, resonance field)` pairs.
    ///
    /// A frequency listed twice keeps its last field.
    pub fn new(pairs: impl IntoIterator<Item = (f64, f64)>) -> AppResult<Self> {
        let mut points: Vec<ResonancePoint> = Vec::new();
        for (frequency_ghz, resonance_field) in pairs {
            if !frequency_ghz.is_finite() || !resonance_field.is_finite() {
                return Err(DaqError::Configuration(format!(
                    "Frequency/field pair {frequency_ghz}: {resonance_field} is not finite"
                )));
            }
            match points
                .iter_mut()
                .find(|p| p.frequency_ghz == frequency_ghz)
            {
                Some(existing) => existing.resonance_field = resonance_field,
                None => points.push(ResonancePoint {
                    frequency_ghz,
                    resonance_field,
                }),
            }
        }
        if points.is_empty() {
            return Err(DaqError::Configuration(
                "At least one frequency/field pair is required".to_string(),
            ));
        }
        points.sort_by(|a, b| a.frequency_ghz.total_cmp(&b.frequency_ghz));
        Ok(Self { points })
    }

    /// Same frequencies with `shift` gauss added to every resonance field.
    pub fn shifted(&self, shift: f64) -> Self {
        Self {
            points: self
                .points
                .iter()
                .map(|p| ResonancePoint {
                    frequency_ghz: p.frequency_ghz,
                    resonance_field: p.resonance_field + shift,
                })
                .collect(),
        }
    }

    /// Points in ascending frequency order.
    pub fn points(&self) -> &[ResonancePoint] {
        &self.points
    }

    /// Number of frequencies.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Lowest and highest frequency.
    pub fn frequency_span(&self) -> (f64, f64) {
        let first = self.points[0].frequency_ghz;
        let last = self.points[self.points.len() - 1].frequency_ghz;
        (first, last)
    }
}

/// Peak-to-peak linewidths at the lowest and highest frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinewidthBounds {
    /// Linewidth (G) at the lowest frequency
    pub low: f64,
    /// Linewidth (G) at the highest frequency
    pub high: f64,
}

impl LinewidthBounds {
    /// Bounds with both ends checked to be finite and non-negative.
    pub fn new(low: f64, high: f64) -> AppResult<Self> {
        for (name, value) in [("initial", low), ("final", high)] {
            if !value.is_finite() || value < 0.0 {
                return Err(DaqError::Configuration(format!(
                    "The {name} linewidth must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(Self { low, high })
    }

    /// Expected linewidth at `frequency` for a plan spanning `span`.
    ///
    /// A single-frequency span (both ends equal) uses `low` directly.
    pub fn at(&self, frequency: f64, span: (f64, f64)) -> f64 {
        let (first, last) = span;
        if last == first {
            return self.low;
        }
        self.low + (self.high - self.low) * (frequency - first) / (last - first)
    }
}

/// A fully parsed and validated campaign.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignConfig {
    /// Temperatures in the order given; empty means "measure at the current temperature"
    pub temperatures: Vec<TemperatureStep>,
    /// Unshifted resonance fields
    pub resonances: FrequencyPlan,
    /// Linewidth endpoints
    pub linewidth: LinewidthBounds,
    /// Fixed field step, if any
    pub field_step: Option<f64>,
    /// Field shift used when `temperatures` is empty
    pub default_shift: f64,
    /// Field spacing strategy
    pub spacing: Spacing,
    /// Direction of the first temperature step
    pub reverse: bool,
}

impl CampaignConfig {
    /// Parse the operator's free-text input.
    pub fn parse(input: &CampaignInput) -> AppResult<Self> {
        // A repeated temperature keeps its first position and its last shift.
        let mut temperatures: Vec<TemperatureStep> = Vec::new();
        for (kelvin, shift) in parse_pairs(&input.temperatures, "temperature/shift")? {
            let step = TemperatureStep {
                kelvin: round1(kelvin),
                field_shift: whole_gauss(round1(shift)),
            };
            match temperatures.iter_mut().find(|t| t.kelvin == step.kelvin) {
                Some(existing) => existing.field_shift = step.field_shift,
                None => temperatures.push(step),
            }
        }

        let resonance_pairs = parse_pairs(&input.resonances, "frequency/field")?;
        let resonances = FrequencyPlan::new(resonance_pairs)?;

        // Linewidths are entered as whole gauss.
        let low = whole_gauss(parse_number(&input.linewidth_low, "initial linewidth")?);
        let high = whole_gauss(parse_number(&input.linewidth_high, "final linewidth")?);
        let linewidth = LinewidthBounds::new(low, high)?;

        let field_step = match input.field_step.trim() {
            "" => None,
            text => {
                let step = round1(parse_number(text, "field step size")?);
                (step != 0.0).then_some(step)
            }
        };

        let default_shift = match input.field_shift.trim() {
            "" => 0.0,
            text => whole_gauss(round1(parse_number(text, "field shift")?)),
        };

        Ok(Self {
            temperatures,
            resonances,
            linewidth,
            field_step,
            default_shift,
            spacing: input.spacing,
            reverse: input.reverse,
        })
    }

    /// The generator configured for this campaign.
    pub fn generator(&self) -> FieldPlanGenerator {
        FieldPlanGenerator::new(self.spacing, self.field_step)
    }

    /// Resonance fields for a temperature step with the given shift.
    pub fn frequency_plan(&self, shift: f64) -> FrequencyPlan {
        self.resonances.shifted(shift)
    }

    /// Field plan for one temperature step.
    pub fn field_plan(&self, shift: f64, reverse: bool) -> AppResult<FieldPlan> {
        self.generator()
            .generate(&self.frequency_plan(shift), self.linewidth, reverse)
    }

    /// Sweep direction for the temperature step at `index`.
    ///
    /// The direction flips on every odd-indexed step, so steps run
    /// `r, !r, !r, r, r, !r, ...` starting from the campaign's `reverse`.
    pub fn reverse_at(&self, index: usize) -> bool {
        let toggles = (index + 1) / 2;
        self.reverse ^ (toggles % 2 == 1)
    }

    /// Generate every plan the campaign will need so that a degenerate plan is
    /// reported before the rig moves.
    pub fn validate_plans(&self) -> AppResult<()> {
        if self.temperatures.is_empty() {
            self.field_plan(self.default_shift, self.reverse)?;
        }
        for step in &self.temperatures {
            self.field_plan(step.field_shift, self.reverse)?;
        }
        Ok(())
    }
}

fn parse_number(text: &str, what: &str) -> AppResult<f64> {
    let trimmed = text.trim();
    let value: f64 = trimmed.parse().map_err(|_| {
        DaqError::Configuration(format!("The {what} '{trimmed}' is not a number"))
    })?;
    if !value.is_finite() {
        return Err(DaqError::Configuration(format!(
            "The {what} '{trimmed}' is not finite"
        )));
    }
    Ok(value)
}

/// Parse `"a: b, c: d"` into pairs. Blank entries (e.g. a trailing comma) are ignored.
pub fn parse_pairs(text: &str, what: &str) -> AppResult<Vec<(f64, f64)>> {
    text.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (key, value) = entry.split_once(':').ok_or_else(|| {
                DaqError::Configuration(format!("':' is missing in {what} pair '{entry}'"))
            })?;
            Ok((parse_number(key, what)?, parse_number(value, what)?))
        })
        .collect()
}
