//! Field plans: which field setpoints to visit at each frequency.
//!
//! For every frequency the expected peak-to-peak linewidth ΔH is interpolated
//! between the campaign's linewidth endpoints. The sweep covers seven
//! linewidths centred on the expected resonance field:
//!
//! ```text
//!  -0.50     -0.25   -0.12        +0.12   +0.25     +0.50   (× 7ΔH around Hres)
//!    |  4×step |3×step|    1×step   |3×step|  4×step |
//!    coarse ──────────── fine at the peak ──────────── coarse
//! ```
//!
//! [`Spacing::Equal`] samples the same span uniformly instead. Both strategies
//! produce fields rounded to 0.1 G and can be reversed as a whole to sweep
//! downwards.

use crate::error::{AppResult, DaqError};
use crate::experiment::campaign::{round1, FrequencyPlan, LinewidthBounds};
use serde::{Deserialize, Serialize};

/// Width of the swept span in linewidths.
pub const LINEWIDTHS_PER_SWEEP: f64 = 7.0;

/// Auto step is the linewidth divided by this.
pub const POINTS_PER_LINEWIDTH: f64 = 16.0;

/// Segment boundaries as fractions of the span, relative to the centre.
const SEGMENT_EDGES: [f64; 6] = [-0.50, -0.25, -0.12, 0.12, 0.25, 0.50];

/// Step multiplier of each segment, coarse at the wings.
const SEGMENT_STEP_MULTIPLIERS: [f64; 5] = [4.0, 3.0, 1.0, 3.0, 4.0];

/// How field points are distributed over the sweep span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Spacing {
    /// Uniform spacing at the base step
    Equal,
    /// Fine spacing around the resonance, coarser towards the wings
    #[default]
    CenterDense,
}

/// Ordered field setpoints (G) for one frequency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSequence {
    fields: Vec<f64>,
}

impl FieldSequence {
    /// Field setpoints in sweep order.
    pub fn fields(&self) -> &[f64] {
        &self.fields
    }

    /// Number of setpoints.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when there are no setpoints; never the case for a generated plan.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// First setpoint of the sweep.
    pub fn first(&self) -> Option<f64> {
        self.fields.first().copied()
    }

    /// Field spacing around the middle of the sweep, as logged at the start of a frequency.
    pub fn center_step(&self) -> Option<f64> {
        let mid = self.fields.len() / 2;
        if mid == 0 {
            return None;
        }
        Some(round1((self.fields[mid] - self.fields[mid - 1]).abs()))
    }

    fn reverse(&mut self) {
        self.fields.reverse();
    }
}

impl IntoIterator for FieldSequence {
    type Item = f64;
    type IntoIter = std::vec::IntoIter<f64>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

/// The sweep planned for one frequency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrequencySweep {
    /// RF frequency in GHz
    pub frequency_ghz: f64,
    /// Expected resonance field (G), shift included
    pub resonance_field: f64,
    /// Interpolated peak-to-peak linewidth (G)
    pub linewidth: f64,
    /// Base field step (G)
    pub step: f64,
    /// Setpoints in sweep order
    pub fields: FieldSequence,
}

/// Sweeps for every frequency of one temperature step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldPlan {
    sweeps: Vec<FrequencySweep>,
    reverse: bool,
}

impl FieldPlan {
    /// Sweeps in measurement order: ascending frequency, descending when reversed.
    pub fn sweeps(&self) -> impl Iterator<Item = &FrequencySweep> + '_ {
        let mut ordered: Vec<&FrequencySweep> = self.sweeps.iter().collect();
        if self.reverse {
            ordered.reverse();
        }
        ordered.into_iter()
    }

    /// Consume the plan, yielding sweeps in measurement order.
    pub fn into_sweeps(self) -> Vec<FrequencySweep> {
        let mut sweeps = self.sweeps;
        if self.reverse {
            sweeps.reverse();
        }
        sweeps
    }

    /// Sweep planned for `frequency_ghz`, if any.
    pub fn sweep_at(&self, frequency_ghz: f64) -> Option<&FrequencySweep> {
        self.sweeps
            .iter()
            .find(|sweep| sweep.frequency_ghz == frequency_ghz)
    }

    /// Whether sweeps run downwards.
    pub fn is_reversed(&self) -> bool {
        self.reverse
    }

    /// Total number of field points across all frequencies.
    pub fn total_points(&self) -> usize {
        self.sweeps.iter().map(|sweep| sweep.fields.len()).sum()
    }
}

/// Builds [`FieldPlan`]s from resonance fields and linewidth bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldPlanGenerator {
    spacing: Spacing,
    fixed_step: Option<f64>,
}

impl FieldPlanGenerator {
    /// A generator using `spacing`; `fixed_step` of `None` or zero derives the step from ΔH.
    pub fn new(spacing: Spacing, fixed_step: Option<f64>) -> Self {
        Self {
            spacing,
            fixed_step: fixed_step.filter(|step| *step != 0.0),
        }
    }

    /// Spacing strategy in use.
    pub fn spacing(&self) -> Spacing {
        self.spacing
    }

    /// Plan every frequency of `plan`.
    ///
    /// # Errors
    ///
    /// [`DaqError::Plan`] when a step is zero, negative or not finite, or when
    /// a segment would hold fewer than two points.
    pub fn generate(
        &self,
        plan: &FrequencyPlan,
        linewidth: LinewidthBounds,
        reverse: bool,
    ) -> AppResult<FieldPlan> {
        let span = plan.frequency_span();
        let sweeps = plan
            .points()
            .iter()
            .map(|point| {
                let linewidth = linewidth.at(point.frequency_ghz, span);
                let step = self
                    .fixed_step
                    .unwrap_or_else(|| round1(linewidth / POINTS_PER_LINEWIDTH));
                let mut fields = self
                    .sweep_fields(point.resonance_field, LINEWIDTHS_PER_SWEEP * linewidth, step)
                    .map_err(|err| match err {
                        DaqError::Plan(reason) => DaqError::Plan(format!(
                            "{} GHz (ΔH {:.2} G): {}",
                            point.frequency_ghz, linewidth, reason
                        )),
                        other => other,
                    })?;
                if reverse {
                    fields.reverse();
                }
                log::debug!(
                    "At frequency {} GHz: step size {} G, {} fields from {:?} to {:?}",
                    point.frequency_ghz,
                    step,
                    fields.len(),
                    fields.fields.first(),
                    fields.fields.last()
                );
                Ok(FrequencySweep {
                    frequency_ghz: point.frequency_ghz,
                    resonance_field: point.resonance_field,
                    linewidth,
                    step,
                    fields,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(FieldPlan { sweeps, reverse })
    }

    fn sweep_fields(&self, center: f64, range: f64, step: f64) -> AppResult<FieldSequence> {
        if !step.is_finite() || step <= 0.0 {
            return Err(DaqError::Plan(format!("step size {step} G is not positive")));
        }
        let fields = match self.spacing {
            Spacing::Equal => {
                let start = center - 0.5 * range;
                let stop = center + 0.5 * range;
                linspace(start, stop, point_count(range, step)?)
            }
            Spacing::CenterDense => center_dense_segments(center, range, step)?
                .into_iter()
                .enumerate()
                .flat_map(|(index, segment)| segment.into_iter().skip(usize::from(index > 0)))
                .collect(),
        };
        Ok(FieldSequence { fields })
    }
}

/// The five density segments of a centre-dense sweep, each in ascending order
/// and still holding its shared boundary point.
pub fn center_dense_segments(center: f64, range: f64, step: f64) -> AppResult<Vec<Vec<f64>>> {
    if !step.is_finite() || step <= 0.0 {
        return Err(DaqError::Plan(format!("step size {step} G is not positive")));
    }
    let edges = SEGMENT_EDGES.map(|fraction| center + fraction * range);
    edges
        .windows(2)
        .zip(SEGMENT_STEP_MULTIPLIERS)
        .map(|(edge, multiplier)| {
            let count = point_count(edge[1] - edge[0], multiplier * step)?;
            Ok(linspace(edge[0], edge[1], count))
        })
        .collect()
}

fn point_count(width: f64, step: f64) -> AppResult<usize> {
    let count = (width / step).floor();
    if !count.is_finite() || count < 2.0 {
        return Err(DaqError::Plan(format!(
            "a {width:.2} G segment at {step} G spacing holds fewer than 2 points"
        )));
    }
    Ok(count as usize)
}

/// `count` evenly spaced values from `start` to `stop` inclusive, rounded to 0.1 G.
fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    let step = (stop - start) / (count - 1) as f64;
    (0..count)
        .map(|i| {
            if i + 1 == count {
                round1(stop)
            } else {
                round1(start + step * i as f64)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn single(freq: f64, field: f64) -> FrequencyPlan {
        FrequencyPlan::new([(freq, field)]).unwrap()
    }

    fn bounds(low: f64, high: f64) -> LinewidthBounds {
        LinewidthBounds::new(low, high).unwrap()
    }

    fn is_strictly_increasing(values: &[f64]) -> bool {
        values.windows(2).all(|w| w[0] < w[1])
    }

    fn is_non_decreasing(values: &[f64]) -> bool {
        values.windows(2).all(|w| w[0] <= w[1])
    }

    #[test]
    fn equal_spacing_example_at_20_ghz() {
        let generator = FieldPlanGenerator::new(Spacing::Equal, Some(1.0));
        let plan = generator
            .generate(&single(20.0, 6001.0), bounds(4.0, 5.0), false)
            .unwrap();
        let sweep = plan.sweep_at(20.0).unwrap();
        let fields = sweep.fields.fields();

        assert_eq!(sweep.linewidth, 4.0);
        assert_eq!(fields.len(), 28);
        assert_eq!(fields[0], 5987.0);
        assert_eq!(fields[27], 6015.0);
        assert!(is_strictly_increasing(fields));
    }

    #[test]
    fn single_frequency_uses_low_linewidth() {
        let generator = FieldPlanGenerator::new(Spacing::CenterDense, None);
        let plan = generator
            .generate(&single(10.0, 2400.0), bounds(16.0, 40.0), false)
            .unwrap();
        let sweep = plan.sweep_at(10.0).unwrap();
        assert_eq!(sweep.linewidth, 16.0);
        assert_eq!(sweep.step, 1.0);
    }

    #[test]
    fn linewidth_is_interpolated_across_frequencies() {
        let plan = FrequencyPlan::new([(10.0, 2400.0), (15.0, 4000.0), (20.0, 6000.0)]).unwrap();
        let generator = FieldPlanGenerator::new(Spacing::Equal, None);
        let planned = generator.generate(&plan, bounds(16.0, 32.0), false).unwrap();
        let widths: Vec<f64> = planned.sweeps().map(|s| s.linewidth).collect();
        assert_eq!(widths, vec![16.0, 24.0, 32.0]);
        let steps: Vec<f64> = planned.sweeps().map(|s| s.step).collect();
        assert_eq!(steps, vec![1.0, 1.5, 2.0]);
    }

    #[test]
    fn auto_step_rounds_half_tenths_down_when_stored_below() {
        assert_eq!(round1(0.35), 0.3);

        let plan = FrequencyPlan::new([(10.0, 2400.0), (12.0, 3000.0), (20.0, 6000.0)]).unwrap();
        let generator = FieldPlanGenerator::new(Spacing::Equal, None);
        let planned = generator.generate(&plan, bounds(5.0, 8.0), false).unwrap();
        let sweep = planned.sweep_at(12.0).unwrap();

        assert_eq!(sweep.linewidth, 5.6);
        assert_eq!(sweep.step, 0.3);
        assert_eq!(sweep.fields.len(), 130);
    }

    #[test]
    fn center_dense_drops_shared_boundaries() {
        let generator = FieldPlanGenerator::new(Spacing::CenterDense, None);
        let plan = generator
            .generate(&single(10.0, 3000.0), bounds(16.0, 16.0), false)
            .unwrap();
        let fields = plan.sweep_at(10.0).unwrap().fields.fields().to_vec();

        let segments = center_dense_segments(3000.0, 112.0, 1.0).unwrap();
        let counts: Vec<usize> = segments.iter().map(Vec::len).collect();
        assert_eq!(counts, vec![7, 4, 26, 4, 7]);
        assert_eq!(fields.len(), 7 + 3 + 25 + 3 + 6);
        assert_eq!(fields[0], 2944.0);
        assert_eq!(*fields.last().unwrap(), 3056.0);
        assert!(is_strictly_increasing(&fields));
    }

    #[test]
    fn center_segment_is_finest() {
        let segments = center_dense_segments(3000.0, 112.0, 1.0).unwrap();
        let spacing = |segment: &Vec<f64>| segment[1] - segment[0];
        for outer in [0, 1, 3, 4] {
            assert!(spacing(&segments[2]) < spacing(&segments[outer]));
        }
        assert_eq!(segments[0].last(), segments[1].first());
        assert_eq!(segments[3].last(), segments[4].first());
    }

    #[test]
    fn reverse_flips_every_sweep_and_frequency_order() {
        let plan = FrequencyPlan::new([(19.0, 6000.0), (20.0, 6001.0)]).unwrap();
        for spacing in [Spacing::Equal, Spacing::CenterDense] {
            let generator = FieldPlanGenerator::new(spacing, None);
            let up = generator.generate(&plan, bounds(4.0, 5.0), false).unwrap();
            let down = generator.generate(&plan, bounds(4.0, 5.0), true).unwrap();

            let up_freqs: Vec<f64> = up.sweeps().map(|s| s.frequency_ghz).collect();
            let down_freqs: Vec<f64> = down.sweeps().map(|s| s.frequency_ghz).collect();
            assert_eq!(up_freqs, vec![19.0, 20.0]);
            assert_eq!(down_freqs, vec![20.0, 19.0]);

            for freq in [19.0, 20.0] {
                let mut expected = up.sweep_at(freq).unwrap().fields.fields().to_vec();
                expected.reverse();
                assert_eq!(down.sweep_at(freq).unwrap().fields.fields(), expected.as_slice());
            }
        }
    }

    #[test]
    fn zero_linewidth_is_a_plan_error() {
        let generator = FieldPlanGenerator::new(Spacing::Equal, None);
        let err = generator
            .generate(&single(10.0, 2400.0), bounds(0.0, 0.0), false)
            .unwrap_err();
        assert!(matches!(err, DaqError::Plan(_)));
    }

    #[test]
    fn negative_fixed_step_is_a_plan_error() {
        let generator = FieldPlanGenerator::new(Spacing::Equal, Some(-1.0));
        let err = generator
            .generate(&single(10.0, 2400.0), bounds(4.0, 4.0), false)
            .unwrap_err();
        assert!(err.to_string().contains("not positive"));
    }

    #[test]
    fn starved_segment_is_a_plan_error_not_a_short_sweep() {
        // 7 G outer segment at 4 G spacing holds a single point.
        let generator = FieldPlanGenerator::new(Spacing::CenterDense, Some(1.0));
        let err = generator
            .generate(&single(20.0, 6001.0), bounds(4.0, 5.0), false)
            .unwrap_err();
        assert!(matches!(err, DaqError::Plan(_)));
        assert!(err.to_string().contains("20 GHz"));
    }

    #[test]
    fn center_step_reports_the_fine_spacing() {
        let generator = FieldPlanGenerator::new(Spacing::CenterDense, None);
        let plan = generator
            .generate(&single(10.0, 3000.0), bounds(16.0, 16.0), true)
            .unwrap();
        let sweep = plan.sweep_at(10.0).unwrap();
        let step = sweep.fields.center_step().unwrap();
        assert!((1.0..=1.1).contains(&step));
        assert_eq!(sweep.fields.first(), Some(3056.0));
    }

    proptest! {
        #[test]
        fn equal_spacing_is_strictly_monotonic(
            f_low in 1.0f64..20.0,
            f_gap in 0.5f64..20.0,
            h_low in 500.0f64..12000.0,
            h_high in 500.0f64..12000.0,
            lw_low in 2u32..60,
            lw_high in 2u32..60,
        ) {
            let plan = FrequencyPlan::new([(f_low, h_low), (f_low + f_gap, h_high)]).unwrap();
            let generator = FieldPlanGenerator::new(Spacing::Equal, None);
            let planned = generator
                .generate(&plan, bounds(f64::from(lw_low), f64::from(lw_high)), false)
                .unwrap();
            for sweep in planned.sweeps() {
                prop_assert!(is_strictly_increasing(sweep.fields.fields()));
            }
        }

        #[test]
        fn center_dense_segments_are_monotonic(
            center in -12000.0f64..12000.0,
            linewidth in 2u32..80,
        ) {
            let linewidth = f64::from(linewidth);
            let step = round1(linewidth / POINTS_PER_LINEWIDTH);
            let segments = center_dense_segments(center, LINEWIDTHS_PER_SWEEP * linewidth, step).unwrap();
            prop_assert_eq!(segments.len(), 5);
            for segment in &segments {
                prop_assert!(segment.len() >= 2);
                prop_assert!(is_non_decreasing(segment));
            }
        }

        #[test]
        fn reversal_is_exact(
            field in 100.0f64..10000.0,
            linewidth in 2u32..60,
            dense in any::<bool>(),
        ) {
            let spacing = if dense { Spacing::CenterDense } else { Spacing::Equal };
            let generator = FieldPlanGenerator::new(spacing, None);
            let lw = bounds(f64::from(linewidth), f64::from(linewidth));
            let up = generator.generate(&single(12.0, field), lw, false).unwrap();
            let down = generator.generate(&single(12.0, field), lw, true).unwrap();
            let mut expected = up.sweep_at(12.0).unwrap().fields.fields().to_vec();
            expected.reverse();
            prop_assert_eq!(down.sweep_at(12.0).unwrap().fields.fields(), expected.as_slice());
        }
    }
}
