//! Quick lineshape estimate from a single field sweep.
//!
//! The lock-in X signal of an FMR line is the field derivative of the
//! absorption. Its extrema sit a half peak-to-peak width either side of the
//! resonance, which gives resonance field and width without a fit.

use crate::error::{AppResult, DaqError};
use crate::measurement::MeasurementRecord;
use serde::Serialize;

/// Peak-to-peak width to Lorentzian full width at half maximum.
const SQRT_3: f64 = 1.732_050_807_568_877_2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LineshapeEstimate {
    /// Midpoint of the two extrema (G)
    pub resonance_field: f64,
    /// `sqrt(3)` times the extrema separation (G)
    pub linewidth: f64,
    pub field_at_max: f64,
    pub field_at_min: f64,
    pub signal_max: f64,
    pub signal_min: f64,
    /// Symmetric Lorentzian amplitude seed
    pub symmetric_amplitude: f64,
    /// Antisymmetric Lorentzian amplitude seed
    pub antisymmetric_amplitude: f64,
}

/// Estimate the line in `records` from the extrema of the X signal.
pub fn estimate(records: &[MeasurementRecord]) -> AppResult<LineshapeEstimate> {
    let mut points = records
        .iter()
        .filter(|r| r.lockin_x.is_finite() && r.field_gauss.is_finite());
    let first = points
        .next()
        .ok_or_else(|| DaqError::Processing("no finite points to estimate from".to_string()))?;

    let (max, min) = points.fold((first, first), |(max, min), r| {
        (
            if r.lockin_x > max.lockin_x { r } else { max },
            if r.lockin_x < min.lockin_x { r } else { min },
        )
    });

    let linewidth = SQRT_3 * (max.field_gauss - min.field_gauss).abs();
    let peak_center = 0.5 * (max.lockin_x + min.lockin_x);
    let height = max.lockin_x - peak_center;

    Ok(LineshapeEstimate {
        resonance_field: 0.5 * (max.field_gauss + min.field_gauss),
        linewidth,
        field_at_max: max.field_gauss,
        field_at_min: min.field_gauss,
        signal_max: max.lockin_x,
        signal_min: min.lockin_x,
        symmetric_amplitude: height * linewidth.powi(4) / 16.0,
        antisymmetric_amplitude: height * linewidth.powi(3) * 2.0 / (3.0 * SQRT_3),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep(center: f64, half_width: f64) -> Vec<MeasurementRecord> {
        (0..=200)
            .map(|i| {
                let field = center - 100.0 + f64::from(i);
                let u = (field - center) / half_width;
                MeasurementRecord {
                    temperature_k: 300.0,
                    frequency_ghz: 10.0,
                    field_gauss: field,
                    lockin_x: -2.0 * u / (1.0 + u * u).powi(2),
                    lockin_y: 0.0,
                    time_constant: 0.1,
                }
            })
            .collect()
    }

    #[test]
    fn recovers_center_and_width() {
        // derivative extrema of a Lorentzian sit at +-half_width/sqrt(3)
        let half_width = 10.0 * SQRT_3;
        let estimate = estimate(&sweep(2400.0, half_width)).unwrap();
        assert_eq!(estimate.field_at_max, 2390.0);
        assert_eq!(estimate.field_at_min, 2410.0);
        assert_eq!(estimate.resonance_field, 2400.0);
        assert!((estimate.linewidth - 20.0 * SQRT_3).abs() < 1e-9);
        assert!(estimate.symmetric_amplitude > 0.0);
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(estimate(&[]), Err(DaqError::Processing(_))));
    }
}
