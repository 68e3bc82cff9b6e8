//! Frequency-dependent correction curves

use num_traits::Float;
use serde::Deserialize;
use tracing::debug;

use crate::{
    error::CurveError,
    spectrum::{FrequencySample, Spectrum},
};

/// Piecewise-linear mapping from frequency (Hz) to a value in dB.
///
/// Defined only between its first and last point, never extrapolated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Vec<(f64, f64)>")]
pub struct CalibrationCurve {
    points: Vec<(f64, f64)>,
}

impl CalibrationCurve {
    pub fn new(points: Vec<(f64, f64)>) -> Result<Self, CurveError> {
        if points.is_empty() {
            return Err(CurveError::Empty);
        }
        for (index, &(f, v)) in points.iter().enumerate() {
            if !f.is_finite() || !v.is_finite() {
                return Err(CurveError::NotFinite { index });
            }
            if index > 0 && f <= points[index - 1].0 {
                return Err(CurveError::NotIncreasing { index, freq_hz: f });
            }
        }
        Ok(Self { points })
    }

    /// Flat curve over `[start_hz, stop_hz]`
    pub fn constant(start_hz: f64, stop_hz: f64, value: f64) -> Result<Self, CurveError> {
        if start_hz == stop_hz {
            Self::new(vec![(start_hz, value)])
        } else {
            Self::new(vec![(start_hz, value), (stop_hz, value)])
        }
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    pub fn domain(&self) -> (f64, f64) {
        // `new` guarantees at least one point
        let first = self.points[0].0;
        let last = self.points[self.points.len() - 1].0;
        (first, last)
    }

    pub fn value_at(&self, freq_hz: f64) -> Result<f64, CurveError> {
        let (min_hz, max_hz) = self.domain();
        if !(freq_hz >= min_hz && freq_hz <= max_hz) {
            return Err(CurveError::OutOfDomain {
                freq_hz,
                min_hz,
                max_hz,
            });
        }
        let upper = self.points.partition_point(|&(f, _)| f < freq_hz);
        if upper == 0 {
            return Ok(self.points[0].1);
        }
        let (f1, v1) = self.points[upper];
        if f1 == freq_hz {
            return Ok(v1);
        }
        let (f0, v0) = self.points[upper - 1];
        Ok(lerp(f0, v0, f1, v1, freq_hz))
    }

    pub fn negated(&self) -> Self {
        self.map_values(|v| -v)
    }

    pub fn map_values(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            points: self.points.iter().map(|&(x, v)| (x, f(v))).collect(),
        }
    }

    /// Pointwise combination on the union of both curves' breakpoints, over the
    /// frequencies both curves define
    pub fn combine(
        &self,
        other: &CalibrationCurve,
        op: impl Fn(f64, f64) -> f64,
    ) -> Result<Self, CurveError> {
        let (a_min, a_max) = self.domain();
        let (b_min, b_max) = other.domain();
        let lo = a_min.max(b_min);
        let hi = a_max.min(b_max);
        if lo > hi {
            return Err(CurveError::Disjoint);
        }
        let mut grid: Vec<f64> = self
            .points
            .iter()
            .chain(&other.points)
            .map(|&(f, _)| f)
            .filter(|f| *f > lo && *f < hi)
            .chain([lo, hi])
            .collect();
        grid.sort_by(|a, b| a.total_cmp(b));
        grid.dedup();
        let points = grid
            .into_iter()
            .map(|f| -> Result<(f64, f64), CurveError> {
                Ok((f, op(self.value_at(f)?, other.value_at(f)?)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(points)
    }
}

impl TryFrom<Vec<(f64, f64)>> for CalibrationCurve {
    type Error = CurveError;

    fn try_from(points: Vec<(f64, f64)>) -> Result<Self, Self::Error> {
        Self::new(points)
    }
}

fn lerp<F: Float>(x0: F, y0: F, x1: F, y1: F, x: F) -> F {
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// Add `curve` (dB) to every sample of `spectrum`
pub fn apply_correction(
    spectrum: &Spectrum,
    curve: &CalibrationCurve,
) -> Result<Spectrum, CurveError> {
    let samples = spectrum
        .samples()
        .iter()
        .map(|s| -> Result<FrequencySample, CurveError> {
            Ok(FrequencySample::new(
                s.frequency,
                s.amplitude + curve.value_at(s.frequency)?,
            ))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Spectrum::new(samples)?)
}

/// Refers measured power to the antenna input using cable loss and antenna gain
#[derive(Debug, Clone)]
pub struct CurveAdjuster {
    correction: CalibrationCurve,
}

impl CurveAdjuster {
    /// Correction is `cable_loss - antenna_gain`
    pub fn new(
        antenna_gain: &CalibrationCurve,
        cable_loss: &CalibrationCurve,
    ) -> Result<Self, CurveError> {
        let correction = cable_loss.combine(antenna_gain, |loss, gain| loss - gain)?;
        let (lo, hi) = correction.domain();
        debug!(
            points = correction.points().len(),
            lo_hz = lo,
            hi_hz = hi,
            "Correction curve built"
        );
        Ok(Self { correction })
    }

    pub fn correction(&self) -> &CalibrationCurve {
        &self.correction
    }

    pub fn apply(&self, spectrum: &Spectrum) -> Result<Spectrum, CurveError> {
        apply_correction(spectrum, &self.correction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spectrum() -> Spectrum {
        Spectrum::from_parts(&[100.0, 150.0, 200.0], &[-90.0, -85.5, -70.25]).unwrap()
    }

    #[test]
    fn interpolates_linearly() {
        let curve = CalibrationCurve::new(vec![(100.0, 0.0), (200.0, 10.0)]).unwrap();
        assert_eq!(curve.value_at(100.0).unwrap(), 0.0);
        assert_eq!(curve.value_at(150.0).unwrap(), 5.0);
        assert_eq!(curve.value_at(200.0).unwrap(), 10.0);
    }

    #[test]
    fn no_extrapolation() {
        let curve = CalibrationCurve::new(vec![(100.0, 0.0), (200.0, 10.0)]).unwrap();
        assert_eq!(
            curve.value_at(99.0),
            Err(CurveError::OutOfDomain {
                freq_hz: 99.0,
                min_hz: 100.0,
                max_hz: 200.0
            })
        );
        let narrow = CalibrationCurve::constant(120.0, 200.0, 1.0).unwrap();
        assert!(apply_correction(&spectrum(), &narrow).is_err());
    }

    #[test]
    fn rejects_malformed_curves() {
        assert_eq!(CalibrationCurve::new(vec![]), Err(CurveError::Empty));
        assert!(matches!(
            CalibrationCurve::new(vec![(1.0, 0.0), (1.0, 1.0)]),
            Err(CurveError::NotIncreasing { index: 1, .. })
        ));
        assert!(serde_json::from_str::<CalibrationCurve>("[[2.0, 0.0], [1.0, 0.0]]").is_err());
    }

    #[test]
    fn opposite_curves_cancel() {
        let curve = CalibrationCurve::new(vec![(50.0, 3.0), (120.0, 7.5), (250.0, -2.0)]).unwrap();
        let there = apply_correction(&spectrum(), &curve).unwrap();
        let back = apply_correction(&there, &curve.negated()).unwrap();
        for (a, b) in back.amplitudes().zip(spectrum().amplitudes()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn combination_uses_union_of_breakpoints() {
        let gain = CalibrationCurve::new(vec![(0.0, 0.0), (100.0, 10.0)]).unwrap();
        let loss = CalibrationCurve::new(vec![(50.0, 1.0), (75.0, 2.0), (150.0, 3.0)]).unwrap();
        let adjuster = CurveAdjuster::new(&gain, &loss).unwrap();
        let points = adjuster.correction().points();
        let freqs: Vec<f64> = points.iter().map(|p| p.0).collect();
        assert_eq!(freqs, vec![50.0, 75.0, 100.0]);
        // loss - gain
        assert!((points[0].1 - (1.0 - 5.0)).abs() < 1e-12);
        assert!((points[2].1 - (2.0 + 1.0 / 3.0 - 10.0)).abs() < 1e-12);
    }

    #[test]
    fn disjoint_curves_do_not_combine() {
        let a = CalibrationCurve::constant(0.0, 10.0, 1.0).unwrap();
        let b = CalibrationCurve::constant(20.0, 30.0, 1.0).unwrap();
        assert_eq!(a.combine(&b, |x, y| x + y), Err(CurveError::Disjoint));
    }
}
