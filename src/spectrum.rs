//! Frequency samples and assembled spectra

use crate::{
    error::SpectrumError,
    positioner::Polarization,
    time::TimeData,
};

/// One captured point: frequency in Hz, amplitude in dBm
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrequencySample {
    pub frequency: f64,
    pub amplitude: f64,
}

impl FrequencySample {
    pub fn new(frequency: f64, amplitude: f64) -> Self {
        Self {
            frequency,
            amplitude,
        }
    }
}

/// Samples in strictly increasing frequency order
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Spectrum {
    samples: Vec<FrequencySample>,
}

impl Spectrum {
    pub fn new(samples: Vec<FrequencySample>) -> Result<Self, SpectrumError> {
        check_order(&samples, 0, None)?;
        Ok(Self { samples })
    }

    pub fn from_parts(frequencies: &[f64], amplitudes: &[f64]) -> Result<Self, SpectrumError> {
        if frequencies.len() != amplitudes.len() {
            return Err(SpectrumError::LengthMismatch {
                frequencies: frequencies.len(),
                amplitudes: amplitudes.len(),
            });
        }
        Self::new(
            frequencies
                .iter()
                .zip(amplitudes)
                .map(|(&f, &a)| FrequencySample::new(f, a))
                .collect(),
        )
    }

    pub fn samples(&self) -> &[FrequencySample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn frequencies(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|s| s.frequency)
    }

    pub fn amplitudes(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|s| s.amplitude)
    }

    pub fn first_hz(&self) -> Option<f64> {
        self.samples.first().map(|s| s.frequency)
    }

    pub fn last_hz(&self) -> Option<f64> {
        self.samples.last().map(|s| s.frequency)
    }

    /// Append the samples of the next band in a plan.
    ///
    /// The first sample of `band` is dropped when it repeats the current last
    /// frequency (within `tolerance_hz`), which is how adjacent bands share their
    /// boundary point. Everything else must continue strictly increasing.
    pub fn append_band(
        &mut self,
        band: Vec<FrequencySample>,
        tolerance_hz: f64,
    ) -> Result<(), SpectrumError> {
        let mut band = band.into_iter().peekable();
        if let (Some(last), Some(first)) = (self.samples.last(), band.peek()) {
            if (first.frequency - last.frequency).abs() <= tolerance_hz {
                band.next();
            }
        }
        let offset = self.samples.len();
        let tail: Vec<_> = band.collect();
        check_order(&tail, offset, self.last_hz())?;
        self.samples.extend(tail);
        Ok(())
    }

    /// New spectrum on the same grid with every amplitude transformed
    pub fn map_amplitudes(&self, mut f: impl FnMut(&FrequencySample) -> f64) -> Spectrum {
        Spectrum {
            samples: self
                .samples
                .iter()
                .map(|s| FrequencySample::new(s.frequency, f(s)))
                .collect(),
        }
    }

    /// Same grid as `other`, frequency by frequency, within `tolerance_hz`
    pub fn same_grid(&self, other: &Spectrum, tolerance_hz: f64) -> bool {
        self.len() == other.len()
            && self
                .frequencies()
                .zip(other.frequencies())
                .all(|(a, b)| (a - b).abs() <= tolerance_hz)
    }
}

fn check_order(
    samples: &[FrequencySample],
    offset: usize,
    previous: Option<f64>,
) -> Result<(), SpectrumError> {
    let mut previous = previous;
    for (i, s) in samples.iter().enumerate() {
        if !s.frequency.is_finite() || !s.amplitude.is_finite() {
            return Err(SpectrumError::NotFinite { index: offset + i });
        }
        if let Some(p) = previous {
            if s.frequency <= p {
                return Err(SpectrumError::NotIncreasing {
                    index: offset + i,
                    previous_hz: p,
                    freq_hz: s.frequency,
                });
            }
        }
        previous = Some(s.frequency);
    }
    Ok(())
}

/// A spectrum together with where and when it was taken
#[derive(Clone, Debug)]
pub struct Observation {
    pub spectrum: Spectrum,
    pub time: TimeData,
    pub azimuth_deg: Option<f64>,
    pub polarization: Option<Polarization>,
    /// Whether the amplitudes went through front-end calibration
    pub calibrated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band(start: u32, stop: u32) -> Vec<FrequencySample> {
        (start..=stop)
            .map(|f| FrequencySample::new(f as f64, -100.0 + f as f64))
            .collect()
    }

    #[test]
    fn rejects_unordered_samples() {
        let err = Spectrum::from_parts(&[1.0, 3.0, 2.0], &[0.0, 0.0, 0.0]).unwrap_err();
        assert_eq!(
            err,
            SpectrumError::NotIncreasing {
                index: 2,
                previous_hz: 3.0,
                freq_hz: 2.0
            }
        );
        assert!(Spectrum::from_parts(&[1.0, 1.0], &[0.0, 0.0]).is_err());
        assert!(Spectrum::from_parts(&[1.0], &[f64::NAN]).is_err());
    }

    #[test]
    fn boundary_sample_is_not_duplicated() {
        let mut spectrum = Spectrum::default();
        spectrum.append_band(band(0, 10), 0.5).unwrap();
        spectrum.append_band(band(10, 20), 0.5).unwrap();
        let freqs: Vec<f64> = spectrum.frequencies().collect();
        let expected: Vec<f64> = (0..=20).map(|f| f as f64).collect();
        assert_eq!(freqs, expected);
    }

    #[test]
    fn overlapping_band_is_rejected() {
        let mut spectrum = Spectrum::default();
        spectrum.append_band(band(0, 10), 0.5).unwrap();
        assert!(spectrum.append_band(band(5, 20), 0.5).is_err());
        // A failed append leaves the spectrum untouched
        assert_eq!(spectrum.len(), 11);
    }
}
