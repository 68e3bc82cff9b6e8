//! Interference detection, statistical and against absolute limits

use std::{collections::VecDeque, f64::consts::PI};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    band::BandPlan,
    curve::CalibrationCurve,
    error::{ConfigError, DetectionError},
    spectrum::Spectrum,
};

const SPEED_OF_LIGHT: f64 = 299_792_458.0;
/// Grids are compared to this precision (Hz)
const GRID_TOLERANCE_HZ: f64 = 1.0;
/// Longest baseline window, in sweeps
pub const MAX_RFI_WINDOW: usize = 1000;

/// A frequency found above its threshold
#[derive(Debug, Clone, PartialEq)]
pub struct RfiRecord {
    pub frequency_hz: f64,
    pub amplitude_dbm: f64,
    /// dB above the threshold
    pub excess_db: f64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ThresholdNorm {
    ItuRa769Vlbi,
    SkaMode1,
    SkaMode2,
}

/// Harmful-interference limit as spectral flux density
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AbsoluteThreshold {
    pub norm: ThresholdNorm,
    pub antenna_gain_dbi: f64,
    /// dB(W m^-2 Hz^-1) against frequency
    pub flux_density_db: CalibrationCurve,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RfiSettings {
    /// Sweeps in the baseline window
    pub window: usize,
    /// dB above the baseline median that counts as interference
    pub threshold_db: f64,
    /// Consecutive exceedances before a frequency is flagged
    #[serde(default = "default_consecutive")]
    pub consecutive: usize,
    #[serde(default)]
    pub absolute: Option<AbsoluteThreshold>,
}

fn default_consecutive() -> usize {
    1
}

impl RfiSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window == 0 || self.window > MAX_RFI_WINDOW {
            return Err(ConfigError::invalid(
                "rfi.window",
                format!("must hold between 1 and {MAX_RFI_WINDOW} sweeps"),
            ));
        }
        if self.consecutive == 0 || self.consecutive > self.window {
            return Err(ConfigError::invalid(
                "rfi.consecutive",
                format!("must be between 1 and the window ({})", self.window),
            ));
        }
        if !(self.threshold_db > 0.0) {
            return Err(ConfigError::invalid("rfi.threshold_db", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Track {
    above: usize,
    below: usize,
    flagged: bool,
}

/// Median-baseline detector over a rolling window of sweeps.
///
/// All sweeps must share the frequency grid of the first one pushed.
#[derive(Debug)]
pub struct RfiDetector {
    window: usize,
    threshold_db: f64,
    consecutive: usize,
    grid: Vec<f64>,
    history: VecDeque<Vec<f64>>,
    tracks: Vec<Track>,
}

impl RfiDetector {
    pub fn new(window: usize, threshold_db: f64, consecutive: usize) -> Self {
        Self {
            window: window.max(1),
            threshold_db,
            consecutive: consecutive.max(1),
            grid: Vec::new(),
            history: VecDeque::new(),
            tracks: Vec::new(),
        }
    }

    pub fn from_settings(settings: &RfiSettings) -> Self {
        Self::new(settings.window, settings.threshold_db, settings.consecutive)
    }

    pub fn reset(&mut self) {
        self.grid.clear();
        self.history.clear();
        self.tracks.clear();
    }

    /// Whether enough sweeps have been seen to form a baseline
    pub fn is_ready(&self) -> bool {
        self.history.len() >= self.window
    }

    /// Feed one sweep, returning records for frequencies flagged by it
    pub fn push(
        &mut self,
        spectrum: &Spectrum,
        at: DateTime<Utc>,
    ) -> Result<Vec<RfiRecord>, DetectionError> {
        if self.grid.is_empty() {
            self.grid = spectrum.frequencies().collect();
            self.tracks = vec![Track::default(); self.grid.len()];
        } else {
            self.check_grid(spectrum)?;
        }

        let mut records = Vec::new();
        if let Some(baseline) = self.baseline() {
            for (i, sample) in spectrum.samples().iter().enumerate() {
                let excess = sample.amplitude - baseline[i];
                let track = &mut self.tracks[i];
                if excess > self.threshold_db {
                    track.above += 1;
                    track.below = 0;
                    if !track.flagged && track.above >= self.consecutive {
                        track.flagged = true;
                        records.push(RfiRecord {
                            frequency_hz: sample.frequency,
                            amplitude_dbm: sample.amplitude,
                            excess_db: excess - self.threshold_db,
                            detected_at: at,
                        });
                    }
                } else {
                    track.above = 0;
                    if track.flagged {
                        track.below += 1;
                        if track.below >= self.window {
                            track.flagged = false;
                            track.below = 0;
                            debug!(freq_hz = sample.frequency, "RFI cleared");
                        }
                    }
                }
            }
        }

        self.history.push_back(spectrum.amplitudes().collect());
        while self.history.len() > self.window {
            self.history.pop_front();
        }
        if !records.is_empty() {
            info!(new = records.len(), "RFI detected");
        }
        Ok(records)
    }

    fn check_grid(&self, spectrum: &Spectrum) -> Result<(), DetectionError> {
        if spectrum.len() != self.grid.len() {
            return Err(DetectionError::GridLength {
                expected: self.grid.len(),
                actual: spectrum.len(),
            });
        }
        for (index, (expected_hz, actual_hz)) in self.grid.iter().zip(spectrum.frequencies()).enumerate() {
            if (expected_hz - actual_hz).abs() > GRID_TOLERANCE_HZ {
                return Err(DetectionError::GridMismatch {
                    index,
                    expected_hz: *expected_hz,
                    actual_hz,
                });
            }
        }
        Ok(())
    }

    /// Per-frequency median of the window, once it is full
    pub fn baseline(&self) -> Option<Vec<f64>> {
        if !self.is_ready() {
            return None;
        }
        let mut column = Vec::with_capacity(self.window);
        Some(
            (0..self.grid.len())
                .map(|i| {
                    column.clear();
                    column.extend(self.history.iter().map(|sweep| sweep[i]));
                    median(&mut column)
                })
                .collect(),
        )
    }

    /// Frequencies currently flagged
    pub fn flagged(&self) -> Vec<f64> {
        self.grid
            .iter()
            .zip(&self.tracks)
            .filter(|(_, t)| t.flagged)
            .map(|(f, _)| *f)
            .collect()
    }
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Power (dBm) an antenna of `gain_dbi` delivers in `rbw_hz` from a spectral
/// flux density of `flux_db` dB(W m^-2 Hz^-1)
pub fn flux_density_to_power_dbm(flux_db: f64, gain_dbi: f64, freq_hz: f64, rbw_hz: f64) -> f64 {
    let aperture = 10f64.powf(gain_dbi / 10.0) * SPEED_OF_LIGHT.powi(2) / (4.0 * PI * freq_hz.powi(2));
    let power_w = 10f64.powf(flux_db / 10.0) * aperture * rbw_hz;
    10.0 * power_w.log10() + 30.0
}

/// Samples above an absolute limit, with the number of contiguous runs they form
#[derive(Debug, Clone, PartialEq)]
pub struct AbsoluteDetection {
    pub norm: ThresholdNorm,
    pub records: Vec<RfiRecord>,
    pub bands: usize,
}

#[derive(Debug, Clone)]
pub struct ThresholdCurve {
    settings: AbsoluteThreshold,
}

impl ThresholdCurve {
    pub fn new(settings: AbsoluteThreshold) -> Self {
        Self { settings }
    }

    pub fn threshold_dbm(&self, freq_hz: f64, rbw_hz: f64) -> Result<f64, DetectionError> {
        let flux = self.settings.flux_density_db.value_at(freq_hz)?;
        Ok(flux_density_to_power_dbm(
            flux,
            self.settings.antenna_gain_dbi,
            freq_hz,
            rbw_hz,
        ))
    }

    /// Flag every sample of a calibrated spectrum above the limit
    pub fn detect_absolute(
        &self,
        spectrum: &Spectrum,
        plan: &BandPlan,
        at: DateTime<Utc>,
    ) -> Result<AbsoluteDetection, DetectionError> {
        let mut records = Vec::new();
        let mut bands = 0;
        let mut in_band = false;
        for s in spectrum.samples() {
            let rbw = plan
                .rbw_at(s.frequency)
                .ok_or(DetectionError::NoBandwidth(s.frequency))?;
            let threshold = self.threshold_dbm(s.frequency, rbw)?;
            if s.amplitude > threshold {
                if !in_band {
                    bands += 1;
                    in_band = true;
                }
                records.push(RfiRecord {
                    frequency_hz: s.frequency,
                    amplitude_dbm: s.amplitude,
                    excess_db: s.amplitude - threshold,
                    detected_at: at,
                });
            } else {
                in_band = false;
            }
        }
        Ok(AbsoluteDetection {
            norm: self.settings.norm,
            records,
            bands,
        })
    }
}
