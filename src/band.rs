//! Splitting a frequency range into analyzer-sized bands

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    device::{
        is_supported_bandwidth, DeviceInterface, SpecVariable, Transport, DEVICE_FREQ_RESOLUTION_HZ,
    },
    error::{ConfigError, DeviceError},
};

const MIN_SWEEP_TIME_MS: u64 = 10;
/// Most hardware bands a plan may hold
pub const MAX_BANDS: usize = 10_000;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InstrumentLimits {
    pub min_hz: f64,
    pub max_hz: f64,
    /// Most points the analyzer delivers in one sweep
    pub max_samples_per_sweep: u32,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Detector {
    Rms,
    MinMax,
}

impl Detector {
    pub fn code(self) -> f64 {
        match self {
            Detector::Rms => 0.0,
            Detector::MinMax => 1.0,
        }
    }
}

/// One configured frequency range, before splitting
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BandRequest {
    pub start_hz: f64,
    pub stop_hz: f64,
    pub rbw_hz: f64,
    pub vbw_hz: f64,
    /// Time to sweep the whole request; split bands get a proportional share
    pub sweep_time_ms: u64,
    pub detector: Detector,
    /// Spacing between samples, RBW/2 when absent
    #[serde(default)]
    pub sample_step_hz: Option<f64>,
}

impl BandRequest {
    fn target_step(&self) -> f64 {
        self.sample_step_hz.unwrap_or(self.rbw_hz / 2.0)
    }
}

/// Settings for one hardware sweep
#[derive(Debug, Clone, PartialEq)]
pub struct BandParameters {
    pub start_hz: f64,
    pub stop_hz: f64,
    pub sample_points: u32,
    pub sweep_time: Duration,
    pub rbw_hz: f64,
    pub vbw_hz: f64,
    pub detector: Detector,
}

impl BandParameters {
    pub fn step_hz(&self) -> f64 {
        if self.sample_points > 1 {
            (self.stop_hz - self.start_hz) / (self.sample_points - 1) as f64
        } else {
            0.0
        }
    }

    pub fn frequency_of(&self, index: u32) -> f64 {
        if index + 1 >= self.sample_points {
            self.stop_hz
        } else {
            self.start_hz + index as f64 * self.step_hz()
        }
    }

    pub fn contains(&self, freq_hz: f64, tolerance_hz: f64) -> bool {
        freq_hz >= self.start_hz - tolerance_hz && freq_hz <= self.stop_hz + tolerance_hz
    }
}

/// Ordered bands covering the requested range, adjacent bands sharing their boundary sample
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BandPlan {
    bands: Vec<BandParameters>,
}

impl BandPlan {
    /// Split `requests` into bands no larger than the analyzer allows.
    ///
    /// `window` narrows or widens the outer edges of the requests, which is how a
    /// remote start/stop frequency is applied. Requests must be ascending and
    /// contiguous.
    pub fn build(
        requests: &[BandRequest],
        window: Option<(f64, f64)>,
        limits: &InstrumentLimits,
    ) -> Result<Self, ConfigError> {
        let requests = apply_window(requests, window)?;
        validate_requests(&requests, limits)?;
        let mut bands = Vec::new();
        for request in &requests {
            split_request(request, limits, &mut bands);
        }
        info!(
            bands = bands.len(),
            start_hz = requests[0].start_hz,
            stop_hz = requests[requests.len() - 1].stop_hz,
            "Band plan built"
        );
        Ok(Self { bands })
    }

    pub fn bands(&self) -> &[BandParameters] {
        &self.bands
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn start_hz(&self) -> Option<f64> {
        self.bands.first().map(|b| b.start_hz)
    }

    pub fn stop_hz(&self) -> Option<f64> {
        self.bands.last().map(|b| b.stop_hz)
    }

    /// Resolution bandwidth in force at `freq_hz`; a shared boundary belongs to the lower band
    pub fn rbw_at(&self, freq_hz: f64) -> Option<f64> {
        let tol = self.boundary_tolerance();
        self.bands
            .iter()
            .find(|b| b.contains(freq_hz, tol))
            .map(|b| b.rbw_hz)
    }

    pub fn largest_step_hz(&self) -> f64 {
        self.bands.iter().map(|b| b.step_hz()).fold(0.0, f64::max)
    }

    /// Two frequencies closer than this are the same sample
    pub fn boundary_tolerance(&self) -> f64 {
        let smallest = self
            .bands
            .iter()
            .map(|b| b.step_hz())
            .filter(|s| *s > 0.0)
            .fold(f64::INFINITY, f64::min);
        if smallest.is_finite() {
            (smallest / 2.0).max(DEVICE_FREQ_RESOLUTION_HZ as f64)
        } else {
            DEVICE_FREQ_RESOLUTION_HZ as f64
        }
    }

    /// Samples in an assembled spectrum, counting every shared boundary once
    pub fn expected_samples(&self) -> usize {
        let total: usize = self.bands.iter().map(|b| b.sample_points as usize).sum();
        total - self.bands.len().saturating_sub(1)
    }
}

fn apply_window(
    requests: &[BandRequest],
    window: Option<(f64, f64)>,
) -> Result<Vec<BandRequest>, ConfigError> {
    if requests.is_empty() {
        return Err(ConfigError::invalid("bands", "no frequency band configured"));
    }
    let (start, stop) = match window {
        None => return Ok(requests.to_vec()),
        Some(w) => w,
    };
    if stop <= start {
        return Err(ConfigError::EmptyRange {
            start_hz: start,
            stop_hz: stop,
        });
    }
    let last = requests.len() - 1;
    let windowed: Vec<BandRequest> = requests
        .iter()
        .enumerate()
        .filter_map(|(i, r)| {
            let mut r = r.clone();
            // Outer edges follow the window, inner boundaries are only clipped
            r.start_hz = if i == 0 { start } else { r.start_hz.max(start) };
            r.stop_hz = if i == last { stop } else { r.stop_hz.min(stop) };
            (r.stop_hz > r.start_hz).then_some(r)
        })
        .collect();
    if windowed.is_empty() {
        return Err(ConfigError::EmptyRange {
            start_hz: start,
            stop_hz: stop,
        });
    }
    Ok(windowed)
}

/// Check band requests against the analyzer's capabilities
pub fn validate_requests(
    requests: &[BandRequest],
    limits: &InstrumentLimits,
) -> Result<(), ConfigError> {
    if limits.max_samples_per_sweep < 2 {
        return Err(ConfigError::invalid(
            "instrument.max_samples_per_sweep",
            "must be at least 2",
        ));
    }
    let mut previous_stop: Option<f64> = None;
    let mut bands = 0.0;
    for r in requests {
        if !(r.stop_hz > r.start_hz) {
            return Err(ConfigError::EmptyRange {
                start_hz: r.start_hz,
                stop_hz: r.stop_hz,
            });
        }
        if r.start_hz < limits.min_hz || r.stop_hz > limits.max_hz {
            return Err(ConfigError::OutOfLimits {
                start_hz: r.start_hz,
                stop_hz: r.stop_hz,
                min_hz: limits.min_hz,
                max_hz: limits.max_hz,
            });
        }
        for bw in [r.rbw_hz, r.vbw_hz] {
            if !is_supported_bandwidth(bw) {
                return Err(ConfigError::UnsupportedBandwidth(bw));
            }
        }
        if let Some(step) = r.sample_step_hz {
            if !(step >= DEVICE_FREQ_RESOLUTION_HZ as f64) {
                return Err(ConfigError::invalid(
                    "sample_step_hz",
                    format!("must be at least {DEVICE_FREQ_RESOLUTION_HZ} Hz"),
                ));
            }
        }
        let max_steps = (limits.max_samples_per_sweep - 1) as f64;
        bands += ((r.stop_hz - r.start_hz) / r.target_step() / max_steps).ceil();
        if bands > MAX_BANDS as f64 {
            return Err(ConfigError::invalid(
                "bands",
                format!("plan would need more than {MAX_BANDS} sweeps"),
            ));
        }
        if let Some(prev) = previous_stop {
            if r.start_hz < prev {
                return Err(ConfigError::Overlap {
                    start_hz: r.start_hz,
                    previous_stop_hz: prev,
                });
            }
            if r.start_hz > prev {
                return Err(ConfigError::invalid(
                    "bands",
                    format!("gap between {prev} Hz and {} Hz", r.start_hz),
                ));
            }
        }
        previous_stop = Some(r.stop_hz);
    }
    Ok(())
}

fn split_request(request: &BandRequest, limits: &InstrumentLimits, out: &mut Vec<BandParameters>) {
    let span = request.stop_hz - request.start_hz;
    // Tolerance keeps an exact multiple from rounding up to an extra step
    let total_steps = ((span / request.target_step()) - 1e-9).ceil().max(1.0) as u64;
    let step = span / total_steps as f64;
    let max_steps = (limits.max_samples_per_sweep - 1) as u64;
    let n_bands = (total_steps + max_steps - 1) / max_steps;
    let base = total_steps / n_bands;
    let extra = total_steps % n_bands;

    let mut done = 0u64;
    for i in 0..n_bands {
        let steps = base + u64::from(i < extra);
        let start_hz = request.start_hz + done as f64 * step;
        done += steps;
        let stop_hz = if i + 1 == n_bands {
            request.stop_hz
        } else {
            request.start_hz + done as f64 * step
        };
        let share = (stop_hz - start_hz) / span;
        let sweep_ms = ((request.sweep_time_ms as f64 * share).round() as u64).max(MIN_SWEEP_TIME_MS);
        debug!(start_hz, stop_hz, points = steps + 1, "Planned band");
        out.push(BandParameters {
            start_hz,
            stop_hz,
            sample_points: (steps + 1) as u32,
            sweep_time: Duration::from_millis(sweep_ms),
            rbw_hz: request.rbw_hz,
            vbw_hz: request.vbw_hz,
            detector: request.detector,
        });
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Attenuator {
    Auto,
    #[serde(rename = "db")]
    Decibels(u8),
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DisplayUnit {
    Dbm,
    Dbuv,
    #[serde(rename = "v/m")]
    VoltsPerMeter,
    #[serde(rename = "a/m")]
    AmpsPerMeter,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AntennaType {
    Hl7025,
    Hl7040,
    Hl7060,
    Hl6080,
    H60100,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CableType {
    None,
    Standard1m,
}

/// Analyzer settings that stay the same across every band
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FixedParameters {
    pub attenuator: Attenuator,
    pub display_unit: DisplayUnit,
    pub antenna_type: AntennaType,
    pub cable_type: CableType,
    pub preamp: bool,
    pub sweep_delay_accuracy: bool,
    /// 0.0 to 1.0
    pub speaker_volume: f64,
}

impl FixedParameters {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Attenuator::Decibels(db) = self.attenuator {
            if db > 30 {
                return Err(ConfigError::invalid("fixed.attenuator", "0 to 30 dB"));
            }
        }
        if !(0.0..=1.0).contains(&self.speaker_volume) {
            return Err(ConfigError::invalid("fixed.speaker_volume", "0.0 to 1.0"));
        }
        Ok(())
    }

    /// Variable/value pairs in the order they are written to the analyzer
    pub fn settings(&self) -> Vec<(SpecVariable, f64)> {
        let attenuator = match self.attenuator {
            Attenuator::Auto => -10.0,
            Attenuator::Decibels(db) => db as f64,
        };
        let display_unit = match self.display_unit {
            DisplayUnit::Dbm => 0.0,
            DisplayUnit::Dbuv => 1.0,
            DisplayUnit::VoltsPerMeter => 2.0,
            DisplayUnit::AmpsPerMeter => 3.0,
        };
        let antenna = match self.antenna_type {
            AntennaType::Hl7025 => 0.0,
            AntennaType::Hl7040 => 1.0,
            AntennaType::Hl7060 => 2.0,
            AntennaType::Hl6080 => 3.0,
            AntennaType::H60100 => 4.0,
        };
        let cable = match self.cable_type {
            CableType::None => -1.0,
            CableType::Standard1m => 0.0,
        };
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        vec![
            (SpecVariable::AttenFactor, attenuator),
            (SpecVariable::DispUnit, display_unit),
            // Demodulator off, spectrum receiver, no audio tone, no back BB detector
            (SpecVariable::DemodMode, 0.0),
            (SpecVariable::AntennaType, antenna),
            (SpecVariable::CableType, cable),
            (SpecVariable::RecvConf, 0.0),
            (SpecVariable::PreampEnable, flag(self.preamp)),
            (SpecVariable::SweepDelayAcc, flag(self.sweep_delay_accuracy)),
            (SpecVariable::LevelTone, 0.0),
            (SpecVariable::BackBbEnable, 0.0),
            (SpecVariable::SpeakerVolume, self.speaker_volume),
        ]
    }
}

/// Writes band and fixed settings to the analyzer
#[derive(Debug, Clone)]
pub struct BandConfigurator {
    fixed: FixedParameters,
}

impl BandConfigurator {
    pub fn new(fixed: FixedParameters) -> Self {
        Self { fixed }
    }

    pub fn fixed(&self) -> &FixedParameters {
        &self.fixed
    }

    /// Apply the fixed parameters, once per session
    pub fn initial_configuration<T: Transport>(
        &self,
        device: &mut DeviceInterface<T>,
    ) -> Result<(), DeviceError> {
        for (variable, value) in self.fixed.settings() {
            device.set_and_check(variable, value)?;
        }
        info!("Fixed analyzer parameters applied");
        Ok(())
    }

    pub fn configure_band<T: Transport>(
        &self,
        device: &mut DeviceInterface<T>,
        band: &BandParameters,
    ) -> Result<(), DeviceError> {
        device.set_and_check(SpecVariable::StartFreq, band.start_hz)?;
        device.set_and_check(SpecVariable::StopFreq, band.stop_hz)?;
        device.set_and_check(SpecVariable::ResBandw, band.rbw_hz)?;
        device.set_and_check(SpecVariable::VidBandw, band.vbw_hz)?;
        device.set_and_check(SpecVariable::SweepTime, band.sweep_time.as_millis() as f64)?;
        device.set_and_check(SpecVariable::SweepPoints, band.sample_points as f64)?;
        device.set_and_check(SpecVariable::DetMode, band.detector.code())?;
        Ok(())
    }
}
