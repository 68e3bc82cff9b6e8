//! Noise-source (Y-factor) calibration of the receiving front end

use std::{io, thread, time::Duration};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    band::BandPlan,
    curve::CalibrationCurve,
    error::{CalibrationError, CaptureError},
    spectrum::{FrequencySample, Spectrum},
};

/// Reference temperature T0 (K)
pub const REF_TEMPERATURE_K: f64 = 290.0;
/// J/K
pub const BOLTZMANN: f64 = 1.3806488e-23;

const NOISE_FIGURE_LIMITS_DB: (f64, f64) = (0.5, 20.0);
const GAIN_LIMITS_DB: (f64, f64) = (10.0, 100.0);

pub fn dbm_to_watts(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0) * 1e-3
}

pub fn watts_to_dbm(watts: f64) -> f64 {
    10.0 * watts.log10() + 30.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Idle,
    NoiseSourceOffCaptured,
    NoiseSourceOnCaptured,
    CurveDerived,
}

/// Noise source model, which fixes the physical temperature its ENR table refers to
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoiseSourceModel {
    #[serde(rename = "346a")]
    Hp346A,
    #[serde(rename = "346b")]
    Hp346B,
    #[serde(rename = "346c")]
    Hp346C,
    N4000a,
    N4001a,
    N4002a,
    Other,
}

impl NoiseSourceModel {
    fn calibration_temperature_k(self) -> Option<f64> {
        match self {
            NoiseSourceModel::Hp346A
            | NoiseSourceModel::Hp346B
            | NoiseSourceModel::N4000a
            | NoiseSourceModel::N4001a => Some(302.8),
            NoiseSourceModel::Hp346C | NoiseSourceModel::N4002a => Some(304.8),
            NoiseSourceModel::Other => None,
        }
    }
}

/// Excess noise ratio of the noise source, in dB against frequency
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EnrTable {
    pub model: NoiseSourceModel,
    pub enr_db: CalibrationCurve,
}

impl EnrTable {
    /// Linear ENR corrected to T0
    pub fn corrected_linear(&self) -> CalibrationCurve {
        let correction = self
            .model
            .calibration_temperature_k()
            .map_or(0.0, |t| (REF_TEMPERATURE_K - t) / REF_TEMPERATURE_K);
        self.enr_db
            .map_values(|db| 10f64.powf(db / 10.0) + correction)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DefaultFrontEnd {
    pub gain_db: CalibrationCurve,
    pub noise_figure_db: CalibrationCurve,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CalibrationSettings {
    pub enr: EnrTable,
    /// Noise temperature of the source when off
    #[serde(default = "default_tsoff")]
    pub tsoff_k: f64,
    /// Smallest on/off step (dB) for a frequency to be used
    pub min_delta_db: f64,
    /// Wait after every switch change
    pub settle_ms: u64,
    #[serde(default)]
    pub default_front_end: Option<DefaultFrontEnd>,
}

fn default_tsoff() -> f64 {
    REF_TEMPERATURE_K
}

/// Routing of the front-end input and the noise source supply
pub trait FrontEndSwitch: Send {
    fn route_to_noise_source(&mut self, noise_source: bool) -> io::Result<()>;
    fn set_noise_source(&mut self, on: bool) -> io::Result<()>;
}

/// Manual front end: instructions go to the log and the operator has the settle time to act
pub struct OperatorSwitch {
    settle: Duration,
}

impl OperatorSwitch {
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }
}

impl FrontEndSwitch for OperatorSwitch {
    fn route_to_noise_source(&mut self, noise_source: bool) -> io::Result<()> {
        let target = if noise_source { "noise source" } else { "antenna" };
        warn!(wait = ?self.settle, "Switch the front-end input to the {target}");
        thread::sleep(self.settle);
        Ok(())
    }

    fn set_noise_source(&mut self, on: bool) -> io::Result<()> {
        let state = if on { "on" } else { "off" };
        warn!(wait = ?self.settle, "Turn the noise source {state}");
        thread::sleep(self.settle);
        Ok(())
    }
}

/// Gain and noise of the front end against frequency
#[derive(Debug, Clone, PartialEq)]
pub struct FrontEndParameters {
    pub gain_db: CalibrationCurve,
    pub noise_temperature_k: CalibrationCurve,
    pub noise_figure_db: CalibrationCurve,
    /// `None` for configured defaults
    pub derived_at: Option<DateTime<Utc>>,
    /// Frequencies left out of the curves
    pub excluded: Vec<f64>,
}

impl FrontEndParameters {
    pub fn from_defaults(defaults: &DefaultFrontEnd) -> Self {
        let noise_temperature_k = defaults
            .noise_figure_db
            .map_values(|nf| (10f64.powf(nf / 10.0) - 1.0) * REF_TEMPERATURE_K);
        Self {
            gain_db: defaults.gain_db.clone(),
            noise_temperature_k,
            noise_figure_db: defaults.noise_figure_db.clone(),
            derived_at: None,
            excluded: Vec::new(),
        }
    }

    /// Whether the curves reach over `start_hz..=stop_hz` without extrapolating
    pub fn covers(&self, start_hz: f64, stop_hz: f64) -> bool {
        [&self.gain_db, &self.noise_temperature_k].iter().all(|curve| {
            let (min, max) = curve.domain();
            min <= start_hz && stop_hz <= max
        })
    }

    /// Refer analyzer power to the front-end input and remove the receiver's own noise.
    ///
    /// Samples at or below the receiver noise are reported at the receiver noise level.
    pub fn calibrate_spectrum(
        &self,
        spectrum: &Spectrum,
        plan: &BandPlan,
    ) -> Result<Spectrum, CalibrationError> {
        let mut floored = 0usize;
        let samples = spectrum
            .samples()
            .iter()
            .map(|s| -> Result<FrequencySample, CalibrationError> {
                let gain = self.gain_db.value_at(s.frequency)?;
                let te = self.noise_temperature_k.value_at(s.frequency)?;
                let rbw = plan
                    .rbw_at(s.frequency)
                    .ok_or(CalibrationError::NoBandwidth(s.frequency))?;
                let noise_w = BOLTZMANN * rbw * te;
                let input_w = dbm_to_watts(s.amplitude - gain) - noise_w;
                let amplitude = if input_w > 0.0 {
                    watts_to_dbm(input_w)
                } else {
                    floored += 1;
                    watts_to_dbm(noise_w.max(f64::MIN_POSITIVE))
                };
                Ok(FrequencySample::new(s.frequency, amplitude))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if floored > 0 {
            debug!(floored, "Samples below receiver noise");
        }
        Ok(Spectrum::new(samples)?)
    }
}

/// Y-factor estimate at one frequency
struct PointEstimate {
    frequency: f64,
    gain_db: f64,
    te_k: f64,
    nf_db: f64,
}

/// Sequences the off/on captures and derives [`FrontEndParameters`]
pub struct FrontEndCalibrator {
    settings: CalibrationSettings,
    enr_linear: CalibrationCurve,
    state: CalibrationState,
    off: Option<Spectrum>,
    on: Option<Spectrum>,
    parameters: Option<FrontEndParameters>,
}

impl FrontEndCalibrator {
    pub fn new(settings: CalibrationSettings) -> Self {
        let enr_linear = settings.enr.corrected_linear();
        let parameters = settings
            .default_front_end
            .as_ref()
            .map(FrontEndParameters::from_defaults);
        Self {
            settings,
            enr_linear,
            state: CalibrationState::Idle,
            off: None,
            on: None,
            parameters,
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn parameters(&self) -> Option<&FrontEndParameters> {
        self.parameters.as_ref()
    }

    /// Forget derived parameters, falling back to the configured defaults
    pub fn invalidate(&mut self) {
        self.begin();
        self.parameters = self
            .settings
            .default_front_end
            .as_ref()
            .map(FrontEndParameters::from_defaults);
    }

    /// Start over, dropping any capture taken so far
    pub fn begin(&mut self) {
        self.state = CalibrationState::Idle;
        self.off = None;
        self.on = None;
    }

    fn expect_state(&self, expected: CalibrationState) -> Result<(), CalibrationError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CalibrationError::WrongState {
                expected,
                actual: self.state,
            })
        }
    }

    pub fn record_off(&mut self, spectrum: Spectrum) -> Result<(), CalibrationError> {
        self.expect_state(CalibrationState::Idle)?;
        self.off = Some(spectrum);
        self.state = CalibrationState::NoiseSourceOffCaptured;
        Ok(())
    }

    pub fn record_on(&mut self, spectrum: Spectrum) -> Result<(), CalibrationError> {
        self.expect_state(CalibrationState::NoiseSourceOffCaptured)?;
        let same = self
            .off
            .as_ref()
            .map_or(false, |off| off.same_grid(&spectrum, 1.0));
        if !same {
            return Err(CalibrationError::GridMismatch);
        }
        self.on = Some(spectrum);
        self.state = CalibrationState::NoiseSourceOnCaptured;
        Ok(())
    }

    /// Compute gain and noise from the recorded captures.
    ///
    /// Frequencies whose on/off step is not positive or is below the configured
    /// margin are left out and listed in the result. On failure the calibrator
    /// returns to [`CalibrationState::Idle`] and keeps its previous parameters.
    pub fn derive(
        &mut self,
        plan: &BandPlan,
        at: DateTime<Utc>,
    ) -> Result<&FrontEndParameters, CalibrationError> {
        self.expect_state(CalibrationState::NoiseSourceOnCaptured)?;
        let result = match (&self.off, &self.on) {
            (Some(off), Some(on)) => self.estimate(off, on, plan, at),
            _ => Err(CalibrationError::WrongState {
                expected: CalibrationState::NoiseSourceOnCaptured,
                actual: self.state,
            }),
        };
        match result {
            Ok(parameters) => {
                self.state = CalibrationState::CurveDerived;
                Ok(&*self.parameters.insert(parameters))
            }
            Err(e) => {
                self.begin();
                Err(e)
            }
        }
    }

    fn estimate(
        &self,
        off: &Spectrum,
        on: &Spectrum,
        plan: &BandPlan,
        at: DateTime<Utc>,
    ) -> Result<FrontEndParameters, CalibrationError> {
        let tsoff = self.settings.tsoff_k;
        let mut estimates = Vec::with_capacity(off.len());
        let mut excluded = Vec::new();
        for (s_off, s_on) in off.samples().iter().zip(on.samples()) {
            let f = s_off.frequency;
            let delta = s_on.amplitude - s_off.amplitude;
            if !(delta > 0.0) || delta < self.settings.min_delta_db {
                excluded.push(f);
                continue;
            }
            let p_off = dbm_to_watts(s_off.amplitude);
            let p_on = dbm_to_watts(s_on.amplitude);
            let tson = REF_TEMPERATURE_K * self.enr_linear.value_at(f)? + tsoff;
            let y = p_on / p_off;
            // Non-physical negative temperatures come from measurement noise
            let te = ((tson - y * tsoff) / (y - 1.0)).max(0.0);
            let rbw = plan.rbw_at(f).ok_or(CalibrationError::NoBandwidth(f))?;
            let gain = 0.5 / (BOLTZMANN * rbw) * (p_off / (tsoff + te) + p_on / (tson + te));
            estimates.push(PointEstimate {
                frequency: f,
                gain_db: 10.0 * gain.log10(),
                te_k: te,
                nf_db: 10.0 * (1.0 + te / REF_TEMPERATURE_K).log10(),
            });
        }
        if estimates.is_empty() {
            return Err(CalibrationError::NoValidFrequencies {
                excluded: excluded.len(),
                total: off.len(),
            });
        }
        if !excluded.is_empty() {
            warn!(
                excluded = excluded.len(),
                total = off.len(),
                "Frequencies left out of the calibration"
            );
        }
        check_mean(
            "noise figure",
            estimates.iter().map(|e| e.nf_db),
            NOISE_FIGURE_LIMITS_DB,
        )?;
        check_mean("gain", estimates.iter().map(|e| e.gain_db), GAIN_LIMITS_DB)?;
        let curve = |value: fn(&PointEstimate) -> f64| {
            CalibrationCurve::new(estimates.iter().map(|e| (e.frequency, value(e))).collect())
        };
        Ok(FrontEndParameters {
            gain_db: curve(|e| e.gain_db)?,
            noise_temperature_k: curve(|e| e.te_k)?,
            noise_figure_db: curve(|e| e.nf_db)?,
            derived_at: Some(at),
            excluded,
        })
    }

    /// Full off-then-on sequence. The switch is returned to the antenna with the
    /// noise source off whatever the outcome.
    pub fn calibrate<S, F>(
        &mut self,
        switch: &mut S,
        plan: &BandPlan,
        at: DateTime<Utc>,
        mut capture: F,
    ) -> Result<&FrontEndParameters, CalibrationError>
    where
        S: FrontEndSwitch + ?Sized,
        F: FnMut() -> Result<Spectrum, CaptureError>,
    {
        self.begin();
        info!("Front-end calibration started");
        let captured = self.capture_pair(switch, &mut capture);
        let restored = switch
            .set_noise_source(false)
            .and_then(|_| switch.route_to_noise_source(false));
        if let Err(e) = captured {
            self.begin();
            return Err(e);
        }
        restored?;
        let parameters = self.derive(plan, at)?;
        info!(
            excluded = parameters.excluded.len(),
            "Front-end calibration finished"
        );
        Ok(parameters)
    }

    fn capture_pair<S, F>(&mut self, switch: &mut S, capture: &mut F) -> Result<(), CalibrationError>
    where
        S: FrontEndSwitch + ?Sized,
        F: FnMut() -> Result<Spectrum, CaptureError>,
    {
        let settle = Duration::from_millis(self.settings.settle_ms);
        switch.route_to_noise_source(true)?;
        switch.set_noise_source(false)?;
        thread::sleep(settle);
        self.record_off(capture()?)?;
        switch.set_noise_source(true)?;
        thread::sleep(settle);
        self.record_on(capture()?)?;
        Ok(())
    }

    /// Calibrate a raw spectrum with the current parameters
    pub fn calibrate_spectrum(
        &self,
        spectrum: &Spectrum,
        plan: &BandPlan,
    ) -> Result<Spectrum, CalibrationError> {
        self.parameters
            .as_ref()
            .ok_or(CalibrationError::NotCalibrated)?
            .calibrate_spectrum(spectrum, plan)
    }
}

fn check_mean(
    quantity: &'static str,
    values: impl Iterator<Item = f64>,
    (low, high): (f64, f64),
) -> Result<(), CalibrationError> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    let mean = sum / n as f64;
    if !(low..=high).contains(&mean) {
        return Err(CalibrationError::Implausible {
            quantity,
            mean,
            low,
            high,
        });
    }
    Ok(())
}
