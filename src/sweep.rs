//! Assembling one continuous spectrum from a band plan

use std::{collections::BTreeMap, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    band::{BandConfigurator, BandParameters, BandPlan},
    device::{DeviceInterface, Transport},
    error::{CaptureError, DeviceError},
    signal::ShutdownSignal,
    spectrum::{FrequencySample, Spectrum},
};

/// Drives the analyzer band by band and stitches the results together
#[derive(Debug, Clone)]
pub struct SweepBuilder {
    band_retries: u32,
    point_timeout: Duration,
}

impl SweepBuilder {
    /// `band_retries` extra attempts are made per band after a retryable failure
    pub fn new(band_retries: u32, point_timeout: Duration) -> Self {
        Self {
            band_retries,
            point_timeout,
        }
    }

    /// Capture every band of `plan` in ascending order.
    ///
    /// A shutdown request is honoured between bands. Once the request is forced
    /// the band in flight is abandoned as well. Either way nothing partial is
    /// returned.
    pub fn capture<T: Transport>(
        &self,
        device: &mut DeviceInterface<T>,
        configurator: &BandConfigurator,
        plan: &BandPlan,
        signal: &ShutdownSignal,
    ) -> Result<Spectrum, CaptureError> {
        if plan.is_empty() {
            return Err(CaptureError::EmptyPlan);
        }
        let tolerance = plan.boundary_tolerance();
        let mut spectrum = Spectrum::default();
        for (index, band) in plan.bands().iter().enumerate() {
            if signal.is_requested() {
                info!(band = index, "Capture stopped at band boundary for shutdown");
                return Err(CaptureError::Aborted);
            }
            let samples = self.capture_band_with_retries(device, configurator, band, index, signal)?;
            spectrum.append_band(samples, tolerance)?;
        }
        check_continuity(&spectrum, plan)?;
        debug!(samples = spectrum.len(), "Spectrum assembled");
        Ok(spectrum)
    }

    fn capture_band_with_retries<T: Transport>(
        &self,
        device: &mut DeviceInterface<T>,
        configurator: &BandConfigurator,
        band: &BandParameters,
        index: usize,
        signal: &ShutdownSignal,
    ) -> Result<Vec<FrequencySample>, CaptureError> {
        let attempts = self.band_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = configurator
                .configure_band(device, band)
                .and_then(|_| self.capture_band(device, band, signal));
            match result {
                Ok(samples) => return Ok(samples),
                Err(DeviceError::Aborted) => return Err(CaptureError::Aborted),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(band = index, attempt, error = %e, "Band capture failed, retrying");
                }
                Err(source) => {
                    return Err(CaptureError::Band {
                        band: index,
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    /// One pass over one band. Streaming is always switched off again before returning.
    fn capture_band<T: Transport>(
        &self,
        device: &mut DeviceInterface<T>,
        band: &BandParameters,
        signal: &ShutdownSignal,
    ) -> Result<Vec<FrequencySample>, DeviceError> {
        device.reset_sweep()?;
        device.enable_sweep()?;
        let collected = self.collect_points(device, band, signal);
        let disabled = device.disable_sweep();
        let points = collected?;
        disabled?;
        Ok(points
            .into_iter()
            .map(|(hz, dbm)| FrequencySample::new(hz as f64, dbm))
            .collect())
    }

    fn collect_points<T: Transport>(
        &self,
        device: &mut DeviceInterface<T>,
        band: &BandParameters,
        signal: &ShutdownSignal,
    ) -> Result<BTreeMap<u64, f64>, DeviceError> {
        let tolerance =
            (band.step_hz() / 2.0).max(crate::device::DEVICE_FREQ_RESOLUTION_HZ as f64);
        let expected = band.sample_points as usize;
        let mut points = BTreeMap::new();
        while points.len() < expected {
            if signal.is_forced() {
                return Err(DeviceError::Aborted);
            }
            let point = device.read_sweep_point(self.point_timeout)?;
            if !band.contains(point.frequency_hz as f64, tolerance) {
                return Err(DeviceError::Malformed {
                    kind: "AMPFREQDAT",
                    detail: format!(
                        "{} Hz outside band {} Hz - {} Hz",
                        point.frequency_hz, band.start_hz, band.stop_hz
                    ),
                });
            }
            // A repeated frequency means the analyzer wrapped to the next sweep
            if points
                .insert(point.frequency_hz, point.max_dbm as f64)
                .is_some()
            {
                break;
            }
        }
        Ok(points)
    }
}

/// Coverage and gap checks against the plan
pub fn check_continuity(spectrum: &Spectrum, plan: &BandPlan) -> Result<(), CaptureError> {
    let (start_hz, stop_hz) = match (plan.start_hz(), plan.stop_hz()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(CaptureError::EmptyPlan),
    };
    let tolerance = plan.boundary_tolerance();
    let (first_hz, last_hz) = match (spectrum.first_hz(), spectrum.last_hz()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(CaptureError::Coverage {
                first_hz: f64::NAN,
                last_hz: f64::NAN,
                start_hz,
                stop_hz,
            })
        }
    };
    if (first_hz - start_hz).abs() > tolerance || (last_hz - stop_hz).abs() > tolerance {
        return Err(CaptureError::Coverage {
            first_hz,
            last_hz,
            start_hz,
            stop_hz,
        });
    }
    for s in spectrum.samples().windows(2) {
        let gap = s[1].frequency - s[0].frequency;
        let step_hz = plan
            .bands()
            .iter()
            .find(|b| b.contains(s[0].frequency, tolerance) && b.contains(s[1].frequency, tolerance))
            .map(|b| b.step_hz())
            .unwrap_or_else(|| plan.largest_step_hz());
        if gap > step_hz + tolerance {
            return Err(CaptureError::Gap {
                freq_hz: s[0].frequency,
                gap_hz: gap,
                step_hz,
            });
        }
    }
    Ok(())
}
