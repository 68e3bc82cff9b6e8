//! Error kinds, one per component boundary

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::{calibration::CalibrationState, device::SpecVariable, positioner::Polarization};

/// Failures talking to the spectrum analyzer
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("analyzer I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("timed out after {waited:?} waiting for {expected} reply bytes ({received} received)")]
    Timeout {
        waited: Duration,
        expected: usize,
        received: usize,
    },
    #[error("malformed {kind} reply: {detail}")]
    Malformed { kind: &'static str, detail: String },
    #[error("analyzer rejected {variable} with status {status}")]
    Rejected { variable: SpecVariable, status: u8 },
    #[error("{variable} read back as {actual}, expected {expected}")]
    Mismatch {
        variable: SpecVariable,
        expected: f64,
        actual: f64,
    },
    #[error("{0} Hz is not a bandwidth the analyzer supports")]
    UnsupportedBandwidth(f64),
    #[error("unknown variable id {0:#04x}")]
    UnknownVariable(u8),
    #[error("no analyzer session is open")]
    NotConnected,
    #[error("handshake failed after {0} rounds")]
    HandshakeFailed(u32),
    #[error("aborted by shutdown request")]
    Aborted,
}

impl DeviceError {
    /// Transient faults worth repeating the same request for
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeviceError::Io(_) | DeviceError::Timeout { .. } | DeviceError::Malformed { .. }
        )
    }
}

/// Invalid station configuration or band request
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("range {start_hz} Hz - {stop_hz} Hz lies outside the instrument limits {min_hz} Hz - {max_hz} Hz")]
    OutOfLimits {
        start_hz: f64,
        stop_hz: f64,
        min_hz: f64,
        max_hz: f64,
    },
    #[error("empty frequency range {start_hz} Hz - {stop_hz} Hz")]
    EmptyRange { start_hz: f64, stop_hz: f64 },
    #[error("band starting at {start_hz} Hz overlaps the previous band ending at {previous_stop_hz} Hz")]
    Overlap { start_hz: f64, previous_stop_hz: f64 },
    #[error("{0} Hz is not a supported resolution/video bandwidth")]
    UnsupportedBandwidth(f64),
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("{field}: {source}")]
    Curve {
        field: &'static str,
        #[source]
        source: CurveError,
    },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Violations of the spectrum ordering invariant
#[derive(Error, Debug, PartialEq)]
pub enum SpectrumError {
    #[error("sample {index} at {freq_hz} Hz does not follow {previous_hz} Hz")]
    NotIncreasing {
        index: usize,
        previous_hz: f64,
        freq_hz: f64,
    },
    #[error("sample {index} has a non-finite frequency or amplitude")]
    NotFinite { index: usize },
    #[error("frequency and amplitude vectors differ in length ({frequencies} vs {amplitudes})")]
    LengthMismatch {
        frequencies: usize,
        amplitudes: usize,
    },
}

/// Sweep assembly failed; partial data is always discarded
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("band {band} failed after {attempts} attempt(s): {source}")]
    Band {
        band: usize,
        attempts: u32,
        #[source]
        source: DeviceError,
    },
    #[error("spectrum has a {gap_hz} Hz gap after {freq_hz} Hz (step {step_hz} Hz)")]
    Gap {
        freq_hz: f64,
        gap_hz: f64,
        step_hz: f64,
    },
    #[error("spectrum covers {first_hz} Hz - {last_hz} Hz, plan requires {start_hz} Hz - {stop_hz} Hz")]
    Coverage {
        first_hz: f64,
        last_hz: f64,
        start_hz: f64,
        stop_hz: f64,
    },
    #[error(transparent)]
    Spectrum(#[from] SpectrumError),
    #[error("band plan is empty")]
    EmptyPlan,
    #[error("capture aborted by shutdown request")]
    Aborted,
}

/// Lookups outside a correction curve, or malformed curves
#[derive(Error, Debug, PartialEq)]
pub enum CurveError {
    #[error("{freq_hz} Hz is outside the curve domain {min_hz} Hz - {max_hz} Hz")]
    OutOfDomain {
        freq_hz: f64,
        min_hz: f64,
        max_hz: f64,
    },
    #[error("a curve needs at least one point")]
    Empty,
    #[error("curve point {index} at {freq_hz} Hz is not above the previous point")]
    NotIncreasing { index: usize, freq_hz: f64 },
    #[error("curve point {index} is not finite")]
    NotFinite { index: usize },
    #[error("curve domains do not overlap")]
    Disjoint,
    #[error(transparent)]
    Spectrum(#[from] SpectrumError),
}

/// Front-end calibration could not produce usable parameters
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("calibrator is {actual:?}, operation needs {expected:?}")]
    WrongState {
        expected: CalibrationState,
        actual: CalibrationState,
    },
    #[error("noise-on and noise-off captures do not share a frequency grid")]
    GridMismatch,
    #[error("every frequency was excluded ({excluded} of {total})")]
    NoValidFrequencies { excluded: usize, total: usize },
    #[error("implausible mean {quantity} of {mean:.2} dB (expected {low} - {high} dB)")]
    Implausible {
        quantity: &'static str,
        mean: f64,
        low: f64,
        high: f64,
    },
    #[error("no resolution bandwidth is configured at {0} Hz")]
    NoBandwidth(f64),
    #[error("front end has not been calibrated")]
    NotCalibrated,
    #[error("noise source switch failed: {0}")]
    Switch(#[from] io::Error),
    #[error(transparent)]
    Curve(#[from] CurveError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Spectrum(#[from] SpectrumError),
}

/// Interference detection input did not match detector state
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("spectrum has {actual} samples, detector window holds {expected}")]
    GridLength { expected: usize, actual: usize },
    #[error("sample {index} is at {actual_hz} Hz, detector window has {expected_hz} Hz")]
    GridMismatch {
        index: usize,
        expected_hz: f64,
        actual_hz: f64,
    },
    #[error("no resolution bandwidth is configured at {0} Hz")]
    NoBandwidth(f64),
    #[error(transparent)]
    Curve(#[from] CurveError),
}

/// Antenna positioner failures
#[derive(Error, Debug)]
pub enum PositionError {
    #[error("{target} did not complete within {waited:?}")]
    Timeout { target: String, waited: Duration },
    #[error("antenna position is unknown, home the positioner first")]
    Unknown,
    #[error("positioner drive failed: {0}")]
    Drive(#[from] io::Error),
    #[error("move aborted by shutdown request")]
    Aborted,
    #[error("{0} polarization is not part of the measurement plan")]
    NotInPlan(Polarization),
}

/// Malformed control-protocol traffic, local to one connection
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("unknown variable {0:#04x}")]
    UnknownVariable(u8),
    #[error("unknown status {0:#04x}")]
    UnknownStatus(u8),
    #[error("{message} needs {expected} bytes, got {actual}")]
    Length {
        message: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("connection closed mid-message after {0} bytes")]
    Truncated(usize),
    #[error("control connection failed: {0}")]
    Io(#[from] io::Error),
}

/// Persistence sink refused a record
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("sink rejected record: {0}")]
    Rejected(String),
}

/// Time/position source failures
#[derive(Error, Debug)]
pub enum TimeError {
    #[error("time source I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("bad NMEA sentence {sentence:?}: {reason}")]
    Nmea { sentence: String, reason: String },
    #[error("NMEA checksum {expected:#04x} does not match computed {computed:#04x}")]
    Checksum { expected: u8, computed: u8 },
    #[error("time source reached end of input")]
    Exhausted,
    #[error("time stream did not stop within {0:?}")]
    JoinTimeout(Duration),
}

/// Orchestrator-level failure
#[derive(Error, Debug)]
pub enum StationError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Curve(#[from] CurveError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error(transparent)]
    Position(#[from] PositionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Time(#[from] TimeError),
    #[error("analyzer unreachable after reset: {0}")]
    DeviceUnreachable(#[source] DeviceError),
    #[error("shutdown exceeded {0:?}")]
    ShutdownTimeout(Duration),
    #[error("station is shutting down")]
    ShuttingDown,
}

impl StationError {
    /// Conditions that end the process instead of returning to READY
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StationError::DeviceUnreachable(_) | StationError::ShutdownTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_device_errors() {
        let timeout = DeviceError::Timeout {
            waited: Duration::from_millis(10),
            expected: 17,
            received: 0,
        };
        assert!(timeout.is_retryable());
        let mismatch = DeviceError::Mismatch {
            variable: SpecVariable::StartFreq,
            expected: 1.0,
            actual: 2.0,
        };
        assert!(!mismatch.is_retryable());
        assert!(!DeviceError::Aborted.is_retryable());
    }

    #[test]
    fn only_unreachable_and_timeout_are_fatal() {
        assert!(StationError::ShutdownTimeout(Duration::from_secs(1)).is_fatal());
        assert!(StationError::DeviceUnreachable(DeviceError::NotConnected).is_fatal());
        assert!(!StationError::Capture(CaptureError::EmptyPlan).is_fatal());
    }
}
