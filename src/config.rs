//! Station configuration file

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::info;

use crate::{
    band::{validate_requests, BandRequest, FixedParameters, InstrumentLimits},
    calibration::CalibrationSettings,
    curve::CalibrationCurve,
    error::ConfigError,
    positioner::PositionerSettings,
    rfi::RfiSettings,
    time::GeoPosition,
};

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DeviceSettings {
    /// Address of the serial bridge the analyzer sits behind
    pub address: String,
    pub connect_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    pub handshake_rounds: u32,
    /// Soft reset and handshake attempts after a device failure before giving up
    pub reset_attempts: u32,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SweepSettings {
    pub band_retries: u32,
    /// Longest wait for the next sweep point
    pub point_timeout_ms: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CurveSettings {
    pub antenna_gain_db: CalibrationCurve,
    pub cable_loss_db: CalibrationCurve,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ControlSettings {
    pub listen: String,
    pub read_timeout_ms: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum TimeSourceKind {
    System,
    /// NMEA stream from a GPS receiver, one sentence per line
    Nmea { path: String },
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TimeSettings {
    pub source: TimeSourceKind,
    pub period_ms: u64,
    pub capacity: usize,
    pub join_timeout_ms: u64,
    /// Station coordinates for the system clock and as fallback
    #[serde(default)]
    pub station: Option<GeoPosition>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StationSettings {
    /// Run measurement cycles on its own while no command is pending
    #[serde(default)]
    pub autonomous: bool,
    /// Time an in-flight operation gets to finish after a termination request
    pub shutdown_grace_ms: u64,
    /// Limit for the whole shutdown sequence
    pub shutdown_timeout_ms: u64,
    /// Time given to a human operator for manual moves and switching
    pub operator_settle_ms: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StationConfig {
    pub device: DeviceSettings,
    pub limits: InstrumentLimits,
    pub bands: Vec<BandRequest>,
    pub fixed: FixedParameters,
    pub sweep: SweepSettings,
    pub curves: CurveSettings,
    pub calibration: CalibrationSettings,
    pub rfi: RfiSettings,
    pub positioner: PositionerSettings,
    pub control: ControlSettings,
    pub time: TimeSettings,
    pub station: StationSettings,
}

impl StationConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&text)?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("device.reply_timeout_ms", self.device.reply_timeout_ms)?;
        positive("device.connect_timeout_ms", self.device.connect_timeout_ms)?;
        positive("device.handshake_rounds", self.device.handshake_rounds as u64)?;
        positive("sweep.point_timeout_ms", self.sweep.point_timeout_ms)?;
        positive("control.read_timeout_ms", self.control.read_timeout_ms)?;
        positive("time.capacity", self.time.capacity as u64)?;
        positive("station.shutdown_timeout_ms", self.station.shutdown_timeout_ms)?;
        if self.station.shutdown_grace_ms > self.station.shutdown_timeout_ms {
            return Err(ConfigError::invalid(
                "station.shutdown_grace_ms",
                "must not exceed station.shutdown_timeout_ms",
            ));
        }
        if self.limits.min_hz >= self.limits.max_hz {
            return Err(ConfigError::invalid("limits", "min_hz must be below max_hz"));
        }
        validate_requests(&self.bands, &self.limits)?;
        self.fixed.validate()?;
        for (field, curve) in [
            ("curves.antenna_gain_db", &self.curves.antenna_gain_db),
            ("curves.cable_loss_db", &self.curves.cable_loss_db),
            ("calibration.enr.enr_db", &self.calibration.enr.enr_db),
        ] {
            if curve.points().len() < 2 {
                return Err(ConfigError::invalid(field, "needs at least two points"));
            }
        }
        if self.calibration.min_delta_db < 0.0 {
            return Err(ConfigError::invalid(
                "calibration.min_delta_db",
                "must not be negative",
            ));
        }
        self.rfi.validate()?;
        self.positioner.validate()?;
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.station.shutdown_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.station.shutdown_timeout_ms)
    }
}

fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(field, "must be positive"));
    }
    Ok(())
}
