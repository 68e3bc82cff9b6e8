//! Antenna azimuth and polarization sequencing

use std::{
    fmt, io, thread,
    time::{Duration, Instant},
};

use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    error::{ConfigError, PositionError},
    signal::ShutdownSignal,
};

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Polarization {
    Horizontal,
    Vertical,
}

impl Polarization {
    /// Control-protocol encoding: 0 horizontal, 1 vertical
    pub fn from_code(code: f64) -> Option<Self> {
        if code == 0.0 {
            Some(Polarization::Horizontal)
        } else if code == 1.0 {
            Some(Polarization::Vertical)
        } else {
            None
        }
    }
}

impl fmt::Display for Polarization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Polarization::Horizontal => f.write_str("horizontal"),
            Polarization::Vertical => f.write_str("vertical"),
        }
    }
}

/// Positions visited in a measurement cycle: every polarization at each
/// azimuth, azimuths in the listed order
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PositionerSettings {
    pub azimuths_deg: Vec<f64>,
    pub polarizations: Vec<Polarization>,
    /// Longest a single move may take
    pub move_timeout_ms: u64,
    /// Interval between settle checks
    pub poll_ms: u64,
}

impl PositionerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.azimuths_deg.is_empty() {
            return Err(ConfigError::invalid("positioner.azimuths_deg", "no azimuth"));
        }
        if self.polarizations.is_empty() {
            return Err(ConfigError::invalid(
                "positioner.polarizations",
                "no polarization",
            ));
        }
        if self
            .azimuths_deg
            .iter()
            .any(|a| !(0.0..360.0).contains(a))
        {
            return Err(ConfigError::invalid(
                "positioner.azimuths_deg",
                "angles must lie in [0, 360)",
            ));
        }
        if self.poll_ms == 0 {
            return Err(ConfigError::invalid("positioner.poll_ms", "must be positive"));
        }
        if self.move_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "positioner.move_timeout_ms",
                "must be positive",
            ));
        }
        Ok(())
    }

    pub fn positions(&self) -> usize {
        self.azimuths_deg.len() * self.polarizations.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionerState {
    /// After start-up, a failed move or an abort. Only homing leaves it.
    Unknown,
    Known {
        azimuth_index: usize,
        azimuth_deg: f64,
        polarization: Polarization,
    },
}

/// Whatever physically moves the antenna
pub trait PositionerDrive: Send {
    fn start_azimuth_move(&mut self, azimuth_deg: f64) -> io::Result<()>;
    fn start_polarization_change(&mut self, polarization: Polarization) -> io::Result<()>;
    /// Return to the reference position
    fn start_homing(&mut self, azimuth_deg: f64, polarization: Polarization) -> io::Result<()>;
    fn is_settled(&mut self) -> io::Result<bool>;
}

/// Hand-turned mount. Instructions are logged and each move counts as done
/// once the operator's time has passed.
pub struct OperatorMount {
    operator_time: Duration,
    started: Option<Instant>,
}

impl OperatorMount {
    pub fn new(operator_time: Duration) -> Self {
        Self {
            operator_time,
            started: None,
        }
    }

    fn instruct(&mut self, what: String) {
        warn!(within = ?self.operator_time, "{what}");
        self.started = Some(Instant::now());
    }
}

impl PositionerDrive for OperatorMount {
    fn start_azimuth_move(&mut self, azimuth_deg: f64) -> io::Result<()> {
        self.instruct(format!("Rotate the antenna to {azimuth_deg:.1} deg azimuth"));
        Ok(())
    }

    fn start_polarization_change(&mut self, polarization: Polarization) -> io::Result<()> {
        self.instruct(format!("Set the antenna polarization to {polarization}"));
        Ok(())
    }

    fn start_homing(&mut self, azimuth_deg: f64, polarization: Polarization) -> io::Result<()> {
        self.instruct(format!(
            "Return the antenna to {azimuth_deg:.1} deg azimuth, {polarization} polarization"
        ));
        Ok(())
    }

    fn is_settled(&mut self) -> io::Result<bool> {
        Ok(self
            .started
            .map_or(true, |t| t.elapsed() >= self.operator_time))
    }
}

pub struct AntennaPositioner {
    settings: PositionerSettings,
    drive: Box<dyn PositionerDrive>,
    state: PositionerState,
}

impl AntennaPositioner {
    pub fn new(settings: PositionerSettings, drive: Box<dyn PositionerDrive>) -> Self {
        Self {
            settings,
            drive,
            state: PositionerState::Unknown,
        }
    }

    pub fn state(&self) -> PositionerState {
        self.state
    }

    /// Index of the current (azimuth, polarization) pair in the cycle
    pub fn position_index(&self) -> Option<usize> {
        match self.state {
            PositionerState::Unknown => None,
            PositionerState::Known {
                azimuth_index,
                polarization,
                ..
            } => {
                let pol_index = self
                    .settings
                    .polarizations
                    .iter()
                    .position(|p| *p == polarization)?;
                Some(azimuth_index * self.settings.polarizations.len() + pol_index)
            }
        }
    }

    pub fn is_last_position(&self) -> bool {
        self.position_index() == Some(self.settings.positions() - 1)
    }

    /// Move to the reference position, the only way out of an unknown state
    pub fn home(&mut self, signal: &ShutdownSignal) -> Result<PositionerState, PositionError> {
        let azimuth_deg = self.settings.azimuths_deg[0];
        let polarization = self.settings.polarizations[0];
        self.state = PositionerState::Unknown;
        self.drive
            .start_homing(azimuth_deg, polarization)
            .map_err(|e| self.lost(e.into()))?;
        self.wait_settled("homing".to_string(), signal)?;
        self.state = PositionerState::Known {
            azimuth_index: 0,
            azimuth_deg,
            polarization,
        };
        info!(azimuth_deg, %polarization, "Antenna homed");
        Ok(self.state)
    }

    /// Step to the next position of the cycle, wrapping to the first after the last
    pub fn advance(&mut self, signal: &ShutdownSignal) -> Result<PositionerState, PositionError> {
        let current = self.position_index().ok_or(PositionError::Unknown)?;
        let next = (current + 1) % self.settings.positions();
        if next == 0 {
            return self.home(signal);
        }
        let n_pol = self.settings.polarizations.len();
        let azimuth_index = next / n_pol;
        let azimuth_deg = self.settings.azimuths_deg[azimuth_index];
        let polarization = self.settings.polarizations[next % n_pol];

        if let PositionerState::Known {
            azimuth_index: current_az,
            polarization: current_pol,
            ..
        } = self.state
        {
            if current_az != azimuth_index {
                self.drive
                    .start_azimuth_move(azimuth_deg)
                    .map_err(|e| self.lost(e.into()))?;
                self.wait_settled(format!("azimuth move to {azimuth_deg} deg"), signal)?;
            }
            if current_pol != polarization {
                self.drive
                    .start_polarization_change(polarization)
                    .map_err(|e| self.lost(e.into()))?;
                self.wait_settled(format!("polarization change to {polarization}"), signal)?;
            }
        }
        self.state = PositionerState::Known {
            azimuth_index,
            azimuth_deg,
            polarization,
        };
        info!(position = next, azimuth_deg, %polarization, "Antenna positioned");
        Ok(self.state)
    }

    /// Change polarization at the current azimuth
    pub fn change_polarization(
        &mut self,
        target: Polarization,
        signal: &ShutdownSignal,
    ) -> Result<PositionerState, PositionError> {
        let (azimuth_index, azimuth_deg, current) = match self.state {
            PositionerState::Unknown => return Err(PositionError::Unknown),
            PositionerState::Known {
                azimuth_index,
                azimuth_deg,
                polarization,
            } => (azimuth_index, azimuth_deg, polarization),
        };
        if !self.settings.polarizations.contains(&target) {
            return Err(PositionError::NotInPlan(target));
        }
        if current != target {
            self.drive
                .start_polarization_change(target)
                .map_err(|e| self.lost(e.into()))?;
            self.wait_settled(format!("polarization change to {target}"), signal)?;
            self.state = PositionerState::Known {
                azimuth_index,
                azimuth_deg,
                polarization: target,
            };
            info!(%target, "Polarization changed");
        }
        Ok(self.state)
    }

    fn lost(&mut self, e: PositionError) -> PositionError {
        self.state = PositionerState::Unknown;
        e
    }

    fn wait_settled(&mut self, target: String, signal: &ShutdownSignal) -> Result<(), PositionError> {
        let timeout = Duration::from_millis(self.settings.move_timeout_ms);
        let poll = Duration::from_millis(self.settings.poll_ms);
        let start = Instant::now();
        loop {
            match self.drive.is_settled() {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => return Err(self.lost(e.into())),
            }
            if signal.is_forced() {
                return Err(self.lost(PositionError::Aborted));
            }
            let waited = start.elapsed();
            if waited >= timeout {
                warn!(%target, ?waited, "Positioner move timed out");
                return Err(self.lost(PositionError::Timeout { target, waited }));
            }
            thread::sleep(poll.min(timeout - waited));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedRotator;

    fn settings() -> PositionerSettings {
        PositionerSettings {
            azimuths_deg: vec![0.0, 90.0, 180.0],
            polarizations: vec![Polarization::Horizontal, Polarization::Vertical],
            move_timeout_ms: 100,
            poll_ms: 1,
        }
    }

    fn positioner() -> (AntennaPositioner, SimulatedRotator) {
        let rotator = SimulatedRotator::new(Duration::from_millis(2));
        let positioner = AntennaPositioner::new(settings(), Box::new(rotator.clone()));
        (positioner, rotator)
    }

    fn signal() -> ShutdownSignal {
        ShutdownSignal::new(Duration::from_secs(1))
    }

    #[test]
    fn starts_unknown_and_needs_homing() {
        let (mut p, _) = positioner();
        assert_eq!(p.state(), PositionerState::Unknown);
        assert!(matches!(p.advance(&signal()), Err(PositionError::Unknown)));
        p.home(&signal()).unwrap();
        assert_eq!(p.position_index(), Some(0));
    }

    #[test]
    fn walks_the_plan_azimuth_major() {
        let (mut p, rotator) = positioner();
        p.home(&signal()).unwrap();
        let mut seen = vec![p.state()];
        for _ in 0..5 {
            seen.push(p.advance(&signal()).unwrap());
        }
        assert!(p.is_last_position());
        assert_eq!(
            seen[1],
            PositionerState::Known {
                azimuth_index: 0,
                azimuth_deg: 0.0,
                polarization: Polarization::Vertical
            }
        );
        assert_eq!(
            seen[2],
            PositionerState::Known {
                azimuth_index: 1,
                azimuth_deg: 90.0,
                polarization: Polarization::Horizontal
            }
        );
        assert_eq!(rotator.azimuth_deg(), 180.0);
        // Wraps back to the start
        p.advance(&signal()).unwrap();
        assert_eq!(p.position_index(), Some(0));
        assert_eq!(rotator.azimuth_deg(), 0.0);
    }

    #[test]
    fn timeout_leaves_state_unknown_until_homed() {
        let (mut p, rotator) = positioner();
        p.home(&signal()).unwrap();
        rotator.set_stalled(true);
        assert!(matches!(
            p.advance(&signal()),
            Err(PositionError::Timeout { .. })
        ));
        assert_eq!(p.state(), PositionerState::Unknown);
        assert!(matches!(p.advance(&signal()), Err(PositionError::Unknown)));
        rotator.set_stalled(false);
        p.home(&signal()).unwrap();
        assert!(matches!(p.state(), PositionerState::Known { .. }));
    }

    #[test]
    fn polarization_change_keeps_azimuth() {
        let (mut p, rotator) = positioner();
        p.home(&signal()).unwrap();
        p.advance(&signal()).unwrap();
        p.advance(&signal()).unwrap();
        let state = p
            .change_polarization(Polarization::Vertical, &signal())
            .unwrap();
        assert_eq!(
            state,
            PositionerState::Known {
                azimuth_index: 1,
                azimuth_deg: 90.0,
                polarization: Polarization::Vertical
            }
        );
        assert_eq!(rotator.polarization(), Polarization::Vertical);
    }

    #[test]
    fn forced_shutdown_aborts_move() {
        let (mut p, rotator) = positioner();
        p.home(&signal()).unwrap();
        rotator.set_stalled(true);
        let forced = ShutdownSignal::new(Duration::ZERO);
        forced.request();
        assert!(matches!(p.advance(&forced), Err(PositionError::Aborted)));
        assert_eq!(p.state(), PositionerState::Unknown);
    }

    #[test]
    fn empty_plan_is_rejected() {
        let mut s = settings();
        s.azimuths_deg.clear();
        assert!(s.validate().is_err());
    }

    #[test]
    fn zero_move_timeout_is_rejected() {
        let mut s = settings();
        s.move_timeout_ms = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn polarization_codes() {
        assert_eq!(Polarization::from_code(0.0), Some(Polarization::Horizontal));
        assert_eq!(Polarization::from_code(1.0), Some(Polarization::Vertical));
        assert_eq!(Polarization::from_code(0.5), None);
        assert_eq!(Polarization::from_code(2.0), None);
        assert_eq!(Polarization::from_code(f64::NAN), None);
    }

    #[test]
    fn polarization_outside_plan_is_refused() {
        let mut s = settings();
        s.polarizations = vec![Polarization::Horizontal];
        let rotator = SimulatedRotator::new(Duration::from_millis(2));
        let mut p = AntennaPositioner::new(s, Box::new(rotator.clone()));
        p.home(&signal()).unwrap();
        assert!(matches!(
            p.change_polarization(Polarization::Vertical, &signal()),
            Err(PositionError::NotInPlan(Polarization::Vertical))
        ));
        assert_eq!(rotator.polarization(), Polarization::Horizontal);
        assert_eq!(p.position_index(), Some(0));
    }
}
