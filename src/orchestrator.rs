//! Top-level acquisition state machine

use std::{
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    band::{BandConfigurator, BandPlan, BandRequest},
    calibration::{FrontEndCalibrator, FrontEndSwitch},
    config::StationConfig,
    curve::{apply_correction, CurveAdjuster},
    device::{is_supported_bandwidth, DeviceInterface, Transport, DEVICE_FREQ_RESOLUTION_HZ},
    error::{CalibrationError, CaptureError, ConfigError, DeviceError, ProtocolError, StationError},
    positioner::{AntennaPositioner, Polarization, PositionerDrive, PositionerState},
    protocol::{Command, CommandType, ControlServer, Reply, Status, SweepReply, TargetVariable},
    rfi::{RfiDetector, RfiRecord, RfiSettings, ThresholdCurve, MAX_RFI_WINDOW},
    signal::ShutdownSignal,
    sink::{Record, RecordSink, RfiReport},
    spectrum::{Observation, Spectrum},
    sweep::SweepBuilder,
    time::{self, TimeFeed, TimeSource, TimeStream},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationState {
    Boot,
    Configuring,
    Ready,
    Sweeping,
    Calibrating,
    Positioning,
    ShuttingDown,
    Terminated,
}

/// Everything the station drives, handed over at boot
pub struct Hardware<T: Transport> {
    pub device: DeviceInterface<T>,
    pub switch: Box<dyn FrontEndSwitch>,
    pub drive: Box<dyn PositionerDrive>,
    pub sink: Box<dyn RecordSink>,
    pub time_source: Box<dyn TimeSource>,
    pub control: Option<ControlServer>,
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

pub struct Orchestrator<T: Transport> {
    config: StationConfig,
    state: StationState,
    signal: ShutdownSignal,
    device: DeviceInterface<T>,
    configurator: BandConfigurator,
    builder: SweepBuilder,
    adjuster: CurveAdjuster,
    calibrator: FrontEndCalibrator,
    detector: RfiDetector,
    /// Whether the detector's history holds calibrated spectra
    detector_calibrated: bool,
    rfi_settings: RfiSettings,
    threshold: Option<ThresholdCurve>,
    positioner: AntennaPositioner,
    switch: Box<dyn FrontEndSwitch>,
    sink: Box<dyn RecordSink>,
    control: Option<ControlServer>,
    time_stream: Option<TimeStream>,
    time: TimeFeed,
    requests: Vec<BandRequest>,
    /// Remote start and stop frequency overrides
    window: (Option<f64>, Option<f64>),
    plan: BandPlan,
}

impl<T: Transport> Orchestrator<T> {
    /// Build every component. Nothing talks to the hardware yet.
    pub fn new(
        config: StationConfig,
        hardware: Hardware<T>,
        signal: ShutdownSignal,
    ) -> Result<Self, StationError> {
        info!("Booting station");
        let adjuster =
            CurveAdjuster::new(&config.curves.antenna_gain_db, &config.curves.cable_loss_db)?;
        let plan = BandPlan::build(&config.bands, None, &config.limits)?;
        let calibrator = FrontEndCalibrator::new(config.calibration.clone());
        let detector = RfiDetector::from_settings(&config.rfi);
        let threshold = config.rfi.absolute.clone().map(ThresholdCurve::new);
        let positioner = AntennaPositioner::new(config.positioner.clone(), hardware.drive);
        let builder = SweepBuilder::new(config.sweep.band_retries, ms(config.sweep.point_timeout_ms));
        let configurator = BandConfigurator::new(config.fixed.clone());
        let (time_stream, time) = time::spawn(
            hardware.time_source,
            ms(config.time.period_ms),
            config.time.capacity,
            config.time.station,
        )?;
        Ok(Self {
            state: StationState::Boot,
            signal,
            device: hardware.device,
            configurator,
            builder,
            adjuster,
            calibrator,
            detector,
            detector_calibrated: false,
            rfi_settings: config.rfi.clone(),
            threshold,
            positioner,
            switch: hardware.switch,
            sink: hardware.sink,
            control: hardware.control,
            time_stream: Some(time_stream),
            time,
            requests: config.bands.clone(),
            window: (None, None),
            plan,
            config,
        })
    }

    pub fn state(&self) -> StationState {
        self.state
    }

    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }

    pub fn plan(&self) -> &BandPlan {
        &self.plan
    }

    pub fn positioner(&self) -> &AntennaPositioner {
        &self.positioner
    }

    pub fn calibrator(&self) -> &FrontEndCalibrator {
        &self.calibrator
    }

    pub fn detector(&self) -> &RfiDetector {
        &self.detector
    }

    pub fn rfi_settings(&self) -> &RfiSettings {
        &self.rfi_settings
    }

    pub fn device(&self) -> &DeviceInterface<T> {
        &self.device
    }

    /// Open the analyzer session and apply the fixed settings
    pub fn configure(&mut self) -> Result<(), StationError> {
        self.state = StationState::Configuring;
        self.open_device()?;
        self.state = StationState::Ready;
        info!(bands = self.plan.len(), "Station ready");
        Ok(())
    }

    fn open_device(&mut self) -> Result<(), StationError> {
        let attempts = self.config.device.reset_attempts + 1;
        let mut last = DeviceError::NotConnected;
        for attempt in 1..=attempts {
            let opened = self
                .device
                .initialize()
                .and_then(|_| self.configurator.initial_configuration(&mut self.device));
            match opened {
                Ok(()) => {
                    debug!(attempt, "Analyzer configured");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Analyzer initialization failed");
                    if let Err(reset) = self.device.soft_reset() {
                        warn!(error = %reset, "Soft reset failed");
                    }
                    last = e;
                }
            }
        }
        Err(StationError::DeviceUnreachable(last))
    }

    /// Serve commands until shutdown is requested, then shut down in order
    pub fn run(&mut self) -> Result<(), StationError> {
        if self.state == StationState::Boot {
            if let Err(e) = self.configure() {
                error!(error = %e, "Station configuration failed");
                self.abort(&e);
                return Err(e);
            }
        }
        while !self.signal.is_requested() {
            if let Err(e) = self.step() {
                error!(error = %e, "Unrecoverable station failure");
                self.abort(&e);
                return Err(e);
            }
        }
        self.shutdown()
    }

    fn abort(&mut self, cause: &StationError) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, %cause, "Shutdown after failure was not clean");
        }
    }

    /// One pass of the idle loop: a pending command, an autonomous cycle step,
    /// or a short wait
    pub fn step(&mut self) -> Result<(), StationError> {
        let polled = self.control.as_mut().map(|c| c.poll_command());
        match polled {
            Some(Ok(Some(command))) => self.execute(command),
            Some(Err(ProtocolError::Io(e))) => {
                warn!(error = %e, "Control connection lost");
                Ok(())
            }
            Some(Err(e)) => {
                warn!(error = %e, "Malformed control message");
                self.send_reply(Reply::new(Status::InvalidCommand));
                Ok(())
            }
            Some(Ok(None)) | None => {
                if self.config.station.autonomous {
                    self.cycle_step()
                } else {
                    if !self.control.as_ref().map_or(false, |c| c.has_client()) {
                        thread::sleep(ms(self.config.control.read_timeout_ms));
                    }
                    Ok(())
                }
            }
        }
    }

    /// Run a command and answer it. Only fatal failures are returned.
    pub fn execute(&mut self, command: Command) -> Result<(), StationError> {
        info!(?command, "Executing command");
        let outcome = self.dispatch(command);
        let status = match &outcome {
            Ok(_) => Status::Ok,
            Err(e) => self.status_for(e),
        };
        if command.command_type == CommandType::CaptureSweep {
            let reply = match &outcome {
                Ok(Some(spectrum)) => SweepReply::from_spectrum(spectrum),
                _ => SweepReply::failed(status),
            };
            self.send_sweep_reply(&reply);
        } else {
            self.send_reply(Reply::new(status));
        }
        self.settle(outcome.map(|_| ()))
    }

    /// Carry out a command without replying
    pub fn dispatch(&mut self, command: Command) -> Result<Option<Spectrum>, StationError> {
        if self.signal.is_requested() && command.command_type != CommandType::Shutdown {
            return Err(StationError::ShuttingDown);
        }
        match command.command_type {
            CommandType::SetVariable => {
                self.set_variable(command.variable, command.value)?;
            }
            CommandType::CaptureSweep => {
                return Ok(Some(self.capture_observation()?.spectrum));
            }
            CommandType::Calibrate => self.calibrate()?,
            CommandType::Advance => {
                self.state = StationState::Positioning;
                self.positioner.advance(&self.signal)?;
            }
            CommandType::Home => {
                self.state = StationState::Positioning;
                self.positioner.home(&self.signal)?;
            }
            CommandType::ChangePolarization => {
                let target = Polarization::from_code(command.value as f64).ok_or_else(|| {
                    ConfigError::invalid("polarization", "must be 0 (horizontal) or 1 (vertical)")
                })?;
                self.state = StationState::Positioning;
                self.positioner.change_polarization(target, &self.signal)?;
            }
            CommandType::Shutdown => {
                info!("Shutdown requested by control client");
                self.signal.request();
            }
        }
        Ok(None)
    }

    fn status_for(&self, e: &StationError) -> Status {
        if self.signal.is_requested() {
            Status::ShuttingDown
        } else {
            Status::from(e)
        }
    }

    /// Back to READY after an operation, recovering the analyzer if it failed
    fn settle(&mut self, result: Result<(), StationError>) -> Result<(), StationError> {
        if !self.signal.is_requested() {
            self.state = StationState::Ready;
        }
        let e = match result {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if e.is_fatal() {
            return Err(e);
        }
        warn!(error = %e, "Operation failed");
        if needs_device_reset(&e) && !self.signal.is_requested() {
            self.recover_device()?;
        }
        Ok(())
    }

    fn recover_device(&mut self) -> Result<(), StationError> {
        warn!("Resetting analyzer");
        if let Err(e) = self.device.soft_reset() {
            warn!(error = %e, "Soft reset failed");
        }
        self.open_device()?;
        info!("Analyzer recovered");
        Ok(())
    }

    fn send_reply(&mut self, reply: Reply) {
        if let Some(control) = self.control.as_mut() {
            if let Err(e) = control.respond(reply) {
                warn!(error = %e, "Could not send reply");
            }
        }
    }

    fn send_sweep_reply(&mut self, reply: &SweepReply) {
        if let Some(control) = self.control.as_mut() {
            if let Err(e) = control.respond_sweep(reply) {
                warn!(error = %e, "Could not send sweep reply");
            }
        }
    }

    fn position_fields(&self) -> (Option<f64>, Option<Polarization>) {
        match self.positioner.state() {
            PositionerState::Known {
                azimuth_deg,
                polarization,
                ..
            } => (Some(azimuth_deg), Some(polarization)),
            PositionerState::Unknown => (None, None),
        }
    }

    /// Capture, calibrate, correct, detect and record one spectrum
    pub fn capture_observation(&mut self) -> Result<Observation, StationError> {
        self.state = StationState::Sweeping;
        let raw = self
            .builder
            .capture(&mut self.device, &self.configurator, &self.plan, &self.signal)?;
        let time = self.time.latest();
        let at = time.utc();

        let (spectrum, calibrated, absolute) = match self.calibrator.parameters() {
            Some(parameters) => {
                let input = parameters.calibrate_spectrum(&raw, &self.plan)?;
                let absolute = match &self.threshold {
                    Some(threshold) => {
                        // Power at the antenna terminals
                        let at_antenna = apply_correction(&input, &self.config.curves.cable_loss_db)?;
                        Some(threshold.detect_absolute(&at_antenna, &self.plan, at)?)
                    }
                    None => None,
                };
                (self.adjuster.apply(&input)?, true, absolute)
            }
            None => (raw, false, None),
        };

        if calibrated != self.detector_calibrated {
            self.detector.reset();
            self.detector_calibrated = calibrated;
        }
        let records = self.detector.push(&spectrum, at)?;

        let (azimuth_deg, polarization) = self.position_fields();
        let observation = Observation {
            spectrum,
            time: time.clone(),
            azimuth_deg,
            polarization,
            calibrated,
        };
        self.sink.write(&Record::Observation(observation.clone()))?;

        if !records.is_empty() {
            let bands = count_runs(&observation.spectrum, &records);
            self.sink.write(&Record::Rfi(RfiReport {
                time: time.clone(),
                azimuth_deg,
                polarization,
                norm: None,
                records,
                bands,
            }))?;
        }
        if let Some(detection) = absolute {
            if !detection.records.is_empty() {
                warn!(
                    norm = ?detection.norm,
                    flagged = detection.records.len(),
                    bands = detection.bands,
                    "Harmful interference above limit"
                );
                self.sink.write(&Record::Rfi(RfiReport {
                    time,
                    azimuth_deg,
                    polarization,
                    norm: Some(detection.norm),
                    records: detection.records,
                    bands: detection.bands,
                }))?;
            }
        }
        Ok(observation)
    }

    /// Noise-source calibration of the front end over the current plan
    pub fn calibrate(&mut self) -> Result<(), StationError> {
        self.state = StationState::Calibrating;
        let at = self.time.latest().utc();
        let Self {
            ref mut calibrator,
            ref mut switch,
            ref mut device,
            ref builder,
            ref configurator,
            ref plan,
            ref signal,
            ..
        } = *self;
        let parameters = calibrator
            .calibrate(switch.as_mut(), plan, at, || {
                builder.capture(device, configurator, plan, signal)
            })?
            .clone();
        self.sink.write(&Record::FrontEnd(parameters))?;
        self.detector.reset();
        Ok(())
    }

    fn set_variable(&mut self, variable: TargetVariable, value: f32) -> Result<(), StationError> {
        let value = value as f64;
        if !value.is_finite() {
            return Err(ConfigError::invalid("value", "must be finite").into());
        }
        match variable {
            TargetVariable::None => {
                Err(ConfigError::invalid("variable", "no target variable given").into())
            }
            TargetVariable::StartFrequency => {
                let window = (Some(value * 1e6), self.window.1);
                self.replan(self.requests.clone(), window)
            }
            TargetVariable::StopFrequency => {
                let window = (self.window.0, Some(value * 1e6));
                self.replan(self.requests.clone(), window)
            }
            TargetVariable::Rbw => {
                if !is_supported_bandwidth(value) {
                    return Err(ConfigError::UnsupportedBandwidth(value).into());
                }
                let mut requests = self.requests.clone();
                for r in &mut requests {
                    r.rbw_hz = value;
                    r.vbw_hz = value;
                }
                self.replan(requests, self.window)
            }
            TargetVariable::SweepTime => {
                if value < 1.0 {
                    return Err(ConfigError::invalid("sweep_time_ms", "must be at least 1 ms").into());
                }
                let mut requests = self.requests.clone();
                for r in &mut requests {
                    r.sweep_time_ms = value.round() as u64;
                }
                self.replan(requests, self.window)
            }
            TargetVariable::RfiThreshold
            | TargetVariable::RfiWindow
            | TargetVariable::RfiConsecutive => {
                let mut settings = self.rfi_settings.clone();
                match variable {
                    TargetVariable::RfiThreshold => settings.threshold_db = value,
                    TargetVariable::RfiWindow => {
                        settings.window = whole(value, MAX_RFI_WINDOW, "rfi.window")?
                    }
                    _ => settings.consecutive = whole(value, MAX_RFI_WINDOW, "rfi.consecutive")?,
                }
                settings.validate()?;
                self.detector = RfiDetector::from_settings(&settings);
                info!(
                    window = settings.window,
                    threshold_db = settings.threshold_db,
                    consecutive = settings.consecutive,
                    "RFI detector reconfigured"
                );
                self.rfi_settings = settings;
                Ok(())
            }
        }
    }

    /// Swap in a new plan only if it builds
    fn replan(
        &mut self,
        requests: Vec<BandRequest>,
        window: (Option<f64>, Option<f64>),
    ) -> Result<(), StationError> {
        let bounds = match window {
            (None, None) => None,
            (start, stop) => {
                let first = requests
                    .first()
                    .ok_or_else(|| ConfigError::invalid("bands", "no frequency band configured"))?;
                let last = requests
                    .last()
                    .ok_or_else(|| ConfigError::invalid("bands", "no frequency band configured"))?;
                Some((start.unwrap_or(first.start_hz), stop.unwrap_or(last.stop_hz)))
            }
        };
        let plan = BandPlan::build(&requests, bounds, &self.config.limits)?;
        self.plan = plan;
        self.requests = requests;
        self.window = window;
        self.detector.reset();
        if self.calibrator.parameters().map_or(false, |p| p.derived_at.is_some()) {
            info!("Front-end calibration dropped with the old band plan");
        }
        self.calibrator.invalidate();
        info!(
            bands = self.plan.len(),
            start_hz = self.plan.start_hz(),
            stop_hz = self.plan.stop_hz(),
            "Band plan updated"
        );
        Ok(())
    }

    fn cycle_step(&mut self) -> Result<(), StationError> {
        let result = self.cycle_position();
        let failed = result.is_err();
        self.settle(result)?;
        if failed {
            thread::sleep(ms(self.config.control.read_timeout_ms));
        }
        Ok(())
    }

    /// One position of the autonomous measurement cycle
    fn cycle_position(&mut self) -> Result<(), StationError> {
        // Sample frequencies come back on the analyzer's grid
        let tol = DEVICE_FREQ_RESOLUTION_HZ as f64;
        let current = match (self.calibrator.parameters(), self.plan.start_hz(), self.plan.stop_hz()) {
            (Some(p), Some(start), Some(stop)) => {
                p.derived_at.is_some() && p.covers(start + tol, stop - tol)
            }
            _ => false,
        };
        if !current {
            self.calibrate()?;
        }
        if self.positioner.state() == PositionerState::Unknown {
            self.state = StationState::Positioning;
            self.positioner.home(&self.signal)?;
        }
        self.capture_observation()?;
        if self.signal.is_requested() {
            return Ok(());
        }
        self.state = StationState::Positioning;
        let last = self.positioner.is_last_position();
        self.positioner.advance(&self.signal)?;
        if last {
            info!("Measurement cycle complete");
        }
        Ok(())
    }

    /// Ordered teardown: stop taking commands, make sure the analyzer is idle,
    /// release it, then stop the time source.
    ///
    /// Runs on the thread that ran the last operation, so that operation has
    /// already finished or aborted.
    pub fn shutdown(&mut self) -> Result<(), StationError> {
        if self.state == StationState::Terminated {
            return Ok(());
        }
        self.signal.request();
        self.state = StationState::ShuttingDown;
        info!("Shutting down");
        let started = Instant::now();

        if let Some(control) = self.control.take() {
            control.close();
        }
        if self.device.is_streaming() {
            if let Err(e) = self.device.disable_sweep() {
                warn!(error = %e, "Could not stop streaming");
            }
        }
        if self.device.is_logged_in() {
            match self.device.soft_reset() {
                Ok(()) => info!("Analyzer released"),
                Err(e) => warn!(error = %e, "Analyzer soft reset failed"),
            }
        }
        let joined = match self.time_stream.take() {
            Some(stream) => stream.stop_and_join(ms(self.config.time.join_timeout_ms)),
            None => Ok(()),
        };
        self.state = StationState::Terminated;
        joined?;

        let limit = self.config.shutdown_timeout();
        let elapsed = self.signal.requested_for().unwrap_or_else(|| started.elapsed());
        if elapsed > limit {
            return Err(StationError::ShutdownTimeout(limit));
        }
        info!(?elapsed, "Station terminated");
        Ok(())
    }
}

/// Failures that leave the analyzer in an unknown state
fn needs_device_reset(e: &StationError) -> bool {
    match e {
        StationError::Device(_) => true,
        StationError::Capture(CaptureError::Band { .. }) => true,
        StationError::Calibration(CalibrationError::Capture(CaptureError::Band { .. })) => true,
        _ => false,
    }
}

fn whole(value: f64, max: usize, field: &'static str) -> Result<usize, ConfigError> {
    if value < 1.0 || value.fract() != 0.0 {
        return Err(ConfigError::invalid(field, "must be a positive whole number"));
    }
    if value > max as f64 {
        return Err(ConfigError::invalid(field, format!("must not exceed {max}")));
    }
    Ok(value as usize)
}

/// Contiguous runs of flagged samples
fn count_runs(spectrum: &Spectrum, records: &[RfiRecord]) -> usize {
    let mut pending = records.iter().peekable();
    let mut runs = 0;
    let mut previous = false;
    for sample in spectrum.samples() {
        let hit = pending
            .peek()
            .map_or(false, |r| r.frequency_hz == sample.frequency);
        if hit {
            pending.next();
            if !previous {
                runs += 1;
            }
        }
        previous = hit;
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        calibration::CalibrationState,
        config::tests::SAMPLE,
        sim::{Carrier, SimConfig, SimControl, SimEvent, SimulatedNoiseSource, SimulatedRotator, SimulatedSpectran},
        sink::MemorySink,
        time::SystemClock,
    };
    use chrono::Utc;

    struct Rig {
        station: Orchestrator<SimulatedSpectran>,
        faults: SimControl,
        noise_source: SimulatedNoiseSource,
        rotator: SimulatedRotator,
        sink: MemorySink,
    }

    fn config() -> StationConfig {
        let mut config = StationConfig::from_json(SAMPLE).unwrap();
        config.device.reply_timeout_ms = 30;
        config.device.reset_attempts = 1;
        config.sweep.point_timeout_ms = 30;
        config.positioner.move_timeout_ms = 200;
        config.positioner.poll_ms = 1;
        config.control.read_timeout_ms = 5;
        config.time.period_ms = 10;
        config.station.shutdown_grace_ms = 100;
        config.station.shutdown_timeout_ms = 5000;
        config
    }

    fn rig(config: StationConfig) -> Rig {
        let sim = SimulatedSpectran::new(SimConfig::default());
        let faults = sim.faults();
        let noise_source = sim.noise_source();
        let rotator = SimulatedRotator::new(Duration::from_millis(1));
        let sink = MemorySink::new();
        let hardware = Hardware {
            device: DeviceInterface::new(sim, ms(config.device.reply_timeout_ms), config.device.handshake_rounds),
            switch: Box::new(noise_source.clone()),
            drive: Box::new(rotator.clone()),
            sink: Box::new(sink.clone()),
            time_source: Box::new(SystemClock::new(None)),
            control: None,
        };
        let mut station =
            Orchestrator::new(config, hardware, ShutdownSignal::new(Duration::from_millis(100))).unwrap();
        station.configure().unwrap();
        Rig {
            station,
            faults,
            noise_source,
            rotator,
            sink,
        }
    }

    fn observations(sink: &MemorySink) -> usize {
        sink.records()
            .iter()
            .filter(|r| matches!(r, Record::Observation(_)))
            .count()
    }

    #[test]
    fn configures_into_ready() {
        let mut rig = rig(config());
        assert_eq!(rig.station.state(), StationState::Ready);
        assert!(rig.station.device().is_logged_in());
        rig.station.shutdown().unwrap();
        assert_eq!(rig.station.state(), StationState::Terminated);
        assert!(!rig.station.device().is_logged_in());
    }

    #[test]
    fn capture_records_calibrated_observation() {
        let mut rig = rig(config());
        let spectrum = rig
            .station
            .dispatch(Command::simple(CommandType::CaptureSweep))
            .unwrap()
            .unwrap();
        assert_eq!(spectrum.first_hz(), Some(980e6));
        assert_eq!(spectrum.last_hz(), Some(1020e6));
        match &rig.sink.records()[0] {
            Record::Observation(o) => assert!(o.calibrated),
            other => panic!("unexpected {other:?}"),
        }
        rig.station.shutdown().unwrap();
    }

    #[test]
    fn remote_window_rebuilds_plan() {
        let mut rig = rig(config());
        let set = |v, x| Command::new(CommandType::SetVariable, v, x);
        rig.station
            .dispatch(set(TargetVariable::StartFrequency, 990.0))
            .unwrap();
        assert_eq!(rig.station.plan().start_hz(), Some(990e6));
        // Start above stop is refused and leaves the plan alone
        assert!(rig
            .station
            .dispatch(set(TargetVariable::StartFrequency, 1030.0))
            .is_err());
        assert_eq!(rig.station.plan().start_hz(), Some(990e6));
        assert!(rig.station.dispatch(set(TargetVariable::Rbw, 123.0)).is_err());
        assert!(rig
            .station
            .dispatch(set(TargetVariable::RfiConsecutive, 9.0))
            .is_err());
        rig.station
            .dispatch(set(TargetVariable::RfiWindow, 3.0))
            .unwrap();
        rig.station.shutdown().unwrap();
    }

    #[test]
    fn replan_drops_calibration_and_capture_continues() {
        let mut rig = rig(config());
        let set = |v, x| Command::new(CommandType::SetVariable, v, x);
        rig.station
            .dispatch(Command::simple(CommandType::Calibrate))
            .unwrap();
        rig.station
            .dispatch(set(TargetVariable::StartFrequency, 970.0))
            .unwrap();
        // Configured defaults stand in until the next calibration
        let parameters = rig.station.calibrator().parameters().unwrap();
        assert_eq!(parameters.derived_at, None);
        assert_eq!(rig.station.calibrator().state(), CalibrationState::Idle);
        let spectrum = rig
            .station
            .dispatch(Command::simple(CommandType::CaptureSweep))
            .unwrap()
            .unwrap();
        assert_eq!(spectrum.first_hz(), Some(970e6));

        rig.station
            .dispatch(Command::simple(CommandType::Calibrate))
            .unwrap();
        let parameters = rig.station.calibrator().parameters().unwrap();
        assert!(parameters.derived_at.is_some());
        assert!(parameters.covers(970e6, 1020e6));
        rig.station
            .dispatch(Command::simple(CommandType::CaptureSweep))
            .unwrap();
        assert_eq!(observations(&rig.sink), 2);
        rig.station.shutdown().unwrap();
    }

    #[test]
    fn out_of_range_detector_settings_leave_detector_alone() {
        let mut rig = rig(config());
        let set = |v, x| Command::new(CommandType::SetVariable, v, x);
        let before = rig.station.rfi_settings().clone();
        for command in [
            set(TargetVariable::RfiWindow, 4e18),
            set(TargetVariable::RfiWindow, (MAX_RFI_WINDOW + 1) as f32),
            set(TargetVariable::RfiConsecutive, 4e18),
            set(TargetVariable::RfiConsecutive, 0.0),
        ] {
            let err = rig.station.dispatch(command).unwrap_err();
            assert_eq!(Status::from(&err), Status::InvalidArgument);
        }
        assert_eq!(rig.station.rfi_settings(), &before);
        rig.station
            .dispatch(set(TargetVariable::RfiWindow, MAX_RFI_WINDOW as f32))
            .unwrap();
        assert_eq!(rig.station.rfi_settings().window, MAX_RFI_WINDOW);
        rig.station.shutdown().unwrap();
    }

    #[test]
    fn polarization_codes_other_than_zero_or_one_are_refused() {
        let mut rig = rig(config());
        rig.station.dispatch(Command::simple(CommandType::Home)).unwrap();
        let change = |x| Command::new(CommandType::ChangePolarization, TargetVariable::None, x);
        for value in [0.5, 2.0, -1.0, f32::NAN] {
            let err = rig.station.dispatch(change(value)).unwrap_err();
            assert_eq!(Status::from(&err), Status::InvalidArgument);
        }
        assert_eq!(rig.rotator.polarization(), Polarization::Horizontal);
        rig.station.dispatch(change(1.0)).unwrap();
        assert_eq!(rig.rotator.polarization(), Polarization::Vertical);
        rig.station.shutdown().unwrap();
    }

    #[test]
    fn calibration_derives_parameters_and_restores_switch() {
        let mut rig = rig(config());
        rig.station
            .dispatch(Command::simple(CommandType::Calibrate))
            .unwrap();
        let parameters = rig.station.calibrator().parameters().unwrap();
        assert!(parameters.derived_at.is_some());
        let gain = parameters.gain_db.value_at(1e9).unwrap();
        assert!((gain - 35.0).abs() < 0.5, "gain {gain}");
        assert_eq!(rig.station.calibrator().state(), CalibrationState::CurveDerived);
        assert!(!rig.noise_source.is_on());
        assert!(!rig.noise_source.is_routed());
        assert!(rig
            .sink
            .records()
            .iter()
            .any(|r| matches!(r, Record::FrontEnd(_))));
        rig.station.shutdown().unwrap();
    }

    #[test]
    fn statistical_detector_flags_new_carrier() {
        let mut cfg = config();
        cfg.rfi.absolute = None;
        let mut rig = rig(cfg);
        assert!(!rig.station.detector().is_ready());
        for _ in 0..5 {
            rig.station.capture_observation().unwrap();
        }
        rig.faults.add_carrier(Carrier {
            freq_hz: 1005e6,
            power_dbm: -40.0,
            width_hz: 1e6,
        });
        rig.station.capture_observation().unwrap();
        assert!(rig.station.detector().flagged().is_empty());
        rig.station.capture_observation().unwrap();
        assert!(!rig.station.detector().flagged().is_empty());
        let report = rig.sink.records().into_iter().find_map(|r| match r {
            Record::Rfi(report) => Some(report),
            _ => None,
        });
        let report = report.unwrap();
        assert_eq!(report.norm, None);
        assert_eq!(report.bands, 1);
        rig.station.shutdown().unwrap();
    }

    #[test]
    fn device_failure_is_recovered() {
        let mut rig = rig(config());
        rig.faults.drop_points(3);
        rig.station
            .execute(Command::simple(CommandType::CaptureSweep))
            .unwrap();
        assert_eq!(rig.station.state(), StationState::Ready);
        assert!(rig.station.device().is_logged_in());
        assert_eq!(observations(&rig.sink), 0);
        rig.station
            .execute(Command::simple(CommandType::CaptureSweep))
            .unwrap();
        assert_eq!(observations(&rig.sink), 1);
        rig.station.shutdown().unwrap();
    }

    #[test]
    fn unreachable_device_is_fatal() {
        let mut rig = rig(config());
        rig.faults.set_unreachable(true);
        let err = rig
            .station
            .execute(Command::simple(CommandType::CaptureSweep))
            .unwrap_err();
        assert!(matches!(err, StationError::DeviceUnreachable(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn positioning_commands() {
        let mut rig = rig(config());
        assert!(rig
            .station
            .dispatch(Command::simple(CommandType::Advance))
            .is_err());
        rig.station.dispatch(Command::simple(CommandType::Home)).unwrap();
        rig.station
            .dispatch(Command::simple(CommandType::Advance))
            .unwrap();
        rig.station
            .dispatch(Command::new(
                CommandType::ChangePolarization,
                TargetVariable::None,
                0.0,
            ))
            .unwrap();
        assert_eq!(rig.rotator.polarization(), Polarization::Horizontal);
        rig.station.shutdown().unwrap();
    }

    #[test]
    fn autonomous_cycle_visits_every_position() {
        let mut cfg = config();
        cfg.station.autonomous = true;
        cfg.positioner.azimuths_deg = vec![0.0, 180.0];
        let mut rig = rig(cfg);
        for _ in 0..4 {
            rig.station.step().unwrap();
        }
        assert_eq!(observations(&rig.sink), 4);
        // Back at the start after the last position
        assert_eq!(rig.station.positioner().position_index(), Some(0));
        assert_eq!(rig.rotator.azimuth_deg(), 0.0);
        rig.station.shutdown().unwrap();
    }

    #[test]
    fn autonomous_cycle_recalibrates_after_replan() {
        let mut cfg = config();
        cfg.station.autonomous = true;
        let mut rig = rig(cfg);
        let front_ends = |sink: &MemorySink| {
            sink.records()
                .iter()
                .filter(|r| matches!(r, Record::FrontEnd(_)))
                .count()
        };
        rig.station.step().unwrap();
        assert_eq!(front_ends(&rig.sink), 1);
        rig.station.step().unwrap();
        assert_eq!(front_ends(&rig.sink), 1);

        rig.station
            .dispatch(Command::new(
                CommandType::SetVariable,
                TargetVariable::StartFrequency,
                970.0,
            ))
            .unwrap();
        rig.station.step().unwrap();
        assert_eq!(front_ends(&rig.sink), 2);
        assert_eq!(observations(&rig.sink), 3);
        let parameters = rig.station.calibrator().parameters().unwrap();
        assert!(parameters.derived_at.is_some());
        assert!(parameters.covers(970e6, 1020e6));
        rig.station.shutdown().unwrap();
    }

    #[test]
    fn commands_refused_while_shutting_down() {
        let mut rig = rig(config());
        rig.station.signal().request();
        assert!(matches!(
            rig.station.dispatch(Command::simple(CommandType::CaptureSweep)),
            Err(StationError::ShuttingDown)
        ));
        rig.station.shutdown().unwrap();
    }

    #[test]
    fn runs_of_flagged_samples() {
        let spectrum = Spectrum::from_parts(&[1.0, 2.0, 3.0, 4.0, 5.0], &[0.0; 5]).unwrap();
        let record = |f| RfiRecord {
            frequency_hz: f,
            amplitude_dbm: 0.0,
            excess_db: 1.0,
            detected_at: Utc::now(),
        };
        assert_eq!(count_runs(&spectrum, &[record(1.0), record(2.0), record(4.0)]), 2);
        assert_eq!(count_runs(&spectrum, &[]), 0);
    }

    #[test]
    fn shutdown_releases_device_after_streaming_stops() {
        let sim_events;
        {
            let mut rig = rig(config());
            rig.station.capture_observation().unwrap();
            sim_events = rig.station.device().transport().events();
            rig.station.shutdown().unwrap();
        }
        let events = sim_events.lock().unwrap();
        let last_off = events.iter().rposition(|e| *e == SimEvent::StreamOff).unwrap();
        let logout = events.iter().rposition(|e| *e == SimEvent::Logout).unwrap();
        assert!(last_off < logout);
        assert_eq!(events.last(), Some(&SimEvent::Logout));
    }
}
