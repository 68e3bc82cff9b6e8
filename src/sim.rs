//! Simulated analyzer, noise source and rotator for `--simulate` runs and tests

use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::trace;

use crate::{
    band::{AntennaType, Attenuator, CableType, DisplayUnit, FixedParameters},
    calibration::{dbm_to_watts, watts_to_dbm, FrontEndSwitch, BOLTZMANN, REF_TEMPERATURE_K},
    device::{
        bandwidth_from_index, bandwidth_index, SpecVariable, SweepPoint, Transport,
        DEVICE_FREQ_RESOLUTION_HZ, VERIFY_REPLY, VERIFY_REQUEST,
    },
    error::DeviceError,
    positioner::{Polarization, PositionerDrive},
};

// Points still on the wire when streaming is switched off
const IN_FLIGHT_POINTS: usize = 2;

/// A continuous-wave signal seen through the antenna
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Carrier {
    pub freq_hz: f64,
    /// Power at the analyzer input
    pub power_dbm: f64,
    pub width_hz: f64,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub gain_db: f64,
    /// Receiver noise temperature
    pub noise_temperature_k: f64,
    pub antenna_temperature_k: f64,
    pub enr_db: f64,
    pub tsoff_k: f64,
    /// Uniform amplitude noise, +/- dB
    pub jitter_db: f64,
    pub seed: u64,
    pub carriers: Vec<Carrier>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            gain_db: 35.0,
            noise_temperature_k: 360.0,
            antenna_temperature_k: 150.0,
            enr_db: 15.0,
            tsoff_k: REF_TEMPERATURE_K,
            jitter_db: 0.05,
            seed: 7,
            carriers: vec![],
        }
    }
}

/// What the simulated analyzer saw, in order
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    Verify,
    Logout,
    Set(SpecVariable, f64),
    SweepReset,
    StreamOn,
    StreamOff,
}

#[derive(Debug, Default)]
struct Shared {
    stalled_sweeps: u32,
    stray_sweeps: u32,
    unreachable: bool,
    point_delay: Duration,
    carriers: Vec<Carrier>,
    noise_source_on: bool,
    routed_to_noise_source: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle for injecting faults and signals while the analyzer is owned elsewhere
#[derive(Debug, Clone)]
pub struct SimControl {
    shared: Arc<Mutex<Shared>>,
}

impl SimControl {
    /// The next `n` sweeps deliver no points
    pub fn drop_points(&self, n: u32) {
        lock(&self.shared).stalled_sweeps += n;
    }

    /// The next `n` sweeps start with a point outside the band
    pub fn stray_points(&self, n: u32) {
        lock(&self.shared).stray_sweeps += n;
    }

    /// Stop answering anything, handshake included
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.shared).unreachable = unreachable;
    }

    /// Time to produce each sweep point
    pub fn set_point_delay(&self, delay: Duration) {
        lock(&self.shared).point_delay = delay;
    }

    pub fn add_carrier(&self, carrier: Carrier) {
        lock(&self.shared).carriers.push(carrier);
    }

    pub fn clear_carriers(&self) {
        lock(&self.shared).carriers.clear();
    }
}

/// Analyzer emulation speaking the binary protocol
pub struct SimulatedSpectran {
    config: SimConfig,
    shared: Arc<Mutex<Shared>>,
    events: Arc<Mutex<Vec<SimEvent>>>,
    registers: HashMap<SpecVariable, f32>,
    output: VecDeque<u8>,
    streaming: bool,
    stalled: bool,
    stray_pending: bool,
    sweep_index: u32,
    timer: u32,
    rng: StdRng,
}

impl SimulatedSpectran {
    pub fn new(config: SimConfig) -> Self {
        let shared = Shared {
            carriers: config.carriers.clone(),
            ..Default::default()
        };
        let registers = HashMap::from([
            (SpecVariable::StartFreq, 1.0),
            (SpecVariable::StopFreq, 100.0),
            (SpecVariable::SweepPoints, 101.0),
            (SpecVariable::ResBandw, f32::from(bandwidth_index(1e6).unwrap_or(2))),
        ]);
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            shared: Arc::new(Mutex::new(shared)),
            events: Arc::new(Mutex::new(Vec::new())),
            registers,
            output: VecDeque::new(),
            streaming: false,
            stalled: false,
            stray_pending: false,
            sweep_index: 0,
            timer: 0,
        }
    }

    pub fn faults(&self) -> SimControl {
        SimControl {
            shared: self.shared.clone(),
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<SimEvent>>> {
        self.events.clone()
    }

    /// Noise source and input switch wired to this analyzer
    pub fn noise_source(&self) -> SimulatedNoiseSource {
        SimulatedNoiseSource {
            shared: self.shared.clone(),
        }
    }

    fn record(&self, event: SimEvent) {
        trace!(?event, "Simulated analyzer");
        lock(&self.events).push(event);
    }

    fn frequency_register(&self, variable: SpecVariable) -> f64 {
        let mhz = self.registers.get(&variable).copied().unwrap_or(0.0);
        (mhz as f64 * 1e6).round()
    }

    fn start_stream(&mut self) {
        let mut shared = lock(&self.shared);
        self.stalled = shared.stalled_sweeps > 0;
        if self.stalled {
            shared.stalled_sweeps -= 1;
        }
        self.stray_pending = shared.stray_sweeps > 0;
        if self.stray_pending {
            shared.stray_sweeps -= 1;
        }
        drop(shared);
        self.streaming = true;
        self.record(SimEvent::StreamOn);
    }

    fn stop_stream(&mut self) {
        if self.streaming && !self.stalled {
            for _ in 0..IN_FLIGHT_POINTS {
                let point = self.next_point();
                self.output.extend(point.to_bytes());
            }
        }
        self.streaming = false;
        self.stalled = false;
        self.record(SimEvent::StreamOff);
    }

    fn next_point(&mut self) -> SweepPoint {
        let start = self.frequency_register(SpecVariable::StartFreq);
        let stop = self.frequency_register(SpecVariable::StopFreq);
        let points = self
            .registers
            .get(&SpecVariable::SweepPoints)
            .map_or(2, |p| (p.round() as u32).max(2));
        let freq = if self.stray_pending {
            self.stray_pending = false;
            stop + 10e6
        } else {
            let i = self.sweep_index % points;
            self.sweep_index += 1;
            start + (stop - start) * i as f64 / (points - 1) as f64
        };
        let amplitude = self.amplitude_at(freq);
        self.timer = self.timer.wrapping_add(1);
        let units = (freq / DEVICE_FREQ_RESOLUTION_HZ as f64).round() as u64;
        SweepPoint {
            timer: self.timer,
            frequency_hz: units * DEVICE_FREQ_RESOLUTION_HZ,
            min_dbm: (amplitude - 0.5) as f32,
            max_dbm: amplitude as f32,
        }
    }

    fn amplitude_at(&mut self, freq_hz: f64) -> f64 {
        let rbw = self
            .registers
            .get(&SpecVariable::ResBandw)
            .and_then(|i| bandwidth_from_index(i.round() as u8))
            .unwrap_or(1e6);
        let shared = lock(&self.shared);
        let source_k = if shared.routed_to_noise_source {
            if shared.noise_source_on {
                REF_TEMPERATURE_K * 10f64.powf(self.config.enr_db / 10.0) + self.config.tsoff_k
            } else {
                self.config.tsoff_k
            }
        } else {
            self.config.antenna_temperature_k
        };
        let gain = 10f64.powf(self.config.gain_db / 10.0);
        let mut power_w = BOLTZMANN * rbw * (source_k + self.config.noise_temperature_k) * gain;
        if !shared.routed_to_noise_source {
            power_w += shared
                .carriers
                .iter()
                .filter(|c| (freq_hz - c.freq_hz).abs() <= c.width_hz / 2.0)
                .map(|c| dbm_to_watts(c.power_dbm))
                .sum::<f64>();
        }
        drop(shared);
        let jitter = if self.config.jitter_db > 0.0 {
            self.rng
                .gen_range(-self.config.jitter_db..=self.config.jitter_db)
        } else {
            0.0
        };
        watts_to_dbm(power_w) + jitter
    }

    fn handle_set(&mut self, id: u8, raw: f32) {
        let variable = match SpecVariable::try_from(id) {
            Ok(v) => v,
            Err(_) => {
                self.output.extend([0x21, 0x01]);
                return;
            }
        };
        match variable {
            SpecVariable::UsbMeas if raw != 0.0 => {
                self.start_stream();
            }
            SpecVariable::UsbMeas => self.stop_stream(),
            SpecVariable::UsbSweepReset => {
                self.sweep_index = 0;
                self.record(SimEvent::SweepReset);
            }
            _ => {
                self.registers.insert(variable, raw);
                let value = variable.decode_value(raw).unwrap_or(raw as f64);
                self.record(SimEvent::Set(variable, value));
            }
        }
        self.output.extend([0x21, 0x00]);
    }

    fn handle_get(&mut self, id: u8) {
        match SpecVariable::try_from(id) {
            Ok(variable) => {
                let raw = self.registers.get(&variable).copied().unwrap_or(0.0);
                self.output.extend([0x20, 0x00]);
                self.output.extend(raw.to_le_bytes());
            }
            Err(_) => self.output.extend([0x20, 0x01, 0, 0, 0, 0]),
        }
    }
}

impl Transport for SimulatedSpectran {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        if lock(&self.shared).unreachable {
            return Ok(());
        }
        match bytes {
            b if b == VERIFY_REQUEST => {
                self.output.extend(VERIFY_REPLY);
                self.record(SimEvent::Verify);
            }
            [0x02] => {
                self.streaming = false;
                self.stalled = false;
                self.record(SimEvent::Logout);
            }
            [0x20, id, 0x00] => self.handle_get(*id),
            [0x21, id, 0x00, a, b, c, d] => self.handle_set(*id, f32::from_le_bytes([*a, *b, *c, *d])),
            other => trace!(?other, "Simulated analyzer ignored bytes"),
        }
        Ok(())
    }

    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), DeviceError> {
        let delay = lock(&self.shared).point_delay;
        while self.output.len() < buf.len() && self.streaming && !self.stalled {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            let point = self.next_point();
            self.output.extend(point.to_bytes());
        }
        if self.output.len() < buf.len() {
            thread::sleep(timeout);
            return Err(DeviceError::Timeout {
                waited: timeout,
                expected: buf.len(),
                received: self.output.len(),
            });
        }
        let n = buf.len();
        for (dst, src) in buf.iter_mut().zip(self.output.drain(..n)) {
            *dst = src;
        }
        Ok(())
    }

    fn purge(&mut self) -> Result<usize, DeviceError> {
        let n = self.output.len();
        self.output.clear();
        Ok(n)
    }
}

/// Front-end switch of the simulated analyzer
#[derive(Debug, Clone)]
pub struct SimulatedNoiseSource {
    shared: Arc<Mutex<Shared>>,
}

impl SimulatedNoiseSource {
    pub fn is_on(&self) -> bool {
        lock(&self.shared).noise_source_on
    }

    pub fn is_routed(&self) -> bool {
        lock(&self.shared).routed_to_noise_source
    }
}

impl FrontEndSwitch for SimulatedNoiseSource {
    fn route_to_noise_source(&mut self, noise_source: bool) -> io::Result<()> {
        lock(&self.shared).routed_to_noise_source = noise_source;
        Ok(())
    }

    fn set_noise_source(&mut self, on: bool) -> io::Result<()> {
        lock(&self.shared).noise_source_on = on;
        Ok(())
    }
}

#[derive(Debug)]
struct RotatorState {
    azimuth_deg: f64,
    polarization: Polarization,
    target: Option<(f64, Polarization)>,
    settles_at: Instant,
    stalled: bool,
    moves: usize,
}

/// Rotator that takes a fixed time per move, and can be made to stall
#[derive(Debug, Clone)]
pub struct SimulatedRotator {
    move_time: Duration,
    state: Arc<Mutex<RotatorState>>,
}

impl SimulatedRotator {
    pub fn new(move_time: Duration) -> Self {
        Self {
            move_time,
            state: Arc::new(Mutex::new(RotatorState {
                azimuth_deg: 0.0,
                polarization: Polarization::Horizontal,
                target: None,
                settles_at: Instant::now(),
                stalled: false,
                moves: 0,
            })),
        }
    }

    pub fn set_stalled(&self, stalled: bool) {
        lock(&self.state).stalled = stalled;
    }

    pub fn azimuth_deg(&self) -> f64 {
        lock(&self.state).azimuth_deg
    }

    pub fn polarization(&self) -> Polarization {
        lock(&self.state).polarization
    }

    pub fn moves(&self) -> usize {
        lock(&self.state).moves
    }

    fn start(&self, azimuth_deg: Option<f64>, polarization: Option<Polarization>) {
        let mut state = lock(&self.state);
        let target = (
            azimuth_deg.unwrap_or(state.azimuth_deg),
            polarization.unwrap_or(state.polarization),
        );
        state.target = Some(target);
        state.settles_at = Instant::now() + self.move_time;
        state.moves += 1;
    }
}

impl PositionerDrive for SimulatedRotator {
    fn start_azimuth_move(&mut self, azimuth_deg: f64) -> io::Result<()> {
        self.start(Some(azimuth_deg), None);
        Ok(())
    }

    fn start_polarization_change(&mut self, polarization: Polarization) -> io::Result<()> {
        self.start(None, Some(polarization));
        Ok(())
    }

    fn start_homing(&mut self, azimuth_deg: f64, polarization: Polarization) -> io::Result<()> {
        self.start(Some(azimuth_deg), Some(polarization));
        Ok(())
    }

    fn is_settled(&mut self) -> io::Result<bool> {
        let mut state = lock(&self.state);
        if state.stalled {
            return Ok(false);
        }
        if Instant::now() < state.settles_at {
            return Ok(false);
        }
        if let Some((azimuth_deg, polarization)) = state.target.take() {
            state.azimuth_deg = azimuth_deg;
            state.polarization = polarization;
        }
        Ok(true)
    }
}

/// Fixed analyzer settings suited to the simulator
pub fn fixed_parameters() -> FixedParameters {
    FixedParameters {
        attenuator: Attenuator::Auto,
        display_unit: DisplayUnit::Dbm,
        antenna_type: AntennaType::Hl7025,
        cable_type: CableType::None,
        preamp: false,
        sweep_delay_accuracy: false,
        speaker_volume: 0.0,
    }
}
