#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use rfims::{
    config::StationConfig,
    device::DeviceInterface,
    protocol::{ControlClient, ControlServer},
    signal::ShutdownSignal,
    sim::{SimConfig, SimControl, SimEvent, SimulatedRotator, SimulatedSpectran},
    sink::MemorySink,
    time::SystemClock,
    Hardware, Orchestrator, StationError,
};

pub const SAMPLE: &str = include_str!("../../config/station.json");

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// The sample configuration with timeouts short enough for tests
pub fn config() -> StationConfig {
    let mut config = StationConfig::from_json(SAMPLE).unwrap();
    config.device.reply_timeout_ms = 30;
    config.device.reset_attempts = 1;
    config.sweep.point_timeout_ms = 30;
    config.positioner.move_timeout_ms = 500;
    config.positioner.poll_ms = 1;
    config.control.listen = "127.0.0.1:0".to_string();
    config.control.read_timeout_ms = 5;
    config.time.period_ms = 10;
    config.time.join_timeout_ms = 1000;
    config.station.shutdown_grace_ms = 200;
    config.station.shutdown_timeout_ms = 5000;
    config
}

pub struct Running {
    pub addr: SocketAddr,
    pub signal: ShutdownSignal,
    pub sink: MemorySink,
    pub faults: SimControl,
    pub events: Arc<Mutex<Vec<SimEvent>>>,
    pub handle: JoinHandle<Result<(), StationError>>,
}

impl Running {
    pub fn client(&self) -> ControlClient {
        ControlClient::connect(self.addr, Duration::from_secs(5)).unwrap()
    }

    pub fn join(self) -> Result<(), StationError> {
        self.handle.join().unwrap()
    }
}

/// Boot a simulated station and run it on its own thread
pub fn start(config: StationConfig, sim: SimConfig) -> Running {
    let server = ControlServer::bind(
        config.control.listen.as_str(),
        ms(config.control.read_timeout_ms),
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    let analyzer = SimulatedSpectran::new(sim);
    let faults = analyzer.faults();
    let events = analyzer.events();
    let switch = analyzer.noise_source();
    let sink = MemorySink::new();
    let hardware = Hardware {
        device: DeviceInterface::new(
            analyzer,
            ms(config.device.reply_timeout_ms),
            config.device.handshake_rounds,
        ),
        switch: Box::new(switch),
        drive: Box::new(SimulatedRotator::new(ms(1))),
        sink: Box::new(sink.clone()),
        time_source: Box::new(SystemClock::new(config.time.station)),
        control: Some(server),
    };
    let signal = ShutdownSignal::new(config.shutdown_grace());
    let mut station = Orchestrator::new(config, hardware, signal.clone()).unwrap();
    let handle = thread::spawn(move || station.run());
    Running {
        addr,
        signal,
        sink,
        faults,
        events,
        handle,
    }
}
