use std::{fs::File, io::BufReader, process::ExitCode, time::Duration};

use clap::Parser;
use rfims::{
    calibration::OperatorSwitch,
    config::{StationConfig, TimeSourceKind},
    device::{DeviceInterface, TcpTransport, Transport},
    error::{StationError, TimeError},
    positioner::OperatorMount,
    protocol::ControlServer,
    signal::ShutdownSignal,
    sim::{Carrier, SimConfig, SimulatedRotator, SimulatedSpectran},
    sink::LogSink,
    time::{NmeaSource, SystemClock, TimeSource},
    Hardware, Orchestrator,
};
use tracing::{error, info};

mod args;

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn open_time_source(config: &StationConfig) -> Result<Box<dyn TimeSource>, TimeError> {
    Ok(match &config.time.source {
        TimeSourceKind::System => Box::new(SystemClock::new(config.time.station)),
        TimeSourceKind::Nmea { path } => {
            let file = File::open(path)?;
            info!(%path, "Reading time and position from NMEA stream");
            Box::new(NmeaSource::new(BufReader::new(file)))
        }
    })
}

fn build_hardware(
    config: &StationConfig,
    simulate: bool,
) -> Result<Hardware<Box<dyn Transport>>, StationError> {
    let reply_timeout = ms(config.device.reply_timeout_ms);
    let rounds = config.device.handshake_rounds;
    let control = Some(ControlServer::bind(
        config.control.listen.as_str(),
        ms(config.control.read_timeout_ms),
    )?);
    let time_source = open_time_source(config)?;
    if simulate {
        info!("Using simulated analyzer, noise source and rotator");
        let sim = SimulatedSpectran::new(SimConfig {
            carriers: vec![Carrier {
                freq_hz: 1005e6,
                power_dbm: -45.0,
                width_hz: 600e3,
            }],
            ..Default::default()
        });
        let switch = sim.noise_source();
        let transport: Box<dyn Transport> = Box::new(sim);
        return Ok(Hardware {
            device: DeviceInterface::new(transport, reply_timeout, rounds),
            switch: Box::new(switch),
            drive: Box::new(SimulatedRotator::new(ms(500))),
            sink: Box::new(LogSink),
            time_source,
            control,
        });
    }
    let transport: Box<dyn Transport> = Box::new(TcpTransport::connect(
        config.device.address.as_str(),
        ms(config.device.connect_timeout_ms),
    )?);
    let operator = ms(config.station.operator_settle_ms);
    Ok(Hardware {
        device: DeviceInterface::new(transport, reply_timeout, rounds),
        switch: Box::new(OperatorSwitch::new(operator)),
        drive: Box::new(OperatorMount::new(operator)),
        sink: Box::new(LogSink),
        time_source,
        control,
    })
}

fn run(config: StationConfig, simulate: bool, signal: ShutdownSignal) -> Result<(), StationError> {
    let hardware = build_hardware(&config, simulate)?;
    let mut station = Orchestrator::new(config, hardware, signal)?;
    station.run()
}

fn main() -> ExitCode {
    let cli = args::Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args::convert_filter(cli.verbose.log_level_filter()))
        .init();
    info!("Starting RFI monitoring station");

    let mut config = match StationConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(listen) = cli.listen {
        config.control.listen = listen;
    }
    if cli.autonomous {
        config.station.autonomous = true;
    }

    let signal = ShutdownSignal::new(config.shutdown_grace());
    let handler = signal.clone();
    if let Err(e) = ctrlc::set_handler(move || handler.request()) {
        error!(error = %e, "Could not install the termination handler");
        return ExitCode::FAILURE;
    }

    match run(config, cli.simulate, signal) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Station stopped");
            ExitCode::FAILURE
        }
    }
}
