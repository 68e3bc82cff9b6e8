mod common;

use common::{config, start};
use rfims::{
    protocol::{Command, CommandType, Status, TargetVariable},
    sim::{Carrier, SimConfig},
    sink::Record,
    StationError,
};

fn set(variable: TargetVariable, value: f32) -> Command {
    Command::new(CommandType::SetVariable, variable, value)
}

#[test]
fn capture_sweep_returns_stitched_spectrum() {
    let station = start(config(), SimConfig::default());
    let mut client = station.client();
    client
        .send(&Command::simple(CommandType::CaptureSweep))
        .unwrap();
    let reply = client.read_sweep_reply().unwrap();
    assert_eq!(reply.status, Status::Ok);
    let first = reply.samples.first().unwrap().0;
    let last = reply.samples.last().unwrap().0;
    assert_eq!(first, 980e6);
    assert_eq!(last, 1020e6);
    assert!(reply.samples.windows(2).all(|w| w[0].0 < w[1].0));

    assert_eq!(client.call(&Command::simple(CommandType::Shutdown)).unwrap(), Status::Ok);
    station.join().unwrap();
}

#[test]
fn remote_settings_are_validated() {
    let station = start(config(), SimConfig::default());
    let mut client = station.client();
    assert_eq!(
        client.call(&set(TargetVariable::StartFrequency, 990.0)).unwrap(),
        Status::Ok
    );
    assert_eq!(
        client.call(&set(TargetVariable::Rbw, 123.0)).unwrap(),
        Status::InvalidArgument
    );
    assert_eq!(
        client.call(&set(TargetVariable::None, 1.0)).unwrap(),
        Status::InvalidArgument
    );
    assert_eq!(
        client.call(&set(TargetVariable::RfiThreshold, -3.0)).unwrap(),
        Status::InvalidArgument
    );

    client
        .send(&Command::simple(CommandType::CaptureSweep))
        .unwrap();
    let reply = client.read_sweep_reply().unwrap();
    assert_eq!(reply.status, Status::Ok);
    assert_eq!(reply.samples[0].0, 990e6);

    client.call(&Command::simple(CommandType::Shutdown)).unwrap();
    station.join().unwrap();
}

#[test]
fn malformed_command_keeps_connection() {
    let station = start(config(), SimConfig::default());
    let mut client = station.client();
    client.send_raw(&[0x63, 0, 0, 0, 0, 0]).unwrap();
    assert_eq!(client.read_reply().unwrap().status, Status::InvalidCommand);
    assert_eq!(client.call(&Command::simple(CommandType::Home)).unwrap(), Status::Ok);
    assert_eq!(
        client.call(&Command::simple(CommandType::Advance)).unwrap(),
        Status::Ok
    );
    client.call(&Command::simple(CommandType::Shutdown)).unwrap();
    station.join().unwrap();
}

#[test]
fn advance_needs_known_position() {
    let station = start(config(), SimConfig::default());
    let mut client = station.client();
    assert_eq!(
        client.call(&Command::simple(CommandType::Advance)).unwrap(),
        Status::PositionFailed
    );
    client.call(&Command::simple(CommandType::Shutdown)).unwrap();
    station.join().unwrap();
}

#[test]
fn stalled_analyzer_is_reset_and_recovers() {
    let station = start(config(), SimConfig::default());
    let mut client = station.client();
    station.faults.drop_points(3);
    client
        .send(&Command::simple(CommandType::CaptureSweep))
        .unwrap();
    let failed = client.read_sweep_reply().unwrap();
    assert_eq!(failed.status, Status::CaptureFailed);
    assert!(failed.samples.is_empty());

    client
        .send(&Command::simple(CommandType::CaptureSweep))
        .unwrap();
    assert_eq!(client.read_sweep_reply().unwrap().status, Status::Ok);
    client.call(&Command::simple(CommandType::Shutdown)).unwrap();
    station.join().unwrap();
}

#[test]
fn unreachable_analyzer_stops_station() {
    let station = start(config(), SimConfig::default());
    let mut client = station.client();
    station.faults.set_unreachable(true);
    client
        .send(&Command::simple(CommandType::CaptureSweep))
        .unwrap();
    assert_eq!(client.read_sweep_reply().unwrap().status, Status::CaptureFailed);
    let result = station.join();
    assert!(matches!(result, Err(StationError::DeviceUnreachable(_))));
}

#[test]
fn calibration_then_interference_report() {
    let mut cfg = config();
    cfg.rfi.window = 3;
    cfg.rfi.consecutive = 1;
    let station = start(cfg, SimConfig::default());
    let mut client = station.client();
    assert_eq!(
        client.call(&Command::simple(CommandType::Calibrate)).unwrap(),
        Status::Ok
    );
    for _ in 0..3 {
        assert_eq!(
            client.call(&Command::simple(CommandType::CaptureSweep)).unwrap(),
            Status::Ok
        );
    }
    station.faults.add_carrier(Carrier {
        freq_hz: 990e6,
        power_dbm: -30.0,
        width_hz: 2e6,
    });
    assert_eq!(
        client.call(&Command::simple(CommandType::CaptureSweep)).unwrap(),
        Status::Ok
    );
    client.call(&Command::simple(CommandType::Shutdown)).unwrap();
    let sink = station.sink.clone();
    station.join().unwrap();

    let records = sink.records();
    assert!(records.iter().any(|r| matches!(
        r,
        Record::FrontEnd(p) if p.derived_at.is_some()
    )));
    let report = records
        .iter()
        .find_map(|r| match r {
            Record::Rfi(report) if report.norm.is_none() => Some(report),
            _ => None,
        })
        .unwrap();
    assert_eq!(report.bands, 1);
    assert!(report.records.iter().any(|r| r.frequency_hz == 990e6));
    assert!(report.polarization.is_none());
}

#[test]
fn widening_the_plan_after_calibration_keeps_capturing() {
    let station = start(config(), SimConfig::default());
    let mut client = station.client();
    assert_eq!(
        client.call(&Command::simple(CommandType::Calibrate)).unwrap(),
        Status::Ok
    );
    assert_eq!(
        client.call(&set(TargetVariable::StartFrequency, 970.0)).unwrap(),
        Status::Ok
    );
    client
        .send(&Command::simple(CommandType::CaptureSweep))
        .unwrap();
    let reply = client.read_sweep_reply().unwrap();
    assert_eq!(reply.status, Status::Ok);
    assert_eq!(reply.samples[0].0, 970e6);

    // A fresh calibration covers the new edge
    assert_eq!(
        client.call(&Command::simple(CommandType::Calibrate)).unwrap(),
        Status::Ok
    );
    assert_eq!(
        client.call(&Command::simple(CommandType::CaptureSweep)).unwrap(),
        Status::Ok
    );
    client.call(&Command::simple(CommandType::Shutdown)).unwrap();
    let sink = station.sink.clone();
    station.join().unwrap();

    let derived: Vec<_> = sink
        .records()
        .into_iter()
        .filter_map(|r| match r {
            Record::FrontEnd(p) if p.derived_at.is_some() => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(derived.len(), 2);
    assert!(derived[1].covers(970e6, 1020e6));
}

#[test]
fn oversized_detector_settings_are_refused() {
    let station = start(config(), SimConfig::default());
    let mut client = station.client();
    for command in [
        set(TargetVariable::RfiWindow, 4e18),
        set(TargetVariable::RfiConsecutive, 4e18),
        set(TargetVariable::RfiWindow, 1e6),
        set(TargetVariable::RfiWindow, 2.5),
    ] {
        assert_eq!(client.call(&command).unwrap(), Status::InvalidArgument);
    }
    // Still serving
    assert_eq!(
        client.call(&set(TargetVariable::RfiWindow, 8.0)).unwrap(),
        Status::Ok
    );
    assert_eq!(
        client.call(&Command::simple(CommandType::CaptureSweep)).unwrap(),
        Status::Ok
    );
    client.call(&Command::simple(CommandType::Shutdown)).unwrap();
    station.join().unwrap();
}

#[test]
fn unknown_polarization_code_is_refused() {
    let station = start(config(), SimConfig::default());
    let mut client = station.client();
    assert_eq!(client.call(&Command::simple(CommandType::Home)).unwrap(), Status::Ok);
    let change = |value| Command::new(CommandType::ChangePolarization, TargetVariable::None, value);
    assert_eq!(client.call(&change(0.5)).unwrap(), Status::InvalidArgument);
    assert_eq!(client.call(&change(f32::NAN)).unwrap(), Status::InvalidArgument);
    assert_eq!(client.call(&change(1.0)).unwrap(), Status::Ok);
    client.call(&Command::simple(CommandType::Shutdown)).unwrap();
    station.join().unwrap();
}
