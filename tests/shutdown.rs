mod common;

use std::{
    thread,
    time::{Duration, Instant},
};

use common::{config, ms, start};
use rfims::{
    protocol::{Command, CommandType, Status},
    sim::{SimConfig, SimEvent},
    StationError,
};

/// The analyzer must be idle when the session is closed, and nothing may touch
/// it afterwards
fn assert_clean_teardown(events: &[SimEvent]) {
    let logout = events
        .iter()
        .rposition(|e| *e == SimEvent::Logout)
        .expect("no logout");
    let mut streaming = false;
    for event in &events[..logout] {
        match event {
            SimEvent::StreamOn => streaming = true,
            SimEvent::StreamOff => streaming = false,
            _ => {}
        }
    }
    assert!(!streaming, "logout while streaming: {events:?}");
    assert_eq!(logout, events.len() - 1, "activity after logout: {events:?}");
}

#[test]
fn shutdown_command_releases_analyzer_last() {
    let station = start(config(), SimConfig::default());
    let mut client = station.client();
    assert_eq!(
        client.call(&Command::simple(CommandType::CaptureSweep)).unwrap(),
        Status::Ok
    );
    assert_eq!(
        client.call(&Command::simple(CommandType::Shutdown)).unwrap(),
        Status::Ok
    );
    let events = station.events.clone();
    station.join().unwrap();
    assert_clean_teardown(&events.lock().unwrap());
}

#[test]
fn termination_stops_capture_at_band_boundary() {
    let station = start(config(), SimConfig::default());
    station.faults.set_point_delay(ms(5));
    let mut client = station.client();
    client
        .send(&Command::simple(CommandType::CaptureSweep))
        .unwrap();
    thread::sleep(ms(100));
    station.signal.request();

    let reply = client.read_sweep_reply().unwrap();
    assert_eq!(reply.status, Status::ShuttingDown);
    assert!(reply.samples.is_empty());

    let events = station.events.clone();
    let sink = station.sink.clone();
    station.join().unwrap();
    assert!(sink.is_empty());
    let events = events.lock().unwrap();
    assert_clean_teardown(&events);
    // The first band finished, the remaining two never started
    let sweeps = events.iter().filter(|e| **e == SimEvent::StreamOn).count();
    assert_eq!(sweeps, 1);
}

#[test]
fn forced_termination_abandons_band() {
    let station = start(config(), SimConfig::default());
    station.faults.set_point_delay(ms(50));
    let mut client = station.client();
    client
        .send(&Command::simple(CommandType::CaptureSweep))
        .unwrap();
    thread::sleep(ms(100));
    let requested = Instant::now();
    station.signal.request();

    assert_eq!(client.read_sweep_reply().unwrap().status, Status::ShuttingDown);
    let events = station.events.clone();
    station.join().unwrap();
    // Finishing the band would have taken two seconds
    assert!(requested.elapsed() < Duration::from_millis(1500));
    assert_clean_teardown(&events.lock().unwrap());
}

#[test]
fn slow_teardown_is_reported() {
    let mut cfg = config();
    cfg.station.shutdown_grace_ms = 0;
    cfg.station.shutdown_timeout_ms = 1;
    let station = start(cfg, SimConfig::default());
    station.faults.set_point_delay(ms(50));
    let mut client = station.client();
    client
        .send(&Command::simple(CommandType::CaptureSweep))
        .unwrap();
    thread::sleep(ms(100));
    station.signal.request();
    let result = station.join();
    assert!(matches!(result, Err(StationError::ShutdownTimeout(_))));
}

#[test]
fn idle_station_stops_on_request() {
    let station = start(config(), SimConfig::default());
    thread::sleep(ms(50));
    station.signal.request();
    let events = station.events.clone();
    station.join().unwrap();
    let events = events.lock().unwrap();
    assert_eq!(events.first(), Some(&SimEvent::Verify));
    assert_clean_teardown(&events);
}
