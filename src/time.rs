//! Timestamp and geolocation stream running on its own thread

use std::{
    io::BufRead,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use hifitime::Epoch;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::TimeError;

// Longest the producer sleeps before rechecking its stop flag
const STOP_POLL: Duration = Duration::from_millis(20);

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GeoPosition {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    #[serde(default)]
    pub altitude_m: Option<f64>,
    #[serde(default)]
    pub satellites: Option<u32>,
}

/// Orientation reported by the GPS unit's sensors, in degrees
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Attitude {
    /// Heading, clockwise from north
    pub yaw_deg: Option<f64>,
    pub pitch_deg: Option<f64>,
    pub roll_deg: Option<f64>,
}

impl Attitude {
    /// Yaw from the horizontal magnetometer components, in [0, 360)
    pub fn yaw_from_compass(x: f64, y: f64) -> f64 {
        let yaw = y.atan2(x).to_degrees() + 180.0;
        if yaw >= 360.0 {
            yaw - 360.0
        } else {
            yaw
        }
    }

    /// Pitch and roll from the gravity vector
    pub fn pitch_roll_from_gravity(x: f64, y: f64, z: f64) -> (f64, f64) {
        let pitch = -y.atan2((x * x + z * z).sqrt()).to_degrees();
        let sign = if z < 0.0 { -1.0 } else { 1.0 };
        let roll = (-x).atan2(sign * (y * y + z * z).sqrt()).to_degrees();
        (pitch, roll)
    }
}

/// Altitude from barometric pressure, standard lapse rate over a 295 K reference
pub fn pressure_altitude_m(pressure_hpa: f64) -> f64 {
    const SEA_LEVEL_HPA: f64 = 1013.25;
    const LAPSE_K_PER_M: f64 = -6.5e-3;
    const GAS_CONSTANT: f64 = 287.053;
    const GRAVITY: f64 = 9.8;
    const REFERENCE_K: f64 = 295.0;
    let exponent = -(LAPSE_K_PER_M * GAS_CONSTANT) / GRAVITY;
    ((pressure_hpa / SEA_LEVEL_HPA).powf(exponent) - 1.0) * REFERENCE_K / LAPSE_K_PER_M
}

/// One snapshot of station time and place
#[derive(Debug, Clone, PartialEq)]
pub struct TimeData {
    utc: DateTime<Utc>,
    mjd: f64,
    position: Option<GeoPosition>,
    attitude: Attitude,
    pressure_hpa: Option<f64>,
}

impl TimeData {
    pub fn new(utc: DateTime<Utc>, position: Option<GeoPosition>) -> Self {
        Self {
            mjd: mjd(&utc),
            utc,
            position,
            attitude: Attitude::default(),
            pressure_hpa: None,
        }
    }

    pub fn with_sensors(mut self, attitude: Attitude, pressure_hpa: Option<f64>) -> Self {
        self.attitude = attitude;
        self.pressure_hpa = pressure_hpa;
        self
    }

    pub fn now(position: Option<GeoPosition>) -> Self {
        Self::new(Utc::now(), position)
    }

    pub fn utc(&self) -> DateTime<Utc> {
        self.utc
    }

    /// Modified Julian Date, UTC
    pub fn mjd(&self) -> f64 {
        self.mjd
    }

    pub fn position(&self) -> Option<&GeoPosition> {
        self.position.as_ref()
    }

    pub fn attitude(&self) -> &Attitude {
        &self.attitude
    }

    pub fn pressure_hpa(&self) -> Option<f64> {
        self.pressure_hpa
    }

    pub fn pressure_altitude_m(&self) -> Option<f64> {
        self.pressure_hpa.map(pressure_altitude_m)
    }

    pub fn date(&self) -> String {
        self.utc.format("%Y-%m-%d").to_string()
    }

    pub fn time(&self) -> String {
        self.utc.format("%H:%M:%S").to_string()
    }

    pub fn timestamp(&self) -> String {
        self.utc.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }
}

fn mjd(time: &DateTime<Utc>) -> f64 {
    Epoch::from_gregorian_utc(
        time.year(),
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
        time.nanosecond().min(999_999_999),
    )
    .to_mjd_utc_days()
}

/// Anything that can produce a time fix, blocking until one is ready
pub trait TimeSource: Send {
    fn next_fix(&mut self) -> Result<TimeData, TimeError>;
}

impl<S: TimeSource + ?Sized> TimeSource for Box<S> {
    fn next_fix(&mut self) -> Result<TimeData, TimeError> {
        (**self).next_fix()
    }
}

/// Host clock plus fixed station coordinates
pub struct SystemClock {
    position: Option<GeoPosition>,
}

impl SystemClock {
    pub fn new(position: Option<GeoPosition>) -> Self {
        Self { position }
    }
}

impl TimeSource for SystemClock {
    fn next_fix(&mut self) -> Result<TimeData, TimeError> {
        Ok(TimeData::now(self.position))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NmeaSentence {
    /// Recommended minimum data, only kept when the fix is valid
    Rmc {
        utc: DateTime<Utc>,
        latitude_deg: f64,
        longitude_deg: f64,
    },
    /// Fix data
    Gga { satellites: u32, altitude_m: f64 },
    /// True heading from any talker
    Hdt { heading_deg: f64 },
    /// `$PAAG,DATA,C` magnetometer, Gauss
    Compass { x: f64, y: f64, z: f64 },
    /// `$PAAG,DATA,T` accelerometer, g
    Accelerometer { x: f64, y: f64, z: f64 },
    /// `$PAAG,DATA,B` barometer
    Barometer { pressure_hpa: f64 },
    Other(String),
}

/// XOR of every byte between `$` and `*`
pub fn nmea_checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

pub fn parse_sentence(line: &str) -> Result<NmeaSentence, TimeError> {
    let line = line.trim();
    let bad = |reason: &str| TimeError::Nmea {
        sentence: line.to_string(),
        reason: reason.to_string(),
    };
    let rest = line.strip_prefix('$').ok_or_else(|| bad("missing '$'"))?;
    let (body, sum) = rest.split_once('*').ok_or_else(|| bad("missing checksum"))?;
    let expected = u8::from_str_radix(sum, 16).map_err(|_| bad("checksum is not hex"))?;
    let computed = nmea_checksum(body);
    if expected != computed {
        return Err(TimeError::Checksum { expected, computed });
    }

    let fields: Vec<&str> = body.split(',').collect();
    match fields[0] {
        "GPRMC" => {
            if fields.len() < 10 {
                return Err(bad("GPRMC needs 10 fields"));
            }
            if !fields[2].eq_ignore_ascii_case("A") {
                return Err(bad("fix not valid"));
            }
            let time = parse_time(fields[1]).ok_or_else(|| bad("bad time"))?;
            let date = parse_date(fields[9]).ok_or_else(|| bad("bad date"))?;
            let latitude_deg =
                parse_coordinate(fields[3], fields[4], 2).ok_or_else(|| bad("bad latitude"))?;
            let longitude_deg =
                parse_coordinate(fields[5], fields[6], 3).ok_or_else(|| bad("bad longitude"))?;
            Ok(NmeaSentence::Rmc {
                utc: Utc.from_utc_datetime(&date.and_time(time)),
                latitude_deg,
                longitude_deg,
            })
        }
        "GPGGA" => {
            if fields.len() < 10 {
                return Err(bad("GPGGA needs 10 fields"));
            }
            let satellites = fields[7].parse().map_err(|_| bad("bad satellite count"))?;
            let altitude_m = fields[9].parse().map_err(|_| bad("bad altitude"))?;
            Ok(NmeaSentence::Gga {
                satellites,
                altitude_m,
            })
        }
        "PAAG" if fields.get(1) == Some(&"DATA") => parse_sensor(&fields).map_err(bad),
        talker if talker.len() == 5 && talker.ends_with("HDT") => {
            let heading_deg: f64 = fields
                .get(1)
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| bad("bad heading"))?;
            if !(0.0..360.0).contains(&heading_deg) {
                return Err(bad("heading out of range"));
            }
            Ok(NmeaSentence::Hdt { heading_deg })
        }
        other => Ok(NmeaSentence::Other(other.to_string())),
    }
}

const COMPASS_COUNTS_PER_GAUSS: f64 = 1090.0;
const ACCEL_COUNTS_PER_G: f64 = 8192.0;

/// `$PAAG,DATA,<sensor>,<sequence>,<values...>,<status>`
fn parse_sensor(fields: &[&str]) -> Result<NmeaSentence, &'static str> {
    let status = fields.last().copied().unwrap_or_default();
    if !status.eq_ignore_ascii_case("A") {
        return Err("sensor data not valid");
    }
    let values = fields.get(4..fields.len() - 1).ok_or("too few fields")?;
    let value = |i: usize| -> Result<f64, &'static str> {
        values
            .get(i)
            .and_then(|v| v.trim().parse().ok())
            .ok_or("bad sensor value")
    };
    match fields.get(2).copied() {
        Some("C") => Ok(NmeaSentence::Compass {
            x: value(0)? / COMPASS_COUNTS_PER_GAUSS,
            y: value(1)? / COMPASS_COUNTS_PER_GAUSS,
            z: value(2)? / COMPASS_COUNTS_PER_GAUSS,
        }),
        Some("T") => Ok(NmeaSentence::Accelerometer {
            x: value(0)? / ACCEL_COUNTS_PER_G,
            y: value(1)? / ACCEL_COUNTS_PER_G,
            z: value(2)? / ACCEL_COUNTS_PER_G,
        }),
        Some("B") => Ok(NmeaSentence::Barometer {
            pressure_hpa: value(0)?,
        }),
        _ => Ok(NmeaSentence::Other(fields[..3.min(fields.len())].join(","))),
    }
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    let h = s.get(0..2)?.parse().ok()?;
    let m = s.get(2..4)?.parse().ok()?;
    let secs: f64 = s.get(4..)?.parse().ok()?;
    let milli = ((secs.fract() * 1000.0).round() as u32).min(999);
    NaiveTime::from_hms_milli_opt(h, m, secs.trunc() as u32, milli)
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let d = s.get(0..2)?.parse().ok()?;
    let m = s.get(2..4)?.parse().ok()?;
    let yy: i32 = s.get(4..6)?.parse().ok()?;
    let year = if yy >= 80 { 1900 + yy } else { 2000 + yy };
    NaiveDate::from_ymd_opt(year, m, d)
}

/// `dddmm.mmmm` plus hemisphere into signed decimal degrees
fn parse_coordinate(value: &str, hemisphere: &str, degree_digits: usize) -> Option<f64> {
    let degrees: f64 = value.get(..degree_digits)?.parse().ok()?;
    let minutes: f64 = value.get(degree_digits..)?.parse().ok()?;
    let magnitude = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Some(magnitude),
        "S" | "W" => Some(-magnitude),
        _ => None,
    }
}

/// GPS receiver emitting NMEA sentences one per line
pub struct NmeaSource<R> {
    reader: R,
    satellites: Option<u32>,
    altitude_m: Option<f64>,
    attitude: Attitude,
    pressure_hpa: Option<f64>,
    line: String,
}

impl<R: BufRead + Send> NmeaSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            satellites: None,
            altitude_m: None,
            attitude: Attitude::default(),
            pressure_hpa: None,
            line: String::new(),
        }
    }
}

impl<R: BufRead + Send> TimeSource for NmeaSource<R> {
    /// Reads until the next valid `$GPRMC`, folding in the latest fix data,
    /// heading and sensor readings
    fn next_fix(&mut self) -> Result<TimeData, TimeError> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Err(TimeError::Exhausted);
            }
            if self.line.trim().is_empty() {
                continue;
            }
            match parse_sentence(&self.line) {
                Ok(NmeaSentence::Rmc {
                    utc,
                    latitude_deg,
                    longitude_deg,
                }) => {
                    let position = GeoPosition {
                        latitude_deg,
                        longitude_deg,
                        altitude_m: self.altitude_m,
                        satellites: self.satellites,
                    };
                    return Ok(TimeData::new(utc, Some(position))
                        .with_sensors(self.attitude, self.pressure_hpa));
                }
                Ok(NmeaSentence::Gga {
                    satellites,
                    altitude_m,
                }) => {
                    self.satellites = Some(satellites);
                    self.altitude_m = Some(altitude_m);
                }
                Ok(NmeaSentence::Hdt { heading_deg }) => self.attitude.yaw_deg = Some(heading_deg),
                Ok(NmeaSentence::Compass { x, y, .. }) => {
                    self.attitude.yaw_deg = Some(Attitude::yaw_from_compass(x, y));
                }
                Ok(NmeaSentence::Accelerometer { x, y, z }) => {
                    let (pitch, roll) = Attitude::pitch_roll_from_gravity(x, y, z);
                    self.attitude.pitch_deg = Some(pitch);
                    self.attitude.roll_deg = Some(roll);
                }
                Ok(NmeaSentence::Barometer { pressure_hpa }) => {
                    self.pressure_hpa = Some(pressure_hpa);
                }
                Ok(NmeaSentence::Other(_)) => {}
                Err(e) => debug!(error = %e, "Skipping NMEA sentence"),
            }
        }
    }
}

/// Handle on the producer thread
pub struct TimeStream {
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

/// Reader side, pulls the newest snapshot without blocking
pub struct TimeFeed {
    receiver: Receiver<TimeData>,
    last: Option<TimeData>,
    fallback: Option<GeoPosition>,
}

/// Start producing fixes from `source` every `period` on a background thread
pub fn spawn<S: TimeSource + 'static>(
    mut source: S,
    period: Duration,
    capacity: usize,
    fallback: Option<GeoPosition>,
) -> Result<(TimeStream, TimeFeed), TimeError> {
    let (sender, receiver) = bounded(capacity.max(1));
    let (done_tx, done) = bounded(1);
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();
    let drain = receiver.clone();
    let handle = thread::Builder::new()
        .name("time-source".to_string())
        .spawn(move || {
            produce(&mut source, &sender, &drain, &thread_stop, period);
            let _ = done_tx.send(());
        })?;
    info!(?period, "Time source started");
    Ok((
        TimeStream {
            stop,
            done,
            handle: Some(handle),
        },
        TimeFeed {
            receiver,
            last: None,
            fallback,
        },
    ))
}

fn produce<S: TimeSource>(
    source: &mut S,
    sender: &Sender<TimeData>,
    drain: &Receiver<TimeData>,
    stop: &AtomicBool,
    period: Duration,
) {
    while !stop.load(Ordering::Acquire) {
        match source.next_fix() {
            Ok(fix) => {
                if let Err(TrySendError::Full(fix)) = sender.try_send(fix) {
                    // Make room by dropping the oldest snapshot
                    let _ = drain.try_recv();
                    let _ = sender.try_send(fix);
                }
            }
            Err(TimeError::Exhausted) => {
                info!("Time source exhausted");
                break;
            }
            Err(e) => warn!(error = %e, "Time source failed"),
        }
        let wake = Instant::now() + period;
        while !stop.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= wake {
                break;
            }
            thread::sleep((wake - now).min(STOP_POLL));
        }
    }
}

impl TimeStream {
    /// Ask the producer to stop and wait for it to exit
    pub fn stop_and_join(mut self, timeout: Duration) -> Result<(), TimeError> {
        self.stop.store(true, Ordering::Release);
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        warn!("Time source thread panicked");
                    }
                }
                info!("Time source stopped");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Err(TimeError::JoinTimeout(timeout)),
        }
    }
}

impl Drop for TimeStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl TimeFeed {
    /// Newest snapshot. Falls back to the host clock until the first fix arrives.
    pub fn latest(&mut self) -> TimeData {
        while let Ok(fix) = self.receiver.try_recv() {
            self.last = Some(fix);
        }
        match &self.last {
            Some(fix) => fix.clone(),
            None => TimeData::now(self.fallback),
        }
    }

    pub fn last_fix(&self) -> Option<&TimeData> {
        self.last.as_ref()
    }
}
