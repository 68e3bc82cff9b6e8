//! Destinations for measurement records

use std::sync::{Arc, Mutex};

use tracing::info;

use crate::{
    calibration::FrontEndParameters,
    error::SinkError,
    positioner::Polarization,
    rfi::{RfiRecord, ThresholdNorm},
    spectrum::Observation,
    time::TimeData,
};

/// Interference found in one observation
#[derive(Debug, Clone)]
pub struct RfiReport {
    pub time: TimeData,
    pub azimuth_deg: Option<f64>,
    pub polarization: Option<Polarization>,
    /// `None` for the statistical detector
    pub norm: Option<ThresholdNorm>,
    pub records: Vec<RfiRecord>,
    /// Contiguous runs of flagged samples
    pub bands: usize,
}

#[derive(Debug, Clone)]
pub enum Record {
    Observation(Observation),
    Rfi(RfiReport),
    FrontEnd(FrontEndParameters),
}

/// Append-only record writer
pub trait RecordSink: Send {
    fn write(&mut self, record: &Record) -> Result<(), SinkError>;
}

/// Summarizes every record through the log
#[derive(Debug, Default)]
pub struct LogSink;

impl RecordSink for LogSink {
    fn write(&mut self, record: &Record) -> Result<(), SinkError> {
        match record {
            Record::Observation(o) => {
                let peak = o
                    .spectrum
                    .samples()
                    .iter()
                    .max_by(|a, b| a.amplitude.total_cmp(&b.amplitude));
                info!(
                    time = %o.time.timestamp(),
                    samples = o.spectrum.len(),
                    azimuth_deg = ?o.azimuth_deg,
                    polarization = ?o.polarization,
                    calibrated = o.calibrated,
                    heading_deg = ?o.time.attitude().yaw_deg,
                    pressure_hpa = ?o.time.pressure_hpa(),
                    pressure_altitude_m = ?o.time.pressure_altitude_m(),
                    peak_hz = peak.map(|p| p.frequency),
                    peak_dbm = peak.map(|p| p.amplitude),
                    "Observation"
                );
            }
            Record::Rfi(r) => {
                info!(
                    time = %r.time.timestamp(),
                    norm = ?r.norm,
                    flagged = r.records.len(),
                    bands = r.bands,
                    "RFI"
                );
                for rec in &r.records {
                    info!(
                        freq_hz = rec.frequency_hz,
                        amplitude_dbm = rec.amplitude_dbm,
                        excess_db = rec.excess_db,
                        "RFI sample"
                    );
                }
            }
            Record::FrontEnd(p) => {
                info!(
                    derived_at = ?p.derived_at,
                    points = p.gain_db.points().len(),
                    excluded = p.excluded.len(),
                    "Front-end parameters"
                );
            }
        }
        Ok(())
    }
}

/// Keeps records in memory; clones share the same store
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Record>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordSink for MemorySink {
    fn write(&mut self, record: &Record) -> Result<(), SinkError> {
        self.records
            .lock()
            .map_err(|_| SinkError::Rejected("memory sink poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::Spectrum;

    fn observation() -> Observation {
        Observation {
            spectrum: Spectrum::from_parts(&[1e6, 2e6], &[-90.0, -80.0]).unwrap(),
            time: TimeData::now(None),
            azimuth_deg: Some(90.0),
            polarization: Some(Polarization::Vertical),
            calibrated: false,
        }
    }

    #[test]
    fn memory_sink_clones_share_records() {
        let sink = MemorySink::new();
        let mut writer: Box<dyn RecordSink> = Box::new(sink.clone());
        writer.write(&Record::Observation(observation())).unwrap();
        assert_eq!(sink.len(), 1);
        assert!(matches!(sink.records()[0], Record::Observation(_)));
    }

    #[test]
    fn log_sink_accepts_everything() {
        let mut sink = LogSink;
        sink.write(&Record::Observation(observation())).unwrap();
        sink.write(&Record::Rfi(RfiReport {
            time: TimeData::now(None),
            azimuth_deg: None,
            polarization: None,
            norm: Some(ThresholdNorm::SkaMode1),
            records: vec![],
            bands: 0,
        }))
        .unwrap();
    }
}
