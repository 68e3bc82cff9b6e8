//! Analyzer setup variables and their on-wire units

use std::fmt;

use crate::error::DeviceError;

/// Resolution/video bandwidths the analyzer supports, paired with the index it
/// expects on the wire
pub const BANDWIDTH_TABLE: [(f64, u8); 15] = [
    (50e6, 0),
    (3e6, 1),
    (1e6, 2),
    (300e3, 3),
    (100e3, 4),
    (30e3, 5),
    (10e3, 6),
    (3e3, 7),
    (1e3, 8),
    (120e3, 100),
    (9e3, 101),
    (200.0, 102),
    (5e6, 103),
    (200e3, 104),
    (1.5e6, 105),
];

const HZ_PER_MHZ: f64 = 1e6;

/// Index the analyzer uses for a bandwidth, if it supports it
pub fn bandwidth_index(hz: f64) -> Option<u8> {
    BANDWIDTH_TABLE
        .iter()
        .find(|(bw, _)| (bw - hz).abs() < 0.5)
        .map(|&(_, idx)| idx)
}

pub fn bandwidth_from_index(index: u8) -> Option<f64> {
    BANDWIDTH_TABLE
        .iter()
        .find(|(_, idx)| *idx == index)
        .map(|&(bw, _)| bw)
}

pub fn is_supported_bandwidth(hz: f64) -> bool {
    bandwidth_index(hz).is_some()
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecVariable {
    StartFreq = 0x01,
    StopFreq = 0x02,
    ResBandw = 0x03,
    VidBandw = 0x04,
    SweepTime = 0x05,
    AttenFactor = 0x06,
    RefLevel = 0x07,
    DispRange = 0x08,
    DispUnit = 0x09,
    DetMode = 0x0A,
    DemodMode = 0x0B,
    SpecProc = 0x0C,
    AntennaType = 0x0D,
    CableType = 0x0E,
    RecvConf = 0x0F,
    PreampEnable = 0x10,
    SweepDelayAcc = 0x11,
    SweepPoints = 0x12,
    RefOffset = 0x13,
    CenterFreq = 0x1E,
    SpanFreq = 0x1F,
    UsbMeas = 0x20,
    UsbSweepReset = 0x21,
    UsbSweepId = 0x22,
    UsbRunProg = 0x23,
    LevelTone = 0x46,
    BackBbEnable = 0x47,
    SpeakerVolume = 0x49,
    RbwFreqStep = 0x60,
    AntennaGain = 0x61,
    StdTone = 0xC0,
}

impl SpecVariable {
    pub const ALL: [SpecVariable; 31] = [
        SpecVariable::StartFreq,
        SpecVariable::StopFreq,
        SpecVariable::ResBandw,
        SpecVariable::VidBandw,
        SpecVariable::SweepTime,
        SpecVariable::AttenFactor,
        SpecVariable::RefLevel,
        SpecVariable::DispRange,
        SpecVariable::DispUnit,
        SpecVariable::DetMode,
        SpecVariable::DemodMode,
        SpecVariable::SpecProc,
        SpecVariable::AntennaType,
        SpecVariable::CableType,
        SpecVariable::RecvConf,
        SpecVariable::PreampEnable,
        SpecVariable::SweepDelayAcc,
        SpecVariable::SweepPoints,
        SpecVariable::RefOffset,
        SpecVariable::CenterFreq,
        SpecVariable::SpanFreq,
        SpecVariable::UsbMeas,
        SpecVariable::UsbSweepReset,
        SpecVariable::UsbSweepId,
        SpecVariable::UsbRunProg,
        SpecVariable::LevelTone,
        SpecVariable::BackBbEnable,
        SpecVariable::SpeakerVolume,
        SpecVariable::RbwFreqStep,
        SpecVariable::AntennaGain,
        SpecVariable::StdTone,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            SpecVariable::StartFreq => "STARTFREQ",
            SpecVariable::StopFreq => "STOPFREQ",
            SpecVariable::ResBandw => "RESBANDW",
            SpecVariable::VidBandw => "VIDBANDW",
            SpecVariable::SweepTime => "SWEEPTIME",
            SpecVariable::AttenFactor => "ATTENFAC",
            SpecVariable::RefLevel => "REFLEVEL",
            SpecVariable::DispRange => "DISPRANGE",
            SpecVariable::DispUnit => "DISPUNIT",
            SpecVariable::DetMode => "DETMODE",
            SpecVariable::DemodMode => "DEMODMODE",
            SpecVariable::SpecProc => "SPECPROC",
            SpecVariable::AntennaType => "ANTTYPE",
            SpecVariable::CableType => "CABLETYPE",
            SpecVariable::RecvConf => "RECVCONF",
            SpecVariable::PreampEnable => "PREAMPEN",
            SpecVariable::SweepDelayAcc => "SWPDLYACC",
            SpecVariable::SweepPoints => "SWPFRQPTS",
            SpecVariable::RefOffset => "REFOFFS",
            SpecVariable::CenterFreq => "CENTERFREQ",
            SpecVariable::SpanFreq => "SPANFREQ",
            SpecVariable::UsbMeas => "USBMEAS",
            SpecVariable::UsbSweepReset => "USBSWPRST",
            SpecVariable::UsbSweepId => "USBSWPID",
            SpecVariable::UsbRunProg => "USBRUNPROG",
            SpecVariable::LevelTone => "LEVELTONE",
            SpecVariable::BackBbEnable => "BACKBBEN",
            SpecVariable::SpeakerVolume => "SPKVOLUME",
            SpecVariable::RbwFreqStep => "RBWFSTEP",
            SpecVariable::AntennaGain => "ANTGAIN",
            SpecVariable::StdTone => "STDTONE",
        }
    }

    fn is_frequency(self) -> bool {
        matches!(
            self,
            SpecVariable::StartFreq
                | SpecVariable::StopFreq
                | SpecVariable::CenterFreq
                | SpecVariable::SpanFreq
        )
    }

    fn is_bandwidth(self) -> bool {
        matches!(self, SpecVariable::ResBandw | SpecVariable::VidBandw)
    }

    /// Convert a value in SI units (Hz for frequencies and bandwidths) into the
    /// number the analyzer expects
    pub fn encode_value(self, value: f64) -> Result<f32, DeviceError> {
        if self.is_frequency() {
            Ok((value / HZ_PER_MHZ) as f32)
        } else if self.is_bandwidth() {
            bandwidth_index(value)
                .map(f32::from)
                .ok_or(DeviceError::UnsupportedBandwidth(value))
        } else {
            Ok(value as f32)
        }
    }

    /// Inverse of [`SpecVariable::encode_value`]
    pub fn decode_value(self, raw: f32) -> Result<f64, DeviceError> {
        if self.is_frequency() {
            Ok(raw as f64 * HZ_PER_MHZ)
        } else if self.is_bandwidth() {
            let index = raw.round();
            if !(0.0..=255.0).contains(&index) {
                return Err(DeviceError::Malformed {
                    kind: "bandwidth",
                    detail: format!("index {raw} out of range"),
                });
            }
            bandwidth_from_index(index as u8).ok_or_else(|| DeviceError::Malformed {
                kind: "bandwidth",
                detail: format!("unknown index {raw}"),
            })
        } else {
            Ok(raw as f64)
        }
    }

    /// Whether a read-back value equals what was written, given the f32 wire format
    pub fn same_value(self, written: f64, read_back: f64) -> bool {
        (written - read_back).abs() <= 1e-6 * written.abs().max(1.0)
    }
}

impl TryFrom<u8> for SpecVariable {
    type Error = DeviceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        SpecVariable::ALL
            .iter()
            .copied()
            .find(|v| v.id() == value)
            .ok_or(DeviceError::UnknownVariable(value))
    }
}

impl fmt::Display for SpecVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_parse_back() {
        for v in SpecVariable::ALL {
            assert_eq!(SpecVariable::try_from(v.id()).unwrap(), v);
        }
        assert!(SpecVariable::try_from(0x00).is_err());
        assert!(SpecVariable::try_from(0xFF).is_err());
    }

    #[test]
    fn frequencies_travel_in_mhz() {
        let raw = SpecVariable::StartFreq.encode_value(1_500_000.0).unwrap();
        assert_eq!(raw, 1.5);
        assert_eq!(SpecVariable::StartFreq.decode_value(raw).unwrap(), 1_500_000.0);
    }

    #[test]
    fn bandwidths_travel_as_index() {
        assert_eq!(SpecVariable::ResBandw.encode_value(3e6).unwrap(), 1.0);
        assert_eq!(SpecVariable::VidBandw.encode_value(200.0).unwrap(), 102.0);
        assert_eq!(SpecVariable::ResBandw.decode_value(104.0).unwrap(), 200e3);
        assert!(matches!(
            SpecVariable::ResBandw.encode_value(42.0),
            Err(DeviceError::UnsupportedBandwidth(_))
        ));
        assert!(SpecVariable::ResBandw.decode_value(50.0).is_err());
    }

    #[test]
    fn read_back_tolerates_f32_rounding() {
        let written = 1_234_567_890.0;
        let raw = SpecVariable::StopFreq.encode_value(written).unwrap();
        let read_back = SpecVariable::StopFreq.decode_value(raw).unwrap();
        assert!(SpecVariable::StopFreq.same_value(written, read_back));
        assert!(!SpecVariable::SweepTime.same_value(100.0, 101.0));
    }

    #[test]
    fn plain_values_pass_through() {
        assert_eq!(SpecVariable::SweepTime.encode_value(250.0).unwrap(), 250.0);
        assert_eq!(SpecVariable::AttenFactor.decode_value(-10.0).unwrap(), -10.0);
    }
}
