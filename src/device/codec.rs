//! Byte layout of analyzer commands and replies
//!
//! All multi-byte fields are little-endian.

use super::variable::SpecVariable;
use crate::error::DeviceError;

/// Frequency unit of `AMPFREQDAT` points
pub const DEVICE_FREQ_RESOLUTION_HZ: u64 = 10;

pub const VERIFY_REQUEST: [u8; 5] = [0x01, 0xA5, 0x5A, 0xF1, 0x1F];
pub const VERIFY_REPLY: [u8; 5] = [0x01, 0x51, 0x1A, 0xF5, 0xAF];

const OP_VERIFY: u8 = 0x01;
const OP_LOGOUT: u8 = 0x02;
const OP_GETSTPVAR: u8 = 0x20;
const OP_SETSTPVAR: u8 = 0x21;
pub(crate) const OP_AMPFREQDAT: u8 = 0x22;

pub const SWEEP_POINT_LEN: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCommand {
    Verify,
    Logout,
    Get(SpecVariable),
    /// Value in SI units, converted by [`SpecVariable::encode_value`]
    Set(SpecVariable, f64),
}

impl DeviceCommand {
    pub fn encode(&self) -> Result<Vec<u8>, DeviceError> {
        Ok(match *self {
            DeviceCommand::Verify => VERIFY_REQUEST.to_vec(),
            DeviceCommand::Logout => vec![OP_LOGOUT],
            DeviceCommand::Get(var) => vec![OP_GETSTPVAR, var.id(), 0x00],
            DeviceCommand::Set(var, value) => {
                let mut bytes = vec![OP_SETSTPVAR, var.id(), 0x00];
                bytes.extend_from_slice(&var.encode_value(value)?.to_le_bytes());
                bytes
            }
        })
    }

    /// Kind of reply the analyzer answers this command with, if any
    pub fn expected_reply(&self) -> Option<ReplyKind> {
        match *self {
            DeviceCommand::Verify => Some(ReplyKind::Verify),
            DeviceCommand::Logout => None,
            DeviceCommand::Get(var) => Some(ReplyKind::Get(var)),
            DeviceCommand::Set(var, _) => Some(ReplyKind::Set(var)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplyKind {
    Verify,
    Get(SpecVariable),
    Set(SpecVariable),
    SweepPoint,
}

impl ReplyKind {
    pub fn len(&self) -> usize {
        match self {
            ReplyKind::Verify => VERIFY_REPLY.len(),
            ReplyKind::Get(_) => 6,
            ReplyKind::Set(_) => 2,
            ReplyKind::SweepPoint => SWEEP_POINT_LEN,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ReplyKind::Verify => "VERIFY",
            ReplyKind::Get(_) => "GETSTPVAR",
            ReplyKind::Set(_) => "SETSTPVAR",
            ReplyKind::SweepPoint => "AMPFREQDAT",
        }
    }

    fn malformed(&self, detail: impl Into<String>) -> DeviceError {
        DeviceError::Malformed {
            kind: self.name(),
            detail: detail.into(),
        }
    }

    /// Validate and decode exactly one reply of this kind
    pub fn decode(&self, bytes: &[u8]) -> Result<DeviceReply, DeviceError> {
        if bytes.len() != self.len() {
            return Err(self.malformed(format!(
                "expected {} bytes, got {}",
                self.len(),
                bytes.len()
            )));
        }
        match *self {
            ReplyKind::Verify => {
                if bytes == VERIFY_REPLY {
                    Ok(DeviceReply::Verified)
                } else {
                    Err(self.malformed(format!("unexpected handshake {bytes:02X?}")))
                }
            }
            ReplyKind::Get(var) => {
                self.check_opcode(bytes[0], OP_GETSTPVAR)?;
                if bytes[1] != 0 {
                    return Err(DeviceError::Rejected {
                        variable: var,
                        status: bytes[1],
                    });
                }
                let raw = f32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
                Ok(DeviceReply::Value {
                    variable: var,
                    value: var.decode_value(raw)?,
                })
            }
            ReplyKind::Set(var) => {
                self.check_opcode(bytes[0], OP_SETSTPVAR)?;
                if bytes[1] != 0 {
                    return Err(DeviceError::Rejected {
                        variable: var,
                        status: bytes[1],
                    });
                }
                Ok(DeviceReply::Acknowledged)
            }
            ReplyKind::SweepPoint => {
                self.check_opcode(bytes[0], OP_AMPFREQDAT)?;
                let word = |i: usize| [bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]];
                Ok(DeviceReply::SweepPoint(SweepPoint {
                    timer: u32::from_le_bytes(word(1)),
                    frequency_hz: u32::from_le_bytes(word(5)) as u64 * DEVICE_FREQ_RESOLUTION_HZ,
                    min_dbm: f32::from_le_bytes(word(9)),
                    max_dbm: f32::from_le_bytes(word(13)),
                }))
            }
        }
    }

    fn check_opcode(&self, got: u8, expected: u8) -> Result<(), DeviceError> {
        if got == expected {
            Ok(())
        } else {
            Err(self.malformed(format!("opcode {got:#04x}, expected {expected:#04x}")))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceReply {
    Verified,
    Value { variable: SpecVariable, value: f64 },
    Acknowledged,
    SweepPoint(SweepPoint),
    NoReply,
}

/// One streamed `AMPFREQDAT` measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPoint {
    pub timer: u32,
    pub frequency_hz: u64,
    pub min_dbm: f32,
    pub max_dbm: f32,
}

impl SweepPoint {
    /// Encoded form, as the analyzer streams it
    pub fn to_bytes(&self) -> [u8; SWEEP_POINT_LEN] {
        let mut out = [0u8; SWEEP_POINT_LEN];
        out[0] = OP_AMPFREQDAT;
        out[1..5].copy_from_slice(&self.timer.to_le_bytes());
        let freq = (self.frequency_hz / DEVICE_FREQ_RESOLUTION_HZ) as u32;
        out[5..9].copy_from_slice(&freq.to_le_bytes());
        out[9..13].copy_from_slice(&self.min_dbm.to_le_bytes());
        out[13..17].copy_from_slice(&self.max_dbm.to_le_bytes());
        out
    }
}
