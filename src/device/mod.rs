//! Spectrum analyzer command interface

mod codec;
mod transport;
mod variable;

use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

pub use codec::{
    DeviceCommand, DeviceReply, ReplyKind, SweepPoint, DEVICE_FREQ_RESOLUTION_HZ,
    SWEEP_POINT_LEN, VERIFY_REPLY, VERIFY_REQUEST,
};
pub use transport::{TcpTransport, Transport};
pub use variable::{
    bandwidth_from_index, bandwidth_index, is_supported_bandwidth, SpecVariable, BANDWIDTH_TABLE,
};

use crate::error::DeviceError;

/// Owns the link to the analyzer and sequences commands over it
pub struct DeviceInterface<T: Transport> {
    transport: T,
    reply_timeout: Duration,
    handshake_rounds: u32,
    logged_in: bool,
    streaming: bool,
}

impl<T: Transport> DeviceInterface<T> {
    pub fn new(transport: T, reply_timeout: Duration, handshake_rounds: u32) -> Self {
        Self {
            transport,
            reply_timeout,
            handshake_rounds,
            logged_in: false,
            streaming: false,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    /// Handshake with the analyzer, then leave it idle with an empty input queue
    pub fn initialize(&mut self) -> Result<(), DeviceError> {
        let mut last = None;
        for round in 1..=self.handshake_rounds {
            self.transport.purge()?;
            match self.send_command(DeviceCommand::Verify) {
                Ok(_) => {
                    self.logged_in = true;
                    last = None;
                    debug!(round, "Analyzer handshake succeeded");
                    break;
                }
                Err(e) => {
                    warn!(round, error = %e, "Analyzer handshake failed, resetting");
                    last = Some(e);
                    // The next round purges anyway
                    if let Err(reset) = self.soft_reset() {
                        warn!(round, error = %reset, "Soft reset after failed handshake failed");
                    }
                }
            }
        }
        if let Some(e) = last {
            if !e.is_retryable() {
                return Err(e);
            }
            return Err(DeviceError::HandshakeFailed(self.handshake_rounds));
        }
        if !self.logged_in {
            return Err(DeviceError::HandshakeFailed(self.handshake_rounds));
        }
        self.disable_sweep()?;
        self.transport.purge()?;
        info!("Analyzer session open");
        Ok(())
    }

    /// Send one command and wait for its reply, if it has one
    pub fn send_command(&mut self, command: DeviceCommand) -> Result<DeviceReply, DeviceError> {
        if !self.logged_in && command != DeviceCommand::Verify {
            return Err(DeviceError::NotConnected);
        }
        trace!(?command, "Sending analyzer command");
        self.transport.write_all(&command.encode()?)?;
        match command.expected_reply() {
            Some(kind) => {
                let mut buf = vec![0u8; kind.len()];
                self.transport
                    .read_exact_timeout(&mut buf, self.reply_timeout)?;
                kind.decode(&buf)
            }
            None => Ok(DeviceReply::NoReply),
        }
    }

    pub fn get(&mut self, variable: SpecVariable) -> Result<f64, DeviceError> {
        match self.send_command(DeviceCommand::Get(variable))? {
            DeviceReply::Value { value, .. } => Ok(value),
            other => Err(DeviceError::Malformed {
                kind: "GETSTPVAR",
                detail: format!("unexpected reply {other:?}"),
            }),
        }
    }

    /// Write a variable and read it back
    pub fn set_and_check(&mut self, variable: SpecVariable, value: f64) -> Result<(), DeviceError> {
        self.send_command(DeviceCommand::Set(variable, value))?;
        let actual = self.get(variable)?;
        if !variable.same_value(value, actual) {
            return Err(DeviceError::Mismatch {
                variable,
                expected: value,
                actual,
            });
        }
        debug!(%variable, value, "Analyzer variable set");
        Ok(())
    }

    /// Restart the analyzer's sweep from its start frequency
    pub fn reset_sweep(&mut self) -> Result<(), DeviceError> {
        self.send_command(DeviceCommand::Set(SpecVariable::UsbSweepReset, 1.0))?;
        Ok(())
    }

    /// Start streaming `AMPFREQDAT` points
    pub fn enable_sweep(&mut self) -> Result<(), DeviceError> {
        self.send_command(DeviceCommand::Set(SpecVariable::UsbMeas, 1.0))?;
        self.streaming = true;
        Ok(())
    }

    /// Stop streaming. Points still in flight ahead of the acknowledgement are skipped.
    pub fn disable_sweep(&mut self) -> Result<(), DeviceError> {
        let command = DeviceCommand::Set(SpecVariable::UsbMeas, 0.0);
        self.transport.write_all(&command.encode()?)?;
        let deadline = Instant::now() + self.reply_timeout;
        let mut skipped = 0usize;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut head = [0u8; 1];
            self.transport.read_exact_timeout(&mut head, remaining)?;
            match head[0] {
                codec::OP_AMPFREQDAT => {
                    let mut rest = [0u8; SWEEP_POINT_LEN - 1];
                    self.transport.read_exact_timeout(&mut rest, remaining)?;
                    skipped += 1;
                }
                op => {
                    let mut status = [0u8; 1];
                    self.transport.read_exact_timeout(&mut status, remaining)?;
                    ReplyKind::Set(SpecVariable::UsbMeas).decode(&[op, status[0]])?;
                    break;
                }
            }
        }
        if skipped > 0 {
            trace!(skipped, "Dropped in-flight sweep points");
        }
        self.streaming = false;
        Ok(())
    }

    pub fn read_sweep_point(&mut self, timeout: Duration) -> Result<SweepPoint, DeviceError> {
        if !self.logged_in {
            return Err(DeviceError::NotConnected);
        }
        let mut buf = [0u8; SWEEP_POINT_LEN];
        self.transport.read_exact_timeout(&mut buf, timeout)?;
        match ReplyKind::SweepPoint.decode(&buf)? {
            DeviceReply::SweepPoint(p) => Ok(p),
            other => Err(DeviceError::Malformed {
                kind: "AMPFREQDAT",
                detail: format!("unexpected reply {other:?}"),
            }),
        }
    }

    /// Close the session: LOGOUT, then drop anything left in the input queue
    pub fn soft_reset(&mut self) -> Result<(), DeviceError> {
        self.transport
            .write_all(&DeviceCommand::Logout.encode()?)?;
        self.logged_in = false;
        self.streaming = false;
        let dropped = self.transport.purge()?;
        debug!(dropped, "Analyzer soft reset");
        Ok(())
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays canned bytes and records everything written
    #[derive(Default)]
    struct Scripted {
        input: VecDeque<u8>,
        written: Vec<Vec<u8>>,
        refuse_logout: bool,
    }

    impl Scripted {
        fn queue(&mut self, bytes: &[u8]) {
            self.input.extend(bytes);
        }
    }

    impl Transport for Scripted {
        fn write_all(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
            if self.refuse_logout && *bytes == [0x02] {
                return Err(DeviceError::Io(std::io::ErrorKind::BrokenPipe.into()));
            }
            self.written.push(bytes.to_vec());
            Ok(())
        }

        fn read_exact_timeout(
            &mut self,
            buf: &mut [u8],
            timeout: Duration,
        ) -> Result<(), DeviceError> {
            if self.input.len() < buf.len() {
                return Err(DeviceError::Timeout {
                    waited: timeout,
                    expected: buf.len(),
                    received: self.input.len(),
                });
            }
            for b in buf.iter_mut() {
                *b = self.input.pop_front().unwrap();
            }
            Ok(())
        }

        fn purge(&mut self) -> Result<usize, DeviceError> {
            let n = self.input.len();
            self.input.clear();
            Ok(n)
        }
    }

    fn logged_in() -> DeviceInterface<Scripted> {
        let mut dev = DeviceInterface::new(Scripted::default(), Duration::from_millis(10), 3);
        dev.logged_in = true;
        dev
    }

    fn get_reply(value: f32) -> Vec<u8> {
        let mut bytes = vec![0x20, 0x00];
        bytes.extend_from_slice(&value.to_le_bytes());
        bytes
    }

    #[test]
    fn commands_need_a_session() {
        let mut dev = DeviceInterface::new(Scripted::default(), Duration::from_millis(10), 1);
        assert!(matches!(
            dev.get(SpecVariable::SweepTime),
            Err(DeviceError::NotConnected)
        ));
    }

    #[test]
    fn handshake_gives_up_after_bounded_rounds() {
        let mut dev = DeviceInterface::new(Scripted::default(), Duration::from_millis(10), 3);
        let err = dev.initialize().unwrap_err();
        assert!(matches!(err, DeviceError::HandshakeFailed(3)));
        let verifies = dev
            .transport()
            .written
            .iter()
            .filter(|w| w.as_slice() == VERIFY_REQUEST)
            .count();
        assert_eq!(verifies, 3);
        assert!(!dev.is_logged_in());
    }

    #[test]
    fn failed_reset_does_not_cut_handshake_short() {
        let transport = Scripted {
            refuse_logout: true,
            ..Default::default()
        };
        let mut dev = DeviceInterface::new(transport, Duration::from_millis(10), 3);
        let err = dev.initialize().unwrap_err();
        assert!(matches!(err, DeviceError::HandshakeFailed(3)));
        let verifies = dev
            .transport()
            .written
            .iter()
            .filter(|w| w.as_slice() == VERIFY_REQUEST)
            .count();
        assert_eq!(verifies, 3);
    }

    #[test]
    fn set_and_check_reads_back() {
        let mut dev = logged_in();
        dev.transport.queue(&[0x21, 0x00]);
        dev.transport.queue(&get_reply(100.0));
        dev.set_and_check(SpecVariable::StartFreq, 100e6).unwrap();
        assert_eq!(dev.transport().written[1], vec![0x20, 0x01, 0x00]);
    }

    #[test]
    fn set_and_check_reports_mismatch() {
        let mut dev = logged_in();
        dev.transport.queue(&[0x21, 0x00]);
        dev.transport.queue(&get_reply(50.0));
        let err = dev.set_and_check(SpecVariable::SweepTime, 100.0).unwrap_err();
        assert!(matches!(err, DeviceError::Mismatch { actual, .. } if actual == 50.0));
        assert!(!err.is_retryable());
    }

    #[test]
    fn disable_skips_in_flight_points() {
        let mut dev = logged_in();
        dev.streaming = true;
        let point = SweepPoint {
            timer: 1,
            frequency_hz: 1000,
            min_dbm: -90.0,
            max_dbm: -90.0,
        };
        dev.transport.queue(&point.to_bytes());
        dev.transport.queue(&point.to_bytes());
        dev.transport.queue(&[0x21, 0x00]);
        dev.disable_sweep().unwrap();
        assert!(!dev.is_streaming());
        assert!(dev.transport().input.is_empty());
    }

    #[test]
    fn soft_reset_logs_out_and_purges() {
        let mut dev = logged_in();
        dev.transport.queue(&[1, 2, 3]);
        dev.soft_reset().unwrap();
        assert_eq!(dev.transport().written.last().unwrap(), &vec![0x02]);
        assert!(dev.transport().input.is_empty());
        assert!(!dev.is_logged_in());
    }
}
