//! Binary remote-control protocol
//!
//! Every command is six bytes: opcode, target variable, `f32` value, all
//! little-endian. `CaptureSweep` is answered with a [`SweepReply`], every other
//! command with a one-byte [`Reply`].

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    error::{ProtocolError, SpectrumError, StationError},
    spectrum::{FrequencySample, Spectrum},
};

pub const COMMAND_LEN: usize = 6;
pub const SWEEP_HEADER_LEN: usize = 5;
/// `f64` frequency then `f32` amplitude
pub const SWEEP_SAMPLE_LEN: usize = 12;
/// Upper bound on samples a client will accept in one reply
pub const MAX_SWEEP_SAMPLES: u32 = 1 << 22;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    SetVariable = 0x01,
    CaptureSweep = 0x02,
    Calibrate = 0x03,
    Advance = 0x04,
    Home = 0x05,
    /// Value 0 is horizontal, anything else vertical
    ChangePolarization = 0x06,
    Shutdown = 0x07,
}

impl CommandType {
    pub const ALL: [CommandType; 7] = [
        CommandType::SetVariable,
        CommandType::CaptureSweep,
        CommandType::Calibrate,
        CommandType::Advance,
        CommandType::Home,
        CommandType::ChangePolarization,
        CommandType::Shutdown,
    ];
}

impl TryFrom<u8> for CommandType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|c| *c as u8 == value)
            .ok_or(ProtocolError::UnknownOpcode(value))
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetVariable {
    None = 0x00,
    /// MHz
    StartFrequency = 0x01,
    /// MHz
    StopFrequency = 0x02,
    /// Hz
    Rbw = 0x03,
    /// ms
    SweepTime = 0x04,
    /// dB
    RfiThreshold = 0x05,
    RfiWindow = 0x06,
    RfiConsecutive = 0x07,
}

impl TargetVariable {
    pub const ALL: [TargetVariable; 8] = [
        TargetVariable::None,
        TargetVariable::StartFrequency,
        TargetVariable::StopFrequency,
        TargetVariable::Rbw,
        TargetVariable::SweepTime,
        TargetVariable::RfiThreshold,
        TargetVariable::RfiWindow,
        TargetVariable::RfiConsecutive,
    ];
}

impl TryFrom<u8> for TargetVariable {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|v| *v as u8 == value)
            .ok_or(ProtocolError::UnknownVariable(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    pub command_type: CommandType,
    pub variable: TargetVariable,
    pub value: f32,
}

impl Command {
    pub fn new(command_type: CommandType, variable: TargetVariable, value: f32) -> Self {
        Self {
            command_type,
            variable,
            value,
        }
    }

    /// Command with no target variable
    pub fn simple(command_type: CommandType) -> Self {
        Self::new(command_type, TargetVariable::None, 0.0)
    }

    pub fn encode(&self) -> [u8; COMMAND_LEN] {
        let mut bytes = [0u8; COMMAND_LEN];
        bytes[0] = self.command_type as u8;
        bytes[1] = self.variable as u8;
        bytes[2..].copy_from_slice(&self.value.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != COMMAND_LEN {
            return Err(ProtocolError::Length {
                message: "command",
                expected: COMMAND_LEN,
                actual: bytes.len(),
            });
        }
        let command_type = CommandType::try_from(bytes[0])?;
        let variable = TargetVariable::try_from(bytes[1])?;
        let value = f32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        Ok(Self::new(command_type, variable, value))
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0x00,
    InvalidCommand = 0x01,
    InvalidArgument = 0x02,
    DeviceFailure = 0x03,
    CaptureFailed = 0x04,
    CalibrationFailed = 0x05,
    DetectionFailed = 0x06,
    PositionFailed = 0x07,
    ShuttingDown = 0x08,
    InternalError = 0x09,
}

impl Status {
    pub const ALL: [Status; 10] = [
        Status::Ok,
        Status::InvalidCommand,
        Status::InvalidArgument,
        Status::DeviceFailure,
        Status::CaptureFailed,
        Status::CalibrationFailed,
        Status::DetectionFailed,
        Status::PositionFailed,
        Status::ShuttingDown,
        Status::InternalError,
    ];
}

impl TryFrom<u8> for Status {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|s| *s as u8 == value)
            .ok_or(ProtocolError::UnknownStatus(value))
    }
}

impl From<&StationError> for Status {
    fn from(e: &StationError) -> Self {
        match e {
            StationError::Device(_) | StationError::DeviceUnreachable(_) => Status::DeviceFailure,
            StationError::Config(_) => Status::InvalidArgument,
            StationError::Capture(_) => Status::CaptureFailed,
            StationError::Curve(_) | StationError::Calibration(_) => Status::CalibrationFailed,
            StationError::Detection(_) => Status::DetectionFailed,
            StationError::Position(_) => Status::PositionFailed,
            StationError::Protocol(_) => Status::InvalidCommand,
            StationError::Sink(_) | StationError::Time(_) => Status::InternalError,
            StationError::ShutdownTimeout(_) | StationError::ShuttingDown => Status::ShuttingDown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
}

impl Reply {
    pub fn new(status: Status) -> Self {
        Self { status }
    }

    pub fn encode(&self) -> [u8; 1] {
        [self.status as u8]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        match bytes {
            [status] => Ok(Self::new(Status::try_from(*status)?)),
            _ => Err(ProtocolError::Length {
                message: "reply",
                expected: 1,
                actual: bytes.len(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepReply {
    pub status: Status,
    pub samples: Vec<(f64, f32)>,
}

impl SweepReply {
    pub fn failed(status: Status) -> Self {
        Self {
            status,
            samples: vec![],
        }
    }

    pub fn from_spectrum(spectrum: &Spectrum) -> Self {
        Self {
            status: Status::Ok,
            samples: spectrum
                .samples()
                .iter()
                .map(|s| (s.frequency, s.amplitude as f32))
                .collect(),
        }
    }

    pub fn to_spectrum(&self) -> Result<Spectrum, SpectrumError> {
        Spectrum::new(
            self.samples
                .iter()
                .map(|&(f, a)| FrequencySample::new(f, a as f64))
                .collect(),
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SWEEP_HEADER_LEN + self.samples.len() * SWEEP_SAMPLE_LEN);
        bytes.push(self.status as u8);
        bytes.extend_from_slice(&(self.samples.len() as u32).to_le_bytes());
        for (freq, amp) in &self.samples {
            bytes.extend_from_slice(&freq.to_le_bytes());
            bytes.extend_from_slice(&amp.to_le_bytes());
        }
        bytes
    }

    /// Validates the header and returns the status and sample count
    fn decode_header(header: &[u8]) -> Result<(Status, u32), ProtocolError> {
        if header.len() < SWEEP_HEADER_LEN {
            return Err(ProtocolError::Length {
                message: "sweep reply header",
                expected: SWEEP_HEADER_LEN,
                actual: header.len(),
            });
        }
        let status = Status::try_from(header[0])?;
        let count = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        if count > MAX_SWEEP_SAMPLES {
            return Err(ProtocolError::Length {
                message: "sweep reply",
                expected: MAX_SWEEP_SAMPLES as usize,
                actual: count as usize,
            });
        }
        Ok((status, count))
    }

    fn decode_samples(body: &[u8]) -> Vec<(f64, f32)> {
        body.chunks_exact(SWEEP_SAMPLE_LEN)
            .map(|c| {
                let mut freq = [0u8; 8];
                freq.copy_from_slice(&c[..8]);
                let mut amp = [0u8; 4];
                amp.copy_from_slice(&c[8..]);
                (f64::from_le_bytes(freq), f32::from_le_bytes(amp))
            })
            .collect()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (status, count) = Self::decode_header(bytes)?;
        let expected = SWEEP_HEADER_LEN + count as usize * SWEEP_SAMPLE_LEN;
        if bytes.len() != expected {
            return Err(ProtocolError::Length {
                message: "sweep reply",
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            status,
            samples: Self::decode_samples(&bytes[SWEEP_HEADER_LEN..]),
        })
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, ProtocolError> {
        let mut header = [0u8; SWEEP_HEADER_LEN];
        read_full(reader, &mut header)?;
        let (status, count) = Self::decode_header(&header)?;
        let mut body = vec![0u8; count as usize * SWEEP_SAMPLE_LEN];
        read_full(reader, &mut body)?;
        Ok(Self {
            status,
            samples: Self::decode_samples(&body),
        })
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(ProtocolError::Truncated(filled)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Accepts one control client at a time and exchanges commands with it
pub struct ControlServer {
    listener: TcpListener,
    client: Option<TcpStream>,
    pending: Vec<u8>,
    read_timeout: Duration,
}

impl ControlServer {
    pub fn bind<A: ToSocketAddrs>(addr: A, read_timeout: Duration) -> Result<Self, ProtocolError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!(addr = %listener.local_addr()?, "Control server listening");
        Ok(Self {
            listener,
            client: None,
            pending: Vec::with_capacity(COMMAND_LEN),
            read_timeout: read_timeout.max(Duration::from_millis(1)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    fn accept(&mut self) -> Result<bool, ProtocolError> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(self.read_timeout))?;
                stream.set_nodelay(true)?;
                info!(%peer, "Control client connected");
                self.client = Some(stream);
                self.pending.clear();
                Ok(true)
            }
            Err(e) if is_timeout(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait at most the read timeout for a complete command.
    ///
    /// A malformed command is reported as an error and leaves the connection open.
    pub fn poll_command(&mut self) -> Result<Option<Command>, ProtocolError> {
        if self.client.is_none() && !self.accept()? {
            return Ok(None);
        }
        let Some(stream) = self.client.as_mut() else {
            return Ok(None);
        };
        let mut buf = [0u8; COMMAND_LEN];
        let want = COMMAND_LEN - self.pending.len();
        match stream.read(&mut buf[..want]) {
            Ok(0) => {
                let partial = self.pending.len();
                self.drop_client();
                if partial > 0 {
                    return Err(ProtocolError::Truncated(partial));
                }
                Ok(None)
            }
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                if self.pending.len() < COMMAND_LEN {
                    return Ok(None);
                }
                let decoded = Command::decode(&self.pending);
                self.pending.clear();
                let command = decoded?;
                debug!(?command, "Control command received");
                Ok(Some(command))
            }
            Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => {
                self.drop_client();
                Err(e.into())
            }
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let Some(stream) = self.client.as_mut() else {
            warn!("Reply dropped, no control client");
            return Ok(());
        };
        if let Err(e) = stream.write_all(bytes).and_then(|_| stream.flush()) {
            self.drop_client();
            return Err(e.into());
        }
        Ok(())
    }

    pub fn respond(&mut self, reply: Reply) -> Result<(), ProtocolError> {
        self.send(&reply.encode())
    }

    pub fn respond_sweep(&mut self, reply: &SweepReply) -> Result<(), ProtocolError> {
        self.send(&reply.encode())
    }

    fn drop_client(&mut self) {
        if self.client.take().is_some() {
            info!("Control client disconnected");
        }
        self.pending.clear();
    }

    /// Disconnect the client and stop accepting new ones
    pub fn close(mut self) {
        self.drop_client();
        info!("Control server closed");
    }
}

/// Minimal remote end used by tools and tests
pub struct ControlClient {
    stream: TcpStream,
}

impl ControlClient {
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub fn send(&mut self, command: &Command) -> Result<(), ProtocolError> {
        self.stream.write_all(&command.encode())?;
        Ok(())
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.stream.write_all(bytes)?;
        Ok(())
    }

    pub fn read_reply(&mut self) -> Result<Reply, ProtocolError> {
        let mut byte = [0u8; 1];
        read_full(&mut self.stream, &mut byte)?;
        Reply::decode(&byte)
    }

    pub fn read_sweep_reply(&mut self) -> Result<SweepReply, ProtocolError> {
        SweepReply::read_from(&mut self.stream)
    }

    /// Send a command and read the reply its opcode calls for
    pub fn call(&mut self, command: &Command) -> Result<Status, ProtocolError> {
        self.send(command)?;
        match command.command_type {
            CommandType::CaptureSweep => Ok(self.read_sweep_reply()?.status),
            _ => Ok(self.read_reply()?.status),
        }
    }
}
