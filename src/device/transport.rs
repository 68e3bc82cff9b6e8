//! Byte pipes to the analyzer

use std::{
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::{Duration, Instant},
};

use tracing::debug;

use crate::error::DeviceError;

/// Exclusive byte-level link to one analyzer
pub trait Transport: Send {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), DeviceError>;
    /// Fill `buf` completely or fail with [`DeviceError::Timeout`] once `timeout` elapses
    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), DeviceError>;
    /// Drop whatever is waiting in the input queue, returning how many bytes were discarded
    fn purge(&mut self) -> Result<usize, DeviceError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        (**self).write_all(bytes)
    }

    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), DeviceError> {
        (**self).read_exact_timeout(buf, timeout)
    }

    fn purge(&mut self) -> Result<usize, DeviceError> {
        (**self).purge()
    }
}

/// Analyzer reached through a serial-to-TCP bridge
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self, DeviceError> {
        let mut last = None;
        for addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(%addr, "Connected to analyzer bridge");
                    return Ok(Self { stream });
                }
                Err(e) => last = Some(e),
            }
        }
        Err(last
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address to connect to"))
            .into())
    }
}

impl Transport for TcpTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        self.stream.write_all(bytes)?;
        Ok(())
    }

    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DeviceError::Timeout {
                    waited: timeout,
                    expected: buf.len(),
                    received: filled,
                });
            }
            self.stream.set_read_timeout(Some(remaining))?;
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "analyzer bridge closed the connection",
                    )
                    .into())
                }
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn purge(&mut self) -> Result<usize, DeviceError> {
        self.stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 512];
        let mut dropped = 0;
        let result = loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(n) => dropped += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.stream.set_nonblocking(false)?;
        result?;
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn tcp_read_times_out_with_partial_count() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(&[1, 2]).unwrap();
            std::thread::sleep(Duration::from_millis(200));
        });
        let mut transport = TcpTransport::connect(addr, Duration::from_secs(1)).unwrap();
        let mut buf = [0u8; 4];
        let err = transport
            .read_exact_timeout(&mut buf, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Timeout {
                expected: 4,
                received: 2,
                ..
            }
        ));
        server.join().unwrap();
    }

    #[test]
    fn purge_drops_pending_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(&[9; 10]).unwrap();
            std::thread::sleep(Duration::from_millis(200));
        });
        let mut transport = TcpTransport::connect(addr, Duration::from_secs(1)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(transport.purge().unwrap(), 10);
        server.join().unwrap();
    }
}
