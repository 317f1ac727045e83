//! Transports that carry RTDE packages
//!
//! The protocol handler only needs whole packages in and out. Anything that
//! can connect, send, receive one package at a time and disconnect can stand
//! in for the TCP socket.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Mutex;

use tracing::{debug, info};

use crate::wire::{HEADER_SIZE, MAX_PACKAGE_SIZE};
use crate::{Result, RtdeError};

/// Port the controller serves RTDE on
pub const RTDE_PORT: u16 = 30004;

/// One package read by [`Transport::receive`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Bytes written into the caller's buffer
    pub len: usize,
    /// Receive time in nanoseconds since the Unix epoch, if known
    pub timestamp_ns: Option<u64>,
}

/// Connection to a controller.
///
/// All methods take `&self`: one thread may block in `receive` while another
/// sends.
pub trait Transport: Send + Sync {
    fn connect(&self) -> Result<()>;

    /// Send one complete package, returning the bytes written
    fn send(&self, package: &[u8]) -> Result<usize>;

    /// Block until one complete package has been read into `buf`
    fn receive(&self, buf: &mut [u8]) -> Result<Received>;

    fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn now_ns() -> Option<u64> {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .and_then(|ns| u64::try_from(ns).ok())
}

/// RTDE over a plain TCP stream
pub struct TcpTransport {
    host: String,
    port: u16,
    nodelay: bool,
    reader: Mutex<Option<TcpStream>>,
    writer: Mutex<Option<TcpStream>>,
}

impl TcpTransport {
    pub fn new(host: &str, port: u16, nodelay: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            nodelay,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn drop_streams(&self) {
        if let Some(stream) = lock(&self.writer).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        lock(&self.reader).take();
    }
}

impl Transport for TcpTransport {
    fn connect(&self) -> Result<()> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| RtdeError::Connection(format!("Failed to resolve {}: {}", self.host, e)))?
            .next()
            .ok_or_else(|| RtdeError::Connection(format!("No address for {}", self.host)))?;

        let stream = TcpStream::connect(addr)
            .map_err(|e| RtdeError::Connection(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(self.nodelay)?;
        let reader = stream.try_clone()?;

        *lock(&self.reader) = Some(reader);
        *lock(&self.writer) = Some(stream);
        info!("Connected to RTDE interface at {}", addr);
        Ok(())
    }

    fn send(&self, package: &[u8]) -> Result<usize> {
        let mut guard = lock(&self.writer);
        let stream = guard
            .as_mut()
            .ok_or_else(|| RtdeError::Connection("Not connected".to_string()))?;

        stream
            .write_all(package)
            .map_err(|e| RtdeError::Connection(format!("Failed to send package: {}", e)))?;
        Ok(package.len())
    }

    fn receive(&self, buf: &mut [u8]) -> Result<Received> {
        let mut guard = lock(&self.reader);
        let stream = guard
            .as_mut()
            .ok_or_else(|| RtdeError::Connection("Not connected".to_string()))?;

        if buf.len() < HEADER_SIZE {
            return Err(RtdeError::Precondition("Receive buffer too small".to_string()));
        }

        if let Err(e) = stream.read_exact(&mut buf[..HEADER_SIZE]) {
            if e.kind() == ErrorKind::UnexpectedEof {
                debug!("Controller closed the RTDE connection");
                drop(guard);
                self.drop_streams();
            }
            return Err(RtdeError::Connection(format!("Failed to read header: {}", e)));
        }
        let timestamp_ns = now_ns();

        let size = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if !(HEADER_SIZE..=MAX_PACKAGE_SIZE).contains(&size) || size > buf.len() {
            // The stream can no longer be framed
            drop(guard);
            self.drop_streams();
            return Err(RtdeError::MalformedFrame(format!(
                "Invalid package size {} on the wire",
                size
            )));
        }

        stream
            .read_exact(&mut buf[HEADER_SIZE..size])
            .map_err(|e| RtdeError::Connection(format!("Failed to read payload: {}", e)))?;

        Ok(Received { len: size, timestamp_ns })
    }

    fn disconnect(&self) -> Result<()> {
        self.drop_streams();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.writer).is_some()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.drop_streams();
    }
}
