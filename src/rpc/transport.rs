//! Transport abstraction: any ordered, reliable byte channel.
//!
//! Concrete implementations:
//! - TCP socket ([`TcpTransport`], non-blocking)
//! - In-memory pipe ([`MemoryTransport`], tests and in-process clients)
//!
//! The framer is generic over `Transport`, so adding a new transport
//! requires zero changes to the RPC logic.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};

use crate::error::TransportError;

/// Byte-oriented transport channel.
pub trait Transport {
    /// Read up to `buf.len()` bytes into `buf`.
    /// Returns 0 if no data is available (non-blocking).
    /// Returns `Err(TransportError::Closed)` once the peer has gone.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write a prefix of `data` to the transport.
    /// Returns the number of bytes taken, 0 if none can be taken right now
    /// (non-blocking).
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Flush any buffered output.
    fn flush(&mut self) -> Result<(), TransportError>;

    /// Close both directions. Further reads and writes fail.
    fn close(&mut self);
}

// ── TCP ──────────────────────────────────────────────────────

/// Non-blocking TCP stream.
pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        Ok(Self {
            stream,
            peer,
            closed: false,
        })
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.stream.read(buf) {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.stream.write(data) {
            Ok(0) if !data.is_empty() => Err(TransportError::Closed),
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.stream.flush().map_err(TransportError::from)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

// ── In-memory ────────────────────────────────────────────────

/// In-memory transport. Inbound bytes are queued with
/// [`push_inbound`](Self::push_inbound) and handed out at most
/// `chunk_size` bytes per read; written bytes accumulate until taken, up to
/// `write_capacity` untaken bytes.
pub struct MemoryTransport {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    chunk_size: usize,
    write_capacity: usize,
    remote_closed: bool,
    closed: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_chunk_size(usize::MAX)
    }

    /// Deliver inbound bytes `chunk_size` at a time (minimum 1).
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            inbound: VecDeque::new(),
            outbound: Vec::new(),
            chunk_size: chunk_size.max(1),
            write_capacity: usize::MAX,
            remote_closed: false,
            closed: false,
        }
    }

    /// Accept at most `capacity` written bytes until they are taken, like a
    /// peer that has stopped reading.
    pub fn with_write_capacity(mut self, capacity: usize) -> Self {
        self.write_capacity = capacity;
        self
    }

    pub fn push_inbound(&mut self, data: &[u8]) {
        self.inbound.extend(data);
    }

    /// Everything written since the last call.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    /// Simulate the peer hanging up: reads fail once the inbound queue drains.
    pub fn close_remote(&mut self) {
        self.remote_closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.inbound.is_empty() {
            return if self.remote_closed {
                Err(TransportError::Closed)
            } else {
                Ok(0)
            };
        }
        let n = buf.len().min(self.chunk_size).min(self.inbound.len());
        for (dst, src) in buf[..n].iter_mut().zip(self.inbound.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if self.closed || self.remote_closed {
            return Err(TransportError::Closed);
        }
        let room = self.write_capacity.saturating_sub(self.outbound.len());
        let n = room.min(data.len());
        self.outbound.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
