//! Per-connection message framer.
//!
//! Wraps one client's [`Transport`], buffers partial reads in a
//! [`FrameDecoder`] and hands out whole decoded messages. Outgoing frames go
//! through a backlog: whatever the transport does not take right away is
//! retried on the next write or [`flush_backlog`](MessageFramer::flush_backlog),
//! so a peer that stops reading never blocks the I/O thread.

use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::codec::{FrameDecoder, encode_frame};
use super::transport::Transport;
use crate::error::{Error, TransportError};

const READ_BUF_SIZE: usize = 4096;

/// Upper bound on reads per [`MessageFramer::fill`] so one chatty peer
/// cannot starve the others sharing the I/O thread.
const MAX_READS_PER_FILL: usize = 16;

/// Default for how long a non-empty backlog may go without progress.
pub const DEFAULT_WRITE_STALL_LIMIT: Duration = Duration::from_secs(5);

/// Unsent output allowed per connection, in frames of the maximum size.
const BACKLOG_FRAMES: usize = 4;

pub struct MessageFramer<T: Transport> {
    transport: T,
    decoder: FrameDecoder,
    /// Encoded bytes the transport has not taken yet.
    backlog: Vec<u8>,
    max_backlog: usize,
    stall_limit: Duration,
    stalled_since: Option<Instant>,
}

impl<T: Transport> MessageFramer<T> {
    pub fn new(transport: T, max_frame_size: usize) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::new(max_frame_size),
            backlog: Vec::new(),
            max_backlog: max_frame_size.saturating_mul(BACKLOG_FRAMES),
            stall_limit: DEFAULT_WRITE_STALL_LIMIT,
            stalled_since: None,
        }
    }

    pub fn with_stall_limit(mut self, limit: Duration) -> Self {
        self.stall_limit = limit;
        self
    }

    /// Move whatever the transport has available into the decode buffer.
    ///
    /// Returns the number of bytes read. A transport failure is reported only
    /// when nothing was read, so already-delivered frames still decode.
    pub fn fill(&mut self) -> Result<usize, TransportError> {
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut total = 0;
        for _ in 0..MAX_READS_PER_FILL {
            match self.transport.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.decoder.feed(&buf[..n]);
                    total += n;
                }
                Err(e) if total == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(total)
    }

    /// Decode the next buffered message without touching the transport.
    pub fn next_message<M: DeserializeOwned>(&mut self) -> Result<Option<M>, Error> {
        Ok(self.decoder.next_message()?)
    }

    /// Fill from the transport, then decode every complete message.
    pub fn poll_messages<M: DeserializeOwned>(&mut self) -> Result<Vec<M>, Error> {
        self.fill()?;
        let mut messages = Vec::new();
        while let Some(message) = self.next_message()? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// Encode and send one message. Returns the bytes the transport took now.
    pub fn write_message<M: Serialize>(&mut self, message: &M) -> Result<usize, Error> {
        let frame = encode_frame(message)?;
        Ok(self.write_frame(&frame)?)
    }

    /// Queue an already-encoded frame behind any backlog and flush.
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<usize, TransportError> {
        if self.backlog.len() + frame.len() > self.max_backlog {
            return Err(TransportError::Stalled);
        }
        self.backlog.extend_from_slice(frame);
        self.flush_backlog()
    }

    /// Hand the transport as much of the backlog as it takes without
    /// blocking. Fails once the backlog has made no progress for the stall
    /// limit.
    pub fn flush_backlog(&mut self) -> Result<usize, TransportError> {
        let mut sent = 0;
        while sent < self.backlog.len() {
            match self.transport.write(&self.backlog[sent..])? {
                0 => break,
                n => sent += n,
            }
        }
        self.backlog.drain(..sent);

        if self.backlog.is_empty() {
            self.stalled_since = None;
            self.transport.flush()?;
        } else if sent > 0 {
            self.stalled_since = Some(Instant::now());
        } else {
            let since = *self.stalled_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= self.stall_limit {
                return Err(TransportError::Stalled);
            }
        }
        Ok(sent)
    }

    /// Bytes written but not yet taken by the transport.
    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    pub fn close(&mut self) {
        self.transport.close();
        self.decoder.reset();
        self.backlog.clear();
    }

    pub fn buffered(&self) -> usize {
        self.decoder.buffered()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
