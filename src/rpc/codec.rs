//! Varint length-prefix frame codec.
//!
//! Wire format:
//! ```text
//! ┌──────────────────────┬──────────────────────────┐
//! │ Length (1–10 B)      │ postcard payload (N B)   │
//! │ LEB128 varint u64    │                          │
//! └──────────────────────┴──────────────────────────┘
//! ```
//!
//! [`FrameDecoder`] accumulates incoming bytes and yields complete messages.
//! This handles partial reads gracefully: a single `Transport::read` call
//! may return part of the length prefix, part of the payload, or several
//! frames concatenated. Running out of bytes is reported as
//! [`Decoded::InsufficientData`] and never consumes anything; only a corrupt
//! prefix or payload is an error, and that error is terminal for the stream.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::FrameError;

/// Default maximum frame payload size (protects against memory exhaustion).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 20;

/// Longest valid LEB128 encoding of a u64.
pub const MAX_LENGTH_PREFIX: usize = 10;

/// Outcome of a decode attempt that did not fail.
#[derive(Debug, PartialEq)]
pub enum Decoded<T> {
    /// One whole message, and how many buffer bytes it occupied.
    Frame { message: T, consumed: usize },
    /// The buffer holds only a prefix of the next frame; retry later.
    InsufficientData,
}

/// Append the LEB128 encoding of `value` to `out`.
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode a LEB128 u64 from the front of `buf`.
///
/// `Ok(None)` means the buffer ends inside the varint.
pub fn decode_varint(buf: &[u8]) -> Result<Option<(u64, usize)>, FrameError> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_LENGTH_PREFIX {
            return Err(FrameError::BadLengthPrefix);
        }
        let bits = u64::from(byte & 0x7f);
        // The tenth byte may only carry the top bit of a u64.
        if i == MAX_LENGTH_PREFIX - 1 && bits > 1 {
            return Err(FrameError::BadLengthPrefix);
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_LENGTH_PREFIX {
        Err(FrameError::BadLengthPrefix)
    } else {
        Ok(None)
    }
}

/// Try to decode one message from the front of `buf`.
pub fn decode_frame<T: DeserializeOwned>(
    buf: &[u8],
    max_frame_size: usize,
) -> Result<Decoded<T>, FrameError> {
    let Some((len, header)) = decode_varint(buf)? else {
        return Ok(Decoded::InsufficientData);
    };
    if len > max_frame_size as u64 {
        return Err(FrameError::TooLarge {
            len,
            max: max_frame_size,
        });
    }

    let total = header + len as usize;
    if buf.len() < total {
        return Ok(Decoded::InsufficientData);
    }

    let (message, rest) = postcard::take_from_bytes::<T>(&buf[header..total])
        .map_err(|e| FrameError::Malformed(e.to_string()))?;
    if !rest.is_empty() {
        return Err(FrameError::Malformed(format!(
            "{} trailing bytes in frame",
            rest.len()
        )));
    }

    Ok(Decoded::Frame {
        message,
        consumed: total,
    })
}

/// Serialise `message` and prefix it with its length.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let payload = postcard::to_allocvec(message).map_err(|e| FrameError::Encode(e.to_string()))?;
    let mut out = Vec::with_capacity(payload.len() + MAX_LENGTH_PREFIX);
    encode_varint(payload.len() as u64, &mut out);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Streaming frame decoder for one connection.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    /// Append raw bytes to the pending buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Decode the next whole message, if the buffer holds one.
    ///
    /// On `Ok(None)` nothing was consumed. After an `Err` the buffer content
    /// must not be trusted; callers close the connection.
    pub fn next_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        match decode_frame(&self.buffer, self.max_frame_size)? {
            Decoded::Frame { message, consumed } => {
                self.buffer.drain(..consumed);
                Ok(Some(message))
            }
            Decoded::InsufficientData => Ok(None),
        }
    }

    /// Bytes received but not yet part of a decoded message.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame (e.g. when a connection is reused).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::messages::{ProcedureCall, Request, Value};

    fn add_request() -> Request {
        Request::with_id(
            1,
            ProcedureCall::new("Service", "Add", vec![Value::Int(2), Value::Int(3)]),
        )
    }

    #[test]
    fn varint_known_encodings() {
        let mut out = Vec::new();
        encode_varint(0, &mut out);
        assert_eq!(out, [0x00]);

        out.clear();
        encode_varint(300, &mut out);
        assert_eq!(out, [0xac, 0x02]);

        out.clear();
        encode_varint(u64::MAX, &mut out);
        assert_eq!(out.len(), MAX_LENGTH_PREFIX);
        assert_eq!(decode_varint(&out), Ok(Some((u64::MAX, MAX_LENGTH_PREFIX))));
    }

    #[test]
    fn varint_truncated_is_not_an_error() {
        assert_eq!(decode_varint(&[]), Ok(None));
        assert_eq!(decode_varint(&[0x80, 0x80]), Ok(None));
    }

    #[test]
    fn varint_overlong_is_rejected() {
        assert_eq!(decode_varint(&[0xff; 11]), Err(FrameError::BadLengthPrefix));
        let mut overflow = [0xff; 10];
        overflow[9] = 0x02;
        assert_eq!(decode_varint(&overflow), Err(FrameError::BadLengthPrefix));
    }

    #[test]
    fn declared_1000_with_10_present_waits() {
        let mut buf = Vec::new();
        encode_varint(1000, &mut buf);
        buf.resize(10, 0xAA);

        let res: Decoded<Request> = decode_frame(&buf, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(res, Decoded::InsufficientData);

        let mut decoder = FrameDecoder::default();
        decoder.feed(&buf);
        assert_eq!(decoder.next_message::<Request>(), Ok(None));
        assert_eq!(decoder.buffered(), 10, "nothing may be consumed");
    }

    #[test]
    fn frame_roundtrip_through_decoder() {
        let frame = encode_frame(&add_request()).unwrap();
        let mut decoder = FrameDecoder::default();
        decoder.feed(&frame);
        assert_eq!(decoder.next_message::<Request>(), Ok(Some(add_request())));
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.next_message::<Request>(), Ok(None));
    }

    #[test]
    fn two_frames_in_one_feed() {
        let mut bytes = encode_frame(&add_request()).unwrap();
        let second = Request::new(ProcedureCall::new("Core", "GetStatus", vec![]));
        bytes.extend(encode_frame(&second).unwrap());

        let mut decoder = FrameDecoder::default();
        decoder.feed(&bytes);
        assert_eq!(decoder.next_message::<Request>(), Ok(Some(add_request())));
        assert_eq!(decoder.next_message::<Request>(), Ok(Some(second)));
    }

    #[test]
    fn oversized_frame_is_rejected_before_payload_arrives() {
        let mut buf = Vec::new();
        encode_varint(5000, &mut buf);
        let res = decode_frame::<Request>(&buf, 4096);
        assert_eq!(res, Err(FrameError::TooLarge { len: 5000, max: 4096 }));
    }

    #[test]
    fn garbage_payload_is_malformed() {
        // Length 3, payload 0xff 0xff 0xff: not a valid Request.
        let buf = [0x03, 0xff, 0xff, 0xff];
        assert!(matches!(
            decode_frame::<Request>(&buf, DEFAULT_MAX_FRAME_SIZE),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn deeply_nested_argument_is_malformed() {
        // Request { call_id: None, call: S.P([List[List[...None]]]) }, nested
        // far past the value depth limit but well under the frame limit.
        let mut payload = vec![0x00, 0x01, b'S', 0x01, b'P', 0x01];
        for _ in 0..200_000 {
            payload.extend_from_slice(&[0x07, 0x01]);
        }
        payload.push(0x00);
        let mut buf = Vec::new();
        encode_varint(payload.len() as u64, &mut buf);
        buf.extend_from_slice(&payload);
        assert!(buf.len() < DEFAULT_MAX_FRAME_SIZE);

        let mut decoder = FrameDecoder::default();
        decoder.feed(&buf);
        assert!(matches!(
            decoder.next_message::<Request>(),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn trailing_bytes_inside_frame_are_malformed() {
        let payload = postcard::to_allocvec(&add_request()).unwrap();
        let mut buf = Vec::new();
        encode_varint(payload.len() as u64 + 2, &mut buf);
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&[0, 0]);
        assert!(matches!(
            decode_frame::<Request>(&buf, DEFAULT_MAX_FRAME_SIZE),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn reset_discards_partial_frame() {
        let frame = encode_frame(&add_request()).unwrap();
        let mut decoder = FrameDecoder::default();
        decoder.feed(&frame[..3]);
        decoder.reset();
        decoder.feed(&frame);
        assert_eq!(decoder.next_message::<Request>(), Ok(Some(add_request())));
    }
}
