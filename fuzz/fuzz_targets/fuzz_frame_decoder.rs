//! Fuzz target: `FrameDecoder` over RPC requests
//!
//! Drives arbitrary byte sequences into the streaming frame decoder, both
//! whole and split at a fuzzer-chosen point, and asserts that it never
//! panics, never consumes bytes without yielding a message, and reaches
//! the same result regardless of how the input was chunked.
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use libfuzzer_sys::fuzz_target;
use tickrpc::rpc::codec::{FrameDecoder, decode_frame, Decoded};
use tickrpc::rpc::messages::Request;

const MAX_FRAME: usize = 64 * 1024;

fn drain(decoder: &mut FrameDecoder) -> (Vec<Request>, bool) {
    let mut out = Vec::new();
    loop {
        match decoder.next_message::<Request>() {
            Ok(Some(m)) => out.push(m),
            Ok(None) => return (out, false),
            Err(_) => return (out, true),
        }
    }
}

fuzz_target!(|data: &[u8]| {
    if let Ok(Decoded::Frame { consumed, .. }) = decode_frame::<Request>(data, MAX_FRAME) {
        assert!(consumed <= data.len());
        assert!(consumed > 0);
    }

    let mut whole = FrameDecoder::new(MAX_FRAME);
    whole.feed(data);
    let (expected, failed) = drain(&mut whole);

    let split = data.first().map_or(0, |b| *b as usize % (data.len() + 1));
    let mut chunked = FrameDecoder::new(MAX_FRAME);
    chunked.feed(&data[..split]);
    let (mut got, early_fail) = drain(&mut chunked);
    if early_fail {
        assert!(failed, "a prefix cannot fail where the whole input succeeds");
    } else {
        chunked.feed(&data[split..]);
        let (rest, late_fail) = drain(&mut chunked);
        got.extend(rest);
        assert_eq!(failed, late_fail);
        assert_eq!(expected, got);
    }
});
