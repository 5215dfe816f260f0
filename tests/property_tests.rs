//! Property and fuzz-style tests for robustness of the wire codec and the
//! subscription table.

use proptest::prelude::*;
use tickrpc::rpc::codec::{
    DEFAULT_MAX_FRAME_SIZE, Decoded, FrameDecoder, decode_frame, decode_varint, encode_frame,
    encode_varint,
};
use tickrpc::rpc::framer::MessageFramer;
use tickrpc::rpc::messages::{ClientId, ProcedureCall, Request, Value};
use tickrpc::rpc::stream::StreamManager;
use tickrpc::rpc::transport::MemoryTransport;

fn leaf_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::None),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<u64>().prop_map(Value::UInt),
        (-1e12f64..1e12).prop_map(Value::Float),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::Str),
        proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        any::<u64>().prop_map(Value::Object),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    leaf_value().prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
            proptest::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(Value::Map),
        ]
    })
}

fn request() -> impl Strategy<Value = Request> {
    (
        proptest::option::of(any::<u32>()),
        "[A-Z][a-z]{0,8}",
        "[A-Z][a-zA-Z_]{0,12}",
        proptest::collection::vec(value(), 0..4),
    )
        .prop_map(|(call_id, service, procedure, arguments)| Request {
            call_id,
            call: ProcedureCall {
                service,
                procedure,
                arguments,
            },
        })
}

// ── Framing ──────────────────────────────────────────────────

proptest! {
    /// However a valid stream is chunked, the same messages come out in
    /// the same order.
    #[test]
    fn chunking_independence(
        requests in proptest::collection::vec(request(), 1..6),
        chunk in 1usize..64,
    ) {
        let mut bytes = Vec::new();
        for r in &requests {
            bytes.extend(encode_frame(r).unwrap());
        }

        let mut framer =
            MessageFramer::new(MemoryTransport::with_chunk_size(chunk), DEFAULT_MAX_FRAME_SIZE);
        framer.transport_mut().push_inbound(&bytes);

        let mut seen = Vec::new();
        for _ in 0..=bytes.len() {
            seen.extend(framer.poll_messages::<Request>().unwrap());
            if seen.len() == requests.len() {
                break;
            }
        }
        prop_assert_eq!(seen, requests);
        prop_assert_eq!(framer.buffered(), 0);
    }

    /// Every strict prefix of a frame is "insufficient data".
    #[test]
    fn strict_prefix_never_decodes(r in request()) {
        let frame = encode_frame(&r).unwrap();
        for cut in 0..frame.len() {
            let res = decode_frame::<Request>(&frame[..cut], DEFAULT_MAX_FRAME_SIZE);
            prop_assert_eq!(res, Ok(Decoded::InsufficientData));
        }
    }

    /// Arbitrary bytes never panic the decoder, and a successful decode
    /// never claims more bytes than it was given.
    #[test]
    fn decoder_never_panics(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        if let Ok(Decoded::Frame { consumed, .. }) =
            decode_frame::<Request>(&data, DEFAULT_MAX_FRAME_SIZE)
        {
            prop_assert!(consumed <= data.len());
        }

        let mut decoder = FrameDecoder::new(4096);
        decoder.feed(&data);
        while let Ok(Some(_)) = decoder.next_message::<Request>() {}
    }

    #[test]
    fn varint_round_trip(v in any::<u64>()) {
        let mut buf = Vec::new();
        encode_varint(v, &mut buf);
        prop_assert!(buf.len() <= 10);
        prop_assert_eq!(decode_varint(&buf), Ok(Some((v, buf.len()))));
        prop_assert_eq!(decode_varint(&buf[..buf.len() - 1]), Ok(None));
    }
}

// ── Subscriptions ────────────────────────────────────────────

#[derive(Debug, Clone)]
enum StreamOp {
    Add(u8, u8),
    Remove(u8, u64),
    Drop(u8),
}

fn stream_op() -> impl Strategy<Value = StreamOp> {
    prop_oneof![
        (0u8..3, 0u8..4).prop_map(|(c, p)| StreamOp::Add(c, p)),
        (0u8..3, 0u64..12).prop_map(|(c, id)| StreamOp::Remove(c, id)),
        (0u8..3).prop_map(StreamOp::Drop),
    ]
}

proptest! {
    /// Handles are unique and increasing, and the table never holds two
    /// subscriptions for the same (client, call).
    #[test]
    fn subscription_table_invariants(ops in proptest::collection::vec(stream_op(), 0..40)) {
        let mut streams = StreamManager::new();
        let mut live: std::collections::BTreeMap<(u8, u8), u64> = Default::default();
        let mut high_water = 0u64;

        for op in ops {
            match op {
                StreamOp::Add(c, p) => {
                    let call = ProcedureCall::new("Svc", "Get", vec![Value::UInt(u64::from(p))]);
                    let id = streams.add(ClientId::from_bytes([c; 16]), call).unwrap();
                    match live.get(&(c, p)) {
                        Some(&existing) => prop_assert_eq!(id, existing),
                        None => {
                            prop_assert!(id > high_water);
                            high_water = id;
                            live.insert((c, p), id);
                        }
                    }
                }
                StreamOp::Remove(c, id) => {
                    let owned = live.iter().find(|(k, v)| k.0 == c && **v == id).map(|(k, _)| *k);
                    let res = streams.remove(ClientId::from_bytes([c; 16]), id);
                    prop_assert_eq!(res.is_ok(), owned.is_some());
                    if let Some(k) = owned {
                        live.remove(&k);
                    }
                }
                StreamOp::Drop(c) => {
                    streams.remove_client(ClientId::from_bytes([c; 16]));
                    live.retain(|k, _| k.0 != c);
                }
            }
            prop_assert_eq!(streams.len(), live.len());
        }
    }
}
