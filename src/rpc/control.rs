//! Built-in `Core` service: server introspection and stream control.
//!
//! Registered by [`CatalogueBuilder::new`] as ordinary catalogue entries, so
//! they are dispatched, rate limited and reported exactly like host
//! procedures.

use std::collections::BTreeMap;

use super::catalogue::{CatalogueBuilder, ParamType, Signature};
use super::engine::CallContext;
use super::messages::{Failure, Value};

/// Name of the control service.
pub const CONTROL_SERVICE: &str = "Core";

pub(crate) fn register<H: 'static>(builder: &mut CatalogueBuilder<H>) {
    builder
        .procedure(
            CONTROL_SERVICE,
            "GetStatus",
            Signature::new().returns(ParamType::Map),
            get_status,
        )
        .procedure(
            CONTROL_SERVICE,
            "GetClientId",
            Signature::new().returns(ParamType::Bytes),
            |ctx, _| Ok(Value::Bytes(ctx.client().as_bytes().to_vec())),
        )
        .procedure(
            CONTROL_SERVICE,
            "GetClientName",
            Signature::new().returns(ParamType::Str),
            |ctx, _| {
                let me = ctx.client();
                let name = ctx
                    .status()
                    .clients
                    .iter()
                    .find(|c| c.id == me)
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                Ok(Value::Str(name))
            },
        )
        .procedure(
            CONTROL_SERVICE,
            "GetClients",
            Signature::new().returns(ParamType::List),
            |ctx, _| {
                let clients = ctx
                    .status()
                    .clients
                    .iter()
                    .map(|c| {
                        Value::List(vec![
                            Value::Bytes(c.id.as_bytes().to_vec()),
                            Value::Str(c.name.clone()),
                        ])
                    })
                    .collect();
                Ok(Value::List(clients))
            },
        )
        .procedure(
            CONTROL_SERVICE,
            "GetServices",
            Signature::new().returns(ParamType::List),
            |ctx, _| {
                let names = ctx
                    .catalogue()
                    .qualified_names()
                    .into_iter()
                    .map(Value::Str)
                    .collect();
                Ok(Value::List(names))
            },
        )
        .procedure(
            CONTROL_SERVICE,
            "AddStream",
            Signature::new()
                .param("call", ParamType::Call)
                .returns(ParamType::UInt),
            add_stream,
        )
        .procedure(
            CONTROL_SERVICE,
            "RemoveStream",
            Signature::new().param("id", ParamType::UInt),
            |ctx, args| {
                let [Value::UInt(id)] = args else {
                    return Err(Failure::invalid_argument("expected a stream id"));
                };
                let client = ctx.client();
                ctx.streams()?.remove(client, *id)?;
                Ok(Value::None)
            },
        );
}

fn get_status<H>(ctx: &mut CallContext<'_, H>, _args: &[Value]) -> Result<Value, Failure> {
    let s = ctx.status();
    let fields: [(&str, Value); 10] = [
        ("version", Value::Str(s.version.to_owned())),
        ("tick", Value::UInt(s.tick)),
        ("uptime_ms", Value::UInt(s.uptime_ms)),
        ("clients", Value::UInt(s.clients.len() as u64)),
        ("rpc_connections", Value::UInt(s.rpc_connections as u64)),
        ("stream_connections", Value::UInt(s.stream_connections as u64)),
        ("streams", Value::UInt(s.streams as u64)),
        ("rpcs_executed", Value::UInt(s.rpcs_executed)),
        ("bytes_read", Value::UInt(s.bytes_read)),
        ("bytes_written", Value::UInt(s.bytes_written)),
    ];
    let map: BTreeMap<String, Value> = fields
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();
    Ok(Value::Map(map))
}

fn add_stream<H>(ctx: &mut CallContext<'_, H>, args: &[Value]) -> Result<Value, Failure> {
    let [Value::Call(call)] = args else {
        return Err(Failure::invalid_argument("expected a procedure call"));
    };
    if call.service == CONTROL_SERVICE {
        return Err(Failure::invalid_argument(format!(
            "{}.{} cannot be streamed",
            call.service, call.procedure
        )));
    }
    // Fail now, with the same kind a direct call would, rather than on
    // every tick.
    ctx.catalogue().resolve(call)?;

    let client = ctx.client();
    let id = ctx.streams()?.add(client, call.clone())?;
    Ok(Value::UInt(id))
}
