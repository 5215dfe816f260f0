//! `SpaceCenter` service over the demo [`Universe`].
//!
//! Objects cross the wire as `Value::Object` handles. A handle packs the
//! object kind, the arena generation and the arena slot, so a handle to a
//! destroyed part, or a body handle passed where a part is expected, is
//! rejected with `InvalidArgument` instead of reaching the wrong object.

use std::collections::BTreeMap;

use super::{CelestialBody, Index, MAX_GENERATION, Part, Universe};
use crate::rpc::catalogue::{CatalogueBuilder, ParamType, Signature};
use crate::rpc::engine::CallContext;
use crate::rpc::messages::{Failure, ObjectHandle, Value};

pub const SERVICE: &str = "SpaceCenter";

const KIND_BODY: u64 = 1;
const KIND_PART: u64 = 2;

/// `kind:8 | generation:24 | slot:32`. Arena generations never exceed
/// [`MAX_GENERATION`], so the generation is stored whole.
fn encode(kind: u64, index: Index) -> Value {
    Value::Object(kind << 56 | u64::from(index.generation) << 32 | u64::from(index.slot))
}

fn decode(kind: u64, handle: ObjectHandle) -> Option<Index> {
    if handle >> 56 != kind {
        return None;
    }
    Some(Index {
        slot: handle as u32,
        generation: ((handle >> 32) & u64::from(MAX_GENERATION)) as u32,
    })
}

fn body<'u>(u: &'u Universe, args: &[Value]) -> Result<&'u CelestialBody, Failure> {
    args.first()
        .and_then(Value::as_object)
        .and_then(|h| decode(KIND_BODY, h))
        .and_then(|i| u.bodies.get(i))
        .ok_or_else(|| Failure::invalid_argument("not a valid CelestialBody handle"))
}

fn part_index(u: &Universe, args: &[Value]) -> Result<Index, Failure> {
    args.first()
        .and_then(Value::as_object)
        .and_then(|h| decode(KIND_PART, h))
        .filter(|i| u.parts.get(*i).is_some())
        .ok_or_else(|| Failure::invalid_argument("not a valid Part handle"))
}

fn part<'u>(u: &'u Universe, args: &[Value]) -> Result<&'u Part, Failure> {
    let index = part_index(u, args)?;
    u.parts
        .get(index)
        .ok_or_else(|| Failure::invalid_argument("not a valid Part handle"))
}

type Getter = fn(&mut CallContext<'_, Universe>, &[Value]) -> Result<Value, Failure>;

/// Register the `SpaceCenter` procedures.
pub fn register(builder: &mut CatalogueBuilder<Universe>) {
    let this = || Signature::new().param("this", ParamType::Object);

    builder
        .procedure(
            SERVICE,
            "UT",
            Signature::new().returns(ParamType::Float),
            |ctx, _| Ok(Value::Float(ctx.host.ut)),
        )
        .procedure(
            SERVICE,
            "Bodies",
            Signature::new().returns(ParamType::Map),
            |ctx, _| {
                let map: BTreeMap<String, Value> = ctx
                    .host
                    .bodies
                    .iter()
                    .map(|(i, b)| (b.name.clone(), encode(KIND_BODY, i)))
                    .collect();
                Ok(Value::Map(map))
            },
        )
        .procedure(
            SERVICE,
            "Parts",
            Signature::new().returns(ParamType::List),
            |ctx, _| {
                let parts = ctx
                    .host
                    .parts
                    .iter()
                    .map(|(i, _)| encode(KIND_PART, i))
                    .collect();
                Ok(Value::List(parts))
            },
        );

    let body_getters: [(&str, ParamType, Getter); 5] = [
        ("CelestialBody_get_Name", ParamType::Str, |ctx, args| {
            Ok(Value::Str(body(ctx.host, args)?.name.clone()))
        }),
        ("CelestialBody_get_Mass", ParamType::Float, |ctx, args| {
            Ok(Value::Float(body(ctx.host, args)?.mass))
        }),
        ("CelestialBody_get_SurfaceGravity", ParamType::Float, |ctx, args| {
            Ok(Value::Float(body(ctx.host, args)?.surface_gravity))
        }),
        ("CelestialBody_get_HasAtmosphere", ParamType::Bool, |ctx, args| {
            Ok(Value::Bool(body(ctx.host, args)?.has_atmosphere))
        }),
        ("CelestialBody_get_RotationAngle", ParamType::Float, |ctx, args| {
            Ok(Value::Float(body(ctx.host, args)?.rotation_angle))
        }),
    ];
    for (name, returns, getter) in body_getters {
        builder.procedure(SERVICE, name, this().returns(returns), getter);
    }

    let part_getters: [(&str, ParamType, Getter); 4] = [
        ("Part_get_Name", ParamType::Str, |ctx, args| {
            Ok(Value::Str(part(ctx.host, args)?.name.clone()))
        }),
        ("Part_get_Parent", ParamType::Object, |ctx, args| {
            Ok(part(ctx.host, args)?
                .parent
                .map_or(Value::None, |p| encode(KIND_PART, p)))
        }),
        ("Part_get_Children", ParamType::List, |ctx, args| {
            let children = part(ctx.host, args)?
                .children
                .iter()
                .map(|c| encode(KIND_PART, *c))
                .collect();
            Ok(Value::List(children))
        }),
        ("Part_get_Temperature", ParamType::Float, |ctx, args| {
            Ok(Value::Float(part(ctx.host, args)?.temperature))
        }),
    ];
    for (name, returns, getter) in part_getters {
        builder.procedure(SERVICE, name, this().returns(returns), getter);
    }

    builder.procedure(
        SERVICE,
        "Part_set_Temperature",
        this().param("value", ParamType::Float),
        |ctx, args| {
            let index = part_index(ctx.host, args)?;
            let value = args
                .get(1)
                .and_then(Value::as_float)
                .filter(|v| v.is_finite() && *v >= 0.0)
                .ok_or_else(|| Failure::invalid_argument("temperature must be a finite kelvin value"))?;
            if let Some(p) = ctx.host.parts.get_mut(index) {
                p.temperature = value;
            }
            Ok(Value::None)
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::engine::Dispatcher;
    use crate::rpc::messages::{ClientId, ErrorKind, ProcedureCall};
    use crate::rpc::stream::StreamManager;
    use crate::scheduler::ServerStatus;

    fn setup() -> (Dispatcher<Universe>, Universe) {
        let mut b = CatalogueBuilder::<Universe>::new();
        register(&mut b);
        (Dispatcher::new(b.build().unwrap()), Universe::demo())
    }

    fn call(
        d: &Dispatcher<Universe>,
        u: &mut Universe,
        procedure: &str,
        args: Vec<Value>,
    ) -> Result<Value, Failure> {
        d.invoke(
            u,
            ClientId::from_bytes([7; 16]),
            Some(&mut StreamManager::new()),
            &ServerStatus::default(),
            &ProcedureCall::new(SERVICE, procedure, args),
        )
    }

    #[test]
    fn body_lookup_by_name() {
        let (d, mut u) = setup();
        let Ok(Value::Map(bodies)) = call(&d, &mut u, "Bodies", vec![]) else {
            panic!("expected a map");
        };
        let kerbin = bodies["Kerbin"].clone();
        assert_eq!(
            call(&d, &mut u, "CelestialBody_get_Name", vec![kerbin.clone()]),
            Ok(Value::Str("Kerbin".into()))
        );
        assert_eq!(
            call(&d, &mut u, "CelestialBody_get_HasAtmosphere", vec![kerbin]),
            Ok(Value::Bool(true))
        );
    }

    #[test]
    fn part_tree_round_trips_through_handles() {
        let (d, mut u) = setup();
        let Ok(Value::List(parts)) = call(&d, &mut u, "Parts", vec![]) else {
            panic!("expected a list");
        };
        let pod = parts[0].clone();
        assert_eq!(call(&d, &mut u, "Part_get_Parent", vec![pod.clone()]), Ok(Value::None));

        let Ok(Value::List(children)) = call(&d, &mut u, "Part_get_Children", vec![pod.clone()])
        else {
            panic!("expected a list");
        };
        assert_eq!(children.len(), 2);
        assert_eq!(
            call(&d, &mut u, "Part_get_Parent", vec![children[0].clone()]),
            Ok(pod)
        );
    }

    #[test]
    fn set_temperature_and_read_back() {
        let (d, mut u) = setup();
        let Ok(Value::List(parts)) = call(&d, &mut u, "Parts", vec![]) else {
            panic!("expected a list");
        };
        let pod = parts[0].clone();
        call(
            &d,
            &mut u,
            "Part_set_Temperature",
            vec![pod.clone(), Value::Float(500.0)],
        )
        .unwrap();
        assert_eq!(
            call(&d, &mut u, "Part_get_Temperature", vec![pod.clone()]),
            Ok(Value::Float(500.0))
        );

        let err = call(
            &d,
            &mut u,
            "Part_set_Temperature",
            vec![pod, Value::Float(f64::NAN)],
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn handle_keeps_the_whole_generation() {
        let index = Index {
            slot: 3,
            generation: MAX_GENERATION,
        };
        let Value::Object(handle) = encode(KIND_PART, index) else {
            panic!("expected an object handle");
        };
        assert_eq!(decode(KIND_PART, handle), Some(index));
        assert_eq!(decode(KIND_BODY, handle), None);
    }

    #[test]
    fn stale_and_foreign_handles_are_invalid() {
        let (d, mut u) = setup();
        let Ok(Value::Map(bodies)) = call(&d, &mut u, "Bodies", vec![]) else {
            panic!("expected a map");
        };
        let sun = bodies["Sun"].clone();
        let err = call(&d, &mut u, "Part_get_Name", vec![sun]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let Ok(Value::List(parts)) = call(&d, &mut u, "Parts", vec![]) else {
            panic!("expected a list");
        };
        let engine = parts[2].clone();
        call(
            &d,
            &mut u,
            "Part_set_Temperature",
            vec![engine.clone(), Value::Float(10_000.0)],
        )
        .unwrap();
        u.advance(0.02);
        let err = call(&d, &mut u, "Part_get_Name", vec![engine]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }
}
