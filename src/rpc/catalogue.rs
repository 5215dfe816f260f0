//! Procedure catalogue: the static (service, procedure) → handler table.
//!
//! Built once with [`CatalogueBuilder`] before the scheduler starts and
//! never mutated afterwards; the dispatcher only ever holds `&Catalogue`.

use std::borrow::Cow;
use std::collections::BTreeMap;

use super::control;
use super::engine::CallContext;
use super::messages::{Failure, ProcedureCall, Value};
use crate::error::CatalogueError;

/// Declared type of a parameter or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Any,
    Bool,
    Int,
    UInt,
    Float,
    Str,
    Bytes,
    List,
    Map,
    Object,
    Call,
}

impl ParamType {
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::Any, _)
                | (Self::Bool, Value::Bool(_))
                | (Self::Int, Value::Int(_))
                | (Self::UInt, Value::UInt(_))
                | (Self::Float, Value::Float(_))
                | (Self::Str, Value::Str(_))
                | (Self::Bytes, Value::Bytes(_))
                | (Self::List, Value::List(_))
                | (Self::Map, Value::Map(_))
                | (Self::Object, Value::Object(_))
                | (Self::Call, Value::Call(_))
        )
    }

    fn name(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Float => "float",
            Self::Str => "string",
            Self::Bytes => "bytes",
            Self::List => "list",
            Self::Map => "map",
            Self::Object => "object",
            Self::Call => "call",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: &'static str,
    pub ty: ParamType,
    /// Substituted when the caller omits this (trailing) argument.
    pub default: Option<Value>,
    /// Accept `Value::None` in place of an object handle.
    pub nullable: bool,
}

impl Parameter {
    pub fn new(name: &'static str, ty: ParamType) -> Self {
        Self {
            name,
            ty,
            default: None,
            nullable: false,
        }
    }

    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Let an `Object` parameter take `Value::None`. No effect on other types.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Parameter list and return type of a procedure.
#[derive(Debug, Clone, Default)]
pub struct Signature {
    pub params: Vec<Parameter>,
    pub returns: Option<ParamType>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn param(self, name: &'static str, ty: ParamType) -> Self {
        self.with(Parameter::new(name, ty))
    }

    #[must_use]
    pub fn with(mut self, param: Parameter) -> Self {
        self.params.push(param);
        self
    }

    #[must_use]
    pub fn returns(mut self, ty: ParamType) -> Self {
        self.returns = Some(ty);
        self
    }

    /// Check `args` against the parameter list, filling trailing defaults.
    pub fn bind<'a>(&self, args: &'a [Value]) -> Result<Cow<'a, [Value]>, Failure> {
        if args.len() > self.params.len() {
            return Err(Failure::invalid_argument(format!(
                "expected at most {} arguments, got {}",
                self.params.len(),
                args.len()
            )));
        }

        for (param, value) in self.params.iter().zip(args) {
            let null_ok =
                param.nullable && param.ty == ParamType::Object && *value == Value::None;
            if !null_ok && !param.ty.accepts(value) {
                return Err(Failure::invalid_argument(format!(
                    "argument '{}' expects {}, got {}",
                    param.name,
                    param.ty.name(),
                    value.type_name()
                )));
            }
        }

        if args.len() == self.params.len() {
            return Ok(Cow::Borrowed(args));
        }

        let mut bound = args.to_vec();
        for param in &self.params[args.len()..] {
            match &param.default {
                Some(default) => bound.push(default.clone()),
                None => {
                    return Err(Failure::invalid_argument(format!(
                        "missing argument '{}'",
                        param.name
                    )));
                }
            }
        }
        Ok(Cow::Owned(bound))
    }
}

/// Handler bound to a catalogue entry.
pub type Handler<H> = Box<dyn Fn(&mut CallContext<'_, H>, &[Value]) -> Result<Value, Failure>>;

pub struct Procedure<H> {
    pub signature: Signature,
    pub(crate) handler: Handler<H>,
}

/// Immutable table of services and their procedures.
pub struct Catalogue<H> {
    services: BTreeMap<String, BTreeMap<String, Procedure<H>>>,
}

impl<H> Catalogue<H> {
    pub fn lookup(&self, service: &str, procedure: &str) -> Option<&Procedure<H>> {
        self.services.get(service)?.get(procedure)
    }

    /// Look the call up and bind its arguments.
    pub fn resolve<'c>(
        &self,
        call: &'c ProcedureCall,
    ) -> Result<(&Procedure<H>, Cow<'c, [Value]>), Failure> {
        let procedure = self
            .lookup(&call.service, &call.procedure)
            .ok_or_else(|| Failure::not_found(&call.service, &call.procedure))?;
        let args = procedure.signature.bind(&call.arguments)?;
        Ok((procedure, args))
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Every procedure as `Service.Procedure`, sorted.
    pub fn qualified_names(&self) -> Vec<String> {
        self.services
            .iter()
            .flat_map(|(service, procs)| procs.keys().map(move |p| format!("{service}.{p}")))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct CatalogueBuilder<H> {
    services: BTreeMap<String, BTreeMap<String, Procedure<H>>>,
    error: Option<CatalogueError>,
}

impl<H: 'static> CatalogueBuilder<H> {
    /// A builder with the control service already registered.
    pub fn new() -> Self {
        let mut builder = Self::empty();
        control::register(&mut builder);
        builder
    }

    /// A builder without the control service.
    pub fn empty() -> Self {
        Self {
            services: BTreeMap::new(),
            error: None,
        }
    }

    /// Register one procedure. The first registration error is reported by
    /// [`build`](Self::build).
    pub fn procedure<F>(
        &mut self,
        service: &str,
        name: &str,
        signature: Signature,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(&mut CallContext<'_, H>, &[Value]) -> Result<Value, Failure> + 'static,
    {
        if self.error.is_some() {
            return self;
        }
        if let Err(e) = validate(service, name, &signature) {
            self.error = Some(e);
            return self;
        }

        let procs = self.services.entry(service.to_owned()).or_default();
        if procs.contains_key(name) {
            self.error = Some(CatalogueError::Duplicate {
                service: service.to_owned(),
                procedure: name.to_owned(),
            });
            return self;
        }
        procs.insert(
            name.to_owned(),
            Procedure {
                signature,
                handler: Box::new(handler),
            },
        );
        self
    }

    pub fn build(self) -> Result<Catalogue<H>, CatalogueError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(Catalogue {
                services: self.services,
            }),
        }
    }
}

impl<H: 'static> Default for CatalogueBuilder<H> {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(service: &str, name: &str, signature: &Signature) -> Result<(), CatalogueError> {
    for n in [service, name] {
        if n.is_empty() || n.contains('.') {
            return Err(CatalogueError::InvalidName(n.to_owned()));
        }
    }
    let first_default = signature.params.iter().position(|p| p.default.is_some());
    if let Some(i) = first_default {
        if signature.params[i..].iter().any(|p| p.default.is_none()) {
            return Err(CatalogueError::DefaultOrder {
                service: service.to_owned(),
                procedure: name.to_owned(),
            });
        }
    }
    Ok(())
}
