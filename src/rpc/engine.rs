//! RPC engine: dispatches decoded calls to catalogue handlers.
//!
//! **Transport-decoupled**: the engine never sees bytes or connections.
//! The scheduler hands it a [`ProcedureCall`] together with the calling
//! client and receives a value or a structured [`Failure`].
//!
//! Every call passes through the same pipeline:
//!
//! 1. **Lookup**: unknown (service, procedure) → `ProcedureNotFound`.
//! 2. **Bind**: arity and types checked against the signature, trailing
//!    defaults filled in → `InvalidArgument`.
//! 3. **Invoke**: the handler runs inside `catch_unwind`; a panic becomes
//!    `ProcedureFailed` with the panic message and never escapes the tick.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use log::warn;

use super::catalogue::Catalogue;
use super::messages::{ClientId, Failure, ProcedureCall, Value};
use super::stream::StreamManager;
use crate::scheduler::ServerStatus;

/// What a handler can reach while it runs.
pub struct CallContext<'a, H> {
    /// Host state. Only the execution slot ever holds this borrow.
    pub host: &'a mut H,
    client: ClientId,
    catalogue: &'a Catalogue<H>,
    streams: Option<&'a mut StreamManager>,
    status: &'a ServerStatus,
}

impl<'a, H> CallContext<'a, H> {
    /// The client that issued the call (or owns the stream being evaluated).
    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn catalogue(&self) -> &'a Catalogue<H> {
        self.catalogue
    }

    /// Server counters as of the start of the current tick.
    pub fn status(&self) -> &'a ServerStatus {
        self.status
    }

    /// The stream manager, unless this call is itself a stream evaluation.
    pub fn streams(&mut self) -> Result<&mut StreamManager, Failure> {
        self.streams
            .as_deref_mut()
            .ok_or_else(|| Failure::failed("stream control is unavailable inside a stream"))
    }
}

/// Procedure dispatcher owning the immutable catalogue.
pub struct Dispatcher<H> {
    catalogue: Catalogue<H>,
}

impl<H> Dispatcher<H> {
    pub fn new(catalogue: Catalogue<H>) -> Self {
        Self { catalogue }
    }

    pub fn catalogue(&self) -> &Catalogue<H> {
        &self.catalogue
    }

    /// Run one call to completion.
    ///
    /// `streams` is `None` while the stream manager re-evaluates
    /// subscriptions. If a handler panics, host state is left as the handler
    /// left it.
    pub fn invoke(
        &self,
        host: &mut H,
        client: ClientId,
        streams: Option<&mut StreamManager>,
        status: &ServerStatus,
        call: &ProcedureCall,
    ) -> Result<Value, Failure> {
        let (procedure, args) = self.catalogue.resolve(call)?;
        let mut ctx = CallContext {
            host,
            client,
            catalogue: &self.catalogue,
            streams,
            status,
        };

        match panic::catch_unwind(AssertUnwindSafe(|| (procedure.handler)(&mut ctx, &args))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!("RPC[{}]: {} panicked: {}", client, call, message);
                Err(Failure::failed(message))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "procedure panicked".to_owned()
    }
}
