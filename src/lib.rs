//! tickrpc library.
//!
//! An RPC and value-streaming server meant to be embedded in a host that
//! owns a single-threaded update loop. Clients call procedures from a
//! static catalogue; calls run only inside [`scheduler::Server::tick`].

#![deny(unused_must_use)]

pub mod config;
pub mod error;
pub mod host;
pub mod rpc;
pub mod scheduler;

pub use error::{Error, Result};
