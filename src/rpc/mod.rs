//! Transport-agnostic RPC subsystem.
//!
//! Length-prefixed postcard frames in, catalogue dispatch in a single
//! execution slot, responses and per-tick stream pushes out.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         RPC Stack                            │
//! │                                                              │
//! │  ┌───────────┐   ┌──────────┐   ┌──────────┐                 │
//! │  │ Transport │──▶│  Framer  │──▶│ Registry │  (I/O thread)   │
//! │  │ (trait)   │   │ (codec)  │   │ (queues) │                 │
//! │  └───────────┘   └──────────┘   └────┬─────┘                 │
//! │        ▲                             │                       │
//! │  ──────┼─────────────────────────────┼────────────────────   │
//! │        │                             ▼                       │
//! │        │        ┌──────────┐   ┌──────────────────────┐      │
//! │        └────────│  Stream  │◀──│ Engine (dispatcher)  │      │
//! │     outbound    │ (push)   │   │ → Catalogue → host   │      │
//! │                 └──────────┘   └──────────────────────┘      │
//! │                          (scheduler thread)                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod catalogue;
pub mod codec;
pub mod control;
pub mod engine;
pub mod framer;
pub mod io_task;
pub mod messages;
pub mod registry;
pub mod stream;
pub mod transport;
