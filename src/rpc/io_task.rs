//! Async RPC I/O task: reactor-driven multi-client transport bridge.
//!
//! Runs in a dedicated thread using `edge-executor` for cooperative
//! multi-task scheduling and `async-io-mini` for reactor-driven
//! timers (no busy-spinning). Three concurrent futures:
//!
//! 1. **Accept**: polls both listeners every 50ms via reactor timer
//! 2. **Read**: polls every connection every 1ms: handshakes, frame
//!    decoding, enqueueing requests for the scheduler
//! 3. **Write**: wakes on the registry's outbound signal (or every
//!    10ms) and flushes queued responses and stream messages
//!
//! ```text
//!  ┌────────────────────────────────────────────────────────────┐
//!  │  I/O Thread                                                │
//!  │  ┌──────────────────────────────────────────────────────┐  │
//!  │  │  futures_lite::block_on (drives the executor)        │  │
//!  │  │  ┌──────────────────────────────────────────────────┐│  │
//!  │  │  │  edge_executor::LocalExecutor                    ││  │
//!  │  │  │                                                  ││  │
//!  │  │  │  ┌─────────┐  ┌──────────┐  ┌───────────────┐    ││  │
//!  │  │  │  │ Accept  │  │ Read All │  │ Write (async) │    ││  │
//!  │  │  │  │ 50ms ⏱  │  │ 1ms ⏱    │  │ wake-on-signal│    ││  │
//!  │  │  │  └─────────┘  └──────────┘  └───────────────┘    ││  │
//!  │  │  └──────────────────────────────────────────────────┘│  │
//!  │  └──────────────────────────────────────────────────────┘  │
//!  └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The I/O thread never invokes a procedure. Requests go into the
//! connection's pending queue and wait for [`Server::tick`].
//!
//! [`Server::tick`]: crate::scheduler::Server::tick

use core::cell::RefCell;
use core::time::Duration;
use std::io::ErrorKind as IoErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use log::{info, warn};

use super::framer::MessageFramer;
use super::messages::{
    ConnectionRequest, ConnectionResponse, ConnectionStatus, ErrorKind, Failure, Outcome, Request,
    Response,
};
use super::registry::{Connection, ConnectionRole, Registry};
use super::transport::TcpTransport;
use crate::config::ServerConfig;
use crate::error::Error;

const ACCEPT_INTERVAL: Duration = Duration::from_millis(50);
const READ_INTERVAL: Duration = Duration::from_millis(1);
const WRITE_INTERVAL: Duration = Duration::from_millis(10);

// ── Per-connection state ─────────────────────────────────────

enum Phase {
    /// Waiting for the `ConnectionRequest`.
    Handshake { since: Instant },
    Live(Arc<Connection>),
}

struct IoSlot {
    id: u64,
    /// Which listener accepted the socket.
    port: ConnectionRole,
    framer: MessageFramer<TcpTransport>,
    phase: Phase,
}

impl IoSlot {
    /// Close the socket and tell the registry.
    fn release(&mut self, registry: &Registry) {
        if let Phase::Live(conn) = &self.phase {
            registry.disconnect(conn);
        }
        self.framer.close();
    }

    fn write<M: serde::Serialize>(&mut self, registry: &Registry, message: &M) -> bool {
        match self.framer.write_message(message) {
            Ok(n) => {
                registry.record_written(n);
                true
            }
            Err(e) => {
                warn!("IO[conn {}]: write failed: {}", self.id, e);
                false
            }
        }
    }
}

struct IoContext {
    registry: Arc<Registry>,
    shutdown: Arc<AtomicBool>,
    max_frame_size: usize,
    handshake_timeout: Duration,
    write_stall_timeout: Duration,
}

impl IoContext {
    fn running(&self) -> bool {
        !self.shutdown.load(Ordering::Relaxed)
    }
}

type SharedSlots = Rc<RefCell<Vec<IoSlot>>>;

// ── Handshake ────────────────────────────────────────────────

fn reject(slot: &mut IoSlot, ctx: &IoContext, status: ConnectionStatus, message: String) {
    warn!("IO[conn {}]: handshake rejected ({:?}): {}", slot.id, status, message);
    slot.write(&ctx.registry, &ConnectionResponse::rejected(status, message));
    slot.framer.close();
}

/// Returns `false` once the slot should be dropped.
fn handshake(slot: &mut IoSlot, ctx: &IoContext, since: Instant) -> bool {
    let request = match slot.framer.next_message::<ConnectionRequest>() {
        Ok(Some(request)) => request,
        Ok(None) => {
            if since.elapsed() >= ctx.handshake_timeout {
                reject(slot, ctx, ConnectionStatus::Timeout, "handshake timed out".into());
                return false;
            }
            return true;
        }
        Err(e) => {
            reject(slot, ctx, ConnectionStatus::MalformedMessage, e.to_string());
            return false;
        }
    };

    let peer = slot.framer.transport().peer();
    let accepted = match (slot.port, request) {
        (ConnectionRole::Rpc, ConnectionRequest::Rpc { client_name }) => {
            Ok(ctx.registry.register_rpc(client_name.as_str(), peer))
        }
        (ConnectionRole::Stream, ConnectionRequest::Stream { client_id }) => ctx
            .registry
            .attach_stream(client_id, peer)
            .map_err(|status| (status, format!("no RPC connection for client {client_id}"))),
        (port, _) => Err((
            ConnectionStatus::WrongType,
            format!("this port only accepts {port:?} connections"),
        )),
    };

    match accepted {
        Ok(conn) => {
            info!(
                "IO[conn {}]: {:?} handshake ok for client {}",
                slot.id,
                conn.role(),
                conn.client()
            );
            let ok = slot.write(&ctx.registry, &ConnectionResponse::ok(conn.client()));
            slot.phase = Phase::Live(conn);
            if !ok {
                slot.release(&ctx.registry);
            }
            ok
        }
        Err((status, message)) => {
            reject(slot, ctx, status, message);
            false
        }
    }
}

// ── Read side ────────────────────────────────────────────────

/// Decode every buffered request into the connection's queue. A full queue
/// answers `Overloaded` straight away.
fn drain_requests(slot: &mut IoSlot, conn: &Connection, ctx: &IoContext) -> bool {
    loop {
        match slot.framer.next_message::<Request>() {
            Ok(Some(request)) => {
                if let Err(request) = conn.enqueue(request) {
                    warn!(
                        "IO[conn {}]: {} pending requests, rejecting {}",
                        slot.id,
                        conn.pending_len(),
                        request.call
                    );
                    let response = Response {
                        call_id: request.call_id,
                        outcome: Outcome::Failure(Failure::new(
                            ErrorKind::Overloaded,
                            "too many pending requests",
                        )),
                    };
                    if !slot.write(&ctx.registry, &response) {
                        slot.release(&ctx.registry);
                        return false;
                    }
                }
            }
            Ok(None) => return true,
            Err(e) => {
                warn!("IO[conn {}]: malformed frame, disconnecting: {}", slot.id, e);
                slot.release(&ctx.registry);
                return false;
            }
        }
    }
}

/// Returns `false` once the slot should be dropped.
fn read_slot(slot: &mut IoSlot, ctx: &IoContext) -> bool {
    if let Phase::Live(conn) = &slot.phase {
        if conn.is_closed() {
            info!("IO[conn {}]: closed by server", slot.id);
            slot.release(&ctx.registry);
            return false;
        }
    }

    match slot.framer.fill() {
        Ok(n) => ctx.registry.record_read(n),
        Err(e) => {
            info!("IO[conn {}]: peer gone ({})", slot.id, e);
            slot.release(&ctx.registry);
            return false;
        }
    }

    if let Phase::Handshake { since } = slot.phase {
        if !handshake(slot, ctx, since) {
            return false;
        }
    }

    let Phase::Live(conn) = &slot.phase else {
        return true;
    };
    let conn = conn.clone();
    match conn.role() {
        ConnectionRole::Rpc => drain_requests(slot, &conn, ctx),
        ConnectionRole::Stream if slot.framer.buffered() > 0 => {
            warn!("IO[conn {}]: unexpected data on stream connection", slot.id);
            slot.release(&ctx.registry);
            false
        }
        ConnectionRole::Stream => true,
    }
}

// ── Write side ───────────────────────────────────────────────

/// Queue the connection's outbound frames behind the slot's backlog and send
/// what the socket takes now. Never waits on a slow peer.
fn write_slot(slot: &mut IoSlot, ctx: &IoContext) -> bool {
    let Phase::Live(conn) = &slot.phase else {
        return true;
    };
    let frames = conn.take_outbound();
    let sent = if frames.is_empty() {
        slot.framer.flush_backlog()
    } else {
        frames
            .iter()
            .try_fold(0, |sent, frame| slot.framer.write_frame(frame).map(|n| sent + n))
    };
    match sent {
        Ok(n) => {
            ctx.registry.record_written(n);
            true
        }
        Err(e) => {
            warn!("IO[conn {}]: write failed: {}", slot.id, e);
            slot.release(&ctx.registry);
            false
        }
    }
}

// ── Async I/O loop ───────────────────────────────────────────

/// Accept task: checks both listeners at 50ms intervals.
/// Lower frequency is fine since connection setup is infrequent.
async fn accept_loop(
    rpc: TcpListener,
    stream: TcpListener,
    slots: SharedSlots,
    ctx: Rc<IoContext>,
) {
    let mut next_id = 1u64;
    while ctx.running() {
        for (listener, port) in [(&rpc, ConnectionRole::Rpc), (&stream, ConnectionRole::Stream)] {
            loop {
                match listener.accept() {
                    Ok((socket, peer)) => match TcpTransport::new(socket) {
                        Ok(transport) => {
                            info!("IO[conn {}]: {:?} connection from {}", next_id, port, peer);
                            slots.borrow_mut().push(IoSlot {
                                id: next_id,
                                port,
                                framer: MessageFramer::new(transport, ctx.max_frame_size)
                                    .with_stall_limit(ctx.write_stall_timeout),
                                phase: Phase::Handshake {
                                    since: Instant::now(),
                                },
                            });
                            next_id += 1;
                        }
                        Err(e) => warn!("IO: failed to set up socket from {}: {}", peer, e),
                    },
                    Err(e) if e.kind() == IoErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("IO: accept failed: {}", e);
                        break;
                    }
                }
            }
        }
        async_io_mini::Timer::after(ACCEPT_INTERVAL).await;
    }
}

/// Read task: polls all connections at 1ms intervals.
/// The 1ms reactor timer is wake-based (not thread::sleep), so the
/// executor can service the write task between ticks.
async fn read_loop(slots: SharedSlots, ctx: Rc<IoContext>) {
    while ctx.running() {
        slots.borrow_mut().retain_mut(|slot| read_slot(slot, &ctx));
        async_io_mini::Timer::after(READ_INTERVAL).await;
    }
}

/// Write task: wakes as soon as the scheduler signals queued output,
/// and at least every 10ms so shutdown is noticed.
async fn write_loop(slots: SharedSlots, ctx: Rc<IoContext>) {
    while ctx.running() {
        futures_lite::future::or(ctx.registry.outbound_signal().wait(), async {
            async_io_mini::Timer::after(WRITE_INTERVAL).await;
        })
        .await;
        slots.borrow_mut().retain_mut(|slot| write_slot(slot, &ctx));
    }
}

/// Entry point for the I/O thread. Sets up the executor, spawns the
/// three async tasks and runs them until shutdown.
fn run_io_loop(rpc: TcpListener, stream: TcpListener, ctx: IoContext) {
    let executor: edge_executor::LocalExecutor<'_, 8> = edge_executor::LocalExecutor::new();

    let ctx = Rc::new(ctx);
    let slots: SharedSlots = Rc::new(RefCell::new(Vec::new()));

    let accept = executor.spawn(accept_loop(rpc, stream, slots.clone(), ctx.clone()));
    let read = executor.spawn(read_loop(slots.clone(), ctx.clone()));
    let write = executor.spawn(write_loop(slots.clone(), ctx.clone()));

    info!("IO task started (async, reactor-driven)");

    futures_lite::future::block_on(executor.run(async {
        accept.await;
        read.await;
        write.await;
    }));

    for slot in slots.borrow_mut().iter_mut() {
        slot.release(&ctx.registry);
    }
    info!("IO task stopped");
}

// ── Thread spawn ─────────────────────────────────────────────

/// Running I/O thread and the addresses it listens on.
pub struct IoHandle {
    thread: JoinHandle<()>,
    rpc_addr: SocketAddr,
    stream_addr: SocketAddr,
}

impl IoHandle {
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    pub fn stream_addr(&self) -> SocketAddr {
        self.stream_addr
    }

    /// Wait for the thread to exit. Set the shutdown flag first.
    pub fn join(self) -> Result<(), Error> {
        self.thread
            .join()
            .map_err(|_| Error::Io("I/O thread panicked".into()))
    }
}

/// Bind both listeners and start the I/O thread.
///
/// Binding happens on the caller's thread, so port errors surface here and
/// port 0 resolves to a real address before this returns.
pub fn spawn(
    config: &ServerConfig,
    registry: Arc<Registry>,
    shutdown: Arc<AtomicBool>,
) -> Result<IoHandle, Error> {
    let rpc = TcpListener::bind(config.rpc_addr())?;
    let stream = TcpListener::bind(config.stream_addr())?;
    rpc.set_nonblocking(true)?;
    stream.set_nonblocking(true)?;
    let rpc_addr = rpc.local_addr()?;
    let stream_addr = stream.local_addr()?;
    info!("IO: RPC on {}, streams on {}", rpc_addr, stream_addr);

    let ctx = IoContext {
        registry,
        shutdown,
        max_frame_size: config.max_frame_size,
        handshake_timeout: config.handshake_timeout(),
        write_stall_timeout: config.write_stall_timeout(),
    };
    let thread = std::thread::Builder::new()
        .name("rpc-io".into())
        .spawn(move || run_io_loop(rpc, stream, ctx))?;

    Ok(IoHandle {
        thread,
        rpc_addr,
        stream_addr,
    })
}
