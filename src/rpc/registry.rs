//! Connection registry: the state shared by the I/O thread and the
//! scheduler.
//!
//! ```text
//! ┌──────────────┐  enqueue(Request)   ┌──────────────┐
//! │   I/O task   │───────────────────▶│  Scheduler   │
//! │  (async)     │◀───────────────────│  (tick)      │
//! └──────────────┘  push_outbound()    └──────────────┘
//!                   + outbound signal
//! ```
//!
//! Every queue lives behind an `embassy-sync` blocking mutex; the scheduler
//! swaps a whole queue out in one lock, so neither side ever waits on the
//! other for longer than a `VecDeque` push.

use core::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::info;

use super::messages::{ClientId, ConnectionStatus, Request};

type Shared<T> = Mutex<CriticalSectionRawMutex, RefCell<T>>;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Rpc,
    Stream,
}

/// One accepted, handshaken connection.
pub struct Connection {
    id: ConnectionId,
    client: ClientId,
    role: ConnectionRole,
    peer: Option<SocketAddr>,
    /// Decoded requests waiting for the next tick (RPC only).
    pending: Shared<VecDeque<Request>>,
    /// Encoded frames waiting for the I/O task.
    outbound: Shared<VecDeque<Vec<u8>>>,
    closed: AtomicBool,
    max_pending: usize,
}

impl Connection {
    fn new(
        id: ConnectionId,
        client: ClientId,
        role: ConnectionRole,
        peer: Option<SocketAddr>,
        max_pending: usize,
    ) -> Self {
        Self {
            id,
            client,
            role,
            peer,
            pending: Mutex::new(RefCell::new(VecDeque::new())),
            outbound: Mutex::new(RefCell::new(VecDeque::new())),
            closed: AtomicBool::new(false),
            max_pending,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queue a request for the scheduler. Hands the request back when the
    /// queue is full.
    pub fn enqueue(&self, request: Request) -> Result<(), Request> {
        self.pending.lock(|q| {
            let mut q = q.borrow_mut();
            if q.len() >= self.max_pending {
                Err(request)
            } else {
                q.push_back(request);
                Ok(())
            }
        })
    }

    /// Everything queued so far; later arrivals wait for the next call.
    pub fn take_pending(&self) -> VecDeque<Request> {
        self.pending.lock(|q| core::mem::take(&mut *q.borrow_mut()))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock(|q| q.borrow().len())
    }

    /// Queue an encoded frame for writing. Dropped if the connection closed.
    pub fn push_outbound(&self, frame: Vec<u8>) {
        if self.is_closed() {
            return;
        }
        self.outbound.lock(|q| q.borrow_mut().push_back(frame));
    }

    pub fn take_outbound(&self) -> VecDeque<Vec<u8>> {
        self.outbound.lock(|q| core::mem::take(&mut *q.borrow_mut()))
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Snapshot of one client for status queries.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub name: String,
    pub has_stream: bool,
    pub connected_for: Duration,
}

struct ClientEntry {
    name: String,
    rpc: Option<Arc<Connection>>,
    stream: Option<Arc<Connection>>,
    created_at: Instant,
}

#[derive(Default)]
struct State {
    clients: BTreeMap<ClientId, ClientEntry>,
    /// Clients whose last connection closed since the scheduler last looked.
    departed: Vec<ClientId>,
    /// Clients that attached a fresh stream connection.
    attached: Vec<ClientId>,
}

/// All live clients and their connections.
pub struct Registry {
    state: Shared<State>,
    next_connection: AtomicU64,
    max_pending: usize,
    outbound_ready: Signal<CriticalSectionRawMutex, ()>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl Registry {
    pub fn new(max_pending: usize) -> Self {
        Self {
            state: Mutex::new(RefCell::new(State::default())),
            next_connection: AtomicU64::new(1),
            max_pending,
            outbound_ready: Signal::new(),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    fn connection(
        &self,
        client: ClientId,
        role: ConnectionRole,
        peer: Option<SocketAddr>,
    ) -> Arc<Connection> {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        Arc::new(Connection::new(id, client, role, peer, self.max_pending))
    }

    /// Create a client for a successful RPC handshake.
    pub fn register_rpc(&self, name: &str, peer: Option<SocketAddr>) -> Arc<Connection> {
        let client = ClientId::random();
        let conn = self.connection(client, ConnectionRole::Rpc, peer);
        self.state.lock(|s| {
            s.borrow_mut().clients.insert(
                client,
                ClientEntry {
                    name: name.to_owned(),
                    rpc: Some(conn.clone()),
                    stream: None,
                    created_at: Instant::now(),
                },
            );
        });
        info!("RPC[{}]: client '{}' connected from {:?}", client, name, peer);
        conn
    }

    /// Attach a stream connection to a client with a live RPC connection.
    /// A previous stream connection of the same client is closed.
    pub fn attach_stream(
        &self,
        client: ClientId,
        peer: Option<SocketAddr>,
    ) -> Result<Arc<Connection>, ConnectionStatus> {
        let conn = self.connection(client, ConnectionRole::Stream, peer);
        self.state.lock(|s| -> Result<(), ConnectionStatus> {
            let mut s = s.borrow_mut();
            let entry = s
                .clients
                .get_mut(&client)
                .filter(|e| e.rpc.as_ref().is_some_and(|c| !c.is_closed()))
                .ok_or(ConnectionStatus::UnknownClient)?;
            if let Some(old) = entry.stream.replace(conn.clone()) {
                old.close();
            }
            s.attached.push(client);
            Ok(())
        })?;
        info!("RPC[{}]: stream connected from {:?}", client, peer);
        Ok(conn)
    }

    /// Forget `conn`. Losing the RPC connection takes the stream connection
    /// with it; once a client has neither, it is reported by
    /// [`take_departed`](Self::take_departed).
    pub fn disconnect(&self, conn: &Connection) {
        conn.close();
        let client = conn.client();
        let departed = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let Some(entry) = s.clients.get_mut(&client) else {
                return false;
            };
            let is_current = |slot: &Option<Arc<Connection>>| {
                slot.as_ref().is_some_and(|c| c.id() == conn.id())
            };
            match conn.role() {
                ConnectionRole::Rpc if is_current(&entry.rpc) => {
                    entry.rpc = None;
                    if let Some(stream) = entry.stream.take() {
                        stream.close();
                    }
                }
                ConnectionRole::Stream if is_current(&entry.stream) => {
                    entry.stream = None;
                }
                _ => return false,
            }
            if entry.rpc.is_none() && entry.stream.is_none() {
                s.clients.remove(&client);
                s.departed.push(client);
                true
            } else {
                false
            }
        });
        info!("RPC[{}]: {:?} connection {} closed", client, conn.role(), conn.id());
        if departed {
            info!("RPC[{}]: client disconnected", client);
        }
    }

    /// Open RPC connections, in client order.
    pub fn rpc_connections(&self) -> Vec<Arc<Connection>> {
        self.state.lock(|s| {
            s.borrow()
                .clients
                .values()
                .filter_map(|e| e.rpc.clone())
                .filter(|c| !c.is_closed())
                .collect()
        })
    }

    pub fn stream_connection(&self, client: ClientId) -> Option<Arc<Connection>> {
        self.state.lock(|s| {
            s.borrow()
                .clients
                .get(&client)
                .and_then(|e| e.stream.clone())
                .filter(|c| !c.is_closed())
        })
    }

    pub fn has_stream(&self, client: ClientId) -> bool {
        self.stream_connection(client).is_some()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        let now = Instant::now();
        self.state.lock(|s| {
            s.borrow()
                .clients
                .iter()
                .map(|(id, e)| ClientInfo {
                    id: *id,
                    name: e.name.clone(),
                    has_stream: e.stream.is_some(),
                    connected_for: now.duration_since(e.created_at),
                })
                .collect()
        })
    }

    pub fn client_count(&self) -> usize {
        self.state.lock(|s| s.borrow().clients.len())
    }

    pub fn rpc_count(&self) -> usize {
        self.state
            .lock(|s| s.borrow().clients.values().filter(|e| e.rpc.is_some()).count())
    }

    pub fn stream_count(&self) -> usize {
        self.state
            .lock(|s| s.borrow().clients.values().filter(|e| e.stream.is_some()).count())
    }

    pub fn take_departed(&self) -> Vec<ClientId> {
        self.state.lock(|s| core::mem::take(&mut s.borrow_mut().departed))
    }

    pub fn take_attached(&self) -> Vec<ClientId> {
        self.state.lock(|s| core::mem::take(&mut s.borrow_mut().attached))
    }

    /// Wake the I/O task's write loop.
    pub fn notify_outbound(&self) {
        self.outbound_ready.signal(());
    }

    pub fn outbound_signal(&self) -> &Signal<CriticalSectionRawMutex, ()> {
        &self.outbound_ready
    }

    pub fn record_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::messages::ProcedureCall;

    fn req(n: u32) -> Request {
        Request::with_id(n, ProcedureCall::new("Svc", "P", vec![]))
    }

    #[test]
    fn queue_is_capped_and_drained_whole() {
        let reg = Registry::new(2);
        let conn = reg.register_rpc("a", None);
        assert!(conn.enqueue(req(1)).is_ok());
        assert!(conn.enqueue(req(2)).is_ok());
        assert_eq!(conn.enqueue(req(3)), Err(req(3)));

        let drained = conn.take_pending();
        assert_eq!(drained.len(), 2);
        assert_eq!(conn.pending_len(), 0);
        assert!(conn.enqueue(req(4)).is_ok());
    }

    #[test]
    fn stream_requires_live_rpc_client() {
        let reg = Registry::new(8);
        assert_eq!(
            reg.attach_stream(ClientId::random(), None).err(),
            Some(ConnectionStatus::UnknownClient)
        );

        let rpc = reg.register_rpc("a", None);
        let stream = reg.attach_stream(rpc.client(), None).unwrap();
        assert!(reg.has_stream(rpc.client()));
        assert_eq!(reg.take_attached(), vec![rpc.client()]);
        assert_eq!(stream.role(), ConnectionRole::Stream);
    }

    #[test]
    fn second_stream_replaces_first() {
        let reg = Registry::new(8);
        let rpc = reg.register_rpc("a", None);
        let first = reg.attach_stream(rpc.client(), None).unwrap();
        let second = reg.attach_stream(rpc.client(), None).unwrap();
        assert!(first.is_closed());
        assert!(!second.is_closed());

        // The stale connection going away leaves the new one in place.
        reg.disconnect(&first);
        assert!(reg.has_stream(rpc.client()));
    }

    #[test]
    fn rpc_close_cascades_to_stream() {
        let reg = Registry::new(8);
        let rpc = reg.register_rpc("a", None);
        let stream = reg.attach_stream(rpc.client(), None).unwrap();

        reg.disconnect(&rpc);
        assert!(stream.is_closed());
        assert_eq!(reg.client_count(), 0);
        assert_eq!(reg.take_departed(), vec![rpc.client()]);
        assert!(reg.take_departed().is_empty());
        assert!(reg.rpc_connections().is_empty());
    }

    #[test]
    fn stream_close_keeps_client() {
        let reg = Registry::new(8);
        let rpc = reg.register_rpc("a", None);
        let stream = reg.attach_stream(rpc.client(), None).unwrap();
        reg.disconnect(&stream);
        assert_eq!(reg.client_count(), 1);
        assert!(!reg.has_stream(rpc.client()));
        assert!(reg.take_departed().is_empty());
        assert_eq!(reg.stream_count(), 0);
        assert_eq!(reg.rpc_count(), 1);
    }

    #[test]
    fn outbound_dropped_after_close() {
        let reg = Registry::new(8);
        let rpc = reg.register_rpc("a", None);
        rpc.push_outbound(vec![1]);
        rpc.close();
        rpc.push_outbound(vec![2]);
        assert_eq!(rpc.take_outbound(), VecDeque::from(vec![vec![1]]));
    }

    #[test]
    fn clients_snapshot() {
        let reg = Registry::new(8);
        let a = reg.register_rpc("alpha", None);
        let infos = reg.clients();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, a.client());
        assert_eq!(infos[0].name, "alpha");
        assert!(!infos[0].has_stream);
    }
}
