//! Execution scheduler: the single slot in which procedures run.
//!
//! The I/O thread only decodes and enqueues. [`Server::tick`] is the one
//! call site that invokes host procedures, and it takes `&mut self`, so two
//! invocations can never overlap.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Server::tick                          │
//! │                                                              │
//! │  1. reap departed clients ──▶ drop their subscriptions       │
//! │  2. swap out every RPC queue (bounded drain)                 │
//! │  3. dispatch each Request ──▶ Response ──▶ outbound queue    │
//! │  4. StreamManager::tick    ──▶ StreamMessage per client      │
//! │  5. signal the I/O write loop                                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! RPCs finish before streams are evaluated, so a stream never reports a
//! value older than a mutation made earlier in the same tick.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use burster::Limiter;
use log::{debug, error, info};
use serde::Serialize;

use crate::config::{RateLimit, ServerConfig};
use crate::rpc::catalogue::Catalogue;
use crate::rpc::codec::encode_frame;
use crate::rpc::engine::Dispatcher;
use crate::rpc::messages::{ClientId, ErrorKind, Failure, Outcome, Request, Response};
use crate::rpc::registry::{ClientInfo, Connection, Registry};
use crate::rpc::stream::StreamManager;

/// Counters visible to procedures through `Core.GetStatus`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub version: &'static str,
    pub tick: u64,
    pub uptime_ms: u64,
    pub clients: Vec<ClientInfo>,
    pub rpc_connections: usize,
    pub stream_connections: usize,
    pub streams: usize,
    pub rpcs_executed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            tick: 0,
            uptime_ms: 0,
            clients: Vec::new(),
            rpc_connections: 0,
            stream_connections: 0,
            streams: 0,
            rpcs_executed: 0,
            bytes_read: 0,
            bytes_written: 0,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub requests: usize,
    pub stream_batches: usize,
    pub clients_reaped: usize,
}

type RateLimiter = burster::TokenBucket<fn() -> Duration>;

pub struct Server<H> {
    dispatcher: Dispatcher<H>,
    host: H,
    registry: Arc<Registry>,
    streams: StreamManager,
    rate_limit: Option<RateLimit>,
    limiters: HashMap<ClientId, RateLimiter>,
    tick_interval: Duration,
    tick: u64,
    rpcs_executed: u64,
    started: Instant,
}

impl<H> Server<H> {
    pub fn new(config: &ServerConfig, catalogue: Catalogue<H>, host: H) -> Self {
        Self {
            dispatcher: Dispatcher::new(catalogue),
            host,
            registry: Arc::new(Registry::new(config.max_pending_requests)),
            streams: StreamManager::new(),
            rate_limit: config.rate_limit,
            limiters: HashMap::new(),
            tick_interval: config.tick_interval(),
            tick: 0,
            rpcs_executed: 0,
            started: Instant::now(),
        }
    }

    /// Shared with the I/O task.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher<H> {
        &self.dispatcher
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            version: env!("CARGO_PKG_VERSION"),
            tick: self.tick,
            uptime_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            clients: self.registry.clients(),
            rpc_connections: self.registry.rpc_count(),
            stream_connections: self.registry.stream_count(),
            streams: self.streams.len(),
            rpcs_executed: self.rpcs_executed,
            bytes_read: self.registry.bytes_read(),
            bytes_written: self.registry.bytes_written(),
        }
    }

    /// Run one execution cycle.
    pub fn tick(&mut self) -> TickReport {
        self.tick += 1;
        let mut report = TickReport::default();

        for client in self.registry.take_departed() {
            self.streams.remove_client(client);
            self.limiters.remove(&client);
            report.clients_reaped += 1;
        }
        for client in self.registry.take_attached() {
            self.streams.mark_unseen(client);
        }

        // Only what arrived before this point runs this tick.
        let batches: Vec<(Arc<Connection>, VecDeque<Request>)> = self
            .registry
            .rpc_connections()
            .into_iter()
            .map(|conn| {
                let pending = conn.take_pending();
                (conn, pending)
            })
            .filter(|(_, pending)| !pending.is_empty())
            .collect();

        let status = self.status();
        let mut wrote = false;

        for (conn, pending) in batches {
            for request in pending {
                if conn.is_closed() {
                    debug!("RPC[{}]: connection closed, skipping queued calls", conn.client());
                    break;
                }
                let outcome = self.execute(conn.client(), &request, &status);
                report.requests += 1;
                let response = Response {
                    call_id: request.call_id,
                    outcome,
                };
                wrote |= push_frame(&conn, &response);
            }
        }

        let registry = &self.registry;
        let stream_batches = self.streams.tick(
            &self.dispatcher,
            &mut self.host,
            &status,
            |client| registry.has_stream(client),
        );
        for batch in stream_batches {
            if let Some(conn) = registry.stream_connection(batch.client) {
                wrote |= push_frame(&conn, &batch.message);
                report.stream_batches += 1;
            }
        }

        if wrote {
            self.registry.notify_outbound();
        }
        report
    }

    fn execute(&mut self, client: ClientId, request: &Request, status: &ServerStatus) -> Outcome {
        if !self.admit(client) {
            debug!("RPC[{}]: {} rate limited", client, request.call);
            return Outcome::Failure(Failure::new(
                ErrorKind::RateLimited,
                "request rate limit exceeded",
            ));
        }

        self.rpcs_executed += 1;
        let result = self.dispatcher.invoke(
            &mut self.host,
            client,
            Some(&mut self.streams),
            status,
            &request.call,
        );
        match &result {
            Ok(_) => debug!("RPC[{}]: {} ok", client, request.call),
            Err(f) => debug!("RPC[{}]: {} failed: {}", client, request.call, f),
        }
        result.into()
    }

    fn admit(&mut self, client: ClientId) -> bool {
        let Some(limit) = self.rate_limit else {
            return true;
        };
        self.limiters
            .entry(client)
            .or_insert_with(|| {
                burster::TokenBucket::new_with_time_provider(
                    limit.per_second,
                    limit.burst,
                    monotonic_now as fn() -> Duration,
                )
            })
            .try_consume(1)
            .is_ok()
    }

    /// Tick at the configured interval until `shutdown` is set.
    ///
    /// `update` advances the host by the elapsed time before each tick.
    pub fn run(&mut self, shutdown: &AtomicBool, mut update: impl FnMut(&mut H, Duration)) {
        info!(
            "Scheduler: running at {} ms per tick",
            self.tick_interval.as_millis()
        );
        let mut last = Instant::now();
        while !shutdown.load(Ordering::Relaxed) {
            let started = Instant::now();
            update(&mut self.host, started.duration_since(last));
            last = started;

            let report = self.tick();
            if report.requests > 0 || report.clients_reaped > 0 {
                debug!("Scheduler: tick {} {:?}", self.tick, report);
            }

            if let Some(rest) = self.tick_interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
        info!("Scheduler: stopped after {} ticks", self.tick);
    }
}

fn push_frame<M: Serialize>(conn: &Connection, message: &M) -> bool {
    match encode_frame(message) {
        Ok(frame) => {
            conn.push_outbound(frame);
            true
        }
        Err(e) => {
            error!("RPC[{}]: failed to encode reply: {}", conn.client(), e);
            false
        }
    }
}

fn monotonic_now() -> Duration {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed()
}
