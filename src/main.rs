//! tickrpc server: Main Entry Point
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  main thread                        rpc-io thread              │
//! │                                                                │
//! │  Universe::advance ─┐               accept · read · write      │
//! │                     ▼                      │      ▲            │
//! │  Server::tick ◀── Registry queues ◀────────┘      │            │
//! │       │                                           │            │
//! │       └──────── outbound frames + signal ─────────┘            │
//! └────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use tickrpc::config::{RateLimit, ServerConfig};
use tickrpc::host::{Universe, services};
use tickrpc::rpc::catalogue::CatalogueBuilder;
use tickrpc::rpc::io_task;
use tickrpc::scheduler::Server;

/// Tick-driven RPC server hosting the demo SpaceCenter service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    address: Option<std::net::IpAddr>,

    /// RPC port (0 picks a free port)
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Stream port (0 picks a free port)
    #[arg(long)]
    stream_port: Option<u16>,

    /// Tick interval in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Per-client request rate (requests per second, burst of the same size)
    #[arg(long)]
    rate_limit: Option<u64>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if let Some(a) = self.address {
            config.address = a;
        }
        if let Some(p) = self.rpc_port {
            config.rpc_port = p;
        }
        if let Some(p) = self.stream_port {
            config.stream_port = p;
        }
        if let Some(t) = self.tick_ms {
            config.tick_interval_ms = t;
        }
        if let Some(r) = self.rate_limit {
            config.rate_limit = Some(RateLimit {
                per_second: r,
                burst: r,
            });
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    // ── 1. Logging ────────────────────────────────────────────
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("tickrpc v{}", env!("CARGO_PKG_VERSION"));

    // ── 2. Configuration ──────────────────────────────────────
    let config = Args::parse().into_config()?;

    // ── 3. Catalogue + host ───────────────────────────────────
    let mut builder = CatalogueBuilder::<Universe>::new();
    services::register(&mut builder);
    let catalogue = builder.build().context("building catalogue")?;
    info!("Catalogue: {} procedures", catalogue.len());

    let mut server = Server::new(&config, catalogue, Universe::demo());

    // ── 4. Shutdown flag ──────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("Shutdown requested");
            shutdown.store(true, Ordering::Relaxed);
        })
        .context("installing Ctrl-C handler")?;
    }

    // ── 5. I/O thread ─────────────────────────────────────────
    let io = io_task::spawn(&config, server.registry().clone(), shutdown.clone())
        .context("starting I/O task")?;
    info!(
        "Listening: rpc={} stream={}",
        io.rpc_addr(),
        io.stream_addr()
    );

    // ── 6. Execution loop ─────────────────────────────────────
    server.run(&shutdown, |universe, dt| universe.advance(dt.as_secs_f64()));

    io.join().context("joining I/O task")?;
    info!("Bye");
    Ok(())
}
