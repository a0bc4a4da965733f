// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `Listener`: owns the bound server socket, the fd/handler bookkeeping
//! table, and drives the `TimeoutSweeper` tick — spec.md §4.3/§4.4.
//!
//! Per §5's single-owner/no-lock concurrency model, the `TimeoutSweeper`
//! lives exclusively inside this struct's own accept loop; handler tasks
//! report activity over an `mpsc` channel instead of touching it directly.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    config::Config,
    dns::DnsResolver,
    handler::{ConnectionHandler, HandlerEvent},
    net::bind_listener,
    timeout::TimeoutSweeper,
};

const LISTEN_BACKLOG: u32 = 1024;

pub type StatCallback = Arc<dyn Fn(u16, usize) + Send + Sync>;

pub struct Listener {
    config: Arc<Config>,
    dns: DnsResolver,
    stat_cb: Option<StatCallback>,
}

impl Listener {
    pub fn new(config: Config, dns: DnsResolver) -> Self {
        Listener { config: Arc::new(config), dns, stat_cb: None }
    }

    /// Registers a per-`(listen_port, bytes)` stat hook invoked whenever a
    /// handler moves bytes, mirroring the Python's `stat_callback` — see
    /// SPEC_FULL.md §9.1.
    pub fn with_stat_callback(mut self, cb: StatCallback) -> Self {
        self.stat_cb = Some(cb);
        self
    }

    /// Binds and runs the accept loop to completion (i.e. until
    /// `shutdown` is signalled and every handler has drained). Backlog
    /// fixed at 1024 per spec.md §4.3.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listen_port = self.config.listen_port();
        let addr: SocketAddr = format!("{}:{}", self.config.listen_address(), listen_port)
            .parse()
            .context("invalid listen address")?;

        let listener = bind_listener(addr, LISTEN_BACKLOG, self.config.fast_open)
            .context("failed to bind listener")?;
        info!(%addr, role = ?self.config.role, "listening");

        let fd_table: DashMap<u64, CancellationToken> = DashMap::new();
        let mut sweeper: TimeoutSweeper<u64, CancellationToken> =
            TimeoutSweeper::new(self.config.timeout);
        let next_id = AtomicU64::new(0);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<HandlerEvent>();
        let mut tick = tokio::time::interval(crate::timeout::TIMEOUT_PRECISION);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!("listener shutting down");
                    break;
                },
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) if is_transient_accept_error(&e) => continue,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        },
                    };
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    let cancel = CancellationToken::new();
                    fd_table.insert(id, cancel.clone());
                    sweeper.update_activity(id, cancel.clone(), Instant::now());

                    let handler = ConnectionHandler::new(
                        id,
                        stream,
                        Arc::clone(&self.config),
                        self.dns.clone(),
                        cancel,
                        events_tx.clone(),
                        listen_port,
                        self.stat_cb.clone(),
                    );
                    let span = info_span!("conn", port = listen_port, id, peer = %peer);
                    tokio::spawn(
                        async move {
                            handler.run().await;
                        }
                        .instrument(span),
                    );
                },
                Some(event) = events_rx.recv() => {
                    match event {
                        HandlerEvent::Activity { id, bytes } => {
                            if let Some(token) = fd_table.get(&id).map(|e| e.value().clone()) {
                                sweeper.update_activity(id, token, Instant::now());
                            }
                            let _ = bytes;
                        },
                        HandlerEvent::Removed { id } => {
                            fd_table.remove(&id);
                            sweeper.remove(&id);
                        },
                    }
                },
                _ = tick.tick() => {
                    let expired = sweeper.sweep(Instant::now());
                    for token in expired {
                        token.cancel();
                    }
                },
            }
        }

        // Two-phase close (spec.md §4.3): stop accepting immediately (the
        // `listener` binding is dropped when this function returns), then
        // cancel every live handler and wait for them to drain.
        for entry in fd_table.iter() {
            entry.value().cancel();
        }
        while !fd_table.is_empty() {
            if let Some(event) = events_rx.recv().await {
                if let HandlerEvent::Removed { id } = event {
                    fd_table.remove(&id);
                }
            } else {
                break;
            }
        }
        debug!("listener drained, all handlers destroyed");
        Ok(())
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}
