// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Asynchronous resolver matching the `resolve(hostname, callback)` /
//! `remove_callback(identity)` contract spec.md §6 describes for
//! "DNSResolver", implemented over `tokio::net::lookup_host` plus a spawned
//! task rather than a registered reactor callback.
//!
//! A `ConnectionHandler` running as a single task has no need for a real
//! callback registry: it simply `.await`s [`DnsResolver::resolve`]. The
//! `remove_callback` half of the contract is kept as a cancellation handle
//! so that `destroy()` can drop an in-flight resolution exactly the way the
//! spec's "cancel the pending DNS callback registration by identity"
//! requires.

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result, anyhow};
use tokio::task::JoinHandle;

/// A pending resolution; dropping or calling [`PendingResolution::cancel`]
/// aborts the underlying task, mirroring `remove_callback`'s idempotent
/// cancel-by-identity.
pub struct PendingResolution {
    handle: Option<JoinHandle<std::io::Result<Vec<SocketAddr>>>>,
}

impl Drop for PendingResolution {
    /// Aborts the lookup task if it is still running. This is what makes
    /// dropping a handler mid-resolution (e.g. on idle-timeout
    /// cancellation) equivalent to `remove_callback` in spec.md §6's
    /// DNSResolver contract.
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl PendingResolution {
    pub fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub async fn await_result(mut self) -> Result<IpAddr> {
        let handle = self.handle.take().context("resolution already consumed")?;
        let addrs = handle.await.context("dns task panicked or was cancelled")??;
        addrs
            .first()
            .map(|sa| sa.ip())
            .ok_or_else(|| anyhow!("empty resolution result"))
    }
}

/// Resolver handle; cheap to clone, holds no state of its own beyond what
/// `tokio::net::lookup_host` itself caches.
#[derive(Clone, Default)]
pub struct DnsResolver;

impl DnsResolver {
    pub fn new() -> Self {
        DnsResolver
    }

    /// Begins resolving `host:port`. The returned [`PendingResolution`]
    /// resolves to the first address tokio's resolver returns, matching the
    /// "first result wins" behavior of the Python's `getaddrinfo` usage.
    pub fn resolve(&self, host: String, port: u16) -> PendingResolution {
        let handle = tokio::spawn(async move {
            tokio::net::lookup_host((host.as_str(), port))
                .await
                .map(|it| it.collect::<Vec<_>>())
        });
        PendingResolution { handle: Some(handle) }
    }
}
