// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Logging setup, scaled down from the teacher's span-capturing JSON
//! formatter to plain `fmt` output — this crate's log lines (`warn!("...
//! timed out: {addr}")`, per-port spans, etc.) don't need the bespoke
//! formatter, just `tracing` wired to stdout with an `EnvFilter`.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt};

/// Initializes the global subscriber. `verbose` raises the default level
/// from `info` to `debug` when `RUST_LOG` is unset. The returned guard must
/// be kept alive for the process lifetime — dropping it stops the
/// non-blocking writer from flushing.
pub fn init_logger(verbose: bool) -> WorkerGuard {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .init();
    guard
}
