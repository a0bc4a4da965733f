// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result, ensure};
use relay_core::{
    config::{Config, Role},
    dns::DnsResolver,
    listener::Listener,
    logging::init_logger,
};
use tokio_util::sync::CancellationToken;

fn resolve_config_path() -> Result<std::path::PathBuf> {
    let raw = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    std::fs::canonicalize(&raw).with_context(|| format!("config file not found: {raw}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = resolve_config_path().context("failed to resolve config path")?;
    let config = Config::load_from_file(&config_path).context("failed to load config")?;
    ensure!(config.role == Role::Server, "relay-server requires role: server in the config file");

    let _logger_guard = init_logger(config.verbose);

    let dns = DnsResolver::new();
    let listener = Listener::new(config, dns);
    let shutdown = CancellationToken::new();

    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c_shutdown.cancel();
    });

    listener.run(shutdown).await
}
