// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end round trip with one-time-auth framing enabled on both
//! relays (spec.md §4.2/§6): the header MAC and per-chunk MACs must
//! verify transparently to the application payload.

use std::time::Duration;

use relay_core::config::Role;
use serial_test::serial;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::integration_tests::common::{
    base_config, free_port, socks5_connect, socks5_handshake, spawn_echo_server, spawn_listener,
};

#[serial]
#[tokio::test]
async fn ota_enabled_round_trips_multiple_chunks() {
    let echo_port = spawn_echo_server().await;

    let server_port = free_port().await;
    let mut server_cfg = base_config(Role::Server, server_port);
    server_cfg.one_time_auth = true;
    let (server_shutdown, _) = spawn_listener(server_cfg).await;

    let local_port = free_port().await;
    let mut local_cfg = base_config(Role::Local, server_port);
    local_cfg.local_port = local_port;
    local_cfg.one_time_auth = true;
    let (local_shutdown, _) = spawn_listener(local_cfg).await;

    let mut sock = TcpStream::connect(("127.0.0.1", local_port)).await.expect("connect local");
    socks5_handshake(&mut sock).await;
    socks5_connect(&mut sock, echo_port).await;

    for chunk in [&b"first chunk"[..], &b"second chunk"[..], &b"third"[..]] {
        sock.write_all(chunk).await.expect("write chunk");
        let mut echoed = vec![0u8; chunk.len()];
        tokio::time::timeout(Duration::from_secs(5), sock.read_exact(&mut echoed))
            .await
            .expect("read did not time out")
            .expect("read echoed chunk");
        assert_eq!(echoed, chunk);
    }

    drop(sock);
    local_shutdown.cancel();
    server_shutdown.cancel();
}
