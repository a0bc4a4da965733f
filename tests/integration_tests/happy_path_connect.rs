// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Seed scenario 1 from spec.md §8: a plaintext CONNECT through the
//! client/server relay pair to a loopback echo server, OTA disabled.

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
async fn plaintext_connect_round_trips_through_both_relays() {
    let echo_port = spawn_echo_server().await;

    let server_port = free_port().await;
    let server_cfg = base_config(Role::Server, server_port);
    let (server_shutdown, _) = spawn_listener(server_cfg).await;

    let local_port = free_port().await;
    let mut local_cfg = base_config(Role::Local, server_port);
    local_cfg.local_port = local_port;
    let (local_shutdown, _) = spawn_listener(local_cfg).await;

    let mut sock = TcpStream::connect(("127.0.0.1", local_port)).await.expect("connect local");
    socks5_handshake(&mut sock).await;
    socks5_connect(&mut sock, echo_port).await;

    let payload = b"GET / HTTP/1.0\r\n\r\n";
    sock.write_all(payload).await.expect("write payload");

    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), sock.read_exact(&mut echoed))
        .await
        .expect("read did not time out")
        .expect("read echoed payload");
    assert_eq!(&echoed, payload);

    drop(sock);
    local_shutdown.cancel();
    server_shutdown.cancel();
}
