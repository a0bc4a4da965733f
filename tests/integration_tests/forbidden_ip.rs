// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Seed scenario 6 from spec.md §8: a destination resolving to a forbidden
//! IP is rejected at CONNECTING, after the fixed reply has already gone
//! out but before any remote socket is opened.

use std::time::Duration;

use relay_core::config::Role;
use serial_test::serial;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::integration_tests::common::{
    base_config, free_port, loopback, socks5_connect, socks5_handshake, spawn_listener,
};

#[serial]
#[tokio::test]
async fn forbidden_destination_is_rejected_at_connecting() {
    let unused_server_port = free_port().await;
    let local_port = free_port().await;
    let mut local_cfg = base_config(Role::Local, unused_server_port);
    local_cfg.local_port = local_port;
    local_cfg.forbidden_ip.insert(loopback());
    let (shutdown, _) = spawn_listener(local_cfg).await;

    let mut sock = TcpStream::connect(("127.0.0.1", local_port)).await.expect("connect local");
    socks5_handshake(&mut sock).await;
    // Any loopback destination port is forbidden by IP, regardless of
    // whether anything is actually listening there.
    socks5_connect(&mut sock, free_port().await).await;

    sock.write_all(b"should never reach a remote socket").await.expect("write payload");

    let mut trailing = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), sock.read(&mut trailing))
        .await
        .expect("read did not time out")
        .expect("read after destroy");
    assert_eq!(n, 0, "expected connection closed after forbidden destination");

    shutdown.cancel();
}
