// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Seed scenario 2 from spec.md §8: UDP ASSOCIATE is acknowledged with the
//! relay's own bound address/port and never opens a remote socket.

use relay_core::config::Role;
use serial_test::serial;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::integration_tests::common::{base_config, free_port, socks5_handshake, spawn_listener};

#[serial]
#[tokio::test]
async fn udp_associate_acks_with_bound_address_and_holds_connection() {
    // No server relay is started: CMD_UDP_ASSOCIATE must never attempt to
    // reach it, so an unreachable next hop is fine.
    let unused_server_port = free_port().await;
    let local_port = free_port().await;
    let mut local_cfg = base_config(Role::Local, unused_server_port);
    local_cfg.local_port = local_port;
    let (local_shutdown, _) = spawn_listener(local_cfg).await;

    let mut sock = TcpStream::connect(("127.0.0.1", local_port)).await.expect("connect local");
    socks5_handshake(&mut sock).await;

    sock.write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .expect("write udp associate request");

    let mut reply = [0u8; 10];
    sock.read_exact(&mut reply).await.expect("read udp associate reply");
    assert_eq!(&reply[..4], [0x05, 0x00, 0x00, 0x01]);
    assert_eq!(&reply[4..8], [127, 0, 0, 1]);
    assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), local_port);

    // Further local bytes must not create a remote socket or error out;
    // the connection is simply held open until the client disconnects.
    sock.write_all(b"ignored udp-associate payload").await.expect("write ignored payload");

    drop(sock);
    local_shutdown.cancel();
}
