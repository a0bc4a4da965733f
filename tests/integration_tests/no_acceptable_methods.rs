// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Seed scenario 3 from spec.md §8: no acceptable SOCKS5 method offered.

use relay_core::config::Role;
use serial_test::serial;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::integration_tests::common::{base_config, free_port, spawn_listener};

#[serial]
#[tokio::test]
async fn no_acceptable_methods_replies_05ff_and_destroys() {
    let unused_server_port = free_port().await;
    let local_port = free_port().await;
    let mut local_cfg = base_config(Role::Local, unused_server_port);
    local_cfg.local_port = local_port;
    let (shutdown, _) = spawn_listener(local_cfg).await;

    let mut sock = TcpStream::connect(("127.0.0.1", local_port)).await.expect("connect local");
    // method 0x02 ("username/password") only, no NO AUTH offered.
    sock.write_all(&[0x05, 0x01, 0x02]).await.expect("write method select");

    let mut reply = [0u8; 2];
    sock.read_exact(&mut reply).await.expect("read method reply");
    assert_eq!(reply, [0x05, 0xFF]);

    // handler destroys the connection; a further read observes EOF.
    let mut trailing = [0u8; 1];
    let n = sock.read(&mut trailing).await.expect("read after destroy");
    assert_eq!(n, 0, "expected connection closed after 05 FF");

    shutdown.cancel();
}
