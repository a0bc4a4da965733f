// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Seed scenario 4 from spec.md §8: a server relay sees an OTA-tagged
//! header whose trailing MAC is corrupted and must destroy the connection
//! before ever opening a remote socket — verified here by hand-building
//! the wire bytes a real client relay would have sent.

use std::time::Duration;

use relay_core::{
    config::Role,
    crypto::Cryptor,
    ota,
    socks5::{self, Destination},
};
use serial_test::serial;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::integration_tests::common::{base_config, free_port, spawn_listener, PASSWORD};

#[serial]
#[tokio::test]
async fn corrupted_ota_header_mac_destroys_before_connecting() {
    let server_port = free_port().await;
    let mut server_cfg = base_config(Role::Server, server_port);
    server_cfg.one_time_auth = true;
    let (shutdown, _) = spawn_listener(server_cfg).await;

    let mut client_crypto = Cryptor::new(PASSWORD.as_bytes());
    let header =
        socks5::encode_request_header(&Destination::Domain("example.com".to_string()), 80, true);
    let bad_mac = [0u8; ota::MAC_LEN];
    let mut framed = header.clone();
    framed.extend_from_slice(&bad_mac);
    client_crypto.encrypt(&mut framed);

    let mut sock =
        TcpStream::connect(("127.0.0.1", server_port)).await.expect("connect server relay");
    sock.write_all(client_crypto.cipher_iv()).await.expect("write iv");
    sock.write_all(&framed).await.expect("write framed header");

    let mut trailing = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), sock.read(&mut trailing))
        .await
        .expect("read did not time out")
        .expect("read after destroy");
    assert_eq!(n, 0, "expected connection closed after failed OTA header verification");

    shutdown.cancel();
}
