// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashSet, net::IpAddr, time::Duration};

use relay_core::{
    config::{CipherMethod, Config, OneOrMany, Role},
    dns::DnsResolver,
    listener::Listener,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

/// Binds an ephemeral port and hands it back free, the standard
/// bind-then-drop trick for picking an unused loopback port in tests.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral");
    listener.local_addr().expect("local_addr").port()
}

pub const PASSWORD: &str = "integration-test-password";

pub fn base_config(role: Role, server_port: u16) -> Config {
    let mut cfg = Config {
        role,
        server: OneOrMany::One("127.0.0.1".to_string()),
        server_port: OneOrMany::One(server_port),
        local_address: "127.0.0.1".to_string(),
        local_port: 0,
        password: PASSWORD.to_string(),
        method: CipherMethod::Aes256Ctr,
        one_time_auth: false,
        fast_open: false,
        timeout: Duration::from_secs(30),
        forbidden_ip: HashSet::new(),
        tunnel_remote: None,
        tunnel_remote_port: None,
        tunnel_port: None,
        verbose: true,
    };
    cfg.validate_and_normalize().expect("valid test config");
    cfg
}

/// Spawns a `Listener` bound per `cfg`'s role, returning its shutdown token
/// and the port it ended up listening on. Callers cancel the token to drain
/// the listener at the end of a test.
pub async fn spawn_listener(cfg: Config) -> (CancellationToken, u16) {
    let port = cfg.listen_port();
    let shutdown = CancellationToken::new();
    let dns = DnsResolver::new();
    let listener = Listener::new(cfg, dns);
    let task_shutdown = shutdown.clone();
    tokio::spawn(async move {
        listener.run(task_shutdown).await.expect("listener run");
    });
    // give the accept loop a moment to bind before the caller connects.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (shutdown, port)
}

/// A minimal TCP echo server standing in for "the ultimate destination".
pub async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let port = listener.local_addr().expect("local_addr").port();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        },
                    }
                }
            });
        }
    });
    port
}

/// Connects to the local relay's SOCKS5 port and drives the method
/// selection handshake, expecting `NO AUTH` to be accepted.
pub async fn socks5_handshake(sock: &mut TcpStream) {
    sock.write_all(&[0x05, 0x01, 0x00]).await.expect("write method select");
    let mut reply = [0u8; 2];
    sock.read_exact(&mut reply).await.expect("read method reply");
    assert_eq!(reply, [0x05, 0x00], "expected NO AUTH accepted");
}

/// Sends a CONNECT request for an IPv4 destination and reads the fixed
/// success reply.
pub async fn socks5_connect(sock: &mut TcpStream, dest_port: u16) {
    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    req.extend_from_slice(&[127, 0, 0, 1]);
    req.extend_from_slice(&dest_port.to_be_bytes());
    sock.write_all(&req).await.expect("write connect request");

    let mut reply = [0u8; 10];
    sock.read_exact(&mut reply).await.expect("read connect reply");
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0x10, 0x10]);
}

pub fn loopback() -> IpAddr {
    "127.0.0.1".parse().expect("loopback parses")
}
