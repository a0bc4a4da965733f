// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `ConnectionHandler`: the per-connection state machine, the ~65% of this
//! crate spec.md §2 calls out as the hard part. One instance per accepted
//! connection, expressed as a single Tokio task per Design Notes §9 rather
//! than callbacks registered against a hand-rolled reactor.

use std::{net::IpAddr, sync::Arc};

use bytes::{Buf, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, warn};

use crate::{
    config::{Config, Role},
    crypto::Cryptor,
    dns::DnsResolver,
    error::RelayError,
    ota::{self, Reassembler},
    socks5::{self, Destination, Request},
};

const READ_BUF_SIZE: usize = 16 * 1024;
/// Cap on how many raw bytes an ADDR-stage header parse will buffer before
/// giving up and destroying the connection — guards against a peer that
/// never completes a header.
const MAX_HEADER_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Addr,
    UdpAssoc,
    Dns,
    Connecting,
    Stream,
    Destroyed,
}

/// Activity/lifecycle notifications sent from a handler task to the
/// `Listener` task that owns the shared `TimeoutSweeper` — keeps the
/// sweeper's mutation single-owned (§5) without locking across tasks.
pub enum HandlerEvent {
    Activity { id: u64, bytes: usize },
    Removed { id: u64 },
}

pub struct ConnectionHandler {
    id: u64,
    role: Role,
    stage: Stage,
    local: TcpStream,
    remote: Option<TcpStream>,
    out_to_local: BytesMut,
    out_to_remote: BytesMut,

    crypto: Cryptor,
    cipher_iv_sent: bool,
    pending_iv_buf: Vec<u8>,

    ota_configured: bool,
    ota_enabled_session: bool,
    ota_reasm: Option<Reassembler>,
    ota_chunk_out: u32,

    remote_address: Option<(String, u16)>,
    next_hop: Option<(String, u16)>,
    next_hop_ip: Option<IpAddr>,

    config: Arc<Config>,
    dns: DnsResolver,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<HandlerEvent>,
    listen_port: u16,
    stat_cb: Option<Arc<dyn Fn(u16, usize) + Send + Sync>>,
}

impl ConnectionHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        local: TcpStream,
        config: Arc<Config>,
        dns: DnsResolver,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<HandlerEvent>,
        listen_port: u16,
        stat_cb: Option<Arc<dyn Fn(u16, usize) + Send + Sync>>,
    ) -> Self {
        let ota_configured = config.one_time_auth;
        let crypto = Cryptor::new(config.password.as_bytes());
        ConnectionHandler {
            id,
            role: config.role,
            stage: Stage::Init,
            local,
            remote: None,
            out_to_local: BytesMut::new(),
            out_to_remote: BytesMut::new(),
            crypto,
            cipher_iv_sent: false,
            pending_iv_buf: Vec::with_capacity(16),
            ota_configured,
            ota_enabled_session: false,
            ota_reasm: None,
            ota_chunk_out: 0,
            remote_address: None,
            next_hop: None,
            next_hop_ip: None,
            config,
            dns,
            cancel,
            events,
            listen_port,
            stat_cb,
        }
    }

    /// Runs the connection to completion, guaranteeing `destroy()` runs
    /// exactly once on the way out regardless of how the state machine
    /// ends — the task-form equivalent of "errors never propagate past
    /// `handle_event` without teardown".
    pub async fn run(mut self) {
        let span = Span::current();
        let result = async {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => Err(RelayError::TimedOut),
                res = self.drive() => res,
            }
        }
        .instrument(span)
        .await;

        if let Err(err) = &result {
            self.log_error(err);
        }
        self.destroy().await;
    }

    fn log_error(&self, err: &RelayError) {
        if matches!(err, RelayError::TimedOut) {
            let remote = self
                .remote_address
                .as_ref()
                .map(|(h, p)| format!("{h}:{p}"))
                .unwrap_or_else(|| "unknown".to_string());
            warn!(remote = %remote, "connection timed out");
            return;
        }
        if self.config.verbose {
            warn!("connection failed: {err:#}");
        } else {
            warn!("connection failed: {err}");
        }
    }

    async fn drive(&mut self) -> Result<(), RelayError> {
        if self.role == Role::Local && !self.config.is_tunnel_mode() {
            self.handle_init().await?;
        }
        self.stage = Stage::Addr;
        self.handle_addr().await?;

        if self.stage == Stage::UdpAssoc {
            self.hold_udp_assoc().await?;
            return Ok(());
        }

        self.stage = Stage::Dns;
        self.handle_dns().await?;

        self.stage = Stage::Connecting;
        self.handle_connecting().await?;

        self.stage = Stage::Stream;
        self.stream_loop().await
    }

    // ---- INIT --------------------------------------------------------

    async fn handle_init(&mut self) -> Result<(), RelayError> {
        let mut prefix = [0u8; 2];
        self.local.read_exact(&mut prefix).await?;
        let nmethods = prefix[1] as usize;
        let mut body = vec![0u8; nmethods];
        self.local.read_exact(&mut body).await?;

        let mut full = Vec::with_capacity(2 + nmethods);
        full.extend_from_slice(&prefix);
        full.extend_from_slice(&body);

        match socks5::parse_method_selection(&full) {
            Ok(()) => {
                self.local.write_all(&socks5::METHOD_REPLY_NO_AUTH).await?;
                Ok(())
            },
            Err(e @ crate::error::SocksError::NoAcceptableMethods) => {
                self.local
                    .write_all(&socks5::METHOD_REPLY_NONE_ACCEPTABLE)
                    .await?;
                Err(e.into())
            },
            Err(e) => Err(e.into()),
        }
    }

    // ---- ADDR ----------------------------------------------------------

    async fn handle_addr(&mut self) -> Result<(), RelayError> {
        match self.role {
            Role::Local if self.config.is_tunnel_mode() => self.handle_addr_tunnel(),
            Role::Local => self.handle_addr_client().await,
            Role::Server => self.handle_addr_server().await,
        }
    }

    fn handle_addr_tunnel(&mut self) -> Result<(), RelayError> {
        #[allow(clippy::expect_used)]
        let host = self
            .config
            .tunnel_remote
            .clone()
            .expect("validated at config load");
        #[allow(clippy::expect_used)]
        let port = self
            .config
            .tunnel_remote_port
            .expect("validated at config load");
        self.remote_address = Some((host.clone(), port));
        self.ota_enabled_session = self.ota_configured;

        let dest = parse_literal_or_domain(&host);
        let header = socks5::encode_request_header(&dest, port, self.ota_enabled_session);
        self.queue_client_header(&header);
        self.set_next_hop_from_config();
        Ok(())
    }

    async fn handle_addr_client(&mut self) -> Result<(), RelayError> {
        let mut prefix = [0u8; 3];
        self.local.read_exact(&mut prefix).await?;
        let cmd = prefix[1];

        let mut atyp_byte = [0u8; 1];
        self.local.read_exact(&mut atyp_byte).await?;
        let req = self.read_client_request_tail(cmd, atyp_byte[0]).await?;

        match req.cmd {
            socks5::CMD_UDP_ASSOCIATE => {
                let bound = self.local.local_addr()?;
                let reply = socks5::udp_associate_reply(bound);
                self.local.write_all(&reply).await?;
                self.stage = Stage::UdpAssoc;
                Ok(())
            },
            socks5::CMD_CONNECT => {
                self.remote_address = Some((req.dest.host_for_resolution(), req.port));
                self.ota_enabled_session = self.ota_configured;

                let header =
                    socks5::encode_request_header(&req.dest, req.port, self.ota_enabled_session);
                self.queue_client_header(&header);
                self.set_next_hop_from_config();

                self.local.write_all(&socks5::CONNECT_REPLY_OK).await?;
                Ok(())
            },
            other => Err(crate::error::SocksError::UnknownCommand(other).into()),
        }
    }

    /// Reads the variable-length remainder of a client request (address +
    /// port) given the already-read `ATYP` byte.
    async fn read_client_request_tail(
        &mut self,
        cmd: u8,
        atyp_byte: u8,
    ) -> Result<Request, RelayError> {
        let atyp = atyp_byte & !socks5::ATYP_OTA_FLAG;
        let addr_len = match atyp {
            socks5::ATYP_IPV4 => 4,
            socks5::ATYP_IPV6 => 16,
            socks5::ATYP_DOMAIN => {
                let mut len_byte = [0u8; 1];
                self.local.read_exact(&mut len_byte).await?;
                let mut buf = vec![atyp_byte, len_byte[0]];
                let mut name = vec![0u8; len_byte[0] as usize];
                self.local.read_exact(&mut name).await?;
                buf.extend_from_slice(&name);
                let mut port = [0u8; 2];
                self.local.read_exact(&mut port).await?;
                buf.extend_from_slice(&port);
                return socks5::parse_request_header(cmd, &buf)
                    .map_err(RelayError::from);
            },
            other => return Err(crate::error::SocksError::UnsupportedAddressType(other).into()),
        };
        let mut rest = vec![0u8; addr_len + 2];
        self.local.read_exact(&mut rest).await?;
        let mut buf = Vec::with_capacity(1 + rest.len());
        buf.push(atyp_byte);
        buf.extend_from_slice(&rest);
        socks5::parse_request_header(cmd, &buf).map_err(RelayError::from)
    }

    /// Queues the request header (with session IV prefix and, if
    /// configured, the OTA header MAC) onto `out_to_remote`. Runs at ADDR
    /// time, before the remote socket exists — drained once CONNECTING
    /// completes.
    fn queue_client_header(&mut self, header: &[u8]) {
        let mut framed = header.to_vec();
        if self.ota_enabled_session {
            let mac = ota::header_mac(self.crypto.cipher_iv(), self.crypto.key(), header);
            framed.extend_from_slice(&mac);
        }
        self.crypto.encrypt(&mut framed);
        self.out_to_remote.extend_from_slice(self.crypto.cipher_iv());
        self.cipher_iv_sent = true;
        self.out_to_remote.extend_from_slice(&framed);
    }

    fn set_next_hop_from_config(&mut self) {
        let host = self.config.server.pick().clone();
        let port = *self.config.server_port.pick();
        self.next_hop = Some((host, port));
    }

    async fn handle_addr_server(&mut self) -> Result<(), RelayError> {
        let mut iv = vec![0u8; 16];
        self.local.read_exact(&mut iv).await?;
        self.crypto.set_decipher_iv(&iv).map_err(|_| {
            RelayError::from(crate::error::SocksError::MalformedHeader)
        })?;

        let mut hdr_buf: Vec<u8> = Vec::new();
        let (dest, port, header_len, ota_bit) = loop {
            match socks5::parse_request_header(socks5::CMD_CONNECT, &hdr_buf) {
                Ok(req) => break (req.dest, req.port, req.header_len, req.ota),
                Err(crate::error::SocksError::MalformedHeader)
                | Err(crate::error::SocksError::UnsupportedAddressType(_))
                    if hdr_buf.len() < MAX_HEADER_BYTES =>
                {
                    let mut tmp = [0u8; 64];
                    let n = self.local.read(&mut tmp).await?;
                    if n == 0 {
                        return Err(RelayError::PeerClosed);
                    }
                    let mut chunk = tmp[..n].to_vec();
                    self.crypto.decrypt(&mut chunk).map_err(|_| {
                        RelayError::from(crate::error::SocksError::MalformedHeader)
                    })?;
                    hdr_buf.extend_from_slice(&chunk);
                },
                Err(e) => return Err(e.into()),
            }
        };

        if ota_bit {
            while hdr_buf.len() < header_len + ota::MAC_LEN {
                let mut tmp = [0u8; 64];
                let n = self.local.read(&mut tmp).await?;
                if n == 0 {
                    return Err(RelayError::PeerClosed);
                }
                let mut chunk = tmp[..n].to_vec();
                self.crypto.decrypt(&mut chunk).map_err(|_| {
                    RelayError::from(crate::error::SocksError::MalformedHeader)
                })?;
                hdr_buf.extend_from_slice(&chunk);
            }
            let mac = hdr_buf[header_len..header_len + ota::MAC_LEN].to_vec();
            if !ota::verify_header_mac(
                self.crypto.decipher_iv(),
                self.crypto.key(),
                &hdr_buf[..header_len],
                &mac,
            ) {
                warn!("one time auth header verification failed");
                return Err(crate::error::OtaError::VerificationFailed.into());
            }
            self.ota_enabled_session = true;
            self.ota_reasm = Some(Reassembler::new(self.crypto.decipher_iv().to_vec()));
        } else if self.ota_configured {
            // server requires OTA but client didn't set the bit: the
            // Python source silently ignores the session rather than
            // destroying it — preserved per SPEC_FULL.md §9.
            warn!("one time auth required but not negotiated by peer, ignoring session");
            self.stage = Stage::UdpAssoc; // reuse as an inert "parked" stage
            return Ok(());
        }

        self.remote_address = Some((dest.host_for_resolution(), port));
        self.next_hop = Some((dest.host_for_resolution(), port));
        Ok(())
    }

    // ---- UDP_ASSOC ------------------------------------------------------

    async fn hold_udp_assoc(&mut self) -> Result<(), RelayError> {
        let mut buf = [0u8; 1024];
        loop {
            let n = self.local.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
        }
    }

    // ---- DNS -------------------------------------------------------------

    async fn handle_dns(&mut self) -> Result<(), RelayError> {
        #[allow(clippy::expect_used)]
        let (host, port) = self.next_hop.clone().expect("set during ADDR");
        let pending = self.dns.resolve(host.clone(), port);
        let ip = pending
            .await_result()
            .await
            .map_err(|source| RelayError::Dns {
                host,
                source: std::io::Error::other(source.to_string()),
            })?;
        self.next_hop_ip = Some(ip);
        Ok(())
    }

    // ---- CONNECTING --------------------------------------------------------

    async fn handle_connecting(&mut self) -> Result<(), RelayError> {
        #[allow(clippy::expect_used)]
        let ip = self.next_hop_ip.expect("set during DNS");

        if self.config.forbidden_ip.contains(&ip) {
            return Err(RelayError::ForbiddenDestination(ip));
        }

        #[allow(clippy::expect_used)]
        let (_, port) = self.next_hop.clone().expect("set during ADDR/DNS");
        let sock_addr = std::net::SocketAddr::new(ip, port);

        let socket =
            crate::net::new_connect_socket(sock_addr, self.config.fast_open).map_err(
                |e| match e {
                    crate::net::ConnectSocketError::FastOpenUnsupported => {
                        RelayError::FastOpenUnsupported
                    }
                    crate::net::ConnectSocketError::Io(e) => RelayError::Io(e),
                },
            )?;
        let stream = socket.connect(sock_addr).await?;
        stream.set_nodelay(true)?;

        self.remote = Some(stream);
        Ok(())
    }

    // ---- STREAM --------------------------------------------------------

    async fn stream_loop(&mut self) -> Result<(), RelayError> {
        self.flush_remote_buffer().await?;
        loop {
            #[allow(clippy::expect_used)]
            let remote_readable = {
                let remote = self.remote.as_ref().expect("set at CONNECTING");
                remote.readable()
            };
            let want_write_remote = !self.out_to_remote.is_empty();
            let want_write_local = !self.out_to_local.is_empty();

            tokio::select! {
                biased;
                res = remote_readable => {
                    res?;
                    if !self.try_read_remote()? {
                        return Ok(());
                    }
                },
                res = self.remote_writable(), if want_write_remote => {
                    res?;
                    self.try_write_remote()?;
                },
                res = self.local.readable() => {
                    res?;
                    if !self.try_read_local()? {
                        return Ok(());
                    }
                },
                res = self.local.writable(), if want_write_local => {
                    res?;
                    self.try_write_local()?;
                },
            }
        }
    }

    async fn remote_writable(&self) -> std::io::Result<()> {
        #[allow(clippy::expect_used)]
        self.remote.as_ref().expect("set at CONNECTING").writable().await
    }

    async fn flush_remote_buffer(&mut self) -> Result<(), RelayError> {
        while !self.out_to_remote.is_empty() {
            #[allow(clippy::expect_used)]
            self.remote.as_ref().expect("set at CONNECTING").writable().await?;
            self.try_write_remote()?;
        }
        Ok(())
    }

    /// Returns `false` on clean EOF (caller should end the stream loop),
    /// `true` otherwise.
    fn try_read_local(&mut self) -> Result<bool, RelayError> {
        let mut buf = [0u8; READ_BUF_SIZE];
        #[allow(clippy::expect_used)]
        let n = match self.local.try_read(&mut buf) {
            Ok(0) => return Ok(false),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let mut chunk = buf[..n].to_vec();

        match self.role {
            Role::Local => {
                self.crypto.encrypt(&mut chunk);
                if self.ota_enabled_session {
                    let framed = ota::frame_chunk(self.crypto.cipher_iv(), self.ota_chunk_out, &chunk);
                    self.ota_chunk_out = self.ota_chunk_out.wrapping_add(1);
                    self.out_to_remote.extend_from_slice(&framed);
                } else {
                    self.out_to_remote.extend_from_slice(&chunk);
                }
            },
            Role::Server => {
                self.crypto.decrypt(&mut chunk).map_err(|_| RelayError::PeerClosed)?;
                if let Some(reasm) = self.ota_reasm.as_mut() {
                    let delivered = reasm
                        .feed(&chunk)
                        .map_err(crate::error::RelayError::from)?;
                    for d in delivered {
                        match d {
                            ota::Delivered::Chunk(payload) => {
                                self.out_to_remote.extend_from_slice(&payload);
                            },
                            ota::Delivered::BadMac => {
                                warn!("ota chunk verification failed, dropping chunk");
                            },
                        }
                    }
                } else {
                    self.out_to_remote.extend_from_slice(&chunk);
                }
            },
        }
        self.report_activity(n);
        Ok(true)
    }

    fn try_read_remote(&mut self) -> Result<bool, RelayError> {
        let mut buf = [0u8; READ_BUF_SIZE];
        #[allow(clippy::expect_used)]
        let remote = self.remote.as_mut().expect("set at CONNECTING");
        let n = match remote.try_read(&mut buf) {
            Ok(0) => return Ok(false),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let mut data = &buf[..n];

        match self.role {
            Role::Local => {
                if !self.crypto_decipher_ready() {
                    let need = 16 - self.pending_iv_buf.len();
                    let take = need.min(data.len());
                    self.pending_iv_buf.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if self.pending_iv_buf.len() < 16 {
                        return Ok(true);
                    }
                    self.crypto
                        .set_decipher_iv(&self.pending_iv_buf)
                        .map_err(|_| RelayError::PeerClosed)?;
                }
                let mut chunk = data.to_vec();
                self.crypto.decrypt(&mut chunk).map_err(|_| RelayError::PeerClosed)?;
                self.out_to_local.extend_from_slice(&chunk);
            },
            Role::Server => {
                let mut chunk = data.to_vec();
                self.crypto.encrypt(&mut chunk);
                if !self.cipher_iv_sent {
                    self.out_to_local.extend_from_slice(self.crypto.cipher_iv());
                    self.cipher_iv_sent = true;
                }
                self.out_to_local.extend_from_slice(&chunk);
            },
        }
        self.report_activity(n);
        Ok(true)
    }

    fn crypto_decipher_ready(&self) -> bool {
        self.pending_iv_buf.len() >= 16 || self.role == Role::Server
    }

    fn try_write_local(&mut self) -> Result<(), RelayError> {
        self.try_write(false)
    }

    fn try_write_remote(&mut self) -> Result<(), RelayError> {
        self.try_write(true)
    }

    fn try_write(&mut self, to_remote: bool) -> Result<(), RelayError> {
        let buf = if to_remote { &mut self.out_to_remote } else { &mut self.out_to_local };
        if buf.is_empty() {
            return Ok(());
        }
        let result = if to_remote {
            #[allow(clippy::expect_used)]
            self.remote.as_ref().expect("set at CONNECTING").try_write(&buf[..])
        } else {
            self.local.try_write(&buf[..])
        };
        match result {
            Ok(n) => {
                buf.advance(n);
                Ok(())
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn report_activity(&self, bytes: usize) {
        let _ = self.events.send(HandlerEvent::Activity { id: self.id, bytes });
        if bytes > 0 {
            if let Some(cb) = &self.stat_cb {
                cb(self.listen_port, bytes);
            }
        }
    }

    /// Idempotent teardown: transitions to DESTROYED first so re-entrant
    /// dispatch short-circuits, then tears down both sockets and
    /// unregisters from the listener's timeout queue.
    async fn destroy(&mut self) {
        if self.stage == Stage::Destroyed {
            return;
        }
        self.stage = Stage::Destroyed;
        let _ = self.local.shutdown().await;
        if let Some(remote) = self.remote.as_mut() {
            let _ = remote.shutdown().await;
        }
        let _ = self.events.send(HandlerEvent::Removed { id: self.id });
        debug!(id = self.id, "handler destroyed");
    }
}

fn parse_literal_or_domain(host: &str) -> Destination {
    if let Ok(ip) = host.parse::<IpAddr>() {
        Destination::Ip(ip)
    } else {
        Destination::Domain(host.to_string())
    }
}
