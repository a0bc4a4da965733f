// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashSet, fs, net::IpAddr, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

/// Which side of the tunnel this process runs as.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts local SOCKS5 connections and forwards encrypted traffic
    /// upstream.
    Local,
    /// Decrypts upstream traffic and proxies it to the ultimate
    /// destination.
    Server,
}

/// One or many addresses accepted for `server`/`server_port`; a list is
/// resolved to one entry chosen at random per connection (§9 "Random
/// upstream selection").
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn pick(&self) -> &T {
        match self {
            OneOrMany::One(v) => v,
            OneOrMany::Many(vs) => {
                #[allow(clippy::expect_used)]
                vs.choose(&mut rand::rng())
                    .expect("server list must not be empty")
            },
        }
    }
}

/// Stream cipher method used by [`crate::crypto::Cryptor`].
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CipherMethod {
    Aes256Ctr,
}

impl Default for CipherMethod {
    fn default() -> Self {
        CipherMethod::Aes256Ctr
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Role this process operates as.
    pub role: Role,

    /// Next-hop address (client role) or listen address (server role).
    /// May be a list; one entry is chosen at random per connection.
    pub server: OneOrMany<String>,
    /// Next-hop port (client role) or listen port (server role).
    pub server_port: OneOrMany<u16>,

    /// Listen address for client role. Ignored in server role.
    #[serde(default = "default_local_address")]
    pub local_address: String,
    /// Listen port for client role. Ignored in server role.
    #[serde(default = "default_local_port")]
    pub local_port: u16,

    /// Pre-shared secret passed to the [`crate::crypto::Cryptor`].
    pub password: String,
    /// Stream cipher method.
    #[serde(default)]
    pub method: CipherMethod,

    /// Require/enable one-time-auth framing.
    #[serde(default)]
    pub one_time_auth: bool,

    /// Attempt TCP Fast Open on the listener and on outbound connects.
    #[serde(default)]
    pub fast_open: bool,

    /// Idle-connection timeout, in seconds.
    #[serde(with = "serde_secs")]
    pub timeout: Duration,

    /// Destination IPs rejected at the CONNECTING stage.
    #[serde(default)]
    pub forbidden_ip: HashSet<IpAddr>,

    /// When set, client role skips SOCKS5 negotiation and tunnels all
    /// traffic to this fixed destination ("tunnel mode").
    #[serde(default)]
    pub tunnel_remote: Option<String>,
    #[serde(default)]
    pub tunnel_remote_port: Option<u16>,
    /// Listen port used for tunnel mode. Defaults to `local_port` when
    /// tunnel mode is active and this is unset.
    #[serde(default)]
    pub tunnel_port: Option<u16>,

    /// Verbose logging of exceptions (full anyhow chain vs one line).
    #[serde(default)]
    pub verbose: bool,
}

fn default_local_address() -> String {
    "127.0.0.1".to_string()
}

fn default_local_port() -> u16 {
    1080
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants the relay core depends on.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.password.is_empty(), "password must not be empty");

        if let OneOrMany::Many(v) = &self.server {
            ensure!(!v.is_empty(), "server list must not be empty");
        }
        if let OneOrMany::Many(v) = &self.server_port {
            ensure!(!v.is_empty(), "server_port list must not be empty");
        }

        if self.is_tunnel_mode() {
            ensure!(
                self.tunnel_remote_port.is_some(),
                "tunnel_remote_port is required when tunnel_remote is set"
            );
        }

        Ok(())
    }

    /// True when this (client-role) config should skip SOCKS5 negotiation
    /// entirely and tunnel to a fixed destination.
    pub fn is_tunnel_mode(&self) -> bool {
        self.role == Role::Local && self.tunnel_remote.is_some()
    }

    pub fn listen_port(&self) -> u16 {
        match self.role {
            Role::Local => self.tunnel_port.unwrap_or(self.local_port),
            Role::Server => *self.server_port.pick(),
        }
    }

    pub fn listen_address(&self) -> &str {
        match self.role {
            Role::Local => &self.local_address,
            Role::Server => match &self.server {
                OneOrMany::One(s) => s,
                OneOrMany::Many(v) => &v[0],
            },
        }
    }
}

/// Serde helper representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
