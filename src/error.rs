// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Failures while parsing the client-facing SOCKS5 handshake and request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SocksError {
    #[error("method selection header too short")]
    MethodHeaderTooShort,
    #[error("unsupported SOCKS protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("NMETHODS and number of METHODS mismatch")]
    MethodCountMismatch,
    #[error("no acceptable SOCKS method offered by client")]
    NoAcceptableMethods,
    #[error("unknown SOCKS command {0}")]
    UnknownCommand(u8),
    #[error("malformed destination header")]
    MalformedHeader,
    #[error("unsupported address type {0}")]
    UnsupportedAddressType(u8),
}

/// Failures verifying or reassembling one-time-auth framing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OtaError {
    #[error("one time auth header is too short")]
    HeaderTooShort,
    #[error("one time auth verification failed")]
    VerificationFailed,
}

/// Top-level error a `ConnectionHandler` can fail with; any variant here
/// results in `destroy()` being invoked on the handler.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Socks(#[from] SocksError),

    #[error(transparent)]
    Ota(#[from] OtaError),

    #[error("DNS resolution failed for {host}: {source}")]
    Dns {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("destination {0} is in the forbidden IP list")]
    ForbiddenDestination(std::net::IpAddr),

    #[error("TCP Fast Open is not supported by this OS")]
    FastOpenUnsupported,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("peer disconnected")]
    PeerClosed,

    #[error("idle timeout")]
    TimedOut,
}
