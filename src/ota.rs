// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One-time-auth (OTA) framing: per-session and per-chunk truncated
//! HMAC-SHA1 layered inside the already-encrypted stream, per spec.md §4.2.

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::OtaError;

type HmacSha1 = Hmac<Sha1>;

/// Truncated MAC length used both for the per-session header MAC and every
/// per-chunk MAC.
pub const MAC_LEN: usize = 10;
/// `be_u16(len)` prefix.
const LEN_PREFIX_LEN: usize = 2;
const HEAD_LEN: usize = LEN_PREFIX_LEN + MAC_LEN;

fn truncated_hmac(key_parts: &[&[u8]], data: &[u8]) -> [u8; MAC_LEN] {
    // hmac crate keys are fixed at construction; concatenate the key parts
    // ourselves since the key here is `iv || key`, not a single slice.
    let mut key = Vec::new();
    for part in key_parts {
        key.extend_from_slice(part);
    }
    #[allow(clippy::expect_used)]
    let mut mac = HmacSha1::new_from_slice(&key).expect("hmac accepts any key length");
    mac.update(data);
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&full[..MAC_LEN]);
    out
}

/// Per-session header MAC, keyed by `iv || key`, covering the request
/// header bytes (`ATYP..port`).
pub fn header_mac(iv: &[u8], key: &[u8], header: &[u8]) -> [u8; MAC_LEN] {
    truncated_hmac(&[iv, key], header)
}

pub fn verify_header_mac(iv: &[u8], key: &[u8], header: &[u8], mac: &[u8]) -> bool {
    header_mac(iv, key, header).as_slice() == mac
}

/// Per-chunk MAC, keyed by `iv || be_u32(chunk_index)`, covering only the
/// chunk payload.
fn chunk_mac(iv: &[u8], chunk_index: u32, payload: &[u8]) -> [u8; MAC_LEN] {
    truncated_hmac(&[iv, &chunk_index.to_be_bytes()], payload)
}

/// Frames one outbound chunk: `be_u16(len) || mac10 || payload`.
pub fn frame_chunk(iv: &[u8], chunk_index: u32, payload: &[u8]) -> Vec<u8> {
    let mac = chunk_mac(iv, chunk_index, payload);
    let mut out = Vec::with_capacity(HEAD_LEN + payload.len());
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(&mac);
    out.extend_from_slice(payload);
    out
}

#[derive(Debug)]
enum ReasmState {
    Head,
    Data { len: usize, mac: [u8; MAC_LEN] },
}

/// Inbound OTA reassembler: accepts arbitrarily-split reads and yields
/// complete, MAC-verified chunks. Resumable across read boundaries per
/// spec.md §4.2/§8.
pub struct Reassembler {
    state: ReasmState,
    head_buf: Vec<u8>,
    data_buf: Vec<u8>,
    chunk_index: u32,
    iv: Vec<u8>,
}

/// Outcome of feeding bytes into the reassembler for one chunk boundary.
pub enum Delivered {
    /// Chunk verified; payload ready for the caller to forward.
    Chunk(Vec<u8>),
    /// Chunk failed verification; dropped per spec.md §7 (warn, continue).
    BadMac,
}

impl Reassembler {
    pub fn new(iv: Vec<u8>) -> Self {
        Reassembler {
            state: ReasmState::Head,
            head_buf: Vec::with_capacity(HEAD_LEN),
            data_buf: Vec::new(),
            chunk_index: 0,
            iv,
        }
    }

    pub fn chunk_index(&self) -> u32 {
        self.chunk_index
    }

    /// Feeds newly-read bytes in; `buf` is consumed incrementally and may
    /// contain data spanning multiple chunks or none. Returns each chunk
    /// boundary crossed, in order.
    pub fn feed(&mut self, mut buf: &[u8]) -> Result<Vec<Delivered>, OtaError> {
        let mut out = Vec::new();
        while !buf.is_empty() {
            match &self.state {
                ReasmState::Head => {
                    let need = HEAD_LEN - self.head_buf.len();
                    let take = need.min(buf.len());
                    self.head_buf.extend_from_slice(&buf[..take]);
                    buf = &buf[take..];
                    if self.head_buf.len() < HEAD_LEN {
                        continue;
                    }
                    if self.head_buf.len() < LEN_PREFIX_LEN {
                        return Err(OtaError::HeaderTooShort);
                    }
                    let len =
                        u16::from_be_bytes([self.head_buf[0], self.head_buf[1]]) as usize;
                    let mut mac = [0u8; MAC_LEN];
                    mac.copy_from_slice(&self.head_buf[LEN_PREFIX_LEN..HEAD_LEN]);
                    self.state = ReasmState::Data { len, mac };
                    self.data_buf.clear();
                },
                ReasmState::Data { len, mac } => {
                    let need = len - self.data_buf.len();
                    let take = need.min(buf.len());
                    self.data_buf.extend_from_slice(&buf[..take]);
                    buf = &buf[take..];
                    if self.data_buf.len() < *len {
                        continue;
                    }
                    let expected = chunk_mac(&self.iv, self.chunk_index, &self.data_buf);
                    if expected == *mac {
                        out.push(Delivered::Chunk(std::mem::take(&mut self.data_buf)));
                        self.chunk_index = self.chunk_index.wrapping_add(1);
                    } else {
                        out.push(Delivered::BadMac);
                    }
                    self.head_buf.clear();
                    self.state = ReasmState::Head;
                },
            }
        }
        Ok(out)
    }
}
