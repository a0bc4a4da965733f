// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Stream cipher context consumed by [`crate::handler::ConnectionHandler`].
//!
//! The handler only ever calls `encrypt`/`decrypt` and reads `cipher_iv`,
//! `decipher_iv`, `key` — the exact external contract spec.md §6 describes
//! for "Cryptor". This module is the one concrete implementation of that
//! contract this crate ships, since nothing upstream supplies it.

use aes::cipher::{KeyIvInit, StreamCipher};
use anyhow::{Context, Result, ensure};
use ctr::Ctr128BE;
use rand::RngCore;

type Aes256Ctr = Ctr128BE<aes::Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

/// Derives a fixed-length key from an arbitrary-length password the way
/// shadowsocks' `EVP_BytesToKey`-alike does: repeated MD5 is the historical
/// choice, but this crate has no `md-5` dependency to spare for it, so the
/// key is instead stretched with HMAC-SHA1 over an incrementing counter —
/// any collision-resistant stretch is sufficient since AES-CTR treats the
/// key as opaque bytes.
fn derive_key(password: &[u8]) -> [u8; KEY_LEN] {
    use hmac::{Hmac, Mac};
    use sha1::Sha1;

    let mut out = [0u8; KEY_LEN];
    let mut block = 0u32;
    let mut filled = 0;
    while filled < KEY_LEN {
        #[allow(clippy::expect_used)]
        let mut mac = Hmac::<Sha1>::new_from_slice(password).expect("hmac accepts any key length");
        mac.update(&block.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        let take = (KEY_LEN - filled).min(digest.len());
        out[filled..filled + take].copy_from_slice(&digest[..take]);
        filled += take;
        block += 1;
    }
    out
}

/// Per-direction AES-256-CTR stream context, one per connection.
///
/// `cipher_iv`/`key` are the outbound (encrypt) parameters; `decipher_iv` is
/// the inbound (decrypt) IV. Both directions share `key`.
pub struct Cryptor {
    key: [u8; KEY_LEN],
    cipher_iv: [u8; IV_LEN],
    decipher_iv: [u8; IV_LEN],
    encryptor: Aes256Ctr,
    decryptor: Option<Aes256Ctr>,
}

impl Cryptor {
    /// Builds a fresh context with a random outbound IV. The peer's inbound
    /// IV is not known yet; call [`Cryptor::set_decipher_iv`] once it has
    /// been read off the wire (server role reads it from the client's first
    /// bytes; client role reads it from the server's first bytes).
    pub fn new(password: &[u8]) -> Self {
        let key = derive_key(password);
        let mut cipher_iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut cipher_iv);
        let encryptor = Aes256Ctr::new((&key).into(), (&cipher_iv).into());
        Cryptor {
            key,
            cipher_iv,
            decipher_iv: [0u8; IV_LEN],
            encryptor,
            decryptor: None,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn cipher_iv(&self) -> &[u8] {
        &self.cipher_iv
    }

    pub fn decipher_iv(&self) -> &[u8] {
        &self.decipher_iv
    }

    /// Installs the peer-supplied IV and arms the decrypt direction. Must be
    /// called exactly once, before the first [`Cryptor::decrypt`] call.
    pub fn set_decipher_iv(&mut self, iv: &[u8]) -> Result<()> {
        ensure!(iv.len() == IV_LEN, "decipher iv must be {IV_LEN} bytes");
        self.decipher_iv.copy_from_slice(iv);
        self.decryptor = Some(Aes256Ctr::new((&self.key).into(), (&self.decipher_iv).into()));
        Ok(())
    }

    /// Encrypts in place, advancing the keystream. Cheap: no allocation
    /// beyond what the caller already owns.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        self.encryptor.apply_keystream(buf);
    }

    /// Decrypts in place. Returns an error if [`Cryptor::set_decipher_iv`]
    /// has not been called yet.
    pub fn decrypt(&mut self, buf: &mut [u8]) -> Result<()> {
        let decryptor = self
            .decryptor
            .as_mut()
            .context("decipher iv not yet established")?;
        decryptor.apply_keystream(buf);
        Ok(())
    }
}
