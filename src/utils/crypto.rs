//! # Symmetric Stream Ciphers
//!
//! Thin wrapper over the RustCrypto `chacha20` crate for the session-key bootstrap.
//!
//! Two suites are supported, both unauthenticated stream ciphers:
//!
//! | Suite     | Algorithm   | Transformation             | Key | IV |
//! |-----------|-------------|----------------------------|-----|----|
//! | ChaCha20  | `ChaCha20`  | `ChaCha20/None/NoPadding`  | 32  | 12 |
//! | XChaCha20 | `XChaCha20` | `XChaCha20/None/NoPadding` | 32  | 24 |
//!
//! ## Security
//! - Keys and IVs come from the OS RNG (getrandom)
//! - There is no MAC: ciphertext tampering is NOT detected. Layer an AEAD or a
//!   transport with integrity protection on top when that matters.
//! - With the 96-bit ChaCha20 IV, random IVs should not be used for more than
//!   about 2^32 messages under one key; prefer XChaCha20 for long sessions.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, XChaCha20};
use serde::{Deserialize, Serialize};

use crate::error::{constants, ProtocolError, Result};

/// Key size shared by both suites
pub const KEY_LEN: usize = 32;

/// Stream cipher used for an encrypted session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CipherSuite {
    #[default]
    ChaCha20,
    XChaCha20,
}

impl CipherSuite {
    pub fn algorithm(self) -> &'static str {
        match self {
            CipherSuite::ChaCha20 => "ChaCha20",
            CipherSuite::XChaCha20 => "XChaCha20",
        }
    }

    pub fn transformation(self) -> &'static str {
        match self {
            CipherSuite::ChaCha20 => "ChaCha20/None/NoPadding",
            CipherSuite::XChaCha20 => "XChaCha20/None/NoPadding",
        }
    }

    pub fn key_len(self) -> usize {
        KEY_LEN
    }

    pub fn iv_len(self) -> usize {
        match self {
            CipherSuite::ChaCha20 => 12,
            CipherSuite::XChaCha20 => 24,
        }
    }

    /// Resolve a suite from the names carried in a session key message
    pub fn from_names(algorithm: &str, transformation: &str) -> Result<Self> {
        [CipherSuite::ChaCha20, CipherSuite::XChaCha20]
            .into_iter()
            .find(|suite| suite.algorithm() == algorithm && suite.transformation() == transformation)
            .ok_or_else(|| {
                ProtocolError::CryptoError(format!(
                    "{}: {algorithm} ({transformation})",
                    constants::ERR_UNSUPPORTED_CIPHER
                ))
            })
    }

    /// Encrypt or decrypt `data` in place; the keystream is its own inverse
    pub fn apply_keystream(self, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
        if key.len() != self.key_len() {
            return Err(ProtocolError::CryptoError(format!(
                "{}: expected {}, got {}",
                constants::ERR_KEY_LENGTH,
                self.key_len(),
                key.len()
            )));
        }
        if iv.len() != self.iv_len() {
            return Err(ProtocolError::CryptoError(format!(
                "{}: expected {}, got {}",
                constants::ERR_IV_LENGTH,
                self.iv_len(),
                iv.len()
            )));
        }
        let invalid = |_| ProtocolError::CryptoError(constants::ERR_KEY_LENGTH.into());
        match self {
            CipherSuite::ChaCha20 => ChaCha20::new_from_slices(key, iv)
                .map_err(invalid)?
                .apply_keystream(data),
            CipherSuite::XChaCha20 => XChaCha20::new_from_slices(key, iv)
                .map_err(invalid)?
                .apply_keystream(data),
        }
        Ok(())
    }

    /// Generate a fresh random key for this suite
    pub fn generate_key(self) -> Result<Vec<u8>> {
        random_bytes(self.key_len())
    }
}

/// Fill `out` from the OS RNG
pub fn fill_random(out: &mut [u8]) -> Result<()> {
    getrandom::fill(out)
        .map_err(|e| ProtocolError::CryptoError(format!("{}: {e}", constants::ERR_RANDOM_SOURCE)))
}

/// Allocate `len` random bytes from the OS RNG
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; len];
    fill_random(&mut out)?;
    Ok(out)
}
