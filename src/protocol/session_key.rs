//! # Symmetric Session-Key Bootstrap
//!
//! A sub-protocol usable inside any handshake: one side generates a secret key and
//! sends it as a producer payload, the other side's consumer turns it into an
//! [`Encrypter`] or [`Decrypter`]. From then on confidential phases write through an
//! [`EncryptingWriter`] and read through a [`DecryptingReader`].
//!
//! ## Wire Format
//! ```text
//! key message: [Len(4)][Algorithm UTF-8] [Len(4)][Transformation UTF-8] [Len(4)][Key] [IvLen(4)]
//! envelope:    [Header(optional, fixed)] [Len(4) of IV+Ciphertext] [IV] [Ciphertext]
//! ```
//!
//! ## Security
//! - A fresh random IV is drawn for every envelope, so equal plaintexts never produce
//!   equal ciphertexts
//! - Key bytes are zeroized when the material and the cipher handles are dropped
//! - **Confidentiality only.** Envelopes carry no MAC; a flipped ciphertext bit flips
//!   the same plaintext bit and goes unnoticed. Callers that need integrity must add it.
//! - The key travels in the clear inside the handshake. Run the bootstrap over a
//!   transport that is already private, or treat it as obfuscation.

use std::fmt;

use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::core::buffer::{Buffer, LENGTH_PREFIX};
use crate::core::frame;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::context::{ContextKey, InitContext};
use crate::protocol::phase::Phase;
use crate::utils::crypto::{self, CipherSuite};

/// Context slot holding the encrypter installed by the key bootstrap
pub const ENCRYPTER: ContextKey<Encrypter> = ContextKey::new("session_key.encrypter");

/// Context slot holding the decrypter installed by the key bootstrap
pub const DECRYPTER: ContextKey<Decrypter> = ContextKey::new("session_key.decrypter");

/// Everything the receiving side needs to build a cipher
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeyMaterial {
    pub algorithm: String,
    pub transformation: String,
    pub key: Vec<u8>,
    pub iv_len: u32,
}

impl SessionKeyMaterial {
    /// Generate a fresh random key for `suite`
    pub fn generate(suite: CipherSuite) -> Result<Self> {
        Ok(Self {
            algorithm: suite.algorithm().to_string(),
            transformation: suite.transformation().to_string(),
            key: suite.generate_key()?,
            iv_len: suite.iv_len() as u32,
        })
    }

    /// Resolve and validate the suite these parameters describe
    pub fn suite(&self) -> Result<CipherSuite> {
        let suite = CipherSuite::from_names(&self.algorithm, &self.transformation)?;
        if self.key.len() != suite.key_len() {
            return Err(ProtocolError::CryptoError(format!(
                "{}: expected {}, got {}",
                constants::ERR_KEY_LENGTH,
                suite.key_len(),
                self.key.len()
            )));
        }
        if self.iv_len as usize != suite.iv_len() {
            return Err(ProtocolError::CryptoError(format!(
                "{}: expected {}, got {}",
                constants::ERR_IV_LENGTH,
                suite.iv_len(),
                self.iv_len
            )));
        }
        Ok(suite)
    }

    pub fn encode(&self, out: &mut Buffer) -> Result<()> {
        out.put_string(&self.algorithm)?;
        out.put_string(&self.transformation)?;
        out.put_blob(&self.key)?;
        out.put_u32(self.iv_len);
        Ok(())
    }

    pub fn decode(input: &mut Buffer) -> Result<Self> {
        let algorithm = input.get_string()?;
        let transformation = input.get_string()?;
        let key = input.get_blob()?;
        let iv_len = input.get_u32()?;
        Ok(Self {
            algorithm,
            transformation,
            key,
            iv_len,
        })
    }

    /// Build the encrypting half; the material is consumed and wiped
    pub fn into_encrypter(self) -> Result<Encrypter> {
        Ok(Encrypter(Cipher::new(&self)?))
    }

    /// Build the decrypting half; the material is consumed and wiped
    pub fn into_decrypter(self) -> Result<Decrypter> {
        Ok(Decrypter(Cipher::new(&self)?))
    }
}

impl fmt::Debug for SessionKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeyMaterial")
            .field("algorithm", &self.algorithm)
            .field("transformation", &self.transformation)
            .field("key", &"<redacted>")
            .field("iv_len", &self.iv_len)
            .finish()
    }
}

#[derive(Clone)]
struct Cipher {
    suite: CipherSuite,
    key: Zeroizing<Vec<u8>>,
}

impl Cipher {
    fn new(material: &SessionKeyMaterial) -> Result<Self> {
        Ok(Self {
            suite: material.suite()?,
            key: Zeroizing::new(material.key.clone()),
        })
    }
}

/// Encrypts payloads into `IV || ciphertext`
#[derive(Clone)]
pub struct Encrypter(Cipher);

impl Encrypter {
    pub fn suite(&self) -> CipherSuite {
        self.0.suite
    }

    /// Encrypt `plaintext` under a freshly drawn IV and return `IV || ciphertext`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let suite = self.0.suite;
        let iv_len = suite.iv_len();
        let mut sealed = vec![0u8; iv_len + plaintext.len()];
        let (iv, body) = sealed.split_at_mut(iv_len);
        crypto::fill_random(iv)?;
        body.copy_from_slice(plaintext);
        suite.apply_keystream(&self.0.key, iv, body)?;
        Ok(sealed)
    }
}

impl fmt::Debug for Encrypter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Encrypter").field(&self.0.suite).finish()
    }
}

/// Decrypts `IV || ciphertext` produced by the matching [`Encrypter`]
#[derive(Clone)]
pub struct Decrypter(Cipher);

impl Decrypter {
    pub fn suite(&self) -> CipherSuite {
        self.0.suite
    }

    /// Decrypt `IV || ciphertext`. No integrity check is performed.
    pub fn open(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let suite = self.0.suite;
        if sealed.len() < suite.iv_len() {
            return Err(ProtocolError::CryptoError(format!(
                "{}: envelope shorter than the IV",
                constants::ERR_IV_LENGTH
            )));
        }
        let (iv, body) = sealed.split_at(suite.iv_len());
        let mut plaintext = Zeroizing::new(body.to_vec());
        suite.apply_keystream(&self.0.key, iv, &mut plaintext)?;
        Ok(plaintext)
    }
}

impl fmt::Debug for Decrypter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Decrypter").field(&self.0.suite).finish()
    }
}

/// Turns a window of plaintext just written into a buffer into an envelope in place
#[derive(Clone, Debug)]
pub struct EncryptingWriter {
    encrypter: Encrypter,
    header: Vec<u8>,
}

impl EncryptingWriter {
    pub fn new(encrypter: Encrypter) -> Self {
        Self::with_header(encrypter, Vec::new())
    }

    /// Prefix every envelope with a fixed application header
    pub fn with_header(encrypter: Encrypter, header: impl Into<Vec<u8>>) -> Self {
        Self {
            encrypter,
            header: header.into(),
        }
    }

    /// Encrypt the bytes between `start` and the cursor.
    ///
    /// The window is replaced by `[header][len][IV || ciphertext]`. Bytes between the
    /// cursor and the limit are kept and shifted behind the envelope; the cursor ends up
    /// right after the envelope.
    pub fn seal_window(&self, buffer: &mut Buffer, start: usize) -> Result<()> {
        let end = buffer.position();
        let plaintext = Zeroizing::new(buffer.window(start, end)?.to_vec());
        let tail = buffer.window(end, buffer.limit())?.to_vec();
        let sealed = self.encrypter.seal(&plaintext)?;

        buffer.set_limit(start)?;
        buffer.put_slice(&self.header);
        buffer.put_blob(&sealed)?;
        let envelope_end = buffer.position();
        buffer.put_slice(&tail);
        // The envelope is always longer than the plaintext, so no plaintext byte survives.
        buffer.set_position(envelope_end)
    }

    /// Write plaintext with `body` at the cursor, then seal it
    pub fn write<F>(&self, buffer: &mut Buffer, body: F) -> Result<()>
    where
        F: FnOnce(&mut Buffer) -> Result<()>,
    {
        let start = buffer.position();
        body(buffer)?;
        self.seal_window(buffer, start)
    }
}

/// Reads envelopes written by an [`EncryptingWriter`]
#[derive(Clone, Debug)]
pub struct DecryptingReader {
    decrypter: Decrypter,
    header: Vec<u8>,
}

impl DecryptingReader {
    pub fn new(decrypter: Decrypter) -> Self {
        Self::with_header(decrypter, Vec::new())
    }

    pub fn with_header(decrypter: Decrypter, header: impl Into<Vec<u8>>) -> Self {
        Self {
            decrypter,
            header: header.into(),
        }
    }

    /// Decrypt the next envelope at the cursor.
    ///
    /// Returns `Ok(None)` without moving the cursor while the envelope is incomplete.
    pub fn read(&self, input: &mut Buffer) -> Result<Option<Buffer>> {
        let header_len = self.header.len();
        if input.remaining() < header_len + LENGTH_PREFIX {
            return Ok(None);
        }
        if &input.remaining_slice()[..header_len] != self.header.as_slice() {
            return Err(ProtocolError::FramingError(
                constants::ERR_HEADER_MISMATCH.into(),
            ));
        }
        let start = input.position();
        input.advance(header_len)?;
        let len = input.peek_u32()? as usize;
        if input.remaining() < LENGTH_PREFIX + len {
            input.set_position(start)?;
            return Ok(None);
        }
        let sealed = input.get_blob()?;
        let plaintext = self.decrypter.open(&sealed)?;
        Ok(Some(Buffer::wrap(plaintext.to_vec())))
    }
}

/// Which cipher half a side of the bootstrap installs in its context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Encrypt,
    Decrypt,
    /// One key for both directions
    Both,
}

impl KeyRole {
    fn install(self, material: SessionKeyMaterial, context: &mut InitContext) -> Result<()> {
        match self {
            KeyRole::Encrypt => {
                context.insert(ENCRYPTER, material.into_encrypter()?);
            }
            KeyRole::Decrypt => {
                context.insert(DECRYPTER, material.into_decrypter()?);
            }
            KeyRole::Both => {
                context.insert(ENCRYPTER, material.clone().into_encrypter()?);
                context.insert(DECRYPTER, material.into_decrypter()?);
            }
        }
        Ok(())
    }
}

/// Producer that generates a key, sends it, and installs `keep` locally
pub fn issue_key_phase(suite: CipherSuite, keep: KeyRole) -> Phase {
    Phase::producer("session_key.issue", move |io| {
        let material = SessionKeyMaterial::generate(suite)?;
        frame::write_frame_with(io.outgoing, |out| material.encode(out))?;
        debug!(algorithm = suite.algorithm(), role = ?keep, "Issued session key");
        keep.install(material, &mut *io.context)
    })
}

/// Consumer that reads a key message and installs `role`
pub fn receive_key_phase(role: KeyRole) -> Phase {
    Phase::consumer("session_key.receive", move |io| {
        let Some(mut frame) = io.read_frame()? else {
            return Ok(false);
        };
        let material = SessionKeyMaterial::decode(&mut frame).map_err(frame::short_read)?;
        frame::expect_consumed(&frame)?;
        debug!(algorithm = %material.algorithm, role = ?role, "Received session key");
        role.install(material, &mut *io.context)?;
        Ok(true)
    })
}

/// Producer whose frame body is encrypted with the context's [`ENCRYPTER`]
pub fn encrypted_producer<F>(label: &'static str, body: F) -> Phase
where
    F: Fn(&mut InitContext, &mut Buffer) -> Result<()> + Send + Sync + 'static,
{
    Phase::producer(label, move |io| {
        let writer = EncryptingWriter::new(io.context.get(ENCRYPTER)?.clone());
        let context = &mut *io.context;
        frame::write_frame_with(io.outgoing, |out| {
            writer.write(out, |plain| body(context, plain))
        })
    })
}

/// Consumer whose frame body is decrypted with the context's [`DECRYPTER`]
pub fn encrypted_consumer<F>(label: &'static str, body: F) -> Phase
where
    F: Fn(&mut InitContext, Buffer) -> Result<()> + Send + Sync + 'static,
{
    Phase::consumer(label, move |io| {
        let reader = DecryptingReader::new(io.context.get(DECRYPTER)?.clone());
        let Some(mut frame) = io.read_frame()? else {
            return Ok(false);
        };
        let plaintext = reader.read(&mut frame)?.ok_or_else(frame::truncated)?;
        frame::expect_consumed(&frame)?;
        body(&mut *io.context, plaintext)?;
        Ok(true)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn halves(suite: CipherSuite) -> (Encrypter, Decrypter) {
        let material = SessionKeyMaterial::generate(suite).unwrap();
        (
            material.clone().into_encrypter().unwrap(),
            material.into_decrypter().unwrap(),
        )
    }

    #[test]
    fn test_key_message_layout() {
        let material = SessionKeyMaterial {
            algorithm: "ChaCha20".into(),
            transformation: "ChaCha20/None/NoPadding".into(),
            key: vec![7; 32],
            iv_len: 12,
        };
        let mut out = Buffer::new();
        material.encode(&mut out).unwrap();
        out.flip();
        assert_eq!(out.remaining(), 4 + 8 + 4 + 23 + 4 + 32 + 4);
        assert_eq!(&out.as_slice()[..4], &8u32.to_be_bytes());
        assert_eq!(SessionKeyMaterial::decode(&mut out).unwrap(), material);
    }

    #[test]
    fn test_material_validation() {
        let mut material = SessionKeyMaterial::generate(CipherSuite::ChaCha20).unwrap();
        material.iv_len = 16;
        assert!(matches!(
            material.clone().into_decrypter(),
            Err(ProtocolError::CryptoError(_))
        ));
        material.iv_len = 12;
        material.key.truncate(16);
        assert!(material.into_encrypter().is_err());
    }

    #[test]
    fn test_same_plaintext_yields_distinct_envelopes() {
        let (encrypter, decrypter) = halves(CipherSuite::ChaCha20);
        let writer = EncryptingWriter::new(encrypter);
        let reader = DecryptingReader::new(decrypter);

        let mut envelopes = Vec::new();
        for _ in 0..2 {
            let mut buf = Buffer::new();
            writer
                .write(&mut buf, |plain| plain.put_string("hunter2"))
                .unwrap();
            buf.flip();
            envelopes.push(buf);
        }
        assert_ne!(envelopes[0].as_slice(), envelopes[1].as_slice());

        for mut envelope in envelopes {
            let mut plain = reader.read(&mut envelope).unwrap().unwrap();
            assert_eq!(plain.get_string().unwrap(), "hunter2");
        }
    }

    #[test]
    fn test_envelope_layout_and_tail_preserved() {
        let (encrypter, decrypter) = halves(CipherSuite::XChaCha20);
        let writer = EncryptingWriter::with_header(encrypter, b"HD".to_vec());

        let mut buf = Buffer::new();
        buf.put_u8(0xAA);
        buf.put_slice(b"secret");
        buf.put_slice(b"tail");
        buf.set_position(7).unwrap();
        writer.seal_window(&mut buf, 1).unwrap();

        // [0xAA][HD][len = 24 + 6][IV 24][ct 6][tail]
        assert_eq!(buf.position(), 1 + 2 + 4 + 30);
        assert_eq!(buf.limit(), buf.position() + 4);
        assert_eq!(&buf.as_slice()[1..3], b"HD");
        assert_eq!(&buf.as_slice()[3..7], &30u32.to_be_bytes());
        assert_eq!(&buf.as_slice()[buf.position()..], b"tail");

        let reader = DecryptingReader::with_header(decrypter, b"HD".to_vec());
        buf.set_position(1).unwrap();
        let plain = reader.read(&mut buf).unwrap().unwrap();
        assert_eq!(plain.remaining_slice(), b"secret");
    }

    #[test]
    fn test_tampering_is_not_detected() {
        let (encrypter, decrypter) = halves(CipherSuite::ChaCha20);
        let mut sealed = encrypter.seal(b"pay 10").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= b'0' ^ b'9';
        // No MAC: the flipped bit decrypts silently to a different plaintext.
        assert_eq!(decrypter.open(&sealed).unwrap().as_slice(), b"pay 19");
    }

    #[test]
    fn test_partial_envelope_waits() {
        let (encrypter, decrypter) = halves(CipherSuite::ChaCha20);
        let writer = EncryptingWriter::new(encrypter);
        let reader = DecryptingReader::new(decrypter);
        let mut full = Buffer::new();
        writer
            .write(&mut full, |plain| {
                plain.put_u64(99);
                Ok(())
            })
            .unwrap();
        full.flip();
        let bytes = full.as_slice().to_vec();

        let mut partial = Buffer::wrap(bytes[..10].to_vec());
        assert!(reader.read(&mut partial).unwrap().is_none());
        assert_eq!(partial.position(), 0);
        partial.append(&bytes[10..]);
        let mut plain = reader.read(&mut partial).unwrap().unwrap();
        assert_eq!(plain.get_u64().unwrap(), 99);
    }

    #[test]
    fn test_wrong_header_rejected() {
        let (encrypter, decrypter) = halves(CipherSuite::ChaCha20);
        let mut buf = Buffer::new();
        EncryptingWriter::with_header(encrypter, b"AA".to_vec())
            .write(&mut buf, |plain| {
                plain.put_u8(1);
                Ok(())
            })
            .unwrap();
        buf.flip();
        let reader = DecryptingReader::with_header(decrypter, b"BB".to_vec());
        assert!(matches!(
            reader.read(&mut buf),
            Err(ProtocolError::FramingError(_))
        ));
    }
}
