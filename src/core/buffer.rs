//! # Growable Byte Buffer
//!
//! A cursor-addressed binary buffer that every wire operation is written against.
//!
//! The buffer tracks three marks with the invariant
//! `0 <= position <= limit <= capacity`:
//! - **position**: where the next `put_*` writes or `get_*` reads
//! - **limit**: high-water mark of valid bytes; reads never pass it
//! - **capacity**: allocated size, grown geometrically by [`Buffer::ensure_remaining`]
//!
//! Writes never fail: they grow the allocation first. Reads past `limit` fail with
//! [`ProtocolError::OutOfRange`] and leave the cursor where it was, which is what lets
//! a consumer phase probe a partially received frame and retry later.
//!
//! All multi-byte integers and length headers are big-endian.
//!
//! ```rust
//! use handshake_pipeline::core::buffer::Buffer;
//!
//! let mut buf = Buffer::new();
//! buf.put_u16(7);
//! buf.put_string("ready").unwrap();
//! buf.flip();
//! assert_eq!(buf.get_u16().unwrap(), 7);
//! assert_eq!(buf.get_string().unwrap(), "ready");
//! ```

use std::fmt;

use crate::error::{constants, ProtocolError, Result};

/// Capacity used by [`Buffer::new`] and as the floor when growing an empty buffer
pub const DEFAULT_CAPACITY: usize = 256;

/// Size of the length header written by the size-prefixed helpers
pub const LENGTH_PREFIX: usize = 4;

const GROWTH_FACTOR: usize = 2;

/// Encode `len` as a 4-byte length header
pub fn length_prefix(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| ProtocolError::OutOfRange {
        requested: len,
        available: u32::MAX as usize,
    })
}

/// Resizable, cursor-addressed byte buffer
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    position: usize,
    limit: usize,
}

macro_rules! primitive_accessors {
    ($($(#[$doc:meta])* $put:ident, $get:ident, $ty:ty;)*) => {
        $(
            $(#[$doc])*
            pub fn $put(&mut self, value: $ty) {
                self.put_slice(&value.to_be_bytes());
            }

            $(#[$doc])*
            pub fn $get(&mut self) -> Result<$ty> {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                let len = raw.len();
                raw.copy_from_slice(self.get_slice(len)?);
                Ok(<$ty>::from_be_bytes(raw))
            }
        )*
    };
}

impl Buffer {
    /// Create an empty buffer with [`DEFAULT_CAPACITY`]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an empty buffer with the given capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            position: 0,
            limit: 0,
        }
    }

    /// Wrap existing bytes in read mode: position 0, limit at the end
    pub fn wrap(bytes: impl Into<Vec<u8>>) -> Self {
        let data = bytes.into();
        let limit = data.len();
        Self {
            data,
            position: 0,
            limit,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes between the cursor and the limit
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// Move the cursor. Fails when `position` would pass the limit.
    pub fn set_position(&mut self, position: usize) -> Result<()> {
        if position > self.limit {
            return Err(ProtocolError::OutOfRange {
                requested: position,
                available: self.limit,
            });
        }
        self.position = position;
        Ok(())
    }

    /// Move the limit. Fails when it would pass the capacity; pulls the cursor back if needed.
    pub fn set_limit(&mut self, limit: usize) -> Result<()> {
        if limit > self.capacity() {
            return Err(ProtocolError::OutOfRange {
                requested: limit,
                available: self.capacity(),
            });
        }
        self.limit = limit;
        self.position = self.position.min(limit);
        Ok(())
    }

    /// Switch from writing to reading: `limit = position`, `position = 0`
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Reset both marks to zero without releasing the allocation
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = 0;
    }

    /// Rewind the cursor to zero, keeping the limit
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Skip `n` readable bytes
    pub fn advance(&mut self, n: usize) -> Result<()> {
        self.check_readable(n)?;
        self.position += n;
        Ok(())
    }

    /// Grow the allocation so `n` more bytes fit after the cursor.
    ///
    /// Capacity at least doubles on every growth step; existing content is preserved.
    pub fn ensure_remaining(&mut self, n: usize) {
        let required = self.position.saturating_add(n);
        if required <= self.capacity() {
            return;
        }
        let grown = self.capacity().max(DEFAULT_CAPACITY / GROWTH_FACTOR) * GROWTH_FACTOR;
        self.data.resize(grown.max(required), 0);
    }

    /// All valid bytes, from zero to the limit
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.limit]
    }

    /// Readable bytes, from the cursor to the limit
    pub fn remaining_slice(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// Bytes in `[start, end)`; both bounds must be within the limit
    pub fn window(&self, start: usize, end: usize) -> Result<&[u8]> {
        if start > end || end > self.limit {
            return Err(ProtocolError::OutOfRange {
                requested: end,
                available: self.limit,
            });
        }
        Ok(&self.data[start..end])
    }

    /// Copy out the readable bytes and reset the buffer for writing
    pub fn drain(&mut self) -> Vec<u8> {
        let out = self.remaining_slice().to_vec();
        self.clear();
        out
    }

    /// Append bytes after the limit without moving the read cursor.
    ///
    /// Already-consumed bytes in front of the cursor are compacted away first, so a
    /// long-lived receive window does not grow without bound.
    pub fn append(&mut self, bytes: &[u8]) {
        if self.position > 0 {
            self.data.copy_within(self.position..self.limit, 0);
            self.limit -= self.position;
            self.position = 0;
        }
        let required = self.limit + bytes.len();
        if required > self.capacity() {
            let grown = self.capacity().max(DEFAULT_CAPACITY / GROWTH_FACTOR) * GROWTH_FACTOR;
            self.data.resize(grown.max(required), 0);
        }
        self.data[self.limit..required].copy_from_slice(bytes);
        self.limit = required;
    }

    /// Write raw bytes at the cursor
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.ensure_remaining(bytes.len());
        let end = self.position + bytes.len();
        self.data[self.position..end].copy_from_slice(bytes);
        self.position = end;
        self.limit = self.limit.max(end);
    }

    /// Read `n` raw bytes at the cursor, borrowing from the buffer
    pub fn get_slice(&mut self, n: usize) -> Result<&[u8]> {
        self.check_readable(n)?;
        let start = self.position;
        self.position += n;
        Ok(&self.data[start..self.position])
    }

    /// Read `n` raw bytes at the cursor into an owned vector
    pub fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.get_slice(n).map(<[u8]>::to_vec)
    }

    primitive_accessors! {
        put_u8, get_u8, u8;
        put_i8, get_i8, i8;
        put_u16, get_u16, u16;
        put_i16, get_i16, i16;
        put_u32, get_u32, u32;
        put_i32, get_i32, i32;
        put_u64, get_u64, u64;
        put_i64, get_i64, i64;
        put_f32, get_f32, f32;
        put_f64, get_f64, f64;
    }

    pub fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    /// Any non-zero byte reads as `true`
    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Read a big-endian `u32` without moving the cursor
    pub fn peek_u32(&self) -> Result<u32> {
        self.check_readable(LENGTH_PREFIX)?;
        let mut raw = [0u8; LENGTH_PREFIX];
        raw.copy_from_slice(&self.data[self.position..self.position + LENGTH_PREFIX]);
        Ok(u32::from_be_bytes(raw))
    }

    /// Overwrite a big-endian `u32` at an absolute index below the limit.
    ///
    /// Used to back-patch length headers once the body size is known.
    pub fn put_u32_at(&mut self, index: usize, value: u32) -> Result<()> {
        let end = index.saturating_add(LENGTH_PREFIX);
        if end > self.limit {
            return Err(ProtocolError::OutOfRange {
                requested: end,
                available: self.limit,
            });
        }
        self.data[index..end].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Write `[4-byte length][bytes]`; fails if `bytes` does not fit a 4-byte length
    pub fn put_blob(&mut self, bytes: &[u8]) -> Result<()> {
        let len = length_prefix(bytes.len())?;
        self.ensure_remaining(LENGTH_PREFIX + bytes.len());
        self.put_u32(len);
        self.put_slice(bytes);
        Ok(())
    }

    /// Read `[4-byte length][bytes]`; the cursor does not move if the blob is incomplete
    pub fn get_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.peek_u32()? as usize;
        self.check_readable(LENGTH_PREFIX.saturating_add(len))?;
        self.position += LENGTH_PREFIX;
        self.get_bytes(len)
    }

    /// Write a UTF-8 string as a size-prefixed blob
    pub fn put_string(&mut self, value: &str) -> Result<()> {
        self.put_blob(value.as_bytes())
    }

    /// Read a size-prefixed UTF-8 string
    pub fn get_string(&mut self) -> Result<String> {
        let start = self.position;
        let raw = self.get_blob()?;
        String::from_utf8(raw).map_err(|_| {
            self.position = start;
            ProtocolError::FramingError(constants::ERR_INVALID_UTF8.into())
        })
    }

    fn check_readable(&self, n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(ProtocolError::OutOfRange {
                requested: n,
                available: self.remaining(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        Self::wrap(bytes.to_vec())
    }
}
