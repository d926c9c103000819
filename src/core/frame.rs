//! # Framing
//!
//! Length-delimited framing on top of [`Buffer`].
//!
//! ## Wire Format
//! ```text
//! channel 0 (initialization):   [Length(4)] [Payload(N)]
//! channels 1..=255 (after auth): [Length(4)] [Channel(1)] [Payload(N >= 1)]
//! ```
//!
//! Readers never consume a partial frame: [`read_frame`] returns `Ok(None)` and leaves the
//! inbox untouched until the whole frame has arrived, so a consumer phase can simply report
//! "not complete" and be retried when more bytes land.

use crate::core::buffer::{length_prefix, Buffer, LENGTH_PREFIX};
use crate::error::{constants, ProtocolError, Result};

/// Channel reserved for initialization traffic
pub const INIT_CHANNEL: u8 = 0;

/// Default upper bound for a single frame body (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Write one channel-0 frame whose body is produced by `body`.
///
/// The length header is reserved first and back-patched once the body is written,
/// so the body can be encoded straight into the outgoing buffer. A body that moves
/// the cursor back into the header fails with [`ProtocolError::FramingError`].
pub fn write_frame_with<F>(out: &mut Buffer, body: F) -> Result<()>
where
    F: FnOnce(&mut Buffer) -> Result<()>,
{
    let header_at = out.position();
    out.put_u32(0);
    body(out)?;
    let len = out
        .position()
        .checked_sub(header_at + LENGTH_PREFIX)
        .ok_or_else(|| ProtocolError::FramingError(constants::ERR_FRAME_REWOUND.into()))?;
    let len = length_prefix(len)
        .map_err(|_| ProtocolError::FramingError(constants::ERR_FRAME_TOO_LONG.into()))?;
    out.put_u32_at(header_at, len)
}

/// Write one channel-0 frame carrying `payload`
pub fn write_frame(out: &mut Buffer, payload: &[u8]) -> Result<()> {
    out.put_blob(payload)
}

/// Write one post-handshake channel frame
pub fn write_channel_frame(out: &mut Buffer, channel: u8, payload: &[u8]) -> Result<()> {
    if channel == INIT_CHANNEL {
        return Err(ProtocolError::FramingError(
            constants::ERR_RESERVED_CHANNEL.into(),
        ));
    }
    if payload.is_empty() {
        return Err(ProtocolError::FramingError(
            constants::ERR_EMPTY_CHANNEL_FRAME.into(),
        ));
    }
    let len = length_prefix(payload.len() + 1)
        .map_err(|_| ProtocolError::FramingError(constants::ERR_FRAME_TOO_LONG.into()))?;
    out.put_u32(len);
    out.put_u8(channel);
    out.put_slice(payload);
    Ok(())
}

/// Pop one complete channel-0 frame from `inbox`.
///
/// Returns `Ok(None)` when the header or body is still incomplete, and
/// [`ProtocolError::OversizedFrame`] when the announced length exceeds `max_len`.
pub fn read_frame(inbox: &mut Buffer, max_len: usize) -> Result<Option<Buffer>> {
    if inbox.remaining() < LENGTH_PREFIX {
        return Ok(None);
    }
    let len = inbox.peek_u32()? as usize;
    if len > max_len {
        return Err(ProtocolError::OversizedFrame(len));
    }
    if inbox.remaining() < LENGTH_PREFIX + len {
        return Ok(None);
    }
    inbox.advance(LENGTH_PREFIX)?;
    Ok(Some(Buffer::wrap(inbox.get_bytes(len)?)))
}

/// Pop one complete post-handshake frame, returning its channel and payload
pub fn read_channel_frame(inbox: &mut Buffer, max_len: usize) -> Result<Option<(u8, Buffer)>> {
    let Some(mut frame) = read_frame(inbox, max_len)? else {
        return Ok(None);
    };
    if frame.remaining() < 2 {
        return Err(ProtocolError::FramingError(
            constants::ERR_EMPTY_CHANNEL_FRAME.into(),
        ));
    }
    let channel = frame.get_u8()?;
    let payload = Buffer::wrap(frame.remaining_slice().to_vec());
    Ok(Some((channel, payload)))
}

/// Require that a decoded frame was fully consumed
pub fn expect_consumed(frame: &Buffer) -> Result<()> {
    if frame.has_remaining() {
        return Err(ProtocolError::FramingError(format!(
            "{} trailing bytes after frame body",
            frame.remaining()
        )));
    }
    Ok(())
}

/// Error for a frame that ended before its body was fully decoded
pub fn truncated() -> ProtocolError {
    ProtocolError::FramingError(constants::ERR_TRUNCATED_FRAME.into())
}

/// Report a read past the end of a frame body as [`truncated`]; other errors pass through
pub fn short_read(error: ProtocolError) -> ProtocolError {
    match error {
        ProtocolError::OutOfRange { .. } => truncated(),
        other => other,
    }
}
