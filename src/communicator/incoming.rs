//! Per-channel routing of post-handshake frames to one-shot readers.
//!
//! A frame that arrives before anyone asked for it waits in a bounded backlog for
//! its channel; a reader registered while the backlog is non-empty is satisfied
//! immediately. Both queues are FIFO per channel.

use std::collections::{HashMap, VecDeque};

use crate::core::buffer::Buffer;
use crate::error::{constants, ProtocolError, Result};

/// Callback that receives the payload of one frame on its channel
pub type Reader = Box<dyn FnOnce(Buffer) -> Result<()> + Send>;

/// A reader paired with the payload it should be invoked with
pub(crate) type Delivery = (Reader, Buffer);

pub(crate) struct IncomingChannels {
    readers: HashMap<u8, VecDeque<Reader>>,
    backlog: HashMap<u8, VecDeque<Buffer>>,
    max_pending: usize,
}

impl IncomingChannels {
    pub(crate) fn new(max_pending: usize) -> Self {
        Self {
            readers: HashMap::new(),
            backlog: HashMap::new(),
            max_pending,
        }
    }

    /// Queue a reader, or pair it with an already buffered frame
    pub(crate) fn register(&mut self, channel: u8, reader: Reader) -> Result<Option<Delivery>> {
        if let Some(frame) = self.backlog.get_mut(&channel).and_then(VecDeque::pop_front) {
            return Ok(Some((reader, frame)));
        }
        let queue = self.readers.entry(channel).or_default();
        if queue.len() >= self.max_pending {
            return Err(ProtocolError::InitializationError(format!(
                "too many pending readers on channel {channel}"
            )));
        }
        queue.push_back(reader);
        Ok(None)
    }

    /// Hand a frame to the oldest reader of its channel, or buffer it
    pub(crate) fn offer(&mut self, channel: u8, frame: Buffer) -> Result<Option<Delivery>> {
        if let Some(reader) = self.readers.get_mut(&channel).and_then(VecDeque::pop_front) {
            return Ok(Some((reader, frame)));
        }
        let queue = self.backlog.entry(channel).or_default();
        if queue.len() >= self.max_pending {
            return Err(ProtocolError::FramingError(format!(
                "{} (channel {channel})",
                constants::ERR_CHANNEL_BACKLOG
            )));
        }
        queue.push_back(frame);
        Ok(None)
    }

    pub(crate) fn pending_readers(&self, channel: u8) -> usize {
        self.readers.get(&channel).map_or(0, VecDeque::len)
    }

    pub(crate) fn backlog_len(&self, channel: u8) -> usize {
        self.backlog.get(&channel).map_or(0, VecDeque::len)
    }

    pub(crate) fn clear(&mut self) {
        self.readers.clear();
        self.backlog.clear();
    }
}
