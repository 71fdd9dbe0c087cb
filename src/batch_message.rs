use crate::error::TransportError;
use crate::util::int_conv::{Narrow, Widen};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A batch of independent messages that go over the wire as a single frame.
///
/// Messages are stored as [Bytes], i.e. as views into buffers owned by the caller; neither
///  adding nor serializing messages copies their contents. Parsing a frame produces messages
///  that are slices of the frame's buffer.
///
/// The serialized frame looks like this (all numbers little-endian u32):
///
/// ```ascii
/// 0: total size in bytes, including this header
/// 4: number of messages
/// 8: (repeated) message length, followed by the message's bytes
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchMessage {
    messages: Vec<Bytes>,
    size: usize,
    max_size: usize,
}

impl Default for BatchMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchMessage {
    pub const HEADER_LEN: usize = 2 * size_of::<u32>();
    pub const MESSAGE_HEADER_LEN: usize = size_of::<u32>();
    /// The size field is a u32, which bounds a frame's size
    pub const MAX_SIZE: usize = u32::MAX as usize;

    pub fn new() -> BatchMessage {
        Self::with_max_size(Self::MAX_SIZE)
    }

    /// A batch that refuses messages that would make its frame bigger than `max_size` bytes
    ///  (capped at [BatchMessage::MAX_SIZE])
    pub fn with_max_size(max_size: usize) -> BatchMessage {
        BatchMessage {
            messages: Vec::new(),
            size: Self::HEADER_LEN,
            max_size: max_size.min(Self::MAX_SIZE),
        }
    }

    /// The number of bytes this batch occupies when serialized
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Bytes] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Bytes> {
        self.messages
    }

    /// The longest message that fits into an otherwise empty batch
    pub fn max_message_len(&self) -> usize {
        self.max_size.saturating_sub(Self::HEADER_LEN + Self::MESSAGE_HEADER_LEN)
    }

    /// `true` if adding the message keeps the frame within the batch's maximum size
    pub fn fits(&self, message: &Bytes) -> bool {
        message.len() <= self.max_size.saturating_sub(self.size + Self::MESSAGE_HEADER_LEN)
    }

    /// Adds a message, or hands it back if the frame would exceed the batch's maximum size
    pub fn add_message(&mut self, message: Bytes) -> Result<(), Bytes> {
        if !self.fits(&message) {
            return Err(message);
        }
        self.size += Self::MESSAGE_HEADER_LEN + message.len();
        self.messages.push(message);
        Ok(())
    }

    /// Resets the batch to its empty state, retaining the allocated capacity for messages
    pub fn clear(&mut self) {
        self.messages.clear();
        self.size = Self::HEADER_LEN;
    }

    /// Serializes the batch as a list of buffers to be written in sequence. Message contents are
    ///  not copied; only the header and the length prefixes are freshly allocated.
    pub fn to_binary(&self) -> Vec<Bytes> {
        let mut result = Vec::with_capacity(1 + 2 * self.messages.len());

        let mut header = BytesMut::with_capacity(Self::HEADER_LEN);
        header.put_u32_le(self.size.narrow());
        header.put_u32_le(self.messages.len().narrow());
        result.push(header.freeze());

        for message in &self.messages {
            let len: u32 = message.len().narrow();
            result.push(Bytes::copy_from_slice(&len.to_le_bytes()));
            result.push(message.clone());
        }
        result
    }

    /// Serializes the batch into a single contiguous buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size);
        for part in self.to_binary() {
            buf.put_slice(&part);
        }
        buf.freeze()
    }

    /// Parses a frame. The resulting messages share `data`'s buffer.
    pub fn from_binary(data: Bytes) -> anyhow::Result<BatchMessage> {
        if data.len() < Self::HEADER_LEN {
            return Err(TransportError::malformed(format!("frame of {} bytes is shorter than the header", data.len())).into());
        }

        let mut parse_buf: &[u8] = data.as_ref();
        let total_size: usize = parse_buf.get_u32_le().widen();
        let message_count: usize = parse_buf.get_u32_le().widen();

        if total_size != data.len() {
            return Err(TransportError::malformed(format!("frame declares a size of {} bytes but has {}", total_size, data.len())).into());
        }

        // every message needs at least its length prefix, so this bounds the allocation
        if message_count > (data.len() - Self::HEADER_LEN) / Self::MESSAGE_HEADER_LEN {
            return Err(TransportError::malformed(format!("frame of {} bytes can not contain {} messages", data.len(), message_count)).into());
        }

        let mut messages = Vec::with_capacity(message_count);

        let mut offs = Self::HEADER_LEN;
        for i in 0..message_count {
            if parse_buf.remaining() < Self::MESSAGE_HEADER_LEN {
                return Err(TransportError::malformed(format!("frame ends inside the length prefix of message #{}", i)).into());
            }
            let len: usize = parse_buf.get_u32_le().widen();
            offs += Self::MESSAGE_HEADER_LEN;

            if parse_buf.remaining() < len {
                return Err(TransportError::malformed(format!("message #{} has length {} but only {} bytes remain", i, len, parse_buf.remaining())).into());
            }
            parse_buf.advance(len);

            messages.push(data.slice(offs..offs + len));
            offs += len;
        }

        if parse_buf.has_remaining() {
            return Err(TransportError::malformed(format!("{} trailing bytes after the last message", parse_buf.remaining())).into());
        }

        Ok(BatchMessage {
            messages,
            size: total_size,
            max_size: Self::MAX_SIZE,
        })
    }
}
