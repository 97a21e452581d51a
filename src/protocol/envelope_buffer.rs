//! Envelope buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` so socket reads land directly in the buffer.
//! MessagePack values carry their own lengths, so instead of a fixed header
//! the buffer walks the markers and length prefixes of the pending envelope
//! as bytes arrive. The walk resumes where it stopped, string and binary
//! bodies are skipped by length, and the envelope is decoded once, when its
//! last byte is in.
//!
//! # Example
//!
//! ```
//! use packrpc::protocol::{Call, Envelope, EnvelopeBuffer};
//!
//! let bytes = Envelope::Call(Call::new(1, "ping", vec![])).encode().unwrap();
//! let mut buffer = EnvelopeBuffer::new();
//!
//! assert!(buffer.push(&bytes[..2]).unwrap().is_empty());
//! let envelopes = buffer.push(&bytes[2..]).unwrap();
//! assert_eq!(envelopes.len(), 1);
//! ```

use bytes::BytesMut;

use super::envelope::{decode, Decoded, Envelope};
use crate::error::{Result, RpcError};

/// Default upper bound for a single envelope (64 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Default initial buffer capacity (64 KiB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Deepest container nesting accepted in one envelope.
const MAX_DEPTH: usize = 1024;

/// Buffer for accumulating incoming bytes and extracting complete envelopes.
pub struct EnvelopeBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Largest envelope accepted before the stream is rejected.
    max_message_size: usize,
    /// Progress through the envelope at the front of `buffer`.
    boundary: Boundary,
}

impl EnvelopeBuffer {
    /// Create a new envelope buffer with default settings.
    pub fn new() -> Self {
        Self::with_capacity_and_max_message_size(DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a new envelope buffer with a custom size limit.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self::with_capacity_and_max_message_size(DEFAULT_BUFFER_CAPACITY, max_message_size)
    }

    /// Create a new envelope buffer with custom capacity and size limit.
    pub fn with_capacity_and_max_message_size(capacity: usize, max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            max_message_size,
            boundary: Boundary::default(),
        }
    }

    /// Push data into the buffer and extract all complete envelopes.
    ///
    /// # Errors
    ///
    /// [`RpcError::Protocol`] if the stream is malformed or an envelope grows
    /// past the size limit. The buffer contents are unspecified afterwards.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Envelope>> {
        self.buffer.extend_from_slice(data);
        self.drain()
    }

    /// Extract every complete envelope currently buffered.
    ///
    /// Use after reading directly into [`EnvelopeBuffer::buffer_mut`].
    pub fn drain(&mut self) -> Result<Vec<Envelope>> {
        let mut envelopes = Vec::new();

        while let Some(envelope) = self.try_extract_one()? {
            envelopes.push(envelope);
        }

        Ok(envelopes)
    }

    fn try_extract_one(&mut self) -> Result<Option<Envelope>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        if !self.boundary.started && !matches!(self.buffer[0], 0x90..=0x9f | 0xdc | 0xdd) {
            return Err(RpcError::Protocol(format!(
                "envelope must be an array, got marker {:#04x}",
                self.buffer[0]
            )));
        }

        let end = self.boundary.advance(&self.buffer)?;

        let known = end.unwrap_or(self.boundary.offset.max(self.buffer.len()));
        if known > self.max_message_size {
            return Err(RpcError::Protocol(format!(
                "Envelope of at least {} bytes exceeds maximum {}",
                known, self.max_message_size
            )));
        }

        let Some(end) = end else {
            return Ok(None);
        };

        match decode(&self.buffer[..end])? {
            Decoded::Complete { envelope, consumed } if consumed == end => {
                let _ = self.buffer.split_to(end);
                self.boundary = Boundary::default();
                Ok(Some(envelope))
            }
            _ => Err(RpcError::Protocol(format!(
                "envelope boundary at {end} bytes does not match its encoding"
            ))),
        }
    }

    /// Mutable access for reading straight from a socket.
    ///
    /// Only append to it; bytes already buffered may have been scanned.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discard buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.boundary = Boundary::default();
    }
}

/// Resumable walk over one MessagePack value that finds where it ends
/// without building it.
#[derive(Debug, Default)]
struct Boundary {
    /// Bytes of the value accounted for so far. May run past the buffered
    /// bytes while a string or binary body is still arriving.
    offset: usize,
    /// Items still owed to each open array or map, innermost last.
    open: Vec<u64>,
    started: bool,
}

impl Boundary {
    /// Continue the walk over `bytes`, which starts at the value's first
    /// byte. Returns the value's length once all of it is buffered.
    fn advance(&mut self, bytes: &[u8]) -> Result<Option<usize>> {
        loop {
            if self.started && self.open.is_empty() {
                return Ok((self.offset <= bytes.len()).then_some(self.offset));
            }

            let Some(rest) = bytes.get(self.offset..).filter(|rest| !rest.is_empty()) else {
                return Ok(None);
            };
            let Some(item) = Item::parse(rest)? else {
                return Ok(None);
            };

            self.offset += item.size;
            self.started = true;
            if let Some(owed) = self.open.last_mut() {
                *owed -= 1;
            }
            if item.children > 0 {
                if self.open.len() >= MAX_DEPTH {
                    return Err(RpcError::Protocol(format!(
                        "envelope nests deeper than {MAX_DEPTH} levels"
                    )));
                }
                self.open.push(item.children);
            }
            while self.open.last() == Some(&0) {
                self.open.pop();
            }
        }
    }
}

/// Extent of one MessagePack item, not counting the items it contains.
struct Item {
    /// Marker, length prefix and inline body.
    size: usize,
    /// Array elements, or twice the map entries, that follow it.
    children: u64,
}

impl Item {
    fn fixed(size: usize) -> Option<Self> {
        Some(Self { size, children: 0 })
    }

    /// Read the item starting at `bytes[0]`, or `None` if its length prefix
    /// is not buffered yet.
    fn parse(bytes: &[u8]) -> Result<Option<Self>> {
        let marker = bytes[0];
        let item = match marker {
            0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => Self::fixed(1),
            0x80..=0x8f => Some(Self {
                size: 1,
                children: u64::from(marker & 0x0f) * 2,
            }),
            0x90..=0x9f => Some(Self {
                size: 1,
                children: u64::from(marker & 0x0f),
            }),
            0xa0..=0xbf => Self::fixed(1 + usize::from(marker & 0x1f)),
            0xcc | 0xd0 => Self::fixed(2),
            0xcd | 0xd1 => Self::fixed(3),
            0xca | 0xce | 0xd2 => Self::fixed(5),
            0xcb | 0xcf | 0xd3 => Self::fixed(9),
            0xd4 => Self::fixed(3),
            0xd5 => Self::fixed(4),
            0xd6 => Self::fixed(6),
            0xd7 => Self::fixed(10),
            0xd8 => Self::fixed(18),
            0xc4 | 0xd9 => body(bytes, 1, 0),
            0xc5 | 0xda => body(bytes, 2, 0),
            0xc6 | 0xdb => body(bytes, 4, 0),
            0xc7 => body(bytes, 1, 1),
            0xc8 => body(bytes, 2, 1),
            0xc9 => body(bytes, 4, 1),
            0xdc => count(bytes, 2, 1),
            0xdd => count(bytes, 4, 1),
            0xde => count(bytes, 2, 2),
            0xdf => count(bytes, 4, 2),
            0xc1 => {
                return Err(RpcError::Protocol(
                    "invalid msgpack: reserved marker 0xc1".to_string(),
                ))
            }
        };
        Ok(item)
    }
}

/// Big-endian length prefix of `width` bytes following the marker.
fn length(bytes: &[u8], width: usize) -> Option<u64> {
    let prefix = bytes.get(1..1 + width)?;
    Some(prefix.iter().fold(0u64, |n, b| (n << 8) | u64::from(*b)))
}

/// Str, bin or ext: prefix, `extra` type bytes, then that many body bytes.
fn body(bytes: &[u8], width: usize, extra: usize) -> Option<Item> {
    let len = usize::try_from(length(bytes, width)?).ok()?;
    Some(Item {
        size: (1 + width + extra).checked_add(len)?,
        children: 0,
    })
}

/// Array or map: prefix, then `len * per_entry` child items.
fn count(bytes: &[u8], width: usize, per_entry: u64) -> Option<Item> {
    Some(Item {
        size: 1 + width,
        children: length(bytes, width)? * per_entry,
    })
}

impl Default for EnvelopeBuffer {
    fn default() -> Self {
        Self::new()
    }
}
