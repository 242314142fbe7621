//! Chunked transfer of text through the shared buffer.
//!
//! A message is moved as a sequence of chunks, each at most `capacity` text
//! units. There is no framing inside the buffer: the size word says how many
//! units are valid and the Full/Partial state says whether more follow.
//! Text units are Unicode scalar values, so every chunk decodes on its own.

use std::sync::atomic::Ordering;

use crate::error::Violation;
use crate::layout::Channel;

/// Copy up to `capacity` units of `message[write_offset..]` into the buffer.
///
/// Returns how many units were written.
pub fn encode_chunk(channel: &Channel, message: &[char], write_offset: usize) -> usize {
    let remaining = message.get(write_offset..).unwrap_or(&[]);
    let count = remaining.len().min(channel.capacity());

    for (slot, ch) in channel.buffer().iter().zip(&remaining[..count]) {
        // Published by the SeqCst state transition that follows.
        slot.store(*ch as u32, Ordering::Relaxed);
    }

    count
}

/// Read exactly `unit_count` units from the buffer as text.
pub fn decode_chunk(channel: &Channel, unit_count: usize) -> Result<String, Violation> {
    if unit_count > channel.capacity() {
        return Err(Violation::SizeExceedsCapacity {
            size: unit_count,
            capacity: channel.capacity(),
        });
    }

    let mut fragment = String::with_capacity(unit_count);
    for (index, slot) in channel.buffer()[..unit_count].iter().enumerate() {
        let unit = slot.load(Ordering::Relaxed);
        let ch = char::from_u32(unit).ok_or(Violation::InvalidTextUnit { index, unit })?;
        fragment.push(ch);
    }

    Ok(fragment)
}

/// One chunk placed in the buffer by a [`ChunkWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Units written.
    pub len: usize,
    /// Whether this chunk completes the message.
    pub is_final: bool,
}

/// Sender-side state for one logical message.
#[derive(Debug)]
pub struct ChunkWriter {
    units: Vec<char>,
    written: usize,
    finished: bool,
}

impl ChunkWriter {
    pub fn new(message: &str) -> Self {
        Self {
            units: message.chars().collect(),
            written: 0,
            finished: false,
        }
    }

    /// Total length of the message in text units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Whether the final chunk has been written.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Write the next chunk into the buffer.
    ///
    /// An empty message produces exactly one final chunk of length zero.
    /// Returns `None` once the final chunk has been written.
    pub fn next_chunk(&mut self, channel: &Channel) -> Option<Chunk> {
        if self.finished {
            return None;
        }

        let len = encode_chunk(channel, &self.units, self.written);
        self.written += len;
        self.finished = self.written == self.units.len();

        Some(Chunk {
            len,
            is_final: self.finished,
        })
    }
}

/// Receiver-side reassembly of one logical message.
#[derive(Debug, Default)]
pub struct ChunkReader {
    text: String,
    units: usize,
    chunks: usize,
}

impl ChunkReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `unit_count` units from the buffer and append them.
    pub fn read_chunk(&mut self, channel: &Channel, unit_count: usize) -> Result<(), Violation> {
        let fragment = decode_chunk(channel, unit_count)?;
        self.text.push_str(&fragment);
        self.units += unit_count;
        self.chunks += 1;
        Ok(())
    }

    /// Units received so far.
    pub fn units(&self) -> usize {
        self.units
    }

    /// Chunks received so far.
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn finish(self) -> String {
        self.text
    }
}
