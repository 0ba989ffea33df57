//! Splitting buffers into size-bounded chunks and putting them back together.
//!
//! A logical buffer travels as one or more chunks. Every chunk but the last
//! is exactly `max_chunk_size` long; the last is flagged complete. An empty
//! buffer is a single empty, complete chunk.

use std::num::NonZeroUsize;

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;

/// A slice of a larger buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
    pub is_complete: bool,
}

impl Chunk {
    pub fn new(data: impl Into<Bytes>, is_complete: bool) -> Self {
        Self {
            data: data.into(),
            is_complete,
        }
    }
}

/// Split `buffer` into chunks of at most `max_chunk_size` bytes.
///
/// Chunks share the buffer's storage; nothing is copied.
pub fn split(buffer: Bytes, max_chunk_size: NonZeroUsize) -> Chunks {
    Chunks {
        remaining: buffer,
        max_chunk_size: max_chunk_size.get(),
        done: false,
    }
}

/// Iterator returned by [`split`].
#[derive(Debug)]
pub struct Chunks {
    remaining: Bytes,
    max_chunk_size: usize,
    done: bool,
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.done {
            return None;
        }
        if self.remaining.len() <= self.max_chunk_size {
            self.done = true;
            return Some(Chunk::new(std::mem::take(&mut self.remaining), true));
        }
        let data = self.remaining.split_to(self.max_chunk_size);
        Some(Chunk::new(data, false))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            return (0, Some(0));
        }
        let n = self.remaining.len().div_ceil(self.max_chunk_size).max(1);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Chunks {}

/// Concatenate chunks in arrival order.
pub fn reassemble<I>(chunks: I) -> Result<Bytes, ProtocolError>
where
    I: IntoIterator<Item = Chunk>,
{
    let mut pending = PendingBuffer::new();
    for chunk in chunks {
        pending.push(chunk)?;
    }
    pending.finish()
}

/// Chunks received so far for one logical buffer.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    chunks: Vec<Bytes>,
    complete: bool,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next chunk. A chunk after the terminal one is a protocol error.
    pub fn push(&mut self, chunk: Chunk) -> Result<(), ProtocolError> {
        if self.complete {
            return Err(ProtocolError::ChunkAfterComplete);
        }
        self.complete = chunk.is_complete;
        if !chunk.data.is_empty() {
            self.chunks.push(chunk.data);
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Flatten into one buffer; fails if the terminal chunk never arrived.
    pub fn finish(mut self) -> Result<Bytes, ProtocolError> {
        if !self.complete {
            return Err(ProtocolError::MissingTerminalChunk);
        }
        match self.chunks.len() {
            0 => Ok(Bytes::new()),
            1 => Ok(self.chunks.remove(0)),
            _ => {
                let mut out = BytesMut::with_capacity(self.len());
                for chunk in &self.chunks {
                    out.extend_from_slice(chunk);
                }
                Ok(out.freeze())
            }
        }
    }
}
