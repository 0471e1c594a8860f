//! Growable byte buffer
//!
//! `MemoryBuffer` backs every incremental parser in the crate. It owns one
//! byte array with a logical length, a physical capacity and a read cursor
//! (`position`). Parsers append raw socket bytes with `write`, scan them
//! through the indexer and mark consumed bytes with `shift` instead of
//! copying them out.
//!
//! Invariants: `len() <= capacity()` and `position() <= len()` (except after
//! an explicit `shift` past the end, which callers never do).

use std::ops::Index;

/// Result type for buffer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Buffer errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Range {position}+{length} is out of buffer bounds ({size})")]
    OutOfRange {
        position: usize,
        length: usize,
        size: usize,
    },
}

/// Growable byte buffer with a read cursor
#[derive(Debug, Clone, Default)]
pub struct MemoryBuffer {
    data: Vec<u8>,
    length: usize,
    position: usize,
}

impl MemoryBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        MemoryBuffer {
            data: Vec::new(),
            length: 0,
            position: 0,
        }
    }

    /// Create an empty buffer with the given physical capacity
    pub fn with_capacity(capacity: usize) -> Self {
        MemoryBuffer {
            data: vec![0; capacity],
            length: 0,
            position: 0,
        }
    }

    /// Create a buffer holding a copy of `bytes`
    pub fn from_slice(bytes: &[u8]) -> Self {
        MemoryBuffer {
            data: bytes.to_vec(),
            length: bytes.len(),
            position: 0,
        }
    }

    /// Logical size
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Physical size
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Read cursor
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes written so far
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.length]
    }

    /// Bytes written so far, as a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.length]
    }

    /// Bytes from the read cursor to the end
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.position.min(self.length)..self.length]
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    /// Grow the physical storage to hold at least `capacity` bytes
    ///
    /// Grows by doubling, or straight to `capacity` when doubling is not
    /// enough. Never shrinks.
    pub fn reserve(&mut self, capacity: usize) {
        if capacity > self.data.len() {
            let new_capacity = capacity.max(self.data.len() * 2);
            self.data.resize(new_capacity, 0);
        }
    }

    /// Set the logical length, growing storage if needed
    pub fn resize(&mut self, length: usize) {
        self.reserve(length);
        self.length = length;
        if self.position > self.length {
            self.position = self.length;
        }
    }

    /// Drop all content and reset the cursor (capacity is kept)
    pub fn clear(&mut self) {
        self.length = 0;
        self.position = 0;
    }

    /// Advance the read cursor without moving data
    pub fn shift(&mut self, amount: usize) {
        self.position += amount;
    }

    /// Move the read cursor back
    pub fn unshift(&mut self, amount: usize) {
        self.position = self.position.saturating_sub(amount);
    }

    /// Append one byte
    pub fn write_byte(&mut self, value: u8) -> usize {
        self.reserve(self.length + 1);
        self.data[self.length] = value;
        self.length += 1;
        1
    }

    /// Append a byte slice, returning the number of bytes written
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        if bytes.is_empty() {
            return 0;
        }
        self.reserve(self.length + bytes.len());
        self.data[self.length..self.length + bytes.len()].copy_from_slice(bytes);
        self.length += bytes.len();
        bytes.len()
    }

    /// Append the UTF-8 bytes of a string
    pub fn write_str(&mut self, text: &str) -> usize {
        self.write(text.as_bytes())
    }

    /// Decode `[position, position + length)` as UTF-8
    ///
    /// Invalid sequences are replaced, matching what a lenient peer sees.
    pub fn extract_string(&self, position: usize, length: usize) -> Result<String> {
        self.check_range(position, length)?;
        Ok(String::from_utf8_lossy(&self.data[position..position + length]).into_owned())
    }

    /// Remove `[position, position + length)`, shifting the tail left
    pub fn remove(&mut self, position: usize, length: usize) -> Result<()> {
        self.check_range(position, length)?;
        let end = position + length;
        self.data.copy_within(end..self.length, position);
        self.length -= length;

        if self.position >= end {
            self.position -= length;
        } else if self.position >= position {
            self.position = position.min(self.length);
        }
        Ok(())
    }

    fn check_range(&self, position: usize, length: usize) -> Result<()> {
        match position.checked_add(length) {
            Some(end) if end <= self.length => Ok(()),
            _ => Err(Error::OutOfRange {
                position,
                length,
                size: self.length,
            }),
        }
    }
}

impl Index<usize> for MemoryBuffer {
    type Output = u8;

    fn index(&self, index: usize) -> &u8 {
        &self.as_slice()[index]
    }
}

impl AsRef<[u8]> for MemoryBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}
