//! Rendered audio awaiting transmission
//!
//! A chunk is a block of rendered PCM plus a cursor of how far the protocol
//! client has consumed it. The worker owns at most one chunk at a time and
//! replaces it wholesale once it has been fully consumed.

use bytes::Bytes;

/// Block of rendered audio with a consumption cursor
#[derive(Debug, Clone)]
pub struct Chunk {
    block: Bytes,
    /// Offset of the first unconsumed byte within `block`
    index: usize,
}

impl Chunk {
    pub fn new(block: Bytes) -> Self {
        Self { block, index: 0 }
    }

    /// Current consumption offset within the block
    pub fn index(&self) -> usize {
        self.index
    }

    /// Bytes not yet handed to the client
    pub fn remaining(&self) -> &[u8] {
        &self.block[self.index..]
    }

    /// Number of bytes not yet handed to the client
    pub fn len(&self) -> usize {
        self.block.len() - self.index
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark `n` bytes as consumed, returning how many were actually consumed
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        self.index += n;
        n
    }

    /// Whole underlying block, including consumed bytes
    pub fn block(&self) -> &Bytes {
        &self.block
    }
}
