//! Per-allocation metadata, keyed by the pointer the caller got back.

use ahash::RandomState;
use hashbrown::HashMap;

use crate::stack::CallFrames;

/// One live allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// The user pointer, i.e. just past the size header
    pub address: usize,
    /// How many bytes were asked for
    pub size: usize,
    /// Where it was asked for
    pub frames: CallFrames,
}

impl Chunk {
    pub const fn new(address: usize, size: usize, frames: CallFrames) -> Self {
        Self {
            address,
            size,
            frames,
        }
    }
}

pub struct ChunkRegistry {
    chunks: HashMap<usize, Chunk, RandomState>,
}

impl ChunkRegistry {
    pub fn new() -> Self {
        Self {
            chunks: HashMap::with_hasher(RandomState::new()),
        }
    }

    /// Register a chunk.
    ///
    /// # Panics
    /// - If a live chunk is already registered at the same address. The page
    ///   bitmap handed out one run twice, and nothing after this can be
    ///   trusted.
    pub fn insert(&mut self, chunk: Chunk) {
        if let Some(old) = self.chunks.insert(chunk.address, chunk) {
            panic!(
                "chunk registered twice at {:#x} (old size {}, new size {})",
                chunk.address, old.size, chunk.size
            );
        }
    }

    pub fn remove(&mut self, address: usize) -> Option<Chunk> {
        self.chunks.remove(&address)
    }

    pub fn get(&self, address: usize) -> Option<&Chunk> {
        self.chunks.get(&address)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    /// Chunks sorted by address, for stable reports
    pub fn sorted(&self) -> Vec<&Chunk> {
        let mut chunks: Vec<_> = self.chunks.values().collect();
        chunks.sort_unstable_by_key(|chunk| chunk.address);
        chunks
    }
}

impl Default for ChunkRegistry {
    fn default() -> Self {
        Self::new()
    }
}
