//! In-memory block store

use super::{BlobError, BlobReader, BlobResult, BlobWriter, Hash};
use std::collections::HashMap;

/// Block store kept entirely in memory.
///
/// Useful as a staging area and as the store behind hash tree tests.
#[derive(Debug, Default)]
pub struct MemBlobStore {
    blocks: HashMap<Hash, Vec<u8>>,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blocks stored
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlobReader for MemBlobStore {
    fn get(&self, hash: &Hash) -> BlobResult<Vec<u8>> {
        self.blocks
            .get(hash)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(hash.to_hex()))
    }
}

impl BlobWriter for MemBlobStore {
    fn put(&mut self, data: &[u8]) -> BlobResult<Hash> {
        let hash = Hash::from_data(data);
        self.blocks.entry(hash).or_insert_with(|| data.to_vec());
        Ok(hash)
    }
}
