//! Merkle hash tree over byte streams
//!
//! A stream is cut into fixed-size leaf blocks. Leaf addresses are collected
//! into interior nodes, which are stored as blocks themselves, level by level
//! until a single root remains.
//!
//! Every block starts with a depth byte:
//! ```text
//! depth 0:  [0][raw payload ...]
//! depth n:  [n][8 bytes LE offset][32 bytes address] ...
//! ```
//! Interior offsets are absolute stream offsets of the first byte under each
//! child, so any position can be found with one binary search per level.

mod reader;
mod writer;

pub use reader::TreeReader;
pub use writer::TreeWriter;

use crate::blob::{BlobError, BlobResult, Hash, HASH_SIZE};

/// Default maximum block size, depth byte included
pub const DEFAULT_BLOCK_SIZE: usize = 65536;

/// Size of the depth byte that starts every node
pub const NODE_HEADER: usize = 1;

/// Size of one interior entry: offset + address
pub const ENTRY_SIZE: usize = 8 + HASH_SIZE;

/// Smallest block size that still gives interior nodes a fan-out of two
pub const MIN_BLOCK_SIZE: usize = NODE_HEADER + 2 * ENTRY_SIZE;

/// Address and depth of a finished tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Root {
    pub hash: Hash,
    pub depth: u8,
}

/// Number of entries an interior node of `block_size` bytes can hold
pub fn fanout(block_size: usize) -> usize {
    block_size.saturating_sub(NODE_HEADER) / ENTRY_SIZE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entry {
    pub offset: u64,
    pub hash: Hash,
}

#[derive(Debug)]
pub(crate) enum Node {
    Leaf(Vec<u8>),
    Interior { depth: u8, entries: Vec<Entry> },
}

impl Node {
    pub fn depth(&self) -> u8 {
        match self {
            Node::Leaf(_) => 0,
            Node::Interior { depth, .. } => *depth,
        }
    }
}

pub(crate) fn encode_leaf(payload: &[u8]) -> Vec<u8> {
    let mut block = Vec::with_capacity(NODE_HEADER + payload.len());
    block.push(0);
    block.extend_from_slice(payload);
    block
}

pub(crate) fn encode_interior(depth: u8, entries: &[Entry]) -> Vec<u8> {
    let mut block = Vec::with_capacity(NODE_HEADER + entries.len() * ENTRY_SIZE);
    block.push(depth);
    for entry in entries {
        block.extend_from_slice(&entry.offset.to_le_bytes());
        block.extend_from_slice(entry.hash.as_bytes());
    }
    block
}

pub(crate) fn decode_node(hash: &Hash, mut block: Vec<u8>) -> BlobResult<Node> {
    let depth = match block.first() {
        Some(d) => *d,
        None => return Err(BlobError::Corrupted(format!("empty tree node {}", hash))),
    };

    if depth == 0 {
        block.remove(0);
        return Ok(Node::Leaf(block));
    }

    let body = &block[NODE_HEADER..];
    if body.is_empty() || body.len() % ENTRY_SIZE != 0 {
        return Err(BlobError::Corrupted(format!(
            "tree node {} has bad length {}",
            hash,
            block.len()
        )));
    }

    let mut entries = Vec::with_capacity(body.len() / ENTRY_SIZE);
    let mut prev: Option<u64> = None;
    for chunk in body.chunks_exact(ENTRY_SIZE) {
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&chunk[..8]);
        let offset = u64::from_le_bytes(offset);
        if prev.is_some_and(|p| p >= offset) {
            return Err(BlobError::Corrupted(format!(
                "tree node {} offsets not increasing",
                hash
            )));
        }
        prev = Some(offset);
        // chunk[8..] is exactly HASH_SIZE long
        let child = Hash::from_slice(&chunk[8..])
            .ok_or_else(|| BlobError::Corrupted(format!("tree node {} truncated", hash)))?;
        entries.push(Entry { offset, hash: child });
    }

    Ok(Node::Interior { depth, entries })
}
