//! Streaming hash tree encoder

use super::{encode_interior, encode_leaf, fanout, Entry, Root, DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE, NODE_HEADER};
use crate::blob::{BlobError, BlobResult, BlobWriter};
use std::io;

/// Builds a hash tree from bytes written to it.
///
/// `levels[i]` holds the entries of the depth `i + 1` node currently being
/// filled. A node is flushed into the level above only when a new entry
/// would overflow it, so after any write every existing level is non-empty.
pub struct TreeWriter<W: BlobWriter> {
    store: W,
    leaf_capacity: usize,
    fanout: usize,
    leaf: Vec<u8>,
    levels: Vec<Vec<Entry>>,
    written: u64,
}

impl<W: BlobWriter> TreeWriter<W> {
    /// Create a writer using the default block size
    pub fn new(store: W) -> Self {
        Self::build(store, DEFAULT_BLOCK_SIZE)
    }

    /// Create a writer whose blocks never exceed `block_size` bytes
    pub fn with_block_size(store: W, block_size: usize) -> BlobResult<Self> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(BlobError::Backend(format!(
                "block size {} below minimum {}",
                block_size, MIN_BLOCK_SIZE
            )));
        }
        Ok(Self::build(store, block_size))
    }

    fn build(store: W, block_size: usize) -> Self {
        let leaf_capacity = block_size - NODE_HEADER;
        Self {
            store,
            leaf_capacity,
            fanout: fanout(block_size),
            leaf: Vec::with_capacity(leaf_capacity),
            levels: Vec::new(),
            written: 0,
        }
    }

    /// Number of bytes accepted so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append bytes to the stream, storing every leaf that fills up.
    pub fn write_bytes(&mut self, mut data: &[u8]) -> BlobResult<()> {
        while !data.is_empty() {
            let n = (self.leaf_capacity - self.leaf.len()).min(data.len());
            self.leaf.extend_from_slice(&data[..n]);
            self.written += n as u64;
            data = &data[n..];
            if self.leaf.len() == self.leaf_capacity {
                self.flush_leaf()?;
            }
        }
        Ok(())
    }

    /// Flush pending nodes bottom-up and return the root.
    pub fn close(mut self) -> BlobResult<Root> {
        if !self.leaf.is_empty() || self.levels.is_empty() {
            self.flush_leaf()?;
        }

        let mut level = 0;
        loop {
            let top = level + 1 == self.levels.len();
            if top && self.levels[level].len() == 1 {
                let entry = self.levels[level][0];
                return Ok(Root {
                    hash: entry.hash,
                    depth: level as u8,
                });
            }
            self.flush_level(level)?;
            level += 1;
        }
    }

    fn flush_leaf(&mut self) -> BlobResult<()> {
        let offset = self.written - self.leaf.len() as u64;
        let hash = self.store.put(&encode_leaf(&self.leaf))?;
        self.leaf.clear();
        self.push_entry(0, Entry { offset, hash })
    }

    fn push_entry(&mut self, level: usize, entry: Entry) -> BlobResult<()> {
        if level == self.levels.len() {
            self.levels.push(Vec::with_capacity(self.fanout));
        }
        if self.levels[level].len() == self.fanout {
            self.flush_level(level)?;
        }
        self.levels[level].push(entry);
        Ok(())
    }

    fn flush_level(&mut self, level: usize) -> BlobResult<()> {
        let entries = std::mem::take(&mut self.levels[level]);
        let first = match entries.first() {
            Some(e) => e.offset,
            None => return Ok(()),
        };
        let depth = u8::try_from(level + 1)
            .map_err(|_| BlobError::Backend("hash tree too deep".to_string()))?;
        let hash = self.store.put(&encode_interior(depth, &entries))?;
        log::trace!("stored depth {} node {} ({} entries)", depth, hash, entries.len());
        self.push_entry(level + 1, Entry { offset: first, hash })
    }
}

impl<W: BlobWriter> io::Write for TreeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
