//! Pack file writer

use super::{Index, IndexEntry, PackError, PackResult};
use crate::blob::Hash;
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::HashSet;
use std::io::Write;

/// Appends payloads to a pack stream and finishes it with the index.
pub struct PackWriter<W: Write> {
    out: W,
    offset: u64,
    entries: Vec<IndexEntry>,
    keys: HashSet<Hash>,
}

impl<W: Write> PackWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            offset: 0,
            entries: Vec::new(),
            keys: HashSet::new(),
        }
    }

    /// Bytes of payload written so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of payloads written so far
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &Hash) -> bool {
        self.keys.contains(key)
    }

    /// Append one payload under `key`.
    ///
    /// Payloads must be non-empty so that every offset in the pack is
    /// distinct and payload lengths can be recovered from the index.
    pub fn add(&mut self, key: Hash, payload: &[u8]) -> PackResult<()> {
        if payload.is_empty() {
            return Err(PackError::EmptyPayload(key));
        }
        if !self.keys.insert(key) {
            return Err(PackError::DuplicateKey(key));
        }
        self.out.write_all(payload)?;
        self.entries.push(IndexEntry {
            key,
            offset: self.offset,
        });
        self.offset += payload.len() as u64;
        Ok(())
    }

    /// Abandon the pack, returning the underlying writer unfinished
    pub fn into_inner(self) -> W {
        self.out
    }

    /// Write the sorted index and trailer.
    /// Returns the underlying writer and the index that was written.
    pub fn finish(mut self) -> PackResult<(W, Index)> {
        let index = Index::from_entries(std::mem::take(&mut self.entries))?;
        index.write_to(&mut self.out)?;
        self.out.write_u64::<LittleEndian>(self.offset)?;
        self.out.write_u64::<LittleEndian>(index.encoded_len())?;
        self.out.flush()?;
        log::debug!(
            "finished pack: {} payloads, {} data bytes",
            index.len(),
            self.offset
        );
        Ok((self.out, index))
    }
}
