//! Pack file format
//!
//! A pack is an immutable file of stored block payloads followed by a sorted
//! index and a fixed trailer:
//! ```text
//! [payload][payload]...[index record]...[index offset: 8 LE][index length: 8 LE]
//! index record = [32 byte address][8 byte LE payload offset]
//! ```
//! Records are sorted ascending by address so lookups are a binary search.
//! A payload runs from its offset to the next higher payload offset, or to
//! the start of the index for the last one.

mod reader;
mod writer;

pub use reader::PackReader;
pub use writer::PackWriter;

use crate::blob::{Hash, HASH_SIZE};
use crate::remote::RemoteError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::Ordering;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Size of one serialized index record
pub const INDEX_RECORD_SIZE: usize = HASH_SIZE + 8;

/// Size of the trailer at the end of every pack
pub const TRAILER_SIZE: u64 = 16;

/// Pack errors
#[derive(Debug, Error)]
pub enum PackError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("corrupt pack trailer: {0}")]
    BadTrailer(String),

    #[error("corrupt pack index: {0}")]
    BadIndex(String),

    #[error("duplicate key {0} in pack")]
    DuplicateKey(Hash),

    #[error("empty payload for key {0}")]
    EmptyPayload(Hash),

    #[error("short read at offset {offset}: wanted {wanted} bytes, got {got}")]
    ShortRead { offset: u64, wanted: usize, got: usize },
}

/// Result type for pack operations
pub type PackResult<T> = Result<T, PackError>;

/// Compare two keys: shorter keys sort first, equal lengths compare bytewise.
pub fn key_cmp(l: &[u8], r: &[u8]) -> Ordering {
    l.len().cmp(&r.len()).then_with(|| l.cmp(r))
}

/// One index record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Hash,
    pub offset: u64,
}

/// Sorted pack index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    entries: Vec<IndexEntry>,
}

impl Index {
    /// Build an index from entries in any order. Duplicate keys are rejected.
    pub fn from_entries(mut entries: Vec<IndexEntry>) -> PackResult<Self> {
        entries.sort_by(|a, b| key_cmp(a.key.as_bytes(), b.key.as_bytes()));
        for pair in entries.windows(2) {
            if pair[0].key == pair[1].key {
                return Err(PackError::DuplicateKey(pair[0].key));
            }
        }
        Ok(Self { entries })
    }

    /// Build an index from entries that must already be strictly ascending.
    pub fn from_sorted(entries: Vec<IndexEntry>) -> PackResult<Self> {
        for pair in entries.windows(2) {
            if key_cmp(pair[0].key.as_bytes(), pair[1].key.as_bytes()) != Ordering::Less {
                return Err(PackError::BadIndex(format!(
                    "keys out of order at {}",
                    pair[1].key
                )));
            }
        }
        Ok(Self { entries })
    }

    /// Binary search for `key`, returning its position.
    pub fn search(&self, key: &[u8]) -> Option<usize> {
        let (mut lo, mut hi) = (0usize, self.entries.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match key_cmp(self.entries[mid].key.as_bytes(), key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    /// Look up the record for `key`
    pub fn get(&self, key: &Hash) -> Option<&IndexEntry> {
        self.search(key.as_bytes()).map(|i| &self.entries[i])
    }

    pub fn contains(&self, key: &Hash) -> bool {
        self.search(key.as_bytes()).is_some()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialized size in bytes
    pub fn encoded_len(&self) -> u64 {
        (self.entries.len() * INDEX_RECORD_SIZE) as u64
    }

    /// Write fixed-size records in index order
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        for entry in &self.entries {
            w.write_all(entry.key.as_bytes())?;
            w.write_u64::<LittleEndian>(entry.offset)?;
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len() as usize);
        for entry in &self.entries {
            buf.extend_from_slice(entry.key.as_bytes());
            buf.extend_from_slice(&entry.offset.to_le_bytes());
        }
        buf
    }

    /// Parse serialized records, checking order and uniqueness.
    pub fn decode(bytes: &[u8]) -> PackResult<Self> {
        if bytes.len() % INDEX_RECORD_SIZE != 0 {
            return Err(PackError::BadIndex(format!(
                "length {} is not a multiple of {}",
                bytes.len(),
                INDEX_RECORD_SIZE
            )));
        }

        let mut entries = Vec::with_capacity(bytes.len() / INDEX_RECORD_SIZE);
        let mut cursor = bytes;
        while !cursor.is_empty() {
            let mut key = [0u8; HASH_SIZE];
            cursor.read_exact(&mut key)?;
            let offset = cursor.read_u64::<LittleEndian>()?;
            entries.push(IndexEntry {
                key: Hash::from_bytes(key),
                offset,
            });
        }
        Self::from_sorted(entries)
    }

    /// Read a whole serialized index, e.g. from a local cache file
    pub fn read_from<R: Read>(r: &mut R) -> PackResult<Self> {
        let mut bytes = Vec::new();
        r.read_to_end(&mut bytes)?;
        Self::decode(&bytes)
    }
}
