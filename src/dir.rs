//! Directory listings stored as hash trees
//!
//! A directory is one stream of records, sorted by name:
//! ```text
//! [name len: 2 LE][name][size: 8 LE][mode: 4 LE][mod time: 8 LE][address: 32]
//! ```
//! The first record is always `"."` and carries the directory's own mode.

use crate::blob::{BlobError, BlobReader, BlobWriter, Hash, HASH_SIZE};
use crate::htree::{Root, TreeReader, TreeWriter};
use byteorder::{ByteOrder, LittleEndian};
use std::io::Read;
use thiserror::Error;

/// Mode bit marking a directory
pub const MODE_DIR: u32 = 1 << 31;

/// Name of the self entry
pub const SELF_NAME: &str = ".";

const FIXED_RECORD: usize = 2 + 8 + 4 + 8 + HASH_SIZE;

/// Directory errors
#[derive(Debug, Error)]
pub enum DirError {
    #[error("block error: {0}")]
    Blob(#[from] BlobError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("duplicate directory entry {0:?}")]
    DuplicateName(String),

    #[error("invalid directory entry name {0:?}")]
    InvalidName(String),

    #[error("malformed directory: {0}")]
    Malformed(String),
}

/// Result type for directory operations
pub type DirResult<T> = Result<T, DirError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    /// Seconds since the Unix epoch
    pub mod_time: i64,
    /// Address of the file's tree, or the subdirectory's listing
    pub hash: Hash,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & MODE_DIR != 0
    }
}

/// Write `entries` as a directory with permission bits `mode`.
///
/// Entries may come in any order. Names must be unique, non-empty, free of
/// `/`, not `"."`, and at most 65535 bytes.
pub fn write_dir<W: BlobWriter>(store: W, entries: &[DirEntry], mode: u32) -> DirResult<Root> {
    let mut sorted: Vec<&DirEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    for entry in &sorted {
        let name = &entry.name;
        if name.is_empty() || name == SELF_NAME || name.contains('/') || name.len() > u16::MAX as usize {
            return Err(DirError::InvalidName(name.clone()));
        }
    }
    for pair in sorted.windows(2) {
        if pair[0].name == pair[1].name {
            return Err(DirError::DuplicateName(pair[0].name.clone()));
        }
    }

    let capacity = (sorted.len() + 1) * FIXED_RECORD + sorted.iter().map(|e| e.name.len()).sum::<usize>();
    let mut buf = Vec::with_capacity(capacity + SELF_NAME.len());
    let self_entry = DirEntry {
        name: SELF_NAME.to_string(),
        size: 0,
        mode: mode | MODE_DIR,
        mod_time: 0,
        hash: Hash::from_bytes([0; HASH_SIZE]),
    };
    encode_entry(&mut buf, &self_entry);
    for entry in sorted {
        encode_entry(&mut buf, entry);
    }

    let mut tree = TreeWriter::new(store);
    tree.write_bytes(&buf)?;
    Ok(tree.close()?)
}

fn encode_entry(buf: &mut Vec<u8>, entry: &DirEntry) {
    buf.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
    buf.extend_from_slice(entry.name.as_bytes());
    buf.extend_from_slice(&entry.size.to_le_bytes());
    buf.extend_from_slice(&entry.mode.to_le_bytes());
    buf.extend_from_slice(&entry.mod_time.to_le_bytes());
    buf.extend_from_slice(entry.hash.as_bytes());
}

/// Read the directory stored at `hash`. The `"."` entry reports `hash`
/// as its address.
pub fn read_dir<R: BlobReader>(store: R, hash: &Hash) -> DirResult<Vec<DirEntry>> {
    let mut tree = TreeReader::open(store, hash)?;
    // grows with the data actually read, not the size the root claims
    let mut data = Vec::new();
    tree.read_to_end(&mut data)?;
    if data.len() as u64 != tree.size() {
        return Err(DirError::Malformed("directory stream ended early".to_string()));
    }

    let mut entries = Vec::new();
    let mut rest = data.as_slice();
    while !rest.is_empty() {
        let (entry, tail) = decode_entry(rest)?;
        entries.push(entry);
        rest = tail;
    }

    match entries.first_mut() {
        Some(first) if first.name == SELF_NAME => first.hash = *hash,
        _ => return Err(DirError::Malformed("missing self entry".to_string())),
    }
    Ok(entries)
}

fn decode_entry(data: &[u8]) -> DirResult<(DirEntry, &[u8])> {
    let truncated = || DirError::Malformed("truncated entry".to_string());
    if data.len() < 2 {
        return Err(truncated());
    }
    let name_len = LittleEndian::read_u16(data) as usize;
    let record_len = FIXED_RECORD + name_len;
    if data.len() < record_len {
        return Err(truncated());
    }

    let (record, rest) = data.split_at(record_len);
    let name = std::str::from_utf8(&record[2..2 + name_len])
        .map_err(|_| DirError::Malformed("entry name is not utf-8".to_string()))?
        .to_string();
    let fixed = &record[2 + name_len..];
    let hash = Hash::from_slice(&fixed[20..]).ok_or_else(truncated)?;

    Ok((
        DirEntry {
            name,
            size: LittleEndian::read_u64(&fixed[0..8]),
            mode: LittleEndian::read_u32(&fixed[8..12]),
            mod_time: LittleEndian::read_i64(&fixed[12..20]),
            hash,
        },
        rest,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemBlobStore;
    use crate::htree::{encode_interior, encode_leaf, Entry};

    fn entry(name: &str, size: u64, mode: u32) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            size,
            mode,
            mod_time: 1_700_000_000,
            hash: Hash::from_data(name.as_bytes()),
        }
    }

    #[test]
    fn test_write_read_dir() {
        let mut store = MemBlobStore::new();
        let entries = vec![entry("Foo", 0xffffff, 0xffffff), entry("Bar", 4, 5)];
        let root = write_dir(&mut store, &entries, 0o755).unwrap();

        let got = read_dir(&store, &root.hash).unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].name, ".");
        assert_eq!(got[0].mode, 0o755 | MODE_DIR);
        assert_eq!(got[0].hash, root.hash);
        assert!(got[0].is_dir());
        assert_eq!(got[1], entries[1]);
        assert_eq!(got[2], entries[0]);
    }

    #[test]
    fn test_empty_dir() {
        let mut store = MemBlobStore::new();
        let root = write_dir(&mut store, &[], 0o700).unwrap();
        let got = read_dir(&store, &root.hash).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, ".");
    }

    #[test]
    fn test_large_dir_spans_blocks() {
        let mut store = MemBlobStore::new();
        let entries: Vec<DirEntry> = (0..3000).map(|i| entry(&format!("file{:05}", i), i, 0o644)).collect();
        let root = write_dir(&mut store, &entries, 0o755).unwrap();
        assert!(root.depth > 0);

        let got = read_dir(&store, &root.hash).unwrap();
        assert_eq!(got.len(), 3001);
        assert_eq!(&got[1..], &entries[..]);
    }

    #[test]
    fn test_rejects_bad_names() {
        let mut store = MemBlobStore::new();
        let dup = vec![entry("a", 1, 0), entry("a", 2, 0)];
        assert!(matches!(write_dir(&mut store, &dup, 0), Err(DirError::DuplicateName(_))));

        for name in [".", "", "a/b"] {
            let bad = vec![entry(name, 1, 0)];
            assert!(matches!(write_dir(&mut store, &bad, 0), Err(DirError::InvalidName(_))));
        }

        let long = vec![entry(&"x".repeat(65536), 1, 0)];
        assert!(matches!(write_dir(&mut store, &long, 0), Err(DirError::InvalidName(_))));
        assert!(write_dir(&mut store, &[entry(&"x".repeat(65535), 1, 0)], 0).is_ok());
    }

    #[test]
    fn test_truncated_dir() {
        let mut store = MemBlobStore::new();
        let mut tree = TreeWriter::new(&mut store);
        tree.write_bytes(&[3, 0, b'a', b'b']).unwrap();
        let root = tree.close().unwrap();
        assert!(matches!(read_dir(&store, &root.hash), Err(DirError::Malformed(_))));
    }

    #[test]
    fn test_bogus_size_fails_without_allocating() {
        let mut store = MemBlobStore::new();
        let leaf = store.put(&encode_leaf(b"x")).unwrap();
        let far = store.put(&encode_leaf(b"y")).unwrap();
        // claims a stream of about 2^62 bytes
        let entries = [
            Entry { offset: 0, hash: leaf },
            Entry { offset: 1 << 62, hash: far },
        ];
        let root = store.put(&encode_interior(1, &entries)).unwrap();

        assert!(read_dir(&store, &root).is_err());
    }
}
