//! Pack file reader

use super::{Index, PackError, PackResult, INDEX_RECORD_SIZE, TRAILER_SIZE};
use crate::blob::Hash;
use crate::remote::RemoteFile;

/// Random access to the payloads of one pack.
pub struct PackReader {
    file: Box<dyn RemoteFile>,
    index_offset: u64,
    index: Index,
    /// payload offsets in file order
    offsets: Vec<u64>,
}

impl PackReader {
    /// Open a pack of `size` bytes, loading its index from the file.
    pub fn open(file: Box<dyn RemoteFile>, size: u64) -> PackResult<Self> {
        let (index_offset, index_len) = read_trailer(file.as_ref(), size)?;
        let bytes = read_full(file.as_ref(), index_offset, index_len as usize)?;
        let index = Index::decode(&bytes)?;
        Self::build(file, index_offset, index)
    }

    /// Open a pack whose index is already known, e.g. from a local cache.
    pub fn with_index(file: Box<dyn RemoteFile>, size: u64, index: Index) -> PackResult<Self> {
        let (index_offset, index_len) = read_trailer(file.as_ref(), size)?;
        if index_len != index.encoded_len() {
            return Err(PackError::BadIndex(format!(
                "cached index has {} records, pack has {}",
                index.len(),
                index_len / INDEX_RECORD_SIZE as u64
            )));
        }
        Self::build(file, index_offset, index)
    }

    fn build(file: Box<dyn RemoteFile>, index_offset: u64, index: Index) -> PackResult<Self> {
        let mut offsets: Vec<u64> = index.entries().iter().map(|e| e.offset).collect();
        offsets.sort_unstable();
        for pair in offsets.windows(2) {
            if pair[0] == pair[1] {
                return Err(PackError::BadIndex(format!("two payloads at offset {}", pair[0])));
            }
        }
        if offsets.last().is_some_and(|&o| o >= index_offset) {
            return Err(PackError::BadIndex("payload offset inside index".to_string()));
        }

        Ok(Self {
            file,
            index_offset,
            index,
            offsets,
        })
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Fetch the stored payload for `key`, or `None` if the pack lacks it.
    pub fn get(&self, key: &Hash) -> PackResult<Option<Vec<u8>>> {
        let entry = match self.index.get(key) {
            Some(e) => *e,
            None => return Ok(None),
        };

        let next = self.offsets.partition_point(|&o| o <= entry.offset);
        let end = self.offsets.get(next).copied().unwrap_or(self.index_offset);
        let data = read_full(self.file.as_ref(), entry.offset, (end - entry.offset) as usize)?;
        Ok(Some(data))
    }

    /// Release the underlying file handle
    pub fn close(mut self) -> PackResult<()> {
        self.file.close()?;
        Ok(())
    }
}

/// Read and check the trailer, returning (index offset, index length).
fn read_trailer(file: &dyn RemoteFile, size: u64) -> PackResult<(u64, u64)> {
    if size < TRAILER_SIZE {
        return Err(PackError::BadTrailer(format!("pack of {} bytes has no trailer", size)));
    }
    let trailer = read_full(file, size - TRAILER_SIZE, TRAILER_SIZE as usize)?;
    let mut word = [0u8; 8];
    word.copy_from_slice(&trailer[..8]);
    let index_offset = u64::from_le_bytes(word);
    word.copy_from_slice(&trailer[8..]);
    let index_len = u64::from_le_bytes(word);

    let expected = index_offset
        .checked_add(index_len)
        .and_then(|n| n.checked_add(TRAILER_SIZE));
    if expected != Some(size) {
        return Err(PackError::BadTrailer(format!(
            "index at {} of {} bytes does not fit pack of {} bytes",
            index_offset, index_len, size
        )));
    }
    if index_len % INDEX_RECORD_SIZE as u64 != 0 {
        return Err(PackError::BadTrailer(format!("index length {} not a record multiple", index_len)));
    }
    Ok((index_offset, index_len))
}

/// Read exactly `len` bytes at `offset`, looping over short reads.
pub(crate) fn read_full(file: &dyn RemoteFile, offset: u64, len: usize) -> PackResult<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        let at = offset + out.len() as u64;
        let chunk = file.read_at(at, len - out.len())?;
        if chunk.is_empty() {
            return Err(PackError::ShortRead {
                offset,
                wanted: len,
                got: out.len(),
            });
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::super::PackWriter;
    use super::*;
    use crate::remote::MemFile;
    use std::sync::atomic::Ordering;

    fn build_pack(items: &[(&[u8], Vec<u8>)]) -> (Vec<u8>, Index) {
        let mut w = PackWriter::new(Vec::new());
        for (seed, payload) in items {
            w.add(Hash::from_data(seed), payload).unwrap();
        }
        w.finish().unwrap()
    }

    fn sample() -> Vec<(&'static [u8], Vec<u8>)> {
        vec![
            (b"one", b"first payload".to_vec()),
            (b"two", vec![2u8; 300]),
            (b"three", b"x".to_vec()),
            (b"four", (0..=255u8).collect()),
        ]
    }

    #[test]
    fn test_get_every_payload() {
        let items = sample();
        let (bytes, index) = build_pack(&items);
        let size = bytes.len() as u64;
        let reader = PackReader::open(Box::new(MemFile::new(bytes)), size).unwrap();
        assert_eq!(reader.index(), &index);

        for (seed, payload) in &items {
            assert_eq!(reader.get(&Hash::from_data(seed)).unwrap().as_ref(), Some(payload));
        }
        assert!(reader.get(&Hash::from_data(b"never")).unwrap().is_none());
    }

    #[test]
    fn test_with_cached_index() {
        let items = sample();
        let (bytes, index) = build_pack(&items);
        let size = bytes.len() as u64;
        let reader = PackReader::with_index(Box::new(MemFile::new(bytes)), size, index).unwrap();
        assert_eq!(
            reader.get(&Hash::from_data(b"two")).unwrap(),
            Some(vec![2u8; 300])
        );
    }

    #[test]
    fn test_cached_index_mismatch() {
        let (bytes, _) = build_pack(&sample());
        let size = bytes.len() as u64;
        let result = PackReader::with_index(Box::new(MemFile::new(bytes)), size, Index::default());
        assert!(matches!(result, Err(PackError::BadIndex(_))));
    }

    #[test]
    fn test_empty_pack() {
        let (bytes, index) = build_pack(&[]);
        assert_eq!(bytes.len() as u64, TRAILER_SIZE);
        assert!(index.is_empty());
        let reader = PackReader::open(Box::new(MemFile::new(bytes)), TRAILER_SIZE).unwrap();
        assert!(reader.get(&Hash::from_data(b"x")).unwrap().is_none());
    }

    #[test]
    fn test_bad_trailer() {
        let (mut bytes, _) = build_pack(&sample());
        let size = bytes.len() as u64;
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        let result = PackReader::open(Box::new(MemFile::new(bytes)), size);
        assert!(matches!(result, Err(PackError::BadTrailer(_))));

        let result = PackReader::open(Box::new(MemFile::new(vec![0u8; 8])), 8);
        assert!(matches!(result, Err(PackError::BadTrailer(_))));
    }

    #[test]
    fn test_truncated_pack() {
        let (bytes, _) = build_pack(&sample());
        let size = bytes.len() as u64;
        // claim a larger size than the file holds
        let result = PackReader::open(Box::new(MemFile::new(bytes)), size + 40);
        assert!(result.is_err());
    }

    #[test]
    fn test_writer_rejects_duplicates_and_empty() {
        let mut w = PackWriter::new(Vec::new());
        let key = Hash::from_data(b"k");
        w.add(key, b"data").unwrap();
        assert!(matches!(w.add(key, b"again"), Err(PackError::DuplicateKey(_))));
        assert!(matches!(
            w.add(Hash::from_data(b"e"), b""),
            Err(PackError::EmptyPayload(_))
        ));
        assert_eq!(w.len(), 1);
        assert_eq!(w.offset(), 4);
    }

    #[test]
    fn test_close_releases_file() {
        let (bytes, _) = build_pack(&sample());
        let size = bytes.len() as u64;
        let file = MemFile::new(bytes);
        let closes = file.close_counter();
        let reader = PackReader::open(Box::new(file), size).unwrap();
        reader.close().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
