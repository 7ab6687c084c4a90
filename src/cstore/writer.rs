//! Content store writer

use super::write_cached_index;
use crate::blob::codec::encode_block;
use crate::blob::{BlobError, BlobResult, BlobWriter, Hash};
use crate::config::StoreConfig;
use crate::htree::{TreeWriter, DEFAULT_BLOCK_SIZE};
use crate::pack::PackWriter;
use crate::remote::{PackSink, PackUpload, PACK_SUFFIX};
use std::collections::HashSet;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Default size at which a writer starts a new pack
pub const DEFAULT_MAX_PACK_SIZE: u64 = 64 * 1024 * 1024;

const UPLOAD_BUFFER: usize = 64 * 1024;

/// Adapts an upload to `io::Write` so a `PackWriter` can stream into it
struct UploadWriter {
    upload: Box<dyn PackUpload>,
}

impl Write for UploadWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.upload
            .write(buf)
            .map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct PendingPack {
    name: String,
    writer: PackWriter<BufWriter<UploadWriter>>,
}

/// Packs blocks and uploads them through a `PackSink`.
pub struct StoreWriter<S: PackSink> {
    sink: S,
    cache_dir: PathBuf,
    compress: bool,
    max_pack_size: u64,
    block_size: usize,
    written: HashSet<Hash>,
    pending: Option<PendingPack>,
    committed: Vec<String>,
}

impl<S: PackSink> StoreWriter<S> {
    pub fn new<P: AsRef<Path>>(sink: S, cache_dir: P) -> Self {
        Self {
            sink,
            cache_dir: cache_dir.as_ref().to_path_buf(),
            compress: true,
            max_pack_size: DEFAULT_MAX_PACK_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            written: HashSet::new(),
            pending: None,
            committed: Vec::new(),
        }
    }

    /// Build a writer from the `[store]` settings
    pub fn from_config(sink: S, config: &StoreConfig) -> Self {
        Self::new(sink, &config.cache_dir)
            .with_max_pack_size(config.max_pack_size)
            .with_compression(config.compress)
            .with_block_size(config.block_size)
    }

    /// Block size used by `tree_writer`
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_max_pack_size(mut self, max_pack_size: u64) -> Self {
        self.max_pack_size = max_pack_size.max(1);
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Start a hash tree that stores its blocks through this writer
    pub fn tree_writer(&mut self) -> BlobResult<TreeWriter<&mut Self>> {
        let block_size = self.block_size;
        TreeWriter::with_block_size(self, block_size)
    }

    /// Packs committed so far
    pub fn committed(&self) -> &[String] {
        &self.committed
    }

    /// Store a block, returning its address. Blocks already committed or
    /// pending in this writer are not stored again.
    pub fn put(&mut self, data: &[u8]) -> BlobResult<Hash> {
        let hash = Hash::from_data(data);
        let pending = self.pending.as_ref().is_some_and(|p| p.writer.contains(&hash));
        if pending || self.written.contains(&hash) {
            return Ok(hash);
        }

        let stored = encode_block(data, self.compress);
        if self.pending.is_none() {
            self.pending = Some(self.start_pack()?);
        }
        let full = match self.pending.as_mut() {
            Some(pending) => {
                pending.writer.add(hash, &stored)?;
                pending.writer.offset() >= self.max_pack_size
            }
            None => return Err(BlobError::Backend("no pack to write into".to_string())),
        };

        if full {
            self.flush()?;
        }
        Ok(hash)
    }

    fn start_pack(&self) -> BlobResult<PendingPack> {
        let name = format!("{}{}", hex::encode(rand::random::<[u8; 16]>()), PACK_SUFFIX);
        let upload = self.sink.new_pack(&name)?;
        log::debug!("started pack {}", name);
        Ok(PendingPack {
            name,
            writer: PackWriter::new(BufWriter::with_capacity(UPLOAD_BUFFER, UploadWriter { upload })),
        })
    }

    /// Commit the pending pack, if any, and cache its index.
    ///
    /// On failure the pending pack is gone and its blocks count as unwritten,
    /// so putting them again stores them in a fresh pack.
    pub fn flush(&mut self) -> BlobResult<()> {
        let PendingPack { name, writer } = match self.pending.take() {
            Some(p) => p,
            None => return Ok(()),
        };

        let (buffered, index) = writer.finish()?;
        let upload = buffered
            .into_inner()
            .map_err(|e| BlobError::Io(e.into_error()))?
            .upload;
        upload.close()?;
        write_cached_index(&self.cache_dir, &name, &index)?;

        log::info!("committed pack {} with {} blocks", name, index.len());
        self.written.extend(index.entries().iter().map(|e| e.key));
        self.committed.push(name);
        Ok(())
    }

    /// Commit any pending pack. Returns the names of all packs committed.
    pub fn close(mut self) -> BlobResult<Vec<String>> {
        self.flush()?;
        Ok(self.committed)
    }

    /// Discard the pending pack. Packs already committed stay.
    pub fn cancel(mut self) -> BlobResult<()> {
        if let Some(pending) = self.pending.take() {
            let (upload_writer, _) = pending.writer.into_inner().into_parts();
            upload_writer.upload.cancel()?;
            log::debug!("cancelled pack {}", pending.name);
        }
        Ok(())
    }
}

impl<S: PackSink> BlobWriter for StoreWriter<S> {
    fn put(&mut self, data: &[u8]) -> BlobResult<Hash> {
        StoreWriter::put(self, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cstore::StoreReader;
    use crate::htree::{TreeReader, TreeWriter};
    use crate::remote::{PackSource, RemoteError};
    use crate::server::PackServer;
    use std::io::Read;
    use tempfile::TempDir;

    fn server() -> (TempDir, PackServer) {
        let temp = TempDir::new().unwrap();
        let server = PackServer::open(temp.path().join("store")).unwrap();
        assert!(server.attach("key1").unwrap());
        (temp, server)
    }

    #[test]
    fn test_write_then_read() {
        let (temp, server) = server();
        let cache = temp.path().join("cache");

        let mut writer = StoreWriter::new(&server, &cache);
        let a = writer.put(b"alpha").unwrap();
        let b = writer.put(b"beta").unwrap();
        assert_eq!(writer.put(b"alpha").unwrap(), a);
        let packs = writer.close().unwrap();
        assert_eq!(packs.len(), 1);
        assert!(packs[0].ends_with(PACK_SUFFIX));
        assert_eq!(packs[0].len(), 32 + PACK_SUFFIX.len());

        let reader = StoreReader::open(&server, &cache, 5).unwrap();
        assert_eq!(reader.get(&a).unwrap(), b"alpha");
        assert_eq!(reader.get(&b).unwrap(), b"beta");
    }

    #[test]
    fn test_empty_writer_commits_nothing() {
        let (temp, server) = server();
        let writer = StoreWriter::new(&server, temp.path().join("cache"));
        assert!(writer.close().unwrap().is_empty());
        assert!(server.list_packs().unwrap().is_empty());
    }

    #[test]
    fn test_rotates_packs() {
        let (temp, server) = server();
        let cache = temp.path().join("cache");
        let mut writer = StoreWriter::new(&server, &cache)
            .with_max_pack_size(1000)
            .with_compression(false);

        let mut hashes = Vec::new();
        for i in 0..20u8 {
            hashes.push(writer.put(&[i; 300]).unwrap());
        }
        let packs = writer.close().unwrap();
        assert_eq!(packs.len(), 5);

        // index cache was written for every pack
        for name in &packs {
            assert!(cache.join(format!("{}.index", name)).exists());
        }

        let reader = StoreReader::open(&server, &cache, 2).unwrap();
        for (i, hash) in hashes.iter().enumerate() {
            assert_eq!(reader.get(hash).unwrap(), vec![i as u8; 300]);
        }
        reader.close().unwrap();
    }

    #[test]
    fn test_cancel_discards_pending() {
        let (temp, server) = server();
        let cache = temp.path().join("cache");
        let mut writer = StoreWriter::new(&server, &cache);
        writer.put(b"kept").unwrap();
        writer.flush().unwrap();
        writer.put(b"dropped").unwrap();
        writer.cancel().unwrap();

        let packs = server.list_packs().unwrap();
        assert_eq!(packs.len(), 1);
        let tmp_files = std::fs::read_dir(server.packs_dir())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().is_some_and(|x| x == "tmp"))
            .count();
        assert_eq!(tmp_files, 0);
    }

    #[test]
    fn test_tree_through_store() {
        let (temp, server) = server();
        let cache = temp.path().join("cache");
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();

        let mut writer = StoreWriter::new(&server, &cache)
            .with_max_pack_size(64 * 1024)
            .with_compression(false);
        let mut tree = TreeWriter::with_block_size(&mut writer, 4096).unwrap();
        tree.write_bytes(&data).unwrap();
        let root = tree.close().unwrap();
        assert!(root.depth > 0);
        assert!(writer.close().unwrap().len() > 1);

        let reader = StoreReader::open(&server, &cache, 2).unwrap();
        let mut out = Vec::new();
        TreeReader::open(&reader, &root.hash)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_gc_during_upload_fails_commit() {
        let (temp, server) = server();
        let mut writer = StoreWriter::new(&server, temp.path().join("cache"));
        writer.put(b"block").unwrap();

        server.start_gc().unwrap();
        server.stop_gc().unwrap();

        let err = writer.flush().unwrap_err();
        assert!(matches!(err, BlobError::Remote(RemoteError::Meta(_))));
        assert!(server.list_packs().unwrap().is_empty());
    }

    #[test]
    fn test_put_again_after_failed_commit() {
        let (temp, server) = server();
        let cache = temp.path().join("cache");
        let mut writer = StoreWriter::new(&server, &cache);
        let hash = writer.put(b"block").unwrap();

        server.start_gc().unwrap();
        server.stop_gc().unwrap();
        assert!(writer.flush().is_err());

        assert_eq!(writer.put(b"block").unwrap(), hash);
        let packs = writer.close().unwrap();
        assert_eq!(packs.len(), 1);

        let reader = StoreReader::open(&server, &cache, 5).unwrap();
        assert_eq!(reader.get(&hash).unwrap(), b"block");
    }

    #[test]
    fn test_from_config() {
        let (temp, server) = server();
        let config = StoreConfig {
            cache_dir: temp.path().join("cache"),
            open_packs: 1,
            block_size: 512,
            max_pack_size: 2048,
            compress: false,
        };
        let data: Vec<u8> = (0..20_000u32).map(|i| (i * 13 % 241) as u8).collect();

        let mut writer = StoreWriter::from_config(&server, &config);
        let mut tree = writer.tree_writer().unwrap();
        tree.write_bytes(&data).unwrap();
        let root = tree.close().unwrap();
        let packs = writer.close().unwrap();
        assert!(packs.len() > 1);
        for name in &packs {
            assert!(config.cache_dir.join(format!("{}.index", name)).exists());
        }

        let reader = StoreReader::from_config(&server, &config).unwrap();
        let mut tree = TreeReader::open(&reader, &root.hash).unwrap();
        let mut leaf = [0u8; 511];
        let n = tree.read(&mut leaf).unwrap();
        // leaves hold block_size minus the depth byte
        assert_eq!(n, 511);
        let mut out = leaf.to_vec();
        tree.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert!(reader.open_handles() <= 1);
    }
}
