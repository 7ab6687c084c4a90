//! Content store reader

use super::{read_cached_index, write_cached_index};
use crate::blob::codec::decode_block;
use crate::blob::{BlobError, BlobReader, BlobResult, Hash};
use crate::config::StoreConfig;
use crate::pack::{Index, PackReader};
use crate::remote::{PackSource, PACK_SUFFIX};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Default number of pack handles a reader keeps open
pub const DEFAULT_OPEN_PACKS: usize = 5;

struct KnownPack {
    name: String,
    size: u64,
    index: Index,
}

/// Resolves addresses across all packs of a remote store.
///
/// Indices of every pack are held in memory; open pack handles are bounded
/// by an LRU and the least recently used handle is closed on overflow.
pub struct StoreReader<S: PackSource> {
    source: S,
    cache_dir: PathBuf,
    packs: Vec<KnownPack>,
    open: Mutex<LruCache<String, PackReader>>,
}

impl<S: PackSource> StoreReader<S> {
    /// Build a reader over the packs `source` currently lists.
    ///
    /// Indices come from `cache_dir` where present. Missing ones are read
    /// from the pack itself and written back to the cache.
    pub fn open<P: AsRef<Path>>(source: S, cache_dir: P, open_packs: usize) -> BlobResult<Self> {
        let capacity = NonZeroUsize::new(open_packs)
            .ok_or_else(|| BlobError::Backend("open pack limit must be at least 1".to_string()))?;
        let cache_dir = cache_dir.as_ref().to_path_buf();

        let mut packs = Vec::new();
        for stat in source.list_packs()? {
            if !stat.name.ends_with(PACK_SUFFIX) {
                continue;
            }
            let index = match read_cached_index(&cache_dir, &stat.name)? {
                Some(index) => {
                    log::debug!("index cache hit for {}", stat.name);
                    index
                }
                None => {
                    log::debug!("index cache miss for {}, fetching", stat.name);
                    let reader = PackReader::open(source.open_pack(&stat.name)?, stat.size)?;
                    let index = reader.index().clone();
                    reader.close()?;
                    write_cached_index(&cache_dir, &stat.name, &index)?;
                    index
                }
            };
            packs.push(KnownPack {
                name: stat.name,
                size: stat.size,
                index,
            });
        }
        log::info!("content store reader over {} packs", packs.len());

        Ok(Self {
            source,
            cache_dir,
            packs,
            open: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Build a reader using the cache directory and handle limit of `config`
    pub fn from_config(source: S, config: &StoreConfig) -> BlobResult<Self> {
        Self::open(source, &config.cache_dir, config.open_packs)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Names of the packs this reader searches
    pub fn pack_names(&self) -> impl Iterator<Item = &str> {
        self.packs.iter().map(|p| p.name.as_str())
    }

    /// Number of pack handles currently open
    pub fn open_handles(&self) -> usize {
        self.open.lock().unwrap().len()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.packs.iter().any(|p| p.index.contains(hash))
    }

    /// Fetch and decode the block at `hash`.
    ///
    /// The first pack whose index holds the address answers. The decoded
    /// block is checked against its address.
    pub fn get(&self, hash: &Hash) -> BlobResult<Vec<u8>> {
        let pack = self
            .packs
            .iter()
            .find(|p| p.index.contains(hash))
            .ok_or_else(|| BlobError::NotFound(hash.to_hex()))?;

        let stored = self
            .read_stored(pack, hash)?
            .ok_or_else(|| BlobError::Corrupted(format!("{} indexed in {} but unreadable", hash, pack.name)))?;
        let data = decode_block(&stored)?;

        if Hash::from_data(&data) != *hash {
            return Err(BlobError::Corrupted(format!(
                "block in {} does not match address {}",
                pack.name, hash
            )));
        }
        Ok(data)
    }

    fn read_stored(&self, pack: &KnownPack, hash: &Hash) -> BlobResult<Option<Vec<u8>>> {
        let mut open = self.open.lock().unwrap();

        if !open.contains(&pack.name) {
            let file = self.source.open_pack(&pack.name)?;
            let reader = PackReader::with_index(file, pack.size, pack.index.clone())?;
            if let Some((evicted, old)) = open.push(pack.name.clone(), reader) {
                log::debug!("evicting pack handle {}", evicted);
                if let Err(e) = old.close() {
                    log::warn!("closing evicted pack {} failed: {}", evicted, e);
                }
            }
        }

        // get() also marks the pack most recently used
        let reader = open
            .get(&pack.name)
            .ok_or_else(|| BlobError::Backend(format!("pack {} missing from cache", pack.name)))?;
        Ok(reader.get(hash)?)
    }

    /// Close every open pack handle.
    ///
    /// All handles are released even if some fail to close; the first
    /// failure is returned.
    pub fn close(&self) -> BlobResult<()> {
        let mut open = self.open.lock().unwrap();
        let mut first_err = None;
        while let Some((name, reader)) = open.pop_lru() {
            if let Err(e) = reader.close() {
                log::warn!("closing pack {} failed: {}", name, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl<S: PackSource> BlobReader for StoreReader<S> {
    fn get(&self, hash: &Hash) -> BlobResult<Vec<u8>> {
        StoreReader::get(self, hash)
    }
}
