//! Content store over remote packs
//!
//! `StoreReader` resolves addresses across every pack a remote store lists;
//! `StoreWriter` packs new blocks and stages them as uploads. Both keep a
//! local cache of pack indices, one `<pack name>.index` file per pack, so a
//! reader built after a writer needs no remote index fetch.

mod reader;
mod writer;

pub use reader::StoreReader;
pub use writer::StoreWriter;

use crate::pack::Index;
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Suffix of cached index files
pub const INDEX_SUFFIX: &str = ".index";

/// Path of the cached index for `pack_name`
pub fn index_cache_path(cache_dir: &Path, pack_name: &str) -> PathBuf {
    cache_dir.join(format!("{}{}", pack_name, INDEX_SUFFIX))
}

/// Load a cached index. `Ok(None)` when there is no cache entry.
pub fn read_cached_index(cache_dir: &Path, pack_name: &str) -> io::Result<Option<Index>> {
    let path = index_cache_path(cache_dir, pack_name);
    let file = match fs::File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    match Index::read_from(&mut BufReader::new(file)) {
        Ok(index) => Ok(Some(index)),
        Err(e) => {
            log::warn!("ignoring corrupt index cache {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// Store an index in the cache. The file appears atomically.
pub fn write_cached_index(cache_dir: &Path, pack_name: &str, index: &Index) -> io::Result<()> {
    fs::create_dir_all(cache_dir)?;
    let path = index_cache_path(cache_dir, pack_name);
    let tmp = path.with_extension("index.tmp");

    let mut out = BufWriter::new(fs::File::create(&tmp)?);
    index.write_to(&mut out)?;
    out.flush()?;
    out.get_ref().sync_all()?;
    drop(out);

    fs::rename(&tmp, &path)
}
