//! Pack store server
//!
//! `PackServer` serves one directory: committed packs under `packs/`, staged
//! uploads next to them as `.tmp` files, and the metadata database in
//! `meta.db`. It implements the remote store traits in-process; `Session`
//! exposes them over a connection.

mod listener;
mod session;
mod upload;

pub use listener::PackListener;
pub use session::Session;
pub use upload::{sweep_temp_files, UploadError, UploadResult, UploadSession, TMP_SUFFIX};

use crate::config::ServerConfig;
use crate::meta::{MetadataCoordinator, RootRecord};
use crate::remote::{
    encode_listing, validate_key_id, validate_pack_name, MemFile, OsFile, PackSink, PackSource,
    PackStat, PackUpload, RemoteError, RemoteFile, RemoteResult, RootStore, PACK_DIR,
};
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Metadata database inside the served directory
pub const META_DB: &str = "meta.db";

/// Serves the packs and metadata of one store directory
pub struct PackServer {
    packs_dir: PathBuf,
    meta: MetadataCoordinator,
    tmp_max_age: Duration,
    max_message_size: usize,
}

impl PackServer {
    /// Serve `root` with default settings
    pub fn open<P: AsRef<Path>>(root: P) -> RemoteResult<Self> {
        Self::from_config(&ServerConfig::new(root.as_ref()))
    }

    pub fn from_config(config: &ServerConfig) -> RemoteResult<Self> {
        fs::create_dir_all(&config.root)?;
        let meta = MetadataCoordinator::open(config.root.join(META_DB))?;
        log::info!("serving store at {}", config.root.display());

        Ok(Self {
            packs_dir: config.root.join(PACK_DIR),
            meta,
            tmp_max_age: config.tmp_max_age(),
            max_message_size: config.max_message_size,
        })
    }

    pub fn meta(&self) -> &MetadataCoordinator {
        &self.meta
    }

    pub fn packs_dir(&self) -> &Path {
        &self.packs_dir
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Bind the store to `key_id` and prepare the pack directory.
    ///
    /// Returns `Ok(false)` when the store already belongs to another key.
    pub fn attach(&self, key_id: &str) -> RemoteResult<bool> {
        validate_key_id(key_id)?;
        if !self.meta.attach(key_id)? {
            return Ok(false);
        }

        fs::create_dir_all(&self.packs_dir)?;
        match sweep_temp_files(&self.packs_dir, self.tmp_max_age) {
            Ok(0) => {}
            Ok(n) => log::info!("removed {} stale uploads", n),
            Err(e) => log::warn!("stale upload sweep failed: {}", e),
        }
        log::info!("attached key {}", key_id);
        Ok(true)
    }

    /// Generated listing of committed packs
    pub fn listing(&self) -> RemoteResult<MemFile> {
        Ok(MemFile::new(encode_listing(&self.list_packs()?)))
    }

    pub fn get_generation(&self) -> RemoteResult<u64> {
        Ok(self.meta.get_generation()?)
    }

    pub fn start_gc(&self) -> RemoteResult<u64> {
        Ok(self.meta.start_gc()?)
    }

    pub fn stop_gc(&self) -> RemoteResult<()> {
        Ok(self.meta.stop_gc()?)
    }

    /// Drop a pack's record and then its file. The record goes first so a
    /// listing never names a missing file.
    pub fn remove_pack(&self, name: &str, gc_id: u64) -> RemoteResult<bool> {
        validate_pack_name(name)?;
        let existed = self.meta.remove_pack(name, gc_id)?;

        match fs::remove_file(self.packs_dir.join(name)) {
            Ok(()) => log::info!("removed pack {}", name),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(existed)
    }
}

impl PackSource for PackServer {
    fn list_packs(&self) -> RemoteResult<Vec<PackStat>> {
        Ok(self
            .meta
            .get_packs(false)?
            .into_iter()
            .map(|record| PackStat {
                name: record.name,
                size: record.size,
                created_at: record.created_at.unwrap_or_default(),
            })
            .collect())
    }

    fn open_pack(&self, name: &str) -> RemoteResult<Box<dyn RemoteFile>> {
        validate_pack_name(name)?;
        Ok(Box::new(OsFile::open(self.packs_dir.join(name))?))
    }
}

impl PackSink for PackServer {
    fn new_pack(&self, name: &str) -> RemoteResult<Box<dyn PackUpload>> {
        validate_pack_name(name)?;
        self.meta.start_upload(name)?;
        // a failed create leaves an incomplete record for the next GC to purge
        let session = UploadSession::create(&self.packs_dir, name)?;

        Ok(Box::new(LocalUpload {
            session,
            meta: self.meta.clone(),
            name: name.to_string(),
            path: self.packs_dir.join(name),
        }))
    }
}

impl RootStore for PackServer {
    fn get_epoch(&self) -> RemoteResult<u64> {
        Ok(self.meta.get_epoch()?)
    }

    fn get_root(&self) -> RemoteResult<RootRecord> {
        Ok(self.meta.get_root()?)
    }

    fn cas_root(&self, value: &str, version: u64, signature: &str, epoch: u64) -> RemoteResult<bool> {
        Ok(self.meta.cas_root(value, version, signature, epoch)?)
    }
}

/// Upload staged on the server's own disk
struct LocalUpload {
    session: UploadSession,
    meta: MetadataCoordinator,
    name: String,
    path: PathBuf,
}

impl PackUpload for LocalUpload {
    fn write(&mut self, data: &[u8]) -> RemoteResult<()> {
        Ok(self.session.write(data)?)
    }

    fn close(self: Box<Self>) -> RemoteResult<()> {
        let LocalUpload { session, meta, name, path } = *self;
        let size = session.close()?;

        if let Err(e) = meta.finish_upload(&name, size, Utc::now()) {
            // a GC may have purged the record, so the file must not stay
            if let Err(rm) = fs::remove_file(&path) {
                log::warn!("failed to remove orphaned pack {}: {}", path.display(), rm);
            }
            return Err(RemoteError::from(e));
        }
        Ok(())
    }

    fn cancel(self: Box<Self>) -> RemoteResult<()> {
        Ok(self.session.cancel()?)
    }
}
