//! Metadata coordinator
//!
//! Holds the single mutable state of a store: the root pointer, the GC epoch
//! and generation, and the registry of packs. Every operation runs as one
//! sled transaction, so concurrent clients see a serial order.
//!
//! The epoch advances on every GC start and stop. Root swaps and pack
//! removals must quote the epoch they were computed against, so work begun
//! before a GC boundary cannot land after it. The generation advances once
//! per completed GC cycle.

use crate::remote::{RemoteResult, RootStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::Transactional;
use std::path::Path;
use thiserror::Error;

/// Longest accepted pack name
pub const MAX_PACK_NAME: usize = 1024;

const META_TREE: &str = "metadata";
const PACKS_TREE: &str = "packs";

const KEY_ID: &str = "keyid";
const EPOCH: &str = "epoch";
const GENERATION: &str = "generation";
const GC_RUNNING: &str = "gcrunning";
const ROOT_VALUE: &str = "rootval";
const ROOT_VERSION: &str = "rootversion";
const ROOT_SIGNATURE: &str = "rootsignature";
/// names of packs whose upload has not completed
const PENDING: &str = "pending";

/// Metadata errors
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),

    #[error("corrupt metadata: {0}")]
    Corrupt(String),

    #[error("invalid pack name {0:?}")]
    InvalidPackName(String),

    #[error("duplicate pack {0}")]
    DuplicatePack(String),

    #[error("concurrent garbage collection, operation failed")]
    GcOccurred,

    #[error("garbage collection not running")]
    GcNotRunning,

    #[error("garbage collection in progress")]
    GcInProgress,
}

impl From<TransactionError<MetaError>> for MetaError {
    fn from(e: TransactionError<MetaError>) -> Self {
        match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => MetaError::Db(e),
        }
    }
}

/// Result type for metadata operations
pub type MetaResult<T> = Result<T, MetaError>;

type TxResult<T> = ConflictableTransactionResult<T, MetaError>;

/// The current root pointer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootRecord {
    /// Opaque signed root value
    pub value: String,
    /// Each successful swap stores exactly `version + 1`
    pub version: u64,
    pub signature: String,
}

/// Registry entry for one pack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackRecord {
    #[serde(skip)]
    pub name: String,
    pub upload_complete: bool,
    /// Epoch when the upload started
    pub epoch: u64,
    pub size: u64,
    pub created_at: Option<DateTime<Utc>>,
}

/// Serializes root, GC and pack registry updates for one store.
#[derive(Clone)]
pub struct MetadataCoordinator {
    db: sled::Db,
    meta: sled::Tree,
    packs: sled::Tree,
}

impl MetadataCoordinator {
    /// Open or create the metadata database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> MetaResult<Self> {
        let db = sled::open(path.as_ref())?;
        let meta = db.open_tree(META_TREE)?;
        let packs = db.open_tree(PACKS_TREE)?;
        log::debug!("opened metadata at {:?}", path.as_ref());
        Ok(Self { db, meta, packs })
    }

    /// Bind the store to `key_id`. The first caller wins; later callers
    /// with a different key get `Ok(false)`.
    pub fn attach(&self, key_id: &str) -> MetaResult<bool> {
        let ok = self.meta.transaction(|tx| -> TxResult<bool> {
            match tx.get(KEY_ID)? {
                Some(current) => Ok(current.as_ref() == key_id.as_bytes()),
                None => {
                    tx.insert(KEY_ID, key_id.as_bytes().to_vec())?;
                    Ok(true)
                }
            }
        })?;
        self.db.flush()?;
        if !ok {
            log::warn!("attach refused for key {}", key_id);
        }
        Ok(ok)
    }

    pub fn get_epoch(&self) -> MetaResult<u64> {
        Ok(self.meta.transaction(|tx| get_u64(tx, EPOCH))?)
    }

    /// Current GC generation. Fails while a GC is running.
    pub fn get_generation(&self) -> MetaResult<u64> {
        Ok(self.meta.transaction(|tx| -> TxResult<u64> {
            if get_u64(tx, GC_RUNNING)? != 0 {
                return abort(MetaError::GcInProgress);
            }
            get_u64(tx, GENERATION)
        })?)
    }

    pub fn gc_running(&self) -> MetaResult<bool> {
        Ok(self.meta.transaction(|tx| get_u64(tx, GC_RUNNING))? != 0)
    }

    /// Begin a GC cycle.
    ///
    /// Advances the epoch, marks GC running and drops every pack record
    /// whose upload never completed. The returned epoch identifies this
    /// cycle and must be passed to `remove_pack`.
    pub fn start_gc(&self) -> MetaResult<u64> {
        let (epoch, purged) =
            (&self.meta, &self.packs).transaction(|(meta, packs)| -> TxResult<(u64, usize)> {
                if get_u64(meta, GC_RUNNING)? != 0 {
                    return abort(MetaError::GcInProgress);
                }
                let epoch = get_u64(meta, EPOCH)? + 1;
                put_u64(meta, EPOCH, epoch)?;
                put_u64(meta, GC_RUNNING, 1)?;

                let pending = get_pending(meta)?;
                for name in &pending {
                    packs.remove(name.as_str())?;
                }
                put_pending(meta, &[])?;
                Ok((epoch, pending.len()))
            })?;
        self.db.flush()?;
        log::info!("gc started at epoch {} ({} abandoned uploads purged)", epoch, purged);
        Ok(epoch)
    }

    /// End the GC cycle: advance the epoch again and bump the generation.
    pub fn stop_gc(&self) -> MetaResult<()> {
        let generation = self.meta.transaction(|tx| -> TxResult<u64> {
            if get_u64(tx, GC_RUNNING)? == 0 {
                return abort(MetaError::GcNotRunning);
            }
            let epoch = get_u64(tx, EPOCH)? + 1;
            let generation = get_u64(tx, GENERATION)? + 1;
            put_u64(tx, EPOCH, epoch)?;
            put_u64(tx, GENERATION, generation)?;
            put_u64(tx, GC_RUNNING, 0)?;
            Ok(generation)
        })?;
        self.db.flush()?;
        log::info!("gc stopped, generation now {}", generation);
        Ok(())
    }

    pub fn get_root(&self) -> MetaResult<RootRecord> {
        Ok(self.meta.transaction(|tx| -> TxResult<RootRecord> {
            Ok(RootRecord {
                value: get_string(tx, ROOT_VALUE)?,
                version: get_u64(tx, ROOT_VERSION)?,
                signature: get_string(tx, ROOT_SIGNATURE)?,
            })
        })?)
    }

    /// Swap the root if `version` directly follows the stored version and
    /// `epoch` is still current. Returns `Ok(false)` without changing
    /// anything otherwise.
    pub fn cas_root(&self, value: &str, version: u64, signature: &str, epoch: u64) -> MetaResult<bool> {
        let ok = self.meta.transaction(|tx| -> TxResult<bool> {
            let stored = get_u64(tx, ROOT_VERSION)?;
            if stored.checked_add(1) != Some(version) {
                return Ok(false);
            }
            if get_u64(tx, EPOCH)? != epoch {
                return Ok(false);
            }
            put_u64(tx, ROOT_VERSION, version)?;
            tx.insert(ROOT_VALUE, value.as_bytes().to_vec())?;
            tx.insert(ROOT_SIGNATURE, signature.as_bytes().to_vec())?;
            Ok(true)
        })?;
        if ok {
            self.db.flush()?;
            log::debug!("root swapped to version {}", version);
        }
        Ok(ok)
    }

    /// Register a pack whose upload is starting
    pub fn start_upload(&self, name: &str) -> MetaResult<()> {
        if name.is_empty() || name.len() > MAX_PACK_NAME {
            return Err(MetaError::InvalidPackName(name.to_string()));
        }

        (&self.meta, &self.packs).transaction(|(meta, packs)| -> TxResult<()> {
            if packs.get(name)?.is_some() {
                return abort(MetaError::DuplicatePack(name.to_string()));
            }
            let record = PackRecord {
                name: name.to_string(),
                upload_complete: false,
                epoch: get_u64(meta, EPOCH)?,
                size: 0,
                created_at: None,
            };
            put_pack(packs, name, &record)?;

            let mut pending = get_pending(meta)?;
            pending.push(name.to_string());
            put_pending(meta, &pending)
        })?;
        self.db.flush()?;
        Ok(())
    }

    /// Mark a pack's upload complete.
    ///
    /// Fails with `GcOccurred` if the record was purged or a GC boundary
    /// passed since `start_upload`; the caller must redo the upload.
    pub fn finish_upload(&self, name: &str, size: u64, created_at: DateTime<Utc>) -> MetaResult<()> {
        (&self.meta, &self.packs).transaction(|(meta, packs)| -> TxResult<()> {
            let mut record = match get_pack(packs, name)? {
                Some(r) => r,
                None => return abort(MetaError::GcOccurred),
            };
            if get_u64(meta, EPOCH)? != record.epoch {
                return abort(MetaError::GcOccurred);
            }
            record.upload_complete = true;
            record.size = size;
            record.created_at = Some(created_at);
            put_pack(packs, name, &record)?;

            let mut pending = get_pending(meta)?;
            pending.retain(|p| p != name);
            put_pending(meta, &pending)
        })?;
        self.db.flush()?;
        log::info!("pack {} committed ({} bytes)", name, size);
        Ok(())
    }

    /// Drop a pack record during GC.
    ///
    /// Only allowed while GC runs and `gc_epoch` is the epoch returned by
    /// the `start_gc` of the current cycle. Returns whether a record existed.
    pub fn remove_pack(&self, name: &str, gc_epoch: u64) -> MetaResult<bool> {
        let existed = (&self.meta, &self.packs).transaction(|(meta, packs)| -> TxResult<bool> {
            if get_u64(meta, GC_RUNNING)? == 0 {
                return abort(MetaError::GcNotRunning);
            }
            if get_u64(meta, EPOCH)? != gc_epoch {
                return abort(MetaError::GcOccurred);
            }
            let existed = packs.remove(name)?.is_some();

            let mut pending = get_pending(meta)?;
            if pending.iter().any(|p| p == name) {
                pending.retain(|p| p != name);
                put_pending(meta, &pending)?;
            }
            Ok(existed)
        })?;
        self.db.flush()?;
        log::debug!("removed pack record {} (existed: {})", name, existed);
        Ok(existed)
    }

    /// List pack records, complete ones only unless `include_incomplete`
    pub fn get_packs(&self, include_incomplete: bool) -> MetaResult<Vec<PackRecord>> {
        let mut records = Vec::new();
        for item in self.packs.iter() {
            let (key, value) = item?;
            let mut record: PackRecord = serde_json::from_slice(&value)
                .map_err(|e| MetaError::Corrupt(format!("pack record: {}", e)))?;
            if !record.upload_complete && !include_incomplete {
                continue;
            }
            record.name = String::from_utf8(key.to_vec())
                .map_err(|_| MetaError::Corrupt("pack name is not utf-8".to_string()))?;
            records.push(record);
        }
        Ok(records)
    }
}

impl RootStore for MetadataCoordinator {
    fn get_epoch(&self) -> RemoteResult<u64> {
        Ok(MetadataCoordinator::get_epoch(self)?)
    }

    fn get_root(&self) -> RemoteResult<RootRecord> {
        Ok(MetadataCoordinator::get_root(self)?)
    }

    fn cas_root(&self, value: &str, version: u64, signature: &str, epoch: u64) -> RemoteResult<bool> {
        Ok(MetadataCoordinator::cas_root(self, value, version, signature, epoch)?)
    }
}

fn abort<T>(e: MetaError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(e))
}

fn get_u64(tree: &TransactionalTree, key: &str) -> TxResult<u64> {
    match tree.get(key)? {
        None => Ok(0),
        Some(v) => match <[u8; 8]>::try_from(v.as_ref()) {
            Ok(bytes) => Ok(u64::from_be_bytes(bytes)),
            Err(_) => abort(MetaError::Corrupt(format!("{} is {} bytes", key, v.len()))),
        },
    }
}

fn put_u64(tree: &TransactionalTree, key: &str, value: u64) -> TxResult<()> {
    tree.insert(key, value.to_be_bytes().to_vec())?;
    Ok(())
}

fn get_string(tree: &TransactionalTree, key: &str) -> TxResult<String> {
    match tree.get(key)? {
        None => Ok(String::new()),
        Some(v) => match String::from_utf8(v.to_vec()) {
            Ok(s) => Ok(s),
            Err(_) => abort(MetaError::Corrupt(format!("{} is not utf-8", key))),
        },
    }
}

fn get_pending(tree: &TransactionalTree) -> TxResult<Vec<String>> {
    match tree.get(PENDING)? {
        None => Ok(Vec::new()),
        Some(v) => serde_json::from_slice(&v)
            .or_else(|e| abort(MetaError::Corrupt(format!("pending list: {}", e)))),
    }
}

fn put_pending(tree: &TransactionalTree, pending: &[String]) -> TxResult<()> {
    let bytes = serde_json::to_vec(pending)
        .or_else(|e| abort(MetaError::Corrupt(format!("pending list: {}", e))))?;
    tree.insert(PENDING, bytes)?;
    Ok(())
}

fn get_pack(tree: &TransactionalTree, name: &str) -> TxResult<Option<PackRecord>> {
    match tree.get(name)? {
        None => Ok(None),
        Some(v) => match serde_json::from_slice::<PackRecord>(&v) {
            Ok(mut record) => {
                record.name = name.to_string();
                Ok(Some(record))
            }
            Err(e) => abort(MetaError::Corrupt(format!("pack record {}: {}", name, e))),
        },
    }
}

fn put_pack(tree: &TransactionalTree, name: &str, record: &PackRecord) -> TxResult<()> {
    let bytes = serde_json::to_vec(record)
        .or_else(|e| abort(MetaError::Corrupt(format!("pack record {}: {}", name, e))))?;
    tree.insert(name, bytes)?;
    Ok(())
}
