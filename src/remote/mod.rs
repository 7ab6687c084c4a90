//! Remote store abstraction
//!
//! The capabilities a content store needs from wherever its packs live:
//! listing and opening packs for random-access reads, staging new packs, and
//! the root/GC coordination calls. `PackServer` provides them in-process and
//! `Client` provides them over a connection.

mod file;
mod retry;

pub use file::{MemFile, OsFile};
pub use retry::update_root;

use crate::meta::{MetaError, RootRecord};
pub use crate::meta::MAX_PACK_NAME;
use crate::proto::ProtoError;
use crate::server::UploadError;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Suffix every pack name carries
pub const PACK_SUFFIX: &str = ".pack";

/// Directory component of every pack path
pub const PACK_DIR: &str = "packs";

static PACK_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^packs/([a-zA-Z0-9.]+)$").expect("valid pack path pattern"));

static PACK_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9.]+$").expect("valid pack name pattern"));

static KEY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]+$").expect("valid key id pattern"));

/// Remote store errors
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),

    #[error("upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("server error: {0}")]
    Server(String),

    #[error("store is bound to a different key")]
    WrongKey,

    #[error("root update still contended after {0} attempts")]
    Contended(usize),
}

/// Result type for remote operations
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Random-access handle on a remote file
pub trait RemoteFile: Send {
    /// Read up to `len` bytes at `offset`.
    /// Returns fewer bytes only at end of file, or when the transport
    /// bounds the reply size.
    fn read_at(&self, offset: u64, len: usize) -> RemoteResult<Vec<u8>>;

    /// Release the handle. Reads after close fail.
    fn close(&mut self) -> RemoteResult<()>;
}

/// One committed pack as seen in a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackStat {
    pub name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Read side of a remote store
pub trait PackSource: Send + Sync {
    /// Committed packs
    fn list_packs(&self) -> RemoteResult<Vec<PackStat>>;

    /// Open a pack by name for reading
    fn open_pack(&self, name: &str) -> RemoteResult<Box<dyn RemoteFile>>;
}

/// Write side of a remote store
pub trait PackSink {
    /// Begin staging a new pack under `name`
    fn new_pack(&self, name: &str) -> RemoteResult<Box<dyn PackUpload>>;
}

/// A pack being staged. Nothing is visible under the final name until
/// `close` succeeds.
pub trait PackUpload: Send {
    fn write(&mut self, data: &[u8]) -> RemoteResult<()>;

    /// Commit the pack
    fn close(self: Box<Self>) -> RemoteResult<()>;

    /// Discard the pack
    fn cancel(self: Box<Self>) -> RemoteResult<()>;
}

/// Root pointer and epoch access
pub trait RootStore {
    fn get_epoch(&self) -> RemoteResult<u64>;

    fn get_root(&self) -> RemoteResult<RootRecord>;

    /// Returns `Ok(false)` when `version` is not the successor of the stored
    /// version or `epoch` is stale.
    fn cas_root(&self, value: &str, version: u64, signature: &str, epoch: u64) -> RemoteResult<bool>;
}

impl<T: PackSource + ?Sized> PackSource for &T {
    fn list_packs(&self) -> RemoteResult<Vec<PackStat>> {
        (**self).list_packs()
    }

    fn open_pack(&self, name: &str) -> RemoteResult<Box<dyn RemoteFile>> {
        (**self).open_pack(name)
    }
}

impl<T: PackSink + ?Sized> PackSink for &T {
    fn new_pack(&self, name: &str) -> RemoteResult<Box<dyn PackUpload>> {
        (**self).new_pack(name)
    }
}

impl<T: RootStore + ?Sized> RootStore for &T {
    fn get_epoch(&self) -> RemoteResult<u64> {
        (**self).get_epoch()
    }

    fn get_root(&self) -> RemoteResult<RootRecord> {
        (**self).get_root()
    }

    fn cas_root(&self, value: &str, version: u64, signature: &str, epoch: u64) -> RemoteResult<bool> {
        (**self).cas_root(value, version, signature, epoch)
    }
}

/// Check a bare pack name: one path segment of `[a-zA-Z0-9.]`.
pub fn validate_pack_name(name: &str) -> RemoteResult<()> {
    if name.len() > MAX_PACK_NAME
        || !PACK_NAME.is_match(name)
        || name == "."
        || name == ".."
        || name.ends_with(".tmp")
    {
        return Err(RemoteError::BadRequest(format!("invalid pack name {:?}", name)));
    }
    Ok(())
}

/// Split a `packs/<name>` path into its name.
pub fn parse_pack_path(path: &str) -> RemoteResult<&str> {
    let name = PACK_PATH
        .captures(path)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| RemoteError::BadRequest(format!("invalid pack path {:?}", path)))?;
    validate_pack_name(name)?;
    Ok(name)
}

/// Join a pack name into its `packs/<name>` path
pub fn pack_path(name: &str) -> String {
    format!("{}/{}", PACK_DIR, name)
}

/// Check a key id: non-empty `[a-zA-Z0-9]`.
pub fn validate_key_id(key_id: &str) -> RemoteResult<()> {
    if !KEY_ID.is_match(key_id) {
        return Err(RemoteError::BadRequest(format!("invalid key id {:?}", key_id)));
    }
    Ok(())
}

/// Render a pack listing, one `name size unix-seconds` line per pack
pub fn encode_listing(packs: &[PackStat]) -> Vec<u8> {
    let mut out = String::new();
    for p in packs {
        out.push_str(&format!("{} {} {}\n", p.name, p.size, p.created_at.timestamp()));
    }
    out.into_bytes()
}

/// Parse a listing produced by `encode_listing`
pub fn decode_listing(bytes: &[u8]) -> RemoteResult<Vec<PackStat>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| RemoteError::BadRequest("pack listing is not utf-8".to_string()))?;

    let mut packs = Vec::new();
    for line in text.lines().filter(|l| !l.is_empty()) {
        let bad = || RemoteError::BadRequest(format!("bad listing line {:?}", line));
        let mut fields = line.split(' ');
        let name = fields.next().ok_or_else(bad)?;
        let size = fields.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        let secs: i64 = fields.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        if fields.next().is_some() {
            return Err(bad());
        }
        let created_at = Utc.timestamp_opt(secs, 0).single().ok_or_else(bad)?;
        packs.push(PackStat {
            name: name.to_string(),
            size,
            created_at,
        });
    }
    Ok(packs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_names() {
        assert!(validate_pack_name("0123abcd.pack").is_ok());
        assert!(validate_pack_name("abc").is_ok());
        assert!(validate_pack_name("").is_err());
        assert!(validate_pack_name(".").is_err());
        assert!(validate_pack_name("..").is_err());
        assert!(validate_pack_name("a/b").is_err());
        assert!(validate_pack_name("abc.tmp").is_err());
        assert!(validate_pack_name("with space").is_err());
        assert!(validate_pack_name(&"a".repeat(MAX_PACK_NAME + 1)).is_err());
    }

    #[test]
    fn test_pack_paths() {
        assert_eq!(parse_pack_path("packs/abc.pack").unwrap(), "abc.pack");
        assert!(parse_pack_path("packs/").is_err());
        assert!(parse_pack_path("packs/../meta.db").is_err());
        assert!(parse_pack_path("other/abc").is_err());
        assert!(parse_pack_path("packs/a/b").is_err());
        assert!(parse_pack_path("xpacks/abc").is_err());
        assert_eq!(pack_path("abc.pack"), "packs/abc.pack");
    }

    #[test]
    fn test_key_ids() {
        assert!(validate_key_id("abc123").is_ok());
        assert!(validate_key_id("").is_err());
        assert!(validate_key_id("abc-123").is_err());
    }

    #[test]
    fn test_listing_roundtrip() {
        let packs = vec![
            PackStat {
                name: "a.pack".to_string(),
                size: 100,
                created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            },
            PackStat {
                name: "b.pack".to_string(),
                size: 0,
                created_at: Utc.timestamp_opt(0, 0).unwrap(),
            },
        ];
        assert_eq!(decode_listing(&encode_listing(&packs)).unwrap(), packs);
        assert!(decode_listing(b"a.pack notanumber 1\n").is_err());
        assert!(decode_listing(b"a.pack 1 2 3\n").is_err());
        assert!(decode_listing(b"").unwrap().is_empty());
    }
}
