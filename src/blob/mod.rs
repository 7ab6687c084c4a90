//! Block storage abstraction
//!
//! Defines the content address type and the reader/writer traits that the
//! hash tree uses to store and fetch blocks.

pub mod codec;
pub mod mem;

use crate::pack::PackError;
use crate::remote::RemoteError;
use std::fmt;
use thiserror::Error;

/// Block storage errors
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("block not found: {0}")]
    NotFound(String),

    #[error("data corruption detected: {0}")]
    Corrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pack error: {0}")]
    Pack(#[from] PackError),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("backend error: {0}")]
    Backend(String),
}

impl BlobError {
    /// True when the error only says the block is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound(_))
    }
}

/// Result type for block operations
pub type BlobResult<T> = Result<T, BlobError>;

/// Size of a content address in bytes
pub const HASH_SIZE: usize = 32;

/// BLAKE3 content address (32 bytes)
///
/// Ordering is byte-lexicographic, which is the order pack indices are
/// sorted in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// Create hash from raw bytes
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }

    /// Create hash from a slice, which must be exactly 32 bytes long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(Hash(arr))
    }

    /// Compute hash of data
    pub fn from_data(data: &[u8]) -> Self {
        Hash(blake3::hash(data).into())
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Hash::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Read side of a content-addressed block store.
pub trait BlobReader {
    /// Retrieve a block by its address.
    /// Returns `BlobError::NotFound` if no block has that address.
    fn get(&self, hash: &Hash) -> BlobResult<Vec<u8>>;
}

/// Write side of a content-addressed block store.
pub trait BlobWriter {
    /// Store a block and return its address.
    /// Storing the same bytes twice yields the same address.
    fn put(&mut self, data: &[u8]) -> BlobResult<Hash>;
}

impl<T: BlobReader + ?Sized> BlobReader for &T {
    fn get(&self, hash: &Hash) -> BlobResult<Vec<u8>> {
        (**self).get(hash)
    }
}

impl<T: BlobWriter + ?Sized> BlobWriter for &mut T {
    fn put(&mut self, data: &[u8]) -> BlobResult<Hash> {
        (**self).put(data)
    }
}

pub use mem::MemBlobStore;
