//! Content-addressed pack store
//!
//! Byte streams are cut into blocks and arranged as Merkle hash trees. Blocks
//! are packed into immutable pack files with a sorted index, served by a
//! pack server that also coordinates the store's single root pointer and
//! its garbage collection cycles.

pub mod blob;
pub mod client;
pub mod config;
pub mod cstore;
pub mod dir;
pub mod htree;
pub mod meta;
pub mod pack;
pub mod proto;
pub mod remote;
pub mod server;

pub use blob::{BlobError, BlobReader, BlobWriter, Hash};
pub use client::Client;
pub use config::Config;
pub use cstore::{StoreReader, StoreWriter};
pub use meta::{MetadataCoordinator, RootRecord};
pub use remote::{RemoteError, RemoteResult};
pub use server::PackServer;
