//! Storage modules for keel
//!
//! Provides the object interface and the local filesystem object store.

pub mod blob_store;
pub mod objects;

pub use blob_store::FsBlobStore;
pub use objects::{
    BlobObjects, BlobReader, ByteRange, Envelope, SHA512_HEX_LEN, compute_hash, is_valid_hash,
    read_all, reader_from_bytes, validate_hash,
};
