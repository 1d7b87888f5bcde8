//! Keel Core - replicated content-addressed blob storage

pub mod clock;
pub mod cluster;
pub mod error;
pub mod membership;
pub mod operations;
pub mod registry;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::*;
pub use error::{KeelError, Result};
pub use membership::{MembershipChange, MembershipEvent, PeerRecord, PeerState, PeerStore};
pub use operations::*;
pub use registry::{BackendBuilder, MemoryBackend, MetadataBackend, SqliteBackend};
pub use storage::{
    BlobObjects, BlobReader, ByteRange, Envelope, FsBlobStore, SHA512_HEX_LEN, compute_hash,
    is_valid_hash, read_all, reader_from_bytes, validate_hash,
};
