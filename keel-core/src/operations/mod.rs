pub mod delete_blob;
pub mod fetch_objects;
pub mod list_blobs;
pub mod open_blob;
pub mod purge_objects;
pub mod write_blob;

pub use delete_blob::{
    DeleteBlobOperation, DeleteBlobOperationRequest, DeleteBlobOperationResult,
};
pub use fetch_objects::{FetchObjectsOperation, FetchObjectsOperationResult};
pub use list_blobs::{ListBlobsOperation, ListBlobsOperationResult};
pub use open_blob::{
    BlobSource, OpenBlobOperation, OpenBlobOperationRequest, OpenBlobOperationResult,
};
pub use purge_objects::{PurgeObjectsOperation, PurgeObjectsOperationResult};
pub use write_blob::{WriteBlobOperation, WriteBlobOperationRequest, WriteBlobOperationResult};
