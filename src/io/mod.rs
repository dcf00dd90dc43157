//! Blob store access and cleanup of intermediate objects.

mod cleanup;
mod store;

pub use cleanup::{CleanupReport, CleanupSet};
pub use store::{BlobStore, ObjectBlobStore, MAX_DELETE_BATCH};
