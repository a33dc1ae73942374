//! File operations service for book files.
//!
//! Sequences the session registries from `galley-transfer` with two
//! external collaborators:
//!
//! - a [`RemoteTransferAdapter`] driving the blob store's resumable-upload
//!   and range-read primitives, and
//! - an [`EntityStore`] holding the book records finished files are
//!   attached to.
//!
//! Both are traits so the service is testable with the in-memory
//! implementations in [`memory`].
//!
//! # Upload pipeline
//!
//! 1. **Init**: validate purpose, resolve the book's remote container,
//!    register a local session and open a remote resumable session
//! 2. **Chunks**: buffer each chunk locally, relay contiguous chunks to the
//!    remote session
//! 3. **Complete**: use the remote object if the relay finished it,
//!    otherwise upload the assembled buffer whole, then patch the book

mod entity;
pub mod memory;
mod remote;
mod service;

pub use entity::{EntityStore, EntityStoreError, Record, StoreFuture};
pub use remote::{ChunkUploadStatus, ObjectMetadata, RemoteError, RemoteFuture, RemoteTransferAdapter};
pub use service::FileOperationsService;

pub use galley_transfer::TransferError;

impl From<RemoteError> for TransferError {
    fn from(e: RemoteError) -> Self {
        TransferError::UpstreamFailure(e.to_string())
    }
}

impl From<EntityStoreError> for TransferError {
    fn from(e: EntityStoreError) -> Self {
        TransferError::UpstreamFailure(e.to_string())
    }
}
