//! Remote blob store boundary.
//!
//! The service only relies on the call contract below:
//!
//! - a resumable session is opened once per upload with the declared size
//! - chunks are sent with strictly increasing, non-overlapping offsets
//!   starting at 0; the call that delivers the final byte reports
//!   `complete` with the new object's id
//! - ranges passed to `read_byte_range` are inclusive on both ends

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use galley_protocol::messages::UploadedFile;

/// A boxed future returned by adapter methods.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Errors reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote object not found: {0}")]
    NotFound(String),

    #[error("remote store rejected request: {0}")]
    Rejected(String),

    #[error("remote store unavailable: {0}")]
    Unavailable(String),
}

/// Remote progress after one chunk was relayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkUploadStatus {
    pub complete: bool,
    pub object_id: Option<String>,
    pub uploaded_bytes: u64,
}

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub view_link: String,
    pub download_link: String,
}

/// Abstract access to the remote blob store.
///
/// Implementations wrap the store's HTTP API; tests use
/// [`MemoryRemote`](crate::memory::MemoryRemote).
pub trait RemoteTransferAdapter: Send + Sync {
    /// Looks up a container (folder) by name.
    fn find_container<'a>(&'a self, name: &'a str) -> RemoteFuture<'a, Option<String>>;

    /// Creates a container and returns its id.
    fn create_container<'a>(&'a self, name: &'a str) -> RemoteFuture<'a, String>;

    /// Opens a resumable upload and returns its token.
    fn initiate_resumable_session<'a>(
        &'a self,
        name: &'a str,
        mime_type: &'a str,
        container_id: &'a str,
        declared_size: u64,
    ) -> RemoteFuture<'a, String>;

    /// Sends `data` at `start_offset` of a resumable upload.
    fn upload_chunk_to_session<'a>(
        &'a self,
        token: &'a str,
        data: Bytes,
        start_offset: u64,
        total_size: u64,
    ) -> RemoteFuture<'a, ChunkUploadStatus>;

    /// Uploads a complete object in one call.
    fn upload_whole_object<'a>(
        &'a self,
        name: &'a str,
        mime_type: &'a str,
        container_id: &'a str,
        data: Vec<u8>,
    ) -> RemoteFuture<'a, UploadedFile>;

    /// Fetches an object's metadata.
    fn get_object_metadata<'a>(&'a self, object_id: &'a str) -> RemoteFuture<'a, ObjectMetadata>;

    /// Reads bytes `start..=end_inclusive` of an object.
    fn read_byte_range<'a>(
        &'a self,
        object_id: &'a str,
        start: u64,
        end_inclusive: u64,
    ) -> RemoteFuture<'a, Vec<u8>>;
}
