use serde::{Deserialize, Serialize};

use crate::types::FileMeta;

// ---------------------------------------------------------------------------
// Chunked upload
// ---------------------------------------------------------------------------

/// Opens a chunked upload for one file of a book.
///
/// `purpose` is kept as a string so that unknown values surface as an
/// `invalid_argument` error rather than a deserialization failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkInitRequest {
    pub entity_id: String,
    pub purpose: String,
    pub file: FileMeta,
}

/// Session parameters the caller must use for the following chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkInitResponse {
    pub upload_id: String,
    pub chunk_size: usize,
    pub total_chunks: u32,
}

/// Sends one chunk of an upload.
///
/// The `data` field is base64-encoded in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkRequest {
    pub upload_id: String,
    pub chunk_index: i64,
    pub total_chunks: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Optional SHA-256 hex digest of `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Progress after a chunk has been accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkResponse {
    pub progress: f64,
    /// All chunks are buffered; the caller may finalize.
    pub complete: bool,
    /// The remote store already holds the finished object.
    pub remote_complete: bool,
    pub received_chunks: u32,
    pub total_chunks: u32,
}

/// Finalizes a chunked upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkCompleteRequest {
    pub upload_id: String,
}

/// Abandons a chunked upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkCancelRequest {
    pub upload_id: String,
}

/// Uploads a small file in one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileRequest {
    pub entity_id: String,
    pub purpose: String,
    pub file: FileMeta,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// A finished remote object, as attached to the book record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub object_id: String,
    pub object_name: String,
    pub view_link: String,
    pub download_link: String,
}

/// Snapshot of an upload session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub upload_id: String,
    pub file_name: String,
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub remote_uploaded_bytes: u64,
    pub percentage: f64,
    pub started_at: String,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Chunked download
// ---------------------------------------------------------------------------

/// Opens a chunked download of one file of a book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadChunkInitRequest {
    pub entity_id: String,
    pub purpose: String,
}

/// Download parameters.
///
/// A missing `download_id` (and `total_chunks == 0`) means the file is
/// small enough to be fetched in one request instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadChunkInitResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_id: Option<String>,
    pub total_chunks: u32,
    pub chunk_size: usize,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
}

/// Requests one chunk of a download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadChunkRequest {
    pub download_id: String,
    pub chunk_index: i64,
}

/// One chunk of a download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadChunkResponse {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub complete: bool,
}

/// Abandons a chunked download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadChunkCancelRequest {
    pub download_id: String,
}

/// A small file fetched in one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFileResponse {
    pub file_name: String,
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Snapshot of a download session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub download_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    /// Highest chunk index delivered so far, -1 before the first.
    pub last_chunk_sent: i64,
    pub cancelled: bool,
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
