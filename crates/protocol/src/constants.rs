//! Shared protocol constants.

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Objects larger than this are downloaded in chunks (10 MiB).
pub const DEFAULT_CHUNKED_DOWNLOAD_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Idle timeout for upload sessions, in milliseconds (1 hour).
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 3_600_000;

/// Idle timeout for download sessions, in milliseconds (30 minutes).
pub const DEFAULT_DOWNLOAD_SESSION_TIMEOUT_MS: u64 = 1_800_000;

/// Period of the idle-session sweep, in milliseconds (5 minutes).
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 300_000;

/// Prefix of the remote container that holds a book's files.
pub const CONTAINER_PREFIX: &str = "book-";

/// Record field caching the id of the book's remote container.
pub const CONTAINER_FIELD: &str = "fileFolderId";
