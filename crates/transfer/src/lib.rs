//! Session coordination for chunked book-file transfers.
//!
//! Holds the server-side state of in-flight uploads and downloads: a
//! per-upload [`ChunkStore`], the [`UploadRegistry`] and
//! [`DownloadRegistry`] that own the sessions, and the
//! [`CleanupSweeper`] that evicts sessions nobody touched for too long.
//! Nothing here talks to the remote blob store; that sequencing lives in
//! `galley-file-ops`.

mod checksum;
mod chunk_store;
pub mod config;
mod download;
mod sweeper;
mod token;
mod upload;

pub use checksum::{checksum_bytes, verify_checksum};
pub use chunk_store::{ChunkStore, assemble, total_chunks_for};
pub use config::{ConfigError, TransferConfig};
pub use download::{DownloadRegistry, DownloadSessionInfo, DownloadTarget};
pub use sweeper::{CleanupSweeper, SweepReport, SweeperHandle};
pub use token::generate_session_id;
pub use upload::{ObjectMeta, RelayJob, RelayOutcome, UploadRegistry, UploadSessionInfo};

use galley_protocol::{ErrorBody, ErrorKind};

/// Errors produced by transfer operations.
///
/// Each variant is one caller-visible error class; see [`ErrorKind`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),
}

impl TransferError {
    pub(crate) fn session_not_found(id: &str) -> Self {
        Self::NotFound(format!("session {id}"))
    }

    /// The error class reported to callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            TransferError::NotFound(_) => ErrorKind::NotFound,
            TransferError::Unauthorized(_) => ErrorKind::Unauthorized,
            TransferError::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            TransferError::UpstreamFailure(_) => ErrorKind::UpstreamFailure,
        }
    }

    /// Wire form of the error.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}
