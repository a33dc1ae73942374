//! Transfer orchestrator.

use std::sync::Arc;

use bytes::Bytes;
use galley_protocol::constants::{CONTAINER_FIELD, CONTAINER_PREFIX};
use galley_protocol::messages::{
    DownloadChunkCancelRequest, DownloadChunkInitRequest, DownloadChunkInitResponse,
    DownloadChunkRequest, DownloadChunkResponse, DownloadFileResponse, DownloadProgress,
    UploadChunkCancelRequest, UploadChunkCompleteRequest, UploadChunkInitRequest,
    UploadChunkInitResponse, UploadChunkRequest, UploadChunkResponse, UploadFileRequest,
    UploadProgress, UploadedFile,
};
use galley_protocol::{FileMeta, Purpose};
use galley_transfer::{
    CleanupSweeper, ConfigError, DownloadRegistry, DownloadSessionInfo, DownloadTarget,
    ObjectMeta, RelayOutcome, SweepReport, SweeperHandle, TransferConfig, TransferError,
    UploadRegistry, UploadSessionInfo, verify_checksum,
};
use serde_json::Value;

use crate::entity::{EntityStore, Record, purpose_patch, string_field};
use crate::remote::{RemoteError, RemoteTransferAdapter};

/// Sequences the session registries with the remote store and the book
/// records.
///
/// Every operation takes the verified identity of the caller. Session
/// operations fail with `NotFound` for unknown ids and `Unauthorized` when
/// the session belongs to someone else, before any other check.
pub struct FileOperationsService {
    config: TransferConfig,
    uploads: Arc<UploadRegistry>,
    downloads: Arc<DownloadRegistry>,
    remote: Arc<dyn RemoteTransferAdapter>,
    entities: Arc<dyn EntityStore>,
    sweeper: Arc<CleanupSweeper>,
    sweeper_handle: SweeperHandle,
}

impl FileOperationsService {
    /// Builds the registries and starts the cleanup sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: TransferConfig,
        remote: Arc<dyn RemoteTransferAdapter>,
        entities: Arc<dyn EntityStore>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let uploads = Arc::new(UploadRegistry::new());
        let downloads = Arc::new(DownloadRegistry::new(
            config.chunked_download_threshold_bytes,
        ));
        let sweeper = Arc::new(CleanupSweeper::new(
            Arc::clone(&uploads),
            Arc::clone(&downloads),
            &config,
        ));
        let sweeper_handle = Arc::clone(&sweeper).spawn();

        tracing::info!(
            chunk_size = config.chunk_size,
            threshold = config.chunked_download_threshold_bytes,
            cleanup_interval_ms = config.cleanup_interval_ms,
            "file operations service started"
        );

        Ok(Arc::new(Self {
            config,
            uploads,
            downloads,
            remote,
            entities,
            sweeper,
            sweeper_handle,
        }))
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Stops the background sweeper. Sessions stay usable.
    pub fn shutdown(&self) {
        self.sweeper_handle.stop();
        tracing::info!("file operations service stopped");
    }

    /// Runs one eviction pass immediately, after any timer pass in progress.
    pub async fn sweep_idle(&self) -> SweepReport {
        self.sweeper.sweep_once().await
    }

    // -- uploads ------------------------------------------------------------

    /// Opens a chunked upload for a book file.
    pub async fn upload_chunk_init(
        &self,
        caller: &str,
        req: UploadChunkInitRequest,
    ) -> Result<UploadChunkInitResponse, TransferError> {
        let purpose = parse_purpose(&req.purpose)?;
        check_file_meta(purpose, &req.file)?;
        let record = self.book_record(&req.entity_id).await?;
        let container_id = self.resolve_container(&req.entity_id, &record).await?;

        let meta = ObjectMeta {
            entity_id: req.entity_id.clone(),
            purpose,
            container_id: container_id.clone(),
            file: req.file.clone(),
        };

        let (created, opened) = tokio::join!(
            self.uploads
                .create_session(caller, meta, self.config.chunk_size),
            self.remote.initiate_resumable_session(
                &req.file.name,
                &req.file.mime_type,
                &container_id,
                req.file.size,
            )
        );
        let (upload_id, total_chunks) = created?;

        let token = match opened {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(
                    upload_id = %upload_id,
                    error = %e,
                    "could not open remote resumable session"
                );
                self.uploads.remove_session(&upload_id).await;
                return Err(e.into());
            }
        };
        self.uploads.attach_remote_session(&upload_id, token).await?;

        Ok(UploadChunkInitResponse {
            upload_id,
            chunk_size: self.config.chunk_size,
            total_chunks,
        })
    }

    /// Buffers one chunk and relays whatever is contiguous to the remote store.
    pub async fn upload_chunk(
        &self,
        caller: &str,
        req: UploadChunkRequest,
    ) -> Result<UploadChunkResponse, TransferError> {
        let info = self.owned_upload(caller, &req.upload_id).await?;

        if req.total_chunks != info.total_chunks {
            return Err(TransferError::InvalidArgument(format!(
                "totalChunks {} does not match session ({})",
                req.total_chunks, info.total_chunks
            )));
        }
        let index = u32::try_from(req.chunk_index)
            .ok()
            .filter(|i| *i < info.total_chunks)
            .ok_or_else(|| {
                TransferError::InvalidArgument(format!(
                    "chunk index {} outside 0..{}",
                    req.chunk_index, info.total_chunks
                ))
            })?;
        let expected = info.expected_chunk_len(index);
        if req.data.len() as u64 != expected {
            return Err(TransferError::InvalidArgument(format!(
                "chunk {index} has {} bytes, expected {expected}",
                req.data.len()
            )));
        }
        if let Some(checksum) = &req.checksum {
            if !verify_checksum(&req.data, checksum) {
                return Err(TransferError::InvalidArgument(format!(
                    "checksum mismatch for chunk {index}"
                )));
            }
        }

        let progress = self
            .uploads
            .store_chunk(&req.upload_id, req.chunk_index, Bytes::from(req.data))
            .await?;
        let relay = tokio::spawn(relay_pending(
            Arc::clone(&self.uploads),
            Arc::clone(&self.remote),
            req.upload_id.clone(),
        ));
        if let Err(e) = relay.await {
            tracing::warn!(upload_id = %req.upload_id, error = %e, "relay task failed");
        }

        let info = self
            .uploads
            .get_session(&req.upload_id)
            .await
            .ok_or_else(|| TransferError::NotFound(format!("session {}", req.upload_id)))?;

        Ok(UploadChunkResponse {
            progress,
            complete: info.is_complete(),
            remote_complete: info.remote_object_id.is_some(),
            received_chunks: info.received_chunks,
            total_chunks: info.total_chunks,
        })
    }

    /// Finalizes an upload and attaches the object to its book.
    ///
    /// On failure the session is kept so the call can be retried.
    pub async fn upload_chunk_complete(
        &self,
        caller: &str,
        req: UploadChunkCompleteRequest,
    ) -> Result<UploadedFile, TransferError> {
        let id = req.upload_id.as_str();
        let info = self.owned_upload(caller, id).await?;
        if !info.is_complete() {
            return Err(TransferError::FailedPrecondition(format!(
                "upload {id} has {}/{} chunks",
                info.received_chunks, info.total_chunks
            )));
        }

        let file = match &info.remote_object_id {
            Some(object_id) => {
                let meta = self.remote.get_object_metadata(object_id).await?;
                UploadedFile {
                    object_id: object_id.clone(),
                    object_name: meta.name,
                    view_link: meta.view_link,
                    download_link: meta.download_link,
                }
            }
            None => {
                if !self.uploads.validate_chunks(id).await? {
                    return Err(TransferError::FailedPrecondition(format!(
                        "upload {id} is missing chunks"
                    )));
                }
                let data = self.uploads.assemble_chunks(id).await?;
                let file = self
                    .remote
                    .upload_whole_object(
                        &info.meta.file.name,
                        &info.meta.file.mime_type,
                        &info.meta.container_id,
                        data,
                    )
                    .await?;
                tracing::info!(upload_id = id, object = %file.object_id, "uploaded buffered file whole");
                // A retry after a failed patch must not upload again.
                self.uploads
                    .update_remote_progress(id, info.meta.file.size, Some(file.object_id.clone()))
                    .await?;
                file
            }
        };

        self.entities
            .patch_record(&info.meta.entity_id, purpose_patch(info.meta.purpose, &file))
            .await?;
        self.uploads.remove_session(id).await;

        tracing::info!(
            upload_id = id,
            entity = %info.meta.entity_id,
            purpose = %info.meta.purpose,
            object = %file.object_id,
            "upload complete"
        );
        Ok(file)
    }

    /// Drops an upload. The remote resumable session is left to expire.
    pub async fn upload_chunk_cancel(
        &self,
        caller: &str,
        req: UploadChunkCancelRequest,
    ) -> Result<(), TransferError> {
        self.owned_upload(caller, &req.upload_id).await?;
        self.uploads.remove_session(&req.upload_id).await;
        tracing::info!(upload_id = %req.upload_id, "upload cancelled");
        Ok(())
    }

    pub async fn upload_progress(
        &self,
        caller: &str,
        upload_id: &str,
    ) -> Result<UploadProgress, TransferError> {
        Ok(self.owned_upload(caller, upload_id).await?.to_progress())
    }

    /// Uploads of `caller`, oldest first.
    pub async fn active_uploads(&self, caller: &str) -> Vec<UploadProgress> {
        self.uploads
            .sessions_for_owner(caller)
            .await
            .iter()
            .map(UploadSessionInfo::to_progress)
            .collect()
    }

    /// Uploads a small file in one call and attaches it to its book.
    pub async fn upload_file(
        &self,
        caller: &str,
        req: UploadFileRequest,
    ) -> Result<UploadedFile, TransferError> {
        let purpose = parse_purpose(&req.purpose)?;
        check_file_meta(purpose, &req.file)?;
        if req.data.len() as u64 != req.file.size {
            return Err(TransferError::InvalidArgument(format!(
                "payload has {} bytes, declared {}",
                req.data.len(),
                req.file.size
            )));
        }
        if req.file.size > self.downloads.threshold() {
            return Err(TransferError::InvalidArgument(format!(
                "{} bytes is above the direct upload limit, use a chunked upload",
                req.file.size
            )));
        }

        let record = self.book_record(&req.entity_id).await?;
        let container_id = self.resolve_container(&req.entity_id, &record).await?;
        let file = self
            .remote
            .upload_whole_object(&req.file.name, &req.file.mime_type, &container_id, req.data)
            .await?;
        self.entities
            .patch_record(&req.entity_id, purpose_patch(purpose, &file))
            .await?;

        tracing::info!(
            owner = caller,
            entity = %req.entity_id,
            purpose = %purpose,
            object = %file.object_id,
            size = req.file.size,
            "file uploaded"
        );
        Ok(file)
    }

    // -- downloads ----------------------------------------------------------

    /// Opens a chunked download, or reports that the object should be
    /// fetched whole (`download_id` absent, `total_chunks` 0).
    pub async fn download_chunk_init(
        &self,
        caller: &str,
        req: DownloadChunkInitRequest,
    ) -> Result<DownloadChunkInitResponse, TransferError> {
        let target = self.download_target(&req.entity_id, &req.purpose).await?;
        let chunk_size = self.config.chunk_size;

        let response = match self
            .downloads
            .create_session(caller, target.clone(), chunk_size)
            .await?
        {
            Some(session) => DownloadChunkInitResponse {
                download_id: Some(session.id),
                total_chunks: session.total_chunks,
                chunk_size,
                file_name: target.name,
                file_size: target.size,
                mime_type: target.mime_type,
            },
            None => DownloadChunkInitResponse {
                download_id: None,
                total_chunks: 0,
                chunk_size,
                file_name: target.name,
                file_size: target.size,
                mime_type: target.mime_type,
            },
        };
        Ok(response)
    }

    /// Reads one chunk of a download from the remote store.
    pub async fn download_chunk(
        &self,
        caller: &str,
        req: DownloadChunkRequest,
    ) -> Result<DownloadChunkResponse, TransferError> {
        let id = req.download_id.as_str();
        let info = self.owned_download(caller, id).await?;
        let (start, end) = self.downloads.next_chunk_range(id, req.chunk_index).await?;
        let index = u32::try_from(req.chunk_index).map_err(|_| {
            TransferError::InvalidArgument(format!("chunk index {}", req.chunk_index))
        })?;

        let data = self
            .remote
            .read_byte_range(&info.target.object_id, start, end)
            .await
            .map_err(remote_lookup_error)?;

        let complete = match self.downloads.mark_chunk_sent(id, req.chunk_index).await {
            Ok(last) => last,
            Err(e) => {
                // The session went away while reading; the bytes are still good.
                tracing::debug!(download_id = id, index, error = %e, "could not record chunk");
                index + 1 == info.total_chunks
            }
        };

        Ok(DownloadChunkResponse {
            data,
            chunk_index: index,
            total_chunks: info.total_chunks,
            complete,
        })
    }

    /// Marks a download cancelled. Later chunk requests fail with
    /// `FailedPrecondition` until the sweeper removes the session.
    pub async fn download_chunk_cancel(
        &self,
        caller: &str,
        req: DownloadChunkCancelRequest,
    ) -> Result<(), TransferError> {
        self.owned_download(caller, &req.download_id).await?;
        self.downloads.cancel(&req.download_id).await
    }

    /// Downloads of `caller`, oldest first.
    pub async fn active_downloads(&self, caller: &str) -> Vec<DownloadProgress> {
        self.downloads
            .sessions_for_owner(caller)
            .await
            .iter()
            .map(DownloadSessionInfo::to_progress)
            .collect()
    }

    /// Fetches a small book file in one read.
    pub async fn download_file(
        &self,
        caller: &str,
        entity_id: &str,
        purpose: &str,
    ) -> Result<DownloadFileResponse, TransferError> {
        let target = self.download_target(entity_id, purpose).await?;
        if target.size > self.downloads.threshold() {
            return Err(TransferError::InvalidArgument(format!(
                "{} bytes is above the direct download limit, use a chunked download",
                target.size
            )));
        }

        let data = if target.size == 0 {
            Vec::new()
        } else {
            self.remote
                .read_byte_range(&target.object_id, 0, target.size - 1)
                .await
                .map_err(remote_lookup_error)?
        };

        tracing::debug!(owner = caller, object = %target.object_id, size = target.size, "file downloaded");
        Ok(DownloadFileResponse {
            file_name: target.name,
            mime_type: target.mime_type,
            data,
        })
    }

    // -- helpers ------------------------------------------------------------

    async fn owned_upload(
        &self,
        caller: &str,
        upload_id: &str,
    ) -> Result<UploadSessionInfo, TransferError> {
        let info = self
            .uploads
            .get_session(upload_id)
            .await
            .ok_or_else(|| TransferError::NotFound(format!("session {upload_id}")))?;
        if info.owner_id != caller {
            tracing::warn!(upload_id, caller, "upload session accessed by non-owner");
            return Err(TransferError::Unauthorized(format!(
                "session {upload_id} belongs to another caller"
            )));
        }
        Ok(info)
    }

    async fn owned_download(
        &self,
        caller: &str,
        download_id: &str,
    ) -> Result<DownloadSessionInfo, TransferError> {
        let info = self
            .downloads
            .get_session(download_id)
            .await
            .ok_or_else(|| TransferError::NotFound(format!("session {download_id}")))?;
        if info.owner_id != caller {
            tracing::warn!(download_id, caller, "download session accessed by non-owner");
            return Err(TransferError::Unauthorized(format!(
                "session {download_id} belongs to another caller"
            )));
        }
        Ok(info)
    }

    async fn book_record(&self, entity_id: &str) -> Result<Record, TransferError> {
        if entity_id.is_empty() {
            return Err(TransferError::InvalidArgument("entityId is required".into()));
        }
        self.entities
            .get_record(entity_id)
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("book {entity_id}")))
    }

    /// Id of the book's remote container, created on first use.
    async fn resolve_container(
        &self,
        entity_id: &str,
        record: &Record,
    ) -> Result<String, TransferError> {
        if let Some(id) = string_field(record, CONTAINER_FIELD) {
            return Ok(id.to_string());
        }

        let name = format!("{CONTAINER_PREFIX}{entity_id}");
        let id = match self.remote.find_container(&name).await? {
            Some(id) => id,
            None => {
                let id = self.remote.create_container(&name).await?;
                tracing::info!(entity = entity_id, container = %id, "created book container");
                id
            }
        };

        let mut patch = Record::new();
        patch.insert(CONTAINER_FIELD.into(), Value::from(id.as_str()));
        if let Err(e) = self.entities.patch_record(entity_id, patch).await {
            tracing::warn!(entity = entity_id, error = %e, "could not store container id");
        }
        Ok(id)
    }

    /// Remote object currently attached to the book under `purpose`.
    async fn download_target(
        &self,
        entity_id: &str,
        purpose: &str,
    ) -> Result<DownloadTarget, TransferError> {
        let purpose = parse_purpose(purpose)?;
        let record = self.book_record(entity_id).await?;
        let object_id = string_field(&record, purpose.fields().file_id).ok_or_else(|| {
            TransferError::NotFound(format!("book {entity_id} has no {purpose} file"))
        })?;

        let meta = self
            .remote
            .get_object_metadata(object_id)
            .await
            .map_err(remote_lookup_error)?;
        Ok(DownloadTarget {
            object_id: object_id.to_string(),
            name: meta.name,
            mime_type: meta.mime_type,
            size: meta.size,
        })
    }
}

/// Relays buffered chunks at the session's cursor until one is missing.
///
/// Runs as its own task so a claimed relay always reaches `finish_relay`,
/// even when the request that started it is dropped.
///
/// Relay failures are logged, never returned: the chunk stays buffered
/// and completion falls back to a whole-object upload.
async fn relay_pending(
    uploads: Arc<UploadRegistry>,
    remote: Arc<dyn RemoteTransferAdapter>,
    upload_id: String,
) {
    let upload_id = upload_id.as_str();
    while let Some(job) = uploads.claim_relay(upload_id).await {
        let index = job.index;
        let outcome = match remote
            .upload_chunk_to_session(&job.session_token, job.data, job.offset, job.total_size)
            .await
        {
            Ok(status) if status.complete && status.object_id.is_none() => {
                tracing::warn!(
                    upload_id,
                    index,
                    "remote reported completion without an object id"
                );
                RelayOutcome::Failed
            }
            Ok(status) => {
                tracing::debug!(
                    upload_id,
                    index,
                    uploaded = status.uploaded_bytes,
                    complete = status.complete,
                    "chunk relayed"
                );
                RelayOutcome::Accepted {
                    uploaded_bytes: status.uploaded_bytes,
                    object_id: status.object_id,
                }
            }
            Err(e) => {
                tracing::warn!(
                    upload_id,
                    index,
                    error = %e,
                    "relay failed, completion will upload the buffered file"
                );
                RelayOutcome::Failed
            }
        };

        if uploads
            .finish_relay(upload_id, index, outcome)
            .await
            .is_err()
        {
            tracing::debug!(upload_id, index, "session removed while relaying");
            break;
        }
    }
}


fn parse_purpose(purpose: &str) -> Result<Purpose, TransferError> {
    purpose
        .parse::<Purpose>()
        .map_err(|e| TransferError::InvalidArgument(e.to_string()))
}

fn check_file_meta(purpose: Purpose, file: &FileMeta) -> Result<(), TransferError> {
    if file.name.is_empty() {
        return Err(TransferError::InvalidArgument("file name is required".into()));
    }
    if !purpose.accepts_mime(&file.mime_type) {
        return Err(TransferError::InvalidArgument(format!(
            "{} files cannot be stored as {purpose}",
            file.mime_type
        )));
    }
    Ok(())
}

/// Maps a missing remote object to `NotFound` instead of an upstream failure.
fn remote_lookup_error(e: RemoteError) -> TransferError {
    match e {
        RemoteError::NotFound(id) => TransferError::NotFound(format!("remote object {id}")),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryEntityStore, MemoryRemote};
    use galley_protocol::ErrorKind;
    use crate::remote::{ChunkUploadStatus, ObjectMetadata, RemoteFuture};
    use galley_transfer::checksum_bytes;
    use std::time::Duration;

    const OWNER: &str = "editor-1";

    struct Fixture {
        service: Arc<FileOperationsService>,
        remote: Arc<MemoryRemote>,
        store: Arc<MemoryEntityStore>,
    }

    async fn fixture_with(config: TransferConfig) -> Fixture {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(MemoryEntityStore::new());
        let mut record = Record::new();
        record.insert("title".into(), Value::from("The Long Road"));
        store.insert("42", record).await;

        let service = FileOperationsService::start(
            config,
            Arc::clone(&remote) as Arc<dyn RemoteTransferAdapter>,
            Arc::clone(&store) as Arc<dyn EntityStore>,
        )
        .unwrap();
        Fixture {
            service,
            remote,
            store,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(TransferConfig {
            chunk_size: 4,
            chunked_download_threshold_bytes: 8,
            ..TransferConfig::default()
        })
        .await
    }

    fn init_request(size: u64) -> UploadChunkInitRequest {
        UploadChunkInitRequest {
            entity_id: "42".into(),
            purpose: "interior".into(),
            file: FileMeta {
                name: "interior.pdf".into(),
                mime_type: "application/pdf".into(),
                size,
            },
        }
    }

    fn chunk(upload_id: &str, index: i64, total: u32, data: &[u8]) -> UploadChunkRequest {
        UploadChunkRequest {
            upload_id: upload_id.into(),
            chunk_index: index,
            total_chunks: total,
            data: data.to_vec(),
            checksum: None,
        }
    }

    #[tokio::test]
    async fn init_creates_container_and_session() {
        let f = fixture().await;
        let init = f
            .service
            .upload_chunk_init(OWNER, init_request(10))
            .await
            .unwrap();
        assert_eq!(init.chunk_size, 4);
        assert_eq!(init.total_chunks, 3);
        assert_eq!(init.upload_id.len(), 32);

        assert_eq!(f.remote.container_count().await, 1);
        let record = f.store.record("42").await.unwrap();
        assert!(record.contains_key(CONTAINER_FIELD));

        // Second upload reuses the stored container.
        f.service
            .upload_chunk_init(OWNER, init_request(10))
            .await
            .unwrap();
        assert_eq!(f.remote.container_count().await, 1);
        assert_eq!(f.service.active_uploads(OWNER).await.len(), 2);
    }

    #[tokio::test]
    async fn init_rejects_bad_purpose_and_mime() {
        let f = fixture().await;
        let mut req = init_request(10);
        req.purpose = "backCover".into();
        let err = f.service.upload_chunk_init(OWNER, req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let mut req = init_request(10);
        req.purpose = "cover".into();
        let err = f.service.upload_chunk_init(OWNER, req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(f.service.active_uploads(OWNER).await.is_empty());
    }

    #[tokio::test]
    async fn init_unknown_book_not_found() {
        let f = fixture().await;
        let mut req = init_request(10);
        req.entity_id = "404".into();
        let err = f.service.upload_chunk_init(OWNER, req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn init_remote_failure_leaves_no_session() {
        let f = fixture().await;
        f.remote.fail_initiate(true).await;
        let err = f
            .service
            .upload_chunk_init(OWNER, init_request(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamFailure);
        assert!(f.service.active_uploads(OWNER).await.is_empty());
    }

    #[tokio::test]
    async fn relayed_upload_completes_without_whole_upload() {
        let f = fixture().await;
        let init = f
            .service
            .upload_chunk_init(OWNER, init_request(10))
            .await
            .unwrap();
        let id = init.upload_id.as_str();

        let r = f.service.upload_chunk(OWNER, chunk(id, 0, 3, b"abcd")).await.unwrap();
        assert!(!r.complete);
        assert_eq!(r.received_chunks, 1);
        f.service.upload_chunk(OWNER, chunk(id, 1, 3, b"efgh")).await.unwrap();
        let r = f.service.upload_chunk(OWNER, chunk(id, 2, 3, b"ij")).await.unwrap();
        assert!(r.complete);
        assert!(r.remote_complete);
        assert_eq!(r.progress, 100.0);

        let file = f
            .service
            .upload_chunk_complete(OWNER, UploadChunkCompleteRequest { upload_id: id.into() })
            .await
            .unwrap();
        assert_eq!(file.object_name, "interior.pdf");
        assert_eq!(f.remote.whole_uploads().await, 0);
        assert_eq!(f.remote.object_bytes(&file.object_id).await.unwrap(), b"abcdefghij");

        let record = f.store.record("42").await.unwrap();
        assert_eq!(record["interiorFileId"], file.object_id.as_str());
        assert_eq!(record["interiorFileName"], "interior.pdf");
        assert_eq!(record["interiorFileLink"], file.view_link.as_str());
        assert!(f.service.active_uploads(OWNER).await.is_empty());
    }

    #[tokio::test]
    async fn out_of_order_chunks_relay_in_order() {
        let f = fixture().await;
        let init = f
            .service
            .upload_chunk_init(OWNER, init_request(10))
            .await
            .unwrap();
        let id = init.upload_id.as_str();

        f.service.upload_chunk(OWNER, chunk(id, 2, 3, b"ij")).await.unwrap();
        f.service.upload_chunk(OWNER, chunk(id, 1, 3, b"efgh")).await.unwrap();
        assert_eq!(f.remote.relayed_chunks().await, 0);
        let r = f.service.upload_chunk(OWNER, chunk(id, 0, 3, b"abcd")).await.unwrap();
        assert!(r.remote_complete);
        assert_eq!(f.remote.relayed_chunks().await, 3);

        let file = f
            .service
            .upload_chunk_complete(OWNER, UploadChunkCompleteRequest { upload_id: id.into() })
            .await
            .unwrap();
        assert_eq!(f.remote.object_bytes(&file.object_id).await.unwrap(), b"abcdefghij");
    }

    #[tokio::test]
    async fn relay_failure_falls_back_to_whole_upload() {
        let f = fixture().await;
        let init = f
            .service
            .upload_chunk_init(OWNER, init_request(6))
            .await
            .unwrap();
        let id = init.upload_id.as_str();

        f.remote.fail_relay(true).await;
        f.service.upload_chunk(OWNER, chunk(id, 0, 2, b"abcd")).await.unwrap();
        f.remote.fail_relay(false).await;
        let r = f.service.upload_chunk(OWNER, chunk(id, 1, 2, b"ef")).await.unwrap();
        assert!(r.complete);
        assert!(!r.remote_complete);

        let file = f
            .service
            .upload_chunk_complete(OWNER, UploadChunkCompleteRequest { upload_id: id.into() })
            .await
            .unwrap();
        assert_eq!(f.remote.whole_uploads().await, 1);
        assert_eq!(f.remote.object_bytes(&file.object_id).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn failed_fallback_keeps_session_for_retry() {
        let f = fixture().await;
        let init = f
            .service
            .upload_chunk_init(OWNER, init_request(2))
            .await
            .unwrap();
        let id = init.upload_id.clone();

        f.remote.fail_relay(true).await;
        f.service.upload_chunk(OWNER, chunk(&id, 0, 1, b"ab")).await.unwrap();
        f.remote.fail_whole_upload(true).await;
        let err = f
            .service
            .upload_chunk_complete(OWNER, UploadChunkCompleteRequest { upload_id: id.clone() })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamFailure);
        assert!(f.service.upload_progress(OWNER, &id).await.is_ok());

        f.remote.fail_whole_upload(false).await;
        f.service
            .upload_chunk_complete(OWNER, UploadChunkCompleteRequest { upload_id: id })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_patch_retry_does_not_upload_twice() {
        let f = fixture().await;
        let init = f
            .service
            .upload_chunk_init(OWNER, init_request(2))
            .await
            .unwrap();
        let id = init.upload_id.clone();

        f.remote.fail_relay(true).await;
        f.service.upload_chunk(OWNER, chunk(&id, 0, 1, b"ab")).await.unwrap();
        f.store.fail_patches(true).await;
        let err = f
            .service
            .upload_chunk_complete(OWNER, UploadChunkCompleteRequest { upload_id: id.clone() })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamFailure);

        f.store.fail_patches(false).await;
        f.service
            .upload_chunk_complete(OWNER, UploadChunkCompleteRequest { upload_id: id })
            .await
            .unwrap();
        assert_eq!(f.remote.whole_uploads().await, 1);
    }

    #[tokio::test]
    async fn complete_requires_all_chunks() {
        let f = fixture().await;
        let init = f
            .service
            .upload_chunk_init(OWNER, init_request(10))
            .await
            .unwrap();
        f.service
            .upload_chunk(OWNER, chunk(&init.upload_id, 0, 3, b"abcd"))
            .await
            .unwrap();
        let err = f
            .service
            .upload_chunk_complete(OWNER, UploadChunkCompleteRequest { upload_id: init.upload_id })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    }

    #[tokio::test]
    async fn chunk_validation() {
        let f = fixture().await;
        let init = f
            .service
            .upload_chunk_init(OWNER, init_request(10))
            .await
            .unwrap();
        let id = init.upload_id.as_str();

        for req in [
            chunk(id, -1, 3, b"abcd"),
            chunk(id, 3, 3, b"abcd"),
            chunk(id, 0, 4, b"abcd"),
            chunk(id, 0, 3, b"abc"),
            chunk(id, 2, 3, b"ijk"),
        ] {
            let err = f.service.upload_chunk(OWNER, req).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }

        let mut bad = chunk(id, 0, 3, b"abcd");
        bad.checksum = Some(checksum_bytes(b"wxyz"));
        let err = f.service.upload_chunk(OWNER, bad).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let mut good = chunk(id, 0, 3, b"abcd");
        good.checksum = Some(checksum_bytes(b"abcd").to_uppercase());
        f.service.upload_chunk(OWNER, good).await.unwrap();

        let progress = f.service.upload_progress(OWNER, id).await.unwrap();
        assert_eq!(progress.received_chunks, 1);
        assert_eq!(progress.received_bytes, 4);
        assert_eq!(progress.remote_uploaded_bytes, 4);
    }

    #[tokio::test]
    async fn other_callers_are_rejected() {
        let f = fixture().await;
        let init = f
            .service
            .upload_chunk_init(OWNER, init_request(10))
            .await
            .unwrap();
        let id = init.upload_id.clone();

        // Ownership is checked before argument validation.
        let err = f
            .service
            .upload_chunk("intruder", chunk(&id, 99, 1, b""))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        let err = f.service.upload_progress("intruder", &id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        let err = f
            .service
            .upload_chunk_cancel("intruder", UploadChunkCancelRequest { upload_id: id.clone() })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert!(f.service.active_uploads("intruder").await.is_empty());

        let err = f
            .service
            .upload_chunk(OWNER, chunk("missing", 0, 3, b"abcd"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn cancelled_upload_is_gone() {
        let f = fixture().await;
        let init = f
            .service
            .upload_chunk_init(OWNER, init_request(10))
            .await
            .unwrap();
        let id = init.upload_id.clone();
        f.service
            .upload_chunk_cancel(OWNER, UploadChunkCancelRequest { upload_id: id.clone() })
            .await
            .unwrap();
        let err = f
            .service
            .upload_chunk(OWNER, chunk(&id, 0, 3, b"abcd"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn empty_file_upload() {
        let f = fixture().await;
        let init = f
            .service
            .upload_chunk_init(OWNER, init_request(0))
            .await
            .unwrap();
        assert_eq!(init.total_chunks, 1);
        let r = f
            .service
            .upload_chunk(OWNER, chunk(&init.upload_id, 0, 1, b""))
            .await
            .unwrap();
        assert!(r.complete);
        let file = f
            .service
            .upload_chunk_complete(OWNER, UploadChunkCompleteRequest { upload_id: init.upload_id })
            .await
            .unwrap();
        assert!(f.remote.object_bytes(&file.object_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn small_file_fast_paths() {
        let f = fixture().await;
        let req = UploadFileRequest {
            entity_id: "42".into(),
            purpose: "cover".into(),
            file: FileMeta {
                name: "cover.png".into(),
                mime_type: "image/png".into(),
                size: 5,
            },
            data: b"hello".to_vec(),
        };
        let file = f.service.upload_file(OWNER, req.clone()).await.unwrap();
        let record = f.store.record("42").await.unwrap();
        assert_eq!(record["coverFileId"], file.object_id.as_str());

        let init = f
            .service
            .download_chunk_init(
                OWNER,
                DownloadChunkInitRequest {
                    entity_id: "42".into(),
                    purpose: "cover".into(),
                },
            )
            .await
            .unwrap();
        assert!(init.download_id.is_none());
        assert_eq!(init.total_chunks, 0);
        assert_eq!(init.file_size, 5);

        let got = f.service.download_file(OWNER, "42", "cover").await.unwrap();
        assert_eq!(got.data, b"hello");
        assert_eq!(got.mime_type, "image/png");

        let mut wrong_len = req.clone();
        wrong_len.data = b"hi".to_vec();
        let err = f.service.upload_file(OWNER, wrong_len).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let mut too_big = req;
        too_big.file.size = 9;
        too_big.data = vec![0; 9];
        let err = f.service.upload_file(OWNER, too_big).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn download_without_attached_file_not_found() {
        let f = fixture().await;
        let err = f
            .service
            .download_chunk_init(
                OWNER,
                DownloadChunkInitRequest {
                    entity_id: "42".into(),
                    purpose: "marketing".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let mut record = Record::new();
        record.insert("marketingFileId".into(), Value::from("gone"));
        f.store.insert("42", record).await;
        let err = f.service.download_file(OWNER, "42", "marketing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    async fn attach_media_kit(f: &Fixture, data: &[u8]) {
        let object_id = f.remote.put_object("kit.zip", "application/zip", data.to_vec()).await;
        let mut patch = Record::new();
        patch.insert("mediaKitFileId".into(), Value::from(object_id));
        f.store.patch_record("42", patch).await.unwrap();
    }

    fn media_kit() -> DownloadChunkInitRequest {
        DownloadChunkInitRequest {
            entity_id: "42".into(),
            purpose: "mediaKit".into(),
        }
    }

    #[tokio::test]
    async fn chunked_download_reads_ranges() {
        let f = fixture().await;
        attach_media_kit(&f, b"0123456789").await;

        let init = f.service.download_chunk_init(OWNER, media_kit()).await.unwrap();
        let id = init.download_id.unwrap();
        assert_eq!(init.total_chunks, 3);
        assert_eq!(f.service.active_downloads(OWNER).await.len(), 1);

        let mut out = Vec::new();
        for index in 0..3 {
            let r = f
                .service
                .download_chunk(
                    OWNER,
                    DownloadChunkRequest {
                        download_id: id.clone(),
                        chunk_index: index,
                    },
                )
                .await
                .unwrap();
            assert_eq!(r.complete, index == 2);
            out.extend(r.data);
        }
        assert_eq!(out, b"0123456789");
        assert!(f.service.active_downloads(OWNER).await.is_empty());

        let err = f.service.download_file(OWNER, "42", "mediaKit").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn download_index_and_cancel() {
        let f = fixture().await;
        attach_media_kit(&f, b"0123456789").await;
        let id = f
            .service
            .download_chunk_init(OWNER, media_kit())
            .await
            .unwrap()
            .download_id
            .unwrap();

        for bad in [-1, 3] {
            let err = f
                .service
                .download_chunk(
                    OWNER,
                    DownloadChunkRequest {
                        download_id: id.clone(),
                        chunk_index: bad,
                    },
                )
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }

        let err = f
            .service
            .download_chunk_cancel("intruder", DownloadChunkCancelRequest { download_id: id.clone() })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        f.service
            .download_chunk_cancel(OWNER, DownloadChunkCancelRequest { download_id: id.clone() })
            .await
            .unwrap();
        let err = f
            .service
            .download_chunk(
                OWNER,
                DownloadChunkRequest {
                    download_id: id,
                    chunk_index: 0,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let config = TransferConfig {
            chunk_size: 0,
            ..TransferConfig::default()
        };
        let result = FileOperationsService::start(
            config,
            Arc::new(MemoryRemote::new()),
            Arc::new(MemoryEntityStore::new()),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    /// Remote whose resumable chunk uploads wait for a permit.
    struct GatedRemote {
        inner: MemoryRemote,
        gate: tokio::sync::Semaphore,
    }

    impl RemoteTransferAdapter for GatedRemote {
        fn find_container<'a>(&'a self, name: &'a str) -> RemoteFuture<'a, Option<String>> {
            self.inner.find_container(name)
        }

        fn create_container<'a>(&'a self, name: &'a str) -> RemoteFuture<'a, String> {
            self.inner.create_container(name)
        }

        fn initiate_resumable_session<'a>(
            &'a self,
            name: &'a str,
            mime_type: &'a str,
            container_id: &'a str,
            declared_size: u64,
        ) -> RemoteFuture<'a, String> {
            self.inner
                .initiate_resumable_session(name, mime_type, container_id, declared_size)
        }

        fn upload_chunk_to_session<'a>(
            &'a self,
            token: &'a str,
            data: Bytes,
            start_offset: u64,
            total_size: u64,
        ) -> RemoteFuture<'a, ChunkUploadStatus> {
            Box::pin(async move {
                self.gate
                    .acquire()
                    .await
                    .map_err(|e| RemoteError::Unavailable(e.to_string()))?
                    .forget();
                self.inner
                    .upload_chunk_to_session(token, data, start_offset, total_size)
                    .await
            })
        }

        fn upload_whole_object<'a>(
            &'a self,
            name: &'a str,
            mime_type: &'a str,
            container_id: &'a str,
            data: Vec<u8>,
        ) -> RemoteFuture<'a, UploadedFile> {
            self.inner
                .upload_whole_object(name, mime_type, container_id, data)
        }

        fn get_object_metadata<'a>(&'a self, object_id: &'a str) -> RemoteFuture<'a, ObjectMetadata> {
            self.inner.get_object_metadata(object_id)
        }

        fn read_byte_range<'a>(
            &'a self,
            object_id: &'a str,
            start: u64,
            end_inclusive: u64,
        ) -> RemoteFuture<'a, Vec<u8>> {
            self.inner.read_byte_range(object_id, start, end_inclusive)
        }
    }

    async fn wait_for_remote_bytes(service: &FileOperationsService, id: &str, bytes: u64) {
        for _ in 0..1000 {
            let progress = service.upload_progress(OWNER, id).await.unwrap();
            if progress.remote_uploaded_bytes == bytes {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("remote never reached {bytes} bytes");
    }

    #[tokio::test]
    async fn dropped_request_does_not_stall_relay() {
        let remote = Arc::new(GatedRemote {
            inner: MemoryRemote::new(),
            gate: tokio::sync::Semaphore::new(0),
        });
        let store = Arc::new(MemoryEntityStore::new());
        store.insert("42", Record::new()).await;
        let service = FileOperationsService::start(
            TransferConfig {
                chunk_size: 4,
                ..TransferConfig::default()
            },
            Arc::clone(&remote) as Arc<dyn RemoteTransferAdapter>,
            store as Arc<dyn EntityStore>,
        )
        .unwrap();

        let init = service
            .upload_chunk_init(OWNER, init_request(8))
            .await
            .unwrap();
        let id = init.upload_id.clone();

        // The request gives up while its relay is still waiting on the remote.
        let dropped = tokio::time::timeout(
            Duration::from_millis(50),
            service.upload_chunk(OWNER, chunk(&id, 0, 2, b"abcd")),
        )
        .await;
        assert!(dropped.is_err());

        remote.gate.add_permits(2);
        wait_for_remote_bytes(&service, &id, 4).await;

        let r = service
            .upload_chunk(OWNER, chunk(&id, 1, 2, b"efgh"))
            .await
            .unwrap();
        assert!(r.complete);
        wait_for_remote_bytes(&service, &id, 8).await;

        // A repeated chunk reports the committed remote state.
        let r = service
            .upload_chunk(OWNER, chunk(&id, 1, 2, b"efgh"))
            .await
            .unwrap();
        assert!(r.remote_complete);
        assert_eq!(remote.inner.relayed_chunks().await, 2);

        let file = service
            .upload_chunk_complete(OWNER, UploadChunkCompleteRequest { upload_id: id })
            .await
            .unwrap();
        assert_eq!(remote.inner.whole_uploads().await, 0);
        assert_eq!(remote.inner.object_bytes(&file.object_id).await.unwrap(), b"abcdefgh");
    }

    #[tokio::test]
    async fn concurrent_chunks_on_one_session_all_relay() {
        let f = fixture().await;
        let init = f
            .service
            .upload_chunk_init(OWNER, init_request(10))
            .await
            .unwrap();
        let id = init.upload_id.as_str();

        let (a, b, c) = tokio::join!(
            f.service.upload_chunk(OWNER, chunk(id, 1, 3, b"efgh")),
            f.service.upload_chunk(OWNER, chunk(id, 0, 3, b"abcd")),
            f.service.upload_chunk(OWNER, chunk(id, 2, 3, b"ij"))
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(f.remote.relayed_chunks().await, 3);
        let progress = f.service.upload_progress(OWNER, id).await.unwrap();
        assert_eq!(progress.remote_uploaded_bytes, 10);

        let file = f
            .service
            .upload_chunk_complete(OWNER, UploadChunkCompleteRequest { upload_id: id.into() })
            .await
            .unwrap();
        assert_eq!(f.remote.whole_uploads().await, 0);
        assert_eq!(f.remote.object_bytes(&file.object_id).await.unwrap(), b"abcdefghij");
    }
}
