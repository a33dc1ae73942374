//! Pushes a local file through the chunked upload pipeline against the
//! in-memory adapters, downloads it back and checks the bytes match.
//!
//! Usage: `galley-probe <file> [transfer-config.json]`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing_subscriber::EnvFilter;

use galley_file_ops::memory::{MemoryEntityStore, MemoryRemote};
use galley_file_ops::{EntityStore, FileOperationsService, Record, RemoteTransferAdapter};
use galley_protocol::FileMeta;
use galley_protocol::messages::{
    DownloadChunkInitRequest, DownloadChunkRequest, UploadChunkCompleteRequest,
    UploadChunkInitRequest, UploadChunkRequest,
};
use galley_transfer::{TransferConfig, checksum_bytes};

const CALLER: &str = "probe";
const BOOK: &str = "probe-book";
const PURPOSE: &str = "marketing";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,galley=debug")),
        )
        .init();

    let mut args = std::env::args_os().skip(1);
    let Some(file) = args.next().map(PathBuf::from) else {
        bail!("usage: galley-probe <file> [transfer-config.json]");
    };
    let config = match args.next() {
        Some(path) => TransferConfig::load(Path::new(&path))
            .with_context(|| format!("loading {}", Path::new(&path).display()))?,
        None => TransferConfig::default(),
    };

    let data = tokio::fs::read(&file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".into());

    let remote = Arc::new(MemoryRemote::new());
    let store = Arc::new(MemoryEntityStore::new());
    store.insert(BOOK, Record::new()).await;
    let service = FileOperationsService::start(
        config,
        Arc::clone(&remote) as Arc<dyn RemoteTransferAdapter>,
        Arc::clone(&store) as Arc<dyn EntityStore>,
    )?;

    let uploaded = upload(&service, &name, &data).await?;
    println!("{}", serde_json::to_string_pretty(&uploaded)?);

    let echoed = download(&service).await?;
    if echoed != data {
        bail!(
            "round trip mismatch: sent {} bytes, got {} back",
            data.len(),
            echoed.len()
        );
    }

    tracing::info!(
        bytes = data.len(),
        relayed = remote.relayed_chunks().await,
        whole_uploads = remote.whole_uploads().await,
        "round trip verified"
    );
    service.shutdown();
    Ok(())
}

async fn upload(
    service: &FileOperationsService,
    name: &str,
    data: &[u8],
) -> anyhow::Result<galley_protocol::messages::UploadedFile> {
    let init = service
        .upload_chunk_init(
            CALLER,
            UploadChunkInitRequest {
                entity_id: BOOK.into(),
                purpose: PURPOSE.into(),
                file: FileMeta {
                    name: name.into(),
                    mime_type: "application/octet-stream".into(),
                    size: data.len() as u64,
                },
            },
        )
        .await?;
    tracing::info!(upload_id = %init.upload_id, total_chunks = init.total_chunks, "upload opened");

    // An empty file is still one (empty) chunk.
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![data]
    } else {
        data.chunks(init.chunk_size).collect()
    };
    for (index, chunk) in chunks.into_iter().enumerate() {
        let resp = service
            .upload_chunk(
                CALLER,
                UploadChunkRequest {
                    upload_id: init.upload_id.clone(),
                    chunk_index: index as i64,
                    total_chunks: init.total_chunks,
                    data: chunk.to_vec(),
                    checksum: Some(checksum_bytes(chunk)),
                },
            )
            .await?;
        tracing::debug!(index, progress = resp.progress, "chunk sent");
    }

    let file = service
        .upload_chunk_complete(
            CALLER,
            UploadChunkCompleteRequest {
                upload_id: init.upload_id,
            },
        )
        .await?;
    Ok(file)
}

async fn download(service: &FileOperationsService) -> anyhow::Result<Vec<u8>> {
    let init = service
        .download_chunk_init(
            CALLER,
            DownloadChunkInitRequest {
                entity_id: BOOK.into(),
                purpose: PURPOSE.into(),
            },
        )
        .await?;

    let Some(download_id) = init.download_id else {
        tracing::info!(size = init.file_size, "below chunking threshold, fetching whole");
        return Ok(service.download_file(CALLER, BOOK, PURPOSE).await?.data);
    };

    let mut out = Vec::with_capacity(init.file_size as usize);
    for index in 0..init.total_chunks {
        let chunk = service
            .download_chunk(
                CALLER,
                DownloadChunkRequest {
                    download_id: download_id.clone(),
                    chunk_index: i64::from(index),
                },
            )
            .await?;
        out.extend_from_slice(&chunk.data);
        if chunk.complete {
            break;
        }
    }
    Ok(out)
}
