//! Periodic eviction of idle sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::download::DownloadRegistry;
use crate::upload::UploadRegistry;

/// Sessions removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub uploads: usize,
    pub downloads: usize,
}

/// Evicts sessions from both registries once they have been idle too long.
///
/// Passes never overlap: a manual [`sweep_once`](Self::sweep_once) waits for
/// a running timer pass and vice versa.
pub struct CleanupSweeper {
    uploads: Arc<UploadRegistry>,
    downloads: Arc<DownloadRegistry>,
    upload_timeout: Duration,
    download_timeout: Duration,
    interval: Duration,
    running: Mutex<()>,
}

impl CleanupSweeper {
    pub fn new(
        uploads: Arc<UploadRegistry>,
        downloads: Arc<DownloadRegistry>,
        config: &TransferConfig,
    ) -> Self {
        Self {
            uploads,
            downloads,
            upload_timeout: config.session_timeout(),
            download_timeout: config.download_session_timeout(),
            interval: config.cleanup_interval(),
            running: Mutex::new(()),
        }
    }

    /// Runs a single sweep over both registries.
    pub async fn sweep_once(&self) -> SweepReport {
        let _pass = self.running.lock().await;
        let report = SweepReport {
            uploads: self.uploads.evict_idle(self.upload_timeout).await,
            downloads: self.downloads.evict_idle(self.download_timeout).await,
        };
        if report.uploads > 0 || report.downloads > 0 {
            tracing::info!(
                uploads = report.uploads,
                downloads = report.downloads,
                "evicted idle transfer sessions"
            );
        }
        report
    }

    /// Starts sweeping every `interval` in a background tokio task.
    ///
    /// The task stops when the returned handle is stopped or dropped.
    pub fn spawn(self: Arc<Self>) -> SweeperHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("cleanup sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                }
            }
        });

        SweeperHandle { cancel }
    }
}

/// Stops the background sweep when stopped or dropped.
pub struct SweeperHandle {
    cancel: CancellationToken,
}

impl SweeperHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
