//! Copy stage: walks the source tree and stages every regular file under
//! `<destination>/<run-id>/`, with at most N copies in flight.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::core::copy_engine::CopyEngine;
use crate::core::models::{CopyEvent, RunId, StageMessage, relative_key};
use crate::logging::LogThrottle;

pub type NoticeSender = mpsc::UnboundedSender<StageMessage<String>>;
pub type CopyEventSender = mpsc::UnboundedSender<StageMessage<CopyEvent>>;

/// Entries buffered between the blocking directory walk and the copy loop
const WALK_BUFFER: usize = 1024;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CopierSummary {
    pub files_copied: u64,
    pub files_failed: u64,
    pub bytes_copied: u64,
    pub duration: Duration,
}

/// A regular file found under the source root.
#[derive(Debug, Clone)]
struct FileEntry {
    path: PathBuf,
    relative: PathBuf,
}

#[derive(Default)]
struct CopyCounters {
    copied: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
}

pub struct Copier {
    engine: Arc<dyn CopyEngine>,
    limiter: Arc<Semaphore>,
    run_id: RunId,
}

impl Copier {
    pub fn new(engine: Arc<dyn CopyEngine>, run_id: RunId, max_concurrent_copies: usize) -> Self {
        Self {
            engine,
            limiter: Arc::new(Semaphore::new(max_concurrent_copies.max(1))),
            run_id,
        }
    }

    /// Directory this run's files land in.
    pub fn staging_root(&self, destination: &Path) -> PathBuf {
        destination.join(self.run_id.to_string())
    }

    /// Copy every file under `source`, then send `Done` on both channels.
    ///
    /// `notices` is `None` when verification is disabled. The sentinels are sent
    /// even when the walk itself fails, so downstream stages always finish.
    pub async fn run(
        self,
        source: &Path,
        destination: &Path,
        notices: Option<NoticeSender>,
        events: CopyEventSender,
    ) -> Result<CopierSummary> {
        let span = info_span!(
            "copier",
            run_id = %self.run_id,
            source = %source.display(),
            destination = %destination.display()
        );

        async {
            let start = Instant::now();
            let tracker = TaskTracker::new();
            let counters = Arc::new(CopyCounters::default());

            let walked = self
                .copy_all(source, destination, &tracker, &counters, &notices, &events)
                .await;

            tracker.close();
            tracker.wait().await;

            if let Some(notices) = &notices {
                let _ = notices.send(StageMessage::Done);
            }
            let _ = events.send(StageMessage::Done);

            let summary = CopierSummary {
                files_copied: counters.copied.load(Ordering::Relaxed),
                files_failed: counters.failed.load(Ordering::Relaxed),
                bytes_copied: counters.bytes.load(Ordering::Relaxed),
                duration: start.elapsed(),
            };

            info!(
                files_copied = summary.files_copied,
                files_failed = summary.files_failed,
                bytes = summary.bytes_copied,
                duration_secs = format!("{:.3}", summary.duration.as_secs_f64()),
                "Copy stage complete"
            );

            walked.map(|_| summary)
        }
        .instrument(span)
        .await
    }

    async fn copy_all(
        &self,
        source: &Path,
        destination: &Path,
        tracker: &TaskTracker,
        counters: &Arc<CopyCounters>,
        notices: &Option<NoticeSender>,
        events: &CopyEventSender,
    ) -> Result<()> {
        let metadata = tokio::fs::metadata(source)
            .await
            .with_context(|| format!("Failed to read source directory {}", source.display()))?;
        if !metadata.is_dir() {
            bail!("Source is not a directory: {}", source.display());
        }
        tokio::fs::read_dir(source)
            .await
            .with_context(|| format!("Failed to list source directory {}", source.display()))?;

        let staging = self.staging_root(destination);
        tokio::fs::create_dir_all(&staging)
            .await
            .with_context(|| format!("Failed to create staging directory {}", staging.display()))?;

        let (entry_tx, mut entries) = mpsc::channel(WALK_BUFFER);
        let root = source.to_path_buf();
        let walker = tokio::task::spawn_blocking(move || walk_directory(&root, &root, &entry_tx));

        let throttle = Arc::new(LogThrottle::new(PROGRESS_LOG_INTERVAL));

        while let Some(entry) = entries.recv().await {
            let Some(key) = relative_key(&entry.relative) else {
                let name = format!("{:?}", entry.relative);
                let name = name.trim_matches('"').to_string();
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(file = %name, "File name is not valid UTF-8, skipping");
                let _ = events.send(StageMessage::Event(CopyEvent::Failed {
                    path: name,
                    error: "file name is not valid UTF-8".to_string(),
                }));
                continue;
            };

            // Blocks the walk while the limiter is full.
            let permit = self
                .limiter
                .clone()
                .acquire_owned()
                .await
                .context("Copy limiter closed")?;

            let engine = self.engine.clone();
            let dest_path = staging.join(&entry.relative);
            let counters = counters.clone();
            let notices = notices.clone();
            let events = events.clone();
            let throttle = throttle.clone();

            tracker.spawn(async move {
                debug!(file = %key, "Copying file");

                let result = engine.copy(&entry.path, &dest_path).await;
                drop(permit);

                match result {
                    Ok(size) => {
                        let copied_at = Utc::now();
                        let copied = counters.copied.fetch_add(1, Ordering::Relaxed) + 1;
                        let bytes = counters.bytes.fetch_add(size, Ordering::Relaxed) + size;

                        if let Some(notices) = &notices {
                            let _ = notices.send(StageMessage::Event(key.clone()));
                        }
                        let _ = events.send(StageMessage::Event(CopyEvent::Copied {
                            path: key,
                            size,
                            copied_at,
                        }));

                        if throttle.should_log() {
                            info!(files_copied = copied, bytes, "Copy progress");
                        }
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(file = %key, error = %e, "Failed to copy file, skipping");
                        let _ = events.send(StageMessage::Event(CopyEvent::Failed {
                            path: key,
                            error: e.to_string(),
                        }));
                    }
                }
            });
        }

        walker.await.context("Directory walk panicked")?;
        Ok(())
    }
}

/// Recursively send every regular file under `current` to `tx`.
///
/// Symlinks and special files are skipped; unreadable entries are logged and
/// skipped. Stops early if the receiver goes away.
fn walk_directory(base: &Path, current: &Path, tx: &mpsc::Sender<FileEntry>) -> bool {
    let entries = match fs::read_dir(current) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %current.display(), error = %e, "Skipping unreadable directory");
            return true;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %current.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        let path = entry.path();

        // Use symlink_metadata to avoid following symlinks
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            if !walk_directory(base, &path, tx) {
                return false;
            }
        } else if metadata.is_file() {
            let Ok(relative) = path.strip_prefix(base).map(Path::to_path_buf) else {
                continue;
            };
            if tx.blocking_send(FileEntry { path, relative }).is_err() {
                return false;
            }
        }
    }

    true
}
