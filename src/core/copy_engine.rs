//! How a single file gets from the source tree into the staging directory.

use std::fs::{self, File};
use std::future::Future;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use thiserror::Error;
use tracing::debug;

/// Buffer size for file I/O operations (128KB for optimal throughput)
const BUFFER_SIZE: usize = 128 * 1024;

/// Failure to copy a single file. Never fatal for the run.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("failed to read source {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write destination {path}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("copy task aborted: {0}")]
    Aborted(String),
}

pub type CopyFuture = Pin<Box<dyn Future<Output = Result<u64, CopyError>> + Send>>;

/// Copies one file to its staging destination and reports the bytes written.
///
/// Implementations must create missing parent directories of `destination`.
pub trait CopyEngine: Send + Sync {
    fn copy(&self, source: &Path, destination: &Path) -> CopyFuture;
}

/// Byte-for-byte copy on the blocking thread pool.
#[derive(Debug, Clone, Default)]
pub struct NativeCopyEngine {
    /// Whether to fsync each file after writing (safer but slower)
    pub sync_files: bool,
    /// Carry access/modification times over to the copy
    pub preserve_timestamps: bool,
}

impl CopyEngine for NativeCopyEngine {
    fn copy(&self, source: &Path, destination: &Path) -> CopyFuture {
        let source = source.to_path_buf();
        let destination = destination.to_path_buf();
        let engine = self.clone();

        Box::pin(async move {
            tokio::task::spawn_blocking(move || engine.copy_blocking(&source, &destination))
                .await
                .map_err(|e| CopyError::Aborted(e.to_string()))?
        })
    }
}

impl NativeCopyEngine {
    fn copy_blocking(&self, source: &Path, dest: &Path) -> Result<u64, CopyError> {
        let source_err = |e: io::Error| CopyError::Source {
            path: source.to_path_buf(),
            source: e,
        };
        let dest_err = |e: io::Error| CopyError::Destination {
            path: dest.to_path_buf(),
            source: e,
        };

        let source_file = File::open(source).map_err(source_err)?;
        let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(dest_err)?;
        }
        let dest_file = File::create(dest).map_err(dest_err)?;
        let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);

        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut bytes_written: u64 = 0;

        loop {
            let bytes_read = reader.read(&mut buffer).map_err(source_err)?;
            if bytes_read == 0 {
                break;
            }
            writer.write_all(&buffer[..bytes_read]).map_err(dest_err)?;
            bytes_written += bytes_read as u64;
        }

        writer.flush().map_err(dest_err)?;

        if self.sync_files {
            let inner = writer
                .into_inner()
                .map_err(|e| dest_err(io::Error::new(e.error().kind(), e.error().to_string())))?;
            inner.sync_all().map_err(dest_err)?;
        }

        if self.preserve_timestamps {
            if let Err(e) = preserve_timestamps(source, dest) {
                debug!(
                    dest = %dest.display(),
                    error = %e,
                    "Failed to preserve file timestamps"
                );
            }
        }

        Ok(bytes_written)
    }
}

/// Preserve access and modification timestamps from source to destination
fn preserve_timestamps(source: &Path, dest: &Path) -> io::Result<()> {
    let source_metadata = fs::metadata(source)?;

    let atime = filetime::FileTime::from_last_access_time(&source_metadata);
    let mtime = filetime::FileTime::from_last_modification_time(&source_metadata);

    filetime::set_file_times(dest, atime, mtime)
}
