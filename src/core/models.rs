use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use uuid::Uuid;

/// Unique token scoping one run's files on the staging filesystem and in the
/// remote bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Remote object key for a file of this run: `<run-id>/<relative-path>`.
    pub fn object_key(&self, relative_path: &str) -> String {
        format!("{}/{}", self.0, relative_path)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A message on one of the pipeline channels.
///
/// `Done` is the terminal marker: the sending stage will not emit further
/// events on that channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StageMessage<T> {
    Event(T),
    Done,
}

/// Emitted by the copier for every file it attempted.
#[derive(Debug, Clone, PartialEq)]
pub enum CopyEvent {
    Copied {
        path: String,
        size: u64,
        copied_at: DateTime<Utc>,
    },
    Failed {
        path: String,
        error: String,
    },
}

impl CopyEvent {
    pub fn path(&self) -> &str {
        match self {
            Self::Copied { path, .. } | Self::Failed { path, .. } => path,
        }
    }
}

/// Emitted by the verifier once a file leaves the pending set.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyEvent {
    Verified {
        path: String,
        verified_at: DateTime<Utc>,
    },
    /// The file was not observed remotely within the configured per-file timeout.
    TimedOut {
        path: String,
        gave_up_at: DateTime<Utc>,
    },
}

impl VerifyEvent {
    pub fn path(&self) -> &str {
        match self {
            Self::Verified { path, .. } | Self::TimedOut { path, .. } => path,
        }
    }
}

/// Everything known about one file at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileRecord {
    pub size: u64,
    pub copied_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    /// Set only when both timestamps are present.
    pub latency_ms: Option<f64>,
    pub copy_error: Option<String>,
    pub verify_timed_out: bool,
}

impl FileRecord {
    pub fn apply_copy(&mut self, event: &CopyEvent) {
        match event {
            CopyEvent::Copied {
                size, copied_at, ..
            } => {
                self.size = *size;
                self.copied_at = Some(*copied_at);
            }
            CopyEvent::Failed { error, .. } => {
                self.copy_error = Some(error.clone());
            }
        }
    }

    pub fn apply_verify(&mut self, event: &VerifyEvent) {
        match event {
            VerifyEvent::Verified { verified_at, .. } => {
                self.verified_at = Some(*verified_at);
            }
            VerifyEvent::TimedOut { .. } => {
                self.verify_timed_out = true;
            }
        }
    }

    /// Recompute `latency_ms` from the two timestamps.
    pub fn compute_latency(&mut self) -> Option<f64> {
        self.latency_ms = match (self.copied_at, self.verified_at) {
            (Some(copied), Some(verified)) => {
                let delta = verified - copied;
                let micros = delta
                    .num_microseconds()
                    .unwrap_or_else(|| delta.num_milliseconds().saturating_mul(1000));
                Some(micros as f64 / 1000.0)
            }
            _ => None,
        };
        self.latency_ms
    }

    pub fn is_copied(&self) -> bool {
        self.copied_at.is_some()
    }
}

/// Convert a path relative to the source root into the `/`-separated key form
/// used for reports and remote object keys.
///
/// Returns `None` if any component is not valid UTF-8: such a name has no
/// object key that maps back to exactly one file.
pub fn relative_key(relative: &Path) -> Option<String> {
    relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()
        .map(|parts| parts.join("/"))
}
