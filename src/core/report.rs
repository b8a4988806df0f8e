//! Per-file latency report and run summary.

use bytesize::ByteSize;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::core::models::{FileRecord, RunId};

pub const FILE_COLUMN: &str = "File";
pub const SIZE_COLUMN: &str = "Size in Bytes";
pub const LATENCY_COLUMN: &str = "S3 Latency in Ms";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to write report: {0}")]
    Io(#[from] io::Error),
}

/// Final state of a run, produced once by the aggregator.
#[derive(Debug, Clone)]
pub struct Report {
    pub run_id: RunId,
    pub verify_enabled: bool,
    pub records: BTreeMap<String, FileRecord>,
    pub total_bytes: u64,
    pub elapsed: Duration,
    /// Records whose verification timestamp precedes the copy timestamp
    pub negative_latencies: usize,
}

impl Report {
    /// Records of files that were copied successfully, in path order.
    pub fn copied(&self) -> impl Iterator<Item = (&String, &FileRecord)> {
        self.records.iter().filter(|(_, r)| r.is_copied())
    }

    pub fn file_count(&self) -> usize {
        self.copied().count()
    }

    /// `(path, error)` for every file whose copy failed.
    pub fn failed_copies(&self) -> Vec<(&str, &str)> {
        self.records
            .iter()
            .filter_map(|(path, r)| r.copy_error.as_deref().map(|e| (path.as_str(), e)))
            .collect()
    }

    /// Copied files that were never seen remotely. Always 0 without verification.
    pub fn unverified_count(&self) -> usize {
        if !self.verify_enabled {
            return 0;
        }
        self.copied().filter(|(_, r)| r.verified_at.is_none()).count()
    }

    pub fn summary(&self) -> Summary {
        Summary {
            file_count: self.file_count(),
            total_bytes: self.total_bytes,
            elapsed: self.elapsed,
            failed_copies: self.failed_copies().len(),
            unverified_files: self.unverified_count(),
        }
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), ReportError> {
        let writer = csv::Writer::from_path(path)?;
        self.write_to(writer)
    }

    /// One row per copied file. The latency column exists only when
    /// verification was enabled; a missing latency is an empty cell.
    pub fn write_to<W: io::Write>(&self, mut writer: csv::Writer<W>) -> Result<(), ReportError> {
        if self.verify_enabled {
            writer.write_record([FILE_COLUMN, SIZE_COLUMN, LATENCY_COLUMN])?;
        } else {
            writer.write_record([FILE_COLUMN, SIZE_COLUMN])?;
        }

        for (path, record) in self.copied() {
            let size = record.size.to_string();
            if self.verify_enabled {
                let latency = record
                    .latency_ms
                    .map(|ms| ms.to_string())
                    .unwrap_or_default();
                writer.write_record([path.as_str(), size.as_str(), latency.as_str()])?;
            } else {
                writer.write_record([path.as_str(), size.as_str()])?;
            }
        }

        writer.flush()?;
        Ok(())
    }
}

/// One row of a report file as read back from disk.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReportRow {
    #[serde(rename = "File")]
    pub file: String,
    #[serde(rename = "Size in Bytes")]
    pub size: u64,
    #[serde(rename = "S3 Latency in Ms", default)]
    pub latency_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReport {
    pub has_latency_column: bool,
    pub rows: Vec<ReportRow>,
}

/// Read a report written by [`Report::write_csv`], with or without the
/// latency column.
pub fn read_report(path: &Path) -> Result<ParsedReport, ReportError> {
    let mut reader = csv::Reader::from_path(path)?;
    let has_latency_column = reader.headers()?.iter().any(|h| h == LATENCY_COLUMN);

    let rows = reader
        .deserialize::<ReportRow>()
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ParsedReport {
        has_latency_column,
        rows,
    })
}

/// Aggregate numbers printed at the end of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub file_count: usize,
    pub total_bytes: u64,
    pub elapsed: Duration,
    pub failed_copies: usize,
    pub unverified_files: usize,
}

impl Summary {
    /// Bytes per second, or `None` when the elapsed time is zero.
    pub fn throughput(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            Some(self.total_bytes as f64 / secs)
        } else {
            None
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed_copies == 0 && self.unverified_files == 0
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "File Count: {}", self.file_count)?;
        writeln!(f, "Total Size: {}", ByteSize(self.total_bytes))?;
        writeln!(
            f,
            "Execution Time: {:.3} second(s)",
            self.elapsed.as_secs_f64()
        )?;
        match self.throughput() {
            Some(rate) => writeln!(f, "Performance: {}/sec", ByteSize(rate as u64))?,
            None => writeln!(f, "Performance: n/a (elapsed time too short to measure)")?,
        }
        if self.failed_copies > 0 {
            writeln!(f, "Failed Copies: {}", self.failed_copies)?;
        }
        if self.unverified_files > 0 {
            writeln!(f, "Unverified Files: {}", self.unverified_files)?;
        }
        Ok(())
    }
}
