//! Dump artifact naming and writing
//!
//! One CSV file per dump, named after the distributed rank and the wall-clock
//! time of the dump:
//!
//! ```text
//! expert_distribution_rank{R}_timestamp{SECONDS}.{MICROS}.csv
//! ```
//!
//! The file is created fresh, never truncated: an artifact that already exists
//! at the same path is an `Io` error, so two dumps can never share a file. It
//! is written through a buffer, flushed and closed inside a single call. The
//! handle is released on every exit path, including a failed row write; the
//! error still reaches the caller.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::aggregate::ExpertCounts;
use crate::error::{DistributionError, Result};

/// Summary of a successful dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpReport {
    /// Artifact written
    pub path: PathBuf,
    /// Layers present in the artifact
    pub layers: usize,
    /// Data rows written (header excluded)
    pub rows: usize,
    /// Sum of all counts
    pub total_activations: u64,
}

/// Wall-clock seconds since the Unix epoch with microsecond fraction
#[must_use]
pub fn wall_clock_timestamp() -> String {
    let now = chrono::Utc::now();
    format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros())
}

/// File name for a dump taken by `rank` at `timestamp`
#[must_use]
pub fn artifact_file_name(rank: usize, timestamp: &str) -> String {
    format!("expert_distribution_rank{rank}_timestamp{timestamp}.csv")
}

/// Full artifact path inside `dir`
#[must_use]
pub fn artifact_path(dir: &Path, rank: usize, timestamp: &str) -> PathBuf {
    dir.join(artifact_file_name(rank, timestamp))
}

/// Create a new artifact file, failing if `path` already exists
///
/// # Errors
///
/// Returns `Io` if the file exists or cannot be created.
pub fn create_artifact(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| DistributionError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Write `counts` as CSV into `writer`
///
/// `path` names the destination in the report and in errors.
///
/// # Errors
///
/// Returns `Io` if a write or the final flush fails.
pub fn write_counts<W: Write>(
    writer: W,
    path: &Path,
    counts: &ExpertCounts,
) -> Result<DumpReport> {
    let mut writer = BufWriter::new(writer);
    counts
        .write_csv(&mut writer)
        .and_then(|()| writer.flush())
        .map_err(|source| DistributionError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(DumpReport {
        path: path.to_path_buf(),
        layers: counts.num_layers(),
        rows: counts.num_rows(),
        total_activations: counts.total(),
    })
}

/// Write `counts` to a new file at `path`
///
/// # Errors
///
/// Returns `Io` if the file already exists, or cannot be created, written,
/// or flushed.
pub fn write_artifact(path: &Path, counts: &ExpertCounts) -> Result<DumpReport> {
    let file = create_artifact(path)?;
    write_counts(file, path, counts)
}
