// src/curation/snapshot.rs

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::models::RawExample;

pub const SNAPSHOT_PREFIX: &str = "training_data_";

/// Timestamped snapshot location inside `data_dir`.
pub fn snapshot_path(data_dir: &Path, now: DateTime<Utc>) -> PathBuf {
    data_dir.join(format!(
        "{}{}.csv",
        SNAPSHOT_PREFIX,
        now.format("%Y%m%d_%H%M%S")
    ))
}

/// Writes the extracted rows as CSV and marks the file read-only.
///
/// An existing snapshot is never overwritten: a second run within the same
/// second gets a numeric suffix instead.
///
/// # Arguments
/// * `data_dir` - Directory receiving the snapshot (created if missing)
/// * `rows` - Extracted rows, written in order
/// * `now` - Timestamp used for the file name
///
/// # Returns
/// * `Result<PathBuf>` - Path of the written snapshot
pub fn write_snapshot(data_dir: &Path, rows: &[RawExample], now: DateTime<Utc>) -> Result<PathBuf> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let (path, file) = create_unique(data_dir, now)?;
    let mut writer = csv::Writer::from_writer(file);
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("Failed to write snapshot row to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush snapshot {}", path.display()))?;
    drop(writer);

    let mut permissions = fs::metadata(&path)?.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(&path, permissions)
        .with_context(|| format!("Failed to mark snapshot {} read-only", path.display()))?;

    info!("{} examples exported to {}", rows.len(), path.display());
    Ok(path)
}

fn create_unique(data_dir: &Path, now: DateTime<Utc>) -> Result<(PathBuf, File)> {
    let base = snapshot_path(data_dir, now);
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    for attempt in 0..100 {
        let candidate = if attempt == 0 {
            base.clone()
        } else {
            data_dir.join(format!("{}_{}.csv", stem, attempt))
        };
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Snapshot {} already exists, trying next name", candidate.display());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to create snapshot {}", candidate.display()));
            }
        }
    }
    anyhow::bail!("No free snapshot name for {} in {}", stem, data_dir.display())
}

/// Reads a snapshot written by [`write_snapshot`].
pub fn read_snapshot(path: &Path) -> Result<Vec<RawExample>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open snapshot {}", path.display()))?;
    let mut rows = Vec::new();
    for (index, record) in reader.deserialize::<RawExample>().enumerate() {
        let row = record.with_context(|| {
            format!("Malformed snapshot row {} in {}", index + 1, path.display())
        })?;
        rows.push(row);
    }
    debug!("Read {} rows from snapshot {}", rows.len(), path.display());
    Ok(rows)
}
