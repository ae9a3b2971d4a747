//! Snapshots of the replicated state machine.
//!
//! Snapshot file format (`{index}_{millis}.snap`):
//! `[MAGIC 8][INDEX u64][TERM u64][BLAKE3 32][PAYLOAD_LEN u64][PAYLOAD]`
//!
//! Files are written to a temporary name, synced, then renamed, so a crash
//! never leaves a half-written artifact under a final name.

use crate::common::scheduler::PeriodicTask;
use crate::common::{format_bytes, timestamp_now_millis, MetricsRegistry};
use crate::consensus::RaftNode;
use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub(crate) const SNAPSHOT_MAGIC: &[u8; 8] = b"FLTSNAP1";
pub(crate) const SNAPSHOT_EXTENSION: &str = "snap";
pub(crate) const HEADER_LEN: usize = 8 + 8 + 8 + 32 + 8;

/// One persisted snapshot artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub filename: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    /// Committed log index the snapshot covers
    pub index: u64,
}

impl SnapshotInfo {
    /// Parse `{index}_{millis}.snap`
    fn from_path(path: &Path) -> Option<Self> {
        if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
            return None;
        }
        let filename = path.file_name()?.to_str()?.to_string();
        let stem = path.file_stem()?.to_str()?;
        let (index, millis) = stem.split_once('_')?;
        let index = index.parse().ok()?;
        let created_at = Utc.timestamp_millis_opt(millis.parse().ok()?).single()?;
        let size = fs::metadata(path).ok()?.len();
        Some(Self {
            filename,
            size,
            created_at,
            index,
        })
    }
}

/// Header fields of a snapshot file
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SnapshotHeader {
    pub index: u64,
    pub term: u64,
    pub hash: [u8; 32],
    pub payload_len: u64,
}

pub(crate) fn read_header<R: Read>(reader: &mut R) -> std::io::Result<SnapshotHeader> {
    let mut buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut buf)?;
    if &buf[0..8] != SNAPSHOT_MAGIC {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "invalid snapshot magic",
        ));
    }

    let mut index = [0u8; 8];
    index.copy_from_slice(&buf[8..16]);
    let mut term = [0u8; 8];
    term.copy_from_slice(&buf[16..24]);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&buf[24..56]);
    let mut payload_len = [0u8; 8];
    payload_len.copy_from_slice(&buf[56..64]);

    Ok(SnapshotHeader {
        index: u64::from_le_bytes(index),
        term: u64::from_le_bytes(term),
        hash,
        payload_len: u64::from_le_bytes(payload_len),
    })
}

/// Reject a header whose declared payload runs past the end of the file
pub(crate) fn check_payload_len(header: &SnapshotHeader, file_len: u64) -> std::io::Result<()> {
    let available = file_len.saturating_sub(HEADER_LEN as u64);
    if header.payload_len > available {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "declared payload of {} bytes, file holds {}",
                header.payload_len, available
            ),
        ));
    }
    Ok(())
}

/// `.snap` files in `dir`, oldest index first
pub(crate) fn snapshot_files(dir: &Path) -> Result<Vec<SnapshotInfo>> {
    let mut snapshots = Vec::new();
    if !dir.exists() {
        return Ok(snapshots);
    }
    for item in fs::read_dir(dir)? {
        let path = item?.path();
        if let Some(info) = SnapshotInfo::from_path(&path) {
            snapshots.push(info);
        }
    }
    snapshots.sort_by(|a, b| (a.index, a.created_at).cmp(&(b.index, b.created_at)));
    Ok(snapshots)
}

pub struct SnapshotManager {
    node: Arc<RaftNode>,
    dir: PathBuf,
    interval: Duration,
    last_snapshot: Mutex<Option<DateTime<Utc>>>,
    metrics: Arc<MetricsRegistry>,
}

impl SnapshotManager {
    pub fn new(
        node: Arc<RaftNode>,
        dir: impl Into<PathBuf>,
        interval: Duration,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let last = snapshot_files(&dir)?
            .iter()
            .map(|s| s.created_at)
            .max();

        Ok(Self {
            node,
            dir,
            interval,
            last_snapshot: Mutex::new(last),
            metrics,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn last_snapshot_at(&self) -> Option<DateTime<Utc>> {
        *self.last_snapshot.lock()
    }

    /// Snapshot unless one was taken less than the configured interval ago
    pub fn take_snapshot(&self) -> Result<SnapshotInfo> {
        if let Some(last) = *self.last_snapshot.lock() {
            let elapsed = (Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
            if elapsed < self.interval {
                return Err(Error::AlreadyRecent {
                    elapsed_secs: elapsed.as_secs(),
                });
            }
        }
        self.take_snapshot_forced()
    }

    /// Persist the applied state at its committed index, then compact the
    /// log up to that index. A failed compaction is logged; the snapshot
    /// still counts.
    pub fn take_snapshot_forced(&self) -> Result<SnapshotInfo> {
        let info = match self.write_snapshot() {
            Ok(info) => info,
            Err(e) => {
                self.metrics.snapshot_failures_total.inc();
                tracing::error!(dir = %self.dir.display(), error = %e, "Snapshot failed");
                return Err(e);
            }
        };
        *self.last_snapshot.lock() = Some(info.created_at);
        self.metrics.snapshots_total.inc();
        tracing::info!(
            snapshot = %info.filename,
            index = info.index,
            size = %format_bytes(info.size),
            "Snapshot persisted"
        );

        if let Err(e) = self.node.compact_log(info.index) {
            self.metrics.compaction_failures_total.inc();
            tracing::warn!(index = info.index, error = %e, "Log compaction after snapshot failed");
        }
        Ok(info)
    }

    fn write_snapshot(&self) -> Result<SnapshotInfo> {
        let (index, term, payload) = self.node.snapshot_data()?;
        let millis = timestamp_now_millis();
        let filename = format!("{}_{}.{}", index, millis, SNAPSHOT_EXTENSION);
        let path = self.dir.join(&filename);
        let tmp = self.dir.join(format!("{}.tmp", filename));

        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            writer.write_all(SNAPSHOT_MAGIC)?;
            writer.write_all(&index.to_le_bytes())?;
            writer.write_all(&term.to_le_bytes())?;
            writer.write_all(blake3::hash(&payload).as_bytes())?;
            writer.write_all(&(payload.len() as u64).to_le_bytes())?;
            writer.write_all(&payload)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        Ok(SnapshotInfo {
            filename,
            size: fs::metadata(&path)?.len(),
            created_at: Utc
                .timestamp_millis_opt(millis as i64)
                .single()
                .unwrap_or_else(Utc::now),
            index,
        })
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        snapshot_files(&self.dir)
    }

    /// Read a snapshot back in full, checking its content hash.
    /// Returns `(index, term, payload)`.
    pub fn read_snapshot(&self, filename: &str) -> Result<(u64, u64, Vec<u8>)> {
        let path = self.dir.join(filename);
        if !path.exists() {
            return Err(Error::SnapshotNotFound(filename.to_string()));
        }
        let corrupt = |e: std::io::Error| {
            tracing::error!(snapshot = %filename, error = %e, "Snapshot unreadable");
            Error::CorruptSnapshot {
                filename: filename.to_string(),
            }
        };

        let file = File::open(&path).map_err(corrupt)?;
        let file_len = file.metadata().map_err(corrupt)?.len();
        let mut reader = BufReader::new(file);
        let header = read_header(&mut reader).map_err(corrupt)?;
        check_payload_len(&header, file_len).map_err(corrupt)?;
        let mut payload = vec![0u8; header.payload_len as usize];
        reader.read_exact(&mut payload).map_err(corrupt)?;

        if blake3::hash(&payload).as_bytes() != &header.hash {
            tracing::error!(snapshot = %filename, "Snapshot hash mismatch");
            return Err(Error::CorruptSnapshot {
                filename: filename.to_string(),
            });
        }
        Ok((header.index, header.term, payload))
    }

    /// Load `filename` into the state machine. Restoring the same snapshot
    /// twice leaves the state unchanged.
    pub fn restore_from_snapshot(&self, filename: &str) -> Result<bool> {
        let (index, term, payload) = self.read_snapshot(filename)?;
        let applied = self.node.restore_snapshot(index, term, &payload)?;
        if applied {
            tracing::info!(snapshot = %filename, index, term, "Restored snapshot");
        } else {
            tracing::debug!(snapshot = %filename, index, "Snapshot already applied");
        }
        Ok(applied)
    }

    /// Restore the newest snapshot, if any
    pub fn restore_latest(&self) -> Result<Option<SnapshotInfo>> {
        let Some(latest) = self.list_snapshots()?.pop() else {
            return Ok(None);
        };
        self.restore_from_snapshot(&latest.filename)?;
        Ok(Some(latest))
    }

    /// Bounded read of every artifact; see [`crate::ops::verify_snapshot_integrity`]
    pub fn verify_integrity(&self) -> Result<usize> {
        crate::ops::verify::verify_snapshot_integrity(&self.dir)
    }

    /// Background snapshot loop. Failures are logged and retried next period.
    pub fn schedule_periodic_snapshots(self: &Arc<Self>, interval: Duration) -> PeriodicTask {
        let manager = self.clone();
        PeriodicTask::new("snapshot", interval, move || {
            let manager = manager.clone();
            async move {
                match manager.take_snapshot() {
                    Ok(_) => {}
                    Err(Error::AlreadyRecent { elapsed_secs }) => {
                        tracing::debug!(elapsed_secs, "Skipping periodic snapshot");
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::warn!(error = %e, "Periodic snapshot failed, retrying next period")
                    }
                    Err(e) => tracing::error!(error = %e, "Periodic snapshot failed"),
                }
            }
        })
    }
}
