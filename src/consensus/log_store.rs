//! Durable Raft log: append-only segment files plus the hard state.
//!
//! Segment record format:
//! `[MAGIC][INDEX u64][TERM u64][PAYLOAD_LEN u32][PAYLOAD][CRC32]`
//! where the payload is the bincode-encoded [`Command`] and the checksum
//! covers everything between the magic and itself.
//!
//! Segments are named `segment-{first_index}.log`. The active (last) segment
//! rolls over once it exceeds the configured size. Truncation and compaction
//! rewrite the retained tail into a single fresh segment.
//!
//! A rewrite first stages the new segment as `*.log.ready`, fully synced,
//! before any existing segment is removed. `open` finishes a rewrite that was
//! interrupted after staging and discards one interrupted before it.

use crate::common::crc32;
use crate::consensus::raft::{Command, LogEntry};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const LOG_MAGIC: [u8; 4] = [0x52, 0x4C, 0x47, 0x31]; // "RLG1"
const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".log";
const STAGING_SUFFIX: &str = ".log.tmp";
const READY_SUFFIX: &str = ".log.ready";
const HARD_STATE_FILE: &str = "hard_state.json";

/// Term and vote, persisted before answering any RPC that changed them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<String>,
}

/// On-disk log segments for one replica
pub struct LogStore {
    dir: PathBuf,
    segment_max_bytes: u64,
    active_path: PathBuf,
    writer: BufWriter<File>,
    active_size: u64,
}

impl LogStore {
    /// Open or create the store in `dir`, returning it along with every
    /// entry that could be recovered from existing segments.
    pub fn open(dir: impl AsRef<Path>, segment_max_bytes: u64) -> Result<(Self, Vec<LogEntry>)> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Self::recover_rewrite(&dir)?;

        let segments = Self::list_segments(&dir)?;
        let mut entries: Vec<LogEntry> = Vec::new();
        for segment in &segments {
            for entry in Self::read_segment(segment)? {
                // a later segment may restart below the previous tail after a rewrite
                if let Some(pos) = entries.iter().position(|e| e.index >= entry.index) {
                    entries.truncate(pos);
                }
                entries.push(entry);
            }
        }

        let active_path = match segments.last() {
            Some(path) => path.clone(),
            None => Self::segment_path(&dir, entries.last().map(|e| e.index + 1).unwrap_or(1)),
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)?;
        let active_size = file.metadata()?.len();

        tracing::debug!(
            dir = %dir.display(),
            segments = segments.len(),
            entries = entries.len(),
            "Opened raft log store"
        );

        Ok((
            Self {
                dir,
                segment_max_bytes,
                active_path,
                writer: BufWriter::new(file),
                active_size,
            },
            entries,
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn segment_path(dir: &Path, first_index: u64) -> PathBuf {
        dir.join(format!("{}{:020}{}", SEGMENT_PREFIX, first_index, SEGMENT_SUFFIX))
    }

    fn is_segment(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(SEGMENT_PREFIX) && n.ends_with(SEGMENT_SUFFIX))
            .unwrap_or(false)
    }

    /// Segment files in `dir`, oldest first
    pub fn list_segments(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut segments = Vec::new();
        for item in fs::read_dir(dir)? {
            let path = item?.path();
            if path.is_file() && Self::is_segment(&path) {
                segments.push(path);
            }
        }
        segments.sort();
        Ok(segments)
    }

    /// Append entries to the active segment and sync them to disk
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        if self.active_size >= self.segment_max_bytes {
            self.roll_segment(first.index)?;
        }

        for entry in entries {
            self.active_size += Self::write_entry(&mut self.writer, entry)?;
        }
        self.sync()
    }

    fn roll_segment(&mut self, first_index: u64) -> Result<()> {
        self.sync()?;
        let path = Self::segment_path(&self.dir, first_index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!(segment = %path.display(), "Rolled raft log segment");
        self.writer = BufWriter::new(file);
        self.active_path = path;
        self.active_size = 0;
        Ok(())
    }

    /// Replace every segment with a single one holding `entries`.
    /// `next_index` names the segment when `entries` is empty.
    pub fn rewrite(&mut self, entries: &[LogEntry], next_index: u64) -> Result<()> {
        let staged = self.stage(entries, next_index)?;
        for segment in Self::list_segments(&self.dir)? {
            fs::remove_file(segment)?;
        }
        self.promote(staged)
    }

    /// Move every segment into `archive_root/logs_{timestamp}` and start a
    /// fresh active segment holding `retained`.
    pub fn rotate(
        &mut self,
        archive_root: &Path,
        timestamp: u64,
        retained: &[LogEntry],
        next_index: u64,
    ) -> Result<PathBuf> {
        let archive = archive_root.join(format!("logs_{}", timestamp));
        fs::create_dir_all(&archive)?;

        let staged = self.stage(retained, next_index)?;
        for segment in Self::list_segments(&self.dir)? {
            if let Some(name) = segment.file_name() {
                fs::rename(&segment, archive.join(name))?;
            }
        }
        sync_dir(&archive)?;
        self.promote(staged)?;
        Ok(archive)
    }

    /// Write `entries` to a synced `*.log.ready` file. Existing segments
    /// are untouched until [`Self::promote`].
    fn stage(&mut self, entries: &[LogEntry], next_index: u64) -> Result<Staged> {
        self.sync()?;
        let first_index = entries.first().map(|e| e.index).unwrap_or(next_index);
        let target = Self::segment_path(&self.dir, first_index);
        let tmp = with_suffix(&target, STAGING_SUFFIX);
        let ready = with_suffix(&target, READY_SUFFIX);

        let mut size = 0;
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for entry in entries {
                size += Self::write_entry(&mut writer, entry)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &ready)?;
        sync_dir(&self.dir)?;
        Ok(Staged {
            ready,
            target,
            size,
        })
    }

    /// Install a staged segment as the only active one
    fn promote(&mut self, staged: Staged) -> Result<()> {
        fs::rename(&staged.ready, &staged.target)?;
        sync_dir(&self.dir)?;

        let file = OpenOptions::new().append(true).open(&staged.target)?;
        self.writer = BufWriter::new(file);
        self.active_path = staged.target;
        self.active_size = staged.size;
        Ok(())
    }

    /// Settle a rewrite cut short by a crash. A ready file is complete and
    /// replaces whatever segments remain; a staging file is partial and is
    /// dropped.
    fn recover_rewrite(dir: &Path) -> Result<()> {
        let mut ready = None;
        for item in fs::read_dir(dir)? {
            let path = item?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(STAGING_SUFFIX) {
                fs::remove_file(&path)?;
            } else if name.ends_with(READY_SUFFIX) {
                let target = dir.join(name.trim_end_matches(READY_SUFFIX).to_string() + SEGMENT_SUFFIX);
                ready = Some((path, target));
            }
        }

        if let Some((ready, target)) = ready {
            tracing::warn!(segment = %target.display(), "Completing interrupted log rewrite");
            for segment in Self::list_segments(dir)? {
                fs::remove_file(segment)?;
            }
            fs::rename(&ready, &target)?;
            sync_dir(dir)?;
        }
        Ok(())
    }

    /// Total bytes held by the segment files
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0;
        for segment in Self::list_segments(&self.dir)? {
            total += fs::metadata(segment)?.len();
        }
        Ok(total)
    }

    fn write_entry<W: Write>(writer: &mut W, entry: &LogEntry) -> Result<u64> {
        let payload = bincode::serialize(&entry.command)?;

        let mut body = Vec::with_capacity(20 + payload.len());
        body.extend_from_slice(&entry.index.to_le_bytes());
        body.extend_from_slice(&entry.term.to_le_bytes());
        body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        body.extend_from_slice(&payload);

        writer.write_all(&LOG_MAGIC)?;
        writer.write_all(&body)?;
        writer.write_all(&crc32(&body).to_le_bytes())?;

        Ok((LOG_MAGIC.len() + body.len() + 4) as u64)
    }

    fn read_segment(path: &Path) -> Result<Vec<LogEntry>> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(segment = %path.display(), error = %e, "Log replay stopped at corrupted entry");
                    break;
                }
            }
        }
        Ok(entries)
    }

    fn read_entry<R: Read>(reader: &mut R) -> Result<Option<LogEntry>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if magic != LOG_MAGIC {
            return Err(Error::Raft("invalid log record magic".into()));
        }

        let mut header = [0u8; 20];
        reader.read_exact(&mut header)?;
        let index = u64::from_le_bytes(header[0..8].try_into().map_err(|_| bad_header())?);
        let term = u64::from_le_bytes(header[8..16].try_into().map_err(|_| bad_header())?);
        let len = u32::from_le_bytes(header[16..20].try_into().map_err(|_| bad_header())?) as usize;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;

        let mut body = Vec::with_capacity(20 + len);
        body.extend_from_slice(&header);
        body.extend_from_slice(&payload);
        if crc32(&body) != u32::from_le_bytes(checksum_bytes) {
            return Err(Error::Raft(format!("checksum mismatch at index {}", index)));
        }

        let command: Command = bincode::deserialize(&payload)?;
        Ok(Some(LogEntry {
            term,
            index,
            command,
        }))
    }

    /// Sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    pub fn save_hard_state(&self, state: &HardState) -> Result<()> {
        let path = self.dir.join(HARD_STATE_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(state)?)?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    pub fn load_hard_state(&self) -> Result<HardState> {
        match fs::read(self.dir.join(HARD_STATE_FILE)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HardState::default()),
            Err(e) => Err(e.into()),
        }
    }
}

/// A fully written replacement segment waiting to be installed
struct Staged {
    ready: PathBuf,
    target: PathBuf,
    size: u64,
}

/// `segment-N.log` with its `.log` suffix swapped for `suffix`
fn with_suffix(segment: &Path, suffix: &str) -> PathBuf {
    let name = segment
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .trim_end_matches(SEGMENT_SUFFIX);
    segment.with_file_name(format!("{}{}", name, suffix))
}

/// Make renames and removals in `dir` durable
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn bad_header() -> Error {
    Error::Raft("short log record header".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            command: Command::AddPeer {
                id: format!("n{}", index),
                address: format!("mem://n{}", index),
            },
        }
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let (mut store, recovered) = LogStore::open(dir.path(), 1 << 20).unwrap();
            assert!(recovered.is_empty());
            store.append(&[entry(1, 1), entry(1, 2)]).unwrap();
            store.append(&[entry(2, 3)]).unwrap();
        }

        let (_, recovered) = LogStore::open(dir.path(), 1 << 20).unwrap();
        assert_eq!(recovered.len(), 3);
        assert_eq!(recovered[2], entry(2, 3));
    }

    #[test]
    fn test_segments_roll_over() {
        let dir = tempdir().unwrap();
        let (mut store, _) = LogStore::open(dir.path(), 64).unwrap();
        for i in 1..=5 {
            store.append(&[entry(1, i)]).unwrap();
        }
        assert!(LogStore::list_segments(dir.path()).unwrap().len() > 1);

        drop(store);
        let (_, recovered) = LogStore::open(dir.path(), 64).unwrap();
        let indexes: Vec<u64> = recovered.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_rewrite_drops_compacted_prefix() {
        let dir = tempdir().unwrap();
        let (mut store, _) = LogStore::open(dir.path(), 64).unwrap();
        for i in 1..=5 {
            store.append(&[entry(1, i)]).unwrap();
        }

        store.rewrite(&[entry(1, 4), entry(1, 5)], 6).unwrap();
        assert_eq!(LogStore::list_segments(dir.path()).unwrap().len(), 1);

        store.append(&[entry(2, 6)]).unwrap();
        drop(store);
        let (_, recovered) = LogStore::open(dir.path(), 1 << 20).unwrap();
        let indexes: Vec<u64> = recovered.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![4, 5, 6]);
    }

    #[test]
    fn test_rotate_archives_segments() {
        let dir = tempdir().unwrap();
        let archive_root = tempdir().unwrap();
        let (mut store, _) = LogStore::open(dir.path(), 1 << 20).unwrap();
        store.append(&[entry(1, 1), entry(1, 2)]).unwrap();

        let archive = store
            .rotate(archive_root.path(), 42, &[entry(1, 2)], 3)
            .unwrap();
        assert!(archive.ends_with("logs_42"));
        assert_eq!(LogStore::list_segments(&archive).unwrap().len(), 1);

        drop(store);
        let (_, recovered) = LogStore::open(dir.path(), 1 << 20).unwrap();
        assert_eq!(recovered, vec![entry(1, 2)]);
    }

    #[test]
    fn test_interrupted_rewrite_completes_on_open() {
        let dir = tempdir().unwrap();
        {
            let (mut store, _) = LogStore::open(dir.path(), 64).unwrap();
            for i in 1..=5 {
                store.append(&[entry(1, i)]).unwrap();
            }
            // staged, then stopped after removing only some old segments
            let staged = store.stage(&[entry(1, 3), entry(2, 4)], 5).unwrap();
            assert!(staged.ready.exists());
            let segments = LogStore::list_segments(dir.path()).unwrap();
            fs::remove_file(&segments[0]).unwrap();
        }

        let (_, recovered) = LogStore::open(dir.path(), 1 << 20).unwrap();
        assert_eq!(recovered, vec![entry(1, 3), entry(2, 4)]);
        assert_eq!(LogStore::list_segments(dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_partial_staging_file_is_discarded() {
        let dir = tempdir().unwrap();
        {
            let (mut store, _) = LogStore::open(dir.path(), 1 << 20).unwrap();
            store.append(&[entry(1, 1), entry(1, 2)]).unwrap();
        }
        let partial = dir.path().join("segment-00000000000000000001.log.tmp");
        fs::write(&partial, &LOG_MAGIC).unwrap();

        let (_, recovered) = LogStore::open(dir.path(), 1 << 20).unwrap();
        assert_eq!(recovered, vec![entry(1, 1), entry(1, 2)]);
        assert!(!partial.exists());
    }

    #[test]
    fn test_corrupted_tail_is_ignored() {
        let dir = tempdir().unwrap();
        {
            let (mut store, _) = LogStore::open(dir.path(), 1 << 20).unwrap();
            store.append(&[entry(1, 1)]).unwrap();
        }
        let segment = LogStore::list_segments(dir.path()).unwrap().remove(0);
        let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
        file.write_all(&LOG_MAGIC).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();

        let (_, recovered) = LogStore::open(dir.path(), 1 << 20).unwrap();
        assert_eq!(recovered, vec![entry(1, 1)]);
    }

    #[test]
    fn test_hard_state_roundtrip() {
        let dir = tempdir().unwrap();
        let (store, _) = LogStore::open(dir.path(), 1 << 20).unwrap();
        assert_eq!(store.load_hard_state().unwrap(), HardState::default());

        let state = HardState {
            current_term: 7,
            voted_for: Some("n2".into()),
        };
        store.save_hard_state(&state).unwrap();
        assert_eq!(store.load_hard_state().unwrap(), state);
    }
}
