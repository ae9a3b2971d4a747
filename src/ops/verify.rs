//! Verify persisted snapshot artifacts

use crate::ops::snapshot::{check_payload_len, read_header, snapshot_files};
use crate::{Error, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Payload bytes read per artifact during verification
const VERIFY_READ_LIMIT: u64 = 4096;

/// Open every snapshot in `dir` and read its header plus the start of its
/// payload. The first unreadable artifact is reported as `CorruptSnapshot`.
/// Returns the number of artifacts checked.
pub fn verify_snapshot_integrity(dir: &Path) -> Result<usize> {
    let snapshots = snapshot_files(dir)?;
    for snapshot in &snapshots {
        if let Err(e) = check_artifact(&dir.join(&snapshot.filename)) {
            tracing::error!(snapshot = %snapshot.filename, error = %e, "Snapshot failed verification");
            return Err(Error::CorruptSnapshot {
                filename: snapshot.filename.clone(),
            });
        }
    }

    tracing::info!(count = snapshots.len(), "Snapshot verification complete");
    Ok(snapshots.len())
}

fn check_artifact(path: &Path) -> std::io::Result<()> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let header = read_header(&mut reader)?;
    check_payload_len(&header, file_len)?;

    let want = header.payload_len.min(VERIFY_READ_LIMIT) as usize;
    let mut buf = vec![0u8; want];
    reader.read_exact(&mut buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_artifact(dir: &Path, name: &str, payload: &[u8], declared_len: u64) {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(crate::ops::snapshot::SNAPSHOT_MAGIC);
        bytes.extend_from_slice(&3u64.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(blake3::hash(payload).as_bytes());
        bytes.extend_from_slice(&declared_len.to_le_bytes());
        bytes.extend_from_slice(payload);
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    #[test]
    fn test_verify_accepts_intact_snapshots() {
        let dir = tempdir().unwrap();
        write_artifact(dir.path(), "3_1000.snap", b"state", 5);
        write_artifact(dir.path(), "4_2000.snap", &[7u8; 10_000], 10_000);
        // unrelated files are ignored
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        assert_eq!(verify_snapshot_integrity(dir.path()).unwrap(), 2);
    }

    #[test]
    fn test_verify_reports_truncated_snapshot() {
        let dir = tempdir().unwrap();
        write_artifact(dir.path(), "3_1000.snap", b"state", 5);
        write_artifact(dir.path(), "5_3000.snap", b"shrt", 100);

        let err = verify_snapshot_integrity(dir.path()).unwrap_err();
        assert!(matches!(err, Error::CorruptSnapshot { filename } if filename == "5_3000.snap"));
    }

    #[test]
    fn test_verify_reports_declared_length_past_eof() {
        let dir = tempdir().unwrap();
        write_artifact(dir.path(), "6_4000.snap", b"state", u64::MAX);

        let err = verify_snapshot_integrity(dir.path()).unwrap_err();
        assert!(matches!(err, Error::CorruptSnapshot { filename } if filename == "6_4000.snap"));
    }

    #[test]
    fn test_verify_reports_bad_magic() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("1_1000.snap"), vec![0u8; 128]).unwrap();

        let err = verify_snapshot_integrity(dir.path()).unwrap_err();
        assert!(matches!(err, Error::CorruptSnapshot { .. }));
    }

    #[test]
    fn test_verify_empty_dir() {
        let dir = tempdir().unwrap();
        assert_eq!(verify_snapshot_integrity(dir.path()).unwrap(), 0);
    }
}
