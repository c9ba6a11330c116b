//! Write-ahead log: an append-only, length-prefixed, checksummed record of
//! every change made inside a transaction, replayed on recovery and
//! truncated once a checkpoint has made it redundant.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{info, trace, warn};

use crate::error::{Result, StorageError};
use crate::io::FileIo;
use crate::types::{Checksum, Crc32Fast, Lsn, TxnId};

const WAL_MAGIC: &[u8; 8] = b"STRATWAL";
const WAL_VERSION: u32 = 1;
const HEADER_LEN: u64 = 16;
const FRAME_HEADER_LEN: usize = 4 + 4 + 8 + 1; // len + checksum + txn_id + kind

/// The kind of change a WAL record carries, the closed set §6 of the
/// specification enumerates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum WalRecordKind {
    /// A new table was added to the catalog.
    CatalogCreate = 0,
    /// A table was removed from the catalog.
    CatalogDrop = 1,
    /// A table's schema was altered in place.
    CatalogAlter = 2,
    /// One or more rows were inserted into a table.
    TableInsert = 3,
    /// One or more rows were updated in a table.
    TableUpdate = 4,
    /// One or more rows were deleted from a table.
    TableDelete = 5,
    /// A bulk copy populated a table from an external source.
    CopyTable = 6,
    /// An auto-increment sequence's next value advanced.
    UpdateSequence = 7,
    /// Marks the point a checkpoint completed; purely informational on
    /// replay (a checkpoint truncates the log, so this is mostly seen by
    /// tooling that inspects the log file directly).
    Checkpoint = 8,
    /// Not a user record: marks the transaction named by `txn_id` as
    /// committed. Frames for a `txn_id` with no eventual `Commit` are
    /// discarded on replay.
    Commit = 255,
}

impl WalRecordKind {
    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Self::CatalogCreate,
            1 => Self::CatalogDrop,
            2 => Self::CatalogAlter,
            3 => Self::TableInsert,
            4 => Self::TableUpdate,
            5 => Self::TableDelete,
            6 => Self::CopyTable,
            7 => Self::UpdateSequence,
            8 => Self::Checkpoint,
            255 => Self::Commit,
            other => {
                return Err(StorageError::CorruptionError(format!(
                    "unknown wal record kind {other}"
                )))
            }
        })
    }
}

/// One decoded WAL record, handed to the replay callback.
#[derive(Clone, Debug)]
pub struct WalRecord {
    /// The kind of change this record represents.
    pub kind: WalRecordKind,
    /// The transaction that produced this record.
    pub txn_id: TxnId,
    /// Record-kind-specific payload bytes.
    pub payload: Vec<u8>,
}

/// Append-only write-ahead log file.
pub struct Wal<F: FileIo> {
    file: F,
    next_lsn: AtomicU64,
}

impl<F: FileIo> Wal<F> {
    /// Opens (or initializes) the WAL, writing a fresh header if the file
    /// is empty and validating it otherwise.
    pub fn open(file: F) -> Result<Self> {
        if file.is_empty()? {
            Self::write_header(&file)?;
            return Ok(Self {
                file,
                next_lsn: AtomicU64::new(1),
            });
        }
        let next_lsn = Self::validate_header_and_scan(&file)?;
        Ok(Self {
            file,
            next_lsn: AtomicU64::new(next_lsn),
        })
    }

    fn write_header(file: &F) -> Result<()> {
        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(WAL_MAGIC);
        header.extend_from_slice(&WAL_VERSION.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes()); // reserved
        file.write_at(0, &header)?;
        file.sync_all()
    }

    fn validate_header_and_scan(file: &F) -> Result<u64> {
        let mut header = [0u8; HEADER_LEN as usize];
        file.read_at(0, &mut header)?;
        if &header[0..8] != WAL_MAGIC {
            return Err(StorageError::CorruptionError("bad wal magic".into()));
        }
        let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
        if version != WAL_VERSION {
            return Err(StorageError::CorruptionError(format!(
                "unsupported wal version {version}"
            )));
        }
        let len = file.len()?;
        let mut offset = HEADER_LEN;
        let mut lsn = 1u64;
        while offset < len {
            let mut len_buf = [0u8; 4];
            if file.read_at(offset, &mut len_buf).is_err() {
                break;
            }
            let payload_len = u32::from_le_bytes(len_buf) as u64;
            let frame_len = FRAME_HEADER_LEN as u64 + payload_len;
            if offset + frame_len > len {
                // Torn trailing write from a crash mid-append; stop here.
                break;
            }
            offset += frame_len;
            lsn += 1;
        }
        Ok(lsn)
    }

    /// Appends a user record to the log, returning its assigned LSN.
    pub fn append(&self, record: &WalRecord) -> Result<Lsn> {
        self.append_frame(record.kind, record.txn_id, &record.payload)
    }

    /// Appends the commit marker for `txn_id`.
    pub fn append_commit(&self, txn_id: TxnId) -> Result<Lsn> {
        self.append_frame(WalRecordKind::Commit, txn_id, &[])
    }

    fn append_frame(&self, kind: WalRecordKind, txn_id: TxnId, payload: &[u8]) -> Result<Lsn> {
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let offset = self.file.len()?;
        let mut checksum = Crc32Fast::default();
        checksum.update(&txn_id.0.to_le_bytes());
        checksum.update(&[kind as u8]);
        checksum.update(payload);
        let crc = checksum.finalize();

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&txn_id.0.to_le_bytes());
        frame.push(kind as u8);
        frame.extend_from_slice(payload);

        self.file.write_at(offset, &frame)?;
        trace!(?kind, txn_id = txn_id.0, lsn, "wal.append");
        Ok(Lsn(lsn))
    }

    /// Flushes the log to stable storage; callers call this before
    /// acknowledging a commit.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()
    }

    /// Truncates the log back to just its header, called after a
    /// checkpoint has durably applied every record.
    pub fn reset(&self) -> Result<()> {
        self.file.truncate(HEADER_LEN)?;
        self.next_lsn.store(1, Ordering::SeqCst);
        info!("wal.reset");
        Ok(())
    }

    /// Current size of the log file, in bytes.
    pub fn size(&self) -> Result<u64> {
        self.file.len()
    }

    /// Replays every committed transaction's records, in commit order,
    /// into `apply`. Records belonging to a transaction that never reaches
    /// a `Commit` frame (the log ends, or the process crashed, before one
    /// was written) are discarded — this is what makes replay resilient to
    /// a crash mid-transaction.
    pub fn replay(&self, mut apply: impl FnMut(&WalRecord) -> Result<()>) -> Result<usize> {
        use std::collections::HashMap;

        let len = self.file.len()?;
        let mut offset = HEADER_LEN;
        let mut pending: HashMap<u64, Vec<WalRecord>> = HashMap::new();
        let mut applied = 0usize;

        while offset < len {
            let mut len_buf = [0u8; 4];
            if self.file.read_at(offset, &mut len_buf).is_err() {
                break;
            }
            let payload_len = u32::from_le_bytes(len_buf) as usize;
            let frame_len = FRAME_HEADER_LEN + payload_len;
            if offset + frame_len as u64 > len {
                warn!(offset, "wal.replay.torn_frame");
                break;
            }
            let mut frame = vec![0u8; frame_len];
            self.file.read_at(offset, &mut frame)?;
            offset += frame_len as u64;

            let stored_checksum = u32::from_le_bytes(frame[4..8].try_into().unwrap());
            let txn_id = u64::from_le_bytes(frame[8..16].try_into().unwrap());
            let kind = WalRecordKind::from_tag(frame[16])?;
            let payload = frame[FRAME_HEADER_LEN..].to_vec();

            let mut check = Crc32Fast::default();
            check.update(&txn_id.to_le_bytes());
            check.update(&[kind as u8]);
            check.update(&payload);
            if check.finalize() != stored_checksum {
                return Err(StorageError::CorruptionError(format!(
                    "wal frame checksum mismatch at offset {offset}"
                )));
            }

            if kind == WalRecordKind::Commit {
                if let Some(records) = pending.remove(&txn_id) {
                    for record in &records {
                        apply(record)?;
                        applied += 1;
                    }
                }
                continue;
            }
            pending.entry(txn_id).or_default().push(WalRecord {
                kind,
                txn_id: TxnId(txn_id),
                payload,
            });
        }
        if !pending.is_empty() {
            warn!(
                discarded_txns = pending.len(),
                "wal.replay.discarded_uncommitted"
            );
        }
        Ok(applied)
    }
}

/// Reads the entire file into memory; used only by tests and the CLI's
/// `inspect` subcommand, never on the hot path.
pub fn dump_raw(mut file: impl Read) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::StdFileIo;
    use tempfile::tempdir;

    fn record(kind: WalRecordKind, txn: u64, payload: &[u8]) -> WalRecord {
        WalRecord {
            kind,
            txn_id: TxnId(txn),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn replay_applies_only_committed_transactions() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("wal.kz")).unwrap();
        let wal = Wal::open(io).unwrap();

        wal.append(&record(WalRecordKind::TableInsert, 1, b"a")).unwrap();
        wal.append(&record(WalRecordKind::TableInsert, 1, b"b")).unwrap();
        wal.append_commit(TxnId(1)).unwrap();

        wal.append(&record(WalRecordKind::TableInsert, 2, b"never committed"))
            .unwrap();

        let mut applied = Vec::new();
        let count = wal
            .replay(|rec| {
                applied.push(rec.payload.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(applied, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn reset_truncates_back_to_header() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("wal.kz")).unwrap();
        let wal = Wal::open(io).unwrap();
        wal.append(&record(WalRecordKind::TableInsert, 1, b"x")).unwrap();
        wal.append_commit(TxnId(1)).unwrap();
        assert!(wal.size().unwrap() > HEADER_LEN);
        wal.reset().unwrap();
        assert_eq!(wal.size().unwrap(), HEADER_LEN);
    }

    #[test]
    fn corrupted_frame_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.kz");
        {
            let io = StdFileIo::open(&path).unwrap();
            let wal = Wal::open(io).unwrap();
            wal.append(&record(WalRecordKind::TableInsert, 1, b"x")).unwrap();
            wal.append_commit(TxnId(1)).unwrap();
        }
        // Flip a byte in the payload region without touching the checksum.
        let io = StdFileIo::open(&path).unwrap();
        let mut byte = [0u8; 1];
        io.read_at(HEADER_LEN + FRAME_HEADER_LEN as u64, &mut byte).unwrap();
        byte[0] ^= 0xff;
        io.write_at(HEADER_LEN + FRAME_HEADER_LEN as u64, &byte).unwrap();

        let wal = Wal::open(io).unwrap();
        let err = wal.replay(|_| Ok(())).unwrap_err();
        matches!(err, StorageError::CorruptionError(_));
    }
}
