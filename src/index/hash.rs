//! Primary-key hash index: a page-resident, open-addressed hash table
//! mapping a table's primary-key values to row offsets.
//!
//! Each slot stores a 16-bit fingerprint of the key (not the full key) so
//! most negative probes resolve without touching the key itself. Fixed-width
//! keys (integers) are stored inline in the slot; string keys over the
//! inline threshold spill into an overflow chain addressed by
//! `(overflow_page, length)`. Slots are read and written through the
//! [`BufferManager`] like any other page.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;
use xxhash_rust::xxh64::xxh64;

use crate::error::{Result, StorageError};
use crate::io::{FileHandle, FileIo};
use crate::pager::{BufferManager, ReadPolicy};
use crate::types::PageId;

const HASH_SEED: u64 = 0x5354_5241_5441_4B44; // "STRATAKD"
const INLINE_KEY_LEN: usize = 15;
const SLOT_SIZE: usize = 1 /* flags */ + 2 /* fingerprint */ + 1 /* key tag */
    + INLINE_KEY_LEN /* inline key bytes / overflow len */
    + 8 /* overflow page or unused */
    + 8 /* row offset */;

const FLAG_OCCUPIED: u8 = 0x1;
const FLAG_TOMBSTONE: u8 = 0x2;

const KEY_TAG_INT64: u8 = 0;
const KEY_TAG_STRING_INLINE: u8 = 1;
const KEY_TAG_STRING_OVERFLOW: u8 = 2;

/// A primary-key value, either a fixed-width integer or a string (stored
/// inline up to [`INLINE_KEY_LEN`] bytes, spilled to the overflow area
/// beyond that).
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum IndexKey {
    /// A 64-bit integer key.
    Int64(i64),
    /// A UTF-8 string key.
    String(String),
}

impl IndexKey {
    fn hash_bytes(&self) -> Vec<u8> {
        match self {
            IndexKey::Int64(v) => v.to_le_bytes().to_vec(),
            IndexKey::String(s) => s.as_bytes().to_vec(),
        }
    }

    /// Deterministic 64-bit digest used both to choose a bucket and to
    /// derive the stored fingerprint — deterministic so a persisted index
    /// reopens to the same slot layout.
    fn digest(&self) -> u64 {
        xxh64(&self.hash_bytes(), HASH_SEED)
    }

    fn fingerprint(&self) -> u16 {
        (self.digest() >> 48) as u16
    }
}

/// Outcome of a bulk capacity reservation.
#[derive(Debug, Clone, Copy)]
pub struct ReserveStats {
    /// Total slot capacity after the reservation.
    pub slot_capacity: usize,
    /// Number of slot pages backing that capacity.
    pub page_count: usize,
}

struct Overflow<F: FileIo> {
    handle: FileHandle<F>,
    next_page: AtomicU64,
}

impl<F: FileIo> Overflow<F> {
    fn new(handle: FileHandle<F>) -> Result<Self> {
        let next_page = handle.page_count() as u64;
        Ok(Self {
            handle,
            next_page: AtomicU64::new(next_page),
        })
    }

    fn write(&self, bytes: &[u8]) -> Result<u64> {
        let page_size = self.handle.page_size() as usize;
        let page_index = self.next_page.fetch_add(1, Ordering::SeqCst);
        self.handle.grow_to(page_index as usize + 1)?;
        let mut buf = vec![0u8; page_size];
        let len = bytes.len().min(page_size - 4);
        buf[0..4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        buf[4..4 + len].copy_from_slice(&bytes[..len]);
        self.handle.write_page(page_index as usize, &buf)?;
        Ok(page_index)
    }

    fn read(&self, page_index: u64) -> Result<Vec<u8>> {
        let page_size = self.handle.page_size() as usize;
        let mut buf = vec![0u8; page_size];
        self.handle.read_page(page_index as usize, &mut buf)?;
        let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        Ok(buf[4..4 + len].to_vec())
    }
}

/// Page-resident open-addressed hash index from primary key to row offset.
///
/// Concurrency contract: many concurrent readers ([`lookup`](Self::lookup),
/// [`lookup_batch`](Self::lookup_batch)) may run alongside at most one
/// writer at a time, enforced by an internal `RwLock`.
pub struct HashIndex<F: FileIo = crate::io::StdFileIo> {
    buffer: BufferManager<F>,
    overflow: Overflow<F>,
    slots_per_page: usize,
    slot_capacity: RwLock<usize>,
    len: AtomicU64,
}

impl<F: FileIo> HashIndex<F> {
    /// Opens an index over `slot_file`/`overflow_file`, creating an empty
    /// index if both are new.
    pub fn open(
        slot_file: F,
        overflow_file: F,
        page_size: usize,
        buffer_capacity: usize,
    ) -> Result<Self> {
        let handle = Arc::new(FileHandle::new(slot_file, page_size as u32)?);
        let slots_per_page = page_size / SLOT_SIZE;
        if slots_per_page == 0 {
            return Err(StorageError::ConfigError(
                "page size too small for a single hash index slot".into(),
            ));
        }
        let slot_capacity = handle.page_count() * slots_per_page;
        let buffer = BufferManager::new(handle, None, buffer_capacity, page_size)?;
        let overflow_handle = FileHandle::new(overflow_file, page_size as u32)?;
        Ok(Self {
            buffer,
            overflow: Overflow::new(overflow_handle)?,
            slots_per_page,
            slot_capacity: RwLock::new(slot_capacity),
            len: AtomicU64::new(0),
        })
    }

    /// Number of live (non-tombstoned) entries.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Relaxed)
    }

    /// `true` when the index holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows slot capacity to at least `min_slots`, used before a bulk load
    /// so the table never needs to rehash mid-build.
    pub fn bulk_reserve(&self, min_slots: usize) -> Result<ReserveStats> {
        let mut capacity = self.slot_capacity.write();
        if min_slots <= *capacity {
            let page_count = capacity.div_ceil(self.slots_per_page);
            return Ok(ReserveStats {
                slot_capacity: *capacity,
                page_count,
            });
        }
        // Keep the load factor under ~70% to bound probe-sequence length.
        let target = (min_slots * 10).div_ceil(7);
        let page_count = target.div_ceil(self.slots_per_page);
        let new_capacity = page_count * self.slots_per_page;
        self.buffer_file_grow(page_count)?;
        *capacity = new_capacity;
        Ok(ReserveStats {
            slot_capacity: new_capacity,
            page_count,
        })
    }

    fn buffer_file_grow(&self, page_count: usize) -> Result<()> {
        self.buffer.ensure_file_capacity(page_count)?;
        // Slots on newly added pages read back as all-zero (unoccupied)
        // the first time they're pinned, since the file itself was
        // zero-extended by `grow_to`.
        Ok(())
    }

    fn bucket_for(&self, key: &IndexKey, capacity: usize) -> usize {
        (key.digest() as usize) % capacity
    }

    fn slot_location(&self, slot_index: usize) -> (PageId, usize) {
        let page = slot_index / self.slots_per_page;
        let offset_in_page = (slot_index % self.slots_per_page) * SLOT_SIZE;
        (PageId(page as u64), offset_in_page)
    }

    fn encode_key(&self, key: &IndexKey, slot: &mut [u8]) -> Result<()> {
        match key {
            IndexKey::Int64(v) => {
                slot[0] = KEY_TAG_INT64;
                slot[1..9].copy_from_slice(&v.to_le_bytes());
            }
            IndexKey::String(s) => {
                let bytes = s.as_bytes();
                if bytes.len() <= INLINE_KEY_LEN {
                    slot[0] = KEY_TAG_STRING_INLINE;
                    slot[1] = bytes.len() as u8;
                    slot[2..2 + bytes.len()].copy_from_slice(bytes);
                } else {
                    let page = self.overflow.write(bytes)?;
                    slot[0] = KEY_TAG_STRING_OVERFLOW;
                    slot[1..9].copy_from_slice(&page.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    fn decode_key(&self, slot: &[u8]) -> Result<IndexKey> {
        match slot[0] {
            KEY_TAG_INT64 => Ok(IndexKey::Int64(i64::from_le_bytes(
                slot[1..9].try_into().unwrap(),
            ))),
            KEY_TAG_STRING_INLINE => {
                let len = slot[1] as usize;
                let s = String::from_utf8(slot[2..2 + len].to_vec())
                    .map_err(|_| StorageError::CorruptionError("non-utf8 inline key".into()))?;
                Ok(IndexKey::String(s))
            }
            KEY_TAG_STRING_OVERFLOW => {
                let page = u64::from_le_bytes(slot[1..9].try_into().unwrap());
                let bytes = self.overflow.read(page)?;
                let s = String::from_utf8(bytes)
                    .map_err(|_| StorageError::CorruptionError("non-utf8 overflow key".into()))?;
                Ok(IndexKey::String(s))
            }
            other => Err(StorageError::CorruptionError(format!(
                "unknown key tag {other}"
            ))),
        }
    }

    /// Inserts `key -> row_offset`. Fails with `DuplicateKey` if `key`
    /// already has a live entry.
    pub fn append(&self, key: IndexKey, row_offset: u64) -> Result<()> {
        let capacity = *self.slot_capacity.read();
        if capacity == 0 {
            return Err(StorageError::CapacityError(
                "hash index has no reserved capacity".into(),
            ));
        }
        let fingerprint = key.fingerprint();
        let start = self.bucket_for(&key, capacity);
        let mut first_tombstone: Option<usize> = None;

        for probe in 0..capacity {
            let slot_index = (start + probe) % capacity;
            let (page_id, offset) = self.slot_location(slot_index);
            let mut page = self
                .buffer
                .pin_write(page_id, ReadPolicy::ReadFromFile)?;
            let slot = &mut page.data_mut()[offset..offset + SLOT_SIZE];
            let flags = slot[0];

            if flags & FLAG_OCCUPIED == 0 {
                let insert_at = first_tombstone.unwrap_or(slot_index);
                drop(page);
                return self.write_new_entry(insert_at, fingerprint, &key, row_offset);
            }
            if flags & FLAG_TOMBSTONE != 0 {
                if first_tombstone.is_none() {
                    first_tombstone = Some(slot_index);
                }
                continue;
            }
            let stored_fp = u16::from_le_bytes(slot[1..3].try_into().unwrap());
            if stored_fp == fingerprint {
                let existing_key = self.decode_key(&slot[3..])?;
                if existing_key == key {
                    return Err(StorageError::DuplicateKey);
                }
            }
        }
        Err(StorageError::CapacityError(
            "hash index is full; call bulk_reserve before inserting".into(),
        ))
    }

    fn write_new_entry(
        &self,
        slot_index: usize,
        fingerprint: u16,
        key: &IndexKey,
        row_offset: u64,
    ) -> Result<()> {
        let (page_id, offset) = self.slot_location(slot_index);
        let mut page = self.buffer.pin_write(page_id, ReadPolicy::ReadFromFile)?;
        let slot = &mut page.data_mut()[offset..offset + SLOT_SIZE];
        slot.iter_mut().for_each(|b| *b = 0);
        slot[0] = FLAG_OCCUPIED;
        slot[1..3].copy_from_slice(&fingerprint.to_le_bytes());
        self.encode_key(key, &mut slot[3..])?;
        slot[SLOT_SIZE - 8..].copy_from_slice(&row_offset.to_le_bytes());
        self.len.fetch_add(1, Ordering::Relaxed);
        trace!(slot_index, "hash_index.insert");
        Ok(())
    }

    /// Looks up `key`, returning its row offset if a live entry exists.
    pub fn lookup(&self, key: &IndexKey) -> Result<Option<u64>> {
        let capacity = *self.slot_capacity.read();
        if capacity == 0 {
            return Ok(None);
        }
        let fingerprint = key.fingerprint();
        let start = self.bucket_for(key, capacity);

        for probe in 0..capacity {
            let slot_index = (start + probe) % capacity;
            let (page_id, offset) = self.slot_location(slot_index);
            let page = self.buffer.pin_read(page_id, ReadPolicy::ReadFromFile)?;
            let slot = &page.data()[offset..offset + SLOT_SIZE];
            let flags = slot[0];
            if flags & FLAG_OCCUPIED == 0 {
                return Ok(None);
            }
            if flags & FLAG_TOMBSTONE != 0 {
                continue;
            }
            let stored_fp = u16::from_le_bytes(slot[1..3].try_into().unwrap());
            if stored_fp == fingerprint {
                let existing_key = self.decode_key(&slot[3..])?;
                if &existing_key == key {
                    let row_offset = u64::from_le_bytes(slot[SLOT_SIZE - 8..].try_into().unwrap());
                    return Ok(Some(row_offset));
                }
            }
        }
        Ok(None)
    }

    /// Looks up many keys at once, preserving input order.
    pub fn lookup_batch(&self, keys: &[IndexKey]) -> Result<Vec<Option<u64>>> {
        keys.iter().map(|k| self.lookup(k)).collect()
    }

    /// Marks `key`'s entry as a tombstone (lazy delete); the slot is
    /// reclaimed the next time a probe sequence passes through it during
    /// an insert.
    pub fn delete(&self, key: &IndexKey) -> Result<bool> {
        let capacity = *self.slot_capacity.read();
        if capacity == 0 {
            return Ok(false);
        }
        let fingerprint = key.fingerprint();
        let start = self.bucket_for(key, capacity);

        for probe in 0..capacity {
            let slot_index = (start + probe) % capacity;
            let (page_id, offset) = self.slot_location(slot_index);
            let mut page = self.buffer.pin_write(page_id, ReadPolicy::ReadFromFile)?;
            let slot = &mut page.data_mut()[offset..offset + SLOT_SIZE];
            let flags = slot[0];
            if flags & FLAG_OCCUPIED == 0 {
                return Ok(false);
            }
            if flags & FLAG_TOMBSTONE != 0 {
                continue;
            }
            let stored_fp = u16::from_le_bytes(slot[1..3].try_into().unwrap());
            if stored_fp == fingerprint {
                let existing_key = self.decode_key(&slot[3..])?;
                if &existing_key == key {
                    slot[0] |= FLAG_TOMBSTONE;
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Flushes all dirty slot pages to disk.
    pub fn flush(&self) -> Result<()> {
        self.buffer.flush_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::StdFileIo;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn open_index(dir: &std::path::Path) -> HashIndex<StdFileIo> {
        let slots = StdFileIo::open(dir.join("pk.idx")).unwrap();
        let overflow = StdFileIo::open(dir.join("pk.ovf")).unwrap();
        let index = HashIndex::open(slots, overflow, 4096, 8).unwrap();
        index.bulk_reserve(64).unwrap();
        index
    }

    #[test]
    fn insert_then_lookup_int_key() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path());
        index.append(IndexKey::Int64(42), 100).unwrap();
        assert_eq!(index.lookup(&IndexKey::Int64(42)).unwrap(), Some(100));
        assert_eq!(index.lookup(&IndexKey::Int64(43)).unwrap(), None);
    }

    #[test]
    fn duplicate_key_rejected() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path());
        index.append(IndexKey::Int64(1), 1).unwrap();
        let err = index.append(IndexKey::Int64(1), 2).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey));
    }

    #[test]
    fn string_key_round_trips_including_overflow() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path());
        let short = IndexKey::String("abc".into());
        let long = IndexKey::String("x".repeat(500));
        index.append(short.clone(), 1).unwrap();
        index.append(long.clone(), 2).unwrap();
        assert_eq!(index.lookup(&short).unwrap(), Some(1));
        assert_eq!(index.lookup(&long).unwrap(), Some(2));
    }

    #[test]
    fn delete_then_reinsert() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path());
        index.append(IndexKey::Int64(7), 7).unwrap();
        assert!(index.delete(&IndexKey::Int64(7)).unwrap());
        assert_eq!(index.lookup(&IndexKey::Int64(7)).unwrap(), None);
        index.append(IndexKey::Int64(7), 77).unwrap();
        assert_eq!(index.lookup(&IndexKey::Int64(7)).unwrap(), Some(77));
    }

    #[test]
    fn lookup_batch_preserves_order() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path());
        for i in 0..5 {
            index.append(IndexKey::Int64(i), i as u64 * 10).unwrap();
        }
        let keys: Vec<_> = (0..6).map(IndexKey::Int64).collect();
        let results = index.lookup_batch(&keys).unwrap();
        assert_eq!(
            results,
            vec![
                Some(0),
                Some(10),
                Some(20),
                Some(30),
                Some(40),
                None
            ]
        );
    }

    proptest! {
        #[test]
        fn proptest_distinct_int_keys_round_trip(
            keys in proptest::collection::hash_set(-500i64..500, 1..64),
            missing in -10_000i64..-1_000,
        ) {
            let dir = tempdir().unwrap();
            let index = open_index(dir.path());
            for (offset, key) in keys.iter().enumerate() {
                index.append(IndexKey::Int64(*key), offset as u64).unwrap();
            }
            for (offset, key) in keys.iter().enumerate() {
                prop_assert_eq!(index.lookup(&IndexKey::Int64(*key)).unwrap(), Some(offset as u64));
            }
            if !keys.contains(&missing) {
                prop_assert_eq!(index.lookup(&IndexKey::Int64(missing)).unwrap(), None);
            }
        }
    }
}
