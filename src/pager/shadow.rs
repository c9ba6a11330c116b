//! Copy-on-write page overlay used while a checkpoint is in flight.
//!
//! Before a dirty page is written to `data.kz` during a checkpoint, its
//! pre-checkpoint image is copied into the shadow file. If the process
//! crashes mid-checkpoint, recovery replays the shadow file back over
//! `data.kz` so the database never observes a half-written checkpoint.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::Result;
use crate::io::FileIo;
use crate::types::PageId;

/// On-disk shadow file: a header giving the page count, followed by
/// `(page_id)` entries, followed by the full page payloads, in that order.
pub struct ShadowFile<F: FileIo> {
    file: Arc<F>,
    entries: RwLock<HashMap<PageId, u32>>,
}

const HEADER_LEN: usize = 4;
const ENTRY_LEN: usize = 8;

impl<F: FileIo> ShadowFile<F> {
    /// Opens (or creates) a shadow file, replaying its header if it already
    /// holds entries from a previous, uncheckpointed run.
    pub fn open(file: F) -> Result<Self> {
        let file = Arc::new(file);
        let entries = if file.is_empty()? {
            HashMap::new()
        } else {
            Self::read_header(&file)?
        };
        Ok(Self {
            file,
            entries: RwLock::new(entries),
        })
    }

    fn read_header(file: &F) -> Result<HashMap<PageId, u32>> {
        let mut count_buf = [0u8; HEADER_LEN];
        file.read_at(0, &mut count_buf)?;
        let count = u32::from_le_bytes(count_buf) as usize;
        let mut entries = HashMap::with_capacity(count);
        let mut buf = [0u8; ENTRY_LEN];
        for i in 0..count {
            file.read_at((HEADER_LEN + i * ENTRY_LEN) as u64, &mut buf)?;
            let page_id = PageId(u64::from_le_bytes(buf));
            entries.insert(page_id, i as u32);
        }
        Ok(entries)
    }

    fn pages_offset(&self, entry_count: usize) -> u64 {
        (HEADER_LEN + entry_count * ENTRY_LEN) as u64
    }

    /// Records `image` (the page's bytes *before* this checkpoint's writes)
    /// as the shadow copy for `page_id`, unless one was already recorded
    /// this checkpoint.
    pub fn shadow_page(&self, page_id: PageId, page_size: usize, image: &[u8]) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(&page_id) {
            return Ok(());
        }
        let slot = entries.len() as u32;
        let entry_count = entries.len() + 1;
        self.file
            .write_at(HEADER_LEN as u64, &(entry_count as u32).to_le_bytes())?;
        self.file.write_at(
            (HEADER_LEN + slot as usize * ENTRY_LEN) as u64,
            &page_id.0.to_le_bytes(),
        )?;
        let pages_off = self.pages_offset(entry_count);
        self.file
            .write_at(pages_off + slot as u64 * page_size as u64, image)?;
        entries.insert(page_id, slot);
        debug!(page_id = page_id.0, "shadow_file.record");
        Ok(())
    }

    /// Reads `page_id`'s shadow copy into `dst` if one exists, returning
    /// whether it was found.
    pub fn read_if_present(&self, page_id: PageId, dst: &mut [u8]) -> Result<bool> {
        let entries = self.entries.read();
        let Some(&slot) = entries.get(&page_id) else {
            return Ok(false);
        };
        let pages_off = self.pages_offset(entries.len());
        self.file
            .read_at(pages_off + slot as u64 * dst.len() as u64, dst)?;
        Ok(true)
    }

    /// Number of pages currently shadowed.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// `true` when no pages are shadowed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears the overlay and truncates the shadow file, called once a
    /// checkpoint has durably applied all shadowed pages to `data.kz`.
    pub fn clear(&self) -> Result<()> {
        let mut entries = self.entries.write();
        entries.clear();
        self.file.truncate(0)?;
        self.file.write_at(0, &0u32.to_le_bytes())?;
        info!("shadow_file.clear");
        Ok(())
    }

    /// Iterates `(page_id, slot)` pairs so a checkpoint can replay shadowed
    /// pages back over the data file on crash recovery.
    pub fn iter_entries(&self) -> Vec<(PageId, u32)> {
        self.entries.read().iter().map(|(k, v)| (*k, *v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::StdFileIo;
    use tempfile::tempdir;

    #[test]
    fn shadow_round_trips_and_clears() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("shadow.kz")).unwrap();
        let shadow = ShadowFile::open(io).unwrap();
        let page_size = 64;
        let image = vec![9u8; page_size];
        shadow.shadow_page(PageId(5), page_size, &image).unwrap();
        assert_eq!(shadow.len(), 1);

        let mut out = vec![0u8; page_size];
        assert!(shadow.read_if_present(PageId(5), &mut out).unwrap());
        assert_eq!(out, image);
        assert!(!shadow.read_if_present(PageId(6), &mut out).unwrap());

        shadow.clear().unwrap();
        assert!(shadow.is_empty());
    }

    #[test]
    fn reopen_sees_previous_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shadow.kz");
        let page_size = 32;
        {
            let io = StdFileIo::open(&path).unwrap();
            let shadow = ShadowFile::open(io).unwrap();
            shadow
                .shadow_page(PageId(1), page_size, &vec![1u8; page_size])
                .unwrap();
        }
        let io = StdFileIo::open(&path).unwrap();
        let shadow = ShadowFile::open(io).unwrap();
        assert_eq!(shadow.len(), 1);
    }
}
