//! Commit-id allocation and the oldest-visible-snapshot watermark.
//!
//! Commit ids are handed out strictly increasing; a transaction reserves
//! one when it begins (so it can be used as the row timestamp on the
//! writes it makes) but the id only becomes visible to new readers once
//! [`CommitTable::mark_committed`] runs at commit time. A transaction that
//! rolls back calls [`CommitTable::release`] instead, so its reserved id
//! is simply skipped rather than ever becoming visible.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::types::CommitId;

/// Tracks outstanding commit-id reservations and the oldest one still
/// active, for use as a snapshot low-water-mark.
pub struct CommitTable {
    next: AtomicU64,
    active: Mutex<BTreeSet<CommitId>>,
}

impl Default for CommitTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitTable {
    /// Creates a fresh table; the first reserved id is `1` (`0` is
    /// reserved as [`crate::types::COMMIT_MAX`], meaning "visible
    /// forever").
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            active: Mutex::new(BTreeSet::new()),
        }
    }

    /// Reopens a table whose highest previously-assigned id was
    /// `last_commit_id` (read back from the WAL or metadata file).
    pub fn resume_after(last_commit_id: CommitId) -> Self {
        Self {
            next: AtomicU64::new(last_commit_id + 1),
            active: Mutex::new(BTreeSet::new()),
        }
    }

    /// Reserves and returns the next commit id, marking it active (not
    /// yet visible) until committed or released.
    pub fn reserve(&self) -> CommitId {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        self.active.lock().insert(id);
        id
    }

    /// Marks a reserved id as committed; it becomes visible to snapshots
    /// taken from this point on.
    pub fn mark_committed(&self, id: CommitId) {
        self.active.lock().remove(&id);
    }

    /// Releases a reserved id without ever making it visible (rollback).
    pub fn release(&self, id: CommitId) {
        self.active.lock().remove(&id);
    }

    /// The smallest commit id still reserved by an in-flight transaction,
    /// or the next id to be handed out if none are active. Anything
    /// older than this can be safely garbage-collected.
    pub fn oldest_visible(&self) -> CommitId {
        let active = self.active.lock();
        active
            .iter()
            .next()
            .copied()
            .unwrap_or_else(|| self.next.load(Ordering::SeqCst))
    }

    /// Highest id ever handed out, for persisting across a checkpoint.
    pub fn last_issued(&self) -> CommitId {
        self.next.load(Ordering::SeqCst).saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let table = CommitTable::new();
        let a = table.reserve();
        let b = table.reserve();
        assert!(b > a);
    }

    #[test]
    fn oldest_visible_tracks_active_reservations() {
        let table = CommitTable::new();
        let a = table.reserve();
        let b = table.reserve();
        assert_eq!(table.oldest_visible(), a);
        table.mark_committed(a);
        assert_eq!(table.oldest_visible(), b);
        table.mark_committed(b);
        assert_eq!(table.oldest_visible(), table.last_issued() + 1);
    }

    #[test]
    fn release_drops_reservation_without_exposing_it() {
        let table = CommitTable::new();
        let a = table.reserve();
        table.release(a);
        assert_eq!(table.oldest_visible(), table.last_issued() + 1);
    }

    #[test]
    fn resume_after_continues_numbering() {
        let table = CommitTable::resume_after(41);
        assert_eq!(table.reserve(), 42);
    }
}
