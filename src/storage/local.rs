//! Transaction-local write overlay: every insert, update, and delete a
//! transaction makes is buffered here first and only merged into the
//! shared [`Table`](crate::storage::table::Table)s at commit.

use std::collections::HashMap;

use crate::storage::column::Value;
use crate::types::TableId;

#[derive(Default)]
struct TableOverlay {
    inserts: Vec<Vec<Value>>,
    updates: Vec<(usize, usize, Value)>,
    deletes: Vec<usize>,
}

/// Per-transaction buffer of uncommitted mutations, keyed by table.
///
/// Reads within the same transaction are expected to check the overlay
/// before falling through to the committed table (read-your-own-writes);
/// `LocalStorage` itself only tracks the writes, it doesn't resolve reads.
#[derive(Default)]
pub struct LocalStorage {
    tables: HashMap<TableId, TableOverlay>,
}

impl LocalStorage {
    /// Creates an empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` once at least one mutation has been buffered.
    pub fn is_empty(&self) -> bool {
        self.tables.values().all(|t| {
            t.inserts.is_empty() && t.updates.is_empty() && t.deletes.is_empty()
        })
    }

    /// Buffers an insert of `row` into `table`.
    pub fn record_insert(&mut self, table: TableId, row: Vec<Value>) {
        self.tables.entry(table).or_default().inserts.push(row);
    }

    /// Buffers an update of one column at `row_offset` in `table`.
    pub fn record_update(&mut self, table: TableId, row_offset: usize, column_index: usize, value: Value) {
        self.tables
            .entry(table)
            .or_default()
            .updates
            .push((row_offset, column_index, value));
    }

    /// Buffers a delete of `row_offset` in `table`.
    pub fn record_delete(&mut self, table: TableId, row_offset: usize) {
        self.tables.entry(table).or_default().deletes.push(row_offset);
    }

    /// Buffered inserts for `table`, in the order they were recorded.
    pub fn inserts_for(&self, table: TableId) -> impl Iterator<Item = &Vec<Value>> {
        self.tables.get(&table).into_iter().flat_map(|t| t.inserts.iter())
    }

    /// Buffered updates for `table`, in the order they were recorded.
    pub fn updates_for(&self, table: TableId) -> impl Iterator<Item = &(usize, usize, Value)> {
        self.tables.get(&table).into_iter().flat_map(|t| t.updates.iter())
    }

    /// Buffered deletes for `table`, in the order they were recorded.
    pub fn deletes_for(&self, table: TableId) -> impl Iterator<Item = &usize> {
        self.tables.get(&table).into_iter().flat_map(|t| t.deletes.iter())
    }

    /// Every table touched by this transaction, for commit-time iteration.
    pub fn touched_tables(&self) -> impl Iterator<Item = TableId> + '_ {
        self.tables.keys().copied()
    }

    /// Discards every buffered mutation (used on rollback).
    pub fn clear(&mut self) {
        self.tables.clear();
    }
}
