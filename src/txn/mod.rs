//! Transaction orchestration: begin/commit/rollback, WAL durability, and
//! checkpoint coordination across the tables a [`TransactionManager`] owns.

pub mod commit_table;

pub use commit_table::CommitTable;

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::index::HashIndex;
use crate::io::FileIo;
use crate::pager::{BufferManager, ShadowFile, Wal, WalRecord, WalRecordKind};
use crate::storage::{Catalog, LocalStorage, PropertyDef, Table, TableSchema, Value};
use crate::types::{CommitId, RelMultiplicity, TableId, TableKind, TxnId};

/// Lifecycle state of a [`Transaction`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnState {
    /// Accepting reads and writes.
    Active,
    /// Committed; durable and visible.
    Committed,
    /// Rolled back; none of its writes are visible.
    RolledBack,
}

/// Report produced by [`TransactionManager::checkpoint`].
#[derive(Clone, Debug, serde::Serialize)]
pub struct CheckpointReport {
    /// Wall-clock duration of the checkpoint, in milliseconds.
    pub duration_ms: f64,
    /// Number of pages moved from the shadow file into the main file.
    pub pages_applied: usize,
    /// WAL size, in bytes, after truncation.
    pub wal_size_after: u64,
}

/// Depth of a [`TransactionManager::verify`] pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Checks catalog/table bookkeeping only; does not scan rows.
    Fast,
    /// Scans every live row in every table, checking primary-key index
    /// consistency.
    Full,
}

/// Report produced by [`TransactionManager::verify`].
#[derive(Clone, Debug, serde::Serialize)]
pub struct VerifyReport {
    /// The verification level that was performed.
    pub level: VerifyLevel,
    /// Whether verification found no issues.
    pub success: bool,
    /// Number of tables examined.
    pub tables_checked: usize,
    /// Total live rows counted across every table (0 at `Fast` level).
    pub live_rows: usize,
    /// Total tombstoned rows counted across every table (0 at `Fast` level).
    pub tombstoned_rows: usize,
    /// Human-readable descriptions of any problems found.
    pub errors: Vec<String>,
}

struct ManagerState<F: FileIo> {
    tables: HashMap<TableId, Table<F>>,
    catalog: Catalog,
}

/// A single table's catalog entry plus every row it held, captured at
/// checkpoint time so `Database::open` can rebuild a table without
/// replaying its full history from the beginning of the WAL.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TableSnapshot {
    /// The table's catalog entry as of the checkpoint.
    pub schema: TableSchema,
    /// Every row, in offset order; `None` marks a tombstoned offset.
    pub rows: Vec<Option<Vec<Value>>>,
}

/// Owns every table plus the WAL/shadow-file machinery needed to make
/// transactions durable, and serializes checkpoints against active
/// writers.
pub struct TransactionManager<F: FileIo> {
    state: RwLock<ManagerState<F>>,
    wal: Mutex<Wal<F>>,
    shadow: Option<std::sync::Arc<ShadowFile<F>>>,
    buffer: Option<BufferManager<F>>,
    commits: CommitTable,
    config: Config,
    checkpoint_lock: Mutex<()>,
    /// Held as a read guard for the instant a transaction starts and as
    /// a write guard for the duration of a checkpoint, so `checkpoint`'s
    /// "stop accepting new write transactions" step is a real exclusion
    /// rather than a best-effort counter check.
    quiescence: RwLock<()>,
    writers_active: std::sync::atomic::AtomicU64,
    metadata_sink: Box<dyn Fn(&[u8]) -> Result<()> + Send + Sync>,
}

impl<F: FileIo> TransactionManager<F> {
    /// Wires together an already-open WAL and table set under a fresh
    /// commit table. `metadata_sink` persists a serialized
    /// `Vec<TableSnapshot>` to the catalog/row snapshot file at each
    /// checkpoint.
    pub fn new(
        wal: Wal<F>,
        shadow: Option<std::sync::Arc<ShadowFile<F>>>,
        buffer: Option<BufferManager<F>>,
        catalog: Catalog,
        tables: HashMap<TableId, Table<F>>,
        config: Config,
        metadata_sink: Box<dyn Fn(&[u8]) -> Result<()> + Send + Sync>,
    ) -> Self {
        Self {
            state: RwLock::new(ManagerState { tables, catalog }),
            wal: Mutex::new(wal),
            shadow,
            buffer,
            commits: CommitTable::new(),
            config,
            checkpoint_lock: Mutex::new(()),
            quiescence: RwLock::new(()),
            writers_active: std::sync::atomic::AtomicU64::new(0),
            metadata_sink,
        }
    }

    /// Begins a new transaction, reserving its commit id up front. Blocks
    /// only for the instant a concurrent checkpoint holds the quiescence
    /// gate; once past that point the transaction proceeds independently
    /// of any later checkpoint.
    pub fn begin(&self, txn_id: TxnId) -> Transaction<'_, F> {
        {
            let _quiescence = self.quiescence.read();
            self.writers_active
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        Transaction {
            manager: self,
            id: txn_id,
            commit_id: self.commits.reserve(),
            state: TxnState::Active,
            local: LocalStorage::new(),
        }
    }

    /// Looks up a table's schema-derived name to id mapping.
    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.state.read().catalog.table_id(name)
    }

    /// Summarizes every registered table as `(id, name, row_count)`, in no
    /// particular order. Used by inspection tooling.
    pub fn table_summaries(&self) -> Vec<(TableId, String, usize)> {
        self.state
            .read()
            .tables
            .values()
            .map(|t| (t.id(), t.name().to_string(), t.row_count()))
            .collect()
    }

    /// Registers a new table, durably logging its schema as a
    /// `CatalogCreate` WAL record (committed immediately, outside any user
    /// transaction) so recovery can reconstruct the table without the
    /// caller re-issuing DDL.
    #[allow(clippy::too_many_arguments)]
    pub fn create_table_logged(
        &self,
        name: &str,
        kind: TableKind,
        properties: Vec<PropertyDef>,
        primary_key: Option<usize>,
        src_table: Option<TableId>,
        dst_table: Option<TableId>,
        multiplicity: Option<RelMultiplicity>,
        pk_index: Option<HashIndex<F>>,
    ) -> Result<TableId> {
        let mut state = self.state.write();
        let id = state.catalog.create_table(name)?;
        let schema = TableSchema {
            id,
            name: name.to_string(),
            kind,
            properties,
            primary_key,
            src_table,
            dst_table,
            multiplicity,
        };
        let payload = serde_json::to_vec(&schema)
            .map_err(|e| StorageError::TransactionError(format!("schema not encodable: {e}")))?;
        {
            let wal = self.wal.lock();
            wal.append(&wal_record(WalRecordKind::CatalogCreate, TxnId(0), payload))?;
            wal.append_commit(TxnId(0))?;
            wal.sync()?;
        }
        state.tables.insert(id, Table::new(schema, pk_index));
        Ok(id)
    }

    /// Reads a single row from a committed table (no transaction-local
    /// overlay resolution; for that, read through an active
    /// [`Transaction`] instead).
    pub fn read_committed(&self, table: TableId, row_offset: usize) -> Result<Option<Vec<Value>>> {
        let state = self.state.read();
        let table = state
            .tables
            .get(&table)
            .ok_or_else(|| StorageError::NotFound(format!("table {table:?}")))?;
        Ok(table.get(row_offset)?.map(|vs| vs.into_iter().cloned().collect()))
    }

    fn commit_inner(&self, txn: &mut Transaction<'_, F>) -> Result<()> {
        let mut state = self.state.write();

        for table_id in txn.local.touched_tables().collect::<Vec<_>>() {
            let inserts: Vec<_> = txn.local.inserts_for(table_id).cloned().collect();
            if let Some(table) = state.tables.get(&table_id) {
                table.validate_inserts(&inserts)?;
            }
        }

        let wal = self.wal.lock();
        for table_id in txn.local.touched_tables().collect::<Vec<_>>() {
            for row in txn.local.inserts_for(table_id) {
                wal.append(&wal_record(
                    WalRecordKind::TableInsert,
                    txn.id,
                    encode_row(table_id, row),
                ))?;
            }
            for (offset, col, value) in txn.local.updates_for(table_id) {
                wal.append(&wal_record(
                    WalRecordKind::TableUpdate,
                    txn.id,
                    encode_update(table_id, *offset, *col, value),
                ))?;
            }
            for offset in txn.local.deletes_for(table_id) {
                wal.append(&wal_record(
                    WalRecordKind::TableDelete,
                    txn.id,
                    encode_delete(table_id, *offset),
                ))?;
            }
        }
        wal.append_commit(txn.id)?;
        wal.sync()?;

        for table_id in txn.local.touched_tables().collect::<Vec<_>>() {
            if let Some(table) = state.tables.get_mut(&table_id) {
                table.apply_local(&txn.local)?;
            }
        }

        self.commits.mark_committed(txn.commit_id);
        info!(txn_id = txn.id.0, commit_id = txn.commit_id, "transaction committed");
        Ok(())
    }

    fn rollback_inner(&self, txn: &mut Transaction<'_, F>) {
        self.commits.release(txn.commit_id);
        txn.local.clear();
    }

    fn finish(&self, _txn: &mut Transaction<'_, F>) {
        self.writers_active
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }

    /// Stops accepting new write transactions, waits (up to
    /// `checkpoint_wait_timeout`) for active ones to finish, persists a
    /// full catalog/row snapshot through `metadata_sink`, flushes every
    /// dirty buffer-managed page into the shadow file, applies the shadow
    /// pages back into the main file, and truncates the WAL. Fails with
    /// `CheckpointBusy` if writers are still active after the timeout, in
    /// which case no state changes.
    pub fn checkpoint(&self) -> Result<CheckpointReport> {
        let _guard = self.checkpoint_lock.lock();
        let _quiescence = self.quiescence.write();
        let start = Instant::now();
        let deadline = start + self.config.checkpoint_wait_timeout;
        while self.writers_active.load(std::sync::atomic::Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return Err(StorageError::CheckpointBusy);
            }
            std::thread::yield_now();
        }

        let snapshot = self.build_snapshot()?;
        (self.metadata_sink)(&snapshot)?;

        let mut pages_applied = 0;
        if let (Some(buffer), Some(shadow)) = (&self.buffer, &self.shadow) {
            buffer.flush_all()?;
            pages_applied = shadow.len();
            shadow.clear()?;
        }

        let wal = self.wal.lock();
        wal.append(&wal_record(WalRecordKind::Checkpoint, TxnId(0), Vec::new()))?;
        wal.sync()?;
        wal.reset()?;
        let wal_size_after = wal.size()?;

        let duration_ms = start.elapsed().as_secs_f64() * 1_000.0;
        info!(pages_applied, wal_size_after, "checkpoint complete");
        Ok(CheckpointReport {
            duration_ms,
            pages_applied,
            wal_size_after,
        })
    }

    /// Serializes every table's catalog entry and rows as a
    /// `Vec<TableSnapshot>` JSON blob, for `metadata_sink` to persist.
    fn build_snapshot(&self) -> Result<Vec<u8>> {
        let state = self.state.read();
        let snapshots = state
            .tables
            .values()
            .map(|table| {
                Ok(TableSnapshot {
                    schema: table.schema().clone(),
                    rows: table.snapshot_rows()?,
                })
            })
            .collect::<Result<Vec<TableSnapshot>>>()?;
        serde_json::to_vec(&snapshots)
            .map_err(|e| StorageError::CorruptionError(format!("snapshot not encodable: {e}")))
    }

    /// Invoked after a successful commit; triggers a checkpoint when
    /// auto-checkpointing is enabled and the WAL has grown past
    /// `checkpoint_threshold`. A failed or busy checkpoint here is logged,
    /// not propagated — the commit it follows already succeeded.
    fn maybe_auto_checkpoint(&self) {
        if !self.config.auto_checkpoint || self.config.read_only {
            return;
        }
        let wal_size = match self.wal.lock().size() {
            Ok(size) => size,
            Err(e) => {
                warn!(error = %e, "could not read WAL size for auto-checkpoint");
                return;
            }
        };
        if wal_size <= self.config.checkpoint_threshold {
            return;
        }
        if let Err(e) = self.checkpoint() {
            warn!(error = %e, "auto-checkpoint failed");
        }
    }

    /// The oldest commit id still needed by an in-flight reader.
    pub fn oldest_visible(&self) -> CommitId {
        self.commits.oldest_visible()
    }

    /// Checks catalog and (at `Full` level) per-row primary-key index
    /// consistency across every table.
    pub fn verify(&self, level: VerifyLevel) -> Result<VerifyReport> {
        let state = self.state.read();
        let mut report = VerifyReport {
            level,
            success: true,
            tables_checked: state.tables.len(),
            live_rows: 0,
            tombstoned_rows: 0,
            errors: Vec::new(),
        };
        if level == VerifyLevel::Full {
            for table in state.tables.values() {
                let result = table.verify()?;
                report.live_rows += result.live_rows;
                report.tombstoned_rows += result.tombstoned_rows;
                report.errors.extend(result.errors);
            }
        }
        report.success = report.errors.is_empty();
        Ok(report)
    }
}

fn wal_record(kind: WalRecordKind, txn_id: TxnId, payload: Vec<u8>) -> WalRecord {
    WalRecord { kind, txn_id, payload }
}

fn encode_row(table_id: TableId, row: &[Value]) -> Vec<u8> {
    let mut buf = table_id.0.to_le_bytes().to_vec();
    let json = serde_json::to_vec(&row.iter().map(value_to_json).collect::<Vec<_>>())
        .expect("row values are always representable as JSON");
    buf.extend_from_slice(&json);
    buf
}

fn encode_update(table_id: TableId, offset: usize, column: usize, value: &Value) -> Vec<u8> {
    let mut buf = table_id.0.to_le_bytes().to_vec();
    buf.extend_from_slice(&(offset as u64).to_le_bytes());
    buf.extend_from_slice(&(column as u64).to_le_bytes());
    buf.extend_from_slice(&serde_json::to_vec(&value_to_json(value)).unwrap());
    buf
}

fn encode_delete(table_id: TableId, offset: usize) -> Vec<u8> {
    let mut buf = table_id.0.to_le_bytes().to_vec();
    buf.extend_from_slice(&(offset as u64).to_le_bytes());
    buf
}

pub(crate) fn decode_table_insert(payload: &[u8]) -> Result<(TableId, Vec<Value>)> {
    if payload.len() < 4 {
        return Err(StorageError::CorruptionError("truncated TableInsert record".into()));
    }
    let table_id = TableId(u32::from_le_bytes(payload[0..4].try_into().unwrap()));
    let json: Vec<serde_json::Value> = serde_json::from_slice(&payload[4..])
        .map_err(|e| StorageError::CorruptionError(format!("bad TableInsert payload: {e}")))?;
    Ok((table_id, json.iter().map(value_from_json).collect()))
}

pub(crate) fn decode_table_update(payload: &[u8]) -> Result<(TableId, usize, usize, Value)> {
    if payload.len() < 20 {
        return Err(StorageError::CorruptionError("truncated TableUpdate record".into()));
    }
    let table_id = TableId(u32::from_le_bytes(payload[0..4].try_into().unwrap()));
    let offset = u64::from_le_bytes(payload[4..12].try_into().unwrap()) as usize;
    let column = u64::from_le_bytes(payload[12..20].try_into().unwrap()) as usize;
    let json: serde_json::Value = serde_json::from_slice(&payload[20..])
        .map_err(|e| StorageError::CorruptionError(format!("bad TableUpdate payload: {e}")))?;
    Ok((table_id, offset, column, value_from_json(&json)))
}

pub(crate) fn decode_table_delete(payload: &[u8]) -> Result<(TableId, usize)> {
    if payload.len() != 12 {
        return Err(StorageError::CorruptionError("truncated TableDelete record".into()));
    }
    let table_id = TableId(u32::from_le_bytes(payload[0..4].try_into().unwrap()));
    let offset = u64::from_le_bytes(payload[4..12].try_into().unwrap()) as usize;
    Ok((table_id, offset))
}

/// Encodes a [`Value`] as a small tagged JSON object so replay can recover
/// the exact variant (in particular, telling `Int64` and `NodeId` apart,
/// which plain-number JSON can't do). Delegates to `Value`'s own
/// `Serialize` impl under a single-key wrapper rather than hand-rolling a
/// case for every one of the closed type set's variants.
fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        other => serde_json::json!({ "v": other }),
    }
}

fn value_from_json(json: &serde_json::Value) -> Value {
    if json.is_null() {
        return Value::Null;
    }
    json.get("v")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or(Value::Null)
}

/// A single transaction: buffers writes locally until [`Transaction::commit`]
/// makes them durable and visible, or [`Transaction::rollback`] discards
/// them. Dropping an active transaction without calling either rolls it
/// back and logs a `tracing::warn!` — an embeddable library shouldn't abort
/// its host process over a caller forgetting `commit()`.
pub struct Transaction<'a, F: FileIo> {
    manager: &'a TransactionManager<F>,
    id: TxnId,
    commit_id: CommitId,
    state: TxnState,
    local: LocalStorage,
}

impl<'a, F: FileIo> Transaction<'a, F> {
    /// This transaction's id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// This transaction's reserved (not yet necessarily visible) commit id.
    pub fn commit_id(&self) -> CommitId {
        self.commit_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxnState {
        self.state
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != TxnState::Active {
            return Err(StorageError::TransactionError(
                "transaction is no longer active".into(),
            ));
        }
        Ok(())
    }

    /// Buffers an insert of `row` into `table`; visible to reads made
    /// through this same transaction but not to other transactions until
    /// commit.
    pub fn insert(&mut self, table: TableId, row: Vec<Value>) -> Result<()> {
        self.ensure_active()?;
        self.local.record_insert(table, row);
        Ok(())
    }

    /// Buffers an update of one column.
    pub fn update(&mut self, table: TableId, row_offset: usize, column: usize, value: Value) -> Result<()> {
        self.ensure_active()?;
        self.local.record_update(table, row_offset, column, value);
        Ok(())
    }

    /// Buffers a delete.
    pub fn delete(&mut self, table: TableId, row_offset: usize) -> Result<()> {
        self.ensure_active()?;
        self.local.record_delete(table, row_offset);
        Ok(())
    }

    /// Reads a row, resolving this transaction's own buffered writes on top
    /// of the last-committed state before falling back to it — read your
    /// own writes. A row this transaction deletes reads as absent even
    /// before commit; a row it updates reads with those column values
    /// applied. Freshly inserted rows have no offset assigned until
    /// commit, so they aren't reachable through this offset-addressed read
    /// until then.
    pub fn get(&self, table: TableId, row_offset: usize) -> Result<Option<Vec<Value>>> {
        if self.local.deletes_for(table).any(|&offset| offset == row_offset) {
            return Ok(None);
        }
        let mut row = self.manager.read_committed(table, row_offset)?;
        if let Some(row) = row.as_mut() {
            for (offset, column, value) in self.local.updates_for(table) {
                if *offset == row_offset {
                    if let Some(slot) = row.get_mut(*column) {
                        *slot = value.clone();
                    }
                }
            }
        }
        Ok(row)
    }

    /// Writes every buffered mutation to the WAL, applies it to the
    /// tables, and marks the commit id visible. Consumes the transaction.
    pub fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        let result = self.manager.commit_inner(&mut self);
        match &result {
            Ok(()) => self.state = TxnState::Committed,
            Err(_) => {
                self.manager.rollback_inner(&mut self);
                self.state = TxnState::RolledBack;
            }
        }
        self.manager.finish(&mut self);
        if result.is_ok() {
            self.manager.maybe_auto_checkpoint();
        }
        result
    }

    /// Discards every buffered mutation. Consumes the transaction.
    pub fn rollback(mut self) -> Result<()> {
        self.ensure_active()?;
        self.manager.rollback_inner(&mut self);
        self.state = TxnState::RolledBack;
        self.manager.finish(&mut self);
        Ok(())
    }
}

impl<'a, F: FileIo> Drop for Transaction<'a, F> {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            self.manager.rollback_inner(self);
            self.manager.finish(self);
            if !std::thread::panicking() {
                warn!(txn_id = self.id.0, "transaction dropped without commit or rollback");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::StdFileIo;
    use crate::storage::{PropertyDef, TableSchema};
    use crate::types::{PhysicalType, TableKind};
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path) -> TransactionManager<StdFileIo> {
        let wal_file = StdFileIo::open(dir.join("wal.kz")).unwrap();
        let wal = Wal::open(wal_file).unwrap();
        let mut catalog = Catalog::new();
        let id = catalog.create_table("person").unwrap();
        let schema = TableSchema {
            id,
            name: "person".into(),
            kind: TableKind::Node,
            properties: vec![PropertyDef {
                name: "id".into(),
                physical_type: PhysicalType::Int64,
            }],
            primary_key: Some(0),
            src_table: None,
            dst_table: None,
            multiplicity: None,
        };
        let mut tables = HashMap::new();
        tables.insert(id, Table::<StdFileIo>::new(schema, None));
        TransactionManager::new(wal, None, None, catalog, tables, Config::default(), Box::new(|_| Ok(())))
    }

    #[test]
    fn commit_makes_writes_visible() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let table = mgr.table_id("person").unwrap();
        let mut txn = mgr.begin(TxnId(1));
        txn.insert(table, vec![Value::Int64(1)]).unwrap();
        txn.commit().unwrap();
        assert_eq!(
            mgr.read_committed(table, 0).unwrap(),
            Some(vec![Value::Int64(1)])
        );
    }

    #[test]
    fn rollback_discards_writes() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let table = mgr.table_id("person").unwrap();
        let mut txn = mgr.begin(TxnId(2));
        txn.insert(table, vec![Value::Int64(9)]).unwrap();
        txn.rollback().unwrap();
        assert_eq!(mgr.read_committed(table, 0).unwrap(), None);
    }

    #[test]
    fn dropping_active_transaction_rolls_back() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let table = mgr.table_id("person").unwrap();
        {
            let mut txn = mgr.begin(TxnId(3));
            txn.insert(table, vec![Value::Int64(5)]).unwrap();
        }
        assert_eq!(mgr.read_committed(table, 0).unwrap(), None);
    }
}
