//! Glue layer: wires the buffer manager, WAL, shadow file, catalog, and
//! task scheduler into a single [`Database`] handle, and exposes
//! [`Connection`] as a lightweight shared handle onto it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::index::{HashIndex, ReserveStats};
use crate::io::{FileHandle, FileIo, StdFileIo};
use crate::pager::{BufferManager, ShadowFile, Wal, WalRecordKind};
use crate::scheduler::TaskScheduler;
use crate::storage::{Catalog, PropertyDef, Table, TableSchema};
use crate::txn::{
    decode_table_delete, decode_table_insert, decode_table_update, CheckpointReport, TableSnapshot,
    Transaction, TransactionManager, VerifyLevel, VerifyReport,
};
use crate::types::{RelMultiplicity, TableId, TableKind, TxnId};

const DATA_FILE: &str = "data.kz";
const WAL_FILE: &str = "wal.kz";
const SHADOW_FILE: &str = "shadow.kz";
const METADATA_FILE: &str = "metadata.kz";

/// An open database: a transaction manager plus a worker-thread pool, all
/// rooted at one directory on disk.
pub struct Database {
    dir: PathBuf,
    manager: TransactionManager<StdFileIo>,
    scheduler: TaskScheduler,
    next_txn_id: AtomicU64,
    config: Config,
}

impl Database {
    /// Opens (creating if necessary) the database rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>, config: Config) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let page_size = crate::pager::DEFAULT_PAGE_SIZE;
        let data_file = StdFileIo::open(dir.join(DATA_FILE))?;
        let data_handle = Arc::new(FileHandle::new(data_file, page_size as u32)?);
        let shadow_file = StdFileIo::open(dir.join(SHADOW_FILE))?;
        let shadow = Arc::new(ShadowFile::open(shadow_file)?);
        let buffer = BufferManager::new(
            data_handle,
            Some(Arc::clone(&shadow)),
            config.buffer_pool_size,
            page_size,
        )?;

        let wal_file = StdFileIo::open(dir.join(WAL_FILE))?;
        let wal = Wal::open(wal_file)?;

        let mut catalog = Catalog::new();
        let mut tables: HashMap<TableId, Table<StdFileIo>> = HashMap::new();
        for snapshot in read_metadata_snapshot(&dir)? {
            let TableSnapshot { schema, rows } = snapshot;
            catalog.create_table_with_id(schema.id, &schema.name)?;
            let pk_index = match schema.primary_key {
                Some(_) => Some(open_pk_index_at(&dir, &schema.name)?),
                None => None,
            };
            tables.insert(schema.id, Table::from_snapshot(schema, pk_index, rows)?);
        }

        // Only mutations made since the last checkpoint remain in the WAL
        // (checkpoint truncates it after persisting a snapshot above), so
        // replaying it on top of that snapshot reconstructs exactly the
        // state at close, however many checkpoints occurred in between.
        wal.replay(|record| {
            match record.kind {
                WalRecordKind::CatalogCreate => {
                    let schema: TableSchema = serde_json::from_slice(&record.payload)
                        .map_err(|e| StorageError::CorruptionError(format!("bad CatalogCreate payload: {e}")))?;
                    catalog.create_table_with_id(schema.id, &schema.name)?;
                    let pk_index = match schema.primary_key {
                        Some(_) => Some(open_pk_index_at(&dir, &schema.name)?),
                        None => None,
                    };
                    tables.insert(schema.id, Table::new(schema, pk_index));
                }
                WalRecordKind::TableInsert => {
                    let (table_id, row) = decode_table_insert(&record.payload)?;
                    let table = tables
                        .get_mut(&table_id)
                        .ok_or_else(|| StorageError::CorruptionError(format!("insert into unknown table {table_id:?}")))?;
                    table.insert(row)?;
                }
                WalRecordKind::TableUpdate => {
                    let (table_id, offset, column, value) = decode_table_update(&record.payload)?;
                    let table = tables
                        .get_mut(&table_id)
                        .ok_or_else(|| StorageError::CorruptionError(format!("update on unknown table {table_id:?}")))?;
                    table.update(offset, column, value)?;
                }
                WalRecordKind::TableDelete => {
                    let (table_id, offset) = decode_table_delete(&record.payload)?;
                    let table = tables
                        .get_mut(&table_id)
                        .ok_or_else(|| StorageError::CorruptionError(format!("delete on unknown table {table_id:?}")))?;
                    table.delete(offset)?;
                }
                WalRecordKind::CatalogDrop
                | WalRecordKind::CatalogAlter
                | WalRecordKind::CopyTable
                | WalRecordKind::UpdateSequence
                | WalRecordKind::Checkpoint
                | WalRecordKind::Commit => {}
            }
            Ok(())
        })?;

        let metadata_path = dir.join(METADATA_FILE);
        let metadata_sink: Box<dyn Fn(&[u8]) -> Result<()> + Send + Sync> = Box::new(move |bytes| {
            let file = StdFileIo::open(&metadata_path)?;
            file.truncate(0)?;
            file.write_at(0, bytes)?;
            file.sync_all()
        });
        let manager = TransactionManager::new(
            wal,
            Some(shadow),
            Some(buffer),
            catalog,
            tables,
            config.clone(),
            metadata_sink,
        );
        let scheduler = TaskScheduler::new(config.max_num_threads)?;

        info!(dir = %dir.display(), "database opened");
        Ok(Self {
            dir,
            manager,
            scheduler,
            next_txn_id: AtomicU64::new(1),
            config,
        })
    }

    /// The directory this database is rooted at.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// The configuration this database was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers a node table, optionally enforcing primary-key
    /// uniqueness through a persisted hash index opened alongside `name`.
    pub fn create_node_table(
        &mut self,
        name: &str,
        properties: Vec<PropertyDef>,
        primary_key: Option<usize>,
    ) -> Result<TableId> {
        let pk_index = match primary_key {
            Some(_) => Some(self.open_pk_index(name)?),
            None => None,
        };
        self.create_table(name, TableKind::Node, properties, primary_key, None, None, None, pk_index)
    }

    /// Registers a relationship table between `src_table` and `dst_table`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_rel_table(
        &mut self,
        name: &str,
        properties: Vec<PropertyDef>,
        src_table: TableId,
        dst_table: TableId,
        multiplicity: RelMultiplicity,
    ) -> Result<TableId> {
        self.create_table(
            name,
            TableKind::Rel,
            properties,
            None,
            Some(src_table),
            Some(dst_table),
            Some(multiplicity),
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn create_table(
        &mut self,
        name: &str,
        kind: TableKind,
        properties: Vec<PropertyDef>,
        primary_key: Option<usize>,
        src_table: Option<TableId>,
        dst_table: Option<TableId>,
        multiplicity: Option<RelMultiplicity>,
        pk_index: Option<HashIndex<StdFileIo>>,
    ) -> Result<TableId> {
        self.manager
            .create_table_logged(name, kind, properties, primary_key, src_table, dst_table, multiplicity, pk_index)
    }

    fn open_pk_index(&self, table_name: &str) -> Result<HashIndex<StdFileIo>> {
        open_pk_index_at(&self.dir, table_name)
    }

    /// Looks up a table's id by name.
    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.manager.table_id(name)
    }

    /// Summarizes every registered table as `(id, name, row_count)`.
    pub fn table_summaries(&self) -> Vec<(TableId, String, usize)> {
        self.manager.table_summaries()
    }

    /// Begins a new transaction against this database.
    pub fn begin_transaction(&self) -> Transaction<'_, StdFileIo> {
        let id = TxnId(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        self.manager.begin(id)
    }

    /// Runs a checkpoint: flushes dirty pages through the shadow file,
    /// applies them, and truncates the WAL.
    pub fn checkpoint(&self) -> Result<CheckpointReport> {
        self.manager.checkpoint()
    }

    /// Submits a background task (e.g. a scan) to the worker pool.
    pub fn spawn(&self, task: impl crate::scheduler::Task + 'static) -> Arc<crate::scheduler::ScheduledTask> {
        self.scheduler.submit(task)
    }

    /// The oldest commit id still needed by an in-flight reader.
    pub fn oldest_visible_commit(&self) -> crate::types::CommitId {
        self.manager.oldest_visible()
    }

    /// Checks catalog and (at `Full` level) per-row primary-key index
    /// consistency across every table.
    pub fn verify(&self, level: VerifyLevel) -> Result<VerifyReport> {
        self.manager.verify(level)
    }
}

/// Reads the catalog/row snapshot left by the most recent checkpoint, or
/// an empty list if the database has never checkpointed (or is brand
/// new). `Database::open` replays the WAL on top of whatever this
/// returns, so a missing or empty file just means "replay the entire
/// WAL," which is exactly the pre-checkpoint behavior.
fn read_metadata_snapshot(dir: &Path) -> Result<Vec<TableSnapshot>> {
    let file = StdFileIo::open(dir.join(METADATA_FILE))?;
    let len = file.len()?;
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut bytes = vec![0u8; len as usize];
    file.read_at(0, &mut bytes)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| StorageError::CorruptionError(format!("bad metadata.kz snapshot: {e}")))
}

/// Opens a table's primary-key index files, truncating them first.
///
/// The index is derived entirely from a table's rows, which are themselves
/// reconstructed from the last checkpoint's snapshot plus WAL replay on
/// every open; any bytes a prior process left in these files are stale the
/// moment `open` starts rebuilding the table, so rebuilding from empty is
/// the only way to avoid spurious `DuplicateKey` errors from re-inserting
/// rows the old index already knew about.
fn open_pk_index_at(dir: &Path, table_name: &str) -> Result<HashIndex<StdFileIo>> {
    let slots = StdFileIo::open(dir.join(format!("{table_name}.pk.idx")))?;
    slots.truncate(0)?;
    let overflow = StdFileIo::open(dir.join(format!("{table_name}.pk.ovf")))?;
    overflow.truncate(0)?;
    let index = HashIndex::open(slots, overflow, crate::pager::DEFAULT_PAGE_SIZE, 64)?;
    let ReserveStats { .. } = index.bulk_reserve(1024)?;
    Ok(index)
}

/// A lightweight, cloneable handle onto a shared [`Database`]; callers
/// that want one database accessed from multiple threads should wrap it
/// in `Arc<Database>` and hand out `Connection`s from there.
pub struct Connection {
    database: Arc<Database>,
}

impl Connection {
    /// Creates a connection onto an already-opened, shared database.
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    /// Begins a new transaction on the underlying database.
    pub fn begin_transaction(&self) -> Transaction<'_, StdFileIo> {
        self.database.begin_transaction()
    }

    /// The underlying database handle.
    pub fn database(&self) -> &Database {
        &self.database
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PropertyDef;
    use crate::types::PhysicalType;
    use tempfile::tempdir;

    #[test]
    fn opens_creates_tables_and_checkpoints() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path(), Config::default()).unwrap();
        let person = db
            .create_node_table(
                "person",
                vec![PropertyDef {
                    name: "id".into(),
                    physical_type: PhysicalType::Int64,
                }],
                Some(0),
            )
            .unwrap();

        let mut txn = db.begin_transaction();
        txn.insert(person, vec![crate::storage::Value::Int64(1)]).unwrap();
        txn.commit().unwrap();

        let report = db.checkpoint().unwrap();
        assert_eq!(report.pages_applied, 0);
    }

    #[test]
    fn duplicate_primary_key_rejected_at_commit() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path(), Config::default()).unwrap();
        let person = db
            .create_node_table(
                "person",
                vec![PropertyDef {
                    name: "id".into(),
                    physical_type: PhysicalType::Int64,
                }],
                Some(0),
            )
            .unwrap();

        let mut txn = db.begin_transaction();
        txn.insert(person, vec![crate::storage::Value::Int64(1)]).unwrap();
        txn.commit().unwrap();

        let mut txn2 = db.begin_transaction();
        txn2.insert(person, vec![crate::storage::Value::Int64(1)]).unwrap();
        assert!(txn2.commit().is_err());
    }

    #[test]
    fn reopening_recovers_schema_and_committed_rows() {
        let dir = tempdir().unwrap();
        {
            let mut db = Database::open(dir.path(), Config::default()).unwrap();
            let person = db
                .create_node_table(
                    "person",
                    vec![
                        PropertyDef {
                            name: "name".into(),
                            physical_type: PhysicalType::String,
                        },
                        PropertyDef {
                            name: "age".into(),
                            physical_type: PhysicalType::Int64,
                        },
                    ],
                    None,
                )
                .unwrap();
            let mut txn = db.begin_transaction();
            txn.insert(
                person,
                vec![crate::storage::Value::String("Alice".into()), crate::storage::Value::Int64(25)],
            )
            .unwrap();
            txn.insert(
                person,
                vec![crate::storage::Value::String("Bob".into()), crate::storage::Value::Int64(30)],
            )
            .unwrap();
            txn.commit().unwrap();
        }

        let db = Database::open(dir.path(), Config::default()).unwrap();
        let person = db.table_id("person").unwrap();
        let mut rows = Vec::new();
        for offset in 0..2 {
            if let Some(row) = db.manager.read_committed(person, offset).unwrap() {
                rows.push(row);
            }
        }
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            vec![crate::storage::Value::String("Alice".into()), crate::storage::Value::Int64(25)]
        );
        assert_eq!(
            rows[1],
            vec![crate::storage::Value::String("Bob".into()), crate::storage::Value::Int64(30)]
        );
    }
}
