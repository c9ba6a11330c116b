//! Table-level operations over [`Column`]s: node tables and relationship
//! tables, with catalog bookkeeping and primary-key enforcement.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::error::{Result, StorageError};
use crate::index::hash::{HashIndex, IndexKey};
use crate::io::FileIo;
use crate::storage::column::{Column, Value};
use crate::storage::local::LocalStorage;
use crate::types::{PhysicalType, RelMultiplicity, TableId, TableKind};

/// A row's worth of column references. Most node/relationship schemas
/// have only a handful of properties, so this stays on the stack.
pub type Row<'a> = SmallVec<[&'a Value; 8]>;

/// One `(name, type)` pair in a table's schema.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PropertyDef {
    /// Property name.
    pub name: String,
    /// Physical storage type.
    pub physical_type: PhysicalType,
}

/// Catalog entry describing one table.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TableSchema {
    /// Catalog id.
    pub id: TableId,
    /// Table name.
    pub name: String,
    /// Node or relationship table.
    pub kind: TableKind,
    /// Declared properties, in column order.
    pub properties: Vec<PropertyDef>,
    /// Index into `properties` of the primary key column (node tables
    /// only).
    pub primary_key: Option<usize>,
    /// Source node table id (relationship tables only).
    pub src_table: Option<TableId>,
    /// Destination node table id (relationship tables only).
    pub dst_table: Option<TableId>,
    /// Relationship multiplicity (relationship tables only).
    pub multiplicity: Option<RelMultiplicity>,
}

/// Result of [`Table::verify`]: row counts plus any inconsistencies found
/// between the table's columns and its primary-key index.
#[derive(Clone, Debug, Default)]
pub struct TableVerifyResult {
    /// Number of non-deleted rows.
    pub live_rows: usize,
    /// Number of tombstoned (deleted) rows.
    pub tombstoned_rows: usize,
    /// Human-readable descriptions of any problems found.
    pub errors: Vec<String>,
}

/// A node or relationship table: a set of [`Column`]s sharing a row
/// numbering, plus (for node tables) a primary-key [`HashIndex`].
pub struct Table<F: FileIo = crate::io::StdFileIo> {
    schema: TableSchema,
    columns: Vec<Column>,
    pk_index: Option<HashIndex<F>>,
    row_count: usize,
    tombstones: Vec<bool>,
}

impl<F: FileIo> Table<F> {
    /// Creates an empty table from `schema`, optionally backed by a
    /// primary-key hash index.
    pub fn new(schema: TableSchema, pk_index: Option<HashIndex<F>>) -> Self {
        let columns = schema
            .properties
            .iter()
            .map(|p| Column::new(p.name.clone(), p.physical_type))
            .collect();
        Self {
            schema,
            columns,
            pk_index,
            row_count: 0,
            tombstones: Vec::new(),
        }
    }

    /// The table's catalog id.
    pub fn id(&self) -> TableId {
        self.schema.id
    }

    /// The table's name.
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// The table's schema.
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Number of rows ever inserted, including deleted ones (deleted rows
    /// leave a tombstoned, otherwise-intact row behind).
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    fn pk_value(&self, row: &[Value]) -> Result<Option<IndexKey>> {
        let Some(pk_idx) = self.schema.primary_key else {
            return Ok(None);
        };
        let value = row.get(pk_idx).ok_or_else(|| {
            StorageError::TypeError("row is missing its primary key column".into())
        })?;
        Ok(Some(Self::pk_key(value)?))
    }

    fn pk_key(value: &Value) -> Result<IndexKey> {
        match value {
            Value::Int64(v) => Ok(IndexKey::Int64(*v)),
            Value::NodeId(v) => Ok(IndexKey::Int64(*v as i64)),
            Value::String(s) => Ok(IndexKey::String(s.clone())),
            _ => Err(StorageError::TypeError(
                "primary key column must be an integer, node id, or string".into(),
            )),
        }
    }

    /// Inserts one row, given in column order. Errors with `DuplicateKey`
    /// if the table has a primary key and it's already in use.
    pub fn insert(&mut self, row: Vec<Value>) -> Result<usize> {
        if row.len() != self.columns.len() {
            return Err(StorageError::TypeError(format!(
                "expected {} values, got {}",
                self.columns.len(),
                row.len()
            )));
        }
        let pk = self.pk_value(&row)?;
        if let (Some(key), Some(index)) = (&pk, &self.pk_index) {
            if index.lookup(key)?.is_some() {
                return Err(StorageError::DuplicateKey);
            }
        }

        let mut row_offset = None;
        for (column, value) in self.columns.iter_mut().zip(row.into_iter()) {
            let offset = column.append(value)?;
            row_offset.get_or_insert(offset);
        }
        let offset = row_offset.unwrap_or(self.row_count);
        self.row_count += 1;
        self.tombstones.push(false);

        if let (Some(key), Some(index)) = (pk, &self.pk_index) {
            index.append(key, offset as u64)?;
        }
        Ok(offset)
    }

    /// Reads the full row at `row_offset`, or `None` if it was deleted.
    pub fn get(&self, row_offset: usize) -> Result<Option<Row<'_>>> {
        if self.tombstones.get(row_offset).copied().unwrap_or(true) {
            return Ok(None);
        }
        let mut values = Row::with_capacity(self.columns.len());
        for column in &self.columns {
            values.push(column.get(row_offset)?);
        }
        Ok(Some(values))
    }

    /// Updates one column's value at `row_offset`.
    pub fn update(&mut self, row_offset: usize, column_index: usize, value: Value) -> Result<()> {
        if self.tombstones.get(row_offset).copied().unwrap_or(true) {
            return Err(StorageError::NotFound(format!("row {row_offset}")));
        }
        let column = self
            .columns
            .get_mut(column_index)
            .ok_or_else(|| StorageError::NotFound(format!("column {column_index}")))?;
        column.write(row_offset, value)
    }

    /// Marks `row_offset` deleted and removes its primary-key entry, if
    /// any.
    pub fn delete(&mut self, row_offset: usize) -> Result<()> {
        if self.tombstones.get(row_offset).copied().unwrap_or(true) {
            return Err(StorageError::NotFound(format!("row {row_offset}")));
        }
        if let (Some(pk_idx), Some(index)) = (self.schema.primary_key, &self.pk_index) {
            let value = self.columns[pk_idx].get(row_offset)?.clone();
            if let Some(key) = self.pk_value(&[value])? {
                index.delete(&key)?;
            }
        }
        self.tombstones[row_offset] = true;
        Ok(())
    }

    /// Checks that none of `rows` collides with an existing primary key or
    /// with each other, without mutating anything. Used to make a
    /// transaction's commit all-or-nothing with respect to key conflicts.
    pub fn validate_inserts(&self, rows: &[Vec<Value>]) -> Result<()> {
        let Some(index) = &self.pk_index else {
            return Ok(());
        };
        let mut seen = std::collections::HashSet::new();
        for row in rows {
            let Some(key) = self.pk_value(row)? else {
                continue;
            };
            if !seen.insert(key.clone()) {
                return Err(StorageError::DuplicateKey);
            }
            if index.lookup(&key)?.is_some() {
                return Err(StorageError::DuplicateKey);
            }
        }
        Ok(())
    }

    /// Scans every live row, invoking `visit(row_offset, values)`.
    pub fn scan(&self, mut visit: impl FnMut(usize, Row<'_>)) -> Result<()> {
        for row_offset in 0..self.row_count {
            if self.tombstones[row_offset] {
                continue;
            }
            let mut values = Row::with_capacity(self.columns.len());
            for column in &self.columns {
                values.push(column.get(row_offset)?);
            }
            visit(row_offset, values);
        }
        Ok(())
    }

    /// Scans every live row, checking primary-key index consistency.
    /// Returns counts plus a list of human-readable problems found.
    pub fn verify(&self) -> Result<TableVerifyResult> {
        let mut result = TableVerifyResult {
            live_rows: 0,
            tombstoned_rows: 0,
            errors: Vec::new(),
        };
        let mut seen_keys = std::collections::HashSet::new();
        self.scan(|offset, row| {
            result.live_rows += 1;
            let Some(pk_idx) = self.schema.primary_key else {
                return;
            };
            let Some(value) = row.get(pk_idx) else {
                result.errors.push(format!("row {offset} is missing its primary key column"));
                return;
            };
            let key = match Self::pk_key(value) {
                Ok(key) => key,
                Err(e) => {
                    result.errors.push(format!("row {offset}: {e}"));
                    return;
                }
            };
            if !seen_keys.insert(key.clone()) {
                result.errors.push(format!("duplicate primary key at row {offset}"));
            }
            let Some(index) = &self.pk_index else {
                return;
            };
            match index.lookup(&key) {
                Ok(Some(indexed_offset)) if indexed_offset as usize != offset => {
                    result.errors.push(format!(
                        "primary key index maps row {offset} to offset {indexed_offset}"
                    ));
                }
                Ok(Some(_)) => {}
                Ok(None) => result
                    .errors
                    .push(format!("row {offset} has no primary key index entry")),
                Err(e) => result.errors.push(format!("index lookup for row {offset} failed: {e}")),
            }
        })?;
        result.tombstoned_rows = self.row_count - result.live_rows;
        Ok(result)
    }

    /// Captures every row (live or tombstoned) in offset order, for a
    /// checkpoint-time catalog/row snapshot. `None` marks a tombstoned
    /// offset.
    pub fn snapshot_rows(&self) -> Result<Vec<Option<Vec<Value>>>> {
        let mut rows = Vec::with_capacity(self.row_count);
        for offset in 0..self.row_count {
            if self.tombstones[offset] {
                rows.push(None);
                continue;
            }
            let mut row = Vec::with_capacity(self.columns.len());
            for column in &self.columns {
                row.push(column.get(offset)?.clone());
            }
            rows.push(Some(row));
        }
        Ok(rows)
    }

    /// Appends one snapshot row, bypassing primary-key validation (the
    /// rows being restored were already unique when the snapshot was
    /// taken). A `None` row restores a tombstoned offset as an
    /// all-`Null` placeholder, preserving the original row numbering.
    fn restore_row(&mut self, row: Option<Vec<Value>>) -> Result<()> {
        match row {
            Some(values) => {
                if values.len() != self.columns.len() {
                    return Err(StorageError::TypeError(format!(
                        "expected {} values, got {}",
                        self.columns.len(),
                        values.len()
                    )));
                }
                let pk = self.pk_value(&values)?;
                let offset = self.row_count;
                for (column, value) in self.columns.iter_mut().zip(values.into_iter()) {
                    column.append(value)?;
                }
                self.row_count += 1;
                self.tombstones.push(false);
                if let (Some(key), Some(index)) = (pk, &self.pk_index) {
                    index.append(key, offset as u64)?;
                }
            }
            None => {
                for column in self.columns.iter_mut() {
                    column.append(Value::Null)?;
                }
                self.row_count += 1;
                self.tombstones.push(true);
            }
        }
        Ok(())
    }

    /// Rebuilds a table from a checkpoint snapshot's rows, in the order
    /// `snapshot_rows` produced them.
    pub fn from_snapshot(
        schema: TableSchema,
        pk_index: Option<HashIndex<F>>,
        rows: Vec<Option<Vec<Value>>>,
    ) -> Result<Self> {
        let mut table = Self::new(schema, pk_index);
        for row in rows {
            table.restore_row(row)?;
        }
        Ok(table)
    }

    /// Merges a transaction's local overlay into this table's columns,
    /// called at commit time.
    pub fn apply_local(&mut self, local: &LocalStorage) -> Result<()> {
        for insert in local.inserts_for(self.schema.id) {
            self.insert(insert.clone())?;
        }
        for (offset, column_index, value) in local.updates_for(self.schema.id) {
            self.update(*offset, *column_index, value.clone())?;
        }
        for offset in local.deletes_for(self.schema.id) {
            self.delete(*offset)?;
        }
        Ok(())
    }
}

/// Relationship-table detach-delete support: removes every relationship
/// row whose source or destination column matches `node_offset`.
pub fn detach_delete<F: FileIo>(
    table: &mut Table<F>,
    src_column: usize,
    dst_column: usize,
    node_id: u64,
) -> Result<usize> {
    let mut to_delete = Vec::new();
    table.scan(|row_offset, values| {
        let matches_src = matches!(values[src_column], Value::NodeId(v) if *v == node_id);
        let matches_dst = matches!(values[dst_column], Value::NodeId(v) if *v == node_id);
        if matches_src || matches_dst {
            to_delete.push(row_offset);
        }
    })?;
    let count = to_delete.len();
    for row_offset in to_delete {
        table.delete(row_offset)?;
    }
    Ok(count)
}

/// In-memory catalog: table id/name bookkeeping. Durable through two
/// overlapping paths: the `CatalogCreate` records a transaction manager logs
/// to the WAL as tables are created, and the per-table snapshot a checkpoint
/// writes to `metadata.kz` (see `TableSnapshot` in `crate::txn`), which
/// carries the schema forward so `Database::open` doesn't need to replay
/// `CatalogCreate` records from before the last checkpoint — see DESIGN.md's
/// recovery design note.
#[derive(Default)]
pub struct Catalog {
    next_id: u32,
    names: HashMap<String, TableId>,
}

impl Catalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh table id for `name`, erroring if the name is
    /// already registered.
    pub fn create_table(&mut self, name: &str) -> Result<TableId> {
        if self.names.contains_key(name) {
            return Err(StorageError::TransactionError(format!(
                "table {name} already exists"
            )));
        }
        let id = TableId(self.next_id);
        self.next_id += 1;
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Registers `name` under a caller-supplied id, used when replaying a
    /// `CatalogCreate` WAL record so the reconstructed id matches what was
    /// persisted. Advances the id counter so later `create_table` calls
    /// never collide with a replayed id.
    pub fn create_table_with_id(&mut self, id: TableId, name: &str) -> Result<()> {
        if self.names.contains_key(name) {
            return Err(StorageError::TransactionError(format!(
                "table {name} already exists"
            )));
        }
        self.names.insert(name.to_string(), id);
        self.next_id = self.next_id.max(id.0 + 1);
        Ok(())
    }

    /// Removes a table from the catalog.
    pub fn drop_table(&mut self, name: &str) -> Result<TableId> {
        self.names
            .remove(name)
            .ok_or_else(|| StorageError::NotFound(format!("table {name}")))
    }

    /// Looks up a table's id by name.
    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.names.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::StdFileIo;

    fn schema(with_pk: bool) -> TableSchema {
        TableSchema {
            id: TableId(0),
            name: "person".into(),
            kind: TableKind::Node,
            properties: vec![
                PropertyDef {
                    name: "id".into(),
                    physical_type: PhysicalType::Int64,
                },
                PropertyDef {
                    name: "name".into(),
                    physical_type: PhysicalType::String,
                },
            ],
            primary_key: if with_pk { Some(0) } else { None },
            src_table: None,
            dst_table: None,
            multiplicity: None,
        }
    }

    #[test]
    fn insert_get_update_delete_round_trip() {
        let mut table: Table<StdFileIo> = Table::new(schema(false), None);
        let row = table
            .insert(vec![Value::Int64(1), Value::String("alice".into())])
            .unwrap();
        assert_eq!(
            table.get(row).unwrap().unwrap().into_vec(),
            vec![&Value::Int64(1), &Value::String("alice".into())]
        );
        table.update(row, 1, Value::String("alicia".into())).unwrap();
        assert_eq!(
            table.get(row).unwrap().unwrap()[1],
            &Value::String("alicia".into())
        );
        table.delete(row).unwrap();
        assert!(table.get(row).unwrap().is_none());
    }

    #[test]
    fn scan_skips_deleted_rows() {
        let mut table: Table<StdFileIo> = Table::new(schema(false), None);
        table
            .insert(vec![Value::Int64(1), Value::String("a".into())])
            .unwrap();
        let row2 = table
            .insert(vec![Value::Int64(2), Value::String("b".into())])
            .unwrap();
        table.delete(row2).unwrap();
        let mut seen = Vec::new();
        table
            .scan(|offset, _| seen.push(offset))
            .unwrap();
        assert_eq!(seen, vec![0]);
    }

    #[test]
    fn verify_reports_row_counts_and_index_consistency() {
        let mut table: Table<StdFileIo> = Table::new(schema(false), None);
        table
            .insert(vec![Value::Int64(1), Value::String("a".into())])
            .unwrap();
        let row2 = table
            .insert(vec![Value::Int64(2), Value::String("b".into())])
            .unwrap();
        table.delete(row2).unwrap();

        let result = table.verify().unwrap();
        assert_eq!(result.live_rows, 1);
        assert_eq!(result.tombstoned_rows, 1);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn catalog_rejects_duplicate_names() {
        let mut catalog = Catalog::new();
        catalog.create_table("person").unwrap();
        assert!(catalog.create_table("person").is_err());
        assert!(catalog.table_id("person").is_some());
    }
}
