//! Columnar storage: a [`Column`] is a sequence of [`ColumnChunk`]s, each
//! holding up to one node group's worth of typed values plus a null mask
//! and min/max statistics.

use crate::error::{Result, StorageError};
use crate::types::PhysicalType;

/// Number of rows held by one node group (and so, at most, one chunk).
pub const NODE_GROUP_SIZE: usize = 1 << 17;

/// A single typed value read from or written to a column.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    /// SQL-NULL.
    Null,
    /// A boolean.
    Bool(bool),
    /// An 8-bit signed integer.
    Int8(i8),
    /// A 16-bit signed integer.
    Int16(i16),
    /// A 32-bit signed integer.
    Int32(i32),
    /// A 64-bit integer.
    Int64(i64),
    /// An 8-bit unsigned integer.
    UInt8(u8),
    /// A 16-bit unsigned integer.
    UInt16(u16),
    /// A 32-bit unsigned integer.
    UInt32(u32),
    /// A 64-bit unsigned integer.
    UInt64(u64),
    /// A 128-bit signed integer.
    Int128(i128),
    /// A 32-bit float.
    Float32(f32),
    /// A 64-bit float.
    Float64(f64),
    /// Days since the Unix epoch.
    Date(i32),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
    /// A calendar interval.
    Interval {
        /// Whole months.
        months: i32,
        /// Whole days, counted separately from months.
        days: i32,
        /// Sub-day remainder, in microseconds.
        micros: i64,
    },
    /// A UTF-8 string.
    String(String),
    /// An opaque byte blob.
    Blob(Vec<u8>),
    /// A list of fixed length.
    FixedList(Vec<Value>),
    /// A list of variable length.
    VarList(Vec<Value>),
    /// A fixed, named set of fields.
    Struct(Vec<(String, Value)>),
    /// A key/value association, stored as pairs in insertion order.
    Map(Vec<(Value, Value)>),
    /// An internal row identifier.
    InternalId {
        /// The row's table.
        table_id: u32,
        /// The row's offset within that table.
        offset: u64,
    },
    /// An internal node id.
    NodeId(u64),
}

impl Value {
    fn physical_type(&self) -> Option<PhysicalType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(PhysicalType::Bool),
            Value::Int8(_) => Some(PhysicalType::Int8),
            Value::Int16(_) => Some(PhysicalType::Int16),
            Value::Int32(_) => Some(PhysicalType::Int32),
            Value::Int64(_) => Some(PhysicalType::Int64),
            Value::UInt8(_) => Some(PhysicalType::UInt8),
            Value::UInt16(_) => Some(PhysicalType::UInt16),
            Value::UInt32(_) => Some(PhysicalType::UInt32),
            Value::UInt64(_) => Some(PhysicalType::UInt64),
            Value::Int128(_) => Some(PhysicalType::Int128),
            Value::Float32(_) => Some(PhysicalType::Float32),
            Value::Float64(_) => Some(PhysicalType::Float64),
            Value::Date(_) => Some(PhysicalType::Date),
            Value::Timestamp(_) => Some(PhysicalType::Timestamp),
            Value::Interval { .. } => Some(PhysicalType::Interval),
            Value::String(_) => Some(PhysicalType::String),
            Value::Blob(_) => Some(PhysicalType::Blob),
            Value::FixedList(_) => Some(PhysicalType::FixedList),
            Value::VarList(_) => Some(PhysicalType::VarList),
            Value::Struct(_) => Some(PhysicalType::Struct),
            Value::Map(_) => Some(PhysicalType::Map),
            Value::InternalId { .. } => Some(PhysicalType::InternalId),
            Value::NodeId(_) => Some(PhysicalType::NodeId),
        }
    }

    fn cmp_key(&self) -> Option<f64> {
        match self {
            Value::Int8(v) => Some(*v as f64),
            Value::Int16(v) => Some(*v as f64),
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::UInt8(v) => Some(*v as f64),
            Value::UInt16(v) => Some(*v as f64),
            Value::UInt32(v) => Some(*v as f64),
            Value::UInt64(v) => Some(*v as f64),
            Value::Int128(v) => Some(*v as f64),
            Value::Float32(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            Value::Date(v) => Some(*v as f64),
            Value::Timestamp(v) => Some(*v as f64),
            Value::NodeId(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// Per-chunk statistics maintained incrementally as values are appended.
///
/// Invariant: for every non-null value `v` actually stored in the chunk,
/// `min <= v <= max` once at least one comparable value has been seen.
#[derive(Clone, Debug, Default)]
pub struct ChunkStats {
    min: Option<f64>,
    max: Option<f64>,
    /// `true` once proven no value in the chunk is null.
    pub guaranteed_no_nulls: bool,
    /// `true` once proven every value in the chunk is null.
    pub guaranteed_all_nulls: bool,
    non_null_count: usize,
    total_count: usize,
}

impl ChunkStats {
    fn observe(&mut self, value: &Value) {
        self.total_count += 1;
        match value {
            Value::Null => {}
            other => {
                self.non_null_count += 1;
                if let Some(key) = other.cmp_key() {
                    self.min = Some(self.min.map_or(key, |m| m.min(key)));
                    self.max = Some(self.max.map_or(key, |m| m.max(key)));
                }
            }
        }
        self.guaranteed_no_nulls = self.non_null_count == self.total_count;
        self.guaranteed_all_nulls = self.non_null_count == 0 && self.total_count > 0;
    }

    /// Lower bound across all comparable (numeric) values observed.
    pub fn min(&self) -> Option<f64> {
        self.min
    }

    /// Upper bound across all comparable (numeric) values observed.
    pub fn max(&self) -> Option<f64> {
        self.max
    }
}

/// A compression scheme applied to a chunk's values on disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CompressionMetadata {
    /// Values are stored as-is.
    Uncompressed,
    /// String/blob values are deduplicated against a per-chunk dictionary;
    /// `codes` holds each row's index into `dictionary`.
    Dictionary {
        /// Distinct values, in first-seen order.
        dictionary: Vec<Vec<u8>>,
    },
}

/// Up to [`NODE_GROUP_SIZE`] typed values of one column, held in memory in
/// row order alongside a null bitmask and running statistics.
pub struct ColumnChunk {
    physical_type: PhysicalType,
    values: Vec<Value>,
    null_mask: Vec<bool>,
    stats: ChunkStats,
    compression: CompressionMetadata,
}

impl ColumnChunk {
    /// Creates an empty chunk for `physical_type`.
    pub fn new(physical_type: PhysicalType) -> Self {
        Self {
            physical_type,
            values: Vec::new(),
            null_mask: Vec::new(),
            stats: ChunkStats::default(),
            compression: CompressionMetadata::Uncompressed,
        }
    }

    /// The type every non-null value in this chunk must match.
    pub fn physical_type(&self) -> PhysicalType {
        self.physical_type
    }

    /// Number of rows (including nulls) currently stored.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// `true` when the chunk holds no rows.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Running statistics for this chunk.
    pub fn stats(&self) -> &ChunkStats {
        &self.stats
    }

    fn check_type(&self, value: &Value) -> Result<()> {
        if let Some(pt) = value.physical_type() {
            if pt != self.physical_type {
                return Err(StorageError::TypeError(format!(
                    "expected {:?}, got {:?}",
                    self.physical_type, pt
                )));
            }
        }
        Ok(())
    }

    /// Appends one value, which must be `Value::Null` or match this
    /// chunk's physical type.
    pub fn append(&mut self, value: Value) -> Result<()> {
        self.check_type(&value)?;
        if self.values.len() >= NODE_GROUP_SIZE {
            return Err(StorageError::CapacityError(
                "column chunk is at node group capacity".into(),
            ));
        }
        self.stats.observe(&value);
        self.null_mask.push(matches!(value, Value::Null));
        self.values.push(value);
        Ok(())
    }

    /// Overwrites the value at `row`, which must already exist.
    pub fn write(&mut self, row: usize, value: Value) -> Result<()> {
        self.check_type(&value)?;
        if row >= self.values.len() {
            return Err(StorageError::NotFound(format!("row {row}")));
        }
        self.stats.observe(&value);
        self.null_mask[row] = matches!(value, Value::Null);
        self.values[row] = value;
        Ok(())
    }

    /// Reads the value at `row`.
    pub fn get(&self, row: usize) -> Result<&Value> {
        self.values
            .get(row)
            .ok_or_else(|| StorageError::NotFound(format!("row {row}")))
    }

    /// Merges another chunk's worth of freshly-appended values into this
    /// chunk during a checkpoint, recomputing stats over the union —
    /// exercising the merge law every chunk write must satisfy.
    pub fn append_chunk(&mut self, other: &ColumnChunk) -> Result<()> {
        if other.physical_type != self.physical_type {
            return Err(StorageError::TypeError(
                "cannot append chunk of a different physical type".into(),
            ));
        }
        for value in &other.values {
            self.append(value.clone())?;
        }
        Ok(())
    }

    /// Applies dictionary compression to string/blob values, used when
    /// `Config::enable_compression` is set and the chunk is checkpointed.
    pub fn compress(&mut self) {
        if !matches!(self.physical_type, PhysicalType::String | PhysicalType::Blob) {
            return;
        }
        let mut dictionary: Vec<Vec<u8>> = Vec::new();
        for value in &self.values {
            let bytes = match value {
                Value::String(s) => s.as_bytes().to_vec(),
                Value::Blob(b) => b.clone(),
                Value::Null => continue,
                _ => continue,
            };
            if !dictionary.contains(&bytes) {
                dictionary.push(bytes);
            }
        }
        self.compression = CompressionMetadata::Dictionary { dictionary };
    }

    /// Whether this chunk is currently dictionary-compressed.
    pub fn compression(&self) -> &CompressionMetadata {
        &self.compression
    }
}

/// A column of a table: a physical type plus the ordered sequence of
/// chunks holding its values, one chunk per node group.
pub struct Column {
    name: String,
    physical_type: PhysicalType,
    chunks: Vec<ColumnChunk>,
}

impl Column {
    /// Creates an empty column named `name` of the given physical type.
    pub fn new(name: impl Into<String>, physical_type: PhysicalType) -> Self {
        Self {
            name: name.into(),
            physical_type,
            chunks: vec![ColumnChunk::new(physical_type)],
        }
    }

    /// The column's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The column's declared physical type.
    pub fn physical_type(&self) -> PhysicalType {
        self.physical_type
    }

    /// Total row count across all chunks.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(ColumnChunk::len).sum()
    }

    /// `true` when the column holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn locate(&self, row: usize) -> Result<(usize, usize)> {
        let chunk_idx = row / NODE_GROUP_SIZE;
        let offset = row % NODE_GROUP_SIZE;
        if chunk_idx >= self.chunks.len() {
            return Err(StorageError::NotFound(format!("row {row}")));
        }
        Ok((chunk_idx, offset))
    }

    /// Appends a value, opening a new chunk once the current one reaches
    /// [`NODE_GROUP_SIZE`].
    pub fn append(&mut self, value: Value) -> Result<usize> {
        let last = self.chunks.last_mut().expect("column always has a chunk");
        if last.len() >= NODE_GROUP_SIZE {
            self.chunks.push(ColumnChunk::new(self.physical_type));
        }
        let chunk = self.chunks.last_mut().unwrap();
        let row_in_chunk = chunk.len();
        chunk.append(value)?;
        Ok((self.chunks.len() - 1) * NODE_GROUP_SIZE + row_in_chunk)
    }

    /// Overwrites the value at a global row offset.
    pub fn write(&mut self, row: usize, value: Value) -> Result<()> {
        let (chunk_idx, offset) = self.locate(row)?;
        self.chunks[chunk_idx].write(offset, value)
    }

    /// Reads the value at a global row offset.
    pub fn get(&self, row: usize) -> Result<&Value> {
        let (chunk_idx, offset) = self.locate(row)?;
        self.chunks[chunk_idx].get(offset)
    }

    /// Iterates chunks in order, for checkpoint/scan purposes.
    pub fn chunks(&self) -> &[ColumnChunk] {
        &self.chunks
    }
}
