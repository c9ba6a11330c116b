//! Identifiers and small value types shared across the storage engine.

use crate::error::{Result, StorageError};
use crc32fast::Hasher;

/// Checksum algorithm used for pages and WAL frames.
pub trait Checksum {
    /// Resets internal state so the instance can be reused.
    fn reset(&mut self);
    /// Folds more bytes into the running checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum computed so far without consuming the instance.
    fn finalize(&self) -> u32;
}

/// CRC32 (Castagnoli) checksum, the algorithm used for every on-disk frame.
#[derive(Default)]
pub struct Crc32Fast {
    inner: Hasher,
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Salted page checksum: binds the checksum to the page's own id so a page
/// copied to the wrong offset fails verification even if its bytes are
/// otherwise intact.
pub fn page_checksum(page_id: u64, salt: u64, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&page_id.to_le_bytes());
    hasher.update(&salt.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Identifies a fixed-size page within a single file.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

/// Sentinel meaning "no page" (used for chain terminators and null links).
pub const INVALID_PAGE: PageId = PageId(u64::MAX);

/// Monotonically increasing log sequence number assigned to each WAL frame.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Lsn(pub u64);

/// Commit timestamp / transaction snapshot id. `0` is reserved to mean
/// "visible forever" on the `end` side of a version range.
pub type CommitId = u64;

/// Sentinel commit id meaning unbounded visibility.
pub const COMMIT_MAX: CommitId = 0;

/// Opaque handle identifying an in-flight transaction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TxnId(pub u64);

/// Catalog id of a table (node table or relationship table).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TableId(pub u32);

/// Closed set of physical column types the engine can store, per the data
/// model's `[Column]` definition.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum PhysicalType {
    /// Single-byte boolean (0 = false, nonzero = true).
    Bool = 0,
    /// 8-bit signed integer.
    Int8 = 1,
    /// 16-bit signed integer.
    Int16 = 2,
    /// 32-bit signed integer.
    Int32 = 3,
    /// 64-bit signed integer.
    Int64 = 4,
    /// 8-bit unsigned integer.
    UInt8 = 5,
    /// 16-bit unsigned integer.
    UInt16 = 6,
    /// 32-bit unsigned integer.
    UInt32 = 7,
    /// 64-bit unsigned integer.
    UInt64 = 8,
    /// 128-bit signed integer.
    Int128 = 9,
    /// 32-bit IEEE-754 float.
    Float32 = 10,
    /// 64-bit IEEE-754 float.
    Float64 = 11,
    /// Days since the Unix epoch.
    Date = 12,
    /// Microseconds since the Unix epoch.
    Timestamp = 13,
    /// Calendar interval: months, days, and microseconds, kept separate
    /// because they don't collapse into a fixed number of days (a month
    /// is 28-31 days).
    Interval = 14,
    /// UTF-8 string, inline up to a threshold then spilled to an overflow
    /// chain.
    String = 15,
    /// Opaque byte blob, same storage strategy as `String`.
    Blob = 16,
    /// A list of fixed length, every element sharing one element type.
    FixedList = 17,
    /// A list of variable length, every element sharing one element type.
    VarList = 18,
    /// A fixed, named set of heterogeneously-typed fields.
    Struct = 19,
    /// A key/value association, stored as `VarList<Struct<key, value>>`.
    Map = 20,
    /// Internal row identifier: a table id plus the row's offset within it.
    InternalId = 21,
    /// 64-bit internal node identifier (a `NodeId`'s numeric component).
    NodeId = 22,
}

impl PhysicalType {
    /// Fixed width in bytes for in-chunk storage, or `None` for
    /// variable-length/composite types that store an inline/overflow
    /// descriptor or a nested value sequence instead.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            PhysicalType::Bool | PhysicalType::Int8 | PhysicalType::UInt8 => Some(1),
            PhysicalType::Int16 | PhysicalType::UInt16 => Some(2),
            PhysicalType::Int32 | PhysicalType::UInt32 | PhysicalType::Float32 | PhysicalType::Date => Some(4),
            PhysicalType::Int64
            | PhysicalType::UInt64
            | PhysicalType::Float64
            | PhysicalType::Timestamp
            | PhysicalType::NodeId => Some(8),
            PhysicalType::InternalId => Some(12),
            PhysicalType::Int128 | PhysicalType::Interval => Some(16),
            PhysicalType::String
            | PhysicalType::Blob
            | PhysicalType::FixedList
            | PhysicalType::VarList
            | PhysicalType::Struct
            | PhysicalType::Map => None,
        }
    }

    /// Decodes the on-disk tag byte back into a `PhysicalType`.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(PhysicalType::Bool),
            1 => Ok(PhysicalType::Int8),
            2 => Ok(PhysicalType::Int16),
            3 => Ok(PhysicalType::Int32),
            4 => Ok(PhysicalType::Int64),
            5 => Ok(PhysicalType::UInt8),
            6 => Ok(PhysicalType::UInt16),
            7 => Ok(PhysicalType::UInt32),
            8 => Ok(PhysicalType::UInt64),
            9 => Ok(PhysicalType::Int128),
            10 => Ok(PhysicalType::Float32),
            11 => Ok(PhysicalType::Float64),
            12 => Ok(PhysicalType::Date),
            13 => Ok(PhysicalType::Timestamp),
            14 => Ok(PhysicalType::Interval),
            15 => Ok(PhysicalType::String),
            16 => Ok(PhysicalType::Blob),
            17 => Ok(PhysicalType::FixedList),
            18 => Ok(PhysicalType::VarList),
            19 => Ok(PhysicalType::Struct),
            20 => Ok(PhysicalType::Map),
            21 => Ok(PhysicalType::InternalId),
            22 => Ok(PhysicalType::NodeId),
            other => Err(StorageError::CorruptionError(format!(
                "unknown physical type tag {other}"
            ))),
        }
    }
}

/// Relationship-table multiplicity, mirrored from the original engine's
/// `rel_direction` enumeration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum RelMultiplicity {
    /// No uniqueness constraint on either end.
    ManyMany,
    /// At most one relationship per source node.
    OneMany,
    /// At most one relationship per destination node.
    ManyOne,
    /// At most one relationship in either direction.
    OneOne,
}

/// Whether a table holds nodes or relationships.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum TableKind {
    /// A node table.
    Node,
    /// A relationship table.
    Rel,
}
