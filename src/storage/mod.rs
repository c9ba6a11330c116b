//! Columnar table storage: typed columns, node/relationship tables, the
//! catalog, and the per-transaction write overlay merged at commit.

pub mod column;
pub mod local;
pub mod table;

pub use column::{ChunkStats, Column, ColumnChunk, CompressionMetadata, Value, NODE_GROUP_SIZE};
pub use local::LocalStorage;
pub use table::{detach_delete, Catalog, PropertyDef, Table, TableSchema, TableVerifyResult};
