//! Paged storage: buffer manager, shadow-page overlay, and write-ahead log.

pub mod buffer;
pub mod frame;
pub mod shadow;
pub mod wal;

pub use buffer::{BufferManager, PageMut, PageRef, ReadPolicy};
pub use frame::{Frame, FrameState};
pub use shadow::ShadowFile;
pub use wal::{Wal, WalRecord, WalRecordKind};

/// Default page size, in bytes, for newly created databases.
pub const DEFAULT_PAGE_SIZE: usize = 8192;
