//! Purpose: Define the stable public API boundary for Trunkrow.
//! Exports: Dataset storage roots plus the core stream, view, shuffle,
//! and sharing types needed by embedding applications.
//! Role: Public, additive-only surface over the internal storage modules.
//! Invariants: End-of-stream reads return `Ok(None)`, never an error.

mod store;

pub use crate::backend::{DiskBackend, HttpBackend};
pub use crate::core::backend::{OpenMode, StorageBackend, StorageFile};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::manifest::Manifest;
pub use crate::core::record::RecordStore;
pub use crate::core::share::{ShareHandle, ShareProxy, ShareRelay, ShareRequest, ShareResponse};
pub use crate::core::shuffle::{PoolShuffle, WindowShuffle};
pub use crate::core::source::RecordSource;
pub use crate::core::trunk::{StreamMode, TrunkOptions, TrunkStream, Whence};
pub use crate::core::view::RecordView;
pub use store::RowStorage;
