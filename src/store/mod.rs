//! Persistence Layer
//!
//! Owns everything that touches the data directory.
//!
//! ## Core Concepts
//! - **Locking**: `LockManager` hands out one exclusive, timeout-bounded lock per category.
//! - **Versioning**: a `VersionToken` is the SHA-256 of the persisted bytes, derived on demand.
//! - **Backups**: `FileStore` snapshots the current file into the backup area before every overwrite.
//! - **Publishing**: `ArtifactPublisher` renders the gzip ring that storage nodes read.

pub mod file;
pub mod lock;
pub mod publisher;
pub mod version;
