//! Persistence: client storage backends and session snapshots.

pub mod file;
pub mod memory;
pub mod snapshot;
pub mod traits;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use snapshot::{PersistedSnapshot, PersistenceStore, SCHEMA_VERSION};
pub use traits::KeyValueStore;
