//! The client-storage capability used for snapshots.

use crate::error::StorageError;

/// Synchronous string key-value storage.
///
/// Implementations report failures (quota, disabled storage, I/O) as
/// `StorageError`; callers in this crate treat every failure as a no-op.
pub trait KeyValueStore: Send + Sync {
    /// Read the value for `key`, or `None` if absent.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write `value` under `key`, overwriting any previous value.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}
