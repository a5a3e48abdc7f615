#![forbid(unsafe_code)]

use mnemo_kernel_contracts::memory::{MemoryRecord, RecordFilter, RecordId};

use crate::memory_store::StorageError;

/// The narrow storage contract the governance core consumes. Records arrive
/// already encrypted; implementations never see plaintext.
pub trait MemoryStoreRepo: Send + Sync {
    fn store(&self, record: MemoryRecord) -> Result<RecordId, StorageError>;
    fn recall(&self, filter: &RecordFilter) -> Result<Vec<MemoryRecord>, StorageError>;
    fn count(&self, filter: &RecordFilter) -> Result<u64, StorageError>;
    fn delete(&self, filter: &RecordFilter) -> Result<Vec<RecordId>, StorageError>;
}
