#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use mnemo_kernel_contracts::memory::{MemoryRecord, RecordFilter, RecordId};
use mnemo_kernel_contracts::{ContractViolation, GovernanceError, InternalFailure, Validate};
use parking_lot::RwLock;

use crate::repo::MemoryStoreRepo;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("duplicate key in {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("unbounded delete refused on {table}")]
    UnboundedDelete { table: &'static str },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
}

impl From<StorageError> for GovernanceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DuplicateKey { table, .. } => GovernanceError::Conflict {
                reason: format!("duplicate key in {table}"),
            },
            StorageError::ContractViolation(v) => v.into(),
            other => GovernanceError::internal(InternalFailure::Storage {
                detail: other.to_string(),
            }),
        }
    }
}

const MEMORY_RECORDS_TABLE: &str = "memory_records";

/// Process-local store keyed by record id. Rows carry ciphertext only.
#[derive(Debug, Default)]
pub struct InMemoryMemoryStore {
    rows: RwLock<BTreeMap<RecordId, MemoryRecord>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

impl MemoryStoreRepo for InMemoryMemoryStore {
    fn store(&self, record: MemoryRecord) -> Result<RecordId, StorageError> {
        record.validate()?;
        let mut rows = self.rows.write();
        if rows.contains_key(&record.record_id) {
            return Err(StorageError::DuplicateKey {
                table: MEMORY_RECORDS_TABLE,
                key: record.record_id.to_string(),
            });
        }
        let id = record.record_id.clone();
        rows.insert(id.clone(), record);
        Ok(id)
    }

    /// Ordered by `created_at`, ties broken by record id.
    fn recall(&self, filter: &RecordFilter) -> Result<Vec<MemoryRecord>, StorageError> {
        filter.validate()?;
        let mut out: Vec<MemoryRecord> = self
            .rows
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        Ok(out)
    }

    fn count(&self, filter: &RecordFilter) -> Result<u64, StorageError> {
        filter.validate()?;
        Ok(self.rows.read().values().filter(|r| filter.matches(r)).count() as u64)
    }

    fn delete(&self, filter: &RecordFilter) -> Result<Vec<RecordId>, StorageError> {
        filter.validate()?;
        if filter.subject.is_none() && filter.record_ids.is_none() {
            return Err(StorageError::UnboundedDelete {
                table: MEMORY_RECORDS_TABLE,
            });
        }
        let mut rows = self.rows.write();
        let doomed: Vec<RecordId> = rows
            .values()
            .filter(|r| filter.matches(r))
            .map(|r| r.record_id.clone())
            .collect();
        for id in &doomed {
            rows.remove(id);
        }
        Ok(doomed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_kernel_contracts::envelope::{
        EncryptedEnvelope, AUTH_TAG_LEN, ENCRYPTION_VERSION_V1, IV_LEN,
    };
    use mnemo_kernel_contracts::memory::{Attributes, MemoryKind};
    use mnemo_kernel_contracts::tier::{DisclosureTier, SubjectPseudonym};
    use mnemo_kernel_contracts::MonotonicTimeNs;

    fn row(id: &str, at: u64) -> MemoryRecord {
        MemoryRecord {
            record_id: RecordId::new(id).unwrap(),
            subject: SubjectPseudonym::from_hex("a".repeat(64)).unwrap(),
            tier: DisclosureTier::Personal,
            kind: MemoryKind::new("note").unwrap(),
            envelope: EncryptedEnvelope {
                ciphertext: vec![7; 4],
                auth_tag: vec![0; AUTH_TAG_LEN],
                iv: vec![0; IV_LEN],
                wrapped_data_key: vec![1; 60],
                master_key_id: "mk-1".to_string(),
                encryption_version: ENCRYPTION_VERSION_V1,
            },
            attributes: Attributes::new(),
            created_at: MonotonicTimeNs(at),
        }
    }

    #[test]
    fn at_store_01_duplicate_record_id_is_refused() {
        let s = InMemoryMemoryStore::new();
        s.store(row("rec_1", 1)).unwrap();
        assert_eq!(
            s.store(row("rec_1", 2)),
            Err(StorageError::DuplicateKey {
                table: MEMORY_RECORDS_TABLE,
                key: "rec_1".to_string()
            })
        );
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn at_store_02_recall_is_ordered_by_creation_time() {
        let s = InMemoryMemoryStore::new();
        s.store(row("rec_b", 20)).unwrap();
        s.store(row("rec_a", 10)).unwrap();
        s.store(row("rec_c", 10)).unwrap();
        let ids: Vec<String> = s
            .recall(&RecordFilter::default())
            .unwrap()
            .into_iter()
            .map(|r| r.record_id.to_string())
            .collect();
        assert_eq!(ids, vec!["rec_a", "rec_c", "rec_b"]);
    }

    #[test]
    fn at_store_03_delete_without_subject_or_ids_is_refused() {
        let s = InMemoryMemoryStore::new();
        s.store(row("rec_1", 1)).unwrap();
        assert!(matches!(
            s.delete(&RecordFilter::for_tier(DisclosureTier::Personal)),
            Err(StorageError::UnboundedDelete { .. })
        ));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn storage_errors_map_to_public_errors_without_keys() {
        let err: GovernanceError = StorageError::DuplicateKey {
            table: MEMORY_RECORDS_TABLE,
            key: "rec_secret".to_string(),
        }
        .into();
        assert!(matches!(err, GovernanceError::Conflict { .. }));
        assert!(!err.to_string().contains("rec_secret"));
    }
}
