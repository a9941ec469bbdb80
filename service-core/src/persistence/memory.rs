//! In-memory [`PersistenceGateway`] used by tests and embedded deployments.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::{PersistenceGateway, TxnOutcome, Versioned, WriteOp};
use crate::error::StorageError;

/// Gateway backed by a `BTreeMap`. Clones share the same data.
///
/// Versions come from one counter for the whole map, so a key that is
/// deleted and written again never returns to an earlier version.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    records: Arc<RwLock<BTreeMap<String, Versioned>>>,
    last_version: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with [`StorageError::Unavailable`]
    /// until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_version(&self) -> u64 {
        self.last_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn ensure_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "memory gateway is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Versioned>>, StorageError> {
        self.ensure_available()?;
        self.records
            .read()
            .map_err(|_| StorageError::Unavailable("memory gateway lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Versioned>>, StorageError> {
        self.ensure_available()?;
        self.records
            .write()
            .map_err(|_| StorageError::Unavailable("memory gateway lock poisoned".to_string()))
    }
}

fn precondition_holds(records: &BTreeMap<String, Versioned>, op: &WriteOp) -> bool {
    match op {
        WriteOp::Put { .. } | WriteOp::Delete { .. } => true,
        WriteOp::CompareAndSet {
            key,
            expected_version,
            ..
        } => records.get(key).map(|r| r.version) == *expected_version,
        WriteOp::CompareAndDelete {
            key,
            expected_version,
        } => records.get(key).map(|r| r.version) == Some(*expected_version),
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StorageError> {
        Ok(self.read()?.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, StorageError> {
        let mut records = self.write()?;
        let version = self.next_version();
        records.insert(key.to_string(), Versioned { version, value });
        Ok(version)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: Vec<u8>,
    ) -> Result<u64, StorageError> {
        let mut records = self.write()?;
        if records.get(key).map(|r| r.version) != expected_version {
            return Err(StorageError::Conflict {
                key: key.to_string(),
            });
        }
        let version = self.next_version();
        records.insert(key.to_string(), Versioned { version, value });
        Ok(version)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.write()?.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StorageError> {
        let records = self.read()?;
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect())
    }

    async fn transaction(&self, ops: Vec<WriteOp>) -> Result<TxnOutcome, StorageError> {
        let mut records = self.write()?;

        if !ops.iter().all(|op| precondition_holds(&records, op)) {
            return Ok(TxnOutcome::Aborted);
        }

        for op in ops {
            match op {
                WriteOp::Put { key, value } | WriteOp::CompareAndSet { key, value, .. } => {
                    let version = self.next_version();
                    records.insert(key, Versioned { version, value });
                }
                WriteOp::Delete { key } | WriteOp::CompareAndDelete { key, .. } => {
                    records.remove(&key);
                }
            }
        }

        Ok(TxnOutcome::Committed)
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.read().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_put_and_get() {
        let gateway = MemoryGateway::new();
        let version = gateway.put("a", b"1".to_vec()).await.unwrap();

        let record = gateway.get("a").await.unwrap().unwrap();
        assert_eq!(record.version, version);
        assert_eq!(record.value, b"1".to_vec());
        assert!(gateway.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_set_insert_if_absent() {
        let gateway = MemoryGateway::new();
        assert_ok!(gateway.compare_and_set("a", None, b"1".to_vec()).await);

        let err = gateway
            .compare_and_set("a", None, b"2".to_vec())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StorageError::Conflict {
                key: "a".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_compare_and_set_requires_current_version() {
        let gateway = MemoryGateway::new();
        let v1 = gateway.put("a", b"1".to_vec()).await.unwrap();
        let v2 = gateway
            .compare_and_set("a", Some(v1), b"2".to_vec())
            .await
            .unwrap();
        assert!(v2 > v1);

        assert_err!(gateway.compare_and_set("a", Some(v1), b"3".to_vec()).await);
        assert_eq!(gateway.get("a").await.unwrap().unwrap().value, b"2".to_vec());
    }

    #[tokio::test]
    async fn test_versions_not_reused_after_delete() {
        let gateway = MemoryGateway::new();
        let v1 = gateway.put("a", b"1".to_vec()).await.unwrap();
        gateway.delete("a").await.unwrap();
        let v2 = gateway.put("a", b"1".to_vec()).await.unwrap();

        assert_ne!(v1, v2);
        assert_err!(gateway.compare_and_set("a", Some(v1), b"x".to_vec()).await);
    }

    #[tokio::test]
    async fn test_scan_prefix_is_bounded() {
        let gateway = MemoryGateway::new();
        gateway.put("org_member:1:a", vec![]).await.unwrap();
        gateway.put("org_member:1:b", vec![]).await.unwrap();
        gateway.put("org_member:10:a", vec![]).await.unwrap();
        gateway.put("org_membership", vec![]).await.unwrap();

        let keys: Vec<String> = gateway
            .scan_prefix("org_member:1:")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["org_member:1:a", "org_member:1:b"]);
    }

    #[tokio::test]
    async fn test_transaction_is_all_or_nothing() {
        let gateway = MemoryGateway::new();
        let v1 = gateway.put("row", b"pending".to_vec()).await.unwrap();
        gateway.put("row", b"accepted".to_vec()).await.unwrap();

        let outcome = gateway
            .transaction(vec![
                WriteOp::Put {
                    key: "member".to_string(),
                    value: b"m".to_vec(),
                },
                WriteOp::CompareAndSet {
                    key: "row".to_string(),
                    expected_version: Some(v1),
                    value: b"declined".to_vec(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(outcome, TxnOutcome::Aborted);
        assert!(gateway.get("member").await.unwrap().is_none());
        assert_eq!(
            gateway.get("row").await.unwrap().unwrap().value,
            b"accepted".to_vec()
        );
    }

    #[tokio::test]
    async fn test_transaction_commits_mixed_ops() {
        let gateway = MemoryGateway::new();
        let v = gateway.put("index", b"id".to_vec()).await.unwrap();

        let outcome = gateway
            .transaction(vec![
                WriteOp::CompareAndDelete {
                    key: "index".to_string(),
                    expected_version: v,
                },
                WriteOp::CompareAndSet {
                    key: "fresh".to_string(),
                    expected_version: None,
                    value: b"x".to_vec(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(outcome, TxnOutcome::Committed);
        assert!(gateway.get("index").await.unwrap().is_none());
        assert!(gateway.get("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unavailable_gateway_fails_every_call() {
        let gateway = MemoryGateway::new();
        gateway.set_unavailable(true);

        assert!(matches!(
            gateway.get("a").await,
            Err(StorageError::Unavailable(_))
        ));
        assert_err!(gateway.health_check().await);

        gateway.set_unavailable(false);
        assert_ok!(gateway.health_check().await);
    }

    #[tokio::test]
    async fn test_clone_shares_data() {
        let gateway = MemoryGateway::new();
        let clone = gateway.clone();
        gateway.put("a", vec![1]).await.unwrap();
        assert_eq!(clone.len(), 1);
    }
}
