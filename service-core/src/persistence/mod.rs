//! Persistence gateway contract.
//!
//! Stores never talk to a database directly. They read and write opaque
//! byte values under string keys through [`PersistenceGateway`], which
//! attaches a version to every record. Versions are what the stores use to
//! serialise concurrent mutations of a single key without a global lock.

mod memory;

pub use memory::MemoryGateway;

use async_trait::async_trait;

use crate::error::StorageError;

/// A stored value together with the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub value: Vec<u8>,
}

/// A single write inside a [`PersistenceGateway::transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        key: String,
        value: Vec<u8>,
    },
    /// Write only if the key is currently at `expected_version`
    /// (`None` requires the key to be absent).
    CompareAndSet {
        key: String,
        expected_version: Option<u64>,
        value: Vec<u8>,
    },
    Delete {
        key: String,
    },
    /// Delete only if the key is currently at `expected_version`.
    CompareAndDelete {
        key: String,
        expected_version: u64,
    },
}

impl WriteOp {
    pub fn key(&self) -> &str {
        match self {
            WriteOp::Put { key, .. }
            | WriteOp::CompareAndSet { key, .. }
            | WriteOp::Delete { key }
            | WriteOp::CompareAndDelete { key, .. } => key,
        }
    }
}

/// Result of a transaction whose storage layer was reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed,
    /// A conditional write's precondition failed; nothing was applied.
    Aborted,
}

/// Durable key-indexed record storage with transactional read-modify-write.
///
/// Implementations must apply a transaction's writes all-or-nothing and
/// must never reuse a version number for a key, even across delete and
/// re-insert.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StorageError>;

    /// Unconditional write. Returns the new version.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, StorageError>;

    /// Conditional write. Fails with [`StorageError::Conflict`] when the
    /// current version differs from `expected_version`.
    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: Vec<u8>,
    ) -> Result<u64, StorageError>;

    /// Idempotent removal.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All records whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StorageError>;

    /// Apply `ops` atomically. Unmet preconditions yield
    /// [`TxnOutcome::Aborted`]; storage failures are returned as errors.
    async fn transaction(&self, ops: Vec<WriteOp>) -> Result<TxnOutcome, StorageError>;

    async fn health_check(&self) -> Result<(), StorageError>;
}
