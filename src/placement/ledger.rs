//! Ownership bookkeeping persisted outside the migration engine.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::Result;
use crate::types::Token;

/// What this node owns and what still needs a resync after restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    /// Tokens this node holds data for.
    pub owned: BTreeSet<Token>,
    /// Owned tokens whose data is incomplete.
    pub pending_resync: BTreeSet<Token>,
}

/// Read/write contract of the on-disk ownership ledger (superblock).
#[async_trait::async_trait]
pub trait OwnershipLedger: Send + Sync + std::fmt::Debug {
    /// Load the last persisted record.
    async fn load(&self) -> Result<OwnershipRecord>;

    /// Durably replace the record.
    async fn persist(&self, record: &OwnershipRecord) -> Result<()>;
}

/// In-memory ledger (for testing and embedding).
#[derive(Debug, Default)]
pub struct InMemoryOwnershipLedger {
    record: Mutex<OwnershipRecord>,
}

impl InMemoryOwnershipLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ledger holding `record`.
    pub fn with_record(record: OwnershipRecord) -> Self {
        Self {
            record: Mutex::new(record),
        }
    }

    /// Current contents.
    pub fn record(&self) -> OwnershipRecord {
        self.record.lock().clone()
    }
}

#[async_trait::async_trait]
impl OwnershipLedger for InMemoryOwnershipLedger {
    async fn load(&self) -> Result<OwnershipRecord> {
        Ok(self.record.lock().clone())
    }

    async fn persist(&self, record: &OwnershipRecord) -> Result<()> {
        *self.record.lock() = record.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_ledger_round_trip() {
        let ledger = InMemoryOwnershipLedger::new();
        assert_eq!(ledger.load().await.unwrap(), OwnershipRecord::default());

        let record = OwnershipRecord {
            owned: [Token(1), Token(2)].into_iter().collect(),
            pending_resync: [Token(2)].into_iter().collect(),
        };
        ledger.persist(&record).await.unwrap();
        assert_eq!(ledger.record(), record);
    }
}
