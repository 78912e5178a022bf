//! Per-token read availability.

use parking_lot::RwLock;
use std::collections::BTreeSet;

use super::{OwnershipRecord, PlacementTable};
use crate::types::{NodeId, Token};

/// Boolean read-availability flag for every placement token.
///
/// A token is available only when this node holds a replica of it and no
/// resync is pending. The table is rebuilt wholesale from placement and
/// ownership so it is never partially stale; individual tokens are flipped
/// only by the coordinator as migration progresses.
#[derive(Debug)]
pub struct TokenAvailabilityTable {
    flags: RwLock<Vec<bool>>,
}

impl TokenAvailabilityTable {
    /// Create a table of `token_count` unavailable tokens.
    pub fn new(token_count: usize) -> Self {
        Self {
            flags: RwLock::new(vec![false; token_count]),
        }
    }

    /// Recompute every flag from the placement table and the ledger record.
    pub fn rebuild(&self, placement: &PlacementTable, local: NodeId, record: &OwnershipRecord) {
        let mut flags = self.flags.write();
        for (i, flag) in flags.iter_mut().enumerate() {
            let token = Token(i as u32);
            *flag = placement.is_replica(token, local) && !record.pending_resync.contains(&token);
        }
    }

    /// Whether reads for `token` may be served locally.
    pub fn is_available(&self, token: Token) -> bool {
        self.flags
            .read()
            .get(token.0 as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Mark tokens unavailable pending resync.
    pub fn mark_unavailable(&self, tokens: impl IntoIterator<Item = Token>) {
        self.set(tokens, false);
    }

    /// Mark tokens fully available.
    pub fn mark_available(&self, tokens: impl IntoIterator<Item = Token>) {
        self.set(tokens, true);
    }

    fn set(&self, tokens: impl IntoIterator<Item = Token>, value: bool) {
        let mut flags = self.flags.write();
        for token in tokens {
            if let Some(flag) = flags.get_mut(token.0 as usize) {
                *flag = value;
            }
        }
    }

    /// Tokens `local` holds a replica of that are not yet available.
    pub fn unavailable_owned(&self, placement: &PlacementTable, local: NodeId) -> BTreeSet<Token> {
        let flags = self.flags.read();
        placement
            .tokens_owned_by(local)
            .into_iter()
            .filter(|t| !flags.get(t.0 as usize).copied().unwrap_or(false))
            .collect()
    }

    /// Number of available tokens.
    pub fn available_count(&self) -> usize {
        self.flags.read().iter().filter(|f| **f).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placement() -> PlacementTable {
        PlacementTable::new(1)
            .with_replicas(Token(0), vec![1, 2])
            .with_replicas(Token(1), vec![2, 3])
            .with_replicas(Token(2), vec![3, 1])
    }

    #[test]
    fn test_rebuild_from_placement_and_ledger() {
        let table = TokenAvailabilityTable::new(4);
        let record = OwnershipRecord {
            owned: [Token(0), Token(2)].into_iter().collect(),
            pending_resync: [Token(2)].into_iter().collect(),
        };
        table.rebuild(&placement(), 1, &record);

        assert!(table.is_available(Token(0)));
        assert!(!table.is_available(Token(1)));
        assert!(!table.is_available(Token(2)));
        assert!(!table.is_available(Token(3)));
        assert_eq!(
            table.unavailable_owned(&placement(), 1),
            BTreeSet::from([Token(2)])
        );
    }

    #[test]
    fn test_mark_flags_and_out_of_range() {
        let table = TokenAvailabilityTable::new(2);
        table.mark_available([Token(0), Token(7)]);
        assert!(table.is_available(Token(0)));
        assert!(!table.is_available(Token(7)));
        assert_eq!(table.available_count(), 1);

        table.mark_unavailable([Token(0)]);
        assert_eq!(table.available_count(), 0);
    }
}
