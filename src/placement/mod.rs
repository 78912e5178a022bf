//! Placement inputs consumed by the migration engine.
//!
//! The placement algorithm itself lives elsewhere. This module only holds its
//! output (ordered replica lists per token), the per-token read availability
//! derived from it, and the contract of the on-disk ownership ledger.

mod availability;
mod ledger;

pub use availability::TokenAvailabilityTable;
pub use ledger::{InMemoryOwnershipLedger, OwnershipLedger, OwnershipRecord};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{NodeId, PlacementVersion, Token};

/// Ordered replica assignment for every token at one placement version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementTable {
    version: PlacementVersion,
    replicas: BTreeMap<Token, Vec<NodeId>>,
}

impl PlacementTable {
    /// Create an empty table at `version`.
    pub fn new(version: PlacementVersion) -> Self {
        Self {
            version,
            replicas: BTreeMap::new(),
        }
    }

    /// Builder-style assignment of a token's replica list.
    pub fn with_replicas(mut self, token: Token, nodes: Vec<NodeId>) -> Self {
        self.set_replicas(token, nodes);
        self
    }

    /// Assign a token's replica list, first entries being primaries.
    pub fn set_replicas(&mut self, token: Token, nodes: Vec<NodeId>) {
        self.replicas.insert(token, nodes);
    }

    pub fn version(&self) -> PlacementVersion {
        self.version
    }

    /// Ordered replicas for a token; empty if the token is unassigned.
    pub fn replicas(&self, token: Token) -> &[NodeId] {
        self.replicas.get(&token).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `node` holds a replica of `token`.
    pub fn is_replica(&self, token: Token, node: NodeId) -> bool {
        self.replicas(token).contains(&node)
    }

    /// All tokens `node` holds a replica of.
    pub fn tokens_owned_by(&self, node: NodeId) -> BTreeSet<Token> {
        self.replicas
            .iter()
            .filter(|(_, nodes)| nodes.contains(&node))
            .map(|(token, _)| *token)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_lookup() {
        let table = PlacementTable::new(3)
            .with_replicas(Token(0), vec![1, 2, 3])
            .with_replicas(Token(1), vec![2, 3]);

        assert_eq!(table.version(), 3);
        assert_eq!(table.replicas(Token(0)), &[1, 2, 3]);
        assert!(table.replicas(Token(9)).is_empty());
        assert!(table.is_replica(Token(1), 3));
        assert!(!table.is_replica(Token(1), 1));
        assert_eq!(
            table.tokens_owned_by(2),
            BTreeSet::from([Token(0), Token(1)])
        );
    }
}
