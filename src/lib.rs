//! Token migration engine for a replicated object store.
//!
//! When the cluster's placement table (DLT) changes, nodes that gain tokens
//! pull the objects of those tokens from a current replica while the store
//! keeps serving reads and writes. This crate implements that data movement:
//!
//! - **MigrationCoordinator**: one per node; sequences token groups through
//!   two protocol rounds, retries failed tokens against other replicas and
//!   answers the orchestrator
//! - **MigrationExecutor**: destination side of one (token group, source) stream
//! - **MigrationClient**: source side of one stream, including live-write
//!   forwarding during cutover
//! - **TokenAvailabilityTable**: which tokens this node may serve reads for
//!
//! # Example
//!
//! ```rust,no_run
//! use dlt_migration::{
//!     InMemoryObjectStore, InMemoryOwnershipLedger, MigrationConfig, MigrationCoordinator,
//!     NoOpTransport, PlacementTable, Token,
//! };
//! use std::collections::{BTreeMap, BTreeSet};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MigrationConfig::new().with_token_bit_width(8);
//!     let placement = PlacementTable::new(1).with_replicas(Token(0), vec![2, 3]);
//!
//!     let coordinator = Arc::new(MigrationCoordinator::new(
//!         1,
//!         config,
//!         placement,
//!         Arc::new(InMemoryObjectStore::new(8)),
//!         Arc::new(NoOpTransport),
//!         Arc::new(InMemoryOwnershipLedger::new()),
//!     )?);
//!
//!     // Pull token 0 from node 2 for placement version 2.
//!     let sources = BTreeMap::from([(2, BTreeSet::from([Token(0)]))]);
//!     let ack = coordinator.start_migration(2, sources).await?;
//!     ack.await??;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 Orchestrator (external)                   │
//! │  StartMigration · AbortMigration · PlacementClosed        │
//! └──────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                 MigrationCoordinator                      │
//! │  state: IDLE → IN_PROGRESS → (ABORTED) → IDLE             │
//! │  executors (RwLock) · clients (Mutex) · retry set         │
//! └──────────────────────────────────────────────────────────┘
//!        │                     │                      │
//!        ▼                     ▼                      ▼
//! ┌─────────────┐      ┌──────────────┐      ┌───────────────┐
//! │  Executors  │◄────►│  Transport   │◄────►│    Clients    │
//! │ (dest side) │      │ (async send) │      │ (source side) │
//! └─────────────┘      └──────────────┘      └───────────────┘
//!        │                                            │
//!        ▼                                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │        ObjectStore · OwnershipLedger (external)           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Objects** merge last-writer-wins on modification time; reference
//!   counts never decrease. Re-applied deltas are no-ops.
//! - **Cutover**: once a source has streamed its second delta it relays
//!   every live write for the migrated tokens until the placement closes.
//! - **Reads** for incoming tokens stay unavailable until both rounds finish.

pub mod config;
pub mod error;
pub mod metrics;
pub mod migration;
pub mod placement;
pub mod protocol;
pub mod store;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{DltClosePolicy, MigrationConfig};
pub use error::{Error, ErrorKind, Result};
pub use types::{
    NodeId, ObjectId, ObjectMeta, ObjectRecord, PlacementVersion, StreamId, Token, TokenGroup,
    WriteRequest,
};

// Re-export migration types
pub use migration::{
    ClientState, ExecutorState, MigrationAck, MigrationClient, MigrationCoordinator,
    MigrationExecutor, MigrationState, RoundReport,
};

// Re-export placement and storage contracts
pub use placement::{
    InMemoryOwnershipLedger, OwnershipLedger, OwnershipRecord, PlacementTable,
    TokenAvailabilityTable,
};
pub use store::{InMemoryObjectStore, MergeOutcome, MetadataSnapshot, ObjectStore};

// Re-export protocol types
pub use protocol::{ControlMessage, MigrationMessage, MigrationTransport, NoOpTransport};

// Re-export metrics types
pub use metrics::{Counter, Gauge, LabeledCounter, MigrationMetrics, MigrationMetricsSnapshot};

// Re-export testing types
pub use testing::{LoopbackNetwork, RecordingTransport, TestCluster, TestNode};
