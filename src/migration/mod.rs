//! Token migration between storage nodes.
//!
//! When the placement table changes, every node that gains tokens pulls
//! their objects from a current replica:
//!
//! ```text
//!          destination (gains tokens)                 source (current replica)
//!   ┌────────────────────────────────┐        ┌────────────────────────────────┐
//!   │ MigrationCoordinator           │        │ MigrationCoordinator           │
//!   │   └─ MigrationExecutor ────────┼─ filter sets ─►  MigrationClient         │
//!   │        (group, source)  ◄──────┼─ delta sets ─┤   (stream)               │
//!   │                         ───────┼─ get second ─►                          │
//!   │                         ◄──────┼─ delta sets + forwarded writes          │
//!   └────────────────────────────────┘        └────────────────────────────────┘
//! ```
//!
//! Executors and clients are driven by explicit state machines whose
//! transition functions ([`executor::step`], [`client::step`]) are pure;
//! the surrounding types perform the side effects a transition asks for.

pub mod client;
pub mod coordinator;
pub mod executor;
mod retry;

pub use client::{ClientEffect, ClientEvent, ClientState, MigrationClient};
pub use coordinator::{MigrationAck, MigrationCoordinator, MigrationState};
pub use executor::{
    DeltaOutcome, ExecutorEffect, ExecutorEvent, ExecutorState, MigrationExecutor, RoundReport,
};
pub use retry::{RetryPlan, RetrySet};
