//! Testing utilities for the migration engine.
//!
//! - [`RecordingTransport`] captures outbound messages for unit tests.
//! - [`LoopbackNetwork`] delivers messages between in-process coordinators
//!   and can make nodes unreachable or silent.
//! - [`TestCluster`] wires a set of nodes, stores and ledgers together.
//!
//! # Example
//!
//! ```rust,ignore
//! let cluster = TestCluster::new(&[1, 2, 3], MigrationConfig::new(), placement);
//! cluster.node(2).store.put(record);
//! let ack = cluster.node(1).coordinator.start_migration(2, sources).await?;
//! cluster.network.settle().await;
//! ```

#[cfg(test)]
mod scenarios;

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::MigrationConfig;
use crate::error::{Error, Result};
use crate::migration::MigrationCoordinator;
use crate::placement::{InMemoryOwnershipLedger, PlacementTable};
use crate::protocol::{MigrationMessage, MigrationTransport};
use crate::store::InMemoryObjectStore;
use crate::types::{NodeId, ObjectId, ObjectRecord, PlacementVersion, WriteRequest};

/// Transport that records every message instead of delivering it.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(NodeId, MigrationMessage)>>,
    unreachable: RwLock<HashSet<NodeId>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sent so far, in order.
    pub fn sent(&self) -> Vec<(NodeId, MigrationMessage)> {
        self.sent.lock().clone()
    }

    /// Drain the recorded messages.
    pub fn take(&self) -> Vec<(NodeId, MigrationMessage)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Make sends to `node` fail.
    pub fn set_unreachable(&self, node: NodeId, unreachable: bool) {
        let mut set = self.unreachable.write();
        if unreachable {
            set.insert(node);
        } else {
            set.remove(&node);
        }
    }
}

#[async_trait::async_trait]
impl MigrationTransport for RecordingTransport {
    async fn send(&self, to: NodeId, msg: MigrationMessage) -> Result<()> {
        if self.unreachable.read().contains(&to) {
            return Err(Error::SourceUnreachable {
                node: to,
                reason: "unreachable".to_string(),
            });
        }
        self.sent.lock().push((to, msg));
        Ok(())
    }
}

/// One message handed to the loopback network.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: NodeId,
    pub to: NodeId,
    pub msg: MigrationMessage,
}

#[derive(Debug, Default)]
struct NetworkInner {
    inboxes: RwLock<HashMap<NodeId, mpsc::UnboundedSender<(NodeId, MigrationMessage)>>>,
    unreachable: RwLock<HashSet<NodeId>>,
    silent: RwLock<HashSet<NodeId>>,
    holds: RwLock<HashSet<(NodeId, &'static str)>>,
    held: Mutex<Vec<Delivery>>,
    log: Mutex<Vec<Delivery>>,
    in_flight: AtomicUsize,
}

/// In-process network connecting coordinators.
///
/// Each attached node gets an inbox drained by its own delivery task, so
/// messages between a pair of nodes arrive in send order.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outbound transport for `node`.
    pub fn transport(&self, node: NodeId) -> Arc<dyn MigrationTransport> {
        Arc::new(LoopbackTransport {
            from: node,
            inner: self.inner.clone(),
        })
    }

    /// Start delivering messages addressed to `coordinator`'s node.
    pub fn attach(&self, coordinator: Arc<MigrationCoordinator>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let node = coordinator.local_node();
        self.inner.inboxes.write().insert(node, tx);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some((from, msg)) = rx.recv().await {
                if let Err(e) = coordinator.handle_message(from, msg).await {
                    tracing::warn!(node, from, error = %e, "Message handling failed");
                }
                inner.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        });
    }

    /// Make every send to `node` fail, as if it were down.
    pub fn set_unreachable(&self, node: NodeId, unreachable: bool) {
        toggle(&self.inner.unreachable, node, unreachable);
    }

    /// Accept but silently drop every message to `node`.
    pub fn set_silent(&self, node: NodeId, silent: bool) {
        toggle(&self.inner.silent, node, silent);
    }

    /// Park messages of `kind` (see [`MigrationMessage::name`]) addressed to
    /// `node` until [`release`](Self::release) is called.
    pub fn hold(&self, node: NodeId, kind: &'static str) {
        self.inner.holds.write().insert((node, kind));
    }

    /// Lift a hold and deliver the messages it parked, in send order.
    pub fn release(&self, node: NodeId, kind: &'static str) -> Result<()> {
        self.inner.holds.write().remove(&(node, kind));
        let parked: Vec<Delivery> = {
            let mut held = self.inner.held.lock();
            let (parked, kept): (Vec<Delivery>, Vec<Delivery>) = std::mem::take(&mut *held)
                .into_iter()
                .partition(|d| d.to == node && d.msg.name() == kind);
            *held = kept;
            parked
        };
        for d in parked {
            self.inner.deliver(d.from, d.to, d.msg)?;
        }
        Ok(())
    }

    /// Messages parked by holds.
    pub fn held(&self) -> Vec<Delivery> {
        self.inner.held.lock().clone()
    }

    /// Every message delivered (or dropped by silence) so far, in send order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.inner.log.lock().clone()
    }

    /// Messages waiting in inboxes or being handled.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Yield until every inbox is empty and stays empty.
    pub async fn settle(&self) {
        let mut quiet = 0;
        for _ in 0..100_000 {
            tokio::task::yield_now().await;
            if self.in_flight() == 0 {
                quiet += 1;
                if quiet >= 20 {
                    return;
                }
            } else {
                quiet = 0;
            }
        }
        panic!("network did not settle; {} messages in flight", self.in_flight());
    }
}

fn toggle(set: &RwLock<HashSet<NodeId>>, node: NodeId, on: bool) {
    let mut set = set.write();
    if on {
        set.insert(node);
    } else {
        set.remove(&node);
    }
}

#[derive(Debug)]
struct LoopbackTransport {
    from: NodeId,
    inner: Arc<NetworkInner>,
}

#[async_trait::async_trait]
impl MigrationTransport for LoopbackTransport {
    async fn send(&self, to: NodeId, msg: MigrationMessage) -> Result<()> {
        if self.inner.unreachable.read().contains(&to) {
            return Err(Error::SourceUnreachable {
                node: to,
                reason: "node down".to_string(),
            });
        }
        self.inner.log.lock().push(Delivery {
            from: self.from,
            to,
            msg: msg.clone(),
        });
        if self.inner.silent.read().contains(&to) {
            return Ok(());
        }
        if self.inner.holds.read().contains(&(to, msg.name())) {
            self.inner.held.lock().push(Delivery {
                from: self.from,
                to,
                msg,
            });
            return Ok(());
        }
        self.inner.deliver(self.from, to, msg)
    }
}

impl NetworkInner {
    fn deliver(&self, from: NodeId, to: NodeId, msg: MigrationMessage) -> Result<()> {
        let inboxes = self.inboxes.read();
        let Some(inbox) = inboxes.get(&to) else {
            return Err(Error::SourceUnreachable {
                node: to,
                reason: "no such node".to_string(),
            });
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if inbox.send((from, msg)).is_err() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::SourceUnreachable {
                node: to,
                reason: "inbox closed".to_string(),
            });
        }
        Ok(())
    }
}

/// One node of a [`TestCluster`].
#[derive(Debug, Clone)]
pub struct TestNode {
    pub id: NodeId,
    pub coordinator: Arc<MigrationCoordinator>,
    pub store: Arc<InMemoryObjectStore>,
    pub ledger: Arc<InMemoryOwnershipLedger>,
}

impl TestNode {
    /// Apply a live write locally, relaying it to migration destinations
    /// when needed. Returns whether the write was forwarded.
    pub fn write(&self, record: ObjectRecord, request_version: PlacementVersion) -> bool {
        let id: ObjectId = record.id;
        self.store.put(record.clone());
        self.coordinator
            .forward_req_if_needed(&id, request_version, &WriteRequest::local(record))
    }
}

/// A set of in-process nodes sharing one [`LoopbackNetwork`].
#[derive(Debug)]
pub struct TestCluster {
    pub network: LoopbackNetwork,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Create and attach one node per id, all starting from `placement`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(ids: &[NodeId], config: MigrationConfig, placement: PlacementTable) -> Result<Self> {
        let network = LoopbackNetwork::new();
        let mut nodes = Vec::with_capacity(ids.len());
        for &id in ids {
            let store = Arc::new(InMemoryObjectStore::new(config.token_bit_width));
            let ledger = Arc::new(InMemoryOwnershipLedger::new());
            let coordinator = Arc::new(MigrationCoordinator::new(
                id,
                config.clone(),
                placement.clone(),
                store.clone(),
                network.transport(id),
                ledger.clone(),
            )?);
            network.attach(coordinator.clone());
            nodes.push(TestNode {
                id,
                coordinator,
                store,
                ledger,
            });
        }
        Ok(Self { network, nodes })
    }

    /// Node by id. Panics on an unknown id.
    pub fn node(&self, id: NodeId) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .unwrap_or_else(|| panic!("no node {}", id))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Close `placement` on every node.
    pub async fn close_placement(&self, placement: &PlacementTable) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            results.push(node.coordinator.handle_dlt_close(placement.clone()).await);
        }
        results
    }
}

/// Install a test log subscriber honouring `RUST_LOG`.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FinishResync;
    use crate::types::StreamId;

    fn finish(seq: u32) -> MigrationMessage {
        MigrationMessage::FinishResync(FinishResync {
            stream_id: StreamId::new(1, seq).unwrap(),
        })
    }

    #[tokio::test]
    async fn test_recording_transport() {
        let transport = RecordingTransport::new();
        transport.send(2, finish(0)).await.unwrap();
        transport.set_unreachable(3, true);
        assert!(transport.send(3, finish(1)).await.is_err());

        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.take()[0].0, 2);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_loopback_unreachable_and_silent() {
        let network = LoopbackNetwork::new();
        let transport = network.transport(1);

        // Nothing attached for node 2.
        assert!(transport.send(2, finish(0)).await.is_err());

        network.set_silent(2, true);
        assert!(transport.send(2, finish(1)).await.is_ok());
        assert_eq!(network.in_flight(), 0);

        network.set_unreachable(2, true);
        assert!(matches!(
            transport.send(2, finish(2)).await,
            Err(Error::SourceUnreachable { node: 2, .. })
        ));

        let log = network.deliveries();
        assert_eq!(log.len(), 1);
        assert_eq!((log[0].from, log[0].to), (1, 2));
    }

    #[tokio::test]
    async fn test_loopback_hold_and_release() {
        let network = LoopbackNetwork::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        network.inner.inboxes.write().insert(2, tx);
        let transport = network.transport(1);

        network.hold(2, "finish_resync");
        transport.send(2, finish(0)).await.unwrap();
        transport.send(2, finish(1)).await.unwrap();
        assert_eq!(network.held().len(), 2);
        assert_eq!(network.in_flight(), 0);
        assert!(rx.try_recv().is_err());

        network.release(2, "finish_resync").unwrap();
        assert!(network.held().is_empty());
        assert_eq!(network.in_flight(), 2);
        assert_eq!(rx.try_recv().unwrap(), (1, finish(0)));
        assert_eq!(rx.try_recv().unwrap(), (1, finish(1)));

        // Released: later messages go straight through.
        transport.send(2, finish(2)).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), (1, finish(2)));
        assert_eq!(network.deliveries().len(), 3);
    }
}
