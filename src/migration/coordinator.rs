//! Node-wide migration coordinator.
//!
//! The coordinator owns every executor (destination side) and client
//! (source side) on this node. It sequences token groups through the two
//! protocol rounds, retries failed tokens against alternate sources, aborts
//! groups or whole migrations, answers the orchestrator, and decides on
//! every live write whether it must be forwarded.
//!
//! # Sequencing
//!
//! ```text
//!   round 1:  g0 ──► g1 ──► g2 ──►  (barrier)  round 2:  g0 ──► g1 ──► g2 ──► ack
//! ```
//!
//! Only one group is active at a time. The active group takes one metadata
//! snapshot and starts every executor created for it; the next group starts
//! once all of the active group's executors finished the round. Round 2 starts
//! only after round 1 finished for every group.
//!
//! Decisions are made under the run lock and carried out after it is released,
//! so no lock is held across a send or a store access.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::client::MigrationClient;
use super::executor::{ExecutorState, MigrationExecutor, RoundReport};
use super::retry::{RetryPlan, RetrySet};
use crate::config::{DltClosePolicy, MigrationConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::metrics::MigrationMetrics;
use crate::placement::{OwnershipLedger, PlacementTable, TokenAvailabilityTable};
use crate::protocol::{
    ControlMessage, FinishResync, ForwardedWrite, GetSecondRebalanceDeltaSet, MigrationMessage,
    MigrationTransport, ObjectRebalanceDeltaSet, ObjectRebalanceFilterSet, RebalanceNack,
};
use crate::store::ObjectStore;
use crate::types::{NodeId, ObjectId, PlacementVersion, StreamId, Token, TokenGroup, WriteRequest};

/// Completion of a `start_migration` / `start_resync` request.
pub type MigrationAck = oneshot::Receiver<Result<()>>;

/// Node-global migration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrationState {
    Idle = 0,
    InProgress = 1,
    Aborted = 2,
}

impl MigrationState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => MigrationState::InProgress,
            2 => MigrationState::Aborted,
            _ => MigrationState::Idle,
        }
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationState::Idle => write!(f, "idle"),
            MigrationState::InProgress => write!(f, "in_progress"),
            MigrationState::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    /// Placement change driven by the orchestrator.
    Migration,
    /// Refill of owned-but-unavailable tokens after a restart.
    Resync,
}

/// Scheduling view of one executor.
#[derive(Debug)]
struct ExecutorEntry {
    group: TokenGroup,
    source: NodeId,
    tokens: BTreeSet<Token>,
    failed: BTreeSet<Token>,
    started_round: u8,
    done_round: u8,
}

impl ExecutorEntry {
    fn new(group: TokenGroup, source: NodeId, tokens: BTreeSet<Token>) -> Self {
        Self {
            group,
            source,
            tokens,
            failed: BTreeSet::new(),
            started_round: 0,
            done_round: 0,
        }
    }
}

/// One in-flight `start_migration` or `start_resync` request.
#[derive(Debug)]
struct MigrationRun {
    id: Uuid,
    kind: RunKind,
    version: PlacementVersion,
    ack: Option<oneshot::Sender<Result<()>>>,
    phase: u8,
    queue: VecDeque<TokenGroup>,
    active: Option<TokenGroup>,
    entries: BTreeMap<StreamId, ExecutorEntry>,
    incoming: BTreeSet<Token>,
    retry: RetrySet,
    group_errors: Vec<(TokenGroup, Error)>,
    finished: bool,
    // Stops the run's watchdog.
    cancellation: CancellationToken,
}

impl MigrationRun {
    fn streams_of(&self, group: TokenGroup) -> Vec<StreamId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.group == group)
            .map(|(id, _)| *id)
            .collect()
    }

    fn groups(&self) -> BTreeSet<TokenGroup> {
        self.entries.values().map(|e| e.group).collect()
    }
}

#[derive(Debug, Default)]
struct ExecutorTable {
    by_stream: HashMap<StreamId, Arc<tokio::sync::Mutex<MigrationExecutor>>>,
    by_group: BTreeMap<TokenGroup, BTreeSet<StreamId>>,
}

impl ExecutorTable {
    fn insert(&mut self, executor: MigrationExecutor) {
        self.by_group
            .entry(executor.group())
            .or_default()
            .insert(executor.id());
        self.by_stream
            .insert(executor.id(), Arc::new(tokio::sync::Mutex::new(executor)));
    }

    fn remove_group(&mut self, group: TokenGroup) -> Vec<StreamId> {
        let streams: Vec<_> = self.by_group.remove(&group).into_iter().flatten().collect();
        for id in &streams {
            self.by_stream.remove(id);
        }
        streams
    }

    fn clear(&mut self) -> usize {
        let n = self.by_stream.len();
        self.by_stream.clear();
        self.by_group.clear();
        n
    }
}

enum Action {
    BeginFirst {
        group: TokenGroup,
        streams: Vec<StreamId>,
        tokens: BTreeSet<Token>,
    },
    BeginSecond {
        group: TokenGroup,
        streams: Vec<StreamId>,
    },
    Finish,
    Wait,
}

/// Coordinates all migration activity of one node.
#[derive(Debug)]
pub struct MigrationCoordinator {
    local: NodeId,
    config: MigrationConfig,

    state: AtomicU8,
    target_version: AtomicU64,

    executors: RwLock<ExecutorTable>,
    clients: Mutex<HashMap<StreamId, Arc<MigrationClient>>>,
    run: Mutex<Option<MigrationRun>>,

    placement: RwLock<PlacementTable>,
    availability: TokenAvailabilityTable,

    store: Arc<dyn ObjectStore>,
    transport: Arc<dyn MigrationTransport>,
    ledger: Arc<dyn OwnershipLedger>,
    metrics: Arc<MigrationMetrics>,

    next_local_seq: AtomicU32,
    last_progress: Mutex<Instant>,
}

impl MigrationCoordinator {
    /// Create a coordinator for `local` with `placement` installed.
    ///
    /// Every token `local` holds a replica of starts out available; call
    /// [`recover`](Self::recover) after a restart to apply the ledger.
    pub fn new(
        local: NodeId,
        config: MigrationConfig,
        placement: PlacementTable,
        store: Arc<dyn ObjectStore>,
        transport: Arc<dyn MigrationTransport>,
        ledger: Arc<dyn OwnershipLedger>,
    ) -> Result<Self> {
        config.validate()?;
        StreamId::new(local, 0)?;

        let availability = TokenAvailabilityTable::new(config.token_count());
        availability.rebuild(&placement, local, &Default::default());

        Ok(Self {
            local,
            config,
            state: AtomicU8::new(MigrationState::Idle as u8),
            target_version: AtomicU64::new(placement.version()),
            executors: RwLock::new(ExecutorTable::default()),
            clients: Mutex::new(HashMap::new()),
            run: Mutex::new(None),
            placement: RwLock::new(placement),
            availability,
            store,
            transport,
            ledger,
            metrics: Arc::new(MigrationMetrics::new()),
            next_local_seq: AtomicU32::new(0),
            last_progress: Mutex::new(Instant::now()),
        })
    }

    /// Share a metrics instance with the embedding service.
    pub fn with_metrics(mut self, metrics: Arc<MigrationMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MigrationMetrics> {
        &self.metrics
    }

    pub fn availability(&self) -> &TokenAvailabilityTable {
        &self.availability
    }

    /// The installed placement table.
    pub fn placement(&self) -> PlacementTable {
        self.placement.read().clone()
    }

    pub fn state(&self) -> MigrationState {
        MigrationState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Version the current (or last) migration converges to.
    pub fn target_version(&self) -> PlacementVersion {
        self.target_version.load(Ordering::Acquire)
    }

    /// Streams of all live executors.
    pub fn executor_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.executors.read().by_stream.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Streams of the live executors of one group.
    pub fn executors_for_group(&self, group: TokenGroup) -> Vec<StreamId> {
        self.executors
            .read()
            .by_group
            .get(&group)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// State and tokens of one executor.
    pub async fn executor_info(&self, id: StreamId) -> Option<(ExecutorState, NodeId, BTreeSet<Token>)> {
        let exec = self.executor(id)?;
        let ex = exec.lock().await;
        Some((ex.state(), ex.source(), ex.tokens().clone()))
    }

    /// Streams this node currently serves as a source.
    pub fn client_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.clients.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn client(&self, id: StreamId) -> Option<Arc<MigrationClient>> {
        self.clients.lock().get(&id).cloned()
    }

    /// Whether a request is still being worked on.
    pub fn has_outstanding_work(&self) -> bool {
        self.run.lock().as_ref().is_some_and(|r| !r.finished)
    }

    fn executor(&self, id: StreamId) -> Option<Arc<tokio::sync::Mutex<MigrationExecutor>>> {
        self.executors.read().by_stream.get(&id).cloned()
    }

    fn transition(&self, from: MigrationState, to: MigrationState) -> bool {
        let ok = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            tracing::info!(node = self.local, %from, %to, "Migration state changed");
        }
        ok
    }

    fn next_stream_id(&self) -> Result<StreamId> {
        StreamId::new(self.local, self.next_local_seq.fetch_add(1, Ordering::Relaxed))
    }

    fn touch(&self) {
        *self.last_progress.lock() = Instant::now();
    }

    // ------------------------------------------------------------------
    // Orchestrator entry points
    // ------------------------------------------------------------------

    /// Start migrating `source_to_tokens` to this node, converging on
    /// `target_version`.
    ///
    /// Returns once round 1 of the first group has been started; the
    /// receiver resolves when every group finished both rounds, or with the
    /// terminal error of a full abort.
    #[tracing::instrument(skip(self, source_to_tokens), fields(node = self.local))]
    pub async fn start_migration(
        self: &Arc<Self>,
        target_version: PlacementVersion,
        source_to_tokens: BTreeMap<NodeId, BTreeSet<Token>>,
    ) -> Result<MigrationAck> {
        let (tx, rx) = oneshot::channel();
        if !self.config.enabled {
            tracing::info!(version = target_version, "Migration disabled; acknowledging immediately");
            let _ = tx.send(Ok(()));
            return Ok(rx);
        }

        if source_to_tokens.contains_key(&self.local) {
            return Err(Error::InvalidArgument(format!(
                "node {} cannot migrate from itself",
                self.local
            )));
        }
        let token_count = self.config.token_count() as u32;
        if let Some(bad) = source_to_tokens
            .values()
            .flatten()
            .find(|t| t.0 >= token_count)
        {
            return Err(Error::InvalidArgument(format!(
                "token {} outside a table of {} tokens",
                bad, token_count
            )));
        }

        self.begin_run(RunKind::Migration, target_version, source_to_tokens, tx)?;
        self.advance().await;
        Ok(rx)
    }

    /// Migrate every owned-but-unavailable token from another replica.
    ///
    /// Used after a restart, against the installed placement. Completion
    /// marks the tokens available, clears them from the ledger's pending
    /// set and returns the node to idle.
    #[tracing::instrument(skip(self), fields(node = self.local))]
    pub async fn start_resync(self: &Arc<Self>) -> Result<MigrationAck> {
        let (tx, rx) = oneshot::channel();
        if !self.config.enabled {
            let _ = tx.send(Ok(()));
            return Ok(rx);
        }

        let placement = self.placement();
        let pending = self.availability.unavailable_owned(&placement, self.local);
        if pending.is_empty() {
            tracing::info!(node = self.local, "Nothing to resync");
            let _ = tx.send(Ok(()));
            return Ok(rx);
        }

        let mut sources: BTreeMap<NodeId, BTreeSet<Token>> = BTreeMap::new();
        for token in pending {
            match placement.replicas(token).iter().find(|n| **n != self.local) {
                Some(source) => {
                    sources.entry(*source).or_default().insert(token);
                }
                None => tracing::warn!(%token, "No other replica to resync from"),
            }
        }
        if sources.is_empty() {
            return Err(Error::NotReady("no replica available to resync from".to_string()));
        }

        self.begin_run(RunKind::Resync, placement.version(), sources, tx)?;
        self.advance().await;
        Ok(rx)
    }

    fn begin_run(
        self: &Arc<Self>,
        kind: RunKind,
        version: PlacementVersion,
        sources: BTreeMap<NodeId, BTreeSet<Token>>,
        ack: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if !self.transition(MigrationState::Idle, MigrationState::InProgress) {
            return Err(Error::NotReady(format!(
                "cannot start migration while {}",
                self.state()
            )));
        }
        self.target_version.store(version, Ordering::Release);

        let group_bits = self.config.group_bit_width;
        let mut by_key: BTreeMap<(TokenGroup, NodeId), BTreeSet<Token>> = BTreeMap::new();
        for (source, tokens) in sources {
            for token in tokens {
                by_key
                    .entry((token.group(group_bits), source))
                    .or_default()
                    .insert(token);
            }
        }

        let mut run = MigrationRun {
            id: Uuid::new_v4(),
            kind,
            version,
            ack: Some(ack),
            phase: 1,
            queue: VecDeque::new(),
            active: None,
            entries: BTreeMap::new(),
            incoming: BTreeSet::new(),
            retry: RetrySet::new(self.config.max_retries_per_token),
            group_errors: Vec::new(),
            finished: false,
            cancellation: CancellationToken::new(),
        };

        let mut guard = self.run.lock();
        {
            let mut table = self.executors.write();
            for ((group, source), tokens) in by_key {
                let stream_id = self.next_stream_id()?;
                for token in &tokens {
                    run.retry.mark_tried(*token, source);
                }
                run.incoming.extend(tokens.iter().copied());
                table.insert(MigrationExecutor::new(
                    stream_id,
                    group,
                    source,
                    version,
                    tokens.clone(),
                    self.config.filter_set_batch_size,
                ));
                run.entries
                    .insert(stream_id, ExecutorEntry::new(group, source, tokens));
                self.metrics.executors_created.inc();
                self.metrics.active_executors.inc();
            }
        }
        run.queue = run.groups().into_iter().collect();
        self.availability.mark_unavailable(run.incoming.iter().copied());
        self.metrics.migrations_started.inc();

        tracing::info!(
            run_id = %run.id,
            node = self.local,
            version,
            kind = ?kind,
            groups = run.queue.len(),
            executors = run.entries.len(),
            tokens = run.incoming.len(),
            "Migration started"
        );

        let cancellation = run.cancellation.clone();
        *guard = Some(run);
        drop(guard);

        self.touch();
        self.spawn_watchdog(cancellation);
        Ok(())
    }

    /// Abort the in-flight migration on the orchestrator's request.
    #[tracing::instrument(skip(self), fields(node = self.local))]
    pub async fn abort_migration_from_om(&self, target_version: PlacementVersion) -> Result<()> {
        let state = self.state();
        if state == MigrationState::Idle {
            return Ok(());
        }
        let current = self.target_version();
        if target_version != current {
            return Err(Error::InvalidArgument(format!(
                "abort for version {} but version {} is in flight",
                target_version, current
            )));
        }
        if state == MigrationState::InProgress {
            self.abort_all(Error::Aborted(format!(
                "aborted by orchestrator at version {}",
                target_version
            )))
            .await;
        }
        Ok(())
    }

    /// Tear down one group's executors and record `err` against it.
    ///
    /// Other groups keep running. If no recoverable work remains the request
    /// is fully aborted with the first recorded group error.
    pub async fn abort_migration_for_group(&self, group: TokenGroup, err: Error) {
        let out = {
            let mut guard = self.run.lock();
            match guard.as_mut() {
                Some(run) if !run.finished => self.abort_group_locked(run, group, err),
                _ => return,
            }
        };
        self.dispatch(out).await;
        self.advance().await;
    }

    /// The placement table at the migration's target version was committed.
    ///
    /// Returns the node to idle, tearing down every executor and client and
    /// installing `placement`. While executors are still outstanding the
    /// configured [`DltClosePolicy`] decides between refusing the close and
    /// forcing it through. A close while idle changes nothing.
    #[tracing::instrument(skip(self, placement), fields(node = self.local, version = placement.version()))]
    pub async fn handle_dlt_close(&self, placement: PlacementTable) -> Result<()> {
        let state = self.state();
        if state == MigrationState::Idle {
            tracing::debug!("Placement closed while idle; ignoring");
            return Ok(());
        }

        let version = self.target_version();
        if placement.version() != version {
            return Err(Error::VersionMismatch {
                expected: version,
                actual: placement.version(),
            });
        }
        if state == MigrationState::InProgress {
            if self.has_outstanding_work() {
                match self.config.dlt_close_policy {
                    DltClosePolicy::Reject => {
                        tracing::warn!(version, "Placement closed with outstanding streams; refusing");
                        return Err(Error::NotReady(format!(
                            "migration to version {} still has outstanding streams",
                            version
                        )));
                    }
                    DltClosePolicy::ForceComplete => {
                        tracing::warn!(version, "Placement closed with outstanding streams; forcing");
                        self.abort_all(Error::Aborted(format!(
                            "placement version {} closed with outstanding streams",
                            version
                        )))
                        .await;
                    }
                }
            }
        }

        let state = self.state();
        if state != MigrationState::Idle && !self.transition(state, MigrationState::Idle) {
            return Err(Error::NotReady(format!(
                "migration state changed concurrently (now {})",
                self.state()
            )));
        }
        let (incoming, out) = {
            let mut guard = self.run.lock();
            match guard.take() {
                Some(mut run) => {
                    run.cancellation.cancel();
                    let out = self.drain_executors_locked(&mut run);
                    (run.incoming, out)
                }
                None => (BTreeSet::new(), Vec::new()),
            }
        };
        self.dispatch(out).await;
        self.release_clients().await;

        self.install_placement(placement, &incoming).await
    }

    async fn install_placement(&self, placement: PlacementTable, incoming: &BTreeSet<Token>) -> Result<()> {
        let mut record = self.ledger.load().await?;
        let owned = placement.tokens_owned_by(self.local);
        let mut pending = record.pending_resync.clone();
        pending.extend(
            incoming
                .iter()
                .filter(|t| !self.availability.is_available(**t))
                .copied(),
        );
        pending.retain(|t| owned.contains(t));
        record.owned = owned;
        record.pending_resync = pending;
        self.ledger.persist(&record).await?;

        self.availability.rebuild(&placement, self.local, &record);
        let version = placement.version();
        *self.placement.write() = placement;
        self.target_version.store(version, Ordering::Release);

        tracing::info!(
            node = self.local,
            version,
            owned = record.owned.len(),
            pending_resync = record.pending_resync.len(),
            "Placement installed"
        );
        Ok(())
    }

    /// Rebuild token availability from the ledger after a restart.
    pub async fn recover(&self) -> Result<()> {
        let mut record = self.ledger.load().await?;
        let placement = self.placement();
        let owned = placement.tokens_owned_by(self.local);
        let stored = self.store.owned_tokens();

        // Owned tokens never recorded and without local data were never received.
        let missing: Vec<Token> = owned
            .iter()
            .filter(|t| !record.owned.contains(t) && !stored.contains(t))
            .copied()
            .collect();
        let before = record.clone();
        record.pending_resync.extend(missing);
        record.pending_resync.retain(|t| owned.contains(t));
        record.owned = owned;
        if record != before {
            self.ledger.persist(&record).await?;
        }

        self.availability.rebuild(&placement, self.local, &record);
        tracing::info!(
            node = self.local,
            version = placement.version(),
            available = self.availability.available_count(),
            pending_resync = record.pending_resync.len(),
            "Token availability rebuilt"
        );
        Ok(())
    }

    /// Apply one orchestrator control message and wait for its outcome.
    pub async fn handle_control(self: &Arc<Self>, msg: ControlMessage) -> Result<()> {
        match msg {
            ControlMessage::StartMigration {
                target_version,
                sources,
            } => {
                let mut map: BTreeMap<NodeId, BTreeSet<Token>> = BTreeMap::new();
                for (node, tokens) in sources {
                    map.entry(node).or_default().extend(tokens);
                }
                let ack = self.start_migration(target_version, map).await?;
                ack.await
                    .map_err(|_| Error::Internal("migration acknowledgement dropped".to_string()))?
            }
            ControlMessage::AbortMigration { target_version } => {
                self.abort_migration_from_om(target_version).await
            }
            ControlMessage::PlacementClosed { placement } => self.handle_dlt_close(placement).await,
        }
    }

    // ------------------------------------------------------------------
    // Live write path
    // ------------------------------------------------------------------

    /// Decide whether a live write must also go to a migration destination.
    ///
    /// Called on every write. Returns `false` without taking any lock when no
    /// migration is in progress or the writer already addresses the target
    /// placement. When it returns `true` the relay has been scheduled in the
    /// background; relay failures are logged and never reach the writer.
    pub fn forward_req_if_needed(
        &self,
        object_id: &ObjectId,
        request_version: PlacementVersion,
        write: &WriteRequest,
    ) -> bool {
        if self.state() != MigrationState::InProgress {
            return false;
        }
        if request_version == self.target_version.load(Ordering::Acquire) {
            return false;
        }

        let token = object_id.token(self.config.token_bit_width);
        let targets: Vec<(StreamId, NodeId)> = self
            .clients
            .lock()
            .values()
            .filter(|c| c.forward_if_needed(token, write))
            .map(|c| (c.id(), c.destination()))
            .collect();
        if targets.is_empty() {
            return false;
        }

        for (stream_id, destination) in targets {
            self.spawn_relay(stream_id, destination, write.object.clone());
        }
        true
    }

    fn spawn_relay(&self, stream_id: StreamId, destination: NodeId, object: crate::types::ObjectRecord) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%stream_id, destination, "No runtime to relay forwarded write");
            self.metrics.forward_failures.inc();
            return;
        };
        let transport = self.transport.clone();
        let metrics = self.metrics.clone();
        let attempts = self.config.forward_retry_limit.max(1);
        let backoff = self.config.forward_retry_backoff;
        let from = self.local;

        handle.spawn(async move {
            let msg = MigrationMessage::ForwardedWrite(ForwardedWrite { stream_id, object });
            for attempt in 1..=attempts {
                match transport.send(destination, msg.clone()).await {
                    Ok(()) => {
                        metrics.writes_forwarded.inc();
                        return;
                    }
                    Err(e) => {
                        metrics.forward_failures.inc();
                        tracing::warn!(
                            %stream_id,
                            from,
                            destination,
                            attempt,
                            error = %e,
                            "Forwarded write relay failed"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
            tracing::error!(%stream_id, destination, "Dropping forwarded write after retries");
        });
    }

    // ------------------------------------------------------------------
    // Inbound protocol messages
    // ------------------------------------------------------------------

    /// Dispatch one protocol message received from `from`.
    pub async fn handle_message(&self, from: NodeId, msg: MigrationMessage) -> Result<()> {
        tracing::debug!(
            node = self.local,
            from,
            stream_id = %msg.stream_id(),
            kind = msg.name(),
            "Migration message received"
        );
        match msg {
            MigrationMessage::FilterSet(m) => self.start_object_rebalance(from, m).await,
            MigrationMessage::FilterSetAck(ack) => {
                self.on_executor_event(ack.stream_id, |ex| ex.on_filter_set_ack(&ack))
                    .await
            }
            MigrationMessage::GetSecondDeltaSet(m) => self.start_second_object_rebalance(from, m).await,
            MigrationMessage::DeltaSet(m) => self.recv_rebalance_delta_set(from, m).await,
            // Delta sets are applied idempotently; the source keeps no
            // per-set delivery state.
            MigrationMessage::DeltaSetAck(_) => Ok(()),
            MigrationMessage::FinishResync(m) => {
                self.finish_client_resync(m.stream_id).await;
                Ok(())
            }
            MigrationMessage::Nack(nack) => {
                self.on_executor_event(nack.stream_id, |ex| ex.on_nack(&nack))
                    .await
            }
            MigrationMessage::ForwardedWrite(w) => self.apply_forwarded_write(from, w).await,
        }
    }

    /// Destination side: merge a live write relayed by a source.
    ///
    /// Only writes for a live stream's tokens, sent by that stream's source,
    /// are applied; anything arriving after a group abort or a close is
    /// dropped.
    async fn apply_forwarded_write(&self, from: NodeId, w: ForwardedWrite) -> Result<()> {
        let stream_id = w.stream_id;
        let accepted = match self.executor(stream_id) {
            Some(exec) if self.state() == MigrationState::InProgress => {
                let ex = exec.lock().await;
                let token = w.object.id.token(self.config.token_bit_width);
                ex.source() == from && ex.tokens().contains(&token)
            }
            _ => false,
        };
        if !accepted {
            tracing::debug!(%stream_id, from, object = %w.object.id, "Forwarded write dropped");
            return Ok(());
        }

        let outcome = self.store.merge_object(w.object).await?;
        tracing::debug!(%stream_id, from, ?outcome, "Forwarded write applied");
        Ok(())
    }

    /// Source side: a filter set arrived for `msg.stream_id`.
    pub async fn start_object_rebalance(&self, from: NodeId, msg: ObjectRebalanceFilterSet) -> Result<()> {
        let stream_id = msg.stream_id;
        let client = match self.client_for(from, stream_id, msg.target_version) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(%stream_id, from, error = %e, "Refusing migration stream");
                self.send_nack(from, stream_id, 1, e.kind()).await;
                return Ok(());
            }
        };

        let servable = self.availability.is_available(msg.token);
        match client.start_rebalance_first_phase(msg, servable).await {
            Ok(out) => {
                self.send_from_client(&client, out).await;
            }
            Err(e) => {
                tracing::warn!(%stream_id, error = %e, "First phase failed on source");
                self.send_nack(from, stream_id, 1, e.kind()).await;
            }
        }
        Ok(())
    }

    /// Source side: the destination asked for the second-round delta.
    pub async fn start_second_object_rebalance(
        &self,
        from: NodeId,
        msg: GetSecondRebalanceDeltaSet,
    ) -> Result<()> {
        let stream_id = msg.stream_id;
        let Some(client) = self.client(stream_id) else {
            tracing::warn!(%stream_id, from, "Second delta requested for unknown stream");
            self.send_nack(from, stream_id, 2, ErrorKind::VersionMismatch).await;
            return Ok(());
        };

        match client.start_rebalance_second_phase(msg.target_version).await {
            Ok(Some(out)) => {
                if !self.send_from_client(&client, out).await {
                    // Forwarding stays off; the destination times the source out.
                    return Ok(());
                }
                match client.enable_forwarding().await {
                    Ok(tail) => {
                        self.send_from_client(&client, tail).await;
                    }
                    Err(e) => {
                        tracing::warn!(%stream_id, error = %e, "Could not enable forwarding");
                        self.send_nack(from, stream_id, 2, e.kind()).await;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(%stream_id, error = %e, "Second phase failed on source");
                self.send_nack(from, stream_id, 2, e.kind()).await;
            }
        }
        Ok(())
    }

    /// Destination side: a delta set arrived.
    pub async fn recv_rebalance_delta_set(&self, from: NodeId, msg: ObjectRebalanceDeltaSet) -> Result<()> {
        let stream_id = msg.stream_id;
        let Some(exec) = self.executor(stream_id) else {
            tracing::debug!(%stream_id, from, "Delta set for unknown stream dropped");
            return Ok(());
        };
        self.touch();

        let (outcome, report, source) = {
            let mut ex = exec.lock().await;
            let source = ex.source();
            if from != source {
                tracing::warn!(%stream_id, from, source, "Delta set from unexpected node dropped");
                return Ok(());
            }
            match ex.apply_rebalance_delta_set(msg, self.store.as_ref()).await {
                Ok(outcome) => (Some(outcome), ex.take_report(), source),
                Err(e) if e.kind() == ErrorKind::VersionMismatch => {
                    tracing::warn!(%stream_id, error = %e, "Delta set rejected");
                    (None, None, source)
                }
                Err(e) => {
                    tracing::error!(%stream_id, error = %e, "Applying delta set failed");
                    ex.fail(e)?;
                    (None, ex.take_report(), source)
                }
            }
        };

        if let Some(outcome) = outcome {
            self.metrics.delta_sets_applied.inc_by(outcome.applied_sets);
            self.metrics.objects_applied.inc_by(outcome.applied_objects);
            if outcome.duplicate {
                self.metrics.delta_sets_duplicate.inc();
            }
            if let Some(ack) = outcome.ack {
                if let Err(e) = self.transport.send(source, ack).await {
                    tracing::warn!(%stream_id, source, error = %e, "Delta set ack not sent");
                }
            }
        }
        if let Some(report) = report {
            self.absorb_report(report).await;
            self.advance().await;
        }
        Ok(())
    }

    /// Source side: release the client of `stream_id`.
    pub async fn finish_client_resync(&self, stream_id: StreamId) {
        let client = self.clients.lock().remove(&stream_id);
        if let Some(client) = client {
            client.finish_resync().await;
            self.metrics.active_clients.dec();
        }
    }

    fn client_for(
        &self,
        from: NodeId,
        stream_id: StreamId,
        version: PlacementVersion,
    ) -> Result<Arc<MigrationClient>> {
        if stream_id.node_id() != from {
            return Err(Error::InvalidArgument(format!(
                "stream {} does not belong to node {}",
                stream_id, from
            )));
        }
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&stream_id) {
            return Ok(client.clone());
        }
        self.may_serve(version)?;

        let client = Arc::new(MigrationClient::new(
            stream_id,
            from,
            version,
            self.config.delta_set_batch_size,
            self.store.clone(),
        ));
        clients.insert(stream_id, client.clone());
        self.metrics.active_clients.inc();
        tracing::info!(%stream_id, destination = from, version, "Migration client created");
        Ok(client)
    }

    /// Whether a new source-side stream for `version` may be opened.
    fn may_serve(&self, version: PlacementVersion) -> Result<()> {
        match self.state() {
            MigrationState::InProgress => {
                let current = self.target_version();
                if version != current {
                    return Err(Error::VersionMismatch {
                        expected: current,
                        actual: version,
                    });
                }
                Ok(())
            }
            // A resync runs against the installed placement.
            MigrationState::Idle if version == self.placement.read().version() => Ok(()),
            state => Err(Error::NotReady(format!(
                "cannot serve version {} while {}",
                version, state
            ))),
        }
    }

    async fn on_executor_event<F>(&self, stream_id: StreamId, f: F) -> Result<()>
    where
        F: FnOnce(&mut MigrationExecutor) -> Result<()>,
    {
        let Some(exec) = self.executor(stream_id) else {
            tracing::debug!(%stream_id, "Event for unknown stream dropped");
            return Ok(());
        };
        self.touch();

        let report = {
            let mut ex = exec.lock().await;
            f(&mut *ex)?;
            ex.take_report()
        };
        if let Some(report) = report {
            self.absorb_report(report).await;
            self.advance().await;
        }
        Ok(())
    }

    async fn send_from_client(&self, client: &MigrationClient, msgs: Vec<MigrationMessage>) -> bool {
        for msg in msgs {
            if matches!(msg, MigrationMessage::DeltaSet(_)) {
                self.metrics.delta_sets_sent.inc();
            }
            if let Err(e) = self.transport.send(client.destination(), msg).await {
                tracing::warn!(
                    stream_id = %client.id(),
                    destination = client.destination(),
                    error = %e,
                    "Send to destination failed"
                );
                return false;
            }
        }
        true
    }

    async fn send_nack(&self, to: NodeId, stream_id: StreamId, round: u8, kind: ErrorKind) {
        let nack = MigrationMessage::Nack(RebalanceNack {
            stream_id,
            round,
            kind,
        });
        if let Err(e) = self.transport.send(to, nack).await {
            tracing::warn!(%stream_id, to, error = %e, "Nack not sent");
        }
    }

    // ------------------------------------------------------------------
    // Sequencing
    // ------------------------------------------------------------------

    async fn advance(&self) {
        loop {
            let action = {
                let mut guard = self.run.lock();
                match guard.as_mut() {
                    Some(run) => self.next_action(run),
                    None => Action::Wait,
                }
            };
            match action {
                Action::Wait => return,
                Action::BeginFirst {
                    group,
                    streams,
                    tokens,
                } => self.begin_first_round(group, streams, tokens).await,
                Action::BeginSecond { group, streams } => {
                    self.begin_second_round(group, streams).await
                }
                Action::Finish => {
                    self.finish_run().await;
                    return;
                }
            }
        }
    }

    fn next_action(&self, run: &mut MigrationRun) -> Action {
        if run.finished {
            return Action::Wait;
        }
        loop {
            let group = match run.active {
                Some(group) => group,
                None => match run.queue.pop_front() {
                    Some(group) => {
                        run.active = Some(group);
                        tracing::info!(run_id = %run.id, %group, round = run.phase, "Group activated");
                        group
                    }
                    None if run.phase == 1 => {
                        run.phase = 2;
                        run.queue = run.groups().into_iter().collect();
                        tracing::info!(run_id = %run.id, "Round 1 finished for every group");
                        continue;
                    }
                    None => {
                        run.finished = true;
                        return Action::Finish;
                    }
                },
            };

            let streams = run.streams_of(group);
            if streams.is_empty() {
                run.active = None;
                continue;
            }

            let created: Vec<StreamId> = streams
                .iter()
                .filter(|id| run.entries[*id].started_round == 0)
                .copied()
                .collect();
            if !created.is_empty() {
                let mut tokens = BTreeSet::new();
                for id in &created {
                    if let Some(entry) = run.entries.get_mut(id) {
                        entry.started_round = 1;
                        tokens.extend(entry.tokens.iter().copied());
                    }
                }
                return Action::BeginFirst {
                    group,
                    streams: created,
                    tokens,
                };
            }

            if streams.iter().any(|id| run.entries[id].done_round < 1) {
                return Action::Wait;
            }
            if run.phase == 1 {
                tracing::info!(run_id = %run.id, %group, "Group finished round 1");
                run.active = None;
                continue;
            }

            let ready: Vec<StreamId> = streams
                .iter()
                .filter(|id| {
                    let e = &run.entries[*id];
                    e.done_round == 1 && e.started_round == 1
                })
                .copied()
                .collect();
            if !ready.is_empty() {
                for id in &ready {
                    if let Some(entry) = run.entries.get_mut(id) {
                        entry.started_round = 2;
                    }
                }
                return Action::BeginSecond {
                    group,
                    streams: ready,
                };
            }

            if streams.iter().all(|id| run.entries[id].done_round >= 2) {
                self.complete_group(run, group);
                run.active = None;
                continue;
            }
            return Action::Wait;
        }
    }

    fn complete_group(&self, run: &mut MigrationRun, group: TokenGroup) {
        let mut migrated = BTreeSet::new();
        let mut failed = BTreeSet::new();
        for entry in run.entries.values().filter(|e| e.group == group) {
            migrated.extend(entry.tokens.difference(&entry.failed).copied());
            failed.extend(entry.failed.iter().copied());
        }
        self.availability.mark_available(migrated.iter().copied());
        run.retry.clear_group(group, self.config.group_bit_width);

        tracing::info!(
            run_id = %run.id,
            %group,
            tokens = migrated.len(),
            retried = failed.difference(&migrated).count(),
            "Group finished round 2"
        );
    }

    async fn begin_first_round(&self, group: TokenGroup, streams: Vec<StreamId>, tokens: BTreeSet<Token>) {
        let snapshot = match self.store.snapshot(&tokens).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(%group, error = %e, "Snapshot failed");
                self.abort_migration_for_group_inner(group, e).await;
                return;
            }
        };
        tracing::debug!(%group, objects = snapshot.len(), mark = snapshot.mark, "Group snapshot ready");

        for stream_id in streams {
            let Some(exec) = self.executor(stream_id) else {
                continue;
            };
            let (source, msgs, report) = {
                let mut ex = exec.lock().await;
                let msgs = match ex.start_object_rebalance(&snapshot) {
                    Ok(msgs) => msgs,
                    Err(e) => {
                        tracing::warn!(%stream_id, error = %e, "Executor did not start");
                        continue;
                    }
                };
                (ex.source(), msgs, ex.take_report())
            };
            self.metrics.filter_sets_sent.inc_by(msgs.len() as u64);
            self.send_for_executor(stream_id, source, msgs).await;
            if let Some(report) = report {
                self.absorb_report(report).await;
            }
        }
    }

    async fn begin_second_round(&self, group: TokenGroup, streams: Vec<StreamId>) {
        tracing::debug!(%group, executors = streams.len(), "Starting round 2");
        for stream_id in streams {
            let Some(exec) = self.executor(stream_id) else {
                continue;
            };
            let (source, msg) = {
                let mut ex = exec.lock().await;
                match ex.start_second_object_rebalance_round() {
                    Ok(msg) => (ex.source(), msg),
                    Err(e) => {
                        tracing::warn!(%stream_id, error = %e, "Executor did not start round 2");
                        continue;
                    }
                }
            };
            self.send_for_executor(stream_id, source, vec![msg]).await;
        }
    }

    async fn send_for_executor(&self, stream_id: StreamId, source: NodeId, msgs: Vec<MigrationMessage>) {
        for msg in msgs {
            let Err(e) = self.transport.send(source, msg).await else {
                continue;
            };
            tracing::warn!(%stream_id, source, error = %e, "Send to source failed");
            let Some(exec) = self.executor(stream_id) else {
                return;
            };
            let report = {
                let mut ex = exec.lock().await;
                let err = Error::SourceUnreachable {
                    node: source,
                    reason: e.to_string(),
                };
                if let Err(e) = ex.fail(err) {
                    tracing::warn!(%stream_id, error = %e, "Executor could not be failed");
                }
                ex.take_report()
            };
            if let Some(report) = report {
                self.absorb_report(report).await;
            }
            return;
        }
    }

    async fn abort_migration_for_group_inner(&self, group: TokenGroup, err: Error) {
        let out = {
            let mut guard = self.run.lock();
            match guard.as_mut() {
                Some(run) if !run.finished => self.abort_group_locked(run, group, err),
                _ => return,
            }
        };
        self.dispatch(out).await;
    }

    async fn absorb_report(&self, report: RoundReport) {
        let out = self.apply_report(report);
        self.dispatch(out).await;
    }

    /// Fold an executor's round report into the run: record progress, plan
    /// retries for failed tokens or abort their group.
    fn apply_report(&self, report: RoundReport) -> Vec<(NodeId, MigrationMessage)> {
        let mut guard = self.run.lock();
        let Some(run) = guard.as_mut() else {
            return Vec::new();
        };
        if run.finished {
            return Vec::new();
        }
        let Some(entry) = run.entries.get_mut(&report.stream_id) else {
            return Vec::new();
        };
        entry.done_round = if report.terminal {
            2
        } else {
            entry.done_round.max(report.round)
        };
        entry.failed.extend(report.failed.keys().copied());
        self.touch();

        if report.failed.is_empty() {
            return Vec::new();
        }
        for err in report.failed.values() {
            self.metrics.record_token_failure(err.kind());
        }

        let plan = {
            let placement = self.placement.read();
            run.retry.plan(
                report.group,
                report.source,
                &report.failed,
                |t| placement.replicas(t),
                self.local,
            )
        };

        match plan {
            RetryPlan::Exhausted(err) => self.abort_group_locked(run, report.group, err),
            RetryPlan::Retry(plan) => {
                let group = report.group;
                let mut table = self.executors.write();
                for (source, tokens) in plan {
                    let stream_id = match self.next_stream_id() {
                        Ok(id) => id,
                        Err(e) => {
                            drop(table);
                            return self.abort_group_locked(run, group, e);
                        }
                    };
                    tracing::info!(
                        run_id = %run.id,
                        %stream_id,
                        %group,
                        source,
                        tokens = ?tokens,
                        "Retrying tokens against alternate source"
                    );
                    self.metrics.tokens_retried.inc_by(tokens.len() as u64);
                    self.metrics.executors_created.inc();
                    self.metrics.executors_retried.inc();
                    self.metrics.active_executors.inc();
                    table.insert(MigrationExecutor::new(
                        stream_id,
                        group,
                        source,
                        run.version,
                        tokens.clone(),
                        self.config.filter_set_batch_size,
                    ));
                    run.entries
                        .insert(stream_id, ExecutorEntry::new(group, source, tokens));
                }
                if run.active != Some(group) && !run.queue.contains(&group) {
                    run.queue.push_back(group);
                }
                Vec::new()
            }
        }
    }

    fn abort_group_locked(
        &self,
        run: &mut MigrationRun,
        group: TokenGroup,
        err: Error,
    ) -> Vec<(NodeId, MigrationMessage)> {
        let streams = self.executors.write().remove_group(group);
        let mut out = Vec::new();
        for stream_id in streams {
            if let Some(entry) = run.entries.remove(&stream_id) {
                out.push((
                    entry.source,
                    MigrationMessage::FinishResync(FinishResync { stream_id }),
                ));
            }
            self.metrics.active_executors.dec();
        }
        run.queue.retain(|g| *g != group);
        if run.active == Some(group) {
            run.active = None;
        }
        run.retry.clear_group(group, self.config.group_bit_width);
        run.group_errors.push((group, err.clone()));
        self.metrics.groups_aborted.inc();

        tracing::error!(run_id = %run.id, %group, error = %err, "Group aborted");
        out
    }

    fn drain_executors_locked(&self, run: &mut MigrationRun) -> Vec<(NodeId, MigrationMessage)> {
        let removed = self.executors.write().clear();
        self.metrics.active_executors.sub(removed as i64);
        std::mem::take(&mut run.entries)
            .into_iter()
            .map(|(stream_id, entry)| {
                (
                    entry.source,
                    MigrationMessage::FinishResync(FinishResync { stream_id }),
                )
            })
            .collect()
    }

    async fn release_clients(&self) {
        let clients: Vec<_> = self.clients.lock().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.finish_resync().await;
            self.metrics.active_clients.dec();
        }
    }

    async fn dispatch(&self, out: Vec<(NodeId, MigrationMessage)>) {
        for (to, msg) in out {
            let stream_id = msg.stream_id();
            if let Err(e) = self.transport.send(to, msg).await {
                tracing::warn!(%stream_id, to, error = %e, "Teardown message not sent");
            }
        }
    }

    async fn finish_run(&self) {
        let (kind, first_error, run_id) = {
            let guard = self.run.lock();
            let Some(run) = guard.as_ref() else {
                return;
            };
            (
                run.kind,
                run.group_errors.first().map(|(_, e)| e.clone()),
                run.id,
            )
        };

        if let Some(err) = first_error {
            self.abort_all(err).await;
            return;
        }

        match kind {
            RunKind::Migration => {
                let ack = self.run.lock().as_mut().and_then(|r| {
                    r.cancellation.cancel();
                    r.ack.take()
                });
                self.metrics.migrations_completed.inc();
                tracing::info!(
                    %run_id,
                    version = self.target_version(),
                    "Migration finished; awaiting placement close"
                );
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
            }
            RunKind::Resync => {
                let result = self.complete_resync().await;
                if let Err(e) = &result {
                    tracing::error!(%run_id, error = %e, "Resync bookkeeping failed");
                }
            }
        }
    }

    async fn complete_resync(&self) -> Result<()> {
        let Some(mut run) = self.run.lock().take() else {
            return Ok(());
        };
        run.cancellation.cancel();
        let out = self.drain_executors_locked(&mut run);
        self.dispatch(out).await;

        let result = if self.transition(MigrationState::InProgress, MigrationState::Idle) {
            async {
                let mut record = self.ledger.load().await?;
                for token in &run.incoming {
                    record.pending_resync.remove(token);
                    record.owned.insert(*token);
                }
                self.ledger.persist(&record).await
            }
            .await
        } else {
            // An abort raced the last completion and found no run to answer.
            // The tokens stay pending in the ledger.
            self.transition(MigrationState::Aborted, MigrationState::Idle);
            Err(Error::Aborted(format!(
                "resync {} aborted while completing",
                run.id
            )))
        };

        if result.is_ok() {
            self.metrics.migrations_completed.inc();
            tracing::info!(run_id = %run.id, tokens = run.incoming.len(), "Resync finished");
        }
        if let Some(ack) = run.ack.take() {
            let _ = ack.send(result.clone());
        }
        result
    }

    /// Fully abort the in-flight request, replying to its caller with `err`.
    ///
    /// Returns `false` if no migration was in progress. A migration stays
    /// aborted until the placement closes; an aborted resync returns to idle.
    async fn abort_all(&self, err: Error) -> bool {
        if !self.transition(MigrationState::InProgress, MigrationState::Aborted) {
            return false;
        }

        let (ack, out, kind, run_id) = {
            let mut guard = self.run.lock();
            match guard.as_mut() {
                Some(run) => {
                    run.finished = true;
                    run.cancellation.cancel();
                    let out = self.drain_executors_locked(run);
                    (run.ack.take(), out, Some(run.kind), Some(run.id))
                }
                None => (None, Vec::new(), None, None),
            }
        };
        self.metrics.migrations_aborted.inc();
        tracing::error!(run_id = ?run_id, error = %err, "Migration aborted");

        self.dispatch(out).await;
        self.release_clients().await;

        if kind == Some(RunKind::Resync) {
            *self.run.lock() = None;
            self.transition(MigrationState::Aborted, MigrationState::Idle);
        }
        if let Some(ack) = ack {
            let _ = ack.send(Err(err));
        }
        true
    }

    // ------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------

    fn spawn_watchdog(self: &Arc<Self>, cancellation: CancellationToken) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(node = self.local, "No runtime; migration watchdog disabled");
            return;
        };
        let weak = Arc::downgrade(self);
        let interval = self.config.watchdog_interval;

        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => {
                        tracing::debug!("Migration watchdog stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(coordinator) = weak.upgrade() else {
                            break;
                        };
                        if !coordinator.check_timeouts().await {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// One watchdog pass. Returns `false` once there is nothing left to watch.
    async fn check_timeouts(&self) -> bool {
        if self.state() != MigrationState::InProgress || !self.has_outstanding_work() {
            return false;
        }

        let now = Instant::now();
        let idle = now.duration_since(*self.last_progress.lock());
        if idle > self.config.inactivity_timeout {
            tracing::error!(idle_ms = idle.as_millis() as u64, "No migration progress");
            self.abort_all(Error::Timeout).await;
            return false;
        }

        let executors: Vec<_> = self.executors.read().by_stream.values().cloned().collect();
        let mut reports = Vec::new();
        for exec in executors {
            let mut ex = exec.lock().await;
            if ex.is_silent(now, self.config.source_timeout) {
                tracing::warn!(stream_id = %ex.id(), source = ex.source(), "Source silent; failing executor");
                if ex.fail(Error::Timeout).is_ok() {
                    reports.extend(ex.take_report());
                }
            }
        }
        if !reports.is_empty() {
            for report in reports {
                self.absorb_report(report).await;
            }
            self.advance().await;
        }
        true
    }
}
