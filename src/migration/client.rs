//! Source-side migration client.
//!
//! A client serves one destination executor. It collects the executor's
//! filter sets, streams back whatever the destination is missing, then
//! streams the changes made during round 1 and turns on live-write
//! forwarding for the stream's tokens until the stream is released.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::{
    MigrationMessage, ObjectRebalanceDeltaSet, ObjectRebalanceFilterSet,
    ObjectRebalanceFilterSetAck,
};
use crate::store::ObjectStore;
use crate::types::{NodeId, ObjectId, ObjectMeta, ObjectRecord, PlacementVersion, StreamId, Token, WriteRequest};

/// Lifecycle of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Receiving filter sets.
    CollectingFilters,
    /// Computing and streaming the first delta.
    StreamingFirstDelta,
    /// First delta streamed; waiting for the second-round request.
    FirstPhaseDone,
    /// Streaming changes made during round 1.
    StreamingSecondDelta,
    /// Forwarding live writes to the destination.
    Forwarding,
    /// Released.
    Finished,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientState::CollectingFilters => write!(f, "collecting_filters"),
            ClientState::StreamingFirstDelta => write!(f, "streaming_first_delta"),
            ClientState::FirstPhaseDone => write!(f, "first_phase_done"),
            ClientState::StreamingSecondDelta => write!(f, "streaming_second_delta"),
            ClientState::Forwarding => write!(f, "forwarding"),
            ClientState::Finished => write!(f, "finished"),
        }
    }
}

/// Input to the client state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    FiltersComplete,
    FirstDeltaSent,
    SecondDeltaRequested,
    ForwardingArmed,
    Finish,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEffect {
    ComputeFirstDelta,
    ComputeSecondDelta,
    EnableForwarding,
    ReleaseStream,
}

/// Client transition function.
pub fn step(state: ClientState, event: ClientEvent) -> Result<(ClientState, Option<ClientEffect>)> {
    use ClientEffect as Fx;
    use ClientEvent as Ev;
    use ClientState as St;

    match (state, event) {
        (St::CollectingFilters, Ev::FiltersComplete) => {
            Ok((St::StreamingFirstDelta, Some(Fx::ComputeFirstDelta)))
        }
        (St::StreamingFirstDelta, Ev::FirstDeltaSent) => Ok((St::FirstPhaseDone, None)),
        (St::FirstPhaseDone, Ev::SecondDeltaRequested) => {
            Ok((St::StreamingSecondDelta, Some(Fx::ComputeSecondDelta)))
        }
        (St::StreamingSecondDelta, Ev::ForwardingArmed) => {
            Ok((St::Forwarding, Some(Fx::EnableForwarding)))
        }
        (St::Finished, Ev::Finish) => Ok((St::Finished, None)),
        (_, Ev::Finish) => Ok((St::Finished, Some(Fx::ReleaseStream))),
        (s, e) => Err(Error::NotReady(format!(
            "client cannot handle {:?} in state {}",
            e, s
        ))),
    }
}

#[derive(Debug)]
struct ClientLane {
    state: ClientState,
    filter_sets: BTreeMap<u64, ObjectRebalanceFilterSet>,
    last_filter_seq: Option<u64>,
    rejected: BTreeSet<Token>,
    served: BTreeSet<Token>,
    first_mark: u64,
    second_mark: u64,
    delta_seq: u64,
}

/// Source-side worker for one stream.
#[derive(Debug)]
pub struct MigrationClient {
    stream_id: StreamId,
    destination: NodeId,
    target_version: PlacementVersion,
    batch_size: usize,
    store: Arc<dyn ObjectStore>,

    // Read on every live write; kept outside the lane.
    forwarding: RwLock<BTreeSet<Token>>,
    finished: AtomicBool,

    // Serializes protocol events of the stream.
    lane: tokio::sync::Mutex<ClientLane>,
}

impl MigrationClient {
    /// Create a client for `stream_id`, serving `destination`.
    pub fn new(
        stream_id: StreamId,
        destination: NodeId,
        target_version: PlacementVersion,
        batch_size: usize,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            stream_id,
            destination,
            target_version,
            batch_size: batch_size.max(1),
            store,
            forwarding: RwLock::new(BTreeSet::new()),
            finished: AtomicBool::new(false),
            lane: tokio::sync::Mutex::new(ClientLane {
                state: ClientState::CollectingFilters,
                filter_sets: BTreeMap::new(),
                last_filter_seq: None,
                rejected: BTreeSet::new(),
                served: BTreeSet::new(),
                first_mark: 0,
                second_mark: 0,
                delta_seq: 0,
            }),
        }
    }

    pub fn id(&self) -> StreamId {
        self.stream_id
    }

    pub fn destination(&self) -> NodeId {
        self.destination
    }

    pub fn target_version(&self) -> PlacementVersion {
        self.target_version
    }

    /// Current state.
    pub async fn state(&self) -> ClientState {
        self.lane.lock().await.state
    }

    /// Tokens currently forwarded.
    pub fn forwarding_tokens(&self) -> BTreeSet<Token> {
        self.forwarding.read().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Accept one filter set. `servable` says whether this node can serve
    /// the filter set's token.
    ///
    /// Returns the ack, followed by the whole first delta once the final
    /// filter set (and every one before it) has arrived.
    pub async fn start_rebalance_first_phase(
        &self,
        msg: ObjectRebalanceFilterSet,
        servable: bool,
    ) -> Result<Vec<MigrationMessage>> {
        self.check_stream(msg.stream_id, msg.target_version)?;

        let mut lane = self.lane.lock().await;
        if !servable {
            lane.rejected.insert(msg.token);
        }
        let rejected = if lane.rejected.contains(&msg.token) {
            vec![msg.token]
        } else {
            Vec::new()
        };
        let mut out = vec![MigrationMessage::FilterSetAck(ObjectRebalanceFilterSetAck {
            stream_id: self.stream_id,
            seq: msg.seq,
            rejected,
        })];

        if lane.state != ClientState::CollectingFilters || lane.filter_sets.contains_key(&msg.seq) {
            tracing::debug!(stream_id = %self.stream_id, seq = msg.seq, "Duplicate filter set");
            return Ok(out);
        }
        if msg.is_last {
            lane.last_filter_seq = Some(msg.seq);
        }
        lane.filter_sets.insert(msg.seq, msg);

        let complete = lane
            .last_filter_seq
            .is_some_and(|last| lane.filter_sets.len() as u64 == last + 1);
        if !complete {
            return Ok(out);
        }

        let (next, _) = step(lane.state, ClientEvent::FiltersComplete)?;
        lane.state = next;
        out.extend(self.compute_first_delta(&mut lane).await?);
        let (next, _) = step(lane.state, ClientEvent::FirstDeltaSent)?;
        lane.state = next;
        Ok(out)
    }

    async fn compute_first_delta(&self, lane: &mut ClientLane) -> Result<Vec<MigrationMessage>> {
        let mut filters: BTreeMap<Token, HashMap<ObjectId, u32>> = BTreeMap::new();
        for set in lane.filter_sets.values() {
            filters
                .entry(set.token)
                .or_default()
                .extend(set.entries.iter().map(|e| (e.id, e.refcount)));
        }
        lane.served = filters
            .keys()
            .filter(|t| !lane.rejected.contains(t))
            .copied()
            .collect();
        lane.filter_sets.clear();

        if lane.served.is_empty() {
            tracing::info!(stream_id = %self.stream_id, "No servable tokens; skipping first delta");
            return Ok(Vec::new());
        }

        let snapshot = self.store.snapshot(&lane.served).await?;
        lane.first_mark = snapshot.mark;

        let mut per_token = Vec::new();
        for token in &lane.served {
            let known = filters.get(token);
            let missing: Vec<ObjectMeta> = snapshot
                .objects(*token)
                .iter()
                .filter(|m| known.and_then(|k| k.get(&m.id)) != Some(&m.refcount))
                .copied()
                .collect();
            per_token.push((*token, self.read_objects(&missing).await?));
        }

        lane.delta_seq = 0;
        let msgs = self.build_delta_sets(lane, 1, per_token, true);
        tracing::info!(
            stream_id = %self.stream_id,
            destination = self.destination,
            tokens = lane.served.len(),
            rejected = lane.rejected.len(),
            delta_sets = msgs.len(),
            mark = lane.first_mark,
            "Client streaming first delta"
        );
        Ok(msgs)
    }

    /// Stream the changes made since the first snapshot.
    ///
    /// The returned delta sets are not flagged last: once the caller has sent
    /// them it must call [`enable_forwarding`](Self::enable_forwarding),
    /// which produces the final delta set. Returns `None` for a repeated
    /// request.
    pub async fn start_rebalance_second_phase(
        &self,
        target_version: PlacementVersion,
    ) -> Result<Option<Vec<MigrationMessage>>> {
        self.check_stream(self.stream_id, target_version)?;

        let mut lane = self.lane.lock().await;
        if matches!(
            lane.state,
            ClientState::StreamingSecondDelta | ClientState::Forwarding
        ) {
            tracing::debug!(stream_id = %self.stream_id, "Duplicate second delta request");
            return Ok(None);
        }
        let (next, _) = step(lane.state, ClientEvent::SecondDeltaRequested)?;
        lane.state = next;

        let snapshot = self.store.snapshot(&lane.served).await?;
        lane.second_mark = snapshot.mark;
        let first_mark = lane.first_mark;

        let mut per_token = Vec::new();
        for (token, changed) in snapshot.changed_since(first_mark) {
            per_token.push((token, self.read_objects(&changed).await?));
        }

        lane.delta_seq = 0;
        let msgs = self.build_delta_sets(&mut lane, 2, per_token, false);
        tracing::info!(
            stream_id = %self.stream_id,
            destination = self.destination,
            delta_sets = msgs.len(),
            from_mark = first_mark,
            to_mark = lane.second_mark,
            "Client streaming second delta"
        );
        Ok(Some(msgs))
    }

    /// Turn on forwarding for the served tokens and return the final delta
    /// set, covering writes made between the second snapshot and now.
    pub async fn enable_forwarding(&self) -> Result<Vec<MigrationMessage>> {
        let mut lane = self.lane.lock().await;
        let (next, _) = step(lane.state, ClientEvent::ForwardingArmed)?;
        lane.state = next;

        self.forwarding.write().extend(lane.served.iter().copied());

        let snapshot = self.store.snapshot(&lane.served).await?;
        let second_mark = lane.second_mark;
        let mut per_token = Vec::new();
        for (token, changed) in snapshot.changed_since(second_mark) {
            per_token.push((token, self.read_objects(&changed).await?));
        }
        let msgs = self.build_delta_sets(&mut lane, 2, per_token, true);

        tracing::info!(
            stream_id = %self.stream_id,
            destination = self.destination,
            tokens = lane.served.len(),
            tail_sets = msgs.len(),
            "Forwarding enabled"
        );
        Ok(msgs)
    }

    /// Whether a live write must also be relayed to the destination.
    ///
    /// True only while forwarding is on for `token` and the write did not
    /// itself arrive through forwarding.
    pub fn forward_if_needed(&self, token: Token, write: &WriteRequest) -> bool {
        if write.forwarded_from.is_some() || self.is_finished() {
            return false;
        }
        self.forwarding.read().contains(&token)
    }

    /// Disable forwarding and release the stream.
    pub async fn finish_resync(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.forwarding.write().clear();

        let mut lane = self.lane.lock().await;
        let released_in = lane.state;
        if let Ok((next, _)) = step(lane.state, ClientEvent::Finish) {
            lane.state = next;
        }
        lane.filter_sets.clear();
        tracing::info!(
            stream_id = %self.stream_id,
            destination = self.destination,
            state = %released_in,
            "Client released"
        );
    }

    fn check_stream(&self, stream_id: StreamId, target_version: PlacementVersion) -> Result<()> {
        if self.is_finished() {
            return Err(Error::NotReady(format!("stream {} released", self.stream_id)));
        }
        if stream_id != self.stream_id || target_version != self.target_version {
            return Err(Error::VersionMismatch {
                expected: self.target_version,
                actual: target_version,
            });
        }
        Ok(())
    }

    async fn read_objects(&self, metas: &[ObjectMeta]) -> Result<Vec<ObjectRecord>> {
        let mut objects = Vec::with_capacity(metas.len());
        for meta in metas {
            // Objects removed since the snapshot are skipped.
            if let Some(object) = self.store.read_object(&meta.id).await? {
                objects.push(object);
            }
        }
        Ok(objects)
    }

    /// Chunk objects into delta sets continuing the lane's sequence.
    ///
    /// With `finish`, at least one set is produced and the last is flagged.
    fn build_delta_sets(
        &self,
        lane: &mut ClientLane,
        round: u8,
        per_token: Vec<(Token, Vec<ObjectRecord>)>,
        finish: bool,
    ) -> Vec<MigrationMessage> {
        let mut sets = Vec::new();
        for (token, objects) in per_token {
            for chunk in objects.chunks(self.batch_size) {
                sets.push(ObjectRebalanceDeltaSet {
                    stream_id: self.stream_id,
                    token,
                    target_version: self.target_version,
                    round,
                    seq: 0,
                    is_last: false,
                    objects: chunk.to_vec(),
                });
            }
        }
        if finish && sets.is_empty() {
            let token = lane.served.first().copied().unwrap_or(Token(0));
            sets.push(ObjectRebalanceDeltaSet {
                stream_id: self.stream_id,
                token,
                target_version: self.target_version,
                round,
                seq: 0,
                is_last: false,
                objects: Vec::new(),
            });
        }
        for set in &mut sets {
            set.seq = lane.delta_seq;
            lane.delta_seq += 1;
        }
        if finish {
            if let Some(last) = sets.last_mut() {
                last.is_last = true;
            }
        }
        sets.into_iter().map(MigrationMessage::DeltaSet).collect()
    }
}
