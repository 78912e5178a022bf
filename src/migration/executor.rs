//! Destination-side migration executor.
//!
//! One executor pulls the tokens of one token group from one source node.
//! It drives two rounds against its source:
//!
//! 1. Send per-token filter sets describing what this node already holds,
//!    then apply the delta sets the source streams back.
//! 2. Ask for the changes accrued since the source's first snapshot and
//!    apply them.
//!
//! The executor never retries on its own. Tokens that fail are reported to
//! the coordinator in a [`RoundReport`], which decides on retries per token.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::protocol::{
    FilterEntry, GetSecondRebalanceDeltaSet, MigrationMessage, ObjectRebalanceDeltaSet,
    ObjectRebalanceDeltaSetAck, ObjectRebalanceFilterSet, ObjectRebalanceFilterSetAck,
    RebalanceNack,
};
use crate::store::{MergeOutcome, MetadataSnapshot, ObjectStore};
use crate::types::{NodeId, PlacementVersion, StreamId, Token, TokenGroup};

/// Lifecycle of an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Created, waiting for its group's snapshot.
    Created,
    /// Filter sets sent; waiting for acks and the first delta.
    AwaitingFirstPhaseAck,
    /// Round 1 finished; waiting for the coordinator to start round 2.
    FirstPhaseDone,
    /// Second delta requested; waiting for it.
    AwaitingSecondPhaseAck,
    /// Both rounds finished.
    Complete,
    /// Every token of the executor failed.
    Failed,
}

impl ExecutorState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutorState::Complete | ExecutorState::Failed)
    }

    /// Whether the executor is waiting on its source.
    pub fn is_awaiting_source(&self) -> bool {
        matches!(
            self,
            ExecutorState::AwaitingFirstPhaseAck | ExecutorState::AwaitingSecondPhaseAck
        )
    }
}

impl std::fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorState::Created => write!(f, "created"),
            ExecutorState::AwaitingFirstPhaseAck => write!(f, "awaiting_first_phase_ack"),
            ExecutorState::FirstPhaseDone => write!(f, "first_phase_done"),
            ExecutorState::AwaitingSecondPhaseAck => write!(f, "awaiting_second_phase_ack"),
            ExecutorState::Complete => write!(f, "complete"),
            ExecutorState::Failed => write!(f, "failed"),
        }
    }
}

/// Input to the executor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorEvent {
    BeginFirstPhase,
    FirstPhaseFinished,
    BeginSecondPhase,
    SecondPhaseFinished,
    Fail,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorEffect {
    SendFilterSets,
    ReportRoundDone(u8),
    SendSecondDeltaRequest,
    ReportFailure,
}

/// Executor transition function.
pub fn step(
    state: ExecutorState,
    event: ExecutorEvent,
) -> Result<(ExecutorState, Option<ExecutorEffect>)> {
    use ExecutorEffect as Fx;
    use ExecutorEvent as Ev;
    use ExecutorState as St;

    match (state, event) {
        (St::Created, Ev::BeginFirstPhase) => Ok((St::AwaitingFirstPhaseAck, Some(Fx::SendFilterSets))),
        (St::AwaitingFirstPhaseAck, Ev::FirstPhaseFinished) => {
            Ok((St::FirstPhaseDone, Some(Fx::ReportRoundDone(1))))
        }
        (St::FirstPhaseDone, Ev::BeginSecondPhase) => Ok((
            St::AwaitingSecondPhaseAck,
            Some(Fx::SendSecondDeltaRequest),
        )),
        (St::AwaitingSecondPhaseAck, Ev::SecondPhaseFinished) => {
            Ok((St::Complete, Some(Fx::ReportRoundDone(2))))
        }
        (s, Ev::Fail) if !s.is_terminal() => Ok((St::Failed, Some(Fx::ReportFailure))),
        (s, e) => Err(Error::NotReady(format!(
            "executor cannot handle {:?} in state {}",
            e, s
        ))),
    }
}

/// What the coordinator learns when an executor finishes a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    pub stream_id: StreamId,
    pub group: TokenGroup,
    pub source: NodeId,
    pub round: u8,
    /// Tokens that failed since the previous report.
    pub failed: BTreeMap<Token, Error>,
    /// The executor reached a terminal state.
    pub terminal: bool,
}

/// Result of handing a delta set to an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaOutcome {
    /// Ack to return to the source, if the delta belongs to this stream.
    pub ack: Option<MigrationMessage>,
    /// Delta sets applied by this call (buffered ones included).
    pub applied_sets: u64,
    /// Objects that changed local state.
    pub applied_objects: u64,
    /// The delta was a duplicate or belonged to a past round.
    pub duplicate: bool,
}

/// Destination-side worker for one (token group, source) pair.
#[derive(Debug)]
pub struct MigrationExecutor {
    stream_id: StreamId,
    group: TokenGroup,
    source: NodeId,
    target_version: PlacementVersion,
    tokens: BTreeSet<Token>,
    batch_size: usize,

    state: ExecutorState,
    round: u8,
    failed: BTreeMap<Token, Error>,
    unreported: BTreeMap<Token, Error>,
    last_error: Option<Error>,
    report: Option<RoundReport>,

    // Round 1 filter-set acknowledgements.
    filter_sets_sent: u64,
    filter_sets_acked: BTreeSet<u64>,

    // Apply lane: delta sets are applied strictly in sequence order.
    next_seq: u64,
    buffered: BTreeMap<u64, ObjectRebalanceDeltaSet>,
    last_applied: bool,

    last_heard: Instant,
}

impl MigrationExecutor {
    /// Create an executor in the `Created` state.
    pub fn new(
        stream_id: StreamId,
        group: TokenGroup,
        source: NodeId,
        target_version: PlacementVersion,
        tokens: BTreeSet<Token>,
        batch_size: usize,
    ) -> Self {
        Self {
            stream_id,
            group,
            source,
            target_version,
            tokens,
            batch_size: batch_size.max(1),
            state: ExecutorState::Created,
            round: 0,
            failed: BTreeMap::new(),
            unreported: BTreeMap::new(),
            last_error: None,
            report: None,
            filter_sets_sent: 0,
            filter_sets_acked: BTreeSet::new(),
            next_seq: 0,
            buffered: BTreeMap::new(),
            last_applied: false,
            last_heard: Instant::now(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.stream_id
    }

    pub fn group(&self) -> TokenGroup {
        self.group
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Current round (0 before round 1 starts).
    pub fn round(&self) -> u8 {
        self.round
    }

    /// Every token assigned to this executor.
    pub fn tokens(&self) -> &BTreeSet<Token> {
        &self.tokens
    }

    /// Tokens that have not failed.
    pub fn active_tokens(&self) -> BTreeSet<Token> {
        self.tokens
            .iter()
            .filter(|t| !self.failed.contains_key(t))
            .copied()
            .collect()
    }

    /// Tokens that failed, with the reason.
    pub fn failed_tokens(&self) -> &BTreeMap<Token, Error> {
        &self.failed
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Whether round `round` is finished (failure counts as finished).
    pub fn is_round_done(&self, round: u8) -> bool {
        match self.state {
            ExecutorState::Failed | ExecutorState::Complete => true,
            ExecutorState::FirstPhaseDone | ExecutorState::AwaitingSecondPhaseAck => round <= 1,
            ExecutorState::Created | ExecutorState::AwaitingFirstPhaseAck => false,
        }
    }

    /// Whether the source has been silent for longer than `timeout` while
    /// this executor waits on it.
    pub fn is_silent(&self, now: Instant, timeout: Duration) -> bool {
        self.state.is_awaiting_source() && now.duration_since(self.last_heard) > timeout
    }

    /// Take the pending round report, if a round finished.
    pub fn take_report(&mut self) -> Option<RoundReport> {
        self.report.take()
    }

    fn transition(&mut self, event: ExecutorEvent) -> Result<Option<ExecutorEffect>> {
        let (next, effect) = step(self.state, event)?;
        tracing::debug!(
            stream_id = %self.stream_id,
            from = %self.state,
            to = %next,
            "Executor transition"
        );
        self.state = next;
        Ok(effect)
    }

    fn reset_lane(&mut self) {
        self.next_seq = 0;
        self.buffered.clear();
        self.last_applied = false;
        self.last_heard = Instant::now();
    }

    /// Begin round 1: build the filter sets for the executor's tokens from
    /// `snapshot` and return them for sending to the source.
    ///
    /// Each token contributes at least one filter set so the source learns
    /// about tokens this node holds nothing for.
    pub fn start_object_rebalance(
        &mut self,
        snapshot: &MetadataSnapshot,
    ) -> Result<Vec<MigrationMessage>> {
        self.transition(ExecutorEvent::BeginFirstPhase)?;
        self.round = 1;
        self.reset_lane();
        self.filter_sets_acked.clear();

        let mut sets = Vec::new();
        for token in &self.tokens {
            let entries: Vec<FilterEntry> = snapshot
                .objects(*token)
                .iter()
                .map(|m| FilterEntry {
                    id: m.id,
                    refcount: m.refcount,
                })
                .collect();

            let mut chunks: Vec<Vec<FilterEntry>> = entries
                .chunks(self.batch_size)
                .map(<[FilterEntry]>::to_vec)
                .collect();
            if chunks.is_empty() {
                chunks.push(Vec::new());
            }
            for chunk in chunks {
                sets.push(ObjectRebalanceFilterSet {
                    stream_id: self.stream_id,
                    token: *token,
                    target_version: self.target_version,
                    seq: sets.len() as u64,
                    is_last: false,
                    entries: chunk,
                });
            }
        }
        if let Some(last) = sets.last_mut() {
            last.is_last = true;
        }
        self.filter_sets_sent = sets.len() as u64;

        tracing::info!(
            stream_id = %self.stream_id,
            group = %self.group,
            source = self.source,
            tokens = self.tokens.len(),
            filter_sets = sets.len(),
            "Executor starting round 1"
        );

        if sets.is_empty() {
            // No tokens at all: nothing to pull.
            self.transition(ExecutorEvent::FirstPhaseFinished)?;
            self.emit_report(1, false);
        }

        Ok(sets.into_iter().map(MigrationMessage::FilterSet).collect())
    }

    /// Record a filter-set acknowledgement from the source.
    pub fn on_filter_set_ack(&mut self, ack: &ObjectRebalanceFilterSetAck) -> Result<()> {
        if ack.stream_id != self.stream_id {
            return Err(self.stream_mismatch(ack.stream_id));
        }
        if self.state != ExecutorState::AwaitingFirstPhaseAck || ack.seq >= self.filter_sets_sent {
            tracing::debug!(stream_id = %self.stream_id, seq = ack.seq, "Ignoring stale filter set ack");
            return Ok(());
        }
        self.last_heard = Instant::now();
        self.filter_sets_acked.insert(ack.seq);

        for token in &ack.rejected {
            if self.tokens.contains(token) {
                self.fail_token(
                    *token,
                    Error::SourceNotReady {
                        node: self.source,
                        token: *token,
                    },
                );
            }
        }
        self.check_progress()
    }

    /// Validate, order and apply one delta set.
    ///
    /// Delta sets are applied in sequence order; early ones are buffered and
    /// duplicates or deltas of a past round are acknowledged without effect.
    pub async fn apply_rebalance_delta_set(
        &mut self,
        msg: ObjectRebalanceDeltaSet,
        store: &dyn ObjectStore,
    ) -> Result<DeltaOutcome> {
        if msg.stream_id != self.stream_id {
            return Err(self.stream_mismatch(msg.stream_id));
        }
        if msg.target_version != self.target_version {
            return Err(Error::VersionMismatch {
                expected: self.target_version,
                actual: msg.target_version,
            });
        }

        let ack = Some(MigrationMessage::DeltaSetAck(ObjectRebalanceDeltaSetAck {
            stream_id: self.stream_id,
            round: msg.round,
            seq: msg.seq,
        }));
        let mut outcome = DeltaOutcome {
            ack,
            applied_sets: 0,
            applied_objects: 0,
            duplicate: false,
        };

        let accepting = self.state.is_awaiting_source() && msg.round == self.round;
        if !accepting || msg.seq < self.next_seq || self.buffered.contains_key(&msg.seq) {
            tracing::debug!(
                stream_id = %self.stream_id,
                round = msg.round,
                seq = msg.seq,
                "Duplicate or stale delta set"
            );
            outcome.duplicate = true;
            return Ok(outcome);
        }

        self.last_heard = Instant::now();
        self.buffered.insert(msg.seq, msg);

        while let Some(delta) = self.buffered.remove(&self.next_seq) {
            for object in delta.objects {
                if store.merge_object(object).await? != MergeOutcome::Unchanged {
                    outcome.applied_objects += 1;
                }
            }
            if delta.is_last {
                self.last_applied = true;
            }
            self.next_seq += 1;
            outcome.applied_sets += 1;
        }

        self.check_progress()?;
        Ok(outcome)
    }

    /// Begin round 2. Returns the request for the source.
    pub fn start_second_object_rebalance_round(&mut self) -> Result<MigrationMessage> {
        self.transition(ExecutorEvent::BeginSecondPhase)?;
        self.round = 2;
        self.reset_lane();

        tracing::info!(
            stream_id = %self.stream_id,
            group = %self.group,
            source = self.source,
            "Executor starting round 2"
        );

        Ok(MigrationMessage::GetSecondDeltaSet(GetSecondRebalanceDeltaSet {
            stream_id: self.stream_id,
            target_version: self.target_version,
        }))
    }

    /// The source refused the whole stream for a round.
    pub fn on_nack(&mut self, nack: &RebalanceNack) -> Result<()> {
        if nack.stream_id != self.stream_id {
            return Err(self.stream_mismatch(nack.stream_id));
        }
        if nack.round != self.round || !self.state.is_awaiting_source() {
            return Ok(());
        }
        tracing::warn!(
            stream_id = %self.stream_id,
            source = self.source,
            round = nack.round,
            kind = %nack.kind,
            "Source refused stream"
        );
        for token in self.active_tokens() {
            self.fail_token(token, nack.kind.into_token_error(self.source, token));
        }
        // No further acks or deltas will arrive for this round.
        self.finish_failed()
    }

    /// Fail every remaining token with `err` (timeouts, unreachable sources,
    /// local storage failures).
    pub fn fail(&mut self, err: Error) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        for token in self.active_tokens() {
            self.fail_token(token, err.clone());
        }
        self.last_error = Some(err);
        self.finish_failed()
    }

    fn fail_token(&mut self, token: Token, err: Error) {
        if self.failed.contains_key(&token) {
            return;
        }
        tracing::warn!(
            stream_id = %self.stream_id,
            token = %token,
            error = %err,
            "Token failed"
        );
        self.last_error = Some(err.clone());
        self.failed.insert(token, err.clone());
        self.unreported.insert(token, err);
    }

    fn finish_failed(&mut self) -> Result<()> {
        self.transition(ExecutorEvent::Fail)?;
        let round = self.round.max(1);
        self.emit_report(round, true);
        Ok(())
    }

    fn check_progress(&mut self) -> Result<()> {
        match self.state {
            ExecutorState::AwaitingFirstPhaseAck => {
                let all_acked = self.filter_sets_acked.len() as u64 == self.filter_sets_sent;
                if !all_acked {
                    return Ok(());
                }
                if self.active_tokens().is_empty() {
                    return self.finish_failed();
                }
                if self.last_applied {
                    self.transition(ExecutorEvent::FirstPhaseFinished)?;
                    self.emit_report(1, false);
                }
            }
            ExecutorState::AwaitingSecondPhaseAck => {
                if self.active_tokens().is_empty() {
                    return self.finish_failed();
                }
                if self.last_applied {
                    self.transition(ExecutorEvent::SecondPhaseFinished)?;
                    self.emit_report(2, false);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn emit_report(&mut self, round: u8, terminal: bool) {
        tracing::info!(
            stream_id = %self.stream_id,
            group = %self.group,
            round,
            failed = self.unreported.len(),
            state = %self.state,
            "Executor round done"
        );
        self.report = Some(RoundReport {
            stream_id: self.stream_id,
            group: self.group,
            source: self.source,
            round,
            failed: std::mem::take(&mut self.unreported),
            terminal,
        });
    }

    fn stream_mismatch(&self, other: StreamId) -> Error {
        Error::VersionMismatch {
            expected: self.stream_id.to_wire(),
            actual: other.to_wire(),
        }
    }
}
