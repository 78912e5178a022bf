//! Multi-node migration scenarios over the loopback network.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::time::Duration;

use super::{init_tracing, TestCluster, TestNode};
use crate::config::{DltClosePolicy, MigrationConfig};
use crate::error::{Error, Result};
use crate::migration::{ExecutorState, MigrationAck, MigrationState};
use crate::placement::PlacementTable;
use crate::protocol::MigrationMessage;
use crate::types::{
    NodeId, ObjectId, ObjectRecord, PlacementVersion, StreamId, Token, TokenGroup, WriteRequest,
};

const TOKEN_BITS: u32 = 5;
const GROUP_BITS: u32 = 3;

fn config() -> MigrationConfig {
    MigrationConfig::new()
        .with_token_bit_width(TOKEN_BITS)
        .with_group_bit_width(GROUP_BITS)
        .with_batch_size(2)
}

fn placement(version: PlacementVersion, replicas: impl Fn(u32) -> Vec<NodeId>) -> PlacementTable {
    let mut table = PlacementTable::new(version);
    for t in 0..(1 << TOKEN_BITS) {
        table.set_replicas(Token(t), replicas(t));
    }
    table
}

fn tokens(range: Range<u32>) -> BTreeSet<Token> {
    range.map(Token).collect()
}

/// The first `count` object ids hashing to `token`.
fn objects_in(token: Token, count: usize, mod_ts: u64) -> Vec<ObjectRecord> {
    (0u64..)
        .map(ObjectId::from_u64)
        .filter(|id| id.token(TOKEN_BITS) == token)
        .take(count)
        .map(|id| ObjectRecord::new(id, 1, mod_ts, format!("{}@{}", id, mod_ts)))
        .collect()
}

fn seed(node: &TestNode, range: Range<u32>, per_token: usize) {
    for token in range {
        for record in objects_in(Token(token), per_token, 10) {
            node.store.put(record);
        }
    }
}

fn records_in(node: &TestNode, range: Range<u32>) -> Vec<ObjectRecord> {
    let tokens = tokens(range);
    node.store
        .records()
        .into_iter()
        .filter(|r| tokens.contains(&r.id.token(TOKEN_BITS)))
        .collect()
}

/// Put every node but `dest` into the migration with nothing to pull, then
/// start `dest`.
async fn start_all(
    cluster: &TestCluster,
    version: PlacementVersion,
    dest: NodeId,
    sources: &[(NodeId, Range<u32>)],
) -> MigrationAck {
    for node in cluster.nodes.iter().filter(|n| n.id != dest) {
        let ack = node
            .coordinator
            .start_migration(version, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(resolved(ack).await, Ok(()));
    }
    let sources = sources
        .iter()
        .map(|(node, range)| (*node, tokens(range.clone())))
        .collect();
    cluster
        .node(dest)
        .coordinator
        .start_migration(version, sources)
        .await
        .unwrap()
}

async fn resolved(ack: MigrationAck) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(60), ack)
        .await
        .expect("migration was not acknowledged")
        .expect("acknowledgement dropped")
}

fn stream_of(node: &TestNode, group: u32) -> StreamId {
    let ids = node.coordinator.executors_for_group(TokenGroup(group));
    assert_eq!(ids.len(), 1, "group {} executors: {:?}", group, ids);
    ids[0]
}

#[tokio::test]
async fn test_groups_run_one_at_a_time_and_converge() {
    init_tracing();
    let cluster = TestCluster::new(&[1, 2, 3], config(), placement(1, |_| vec![2, 3])).unwrap();
    seed(cluster.node(2), 0..16, 3);
    seed(cluster.node(3), 0..16, 3);
    // One object already present on the destination is not resent.
    let known = objects_in(Token(4), 1, 10).remove(0);
    cluster.node(1).store.put(known);

    let ack = start_all(&cluster, 2, 1, &[(2, 0..16)]).await;
    cluster.network.settle().await;
    assert_eq!(resolved(ack).await, Ok(()));

    let dest = cluster.node(1);
    assert_eq!(dest.coordinator.executor_ids().len(), 2);
    let stream_a = stream_of(dest, 0);
    let stream_b = stream_of(dest, 1);

    // Group B starts only after group A's first round has been fully streamed.
    let log = cluster.network.deliveries();
    let last_delta = |stream: StreamId| {
        log.iter()
            .rposition(|d| {
                matches!(&d.msg, MigrationMessage::DeltaSet(s)
                    if s.stream_id == stream && s.round == 1 && s.is_last)
            })
            .unwrap()
    };
    let first_filter_b = log
        .iter()
        .position(|d| matches!(&d.msg, MigrationMessage::FilterSet(f) if f.stream_id == stream_b))
        .unwrap();
    assert!(last_delta(stream_a) < first_filter_b);

    // Round 2 waits for round 1 of every group.
    let second_a = log
        .iter()
        .position(|d| matches!(&d.msg, MigrationMessage::GetSecondDeltaSet(g) if g.stream_id == stream_a))
        .unwrap();
    assert!(last_delta(stream_b) < second_a);

    assert_eq!(records_in(dest, 0..16), records_in(cluster.node(2), 0..16));
    assert_eq!(dest.coordinator.metrics().objects_applied.get(), 16 * 3 - 1);
    assert!((0..16).all(|t| dest.coordinator.availability().is_available(Token(t))));
    for id in dest.coordinator.executor_ids() {
        let (state, _, _) = dest.coordinator.executor_info(id).await.unwrap();
        assert_eq!(state, ExecutorState::Complete);
    }

    // Finishing the streams does not end the migration.
    assert_eq!(dest.coordinator.state(), MigrationState::InProgress);

    let new = placement(2, |t| if t < 16 { vec![1, 2, 3] } else { vec![2, 3] });
    for result in cluster.close_placement(&new).await {
        assert_eq!(result, Ok(()));
    }
    cluster.network.settle().await;
    for node in &cluster.nodes {
        assert_eq!(node.coordinator.state(), MigrationState::Idle);
        assert!(node.coordinator.executor_ids().is_empty());
        assert!(node.coordinator.client_ids().is_empty());
    }
    let record = dest.ledger.record();
    assert_eq!(record.owned, tokens(0..16));
    assert!(record.pending_resync.is_empty());
}

#[tokio::test]
async fn test_second_round_runs_one_group_at_a_time() {
    init_tracing();
    let cluster = TestCluster::new(&[1, 2, 3], config(), placement(1, |_| vec![2, 3])).unwrap();
    seed(cluster.node(2), 0..16, 2);
    cluster.network.hold(2, "get_second_delta_set");

    let ack = start_all(&cluster, 2, 1, &[(2, 0..16)]).await;
    cluster.network.settle().await;

    let dest = cluster.node(1);
    let stream_a = stream_of(dest, 0);
    let stream_b = stream_of(dest, 1);
    let second_request = |d: &super::Delivery, stream: StreamId| {
        matches!(&d.msg, MigrationMessage::GetSecondDeltaSet(g) if g.stream_id == stream)
    };

    // Round 1 is done everywhere; group A's round 2 is stuck at the source.
    let held = cluster.network.held();
    assert_eq!(held.len(), 1);
    assert!(second_request(&held[0], stream_a));
    assert!(!cluster
        .network
        .deliveries()
        .iter()
        .any(|d| second_request(d, stream_b)));
    let (state, _, _) = dest.coordinator.executor_info(stream_b).await.unwrap();
    assert_eq!(state, ExecutorState::FirstPhaseDone);

    cluster.network.release(2, "get_second_delta_set").unwrap();
    cluster.network.settle().await;
    assert_eq!(resolved(ack).await, Ok(()));

    let log = cluster.network.deliveries();
    let last_second_delta_a = log
        .iter()
        .rposition(|d| {
            matches!(&d.msg, MigrationMessage::DeltaSet(s)
                if s.stream_id == stream_a && s.round == 2 && s.is_last)
        })
        .unwrap();
    let second_b = log.iter().position(|d| second_request(d, stream_b)).unwrap();
    assert!(last_second_delta_a < second_b);
    assert_eq!(records_in(dest, 0..16), records_in(cluster.node(2), 0..16));
}

#[tokio::test]
async fn test_source_not_ready_token_retried_against_alternate() {
    init_tracing();
    let cluster = TestCluster::new(&[1, 2, 3], config(), placement(1, |_| vec![2, 3])).unwrap();
    seed(cluster.node(2), 0..8, 2);
    seed(cluster.node(3), 0..8, 2);
    cluster
        .node(2)
        .coordinator
        .availability()
        .mark_unavailable([Token(5)]);

    let ack = start_all(&cluster, 2, 1, &[(2, 0..8)]).await;
    cluster.network.settle().await;
    assert_eq!(resolved(ack).await, Ok(()));

    let dest = cluster.node(1);
    let rejected: Vec<Token> = cluster
        .network
        .deliveries()
        .into_iter()
        .filter_map(|d| match d.msg {
            MigrationMessage::FilterSetAck(a) if d.from == 2 => Some(a.rejected),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(rejected, vec![Token(5)]);

    let ids = dest.coordinator.executor_ids();
    assert_eq!(ids.len(), 2);
    let mut by_source = BTreeMap::new();
    for id in ids {
        let (state, source, tokens) = dest.coordinator.executor_info(id).await.unwrap();
        assert_eq!(state, ExecutorState::Complete);
        by_source.insert(source, tokens);
    }
    assert_eq!(by_source[&3], BTreeSet::from([Token(5)]));
    assert_eq!(by_source[&2], tokens(0..8));

    let metrics = dest.coordinator.metrics();
    assert_eq!(metrics.tokens_retried.get(), 1);
    assert_eq!(metrics.executors_retried.get(), 1);
    assert_eq!(metrics.token_failures.get("source_not_ready"), 1);

    assert_eq!(records_in(dest, 5..6), records_in(cluster.node(3), 5..6));
    assert_eq!(records_in(dest, 0..8), records_in(cluster.node(2), 0..8));
    assert!(dest.coordinator.availability().is_available(Token(5)));
}

#[tokio::test]
async fn test_writes_forwarded_during_cutover() {
    init_tracing();
    let cluster = TestCluster::new(&[1, 2, 3], config(), placement(1, |_| vec![2, 3])).unwrap();
    seed(cluster.node(2), 0..8, 3);

    let ack = start_all(&cluster, 2, 1, &[(2, 0..8)]).await;
    cluster.network.settle().await;
    assert_eq!(resolved(ack).await, Ok(()));

    let source = cluster.node(2);
    let dest = cluster.node(1);
    let client = source.coordinator.client_ids()[0];
    assert_eq!(
        source.coordinator.client(client).unwrap().forwarding_tokens(),
        tokens(0..8)
    );

    let fresh = objects_in(Token(3), 4, 99).remove(3);
    assert!(source.write(fresh.clone(), 1));
    cluster.network.settle().await;
    assert_eq!(dest.store.get(&fresh.id), Some(fresh));
    assert_eq!(source.coordinator.metrics().writes_forwarded.get(), 1);

    // Writer already on the new placement.
    let current = objects_in(Token(3), 5, 99).remove(4);
    assert!(!source.write(current.clone(), 2));

    // Writes that came in through forwarding are not relayed again.
    let relayed = WriteRequest {
        object: current.clone(),
        forwarded_from: Some(3),
    };
    assert!(!source.coordinator.forward_req_if_needed(&current.id, 1, &relayed));

    // Tokens outside the stream.
    let elsewhere = objects_in(Token(20), 1, 99).remove(0);
    assert!(!source.write(elsewhere, 1));

    let new = placement(2, |t| if t < 8 { vec![1, 2, 3] } else { vec![2, 3] });
    cluster.close_placement(&new).await;
    cluster.network.settle().await;

    let late = objects_in(Token(3), 6, 120).remove(5);
    assert!(!source.write(late.clone(), 1));
    assert!(source.coordinator.client_ids().is_empty());
    cluster.network.settle().await;
    assert_eq!(dest.store.get(&late.id), None);
}

#[tokio::test]
async fn test_redelivered_delta_set_is_noop() {
    init_tracing();
    let cluster = TestCluster::new(&[1, 2, 3], config(), placement(1, |_| vec![2, 3])).unwrap();
    seed(cluster.node(2), 0..8, 3);

    let ack = start_all(&cluster, 2, 1, &[(2, 0..8)]).await;
    cluster.network.settle().await;
    assert_eq!(resolved(ack).await, Ok(()));

    let dest = cluster.node(1);
    let delta = cluster
        .network
        .deliveries()
        .into_iter()
        .find_map(|d| match d.msg {
            MigrationMessage::DeltaSet(s) if !s.objects.is_empty() => Some(s),
            _ => None,
        })
        .unwrap();

    let before = dest.store.records();
    let mark = dest.store.mark();
    let duplicates = dest.coordinator.metrics().delta_sets_duplicate.get();

    dest.coordinator
        .handle_message(2, MigrationMessage::DeltaSet(delta.clone()))
        .await
        .unwrap();
    dest.coordinator
        .handle_message(2, MigrationMessage::DeltaSet(delta))
        .await
        .unwrap();

    assert_eq!(dest.store.records(), before);
    assert_eq!(dest.store.mark(), mark);
    assert_eq!(dest.coordinator.metrics().delta_sets_duplicate.get(), duplicates + 2);
}

#[tokio::test]
async fn test_group_abort_does_not_stop_other_groups() {
    init_tracing();
    // Group 0 lives only on node 4, which is down.
    let old = placement(1, |t| if t < 8 { vec![4] } else { vec![2, 3] });
    let cluster = TestCluster::new(&[1, 2, 3], config(), old).unwrap();
    seed(cluster.node(2), 8..16, 2);

    let ack = start_all(&cluster, 2, 1, &[(4, 0..8), (2, 8..16)]).await;
    cluster.network.settle().await;
    assert_eq!(
        resolved(ack).await,
        Err(Error::RetriesExhausted {
            group: TokenGroup(0),
            token: Token(0)
        })
    );

    let dest = cluster.node(1);
    assert_eq!(dest.coordinator.state(), MigrationState::Aborted);
    assert_eq!(records_in(dest, 8..16), records_in(cluster.node(2), 8..16));
    assert!((8..16).all(|t| dest.coordinator.availability().is_available(Token(t))));
    assert!((0..8).all(|t| !dest.coordinator.availability().is_available(Token(t))));

    let metrics = dest.coordinator.metrics().snapshot();
    assert_eq!(metrics.groups_aborted, 1);
    assert_eq!(metrics.aborted, 1);
    assert_eq!(metrics.completed, 0);

    let new = placement(2, |t| if t < 16 { vec![1, 2, 3] } else { vec![2, 3] });
    assert_eq!(dest.coordinator.handle_dlt_close(new).await, Ok(()));
    assert_eq!(dest.coordinator.state(), MigrationState::Idle);
    assert_eq!(dest.ledger.record().pending_resync, tokens(0..8));
}

#[tokio::test]
async fn test_close_rejected_then_orchestrator_abort() {
    init_tracing();
    let cluster = TestCluster::new(&[1, 2, 3], config(), placement(1, |_| vec![2, 3])).unwrap();
    cluster.network.set_silent(2, true);

    let ack = start_all(&cluster, 2, 1, &[(2, 0..8)]).await;
    cluster.network.settle().await;

    let dest = cluster.node(1);
    let new = placement(2, |t| if t < 8 { vec![1, 2, 3] } else { vec![2, 3] });
    let err = dest.coordinator.handle_dlt_close(new.clone()).await.unwrap_err();
    assert!(matches!(err, Error::NotReady(_)));
    assert_eq!(dest.coordinator.state(), MigrationState::InProgress);

    dest.coordinator.abort_migration_from_om(2).await.unwrap();
    assert!(matches!(resolved(ack).await, Err(Error::Aborted(_))));
    assert_eq!(dest.coordinator.state(), MigrationState::Aborted);

    assert_eq!(dest.coordinator.handle_dlt_close(new).await, Ok(()));
    assert_eq!(dest.coordinator.state(), MigrationState::Idle);
}

#[tokio::test]
async fn test_force_close_then_resync_after_recover() {
    init_tracing();
    let config = config().with_dlt_close_policy(DltClosePolicy::ForceComplete);
    let cluster = TestCluster::new(&[1, 2, 3], config, placement(1, |_| vec![2, 3])).unwrap();
    seed(cluster.node(2), 0..8, 2);
    seed(cluster.node(3), 0..8, 2);
    cluster.network.set_silent(2, true);

    let ack = start_all(&cluster, 2, 1, &[(2, 0..8)]).await;
    cluster.network.settle().await;

    let new = placement(2, |t| if t < 8 { vec![1, 2, 3] } else { vec![2, 3] });
    for result in cluster.close_placement(&new).await {
        assert_eq!(result, Ok(()));
    }
    assert!(matches!(resolved(ack).await, Err(Error::Aborted(_))));

    let dest = cluster.node(1);
    assert_eq!(dest.coordinator.state(), MigrationState::Idle);
    assert_eq!(dest.ledger.record().pending_resync, tokens(0..8));
    assert!((0..8).all(|t| !dest.coordinator.availability().is_available(Token(t))));

    cluster.network.set_silent(2, false);
    dest.coordinator.recover().await.unwrap();
    assert_eq!(dest.ledger.record().pending_resync, tokens(0..8));

    let resync = dest.coordinator.start_resync().await.unwrap();
    cluster.network.settle().await;
    assert_eq!(resolved(resync).await, Ok(()));

    assert_eq!(dest.coordinator.state(), MigrationState::Idle);
    assert!(dest.coordinator.executor_ids().is_empty());
    let record = dest.ledger.record();
    assert!(record.pending_resync.is_empty());
    assert_eq!(record.owned, tokens(0..8));
    assert!((0..8).all(|t| dest.coordinator.availability().is_available(Token(t))));
    assert_eq!(records_in(dest, 0..8), records_in(cluster.node(2), 0..8));
    assert!(cluster.node(2).coordinator.client_ids().is_empty());
}

#[tokio::test]
async fn test_resync_with_nothing_pending_acks_immediately() {
    let cluster = TestCluster::new(&[1, 2], config(), placement(1, |_| vec![1, 2])).unwrap();
    let ack = cluster.node(1).coordinator.start_resync().await.unwrap();
    assert_eq!(resolved(ack).await, Ok(()));
    assert_eq!(cluster.node(1).coordinator.state(), MigrationState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_silent_sources_time_out_and_exhaust_retries() {
    init_tracing();
    let config = config()
        .with_source_timeout(Duration::from_secs(5))
        .with_inactivity_timeout(Duration::from_secs(600))
        .with_watchdog_interval(Duration::from_secs(1))
        .with_max_retries(1);
    let cluster = TestCluster::new(&[1, 2, 3], config, placement(1, |_| vec![2, 3])).unwrap();
    cluster.network.set_silent(2, true);
    cluster.network.set_silent(3, true);

    let ack = start_all(&cluster, 2, 1, &[(2, 0..8)]).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(
        resolved(ack).await,
        Err(Error::RetriesExhausted {
            group: TokenGroup(0),
            token: Token(0)
        })
    );
    let dest = cluster.node(1);
    assert_eq!(dest.coordinator.state(), MigrationState::Aborted);
    let metrics = dest.coordinator.metrics();
    assert_eq!(metrics.executors_retried.get(), 1);
    assert_eq!(metrics.token_failures.get("timeout"), 16);

    // The retry went to the other replica.
    let filter_targets: BTreeSet<NodeId> = cluster
        .network
        .deliveries()
        .into_iter()
        .filter(|d| d.from == 1 && matches!(d.msg, MigrationMessage::FilterSet(_)))
        .map(|d| d.to)
        .collect();
    assert_eq!(filter_targets, BTreeSet::from([2, 3]));
}

#[tokio::test(start_paused = true)]
async fn test_inactivity_aborts_whole_migration() {
    init_tracing();
    let config = config()
        .with_source_timeout(Duration::from_secs(600))
        .with_inactivity_timeout(Duration::from_secs(10))
        .with_watchdog_interval(Duration::from_secs(1));
    let cluster = TestCluster::new(&[1, 2, 3], config, placement(1, |_| vec![2, 3])).unwrap();
    cluster.network.set_silent(2, true);

    let ack = start_all(&cluster, 2, 1, &[(2, 0..8)]).await;
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(resolved(ack).await, Err(Error::Timeout));
    let dest = cluster.node(1);
    assert_eq!(dest.coordinator.state(), MigrationState::Aborted);
    assert!(dest.coordinator.executor_ids().is_empty());
    assert_eq!(dest.coordinator.metrics().snapshot().aborted, 1);
    assert!(cluster.network.deliveries().iter().any(|d| d.from == 1
        && d.to == 2
        && matches!(d.msg, MigrationMessage::FinishResync(_))));
}
