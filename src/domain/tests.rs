//! Multi-member scenarios. Every member's Domain is driven directly, over one in-memory group and
//! one mocked clock, so the interleaving is deterministic.
use crate::actor::{self, ActorClient, Event};
use crate::api::{create_event_stream, FenceEvent, FenceEventStream};
use crate::cluster::{InMemoryDirectory, InMemoryFenceAgent};
use crate::domain::domain::{domain_instance_id, Domain, DomainConfig};
use crate::domain::timers::{mocked_clock, MockClock, MockClockController};
use crate::domain::{ChangeState, DomainStatus, FenceMethod, NodeHistory, NodeId, RecoveryConfig};
use crate::group::{GroupEvent, InMemoryGroupHub, InMemoryReceiver};
use crate::protocol::{self, FenceMessage, MessageFlags};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

const GROUP: &str = "default";
const POST_JOIN_DELAY: Duration = Duration::from_secs(6);
const OVERRIDE_TIME: Duration = Duration::from_secs(3);

fn node(id: u32) -> NodeId {
    NodeId::new(id)
}

struct TestNode {
    domain: Domain<MockClock>,
    receiver: InMemoryReceiver,
    actor_rx: mpsc::Receiver<Event>,
    // Keeps the fence tasks' weak clients upgradable.
    _actor_client: ActorClient,
    events: FenceEventStream,
}

struct TestCluster {
    hub: InMemoryGroupHub,
    directory: InMemoryDirectory,
    agent: InMemoryFenceAgent,
    clock: MockClock,
    clock_controller: MockClockController,
    clean_start: bool,
    nodes: BTreeMap<NodeId, TestNode>,
}

impl TestCluster {
    fn new(configured: &[u32]) -> Self {
        let (clock, clock_controller) = mocked_clock();
        TestCluster {
            hub: InMemoryGroupHub::new(),
            directory: InMemoryDirectory::with_nodes(configured),
            agent: InMemoryFenceAgent::new(),
            clock,
            clock_controller,
            clean_start: false,
            nodes: BTreeMap::new(),
        }
    }

    /// Forms a domain of `ids`, joining them one by one.
    async fn formed(configured: &[u32], ids: &[u32]) -> Self {
        let mut cluster = TestCluster::new(configured);
        for id in ids {
            cluster.join(*id).await;
        }
        cluster
    }

    async fn join(&mut self, id: u32) {
        self.join_unsettled(id, NodeHistory::new());
        self.settle().await;
    }

    fn join_unsettled(&mut self, id: u32, history: NodeHistory) {
        let node_id = node(id);
        let (sender, receiver) = self.hub.join_node(GROUP, node_id).unwrap();
        let (actor_client, actor_rx) = ActorClient::new(64);
        let (event_publisher, events) = create_event_stream();

        let domain = Domain::new(DomainConfig {
            logger: slog::Logger::root(slog::Discard, slog::o!()),
            name: GROUP.to_string(),
            my_node_id: node_id,
            clock: self.clock.clone(),
            sender: Box::new(sender),
            directory: Arc::new(self.directory.clone()),
            agent: Arc::new(self.agent.clone()),
            actor_client: actor_client.weak(),
            event_publisher,
            history,
            clean_start: self.clean_start,
            override_time: OVERRIDE_TIME,
            recovery: RecoveryConfig {
                post_join_delay: POST_JOIN_DELAY,
                post_fail_delay: Duration::from_secs(0),
                retry_min_backoff: Duration::from_secs(1),
                retry_max_backoff: Duration::from_secs(60),
            },
        });

        let test_node = TestNode {
            domain,
            receiver,
            actor_rx,
            _actor_client: actor_client,
            events,
        };
        self.nodes.insert(node_id, test_node);
    }

    /// Crashes the node: it vanishes from the group without leaving.
    fn fail(&mut self, id: u32) {
        self.hub.fail_node(GROUP, node(id)).unwrap();
        self.nodes.remove(&node(id));
    }

    fn domain(&mut self, id: u32) -> &mut Domain<MockClock> {
        &mut self.nodes.get_mut(&node(id)).expect("No such node").domain
    }

    fn status(&self, id: u32) -> DomainStatus {
        self.nodes.get(&node(id)).expect("No such node").domain.status()
    }

    fn events(&mut self, id: u32) -> Vec<FenceEvent> {
        let test_node = self.nodes.get_mut(&node(id)).expect("No such node");
        let mut events = Vec::new();
        while let Some(event) = test_node.events.try_next() {
            events.push(event);
        }
        events
    }

    fn inject(&mut self, id: u32, sender: NodeId, payload: Bytes) {
        self.domain(id)
            .handle_group_event(GroupEvent::Message { sender, payload });
    }

    /// Delivers group events and actor events until nothing moves anymore. Yields in between so
    /// spawned fence tasks get to report back.
    async fn settle(&mut self) {
        let mut idle_rounds = 0;
        while idle_rounds < 3 {
            let mut progressed = false;
            for test_node in self.nodes.values_mut() {
                while let Some(event) = test_node.receiver.try_next() {
                    test_node.domain.handle_group_event(event);
                    progressed = true;
                }
                while let Ok(event) = test_node.actor_rx.try_recv() {
                    actor::dispatch_event(&mut test_node.domain, event);
                    progressed = true;
                }
            }

            if progressed {
                idle_rounds = 0;
            } else {
                idle_rounds += 1;
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    async fn tick_all(&mut self) {
        for test_node in self.nodes.values_mut() {
            test_node.domain.handle_tick();
        }
        self.settle().await;
    }

    async fn advance(&mut self, duration: Duration) {
        self.clock_controller.advance(duration);
        self.tick_all().await;
    }
}

// Three members form a domain, one fails, the master fences it and everyone records it.
#[tokio::test]
async fn failed_member_is_fenced_by_master() {
    let mut cluster = TestCluster::formed(&[1, 2, 3], &[1, 2, 3]).await;
    for id in 1..=3 {
        let status = cluster.status(id);
        assert!(status.init_complete, "node {} not complete", id);
        assert_eq!(status.master, Some(node(1)));
        assert!(status.victims.is_empty());
        assert!(status.changes.is_empty());
    }

    cluster.fail(3);
    cluster.settle().await;

    assert_eq!(cluster.agent.calls(), vec![node(3)]);
    for id in 1..=2 {
        let status = cluster.status(id);
        let entry = status.history_of(node(3)).unwrap();
        assert!(entry.is_fenced());
        assert_eq!(entry.fence_master, Some(node(1)));
        assert_eq!(entry.fence_how, Some(FenceMethod::Agent));
        assert!(status.victims.is_empty());
        assert!(status.changes.is_empty());
    }

    let events = cluster.events(2);
    assert!(events.contains(&FenceEvent::VictimFenced {
        victim: node(3),
        how: FenceMethod::Agent,
        reporter: node(1),
    }));
    assert!(events.contains(&FenceEvent::FencingDeferred { master: Some(node(1)) }));
}

#[tokio::test]
async fn fencing_waits_for_quorum() {
    let mut cluster = TestCluster::formed(&[1, 2, 3], &[1, 2, 3]).await;
    cluster.directory.set_quorate(false);

    cluster.fail(3);
    cluster.settle().await;
    cluster.advance(Duration::from_secs(10)).await;

    assert!(cluster.agent.calls().is_empty());
    let status = cluster.status(1);
    assert_eq!(status.changes.len(), 1);
    assert_eq!(status.changes[0].state, ChangeState::WaitConditions);
    assert_eq!(status.changes[0].failed_count, 1);
    assert!(!status.history_of(node(3)).unwrap().is_fenced());

    cluster.directory.set_quorate(true);
    cluster.tick_all().await;

    assert_eq!(cluster.agent.calls(), vec![node(3)]);
    assert!(cluster.status(1).changes.is_empty());
    assert!(cluster.status(2).history_of(node(3)).unwrap().is_fenced());
}

#[tokio::test]
async fn failed_agent_is_retried_with_backoff() {
    let mut cluster = TestCluster::formed(&[1, 2, 3], &[1, 2, 3]).await;
    cluster.agent.fail_next(node(3), 2);

    cluster.fail(3);
    cluster.settle().await;
    assert_eq!(cluster.agent.calls_for(node(3)), 1);
    assert!(cluster.status(1).is_victim(node(3)));

    // Retries are not due before their backoff.
    cluster.tick_all().await;
    assert_eq!(cluster.agent.calls_for(node(3)), 1);

    cluster.advance(Duration::from_secs(2)).await;
    assert_eq!(cluster.agent.calls_for(node(3)), 2);

    cluster.advance(Duration::from_secs(3)).await;
    assert_eq!(cluster.agent.calls_for(node(3)), 3);
    assert!(cluster.status(2).history_of(node(3)).unwrap().is_fenced());

    let failures: Vec<FenceEvent> = cluster
        .events(1)
        .into_iter()
        .filter(|event| matches!(event, FenceEvent::FenceAttemptFailed { .. }))
        .collect();
    assert_eq!(
        failures,
        vec![
            FenceEvent::FenceAttemptFailed { victim: node(3), attempts: 1 },
            FenceEvent::FenceAttemptFailed { victim: node(3), attempts: 2 },
        ]
    );
}

// A node joining while a failure is being handled gets COMPLETE once the queue drained, and
// carries the history forward.
#[tokio::test]
async fn joiner_receives_complete_after_pending_failure() {
    let mut cluster = TestCluster::formed(&[1, 2, 3, 4], &[1, 2, 3]).await;
    cluster.agent.fail_next(node(3), 100);

    cluster.fail(3);
    cluster.settle().await;
    cluster.join(4).await;

    let joiner = cluster.status(4);
    assert!(joiner.joining);
    assert!(!joiner.init_complete);
    assert_eq!(cluster.status(1).changes.len(), 2);

    cluster.domain(2).handle_override(node(3));
    cluster.settle().await;

    let joiner = cluster.status(4);
    assert!(joiner.init_complete);
    assert!(joiner.changes.is_empty());
    let entry = joiner.history_of(node(3)).unwrap();
    assert_eq!(entry.fence_how, Some(FenceMethod::Override));
    assert_eq!(entry.fence_master, Some(node(2)));
    assert!(joiner.complete_nodes.contains(&node(1)));

    assert!(cluster.events(1).contains(&FenceEvent::CompleteSent { to: node(4) }));
    assert!(cluster.events(4).contains(&FenceEvent::CompleteReceived { from: node(1) }));
}

#[tokio::test]
async fn override_bypasses_lost_quorum_after_override_time() {
    let mut cluster = TestCluster::formed(&[1, 2, 3], &[1, 2, 3]).await;
    cluster.directory.set_quorate(false);

    cluster.fail(3);
    cluster.settle().await;
    cluster.domain(1).handle_override(node(3));
    cluster.settle().await;
    assert!(!cluster.status(1).history_of(node(3)).unwrap().is_fenced());

    cluster.advance(OVERRIDE_TIME).await;

    assert!(cluster.agent.calls().is_empty());
    for id in 1..=2 {
        let status = cluster.status(id);
        let entry = status.history_of(node(3)).unwrap();
        assert_eq!(entry.fence_how, Some(FenceMethod::Override));
        assert!(status.changes.is_empty());
    }
}

#[tokio::test]
async fn external_report_satisfies_victim_and_late_agent_result_is_discarded() {
    let mut cluster = TestCluster::formed(&[1, 2, 3], &[1, 2, 3]).await;
    cluster.agent.pause();

    cluster.fail(3);
    cluster.settle().await;
    assert_eq!(cluster.agent.calls(), vec![node(3)]);
    // Only the excuse from when the domain formed.
    let formed_fence = cluster.status(1).history_of(node(3)).unwrap().fence_time;

    cluster.domain(2).handle_external_fence(node(3)).unwrap();
    cluster.settle().await;

    for id in 1..=2 {
        let status = cluster.status(id);
        let entry = status.history_of(node(3)).unwrap();
        assert!(entry.is_fenced());
        assert_eq!(entry.fence_external_node, Some(node(2)));
        assert_eq!(entry.fence_time, formed_fence);
        assert!(status.changes.is_empty());
        assert!(status.victims.is_empty());
    }

    cluster.agent.resume();
    cluster.settle().await;
    let entry = cluster.status(1).history_of(node(3)).unwrap().clone();
    assert_eq!(entry.fence_time, formed_fence);
    assert_eq!(entry.fence_how, Some(FenceMethod::Member));
}

#[tokio::test]
async fn duplicate_and_stale_reports_are_ignored() {
    let mut cluster = TestCluster::formed(&[1, 2, 3], &[1, 2, 3]).await;
    cluster.fail(3);
    cluster.settle().await;
    let fenced = cluster.status(1).history_of(node(3)).unwrap().clone();

    // A second report for an already fenced node.
    let duplicate = protocol::encode(
        node(2),
        domain_instance_id(GROUP),
        None,
        MessageFlags::COMPLETE,
        &FenceMessage::VictimDone {
            victim: node(3),
            how: FenceMethod::Override,
        },
    );
    cluster.inject(1, node(2), duplicate);
    assert_eq!(cluster.status(1).history_of(node(3)).unwrap(), &fenced);

    // A report for a live member nobody owes a fence.
    cluster.domain(2).handle_external_fence(node(1)).unwrap();
    cluster.settle().await;
    assert!(!cluster.status(1).history_of(node(1)).unwrap().is_fenced());

    // An override for a node that is not a victim.
    cluster.domain(1).handle_override(node(2));
    cluster.settle().await;
    assert!(!cluster.status(2).history_of(node(2)).unwrap().is_fenced());
    assert_eq!(cluster.agent.calls(), vec![node(3)]);
}

#[tokio::test]
async fn malformed_and_forged_messages_are_violations() {
    let mut cluster = TestCluster::formed(&[1, 2], &[1, 2]).await;
    let _ = cluster.events(1);

    cluster.inject(1, node(2), Bytes::from_static(b"garbage"));

    let forged = protocol::encode(
        node(3),
        domain_instance_id(GROUP),
        None,
        MessageFlags::COMPLETE,
        &FenceMessage::External { victim: node(2) },
    );
    cluster.inject(1, node(2), forged);

    let foreign = protocol::encode(
        node(2),
        domain_instance_id("other"),
        None,
        MessageFlags::COMPLETE,
        &FenceMessage::External { victim: node(2) },
    );
    cluster.inject(1, node(2), foreign);

    let violations = cluster
        .events(1)
        .into_iter()
        .filter(|event| matches!(event, FenceEvent::ProtocolViolation { sender, .. } if *sender == node(2)))
        .count();
    assert_eq!(violations, 3);
    assert!(cluster.status(1).init_complete);
    assert!(!cluster.domain(1).has_exited());
}

#[tokio::test]
async fn start_missing_outstanding_victims_is_reported() {
    let mut cluster = TestCluster::formed(&[1, 2, 3], &[1, 2, 3]).await;
    cluster.agent.pause();
    cluster.fail(3);
    cluster.settle().await;
    let _ = cluster.events(2);

    let agreeing = protocol::encode(
        node(1),
        domain_instance_id(GROUP),
        None,
        MessageFlags::COMPLETE,
        &FenceMessage::Start { victims: vec![node(3)] },
    );
    cluster.inject(2, node(1), agreeing);
    assert!(cluster.events(2).is_empty());

    let short = protocol::encode(
        node(1),
        domain_instance_id(GROUP),
        None,
        MessageFlags::COMPLETE,
        &FenceMessage::Start { victims: vec![] },
    );
    cluster.inject(2, node(1), short);
    assert_eq!(
        cluster.events(2),
        vec![FenceEvent::StartMismatch {
            from: node(1),
            announced: vec![],
            outstanding: vec![node(3)],
        }]
    );
    assert!(cluster.status(2).is_victim(node(3)));
}

#[tokio::test]
async fn clean_leave_is_not_fenced() {
    let mut cluster = TestCluster::formed(&[1, 2, 3], &[1, 2, 3]).await;

    cluster.domain(3).handle_leave().unwrap();
    cluster.settle().await;

    assert!(cluster.domain(3).has_exited());
    assert!(cluster.agent.calls().is_empty());
    let status = cluster.status(1);
    let entry = status.history_of(node(3)).unwrap();
    assert!(entry.left_time.is_some());
    assert!(entry.fail_time.is_none());
    assert!(!entry.is_fenced());
    assert!(status.changes.is_empty());

    let exit = cluster.nodes.remove(&node(3)).unwrap().domain.into_exit();
    assert!(exit.result.is_ok());
    assert!(exit.history.entry(node(3)).is_some());
}

#[tokio::test]
async fn new_master_takes_over_victims() {
    let mut cluster = TestCluster::formed(&[1, 2, 3], &[1, 2, 3]).await;
    cluster.agent.pause();

    cluster.fail(3);
    cluster.settle().await;
    cluster.fail(1);
    cluster.settle().await;

    let status = cluster.status(2);
    assert_eq!(status.master, Some(node(2)));
    assert_eq!(cluster.agent.calls(), vec![node(3), node(3)]);

    cluster.agent.resume();
    cluster.settle().await;

    let status = cluster.status(2);
    assert_eq!(status.history_of(node(3)).unwrap().fence_master, Some(node(2)));
    assert_eq!(status.history_of(node(1)).unwrap().fence_master, Some(node(2)));
    assert!(status.changes.is_empty());
    assert!(status.victims.is_empty());
}

// A joiner with a lower id has no history yet, so it must not take over fencing before COMPLETE.
#[tokio::test]
async fn lower_id_joiner_does_not_become_master_while_joining() {
    let mut cluster = TestCluster::formed(&[1, 2, 3, 4], &[2, 3, 4]).await;
    cluster.agent.fail_next(node(4), 1);

    cluster.fail(4);
    cluster.settle().await;
    assert_eq!(cluster.agent.calls_for(node(4)), 1);
    cluster.join(1).await;

    for id in 2..=3 {
        assert_eq!(cluster.status(id).master, Some(node(2)), "node {} disagrees", id);
    }
    // The joiner has not heard from a complete member yet.
    let joiner = cluster.status(1);
    assert_eq!(joiner.master, None);
    assert!(!joiner.init_complete);

    cluster.advance(Duration::from_secs(2)).await;

    assert_eq!(cluster.agent.calls_for(node(4)), 2);
    for id in 1..=3 {
        let status = cluster.status(id);
        assert!(status.init_complete, "node {} not complete", id);
        let entry = status.history_of(node(4)).unwrap();
        assert!(entry.is_fenced());
        assert_eq!(entry.fence_master, Some(node(2)));
        assert!(status.changes.is_empty());
        // Complete now, the lowest id takes over.
        assert_eq!(status.master, Some(node(1)));
    }
}

// A failed node that comes back before it was fenced still owes the fence.
#[tokio::test]
async fn rejoining_victim_is_still_fenced() {
    let mut cluster = TestCluster::formed(&[1, 2, 3], &[1, 2, 3]).await;
    cluster.directory.set_quorate(false);

    cluster.fail(3);
    cluster.settle().await;
    cluster.join(3).await;
    cluster.tick_all().await;

    assert!(cluster.agent.calls().is_empty());
    assert!(!cluster.status(3).init_complete);
    assert_eq!(cluster.status(1).changes.len(), 2);

    // History stamps are wall-clock milliseconds; the fence must postdate node 3's own add stamp.
    tokio::time::sleep(Duration::from_millis(5)).await;
    cluster.directory.set_quorate(true);
    cluster.tick_all().await;

    assert_eq!(cluster.agent.calls(), vec![node(3)]);
    for id in 1..=3 {
        let status = cluster.status(id);
        assert!(status.init_complete, "node {} not complete", id);
        let entry = status.history_of(node(3)).unwrap();
        assert!(entry.is_fenced(), "node {} has no fence record for 3", id);
        assert_eq!(entry.fence_how, Some(FenceMethod::Agent));
        assert!(status.changes.is_empty());
    }
}

#[tokio::test]
async fn initial_victims_wait_for_post_join_delay() {
    let mut cluster = TestCluster::new(&[1, 2, 3]);
    cluster.directory.set_member(node(3), false);
    cluster.join(1).await;

    // Node 2 is still a cluster member, so it is excused rather than fenced.
    let status = cluster.status(1);
    assert_eq!(
        status.history_of(node(2)).unwrap().fence_how,
        Some(FenceMethod::Member)
    );
    assert!(status.is_victim(node(3)));
    assert!(cluster.agent.calls().is_empty());

    cluster.advance(POST_JOIN_DELAY / 2).await;
    assert!(cluster.agent.calls().is_empty());

    cluster.advance(POST_JOIN_DELAY / 2).await;
    assert_eq!(cluster.agent.calls(), vec![node(3)]);
    assert_eq!(
        cluster.status(1).history_of(node(3)).unwrap().fence_how,
        Some(FenceMethod::Agent)
    );

    // Having been fenced, node 3 may join.
    cluster.join(3).await;
    let status = cluster.status(3);
    assert!(status.init_complete);
    assert!(!status.history_of(node(3)).unwrap().is_fenced());
}

#[tokio::test]
async fn clean_start_skips_initial_victims() {
    let mut cluster = TestCluster::new(&[1, 2, 3]);
    cluster.clean_start = true;
    cluster.directory.set_member(node(3), false);
    cluster.join(1).await;
    cluster.advance(POST_JOIN_DELAY).await;

    let status = cluster.status(1);
    assert!(status.victims.is_empty());
    assert!(status.history.iter().all(|entry| !entry.is_fenced()));
    assert!(cluster.agent.calls().is_empty());
}

// Every member that could hand the joiner COMPLETE failed before doing so.
#[tokio::test]
async fn orphaned_joiner_declares_itself_complete() {
    let mut cluster = TestCluster::formed(&[1, 2, 3], &[1, 2]).await;
    cluster.directory.set_member(node(1), false);
    cluster.directory.set_member(node(2), false);

    cluster.join_unsettled(3, NodeHistory::new());
    cluster.fail(1);
    cluster.fail(2);
    cluster.settle().await;

    let status = cluster.status(3);
    assert!(status.init_complete);
    assert_eq!(status.master, Some(node(3)));
    assert!(cluster.agent.calls().is_empty());

    cluster.advance(POST_JOIN_DELAY).await;
    let status = cluster.status(3);
    for id in 1..=2 {
        let entry = status.history_of(node(id)).unwrap();
        assert!(entry.is_fenced(), "node {} not fenced", id);
        assert_eq!(entry.fence_master, Some(node(3)));
    }
    assert!(status.changes.is_empty());
}

#[tokio::test]
async fn complete_sender_failure_is_covered_by_next_member() {
    let mut cluster = TestCluster::formed(&[1, 2, 3], &[1, 2]).await;

    // Node 1 crashes right after node 3 joined, before it processed anything.
    cluster.join_unsettled(3, NodeHistory::new());
    cluster.fail(1);
    cluster.settle().await;

    let status = cluster.status(3);
    assert!(status.init_complete);
    assert!(status.history_of(node(1)).unwrap().is_fenced());
    assert!(cluster.events(2).contains(&FenceEvent::CompleteSent { to: node(3) }));
}

#[tokio::test]
async fn retained_history_survives_rejoin() {
    let mut cluster = TestCluster::formed(&[1, 2, 3], &[1, 2, 3]).await;
    cluster.fail(3);
    cluster.settle().await;

    cluster.domain(2).handle_leave().unwrap();
    cluster.settle().await;
    let exit = cluster.nodes.remove(&node(2)).unwrap().domain.into_exit();
    assert!(exit.history.entry(node(3)).unwrap().is_fenced());

    cluster.join_unsettled(2, exit.history.into_history());
    cluster.settle().await;

    let status = cluster.status(2);
    assert!(status.init_complete);
    let entry = status.history_of(node(3)).unwrap();
    assert_eq!(entry.fence_how, Some(FenceMethod::Agent));
    assert_eq!(entry.fence_master, Some(node(1)));
}
