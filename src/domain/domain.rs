use crate::actor::WeakActorClient;
use crate::api::{FenceEvent, FenceEventPublisher};
use crate::cluster::{AgentError, ClusterDirectory, FenceAgent};
use crate::domain::change::{Change, ChangeQueue, ChangeState};
use crate::domain::errors::{DomainFailure, RecoveryError};
use crate::domain::history::{FenceMethod, NodeHistory, RetainedHistory};
use crate::domain::master::{MasterChange, MasterElector};
use crate::domain::membership::MembershipTracker;
use crate::domain::recovery::{Deferral, FencingView, RecoveryConfig, RecoveryScheduler};
use crate::domain::status::{ChangeStatus, DomainStatus, VictimStatus};
use crate::domain::timers::Clock;
use crate::domain::victims::{Victim, VictimSet};
use crate::domain::NodeId;
use crate::group::{GroupEvent, GroupSender, MembershipEvent};
use crate::protocol::{self, DomainSnapshot, FenceMessage, MessageFlags, SnapshotVictim};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

pub(crate) struct DomainConfig<C: Clock> {
    pub(crate) logger: slog::Logger,
    pub(crate) name: String,
    pub(crate) my_node_id: NodeId,
    pub(crate) clock: C,
    pub(crate) sender: Box<dyn GroupSender>,
    pub(crate) directory: Arc<dyn ClusterDirectory>,
    pub(crate) agent: Arc<dyn FenceAgent>,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) event_publisher: FenceEventPublisher,
    pub(crate) history: NodeHistory,
    pub(crate) clean_start: bool,
    pub(crate) override_time: Duration,
    pub(crate) recovery: RecoveryConfig,
}

/// Outcome of one agent call, as reported back by the fence task.
#[derive(Debug)]
pub(crate) struct FenceResult {
    pub(crate) victim: NodeId,
    pub(crate) attempt_id: u64,
    pub(crate) result: Result<(), AgentError>,
}

/// A completion report from any source, applied in delivery order.
#[derive(Copy, Clone, Debug)]
struct FenceReport {
    victim: NodeId,
    reporter: NodeId,
    how: FenceMethod,
}

#[derive(Copy, Clone, Debug)]
struct QuorumBypass {
    seq: u32,
    armed_at: Instant,
}

/// What is left of a domain once it stopped.
#[derive(Debug)]
pub struct DomainExit {
    pub history: RetainedHistory,
    pub result: Result<(), DomainFailure>,
}

/// Domain is one member's view of a fence domain. It is driven exclusively by the domain actor,
/// one event at a time, and never blocks: fence agent calls run as spawned tasks whose results
/// come back as events.
pub(crate) struct Domain<C: Clock> {
    logger: slog::Logger,
    name: String,
    domain_id: u32,
    my_node_id: NodeId,
    clock: C,
    sender: Box<dyn GroupSender>,
    directory: Arc<dyn ClusterDirectory>,
    agent: Arc<dyn FenceAgent>,
    actor_client: WeakActorClient,
    events: FenceEventPublisher,
    clean_start: bool,
    override_time: Duration,

    tracker: MembershipTracker,
    elector: MasterElector,
    changes: ChangeQueue,
    history: NodeHistory,
    victims: VictimSet,
    recovery: RecoveryScheduler,

    init_complete: bool,
    leaving: bool,
    joined_at: Option<Instant>,
    // Members that predate our join and could still hand us COMPLETE.
    complete_sources: Option<BTreeSet<NodeId>>,
    forming_domain: bool,
    // Nodes that joined in the same change as us. They share our view of who predates them.
    join_cohort: BTreeSet<NodeId>,
    complete_nodes: BTreeSet<NodeId>,
    // Joiners whose join we resolved but whose COMPLETE we have not seen yet. The flag is set
    // once we sent it ourselves.
    awaiting_complete: BTreeMap<NodeId, bool>,
    buffered_reports: Vec<FenceReport>,
    pending_overrides: BTreeSet<NodeId>,
    quorum_bypass: Option<QuorumBypass>,
    quorum_wait_logged: bool,
    exit: Option<Result<(), DomainFailure>>,
}

impl<C: Clock> Domain<C> {
    pub(crate) fn new(config: DomainConfig<C>) -> Self {
        let logger = config
            .logger
            .new(slog::o!("Domain" => config.name.clone(), "NodeId" => config.my_node_id.as_u32()));

        Domain {
            logger,
            domain_id: domain_instance_id(&config.name),
            name: config.name,
            my_node_id: config.my_node_id,
            clock: config.clock,
            sender: config.sender,
            directory: config.directory,
            agent: config.agent,
            actor_client: config.actor_client,
            events: config.event_publisher,
            clean_start: config.clean_start,
            override_time: config.override_time,
            tracker: MembershipTracker::new(config.my_node_id),
            elector: MasterElector::new(),
            changes: ChangeQueue::new(),
            history: config.history,
            victims: VictimSet::new(),
            recovery: RecoveryScheduler::new(config.recovery),
            init_complete: false,
            leaving: false,
            joined_at: None,
            complete_sources: None,
            forming_domain: false,
            join_cohort: BTreeSet::new(),
            complete_nodes: BTreeSet::new(),
            awaiting_complete: BTreeMap::new(),
            buffered_reports: Vec::new(),
            pending_overrides: BTreeSet::new(),
            quorum_bypass: None,
            quorum_wait_logged: false,
            exit: None,
        }
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.exit.is_some()
    }

    pub(crate) fn into_exit(self) -> DomainExit {
        DomainExit {
            history: RetainedHistory::new(self.history),
            result: self.exit.unwrap_or(Ok(())),
        }
    }

    // ---------------------------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------------------------

    pub(crate) fn handle_group_event(&mut self, event: GroupEvent) {
        if self.has_exited() {
            return;
        }
        match event {
            GroupEvent::Membership(membership) => self.handle_membership(membership),
            GroupEvent::Message { sender, payload } => self.handle_message(sender, payload),
        }
        self.run_recovery();
    }

    pub(crate) fn handle_transport_closed(&mut self) {
        if self.has_exited() {
            return;
        }
        if self.leaving {
            slog::info!(self.logger, "Left the group");
            self.exit = Some(Ok(()));
        } else {
            self.fail(RecoveryError::TransportUnavailable("group receiver closed".into()));
        }
    }

    pub(crate) fn handle_fence_result(&mut self, fence_result: FenceResult) {
        let FenceResult {
            victim,
            attempt_id,
            result,
        } = fence_result;
        let logger = self.logger.new(slog::o!("Victim" => victim.as_u32()));

        let in_flight = match self.recovery.finish_attempt(attempt_id) {
            Some(in_flight) => in_flight,
            None => {
                slog::warn!(logger, "Result for unknown fence attempt {}", attempt_id);
                return;
            }
        };
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(in_flight.started_at);

        match result {
            Ok(()) => {
                let owed = self.victims.get(victim).map(|v| !v.report_sent).unwrap_or(false);
                if !owed || self.has_exited() {
                    slog::info!(logger, "Node {} was already reported fenced, discarding agent result", victim);
                } else {
                    slog::info!(logger, "Fenced node {} in {:?}", victim, elapsed);
                    self.send_fence_report(victim, FenceMethod::Agent);
                }
            }
            Err(err) => {
                let error = RecoveryError::AgentFailure {
                    victim,
                    reason: err.to_string(),
                };
                match self.victims.get_mut(victim) {
                    Some(v) => {
                        v.attempts += 1;
                        let backoff = self.recovery.retry_backoff(v.attempts);
                        v.next_attempt_at = Some(now + backoff);
                        let attempts = v.attempts;
                        slog::error!(logger, "{} (attempt {}), retrying in {:?}", error, attempts, backoff);
                        self.events
                            .publish(&self.logger, FenceEvent::FenceAttemptFailed { victim, attempts });
                    }
                    None => slog::info!(logger, "{}, but node is no longer a victim", error),
                }
            }
        }
        self.run_recovery();
    }

    pub(crate) fn handle_tick(&mut self) {
        self.run_recovery();
    }

    pub(crate) fn handle_override(&mut self, victim: NodeId) {
        if self.has_exited() {
            return;
        }
        if self.victims.contains(victim) {
            self.send_override(victim);
        } else if self.history.has_unfenced_failure(victim) && self.changes.awaits_fence_of(victim, true) {
            // Held until the node becomes a victim.
            self.pending_overrides.insert(victim);
            let now = self.clock.now();
            if let Some(head) = self.changes.head() {
                let blocked = head.state == ChangeState::WaitConditions && head.has_failed(victim);
                if blocked && self.quorum_bypass.is_none() {
                    slog::warn!(
                        self.logger,
                        "Override for node {} arms quorum bypass for change {}, opens in {:?}",
                        victim,
                        head.seq,
                        self.override_time
                    );
                    self.quorum_bypass = Some(QuorumBypass {
                        seq: head.seq,
                        armed_at: now,
                    });
                }
            }
        } else {
            slog::info!(self.logger, "Ignoring override for node {}, it is not owed a fence", victim);
        }
        self.run_recovery();
    }

    pub(crate) fn handle_external_fence(&mut self, victim: NodeId) -> Result<(), DomainFailure> {
        if let Some(Err(failure)) = &self.exit {
            return Err(failure.clone());
        }
        slog::info!(self.logger, "Reporting node {} as fenced externally", victim);
        self.broadcast(None, FenceMessage::External { victim });
        match &self.exit {
            Some(Err(failure)) => Err(failure.clone()),
            _ => Ok(()),
        }
    }

    pub(crate) fn handle_leave(&mut self) -> Result<(), DomainFailure> {
        if self.leaving {
            return Ok(());
        }
        if let Some(Err(failure)) = &self.exit {
            return Err(failure.clone());
        }
        slog::info!(self.logger, "Leaving fence domain");
        self.leaving = true;
        if let Err(e) = self.sender.leave() {
            self.fail(RecoveryError::TransportUnavailable(e.to_string()));
        }
        match &self.exit {
            Some(Err(failure)) => Err(failure.clone()),
            _ => Ok(()),
        }
    }

    pub(crate) fn status(&self) -> DomainStatus {
        DomainStatus {
            name: self.name.clone(),
            my_node_id: self.my_node_id,
            master: self.elector.master(),
            joining: self.joined_at.is_some() && !self.init_complete,
            leaving: self.leaving,
            init_complete: self.init_complete,
            members: self
                .tracker
                .current_members()
                .map(|members| members.iter().copied().collect())
                .unwrap_or_default(),
            complete_nodes: self.complete_nodes.iter().copied().collect(),
            victims: self
                .victims
                .iter()
                .map(|victim| VictimStatus {
                    node_id: victim.node_id,
                    name: victim.name.clone(),
                    init_victim: victim.init_victim,
                    attempts: victim.attempts,
                })
                .collect(),
            changes: self
                .changes
                .iter()
                .map(|change| ChangeStatus {
                    seq: change.seq,
                    state: change.state,
                    member_count: change.member_count(),
                    joined_count: change.joined_count(),
                    removed_count: change.removed_count(),
                    failed_count: change.failed_count(),
                    we_joined: change.we_joined,
                    outstanding: change.outstanding.iter().copied().collect(),
                })
                .collect(),
            history: self.history.to_entries(),
        }
    }

    // ---------------------------------------------------------------------------------------
    // Membership
    // ---------------------------------------------------------------------------------------

    fn handle_membership(&mut self, event: MembershipEvent) {
        if !event.members.contains(&self.my_node_id) {
            if self.leaving {
                slog::info!(self.logger, "Left the group");
                self.exit = Some(Ok(()));
            } else if self.joined_at.is_some() {
                self.fail(RecoveryError::TransportUnavailable(
                    "removed from the group by the transport".into(),
                ));
            }
            return;
        }

        let change = match self.tracker.ingest(&event) {
            Some(change) => change,
            None => {
                slog::debug!(self.logger, "Ignoring membership event without changes");
                return;
            }
        };
        let now = self.clock.now();

        // Stamped at ingestion, so reports that overtake the change still find the failure.
        for joined in change.joined.iter() {
            self.history.record_add(*joined);
        }
        for removed in change.removed.iter() {
            if change.left.contains(removed) {
                self.history.record_left(*removed);
            } else {
                self.history.record_fail(*removed);
            }
            self.complete_nodes.remove(removed);
            self.awaiting_complete.remove(removed);
        }
        self.refresh_master();

        if change.we_joined && self.joined_at.is_none() {
            let sources: BTreeSet<NodeId> = change.previous_members().collect();
            self.joined_at = Some(now);
            self.forming_domain = sources.is_empty();
            self.join_cohort = change.joined.clone();
            self.complete_sources = Some(sources);
        } else if let Some(sources) = self.complete_sources.as_mut() {
            for removed in change.removed.iter() {
                sources.remove(removed);
            }
        }

        slog::info!(
            self.logger,
            "Queued change {}: {} members, {} joined, {} removed ({} failed)",
            change.seq,
            change.member_count(),
            change.joined_count(),
            change.removed_count(),
            change.failed_count()
        );
        self.events.publish(
            &self.logger,
            FenceEvent::ChangeQueued {
                seq: change.seq,
                members: change.members.iter().copied().collect(),
                joined: change.joined.iter().copied().collect(),
                removed: change.removed.iter().copied().collect(),
            },
        );
        let removed_any = !change.removed.is_empty();
        self.changes.push(change);

        if !self.init_complete && !self.forming_domain {
            let orphaned = self.complete_sources.as_ref().map(|s| s.is_empty()).unwrap_or(false);
            if orphaned {
                slog::warn!(
                    self.logger,
                    "Every member that could send COMPLETE is gone, taking over as complete"
                );
                self.mark_cohort_complete();
                self.become_complete();
                self.add_initial_victims(now);
            }
        }

        if removed_any && !self.awaiting_complete.is_empty() {
            // The previous sender may have been among the removed.
            for sent in self.awaiting_complete.values_mut() {
                *sent = false;
            }
            self.send_pending_completes();
        }
    }

    // ---------------------------------------------------------------------------------------
    // Messages
    // ---------------------------------------------------------------------------------------

    fn handle_message(&mut self, transport_sender: NodeId, payload: Bytes) {
        let (header, message) = match protocol::decode(&payload) {
            Ok(decoded) => decoded,
            Err(e) => return self.protocol_violation(transport_sender, e.to_string()),
        };
        if header.domain_id != self.domain_id {
            return self.protocol_violation(
                transport_sender,
                format!("domain instance id {:#x} is not ours", header.domain_id),
            );
        }
        if header.sender != transport_sender {
            return self.protocol_violation(
                transport_sender,
                format!("header claims sender {}", header.sender),
            );
        }

        if let Some(destination) = header.destination {
            if destination != self.my_node_id {
                if let FenceMessage::Complete { .. } = message {
                    self.observe_complete(destination);
                }
                return;
            }
        }
        if header.flags.contains(MessageFlags::COMPLETE) {
            self.mark_complete(header.sender);
        }

        match message {
            FenceMessage::Start { victims } => self.receive_start(header.sender, victims),
            FenceMessage::VictimDone { victim, how } => self.receive_fence_report(FenceReport {
                victim,
                reporter: header.sender,
                how,
            }),
            FenceMessage::Complete { snapshot } => self.receive_complete(header.sender, snapshot),
            FenceMessage::External { victim } => self.receive_fence_report(FenceReport {
                victim,
                reporter: header.sender,
                how: FenceMethod::External,
            }),
        }
    }

    fn protocol_violation(&mut self, sender: NodeId, reason: String) {
        let error = RecoveryError::ProtocolViolation {
            sender,
            reason: reason.clone(),
        };
        slog::warn!(self.logger, "Ignoring message: {}", error);
        self.events
            .publish(&self.logger, FenceEvent::ProtocolViolation { sender, reason });
    }

    fn receive_start(&mut self, sender: NodeId, victims: Vec<NodeId>) {
        let announced: BTreeSet<NodeId> = victims.into_iter().collect();
        slog::debug!(self.logger, "START from {} announces victims {:?}", sender, announced);

        let outstanding = match self.changes.head() {
            Some(head) if head.state == ChangeState::WaitMessages => head.outstanding.clone(),
            _ => return,
        };
        if announced.is_superset(&outstanding) {
            return;
        }
        slog::warn!(
            self.logger,
            "START from {} announces victims {:?}, we still wait on {:?}",
            sender,
            announced,
            outstanding
        );
        self.events.publish(
            &self.logger,
            FenceEvent::StartMismatch {
                from: sender,
                announced: announced.into_iter().collect(),
                outstanding: outstanding.into_iter().collect(),
            },
        );
    }

    fn receive_fence_report(&mut self, report: FenceReport) {
        if !self.init_complete {
            slog::debug!(
                self.logger,
                "Buffering fence report for node {} until COMPLETE arrives",
                report.victim
            );
            self.buffered_reports.push(report);
            return;
        }
        self.apply_fence_report(report);
    }

    fn apply_fence_report(&mut self, report: FenceReport) {
        let FenceReport { victim, reporter, how } = report;
        if self.history.is_fenced(victim) {
            slog::debug!(self.logger, "Node {} is already fenced, ignoring {:?} report", victim, how);
            return;
        }

        let unfenced = self.history.has_unfenced_failure(victim);
        let owed = self.victims.contains(victim) || self.changes.awaits_fence_of(victim, unfenced);
        if !owed {
            slog::info!(self.logger, "{}", RecoveryError::StaleReport { victim, reporter });
            return;
        }

        match how {
            FenceMethod::External => self.history.record_external_fence(victim, reporter),
            how => self.history.record_fence(victim, reporter, how),
        };
        self.victims.remove(victim);
        self.changes.drain_outstanding(victim);
        self.pending_overrides.remove(&victim);

        slog::info!(self.logger, "Node {} fenced by {} ({:?})", victim, reporter, how);
        self.events
            .publish(&self.logger, FenceEvent::VictimFenced { victim, how, reporter });

        if let Some(in_flight) = self.recovery.in_flight() {
            if in_flight.victim == victim {
                slog::info!(
                    self.logger,
                    "Agent call for node {} is still running, its result will be discarded",
                    victim
                );
            }
        }
    }

    fn receive_complete(&mut self, sender: NodeId, snapshot: DomainSnapshot) {
        self.observe_complete(self.my_node_id);
        self.mark_complete(sender);
        if self.init_complete {
            slog::debug!(self.logger, "Already complete, ignoring COMPLETE from {}", sender);
            return;
        }

        slog::info!(
            self.logger,
            "Received COMPLETE from {} with {} history entries and {} victims",
            sender,
            snapshot.history.len(),
            snapshot.victims.len()
        );
        self.history.merge(&snapshot.history);

        let now = self.clock.now();
        let joined_at = self.joined_at.unwrap_or(now);
        for victim in snapshot.victims {
            if self.history.is_fenced(victim.node_id) {
                continue;
            }
            let imported = if victim.init_victim {
                Victim::initial(victim.node_id, victim.name, self.recovery.initial_eligible_at(joined_at))
            } else {
                Victim::failed(victim.node_id, victim.name, self.recovery.failure_eligible_at(now))
            };
            self.victims.add(imported);
        }

        let members = self.tracker.current_members().cloned().unwrap_or_default();
        self.complete_nodes
            .extend(snapshot.complete_nodes.into_iter().filter(|node| members.contains(node)));
        self.refresh_master();

        self.events
            .publish(&self.logger, FenceEvent::CompleteReceived { from: sender });
        self.become_complete();
    }

    fn observe_complete(&mut self, node_id: NodeId) {
        self.awaiting_complete.remove(&node_id);
        self.mark_complete(node_id);
    }

    fn mark_complete(&mut self, node_id: NodeId) {
        if self.complete_nodes.insert(node_id) {
            self.refresh_master();
        }
    }

    /// Forming the domain, or taking over as an orphaned joiner, happens at the same point of the
    /// stream for everyone who joined with us, so all of us mark the same nodes complete.
    fn mark_cohort_complete(&mut self) {
        let members = self.tracker.current_members().cloned().unwrap_or_default();
        let cohort: Vec<NodeId> = self.join_cohort.intersection(&members).copied().collect();
        self.complete_nodes.extend(cohort);
        self.refresh_master();
    }

    fn refresh_master(&mut self) {
        let members = self.tracker.current_members().cloned().unwrap_or_default();
        if let MasterChange::Changed { from, to } = self.elector.recompute(&members, &self.complete_nodes) {
            slog::info!(self.logger, "Master changed from {:?} to {:?}", from, to);
        }
    }

    fn become_complete(&mut self) {
        self.init_complete = true;
        self.mark_complete(self.my_node_id);

        for report in mem::take(&mut self.buffered_reports) {
            self.apply_fence_report(report);
        }
    }

    fn add_initial_victims(&mut self, now: Instant) {
        if self.clean_start {
            slog::info!(self.logger, "Clean start, skipping initial fencing");
            return;
        }

        let members = self.tracker.current_members().cloned().unwrap_or_default();
        let eligible_at = self.recovery.initial_eligible_at(self.joined_at.unwrap_or(now));
        for node_id in self.directory.configured_nodes() {
            if members.contains(&node_id) || self.history.is_fenced(node_id) {
                continue;
            }
            let name = self.directory.node_name(node_id);
            slog::info!(self.logger, "Node {} ({}) is an initial victim", node_id, name);
            self.victims.add(Victim::initial(node_id, name, eligible_at));
        }
    }

    // ---------------------------------------------------------------------------------------
    // Change state machine
    // ---------------------------------------------------------------------------------------

    fn run_recovery(&mut self) {
        if self.has_exited() {
            return;
        }
        self.process_changes();
        self.fence_victims();
    }

    fn process_changes(&mut self) {
        loop {
            if self.has_exited() {
                return;
            }
            let state = match self.changes.head() {
                Some(head) => head.state,
                None => return,
            };
            match state {
                ChangeState::WaitConditions => {
                    if !self.wait_conditions_done() {
                        return;
                    }
                    self.start_change();
                }
                ChangeState::WaitMessages => {
                    if !self.wait_messages_done() {
                        return;
                    }
                    self.resolve_head();
                }
            }
        }
    }

    fn wait_conditions_done(&mut self) -> bool {
        let (seq, needs_quorum) = match self.changes.head() {
            Some(head) => (
                head.seq,
                head.failed()
                    .filter(|node| self.history.requires_quorum_check(*node) && !self.history.is_fenced(*node))
                    .collect::<Vec<_>>(),
            ),
            None => return false,
        };
        if needs_quorum.is_empty() {
            return true;
        }

        let quorum_ok = if self.directory.quorate() {
            true
        } else if self.quorum_bypass_open(seq) {
            slog::warn!(self.logger, "Quorum bypassed by override for change {}", seq);
            true
        } else {
            false
        };

        if !quorum_ok {
            if !self.quorum_wait_logged {
                self.quorum_wait_logged = true;
                slog::info!(self.logger, "{}, change {} waits for quorum", RecoveryError::QuorumLost, seq);
            }
            return false;
        }

        self.quorum_wait_logged = false;
        for node in needs_quorum {
            self.history.clear_quorum_check(node);
        }
        true
    }

    fn quorum_bypass_open(&self, seq: u32) -> bool {
        match self.quorum_bypass {
            Some(bypass) => bypass.seq == seq && self.clock.now() >= bypass.armed_at + self.override_time,
            None => false,
        }
    }

    fn start_change(&mut self) {
        let now = self.clock.now();
        let (seq, failed, we_joined) = match self.changes.head() {
            Some(head) => (head.seq, head.failed().collect::<Vec<_>>(), head.we_joined),
            None => return,
        };

        let mut outstanding = BTreeSet::new();
        for node in failed {
            if self.history.is_fenced(node) {
                slog::info!(self.logger, "Node {} is already fenced, not a victim", node);
                continue;
            }
            let name = self.directory.node_name(node);
            self.victims
                .add(Victim::failed(node, name, self.recovery.failure_eligible_at(now)));
            outstanding.insert(node);
        }

        if we_joined && self.forming_domain && !self.init_complete {
            slog::info!(self.logger, "Formed fence domain");
            self.mark_cohort_complete();
            self.become_complete();
            self.add_initial_victims(now);
        }

        if let Some(head) = self.changes.head_mut() {
            head.state = ChangeState::WaitMessages;
            head.outstanding = outstanding.clone();
        }
        slog::info!(self.logger, "Started change {} with victims {:?}", seq, outstanding);
        self.events.publish(
            &self.logger,
            FenceEvent::ChangeStarted {
                seq,
                victims: outstanding.iter().copied().collect(),
            },
        );

        if self.init_complete && self.elector.is_master(self.my_node_id) {
            self.broadcast(
                None,
                FenceMessage::Start {
                    victims: outstanding.iter().copied().collect(),
                },
            );
        }

        let held: Vec<NodeId> = outstanding.intersection(&self.pending_overrides).copied().collect();
        for victim in held {
            self.pending_overrides.remove(&victim);
            self.send_override(victim);
        }
    }

    fn wait_messages_done(&self) -> bool {
        match self.changes.head() {
            Some(head) => head.outstanding.is_empty() && (!head.we_joined || self.init_complete),
            None => false,
        }
    }

    fn resolve_head(&mut self) {
        let change = match self.changes.pop_head() {
            Some(change) => change,
            None => return,
        };
        if let Some(bypass) = self.quorum_bypass {
            if bypass.seq == change.seq {
                self.quorum_bypass = None;
            }
        }

        slog::info!(self.logger, "Resolved change {}", change.seq);
        self.events
            .publish(&self.logger, FenceEvent::ChangeResolved { seq: change.seq });

        for joiner in self.joiners_needing_complete(&change) {
            self.awaiting_complete.insert(joiner, false);
        }
        self.send_pending_completes();
    }

    fn joiners_needing_complete(&self, change: &Change) -> Vec<NodeId> {
        let members = self.tracker.current_members();
        change
            .joined
            .iter()
            .copied()
            .filter(|joiner| *joiner != self.my_node_id && !self.complete_nodes.contains(joiner))
            .filter(|joiner| members.map(|m| m.contains(joiner)).unwrap_or(false))
            .collect()
    }

    /// The lowest complete member still in the group sends COMPLETE to joiners.
    fn complete_sender(&self) -> Option<NodeId> {
        let members = self.tracker.current_members()?;
        self.complete_nodes
            .iter()
            .copied()
            .find(|node| members.contains(node) && !self.awaiting_complete.contains_key(node))
    }

    fn send_pending_completes(&mut self) {
        if !self.init_complete || self.complete_sender() != Some(self.my_node_id) {
            return;
        }
        let unsent: Vec<NodeId> = self
            .awaiting_complete
            .iter()
            .filter(|(_, sent)| !**sent)
            .map(|(joiner, _)| *joiner)
            .collect();
        for joiner in unsent {
            self.awaiting_complete.insert(joiner, true);
            self.send_complete(joiner);
        }
    }

    fn send_complete(&mut self, joiner: NodeId) {
        let snapshot = DomainSnapshot {
            history: self.history.to_entries(),
            victims: self
                .victims
                .iter()
                .map(|victim| SnapshotVictim {
                    node_id: victim.node_id,
                    name: victim.name.clone(),
                    init_victim: victim.init_victim,
                })
                .collect(),
            complete_nodes: self.complete_nodes.iter().copied().collect(),
        };
        slog::info!(self.logger, "Sending COMPLETE to {}", joiner);
        self.broadcast(Some(joiner), FenceMessage::Complete { snapshot });
        self.events
            .publish(&self.logger, FenceEvent::CompleteSent { to: joiner });
    }

    // ---------------------------------------------------------------------------------------
    // Fencing
    // ---------------------------------------------------------------------------------------

    fn fence_victims(&mut self) {
        if self.has_exited() {
            return;
        }
        self.drain_fenced_victims();

        let now = self.clock.now();
        let view = FencingView {
            my_node_id: self.my_node_id,
            master: self.elector.master(),
            init_complete: self.init_complete,
            view_settled: self
                .changes
                .head()
                .map(|head| head.state != ChangeState::WaitConditions)
                .unwrap_or(true),
            quorum_ok: self.directory.quorate() || self.any_quorum_bypass_open(),
        };

        match self.recovery.defer_fencing(&view) {
            None => self.recovery.clear_deferral_note(),
            Some(Deferral::NotMaster(master)) => {
                if !self.victims.is_empty() && self.recovery.note_deferred_to(master) {
                    slog::info!(self.logger, "Fencing deferred to {:?}", master);
                    self.events
                        .publish(&self.logger, FenceEvent::FencingDeferred { master });
                }
                return;
            }
            Some(deferral) => {
                if !self.victims.is_empty() {
                    slog::debug!(self.logger, "Fencing deferred: {:?}", deferral);
                }
                return;
            }
        }

        self.excuse_member_victims();

        let next = self
            .recovery
            .next_victim(&self.victims, now)
            .map(|victim| (victim.node_id, victim.name.clone()));
        if let Some((victim, name)) = next {
            self.start_fence(victim, name, now);
        }
    }

    fn any_quorum_bypass_open(&self) -> bool {
        match self.quorum_bypass {
            Some(bypass) => self.quorum_bypass_open(bypass.seq),
            None => false,
        }
    }

    fn drain_fenced_victims(&mut self) {
        let fenced: Vec<NodeId> = self
            .victims
            .iter()
            .map(|victim| victim.node_id)
            .filter(|node| self.history.is_fenced(*node))
            .collect();
        for node in fenced {
            slog::info!(self.logger, "Node {} already fenced, dropping victim", node);
            self.victims.remove(node);
            self.changes.drain_outstanding(node);
        }
    }

    /// An initial victim the cluster manager counts as member again never failed while we were
    /// watching, so it is excused rather than fenced.
    fn excuse_member_victims(&mut self) {
        let excused: Vec<NodeId> = self
            .victims
            .iter()
            .filter(|victim| victim.init_victim && !victim.report_sent)
            .map(|victim| victim.node_id)
            .filter(|node| self.directory.is_member(*node))
            .collect();
        for node in excused {
            slog::info!(self.logger, "Initial victim {} is a cluster member, excusing", node);
            self.send_fence_report(node, FenceMethod::Member);
        }
    }

    fn start_fence(&mut self, victim: NodeId, name: String, now: Instant) {
        let attempt_id = self.recovery.start_attempt(victim, now);
        let logger = self.logger.new(slog::o!("Victim" => victim.as_u32()));
        slog::info!(logger, "Fencing node {} ({})", victim, name);

        let agent = self.agent.clone();
        let actor_client = self.actor_client.clone();
        tokio::task::spawn(async move {
            let result = agent.fence(victim, &name).await;
            if actor_client
                .fence_result(FenceResult {
                    victim,
                    attempt_id,
                    result,
                })
                .await
                .is_err()
            {
                slog::warn!(logger, "Fence domain exited before fence result for node {} arrived", victim);
            }
        });
    }

    fn send_override(&mut self, victim: NodeId) {
        match self.victims.get(victim) {
            Some(v) if !v.report_sent => {}
            _ => return,
        }
        slog::warn!(self.logger, "Override: node {} acknowledged as fenced by administrator", victim);
        self.send_fence_report(victim, FenceMethod::Override);
    }

    /// Completion reports are recorded when they come back through the transport, so every
    /// member records them at the same point of the stream.
    fn send_fence_report(&mut self, victim: NodeId, how: FenceMethod) {
        if let Some(v) = self.victims.get_mut(victim) {
            v.report_sent = true;
        }
        self.broadcast(None, FenceMessage::VictimDone { victim, how });
    }

    fn broadcast(&mut self, destination: Option<NodeId>, message: FenceMessage) {
        let flags = if self.init_complete {
            MessageFlags::COMPLETE
        } else {
            MessageFlags::JOINING
        };
        let payload = protocol::encode(self.my_node_id, self.domain_id, destination, flags, &message);
        if let Err(e) = self.sender.send(payload) {
            self.fail(RecoveryError::TransportUnavailable(e.to_string()));
        }
    }

    fn fail(&mut self, error: RecoveryError) {
        slog::error!(self.logger, "Fence domain failed: {}", error);
        let failure = match error {
            RecoveryError::TransportUnavailable(reason) => DomainFailure::TransportUnavailable(reason),
            other => DomainFailure::TransportUnavailable(other.to_string()),
        };
        self.exit = Some(Err(failure));
    }
}

/// Every member derives the same instance id from the domain name.
pub(crate) fn domain_instance_id(name: &str) -> u32 {
    name.bytes()
        .fold(0x811c_9dc5u32, |hash, byte| (hash ^ byte as u32).wrapping_mul(0x0100_0193))
}
