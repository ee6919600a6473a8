use crate::domain::victims::{Victim, VictimSet};
use crate::domain::NodeId;
use rand::Rng;
use std::cmp;
use tokio::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub(crate) struct RecoveryConfig {
    pub(crate) post_join_delay: Duration,
    pub(crate) post_fail_delay: Duration,
    pub(crate) retry_min_backoff: Duration,
    pub(crate) retry_max_backoff: Duration,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct InFlightFence {
    pub(crate) victim: NodeId,
    pub(crate) attempt_id: u64,
    pub(crate) started_at: Instant,
}

/// Why no new fence attempt may start right now.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Deferral {
    /// We have not received authoritative state yet.
    Joining,
    /// The head change has not left WAIT_CONDITIONS, the view may still move.
    ViewUnsettled,
    NotMaster(Option<NodeId>),
    QuorumLost,
    AttemptInFlight,
}

/// What the domain knows at the moment it asks whether it may fence.
#[derive(Copy, Clone, Debug)]
pub(crate) struct FencingView {
    pub(crate) my_node_id: NodeId,
    pub(crate) master: Option<NodeId>,
    pub(crate) init_complete: bool,
    pub(crate) view_settled: bool,
    pub(crate) quorum_ok: bool,
}

/// RecoveryScheduler owns the timing of fence attempts: when a victim becomes eligible, whether
/// attempts are deferred, which victim goes next, and how long to back off after a failure.
/// There is at most one attempt in flight.
pub(crate) struct RecoveryScheduler {
    config: RecoveryConfig,
    in_flight: Option<InFlightFence>,
    next_attempt_id: u64,
    // Deferral to a master is logged once per master.
    deferral_logged_for: Option<Option<NodeId>>,
}

impl RecoveryScheduler {
    pub(crate) fn new(config: RecoveryConfig) -> Self {
        RecoveryScheduler {
            config,
            in_flight: None,
            next_attempt_id: 1,
            deferral_logged_for: None,
        }
    }

    pub(crate) fn defer_fencing(&self, view: &FencingView) -> Option<Deferral> {
        if !view.init_complete {
            return Some(Deferral::Joining);
        }
        if !view.view_settled {
            return Some(Deferral::ViewUnsettled);
        }
        if view.master != Some(view.my_node_id) {
            return Some(Deferral::NotMaster(view.master));
        }
        if !view.quorum_ok {
            return Some(Deferral::QuorumLost);
        }
        if self.in_flight.is_some() {
            return Some(Deferral::AttemptInFlight);
        }
        None
    }

    /// Returns true the first time fencing is deferred to this master.
    pub(crate) fn note_deferred_to(&mut self, master: Option<NodeId>) -> bool {
        if self.deferral_logged_for == Some(master) {
            return false;
        }
        self.deferral_logged_for = Some(master);
        true
    }

    pub(crate) fn clear_deferral_note(&mut self) {
        self.deferral_logged_for = None;
    }

    /// True while the victim must not be fenced yet: initial victims during the post-join delay,
    /// failed victims during the post-fail delay, and any victim backing off after a failure.
    pub(crate) fn delay_fencing(&self, victim: &Victim, now: Instant) -> bool {
        !victim.is_due(now)
    }

    /// The first victim, in FIFO order, that may be fenced now.
    pub(crate) fn next_victim<'a>(&self, victims: &'a VictimSet, now: Instant) -> Option<&'a Victim> {
        victims
            .iter()
            .filter(|victim| !victim.report_sent)
            .find(|victim| !self.delay_fencing(victim, now))
    }

    pub(crate) fn initial_eligible_at(&self, joined_at: Instant) -> Instant {
        joined_at + self.config.post_join_delay
    }

    pub(crate) fn failure_eligible_at(&self, now: Instant) -> Instant {
        now + self.config.post_fail_delay
    }

    pub(crate) fn start_attempt(&mut self, victim: NodeId, now: Instant) -> u64 {
        let attempt_id = self.next_attempt_id;
        self.next_attempt_id += 1;
        self.in_flight = Some(InFlightFence {
            victim,
            attempt_id,
            started_at: now,
        });
        attempt_id
    }

    pub(crate) fn in_flight(&self) -> Option<&InFlightFence> {
        self.in_flight.as_ref()
    }

    /// Clears the in-flight attempt if `attempt_id` is the one running.
    pub(crate) fn finish_attempt(&mut self, attempt_id: u64) -> Option<InFlightFence> {
        match &self.in_flight {
            Some(in_flight) if in_flight.attempt_id == attempt_id => self.in_flight.take(),
            _ => None,
        }
    }

    /// Exponential backoff from the minimum, doubled per failed attempt, plus up to a quarter of
    /// jitter, never above the maximum.
    pub(crate) fn retry_backoff(&self, attempts: u32) -> Duration {
        let exponent = cmp::min(attempts.saturating_sub(1), 16);
        let base = cmp::min(
            self.config.retry_min_backoff * 2u32.pow(exponent),
            self.config.retry_max_backoff,
        );
        let jitter = rand::thread_rng().gen_range(Duration::from_millis(0)..=base / 4);
        cmp::min(base + jitter, self.config.retry_max_backoff)
    }
}
