use crate::domain::NodeId;
use std::collections::VecDeque;
use tokio::time::Instant;

#[derive(Clone, Debug)]
pub(crate) struct Victim {
    pub(crate) node_id: NodeId,
    pub(crate) name: String,
    /// Already gone when the local node formed or joined the domain, as opposed to failing while
    /// we were watching.
    pub(crate) init_victim: bool,
    pub(crate) eligible_at: Instant,
    pub(crate) attempts: u32,
    pub(crate) next_attempt_at: Option<Instant>,
    /// We broadcast a completion report for this victim and are waiting to see it delivered.
    pub(crate) report_sent: bool,
}

impl Victim {
    pub(crate) fn failed(node_id: NodeId, name: String, eligible_at: Instant) -> Self {
        Victim::new(node_id, name, false, eligible_at)
    }

    pub(crate) fn initial(node_id: NodeId, name: String, eligible_at: Instant) -> Self {
        Victim::new(node_id, name, true, eligible_at)
    }

    fn new(node_id: NodeId, name: String, init_victim: bool, eligible_at: Instant) -> Self {
        Victim {
            node_id,
            name,
            init_victim,
            eligible_at,
            attempts: 0,
            next_attempt_at: None,
            report_sent: false,
        }
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        now >= self.eligible_at && self.next_attempt_at.map(|at| now >= at).unwrap_or(true)
    }
}

/// FIFO set of nodes currently owed a fence.
#[derive(Debug, Default)]
pub(crate) struct VictimSet {
    victims: VecDeque<Victim>,
}

impl VictimSet {
    pub(crate) fn new() -> Self {
        VictimSet::default()
    }

    /// Returns false, and keeps the existing position, if the node is already a victim.
    pub(crate) fn add(&mut self, victim: Victim) -> bool {
        if self.contains(victim.node_id) {
            return false;
        }
        self.victims.push_back(victim);
        true
    }

    pub(crate) fn remove(&mut self, node_id: NodeId) -> Option<Victim> {
        let index = self.victims.iter().position(|v| v.node_id == node_id)?;
        self.victims.remove(index)
    }

    pub(crate) fn contains(&self, node_id: NodeId) -> bool {
        self.victims.iter().any(|v| v.node_id == node_id)
    }

    pub(crate) fn get(&self, node_id: NodeId) -> Option<&Victim> {
        self.victims.iter().find(|v| v.node_id == node_id)
    }

    pub(crate) fn get_mut(&mut self, node_id: NodeId) -> Option<&mut Victim> {
        self.victims.iter_mut().find(|v| v.node_id == node_id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Victim> {
        self.victims.iter()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.victims.is_empty()
    }
}
