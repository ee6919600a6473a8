use crate::domain::NodeId;
use chrono::Utc;
use std::collections::BTreeMap;

/// How a fence obligation was satisfied.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FenceMethod {
    /// The master ran the fence agent successfully.
    Agent,
    /// An initial victim turned out to be a cluster member again, so it never needed fencing.
    Member,
    /// An administrator acknowledged the node as isolated.
    Override,
    /// Something outside the domain fenced the node and a member reported it.
    External,
}

/// Wall-clock milliseconds since the unix epoch. Stamps issued by one ledger are strictly
/// increasing.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Stamp(u64);

impl Stamp {
    pub fn from_millis(millis: u64) -> Self {
        Stamp(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeHistoryEntry {
    pub node_id: NodeId,
    /// Set when the node fails; cleared once quorum was confirmed for that failure.
    pub check_quorum: bool,
    pub add_time: Option<Stamp>,
    pub left_time: Option<Stamp>,
    pub fail_time: Option<Stamp>,
    pub fence_time: Option<Stamp>,
    pub fence_external_time: Option<Stamp>,
    pub fence_external_node: Option<NodeId>,
    pub fence_master: Option<NodeId>,
    pub fence_how: Option<FenceMethod>,
}

impl NodeHistoryEntry {
    pub fn new(node_id: NodeId) -> Self {
        NodeHistoryEntry {
            node_id,
            check_quorum: false,
            add_time: None,
            left_time: None,
            fail_time: None,
            fence_time: None,
            fence_external_time: None,
            fence_external_node: None,
            fence_master: None,
            fence_how: None,
        }
    }

    pub fn last_fenced(&self) -> Option<Stamp> {
        self.fence_time.max(self.fence_external_time)
    }

    /// A node is fenced for its current add generation when its latest fence stamp postdates its
    /// latest add stamp. A node never added (from our point of view) counts from the beginning.
    pub fn is_fenced(&self) -> bool {
        match self.last_fenced() {
            Some(fenced) => Some(fenced) > self.add_time,
            None => false,
        }
    }

    /// True when the latest failure has no fence after it.
    pub fn has_unfenced_failure(&self) -> bool {
        match self.fail_time {
            Some(failed) => Some(failed) > self.last_fenced(),
            None => false,
        }
    }

    fn merge(&mut self, other: &NodeHistoryEntry) {
        self.check_quorum |= other.check_quorum;
        self.add_time = self.add_time.max(other.add_time);
        self.left_time = self.left_time.max(other.left_time);
        self.fail_time = self.fail_time.max(other.fail_time);

        if other.fence_time > self.fence_time {
            self.fence_time = other.fence_time;
            self.fence_master = other.fence_master;
            self.fence_how = other.fence_how;
        }
        if other.fence_external_time > self.fence_external_time {
            self.fence_external_time = other.fence_external_time;
            self.fence_external_node = other.fence_external_node;
        }
    }

    fn latest_stamp(&self) -> Option<Stamp> {
        [
            self.add_time,
            self.left_time,
            self.fail_time,
            self.fence_time,
            self.fence_external_time,
        ]
        .iter()
        .copied()
        .max()
        .flatten()
    }
}

/// NodeHistory is the domain's append/update-only ledger of fence relevant events per node. It
/// outlives every membership change, and through the registry also the local node's own
/// membership in the domain.
#[derive(Clone, Debug, Default)]
pub(crate) struct NodeHistory {
    entries: BTreeMap<NodeId, NodeHistoryEntry>,
    last_stamp: Option<Stamp>,
}

impl NodeHistory {
    pub(crate) fn new() -> Self {
        NodeHistory::default()
    }

    pub(crate) fn entry(&self, node_id: NodeId) -> Option<&NodeHistoryEntry> {
        self.entries.get(&node_id)
    }

    pub(crate) fn is_fenced(&self, node_id: NodeId) -> bool {
        self.entry(node_id).map(|e| e.is_fenced()).unwrap_or(false)
    }

    pub(crate) fn has_unfenced_failure(&self, node_id: NodeId) -> bool {
        self.entry(node_id).map(|e| e.has_unfenced_failure()).unwrap_or(false)
    }

    pub(crate) fn requires_quorum_check(&self, node_id: NodeId) -> bool {
        self.entry(node_id).map(|e| e.check_quorum).unwrap_or(false)
    }

    pub(crate) fn record_add(&mut self, node_id: NodeId) -> Stamp {
        let stamp = self.next_stamp();
        self.entry_mut(node_id).add_time = Some(stamp);
        stamp
    }

    pub(crate) fn record_left(&mut self, node_id: NodeId) -> Stamp {
        let stamp = self.next_stamp();
        self.entry_mut(node_id).left_time = Some(stamp);
        stamp
    }

    pub(crate) fn record_fail(&mut self, node_id: NodeId) -> Stamp {
        let stamp = self.next_stamp();
        let entry = self.entry_mut(node_id);
        entry.fail_time = Some(stamp);
        entry.check_quorum = true;
        stamp
    }

    pub(crate) fn clear_quorum_check(&mut self, node_id: NodeId) {
        if let Some(entry) = self.entries.get_mut(&node_id) {
            entry.check_quorum = false;
        }
    }

    pub(crate) fn record_fence(&mut self, node_id: NodeId, fencer: NodeId, how: FenceMethod) -> Stamp {
        let stamp = self.next_stamp();
        let entry = self.entry_mut(node_id);
        entry.fence_time = Some(stamp);
        entry.fence_master = Some(fencer);
        entry.fence_how = Some(how);
        stamp
    }

    pub(crate) fn record_external_fence(&mut self, node_id: NodeId, reporter: NodeId) -> Stamp {
        let stamp = self.next_stamp();
        let entry = self.entry_mut(node_id);
        entry.fence_external_time = Some(stamp);
        entry.fence_external_node = Some(reporter);
        stamp
    }

    /// Field-wise merge of a peer's ledger. Afterwards every local stamp is issued after the
    /// latest imported one, regardless of the peer's clock.
    pub(crate) fn merge(&mut self, others: &[NodeHistoryEntry]) {
        for other in others {
            self.entry_mut(other.node_id).merge(other);
            self.last_stamp = self.last_stamp.max(other.latest_stamp());
        }
    }

    pub(crate) fn to_entries(&self) -> Vec<NodeHistoryEntry> {
        self.entries.values().cloned().collect()
    }

    fn entry_mut(&mut self, node_id: NodeId) -> &mut NodeHistoryEntry {
        self.entries
            .entry(node_id)
            .or_insert_with(|| NodeHistoryEntry::new(node_id))
    }

    fn next_stamp(&mut self) -> Stamp {
        let wall_clock = Stamp(Utc::now().timestamp_millis().max(0) as u64);
        let stamp = match self.last_stamp {
            Some(last) if last >= wall_clock => Stamp(last.0 + 1),
            _ => wall_clock,
        };
        self.last_stamp = Some(stamp);
        stamp
    }
}

/// The ledger a domain leaves behind when it stops. Handing it to the next join of the same
/// domain keeps fence records across the local node's own membership.
#[derive(Clone, Debug, Default)]
pub struct RetainedHistory {
    history: NodeHistory,
}

impl RetainedHistory {
    pub(crate) fn new(history: NodeHistory) -> Self {
        RetainedHistory { history }
    }

    pub fn entries(&self) -> Vec<NodeHistoryEntry> {
        self.history.to_entries()
    }

    pub fn entry(&self, node_id: NodeId) -> Option<&NodeHistoryEntry> {
        self.history.entry(node_id)
    }

    pub(crate) fn into_history(self) -> NodeHistory {
        self.history
    }
}
