use crate::domain::NodeId;
use std::collections::{BTreeSet, VecDeque};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChangeState {
    /// Waiting for earlier changes and for quorum.
    WaitConditions,
    /// Waiting for every victim to be fenced and, for our own join, for COMPLETE.
    WaitMessages,
}

/// One membership transition, queued until it is fully resolved.
#[derive(Clone, Debug)]
pub(crate) struct Change {
    pub(crate) seq: u32,
    pub(crate) members: BTreeSet<NodeId>,
    pub(crate) joined: BTreeSet<NodeId>,
    pub(crate) removed: BTreeSet<NodeId>,
    /// Removed nodes that left on their own. They are never victims.
    pub(crate) left: BTreeSet<NodeId>,
    pub(crate) state: ChangeState,
    pub(crate) we_joined: bool,
    /// Victims of this change without a fence record yet. Filled on entering WAIT_MESSAGES.
    pub(crate) outstanding: BTreeSet<NodeId>,
}

impl Change {
    pub(crate) fn new(
        seq: u32,
        members: BTreeSet<NodeId>,
        joined: BTreeSet<NodeId>,
        removed: BTreeSet<NodeId>,
        left: BTreeSet<NodeId>,
        we_joined: bool,
    ) -> Self {
        Change {
            seq,
            members,
            joined,
            removed,
            left,
            state: ChangeState::WaitConditions,
            we_joined,
            outstanding: BTreeSet::new(),
        }
    }

    pub(crate) fn member_count(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn joined_count(&self) -> usize {
        self.joined.len()
    }

    pub(crate) fn removed_count(&self) -> usize {
        self.removed.len()
    }

    /// Removed nodes that did not leave cleanly.
    pub(crate) fn failed(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.removed.difference(&self.left).copied()
    }

    pub(crate) fn failed_count(&self) -> usize {
        self.failed().count()
    }

    pub(crate) fn has_failed(&self, node_id: NodeId) -> bool {
        self.removed.contains(&node_id) && !self.left.contains(&node_id)
    }

    /// Members that were already in the domain before this change.
    pub(crate) fn previous_members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.difference(&self.joined).copied()
    }
}

/// Changes resolve strictly in arrival order; only the head is ever active.
#[derive(Debug, Default)]
pub(crate) struct ChangeQueue {
    changes: VecDeque<Change>,
}

impl ChangeQueue {
    pub(crate) fn new() -> Self {
        ChangeQueue::default()
    }

    pub(crate) fn push(&mut self, change: Change) {
        self.changes.push_back(change);
    }

    pub(crate) fn head(&self) -> Option<&Change> {
        self.changes.front()
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut Change> {
        self.changes.front_mut()
    }

    pub(crate) fn pop_head(&mut self) -> Option<Change> {
        self.changes.pop_front()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    /// Removes the node from the outstanding victims of every started change.
    pub(crate) fn drain_outstanding(&mut self, node_id: NodeId) {
        for change in self.changes.iter_mut() {
            change.outstanding.remove(&node_id);
        }
    }

    /// Whether a queued change still waits on a fence of this node. Started changes wait on their
    /// outstanding victims; changes not yet started on any failed node with an unfenced failure,
    /// which the caller decides through `unfenced`.
    pub(crate) fn awaits_fence_of(&self, node_id: NodeId, unfenced: bool) -> bool {
        self.changes.iter().any(|change| match change.state {
            ChangeState::WaitMessages => change.outstanding.contains(&node_id),
            ChangeState::WaitConditions => unfenced && change.has_failed(node_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[u32]) -> BTreeSet<NodeId> {
        ids.iter().copied().map(NodeId::new).collect()
    }

    #[test]
    fn cleanly_left_nodes_are_not_failed() {
        let change = Change::new(1, set(&[1]), set(&[]), set(&[2, 3]), set(&[2]), false);
        assert_eq!(change.removed_count(), 2);
        assert_eq!(change.failed().collect::<Vec<_>>(), vec![NodeId::new(3)]);
        assert!(change.has_failed(NodeId::new(3)));
        assert!(!change.has_failed(NodeId::new(2)));
    }

    #[test]
    fn previous_members_exclude_joiners() {
        let change = Change::new(1, set(&[1, 2, 4]), set(&[4]), set(&[]), set(&[]), false);
        assert_eq!(change.previous_members().collect::<Vec<_>>(), vec![NodeId::new(1), NodeId::new(2)]);
    }

    #[test]
    fn awaits_fence_by_state() {
        let mut queue = ChangeQueue::new();
        let mut started = Change::new(1, set(&[1, 2]), set(&[]), set(&[3]), set(&[]), false);
        started.state = ChangeState::WaitMessages;
        started.outstanding = set(&[3]);
        queue.push(started);
        queue.push(Change::new(2, set(&[1]), set(&[]), set(&[2]), set(&[]), false));

        assert!(queue.awaits_fence_of(NodeId::new(3), false));
        assert!(!queue.awaits_fence_of(NodeId::new(2), false));
        assert!(queue.awaits_fence_of(NodeId::new(2), true));

        queue.drain_outstanding(NodeId::new(3));
        assert!(!queue.awaits_fence_of(NodeId::new(3), true));
        assert!(queue.head().unwrap().outstanding.is_empty());
    }
}
