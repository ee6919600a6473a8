use crate::domain::change::Change;
use crate::domain::NodeId;
use crate::group::MembershipEvent;
use std::collections::BTreeSet;

/// MembershipTracker turns the transport's membership views into queued [`Change`]s.
pub(crate) struct MembershipTracker {
    my_node_id: NodeId,
    previous: Option<BTreeSet<NodeId>>,
    change_seq: u32,
}

impl MembershipTracker {
    pub(crate) fn new(my_node_id: NodeId) -> Self {
        MembershipTracker {
            my_node_id,
            previous: None,
            change_seq: 0,
        }
    }

    /// Returns `None` for events that neither add nor remove anyone.
    pub(crate) fn ingest(&mut self, event: &MembershipEvent) -> Option<Change> {
        let (joined, removed): (BTreeSet<NodeId>, BTreeSet<NodeId>) = match &self.previous {
            Some(previous) => (
                event.members.difference(previous).copied().collect(),
                previous.difference(&event.members).copied().collect(),
            ),
            // Nothing to diff against on our first view, so trust the transport's own list of
            // who joined with it.
            None if event.joined.is_empty() => (event.members.clone(), BTreeSet::new()),
            None => (
                event.joined.intersection(&event.members).copied().collect(),
                BTreeSet::new(),
            ),
        };
        self.previous = Some(event.members.clone());

        if joined.is_empty() && removed.is_empty() {
            return None;
        }

        let left: BTreeSet<NodeId> = removed.intersection(&event.left).copied().collect();
        let we_joined = joined.contains(&self.my_node_id);
        self.change_seq += 1;

        Some(Change::new(
            self.change_seq,
            event.members.clone(),
            joined,
            removed,
            left,
            we_joined,
        ))
    }

    pub(crate) fn current_members(&self) -> Option<&BTreeSet<NodeId>> {
        self.previous.as_ref()
    }
}
