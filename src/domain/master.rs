use crate::domain::NodeId;
use std::collections::BTreeSet;

/// Every member runs the same rule over the same ordered membership view and the same complete
/// list, so all members agree on the master without exchanging anything: the lowest complete
/// member fences. A joiner without history is never master. A joiner that has not yet heard
/// from a complete member has no master.
#[derive(Debug, Default)]
pub(crate) struct MasterElector {
    master: Option<NodeId>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum MasterChange {
    Unchanged,
    Changed { from: Option<NodeId>, to: Option<NodeId> },
}

impl MasterElector {
    pub(crate) fn new() -> Self {
        MasterElector::default()
    }

    pub(crate) fn elect(members: &BTreeSet<NodeId>, complete: &BTreeSet<NodeId>) -> Option<NodeId> {
        members.iter().find(|member| complete.contains(member)).copied()
    }

    pub(crate) fn recompute(&mut self, members: &BTreeSet<NodeId>, complete: &BTreeSet<NodeId>) -> MasterChange {
        let elected = MasterElector::elect(members, complete);
        if elected == self.master {
            return MasterChange::Unchanged;
        }

        let from = self.master;
        self.master = elected;
        MasterChange::Changed { from, to: elected }
    }

    pub(crate) fn master(&self) -> Option<NodeId> {
        self.master
    }

    pub(crate) fn is_master(&self, node_id: NodeId) -> bool {
        self.master == Some(node_id)
    }
}
