use crate::domain::{ChangeState, NodeHistoryEntry, NodeId};

/// Point-in-time dump of a domain, as answered by `FenceDomainHandle::status()`.
#[derive(Clone, Debug)]
pub struct DomainStatus {
    pub name: String,
    pub my_node_id: NodeId,
    pub master: Option<NodeId>,
    /// We joined and have not received authoritative state yet.
    pub joining: bool,
    pub leaving: bool,
    pub init_complete: bool,
    pub members: Vec<NodeId>,
    pub complete_nodes: Vec<NodeId>,
    pub victims: Vec<VictimStatus>,
    pub changes: Vec<ChangeStatus>,
    pub history: Vec<NodeHistoryEntry>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VictimStatus {
    pub node_id: NodeId,
    pub name: String,
    pub init_victim: bool,
    pub attempts: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChangeStatus {
    pub seq: u32,
    pub state: ChangeState,
    pub member_count: usize,
    pub joined_count: usize,
    pub removed_count: usize,
    pub failed_count: usize,
    pub we_joined: bool,
    pub outstanding: Vec<NodeId>,
}

impl DomainStatus {
    pub fn history_of(&self, node_id: NodeId) -> Option<&NodeHistoryEntry> {
        self.history.iter().find(|entry| entry.node_id == node_id)
    }

    pub fn is_victim(&self, node_id: NodeId) -> bool {
        self.victims.iter().any(|victim| victim.node_id == node_id)
    }
}
