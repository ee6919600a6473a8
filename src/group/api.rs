use crate::domain::NodeId;
use bytes::Bytes;
use std::collections::BTreeSet;

/// One membership view of a group, delivered in the same order to every member.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MembershipEvent {
    pub members: BTreeSet<NodeId>,
    pub joined: BTreeSet<NodeId>,
    /// Members that left on their own. Anyone else missing from `members` failed.
    pub left: BTreeSet<NodeId>,
}

#[derive(Clone, Debug)]
pub enum GroupEvent {
    Membership(MembershipEvent),
    Message { sender: NodeId, payload: Bytes },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("node {node} is not a member of group {group}")]
    NotMember { group: String, node: NodeId },
    #[error("node {node} already joined group {group}")]
    AlreadyJoined { group: String, node: NodeId },
    #[error("group transport unavailable: {0}")]
    Unavailable(String),
}

/// A group communication system with virtual synchrony: every member sees the same membership
/// views and messages in the same order, and a member's own messages are delivered back to it.
pub trait GroupTransport: Send + Sync + 'static {
    fn join(
        &self,
        group: &str,
        node_id: NodeId,
    ) -> Result<(Box<dyn GroupSender>, Box<dyn GroupReceiver>), TransportError>;
}

pub trait GroupSender: Send + Sync + 'static {
    /// Broadcasts to every member, including ourselves.
    fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    fn leave(&self) -> Result<(), TransportError>;
}

#[async_trait::async_trait]
pub trait GroupReceiver: Send + 'static {
    /// `None` once the local node is no longer part of the group.
    async fn next(&mut self) -> Option<GroupEvent>;
}
