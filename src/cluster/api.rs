use crate::domain::NodeId;
use std::io;

/// The cluster manager's view of nodes and quorum. Calls must be cheap, they happen on the
/// domain's event loop.
pub trait ClusterDirectory: Send + Sync + 'static {
    fn quorate(&self) -> bool;

    fn node_name(&self, node_id: NodeId) -> String;

    /// Whether the cluster manager currently counts the node as a member.
    fn is_member(&self, node_id: NodeId) -> bool;

    /// Every node in the cluster configuration, member or not.
    fn configured_nodes(&self) -> Vec<NodeId>;
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("fence agent reported failure: {0}")]
    Failed(String),
    #[error("fence agent could not be run: {0}")]
    Io(#[from] io::Error),
}

/// Runs the actual fencing action. A call is never cancelled once started.
#[async_trait::async_trait]
pub trait FenceAgent: Send + Sync + 'static {
    async fn fence(&self, victim: NodeId, victim_name: &str) -> Result<(), AgentError>;
}
