use crate::domain::NodeId;

/// Everything that can go wrong while a domain recovers. Only `TransportUnavailable` ends the
/// domain; the rest are logged and recovery carries on.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RecoveryError {
    #[error("group transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("cluster is not quorate")]
    QuorumLost,
    #[error("fence agent failed for node {victim}: {reason}")]
    AgentFailure { victim: NodeId, reason: String },
    #[error("protocol violation from node {sender}: {reason}")]
    ProtocolViolation { sender: NodeId, reason: String },
    #[error("stale fence report for node {victim} from node {reporter}")]
    StaleReport { victim: NodeId, reporter: NodeId },
}

/// Why a fence domain is no longer running.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DomainFailure {
    #[error("group transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("fence domain is no longer running")]
    ActorExited,
}
