use crate::domain::{FenceMethod, NodeId};
use tokio::sync::mpsc;

pub(crate) fn create_event_stream() -> (FenceEventPublisher, FenceEventStream) {
    let (tx, rx) = mpsc::unbounded_channel();

    let publisher = FenceEventPublisher { sender: tx };
    let stream = FenceEventStream { receiver: rx };

    (publisher, stream)
}

/// Audit trail of what a domain decided and observed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FenceEvent {
    ChangeQueued {
        seq: u32,
        members: Vec<NodeId>,
        joined: Vec<NodeId>,
        removed: Vec<NodeId>,
    },
    ChangeStarted {
        seq: u32,
        victims: Vec<NodeId>,
    },
    ChangeResolved {
        seq: u32,
    },
    VictimFenced {
        victim: NodeId,
        how: FenceMethod,
        reporter: NodeId,
    },
    FenceAttemptFailed {
        victim: NodeId,
        attempts: u32,
    },
    FencingDeferred {
        master: Option<NodeId>,
    },
    CompleteSent {
        to: NodeId,
    },
    CompleteReceived {
        from: NodeId,
    },
    /// A START announced fewer victims than this member still waits on.
    StartMismatch {
        from: NodeId,
        announced: Vec<NodeId>,
        outstanding: Vec<NodeId>,
    },
    ProtocolViolation {
        sender: NodeId,
        reason: String,
    },
}

pub(crate) struct FenceEventPublisher {
    sender: mpsc::UnboundedSender<FenceEvent>,
}

impl FenceEventPublisher {
    pub(crate) fn publish(&self, logger: &slog::Logger, event: FenceEvent) {
        if let Err(_) = self.sender.send(event) {
            slog::trace!(logger, "FenceEventStream has disconnected.");
        }
    }
}

// For external application to observe the domain.
pub struct FenceEventStream {
    receiver: mpsc::UnboundedReceiver<FenceEvent>,
}

impl FenceEventStream {
    /// next returns the next audit event, or `None` once the domain has stopped and every event
    /// was consumed.
    pub async fn next(&mut self) -> Option<FenceEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of `next()`.
    pub fn try_next(&mut self) -> Option<FenceEvent> {
        self.receiver.try_recv().ok()
    }
}
