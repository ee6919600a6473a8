use crate::actor::WeakActorClient;
use crate::group::GroupReceiver;

/// GroupEventPump feeds a domain's group receiver into its actor, preserving delivery order.
pub(crate) struct GroupEventPump {
    logger: slog::Logger,
    local_domain: WeakActorClient,
}

impl GroupEventPump {
    pub(crate) fn new(logger: slog::Logger, local_domain: WeakActorClient) -> Self {
        GroupEventPump { logger, local_domain }
    }

    pub(crate) async fn run(self, mut receiver: Box<dyn GroupReceiver>) {
        while let Some(event) = receiver.next().await {
            if self.local_domain.group_event(event).await.is_err() {
                slog::debug!(self.logger, "Fence domain exited, group event pump stops");
                return;
            }
        }

        slog::info!(self.logger, "Group receiver closed");
        let _ = self.local_domain.transport_closed().await;
    }
}
