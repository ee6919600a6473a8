use crate::actor::ActorClient;
use crate::api::FenceEventStream;
use crate::domain::timers::{OverrideWatcherHandle, TickTimerHandle};
use crate::domain::{DomainExit, DomainFailure, DomainStatus, NodeId};
use tokio::task::JoinHandle;

/// Returned by `try_create_fence_domain()`.
pub struct FenceDomainClient {
    pub handle: FenceDomainHandle,
    pub events: FenceEventStream,
}

/// FenceDomainHandle is how the application talks to a running fence domain. Dropping it without
/// `leave()` stops the domain's timers, and the domain itself once nothing else refers to it.
pub struct FenceDomainHandle {
    name: String,
    actor_client: ActorClient,
    actor_task: JoinHandle<DomainExit>,
    _tick_timer: TickTimerHandle,
    _override_watcher: OverrideWatcherHandle,
}

impl FenceDomainHandle {
    pub(crate) fn new(
        name: String,
        actor_client: ActorClient,
        actor_task: JoinHandle<DomainExit>,
        tick_timer: TickTimerHandle,
        override_watcher: OverrideWatcherHandle,
    ) -> Self {
        FenceDomainHandle {
            name,
            actor_client,
            actor_task,
            _tick_timer: tick_timer,
            _override_watcher: override_watcher,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn status(&self) -> Result<DomainStatus, DomainFailure> {
        self.actor_client.status().await
    }

    /// Tells every member that `victim` was fenced by means outside the domain.
    pub async fn report_external_fence(&self, victim: NodeId) -> Result<(), DomainFailure> {
        self.actor_client.report_external_fence(victim).await
    }

    /// Administrator acknowledgement that `victim` is isolated. Same effect as writing its id to
    /// the override file.
    pub async fn override_victim(&self, victim: NodeId) -> Result<(), DomainFailure> {
        self.actor_client.override_victim(victim).await
    }

    /// Leaves the group cleanly and waits for the domain to stop. The returned history can be
    /// handed to the next join of the same domain.
    pub async fn leave(self) -> Result<DomainExit, DomainFailure> {
        // If the domain already failed, its exit tells why.
        let _ = self.actor_client.leave().await;
        self.closed().await
    }

    /// Waits for the domain to stop on its own, e.g. after losing the transport.
    pub async fn closed(mut self) -> Result<DomainExit, DomainFailure> {
        // The strong client and timers live until the actor is done, or it would stop as soon as
        // its queue drained.
        (&mut self.actor_task).await.map_err(|_| DomainFailure::ActorExited)
    }
}
