use crate::domain::{Clock, Domain, DomainExit, DomainFailure, DomainStatus, FenceResult, NodeId};
use crate::group::GroupEvent;
use std::error::Error;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
pub(crate) enum Event {
    // Transport pump: membership views and protocol messages, in delivery order.
    Group(GroupEvent),
    // Transport pump: our receiver ended.
    TransportClosed,
    // Fence task: outcome of one agent call.
    FenceResult(FenceResult),
    // Tick timer: re-poll quorum and retry due fence attempts.
    Tick,
    // Override watcher and handle: an administrator acknowledged the node as isolated.
    Override(NodeId),
    // Handle: broadcast that something outside the domain fenced the node.
    ReportExternalFence(NodeId, Callback<(), DomainFailure>),
    Status(Callback<DomainStatus, DomainFailure>),
    Leave(Callback<(), DomainFailure>),
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn status(&self) -> Result<DomainStatus, DomainFailure> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Status(Callback(tx))).await?;
        rx.await.map_err(|_| DomainFailure::ActorExited)?
    }

    pub(crate) async fn report_external_fence(&self, victim: NodeId) -> Result<(), DomainFailure> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::ReportExternalFence(victim, Callback(tx))).await?;
        rx.await.map_err(|_| DomainFailure::ActorExited)?
    }

    pub(crate) async fn override_victim(&self, victim: NodeId) -> Result<(), DomainFailure> {
        self.send(Event::Override(victim)).await
    }

    pub(crate) async fn leave(&self) -> Result<(), DomainFailure> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Leave(Callback(tx))).await?;
        rx.await.map_err(|_| DomainFailure::ActorExited)?
    }

    async fn send(&self, event: Event) -> Result<(), DomainFailure> {
        self.sender.send(event).await.map_err(|_| DomainFailure::ActorExited)
    }
}

/// WeakActorClient is held by background tasks, so they never keep a domain alive on their own.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakActorClient {
    pub(crate) async fn group_event(&self, event: GroupEvent) -> Result<(), DomainFailure> {
        self.send(Event::Group(event)).await
    }

    pub(crate) async fn transport_closed(&self) -> Result<(), DomainFailure> {
        self.send(Event::TransportClosed).await
    }

    pub(crate) async fn fence_result(&self, result: FenceResult) -> Result<(), DomainFailure> {
        self.send(Event::FenceResult(result)).await
    }

    pub(crate) async fn tick(&self) -> Result<(), DomainFailure> {
        self.send(Event::Tick).await
    }

    pub(crate) async fn override_signal(&self, victim: NodeId) -> Result<(), DomainFailure> {
        self.send(Event::Override(victim)).await
    }

    async fn send(&self, event: Event) -> Result<(), DomainFailure> {
        match self.sender.upgrade() {
            Some(sender) => sender.send(event).await.map_err(|_| DomainFailure::ActorExited),
            None => Err(DomainFailure::ActorExited),
        }
    }
}

/// DomainActor is the fence domain in actor model. It is the only place a domain's state is
/// touched.
pub(crate) struct DomainActor<C: Clock> {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    domain: Domain<C>,
}

impl<C: Clock> DomainActor<C> {
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, domain: Domain<C>) -> Self {
        DomainActor {
            logger,
            receiver,
            domain,
        }
    }

    pub(crate) async fn run_event_loop(mut self) -> DomainExit {
        slog::info!(self.logger, "Fence domain event loop started");
        while let Some(event) = self.receiver.recv().await {
            dispatch_event(&mut self.domain, event);
            if self.domain.has_exited() {
                break;
            }
        }

        // Pending callers see their callbacks dropped.
        self.receiver.close();
        let exit = self.domain.into_exit();
        match &exit.result {
            Ok(()) => slog::info!(self.logger, "Fence domain event loop exited"),
            Err(e) => slog::error!(self.logger, "Fence domain event loop exited: {}", e),
        }
        exit
    }
}

// This must NOT be async. Any long running work must be spawned on another task and come back
// as an event to this actor.
pub(crate) fn dispatch_event<C: Clock>(domain: &mut Domain<C>, event: Event) {
    match event {
        Event::Group(event) => domain.handle_group_event(event),
        Event::TransportClosed => domain.handle_transport_closed(),
        Event::FenceResult(result) => domain.handle_fence_result(result),
        Event::Tick => domain.handle_tick(),
        Event::Override(victim) => domain.handle_override(victim),
        Event::ReportExternalFence(victim, callback) => {
            callback.send(domain.handle_external_fence(victim));
        }
        Event::Status(callback) => {
            callback.send(Ok(domain.status()));
        }
        Event::Leave(callback) => {
            callback.send(domain.handle_leave());
        }
    }
}
