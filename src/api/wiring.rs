use crate::actor::{ActorClient, DomainActor};
use crate::api::client::{FenceDomainClient, FenceDomainHandle};
use crate::api::event_stream::create_event_stream;
use crate::api::options::FenceOptionsValidated;
use crate::api::FenceOptions;
use crate::cluster::{ClusterDirectory, FenceAgent};
use crate::domain::timers::{OverrideWatcherHandle, TickTimerHandle};
use crate::domain::{Domain, DomainConfig, NodeHistory, NodeId, RealClock, RecoveryConfig, RetainedHistory};
use crate::group::{GroupEventPump, GroupTransport, TransportError};
use std::convert::TryFrom;
use std::sync::Arc;

pub struct FenceDomainConfig {
    /// Group name shared by every member, in practice "default".
    pub name: String,
    pub my_node_id: NodeId,
    pub transport: Arc<dyn GroupTransport>,
    pub directory: Arc<dyn ClusterDirectory>,
    pub agent: Arc<dyn FenceAgent>,
    pub info_logger: slog::Logger,
    pub options: FenceOptions,
    /// What an earlier membership of this node in the same domain left behind.
    pub retained_history: Option<RetainedHistory>,
}

#[derive(Debug, thiserror::Error)]
pub enum FenceDomainCreationError {
    #[error("Illegal options for configuring fence domain: {0}")]
    IllegalOptions(String),
    #[error("Domain name must not be empty")]
    EmptyName,
    #[error("Node id 0 is reserved")]
    ReservedNodeId,
    #[error("Failed to join group")]
    JoinFailed(#[from] TransportError),
}

pub fn try_create_fence_domain(config: FenceDomainConfig) -> Result<FenceDomainClient, FenceDomainCreationError> {
    let options = FenceOptionsValidated::try_from(config.options)
        .map_err(|e| FenceDomainCreationError::IllegalOptions(e.to_string()))?;
    if config.name.is_empty() {
        return Err(FenceDomainCreationError::EmptyName);
    }
    if config.my_node_id.as_u32() == 0 {
        return Err(FenceDomainCreationError::ReservedNodeId);
    }

    let root_logger = config
        .info_logger
        .new(slog::o!("Domain" => config.name.clone(), "NodeId" => config.my_node_id.as_u32()));

    let (sender, receiver) = config.transport.join(&config.name, config.my_node_id)?;

    let (actor_client, actor_queue_rx) = ActorClient::new(options.actor_queue_depth);
    let (event_publisher, events) = create_event_stream();

    let domain = Domain::new(DomainConfig {
        logger: config.info_logger.clone(),
        name: config.name.clone(),
        my_node_id: config.my_node_id,
        clock: RealClock,
        sender,
        directory: config.directory,
        agent: config.agent,
        actor_client: actor_client.weak(),
        event_publisher,
        history: config
            .retained_history
            .map(RetainedHistory::into_history)
            .unwrap_or_else(NodeHistory::new),
        clean_start: options.clean_start,
        override_time: options.override_time,
        recovery: RecoveryConfig {
            post_join_delay: options.post_join_delay,
            post_fail_delay: options.post_fail_delay,
            retry_min_backoff: options.retry_min_backoff,
            retry_max_backoff: options.retry_max_backoff,
        },
    });

    let domain_actor = DomainActor::new(root_logger.clone(), actor_queue_rx, domain);
    let actor_task = tokio::spawn(domain_actor.run_event_loop());

    let pump = GroupEventPump::new(root_logger.clone(), actor_client.weak());
    tokio::spawn(pump.run(receiver));

    let tick_timer = TickTimerHandle::spawn_timer_task(options.tick_interval, actor_client.weak());
    let override_watcher = OverrideWatcherHandle::spawn_watcher_task(
        root_logger,
        options.override_path,
        options.override_poll_interval,
        actor_client.weak(),
    );

    let handle = FenceDomainHandle::new(config.name, actor_client, actor_task, tick_timer, override_watcher);

    Ok(FenceDomainClient { handle, events })
}
