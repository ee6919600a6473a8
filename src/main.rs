use fenced::{
    DomainRegistry, ExecFenceAgent, FenceAgent, FenceEventStream, FenceOptions, InMemoryDirectory, InMemoryFenceAgent,
    InMemoryGroupHub, NodeId, RegistryConfig,
};
use slog::Drain;
use std::error::Error;
use std::sync::Arc;
use tokio::time::Duration;

const DOMAIN: &str = "default";

// Runs three members of one fence domain in-process, crashes one of them and lets the others
// fence it. Set FENCED_AGENT to a fence program to run it instead of the in-memory agent.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let logger = create_root_logger_for_stdout();
    let hub = InMemoryGroupHub::new();
    let directory = InMemoryDirectory::with_nodes(&[1, 2, 3]);
    let agent: Arc<dyn FenceAgent> = match std::env::var("FENCED_AGENT") {
        Ok(program) => Arc::new(ExecFenceAgent::new(program, vec![])),
        Err(_) => Arc::new(InMemoryFenceAgent::new()),
    };

    let mut registries = Vec::new();
    for id in 1..=3 {
        let mut registry = DomainRegistry::new(RegistryConfig {
            my_node_id: NodeId::new(id),
            transport: Arc::new(hub.clone()),
            directory: Arc::new(directory.clone()),
            agent: agent.clone(),
            info_logger: logger.clone(),
            options: FenceOptions {
                post_join_delay: Some(Duration::from_secs(1)),
                override_path: Some(std::env::temp_dir().join(format!("fenced_override_{}", id))),
                ..FenceOptions::default()
            },
        });
        let events = registry.join(DOMAIN)?;
        tokio::spawn(log_events(logger.new(slog::o!("NodeId" => id)), events));
        registries.push(registry);
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    slog::info!(logger, "Crashing node 3");
    directory.set_member(NodeId::new(3), false);
    hub.fail_node(DOMAIN, NodeId::new(3))?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    if let Some(domain) = registries[0].domain(DOMAIN) {
        let status = domain.status().await?;
        slog::info!(
            logger,
            "Node 1 sees master {:?}, members {:?}, victims {}, queued changes {}",
            status.master,
            status.members,
            status.victims.len(),
            status.changes.len()
        );
        if let Some(entry) = status.history_of(NodeId::new(3)) {
            slog::info!(logger, "Node 3 fenced by {:?} via {:?}", entry.fence_master, entry.fence_how);
        }
    }

    let mut crashed = registries.pop().ok_or("no registry for node 3")?;
    if let Err(e) = crashed.reap(DOMAIN).await {
        slog::info!(logger, "Node 3 domain stopped: {}", e);
    }
    for registry in registries.iter_mut() {
        registry.leave(DOMAIN).await?;
    }

    Ok(())
}

async fn log_events(logger: slog::Logger, mut events: FenceEventStream) {
    while let Some(event) = events.next().await {
        slog::info!(logger, "{:?}", event);
    }
}

fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}
