use crate::api::{
    try_create_fence_domain, FenceDomainConfig, FenceDomainCreationError, FenceDomainHandle, FenceEventStream,
    FenceOptions,
};
use crate::cluster::{ClusterDirectory, FenceAgent};
use crate::domain::{DomainExit, DomainFailure, NodeId, RetainedHistory};
use crate::group::GroupTransport;
use std::collections::HashMap;
use std::sync::Arc;

pub struct RegistryConfig {
    pub my_node_id: NodeId,
    pub transport: Arc<dyn GroupTransport>,
    pub directory: Arc<dyn ClusterDirectory>,
    pub agent: Arc<dyn FenceAgent>,
    pub info_logger: slog::Logger,
    pub options: FenceOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Already a member of fence domain {0}")]
    AlreadyJoined(String),
    #[error("Not a member of fence domain {0}")]
    NotJoined(String),
    #[error("Failed to create fence domain")]
    Creation(#[from] FenceDomainCreationError),
    #[error("Fence domain {name} stopped with failure: {failure}")]
    DomainFailed { name: String, failure: DomainFailure },
}

/// DomainRegistry creates a domain on join and destroys it on leave. The history a domain leaves
/// behind is kept per name and seeds the next join.
pub struct DomainRegistry {
    config: RegistryConfig,
    domains: HashMap<String, FenceDomainHandle>,
    retained: HashMap<String, RetainedHistory>,
}

impl DomainRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        DomainRegistry {
            config,
            domains: HashMap::new(),
            retained: HashMap::new(),
        }
    }

    pub fn join(&mut self, name: &str) -> Result<FenceEventStream, RegistryError> {
        if self.domains.contains_key(name) {
            return Err(RegistryError::AlreadyJoined(name.to_string()));
        }

        let client = try_create_fence_domain(FenceDomainConfig {
            name: name.to_string(),
            my_node_id: self.config.my_node_id,
            transport: self.config.transport.clone(),
            directory: self.config.directory.clone(),
            agent: self.config.agent.clone(),
            info_logger: self.config.info_logger.clone(),
            options: self.config.options.clone(),
            retained_history: self.retained.get(name).cloned(),
        })?;

        slog::info!(self.config.info_logger, "Joined fence domain {}", name);
        self.domains.insert(name.to_string(), client.handle);
        Ok(client.events)
    }

    /// Leaves cleanly. A domain that had already failed is removed as well, so it can be joined
    /// again, and its failure is returned.
    pub async fn leave(&mut self, name: &str) -> Result<(), RegistryError> {
        let handle = self
            .domains
            .remove(name)
            .ok_or_else(|| RegistryError::NotJoined(name.to_string()))?;

        let outcome = handle.leave().await;
        self.retire(name, outcome)
    }

    /// Waits for a domain to stop on its own and removes it.
    pub async fn reap(&mut self, name: &str) -> Result<(), RegistryError> {
        let handle = self
            .domains
            .remove(name)
            .ok_or_else(|| RegistryError::NotJoined(name.to_string()))?;

        let outcome = handle.closed().await;
        self.retire(name, outcome)
    }

    pub fn domain(&self, name: &str) -> Option<&FenceDomainHandle> {
        self.domains.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.domains.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn retained_history(&self, name: &str) -> Option<&RetainedHistory> {
        self.retained.get(name)
    }

    /// Keeps the history the domain left behind. Without an exit, i.e. when the actor task itself
    /// died, whatever an earlier membership retained stays in place.
    fn retire(&mut self, name: &str, outcome: Result<DomainExit, DomainFailure>) -> Result<(), RegistryError> {
        let exit = match outcome {
            Ok(exit) => exit,
            Err(failure) => {
                slog::error!(
                    self.config.info_logger,
                    "Fence domain {} stopped without handing back its history: {}",
                    name,
                    failure
                );
                return Err(RegistryError::DomainFailed {
                    name: name.to_string(),
                    failure,
                });
            }
        };
        self.retained.insert(name.to_string(), exit.history);
        match exit.result {
            Ok(()) => {
                slog::info!(self.config.info_logger, "Left fence domain {}", name);
                Ok(())
            }
            Err(failure) => Err(RegistryError::DomainFailed {
                name: name.to_string(),
                failure,
            }),
        }
    }
}
