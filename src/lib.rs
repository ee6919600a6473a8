mod actor;
mod api;
mod cluster;
mod domain;
mod group;
mod protocol;
mod registry;

pub use api::try_create_fence_domain;
pub use api::FenceDomainClient;
pub use api::FenceDomainConfig;
pub use api::FenceDomainCreationError;
pub use api::FenceDomainHandle;
pub use api::FenceEvent;
pub use api::FenceEventStream;
pub use api::FenceOptions;
pub use api::DEFAULT_OVERRIDE_PATH;
pub use cluster::AgentError;
pub use cluster::ClusterDirectory;
pub use cluster::ExecFenceAgent;
pub use cluster::FenceAgent;
pub use cluster::InMemoryDirectory;
pub use cluster::InMemoryFenceAgent;
pub use domain::ChangeState;
pub use domain::ChangeStatus;
pub use domain::DomainExit;
pub use domain::DomainFailure;
pub use domain::DomainStatus;
pub use domain::FenceMethod;
pub use domain::NodeHistoryEntry;
pub use domain::NodeId;
pub use domain::RetainedHistory;
pub use domain::Stamp;
pub use domain::VictimStatus;
pub use group::GroupEvent;
pub use group::GroupReceiver;
pub use group::GroupSender;
pub use group::GroupTransport;
pub use group::InMemoryGroupHub;
pub use group::InMemoryReceiver;
pub use group::InMemorySender;
pub use group::MembershipEvent;
pub use group::TransportError;
pub use registry::DomainRegistry;
pub use registry::RegistryConfig;
pub use registry::RegistryError;

// `crate::{root_mod}` holds no code, only `mod` and `pub use` statements. No `mod` is `pub`;
// types leave the crate through individual `pub use` statements.
