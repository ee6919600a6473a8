//! The cluster manager and fence agent a domain consults.
mod api;
mod exec_agent;
mod in_memory;

pub use api::AgentError;
pub use api::ClusterDirectory;
pub use api::FenceAgent;
pub use exec_agent::ExecFenceAgent;
pub use in_memory::InMemoryDirectory;
pub use in_memory::InMemoryFenceAgent;
