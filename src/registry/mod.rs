//! Process-wide map from domain name to the running domain.
#[allow(clippy::module_inception)]
mod registry;

pub use registry::DomainRegistry;
pub use registry::RegistryConfig;
pub use registry::RegistryError;
