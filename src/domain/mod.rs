mod change;
#[allow(clippy::module_inception)]
mod domain;
mod errors;
mod history;
mod master;
mod membership;
mod node;
mod recovery;
mod status;
#[cfg(test)]
mod tests;
pub(crate) mod timers;
mod victims;

pub use change::ChangeState;
pub use domain::DomainExit;
pub use errors::DomainFailure;
pub use history::FenceMethod;
pub use history::NodeHistoryEntry;
pub use history::RetainedHistory;
pub use history::Stamp;
pub use node::NodeId;
pub use status::ChangeStatus;
pub use status::DomainStatus;
pub use status::VictimStatus;

pub(crate) use domain::Domain;
pub(crate) use domain::DomainConfig;
pub(crate) use domain::FenceResult;
pub(crate) use history::NodeHistory;
pub(crate) use recovery::RecoveryConfig;
pub(crate) use timers::Clock;
pub(crate) use timers::RealClock;
