//! Group communication the fence domain is built on.
mod api;
mod in_memory;
mod pump;

pub use api::GroupEvent;
pub use api::GroupReceiver;
pub use api::GroupSender;
pub use api::GroupTransport;
pub use api::MembershipEvent;
pub use api::TransportError;
pub use in_memory::InMemoryGroupHub;
pub use in_memory::InMemoryReceiver;
pub use in_memory::InMemorySender;

pub(crate) use pump::GroupEventPump;
