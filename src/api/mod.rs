//! This mod is meant to hold most of the code for the library's client-facing API.
mod client;
mod event_stream;
mod options;
mod wiring;

pub use client::FenceDomainClient;
pub use client::FenceDomainHandle;
pub use event_stream::FenceEvent;
pub use event_stream::FenceEventStream;
pub use options::FenceOptions;
pub use options::DEFAULT_OVERRIDE_PATH;
pub use wiring::try_create_fence_domain;
pub use wiring::FenceDomainConfig;
pub use wiring::FenceDomainCreationError;

// So the domain can publish audit events.
pub(crate) use event_stream::create_event_stream;
pub(crate) use event_stream::FenceEventPublisher;
