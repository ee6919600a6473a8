//! Wire format of the messages fence domain members exchange over the group transport.
mod header;
mod message;
mod snapshot;

pub(crate) use header::MessageFlags;
pub(crate) use header::MessageHeader;
pub(crate) use header::MessageType;
pub(crate) use header::HEADER_LEN;
pub(crate) use header::PROTOCOL_VERSION;
pub(crate) use message::decode;
pub(crate) use message::encode;
pub(crate) use message::DecodeError;
pub(crate) use message::FenceMessage;
pub(crate) use snapshot::DomainSnapshot;
pub(crate) use snapshot::SnapshotVictim;
