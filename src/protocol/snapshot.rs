use crate::domain::{FenceMethod, NodeHistoryEntry, NodeId, Stamp};
use crate::protocol::message::{method_from_tag, method_tag};
use crate::protocol::DecodeError;
use bytes::{Buf, BufMut};
use prost::Message;

/// State a complete member hands to a joiner in COMPLETE.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DomainSnapshot {
    pub(crate) history: Vec<NodeHistoryEntry>,
    pub(crate) victims: Vec<SnapshotVictim>,
    pub(crate) complete_nodes: Vec<NodeId>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct SnapshotVictim {
    pub(crate) node_id: NodeId,
    pub(crate) name: String,
    pub(crate) init_victim: bool,
}

impl DomainSnapshot {
    pub(crate) fn encoded_len(&self) -> usize {
        ProtoDomainSnapshot::from(self).encoded_len()
    }

    pub(crate) fn encode_to(&self, buf: &mut impl BufMut) {
        ProtoDomainSnapshot::from(self).encode_raw(buf);
    }

    pub(crate) fn decode_from(buf: impl Buf) -> Result<Self, DecodeError> {
        let proto = ProtoDomainSnapshot::decode(buf)?;
        DomainSnapshot::try_from_proto(proto)
    }

    fn try_from_proto(proto: ProtoDomainSnapshot) -> Result<Self, DecodeError> {
        let mut history = Vec::with_capacity(proto.history.len());
        for entry in proto.history {
            if entry.node_id == 0 {
                return Err(DecodeError::MalformedBody("history entry for node 0"));
            }
            let fence_how = match entry.fence_how {
                0 => None,
                tag => Some(method_from_tag(tag).ok_or(DecodeError::UnknownMethod(tag))?),
            };
            history.push(NodeHistoryEntry {
                node_id: NodeId::new(entry.node_id),
                check_quorum: entry.check_quorum,
                add_time: stamp(entry.add_time),
                left_time: stamp(entry.left_time),
                fail_time: stamp(entry.fail_time),
                fence_time: stamp(entry.fence_time),
                fence_external_time: stamp(entry.fence_external_time),
                fence_external_node: node(entry.fence_external_node),
                fence_master: node(entry.fence_master),
                fence_how,
            });
        }

        let victims = proto
            .victims
            .into_iter()
            .map(|victim| SnapshotVictim {
                node_id: NodeId::new(victim.node_id),
                name: victim.name,
                init_victim: victim.init_victim,
            })
            .collect();

        let complete_nodes = proto.complete_nodes.into_iter().map(NodeId::new).collect();

        Ok(DomainSnapshot {
            history,
            victims,
            complete_nodes,
        })
    }
}

// Zero stands for "never" / "nobody" on the wire.
fn stamp(millis: u64) -> Option<Stamp> {
    match millis {
        0 => None,
        millis => Some(Stamp::from_millis(millis)),
    }
}

fn node(id: u32) -> Option<NodeId> {
    match id {
        0 => None,
        id => Some(NodeId::new(id)),
    }
}

fn stamp_millis(stamp: Option<Stamp>) -> u64 {
    stamp.map(|s| s.as_millis()).unwrap_or(0)
}

fn node_u32(node: Option<NodeId>) -> u32 {
    node.map(|n| n.as_u32()).unwrap_or(0)
}

impl From<&DomainSnapshot> for ProtoDomainSnapshot {
    fn from(snapshot: &DomainSnapshot) -> Self {
        ProtoDomainSnapshot {
            history: snapshot
                .history
                .iter()
                .map(|entry| ProtoHistoryEntry {
                    node_id: entry.node_id.as_u32(),
                    check_quorum: entry.check_quorum,
                    add_time: stamp_millis(entry.add_time),
                    left_time: stamp_millis(entry.left_time),
                    fail_time: stamp_millis(entry.fail_time),
                    fence_time: stamp_millis(entry.fence_time),
                    fence_external_time: stamp_millis(entry.fence_external_time),
                    fence_external_node: node_u32(entry.fence_external_node),
                    fence_master: node_u32(entry.fence_master),
                    fence_how: entry.fence_how.map(method_tag).unwrap_or(0),
                })
                .collect(),
            victims: snapshot
                .victims
                .iter()
                .map(|victim| ProtoVictim {
                    node_id: victim.node_id.as_u32(),
                    name: victim.name.clone(),
                    init_victim: victim.init_victim,
                })
                .collect(),
            complete_nodes: snapshot.complete_nodes.iter().map(|n| n.as_u32()).collect(),
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
struct ProtoDomainSnapshot {
    #[prost(message, repeated, tag = "1")]
    history: Vec<ProtoHistoryEntry>,
    #[prost(message, repeated, tag = "2")]
    victims: Vec<ProtoVictim>,
    #[prost(uint32, repeated, tag = "3")]
    complete_nodes: Vec<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct ProtoHistoryEntry {
    #[prost(uint32, tag = "1")]
    node_id: u32,
    #[prost(bool, tag = "2")]
    check_quorum: bool,
    #[prost(uint64, tag = "3")]
    add_time: u64,
    #[prost(uint64, tag = "4")]
    left_time: u64,
    #[prost(uint64, tag = "5")]
    fail_time: u64,
    #[prost(uint64, tag = "6")]
    fence_time: u64,
    #[prost(uint64, tag = "7")]
    fence_external_time: u64,
    #[prost(uint32, tag = "8")]
    fence_external_node: u32,
    #[prost(uint32, tag = "9")]
    fence_master: u32,
    #[prost(uint32, tag = "10")]
    fence_how: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
struct ProtoVictim {
    #[prost(uint32, tag = "1")]
    node_id: u32,
    #[prost(string, tag = "2")]
    name: String,
    #[prost(bool, tag = "3")]
    init_victim: bool,
}
