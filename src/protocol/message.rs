use crate::domain::{FenceMethod, NodeId};
use crate::protocol::{DomainSnapshot, MessageFlags, MessageHeader, MessageType, HEADER_LEN, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// The four messages of the fencing protocol. What `msgdata` carries differs per type:
///
/// * START - number of victim ids in the body (u32 LE each).
/// * VICTIM_DONE - the victim id; the body is the u32 LE method tag.
/// * COMPLETE - number of history entries in the protobuf body.
/// * EXTERNAL - the victim id; no body.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum FenceMessage {
    Start { victims: Vec<NodeId> },
    VictimDone { victim: NodeId, how: FenceMethod },
    Complete { snapshot: DomainSnapshot },
    External { victim: NodeId },
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum DecodeError {
    #[error("message truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },
    #[error("incompatible protocol major version {major}")]
    IncompatibleVersion { major: u16 },
    #[error("unknown message type {0}")]
    UnknownType(u16),
    #[error("unknown fence method {0}")]
    UnknownMethod(u32),
    #[error("malformed message body: {0}")]
    MalformedBody(&'static str),
    #[error("undecodable snapshot: {0}")]
    Snapshot(#[from] prost::DecodeError),
}

pub(crate) fn method_tag(how: FenceMethod) -> u32 {
    match how {
        FenceMethod::Agent => 1,
        FenceMethod::Member => 2,
        FenceMethod::Override => 3,
        FenceMethod::External => 4,
    }
}

pub(crate) fn method_from_tag(tag: u32) -> Option<FenceMethod> {
    match tag {
        1 => Some(FenceMethod::Agent),
        2 => Some(FenceMethod::Member),
        3 => Some(FenceMethod::Override),
        4 => Some(FenceMethod::External),
        _ => None,
    }
}

impl FenceMessage {
    fn msg_type(&self) -> MessageType {
        match self {
            FenceMessage::Start { .. } => MessageType::Start,
            FenceMessage::VictimDone { .. } => MessageType::VictimDone,
            FenceMessage::Complete { .. } => MessageType::Complete,
            FenceMessage::External { .. } => MessageType::External,
        }
    }

    fn msgdata(&self) -> u32 {
        match self {
            FenceMessage::Start { victims } => victims.len() as u32,
            FenceMessage::VictimDone { victim, .. } => victim.as_u32(),
            FenceMessage::Complete { snapshot } => snapshot.history.len() as u32,
            FenceMessage::External { victim } => victim.as_u32(),
        }
    }

    fn body_len(&self) -> usize {
        match self {
            FenceMessage::Start { victims } => victims.len() * 4,
            FenceMessage::VictimDone { .. } => 4,
            FenceMessage::Complete { snapshot } => snapshot.encoded_len(),
            FenceMessage::External { .. } => 0,
        }
    }

    fn write_body(&self, buf: &mut impl BufMut) {
        match self {
            FenceMessage::Start { victims } => {
                for victim in victims {
                    buf.put_u32_le(victim.as_u32());
                }
            }
            FenceMessage::VictimDone { how, .. } => buf.put_u32_le(method_tag(*how)),
            FenceMessage::Complete { snapshot } => snapshot.encode_to(buf),
            FenceMessage::External { .. } => {}
        }
    }
}

pub(crate) fn encode(
    sender: NodeId,
    domain_id: u32,
    destination: Option<NodeId>,
    flags: MessageFlags,
    message: &FenceMessage,
) -> Bytes {
    let header = MessageHeader {
        version: PROTOCOL_VERSION,
        msg_type: message.msg_type(),
        sender,
        destination,
        domain_id,
        flags,
        msgdata: message.msgdata(),
    };

    let mut buf = BytesMut::with_capacity(HEADER_LEN + message.body_len());
    header.write_to(&mut buf);
    message.write_body(&mut buf);
    buf.freeze()
}

pub(crate) fn decode(payload: &Bytes) -> Result<(MessageHeader, FenceMessage), DecodeError> {
    let mut buf = payload.clone();
    let header = MessageHeader::read_from(&mut buf)?;

    let message = match header.msg_type {
        MessageType::Start => {
            let count = header.msgdata as usize;
            ensure_remaining(&buf, count.saturating_mul(4))?;
            let mut victims = Vec::with_capacity(count);
            for _ in 0..count {
                victims.push(valid_node(buf.get_u32_le())?);
            }
            FenceMessage::Start { victims }
        }
        MessageType::VictimDone => {
            ensure_remaining(&buf, 4)?;
            let tag = buf.get_u32_le();
            FenceMessage::VictimDone {
                victim: valid_node(header.msgdata)?,
                how: method_from_tag(tag).ok_or(DecodeError::UnknownMethod(tag))?,
            }
        }
        MessageType::Complete => {
            let snapshot = DomainSnapshot::decode_from(buf)?;
            if snapshot.history.len() != header.msgdata as usize {
                return Err(DecodeError::MalformedBody("history count does not match header"));
            }
            FenceMessage::Complete { snapshot }
        }
        MessageType::External => FenceMessage::External {
            victim: valid_node(header.msgdata)?,
        },
    };

    Ok((header, message))
}

fn ensure_remaining(buf: &Bytes, needed: usize) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated {
            needed: HEADER_LEN + needed,
            available: HEADER_LEN + buf.remaining(),
        });
    }
    Ok(())
}

fn valid_node(id: u32) -> Result<NodeId, DecodeError> {
    match id {
        0 => Err(DecodeError::MalformedBody("node id 0")),
        id => Ok(NodeId::new(id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeHistoryEntry, Stamp};

    fn node(id: u32) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn start_carries_victim_count_and_ids() {
        let message = FenceMessage::Start {
            victims: vec![node(3), node(5)],
        };
        let bytes = encode(node(1), 7, None, MessageFlags::COMPLETE, &message);
        assert_eq!(bytes.len(), HEADER_LEN + 8);

        let (header, decoded) = decode(&bytes).unwrap();
        assert_eq!(header.msgdata, 2);
        assert_eq!(header.flags, MessageFlags::COMPLETE);
        assert_eq!(decoded, message);
    }

    #[test]
    fn victim_done_carries_victim_in_msgdata() {
        let message = FenceMessage::VictimDone {
            victim: node(3),
            how: FenceMethod::Override,
        };
        let bytes = encode(node(2), 7, None, MessageFlags::COMPLETE, &message);

        let (header, decoded) = decode(&bytes).unwrap();
        assert_eq!(header.msgdata, 3);
        assert_eq!(header.sender, node(2));
        assert_eq!(decoded, message);
    }

    #[test]
    fn complete_is_addressed_and_counts_history() {
        let mut entry = NodeHistoryEntry::new(node(3));
        entry.fence_time = Some(Stamp::from_millis(10));
        entry.fence_how = Some(FenceMethod::Agent);
        entry.fence_master = Some(node(1));
        let message = FenceMessage::Complete {
            snapshot: DomainSnapshot {
                history: vec![entry],
                victims: vec![],
                complete_nodes: vec![node(1)],
            },
        };
        let bytes = encode(node(1), 7, Some(node(4)), MessageFlags::COMPLETE, &message);

        let (header, decoded) = decode(&bytes).unwrap();
        assert_eq!(header.destination, Some(node(4)));
        assert_eq!(header.msgdata, 1);
        assert_eq!(decoded, message);
    }

    #[test]
    fn truncated_start_body_is_rejected() {
        let message = FenceMessage::Start {
            victims: vec![node(3), node(5)],
        };
        let bytes = encode(node(1), 7, None, MessageFlags::empty(), &message);
        let short = bytes.slice(..HEADER_LEN + 4);

        let err = decode(&short).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn victim_done_without_method_is_rejected() {
        let message = FenceMessage::External { victim: node(3) };
        let bytes = encode(node(1), 7, None, MessageFlags::empty(), &message);
        // Same header with the type patched to VICTIM_DONE has no method tag behind it.
        let mut patched = BytesMut::from(&bytes[..]);
        patched[6] = 2;

        let err = decode(&patched.freeze()).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn external_for_node_zero_is_rejected() {
        let mut bytes = BytesMut::from(&encode(node(1), 7, None, MessageFlags::empty(), &FenceMessage::External { victim: node(3) })[..]);
        bytes[24] = 0;

        let err = decode(&bytes.freeze()).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedBody(_)));
    }
}
