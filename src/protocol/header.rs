use crate::domain::NodeId;
use crate::protocol::DecodeError;
use bytes::{Buf, BufMut};

pub(crate) const HEADER_LEN: usize = 40;
pub(crate) const PROTOCOL_VERSION: [u16; 3] = [1, 1, 0];

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum MessageType {
    Start,
    VictimDone,
    Complete,
    External,
}

impl MessageType {
    fn as_u16(&self) -> u16 {
        match self {
            MessageType::Start => 1,
            MessageType::VictimDone => 2,
            MessageType::Complete => 3,
            MessageType::External => 4,
        }
    }

    fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(MessageType::Start),
            2 => Some(MessageType::VictimDone),
            3 => Some(MessageType::Complete),
            4 => Some(MessageType::External),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Describes the sender at the time it sent the message.
    pub(crate) struct MessageFlags: u32 {
        const JOINING = 1;
        const COMPLETE = 2;
    }
}

/// Byte representation (all fields little-endian):
///
/// ```text
/// |  0..6   | 6..8 | 8..12  | 12..16 | 16..20    | 20..24 | 24..28  | 28..40  |
/// +---------+------+--------+--------+-----------+--------+---------+---------+
/// | version | type | sender |   to   | domain id | flags  | msgdata | padding |
/// +---------+------+--------+--------+-----------+--------+---------+---------+
/// ```
///
/// * `version` - three u16: major, minor, patch. Only the major must match.
/// * `to` - destination node, 0 for every member.
/// * `domain id` - identifies the domain instance, so stray traffic from another group is dropped.
/// * `msgdata` - one type-specific word, see [`FenceMessage`](crate::protocol::FenceMessage).
/// * `padding` - reserved, written as zero and ignored on read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MessageHeader {
    pub(crate) version: [u16; 3],
    pub(crate) msg_type: MessageType,
    pub(crate) sender: NodeId,
    pub(crate) destination: Option<NodeId>,
    pub(crate) domain_id: u32,
    pub(crate) flags: MessageFlags,
    pub(crate) msgdata: u32,
}

impl MessageHeader {
    pub(crate) fn write_to(&self, buf: &mut impl BufMut) {
        for part in self.version.iter() {
            buf.put_u16_le(*part);
        }
        buf.put_u16_le(self.msg_type.as_u16());
        buf.put_u32_le(self.sender.as_u32());
        buf.put_u32_le(self.destination.map(|node| node.as_u32()).unwrap_or(0));
        buf.put_u32_le(self.domain_id);
        buf.put_u32_le(self.flags.bits());
        buf.put_u32_le(self.msgdata);
        buf.put_u32_le(0);
        buf.put_u64_le(0);
    }

    pub(crate) fn read_from(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: HEADER_LEN,
                available: buf.remaining(),
            });
        }

        let version = [buf.get_u16_le(), buf.get_u16_le(), buf.get_u16_le()];
        if version[0] != PROTOCOL_VERSION[0] {
            return Err(DecodeError::IncompatibleVersion { major: version[0] });
        }

        let raw_type = buf.get_u16_le();
        let msg_type = MessageType::from_u16(raw_type).ok_or(DecodeError::UnknownType(raw_type))?;
        let sender = NodeId::new(buf.get_u32_le());
        let destination = match buf.get_u32_le() {
            0 => None,
            id => Some(NodeId::new(id)),
        };
        let domain_id = buf.get_u32_le();
        // Unknown flag bits from a newer minor version are dropped.
        let flags = MessageFlags::from_bits_truncate(buf.get_u32_le());
        let msgdata = buf.get_u32_le();
        buf.advance(4 + 8);

        Ok(MessageHeader {
            version,
            msg_type,
            sender,
            destination,
            domain_id,
            flags,
            msgdata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn header() -> MessageHeader {
        MessageHeader {
            version: PROTOCOL_VERSION,
            msg_type: MessageType::VictimDone,
            sender: NodeId::new(1),
            destination: None,
            domain_id: 0xCAFE,
            flags: MessageFlags::COMPLETE,
            msgdata: 3,
        }
    }

    #[test]
    fn layout_is_little_endian_and_forty_bytes() {
        let mut buf = BytesMut::new();
        header().write_to(&mut buf);

        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(&buf[0..6], &[1, 0, 1, 0, 0, 0]);
        assert_eq!(&buf[6..8], &[2, 0]);
        assert_eq!(&buf[8..12], &[1, 0, 0, 0]);
        assert_eq!(&buf[12..16], &[0, 0, 0, 0]);
        assert_eq!(&buf[16..20], &[0xFE, 0xCA, 0, 0]);
        assert_eq!(&buf[20..24], &[2, 0, 0, 0]);
        assert_eq!(&buf[24..28], &[3, 0, 0, 0]);
        assert!(buf[28..40].iter().all(|b| *b == 0));
    }

    #[test]
    fn destination_zero_means_broadcast() {
        let mut addressed = header();
        addressed.destination = Some(NodeId::new(4));
        let mut buf = BytesMut::new();
        addressed.write_to(&mut buf);

        let parsed = MessageHeader::read_from(&mut buf.freeze()).unwrap();
        assert_eq!(parsed.destination, Some(NodeId::new(4)));

        let mut buf = BytesMut::new();
        header().write_to(&mut buf);
        let parsed = MessageHeader::read_from(&mut buf.freeze()).unwrap();
        assert_eq!(parsed.destination, None);
    }

    #[test]
    fn rejects_other_major_version() {
        let mut newer = header();
        newer.version = [2, 0, 0];
        let mut buf = BytesMut::new();
        newer.write_to(&mut buf);

        let err = MessageHeader::read_from(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, DecodeError::IncompatibleVersion { major: 2 }));
    }

    #[test]
    fn accepts_other_minor_version() {
        let mut newer = header();
        newer.version = [1, 7, 3];
        let mut buf = BytesMut::new();
        newer.write_to(&mut buf);

        let parsed = MessageHeader::read_from(&mut buf.freeze()).unwrap();
        assert_eq!(parsed.version, [1, 7, 3]);
    }

    #[test]
    fn rejects_unknown_type_and_short_input() {
        let mut buf = BytesMut::new();
        header().write_to(&mut buf);
        buf[6] = 9;
        let err = MessageHeader::read_from(&mut buf.clone().freeze()).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType(9)));

        let err = MessageHeader::read_from(&mut &buf[..12]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { needed: 40, available: 12 }));
    }
}
