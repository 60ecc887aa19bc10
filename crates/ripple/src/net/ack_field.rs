use std::collections::BTreeMap;

use bytes::{Buf, BufMut};

use super::protocol::PacketError;

/// Remote packets we have accepted but whose acknowledgement the remote has
/// not yet confirmed.
pub type ReceivedPacketField = BTreeMap<u32, ReceivedState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivedState {
    /// Not yet carried in any outgoing ack field.
    Received,
    /// Carried at least once; waiting for the carrier to be acknowledged.
    AckSent,
}

/// Selective acknowledgement bitmap. Bit `i` marks remote packet
/// `first_packet_id + i` as received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckField {
    pub first_packet_id: u32,
    pub acks: Vec<u8>,
}

impl AckField {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.first_packet_id == 0
    }

    /// Collects received ids in `[first, first + max_count)`. Returns the empty
    /// field when nothing in that window is pending.
    pub fn build(first: u32, max_count: u32, received: &ReceivedPacketField) -> Self {
        if first == 0 || max_count == 0 {
            return Self::empty();
        }

        let end = first.saturating_add(max_count);
        let mut acks: Vec<u8> = Vec::new();

        for &id in received.range(first..end).map(|(id, _)| id) {
            let bit = (id - first) as usize;
            let byte = bit / 8;
            if acks.len() <= byte {
                acks.resize(byte + 1, 0);
            }
            acks[byte] |= 1 << (bit % 8);
        }

        if acks.is_empty() {
            return Self::empty();
        }

        Self {
            first_packet_id: first,
            acks,
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        if self.is_empty() || id < self.first_packet_id {
            return false;
        }
        let bit = (id - self.first_packet_id) as usize;
        self.acks
            .get(bit / 8)
            .is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
    }

    pub fn received_ids(&self) -> impl Iterator<Item = u32> + '_ {
        let first = self.first_packet_id;
        self.acks.iter().enumerate().flat_map(move |(byte, bits)| {
            (0..8u32)
                .filter(move |bit| bits & (1 << bit) != 0)
                .filter_map(move |bit| first.checked_add(byte as u32 * 8 + bit))
        })
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.first_packet_id);
        if self.is_empty() {
            return;
        }
        // The window never exceeds 255 bytes, build caps it at 2 * ack_count bits.
        let count = self.acks.len().min(u8::MAX as usize);
        buf.put_u8(count as u8);
        buf.put_slice(&self.acks[..count]);
    }

    pub fn read(buf: &mut impl Buf) -> Result<Self, PacketError> {
        let first_packet_id = buf
            .try_get_u32()
            .map_err(|_| PacketError::Truncated("ack start"))?;
        if first_packet_id == 0 {
            return Ok(Self::empty());
        }

        let count = buf
            .try_get_u8()
            .map_err(|_| PacketError::Truncated("ack count"))? as usize;
        if buf.remaining() < count {
            return Err(PacketError::Truncated("ack bits"));
        }

        // Every bit must name a representable packet number.
        if first_packet_id as u64 + count as u64 * 8 > u32::MAX as u64 + 1 {
            return Err(PacketError::AckOutOfRange(first_packet_id));
        }

        let mut acks = vec![0u8; count];
        buf.copy_to_slice(&mut acks);

        Ok(Self {
            first_packet_id,
            acks,
        })
    }
}

/// An ack field we sent, keyed by the packet that carried it. Once that
/// packet is acknowledged the acked entries can be forgotten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentAcks {
    pub packet_number: u32,
    pub acks: AckField,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(ids: &[u32]) -> ReceivedPacketField {
        ids.iter().map(|&id| (id, ReceivedState::Received)).collect()
    }

    #[test]
    fn test_build_sets_exact_bits() {
        let received = field(&[3, 4, 9, 12, 40]);
        let acks = AckField::build(3, 16, &received);

        assert_eq!(acks.first_packet_id, 3);
        assert_eq!(acks.received_ids().collect::<Vec<_>>(), vec![3, 4, 9, 12]);
        assert!(!acks.contains(40));
        assert!(acks.contains(9));
        assert!(!acks.contains(10));
    }

    #[test]
    fn test_bit_layout() {
        let received = field(&[10, 18, 21]);
        let acks = AckField::build(10, 32, &received);

        // 10 -> byte 0 bit 0, 18 -> byte 1 bit 0, 21 -> byte 1 bit 3
        assert_eq!(acks.acks, vec![0b0000_0001, 0b0000_1001]);
    }

    #[test]
    fn test_build_empty_window() {
        let received = field(&[50]);
        assert!(AckField::build(1, 32, &received).is_empty());
        assert!(AckField::build(0, 32, &received).is_empty());
        assert!(AckField::build(1, 32, &field(&[])).is_empty());
    }

    #[test]
    fn test_write_read() {
        let acks = AckField::build(100, 64, &field(&[100, 101, 130, 163]));

        let mut buf = Vec::new();
        acks.write(&mut buf);
        assert_eq!(buf.len(), 4 + 1 + acks.acks.len());

        let decoded = AckField::read(&mut &buf[..]).unwrap();
        assert_eq!(decoded, acks);
    }

    #[test]
    fn test_empty_field_is_four_bytes() {
        let mut buf = Vec::new();
        AckField::empty().write(&mut buf);
        assert_eq!(buf, vec![0, 0, 0, 0]);
        assert!(AckField::read(&mut &buf[..]).unwrap().is_empty());
    }

    #[test]
    fn test_read_truncated() {
        let mut buf = Vec::new();
        AckField::build(5, 32, &field(&[5, 30])).write(&mut buf);
        buf.pop();

        assert!(matches!(
            AckField::read(&mut &buf[..]),
            Err(PacketError::Truncated(_))
        ));
        assert!(matches!(
            AckField::read(&mut &[0u8, 0][..]),
            Err(PacketError::Truncated("ack start"))
        ));
    }

    #[test]
    fn test_read_rejects_window_past_max_id() {
        let acks = AckField {
            first_packet_id: u32::MAX - 7,
            acks: vec![0xff, 0xff],
        };
        let mut buf = Vec::new();
        acks.write(&mut buf);

        assert!(matches!(
            AckField::read(&mut &buf[..]),
            Err(PacketError::AckOutOfRange(id)) if id == u32::MAX - 7
        ));

        // The last representable window is fine.
        let edge = AckField {
            first_packet_id: u32::MAX - 7,
            acks: vec![0x80],
        };
        buf.clear();
        edge.write(&mut buf);
        let decoded = AckField::read(&mut &buf[..]).unwrap();
        assert_eq!(decoded.received_ids().collect::<Vec<_>>(), vec![u32::MAX]);
        assert!(decoded.contains(u32::MAX));
    }
}
