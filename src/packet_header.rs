use crate::packet_id::PacketId;
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crc::{Crc, CRC_32_ISCSI};
use num_enum::{IntoPrimitive, TryFromPrimitive};

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Session id placeholder for 'not known yet'
pub const NO_SESSION: u64 = 0;

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    struct Flags: u8 {
        const MASK_KIND   = 0b0000_0011;
        const RELIABLE    = 0b0000_0100;
        const ORDERED_SEQ = 0b0000_1000;
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum PacketKind {
    /// regular datagram with acks and message records
    Data = 0,
    /// the sender closed the connection
    Disconnect = 1,
}

/// The header at the start of every datagram. See the crate documentation for the wire format.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    /// identifies the sending connection's incarnation, random and non-zero
    pub session_id: u64,
    /// the receiver's session id as far as the sender knows it, [NO_SESSION] before the sender
    ///  received anything from the receiver
    pub peer_session_id: u64,
    pub packet_id: PacketId,
    /// the receiver should acknowledge this packet
    pub reliable: bool,
    /// present iff the packet contains reliable in-order messages
    pub ordered_seq: Option<u64>,
    /// piggybacked acknowledgements of reliable packets received from the peer
    pub acks: Vec<PacketId>,
}

impl PacketHeader {
    pub const PROTOCOL_VERSION_1: u8 = 1;
    pub const CHECKSUM_LEN: usize = size_of::<u32>();

    pub fn new(kind: PacketKind, packet_id: PacketId) -> PacketHeader {
        PacketHeader {
            kind,
            session_id: NO_SESSION,
            peer_session_id: NO_SESSION,
            packet_id,
            reliable: false,
            ordered_seq: None,
            acks: Vec::new(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::serialized_len_for(self.ordered_seq.is_some(), self.acks.len())
    }

    pub fn serialized_len_for(has_ordered_seq: bool, num_acks: usize) -> usize {
        Self::CHECKSUM_LEN
            + size_of::<u8>()   // protocol version
            + size_of::<u8>()   // flags
            + size_of::<u64>()  // session id
            + size_of::<u64>()  // peer session id
            + size_of::<u64>()  // packet id
            + if has_ordered_seq { size_of::<u64>() } else { 0 }
            + varint_len(num_acks)
            + num_acks * size_of::<u64>()
    }

    /// Writes the header with a zero checksum - call [PacketHeader::init_checksum] once the
    ///  datagram is complete
    pub fn ser(&self, buf: &mut BytesMut) {
        let mut flags = Flags::from_bits_truncate(self.kind.into());
        flags.set(Flags::RELIABLE, self.reliable);
        flags.set(Flags::ORDERED_SEQ, self.ordered_seq.is_some());

        buf.put_u32(0);
        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u8(flags.bits());
        buf.put_u64(self.session_id);
        buf.put_u64(self.peer_session_id);
        buf.put_u64(self.packet_id.to_raw());
        if let Some(ordered_seq) = self.ordered_seq {
            buf.put_u64(ordered_seq);
        }
        buf.put_usize_varint(self.acks.len());
        for ack in &self.acks {
            buf.put_u64(ack.to_raw());
        }
    }

    /// NB: This does not verify the checksum, see [PacketHeader::is_checksum_valid]
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let _checksum = buf.try_get_u32()?;

        let protocol_version = buf.try_get_u8()?;
        if protocol_version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", protocol_version);
        }

        let flags = Flags::from_bits_truncate(buf.try_get_u8()?);
        let kind = PacketKind::try_from((flags & Flags::MASK_KIND).bits())?;

        let session_id = buf.try_get_u64()?;
        let peer_session_id = buf.try_get_u64()?;
        let packet_id = PacketId::from_raw(buf.try_get_u64()?);
        let ordered_seq = if flags.contains(Flags::ORDERED_SEQ) {
            Some(buf.try_get_u64()?)
        }
        else {
            None
        };

        let num_acks = buf.try_get_usize_varint()?;
        if num_acks > buf.remaining() / size_of::<u64>() {
            bail!("packet {} declares {} acks, which do not fit into the remaining {} bytes", packet_id, num_acks, buf.remaining());
        }
        let mut acks = Vec::with_capacity(num_acks);
        for _ in 0..num_acks {
            acks.push(PacketId::from_raw(buf.try_get_u64()?));
        }

        Ok(PacketHeader {
            kind,
            session_id,
            peer_session_id,
            packet_id,
            reliable: flags.contains(Flags::RELIABLE),
            ordered_seq,
            acks,
        })
    }

    /// Writes the checksum over the rest of the datagram into its first four bytes
    pub fn init_checksum(packet_buf: &mut [u8]) {
        let checksum = CHECKSUM.checksum(&packet_buf[Self::CHECKSUM_LEN..]);
        packet_buf[..Self::CHECKSUM_LEN].copy_from_slice(&checksum.to_be_bytes());
    }

    pub fn is_checksum_valid(packet_buf: &[u8]) -> bool {
        if packet_buf.len() < Self::CHECKSUM_LEN {
            return false;
        }
        let mut expected = &packet_buf[..Self::CHECKSUM_LEN];
        expected.get_u32() == CHECKSUM.checksum(&packet_buf[Self::CHECKSUM_LEN..])
    }
}

fn varint_len(mut value: usize) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}
