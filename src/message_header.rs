use crate::message::{MessageFlags, MessageId};
use crate::safe_converter::PrecheckedCast;
use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};

/// Precedes every message record inside a datagram
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_id: MessageId,
    pub flags: MessageFlags,
    pub payload_len: u16,
}

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u32>() + size_of::<u8>() + size_of::<u16>();

    pub(crate) fn for_message(message_id: MessageId, flags: MessageFlags, payload: &[u8]) -> MessageHeader {
        MessageHeader {
            message_id,
            flags,
            payload_len: payload.len().prechecked_cast(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.message_id);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.payload_len);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        let message_id = buf.try_get_u32()?;
        let raw_flags = buf.try_get_u8()?;
        let flags = MessageFlags::from_bits(raw_flags)
            .ok_or_else(|| anyhow!("unknown message flags {:#x}", raw_flags))?;
        let payload_len = buf.try_get_u16()?;
        Ok(MessageHeader {
            message_id,
            flags,
            payload_len,
        })
    }
}
