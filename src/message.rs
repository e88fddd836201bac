use crate::ref_counted::{RefCount, RefCounted};
use bitflags::bitflags;
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU8, Ordering};

/// Application defined message type tag
pub type MessageId = u32;

/// Application defined identity of a message's content, used to replace stale queued or in-flight
///  messages with newer ones. `0` means 'no content id', and such messages never replace each other.
pub type ContentId = u32;

pub const NO_CONTENT_ID: ContentId = 0;

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug, Default, Hash)]
    pub struct MessageFlags: u8 {
        /// the message is retransmitted until it is acknowledged
        const RELIABLE = 0b0000_0001;
        /// reliable: delivered in send order; unreliable: stale messages are discarded
        const IN_ORDER = 0b0000_0010;
    }
}

impl MessageFlags {
    pub fn is_reliable(&self) -> bool {
        self.contains(MessageFlags::RELIABLE)
    }

    pub fn is_in_order(&self) -> bool {
        self.contains(MessageFlags::IN_ORDER)
    }

    pub fn is_reliable_in_order(&self) -> bool {
        self.contains(MessageFlags::RELIABLE | MessageFlags::IN_ORDER)
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum MessageStatus {
    /// waiting in the outbound queue
    Queued = 0,
    /// transmitted at least once; final for unreliable messages
    Sent = 1,
    /// the packet containing the message was acknowledged by the peer
    Acknowledged = 2,
    /// superseded by a newer message with the same content id, or discarded when the connection
    ///  ended before the message was acknowledged
    Obsolete = 3,
}

/// An outbound message. The engine and the application share it through a
///  [Handle](crate::ref_counted::Handle), and the application can observe its progress through
///  [NetworkMessage::status].
pub struct NetworkMessage {
    ref_count: RefCount,
    message_id: MessageId,
    content_id: ContentId,
    flags: MessageFlags,
    payload: Bytes,
    status: AtomicU8,
}

impl RefCounted for NetworkMessage {
    fn ref_count(&self) -> &RefCount {
        &self.ref_count
    }
}

impl NetworkMessage {
    pub fn new(message_id: MessageId, content_id: ContentId, flags: MessageFlags, payload: Bytes) -> NetworkMessage {
        NetworkMessage {
            ref_count: RefCount::new(),
            message_id,
            content_id,
            flags,
            payload,
            status: AtomicU8::new(MessageStatus::Queued.into()),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn status(&self) -> MessageStatus {
        MessageStatus::try_from(self.status.load(Ordering::Acquire))
            .expect("only valid status values are ever stored")
    }

    pub fn is_obsolete(&self) -> bool {
        self.status() == MessageStatus::Obsolete
    }

    /// The replacement key, if the message has a content id
    pub(crate) fn content_key(&self) -> Option<(MessageId, ContentId)> {
        if self.content_id == NO_CONTENT_ID {
            None
        }
        else {
            Some((self.message_id, self.content_id))
        }
    }

    pub(crate) fn mark_sent(&self) {
        // only a queued message moves to 'sent' - retransmission must not resurrect an obsolete one
        let _ = self.status.compare_exchange(MessageStatus::Queued.into(), MessageStatus::Sent.into(), Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn mark_acknowledged(&self) {
        let _ = self.status.compare_exchange(MessageStatus::Sent.into(), MessageStatus::Acknowledged.into(), Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn mark_obsolete(&self) {
        let _ = self.status.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            if s == u8::from(MessageStatus::Acknowledged) {
                None
            }
            else {
                Some(MessageStatus::Obsolete.into())
            }
        });
    }
}

impl Debug for NetworkMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MSG{{id:{},content:{},{:?},{} bytes,{:?}}}", self.message_id, self.content_id, self.flags, self.payload.len(), self.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::none(MessageFlags::empty(), false, false)]
    #[case::reliable(MessageFlags::RELIABLE, true, false)]
    #[case::sequenced(MessageFlags::IN_ORDER, false, false)]
    #[case::reliable_ordered(MessageFlags::RELIABLE | MessageFlags::IN_ORDER, true, true)]
    fn test_flags(#[case] flags: MessageFlags, #[case] reliable: bool, #[case] reliable_in_order: bool) {
        assert_eq!(flags.is_reliable(), reliable);
        assert_eq!(flags.is_reliable_in_order(), reliable_in_order);
    }

    #[rstest]
    #[case::no_content_id(0, None)]
    #[case::content_id(9, Some((4, 9)))]
    fn test_content_key(#[case] content_id: ContentId, #[case] expected: Option<(MessageId, ContentId)>) {
        let msg = NetworkMessage::new(4, content_id, MessageFlags::RELIABLE, Bytes::from_static(b"x"));
        assert_eq!(msg.content_key(), expected);
    }

    #[test]
    fn test_status_transitions() {
        let msg = NetworkMessage::new(1, 0, MessageFlags::RELIABLE, Bytes::new());
        assert_eq!(msg.status(), MessageStatus::Queued);

        msg.mark_acknowledged();
        assert_eq!(msg.status(), MessageStatus::Queued);

        msg.mark_sent();
        assert_eq!(msg.status(), MessageStatus::Sent);
        msg.mark_acknowledged();
        assert_eq!(msg.status(), MessageStatus::Acknowledged);

        msg.mark_obsolete();
        assert_eq!(msg.status(), MessageStatus::Acknowledged);
    }

    #[test]
    fn test_obsolete_is_final() {
        let msg = NetworkMessage::new(1, 3, MessageFlags::RELIABLE, Bytes::new());
        msg.mark_sent();
        msg.mark_obsolete();
        assert!(msg.is_obsolete());

        msg.mark_sent();
        msg.mark_acknowledged();
        assert!(msg.is_obsolete());
    }
}
