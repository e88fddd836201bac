use crate::config::RudpConfig;
use crate::message::MessageId;
use crate::message_header::MessageHeader;
use crate::packet_header::PacketHeader;
use crate::packet_id::PacketId;
use crate::safe_converter::SafeCast;
use anyhow::bail;
use bytes::{Buf, Bytes};
use std::cmp::min;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// A message record as it was read from a datagram
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ReceivedRecord {
    pub header: MessageHeader,
    pub payload: Bytes,
}

/// Splits the part of a datagram after the packet header into message records. A record that
///  claims more payload than the datagram has left makes the entire datagram invalid.
pub(crate) fn decode_records(mut body: Bytes) -> anyhow::Result<Vec<ReceivedRecord>> {
    let mut result = Vec::new();
    while body.has_remaining() {
        let header = MessageHeader::deser(&mut body)?;
        let payload_len: usize = header.payload_len.safe_cast();
        if payload_len > body.remaining() {
            bail!("message {} declares {} bytes of payload, but only {} bytes remain", header.message_id, payload_len, body.remaining());
        }
        let payload = body.split_to(payload_len);
        result.push(ReceivedRecord { header, payload });
    }
    Ok(result)
}

/// A message that passed all checks and is ready to be handed to the application
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Delivery {
    pub packet_id: PacketId,
    pub message_id: MessageId,
    pub data: Bytes,
}
impl Delivery {
    fn new(packet_id: PacketId, record: ReceivedRecord) -> Delivery {
        Delivery {
            packet_id,
            message_id: record.header.message_id,
            data: record.payload,
        }
    }
}

/// Ids of received reliable packets that still need to be acknowledged
#[derive(Debug, Default)]
pub(crate) struct PendingAcks {
    acks: Vec<PacketId>,
    deadline: Option<Instant>,
}
impl PendingAcks {
    pub fn add(&mut self, packet_id: PacketId, now: Instant, ack_delay: std::time::Duration) {
        if !self.acks.contains(&packet_id) {
            self.acks.push(packet_id);
        }
        if self.deadline.is_none() {
            self.deadline = Some(now + ack_delay);
        }
    }

    /// Removes up to `max` acks, oldest first
    pub fn take(&mut self, max: usize) -> Vec<PacketId> {
        let n = min(max, self.acks.len());
        let result: Vec<PacketId> = self.acks.drain(..n).collect();
        if self.acks.is_empty() {
            self.deadline = None;
        }
        result
    }

    pub fn len(&self) -> usize {
        self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Pending acks are sent on their own if they waited long enough, or if they fill a packet
    pub fn is_due(&self, now: Instant, max_acks_per_packet: usize) -> bool {
        match self.deadline {
            None => false,
            Some(deadline) => deadline <= now || self.len() >= max_acks_per_packet,
        }
    }
}

pub(crate) struct ReceiveStream {
    config: Arc<RudpConfig>,

    /// Ids of packets received in the duplicate window, i.e. above `highest_received` minus the
    ///  window size. Everything below the window is treated as received.
    received: BTreeSet<PacketId>,
    highest_received: PacketId,

    /// The id of the most recent packet from which an unreliable in-order message was delivered.
    ///  In-order messages from older packets are stale and discarded.
    last_sequenced: PacketId,

    /// The ordered sequence number of the next packet whose reliable in-order messages can be
    ///  delivered. Packets with higher numbers wait in `ordered_pending` until the gap is closed.
    next_ordered_seq: u64,
    ordered_pending: BTreeMap<u64, (PacketId, Vec<ReceivedRecord>)>,

    pending_acks: PendingAcks,

    num_packets_received: u64,
    num_duplicates_discarded: u64,
}

impl ReceiveStream {
    pub fn new(config: Arc<RudpConfig>) -> ReceiveStream {
        ReceiveStream {
            config,
            received: BTreeSet::new(),
            highest_received: PacketId::ZERO,
            last_sequenced: PacketId::ZERO,
            next_ordered_seq: 1,
            ordered_pending: BTreeMap::new(),
            pending_acks: PendingAcks::default(),
            num_packets_received: 0,
            num_duplicates_discarded: 0,
        }
    }

    /// Forgets all received packets, e.g. because the peer started over with a new session.
    ///  The statistics are kept.
    pub fn reset(&mut self) {
        *self = ReceiveStream {
            num_packets_received: self.num_packets_received,
            num_duplicates_discarded: self.num_duplicates_discarded,
            ..ReceiveStream::new(self.config.clone())
        };
    }

    pub fn pending_acks(&mut self) -> &mut PendingAcks {
        &mut self.pending_acks
    }

    pub fn ack_deadline(&self) -> Option<Instant> {
        self.pending_acks.deadline()
    }

    pub fn num_packets_received(&self) -> u64 {
        self.num_packets_received
    }

    pub fn num_duplicates_discarded(&self) -> u64 {
        self.num_duplicates_discarded
    }

    /// Returns the messages that are ready for delivery, in the order in which they should be
    ///  delivered: messages without ordering constraints first, then reliable in-order messages
    ///  (including those from previously buffered packets that this packet unblocked).
    pub fn on_packet(&mut self, header: &PacketHeader, records: Vec<ReceivedRecord>, now: Instant) -> Vec<Delivery> {
        let packet_id = header.packet_id;
        self.num_packets_received += 1;

        if self.is_below_window(packet_id) {
            // we cannot tell whether this packet was received before, so it must not be acknowledged:
            //  the sender retransmits until it gives up, instead of losing its content silently
            debug!("discarding packet {} below the duplicate window without acknowledging it", packet_id);
            self.num_duplicates_discarded += 1;
            return Vec::new();
        }

        if header.reliable {
            // duplicates of reliable packets are acknowledged again - the previous ack may have been lost
            self.pending_acks.add(packet_id, now, self.config.ack_delay);
        }

        if self.received.contains(&packet_id) {
            debug!("discarding duplicate packet {}", packet_id);
            self.num_duplicates_discarded += 1;
            return Vec::new();
        }
        self.register_received(packet_id);

        let is_stale = packet_id < self.last_sequenced;
        let mut has_sequenced = false;

        let mut result = Vec::new();
        let mut reliable_in_order = Vec::new();
        for record in records {
            let flags = record.header.flags;
            if flags.is_reliable_in_order() {
                reliable_in_order.push(record);
                continue;
            }
            if flags.is_in_order() {
                if is_stale {
                    trace!("discarding stale message {} from packet {} - already delivered packet {}", record.header.message_id, packet_id, self.last_sequenced);
                    continue;
                }
                has_sequenced = true;
            }
            result.push(Delivery::new(packet_id, record));
        }
        if has_sequenced {
            self.last_sequenced = packet_id;
        }

        match header.ordered_seq {
            None => {
                if !reliable_in_order.is_empty() {
                    debug!("packet {} contains reliable in-order messages but no ordered sequence number - discarding them", packet_id);
                }
            }
            Some(seq) if seq < self.next_ordered_seq => {
                debug!("packet {} has ordered sequence number {}, which was delivered already", packet_id, seq);
            }
            Some(seq) if seq == self.next_ordered_seq => {
                result.extend(reliable_in_order.into_iter().map(|r| Delivery::new(packet_id, r)));
                self.next_ordered_seq += 1;
                self.drain_ordered_pending(&mut result);
            }
            Some(seq) => {
                trace!("packet {} with ordered sequence number {} arrived before {} - buffering", packet_id, seq, self.next_ordered_seq);
                self.ordered_pending.insert(seq, (packet_id, reliable_in_order));
            }
        }

        result
    }

    fn drain_ordered_pending(&mut self, result: &mut Vec<Delivery>) {
        while let Some((packet_id, records)) = self.ordered_pending.remove(&self.next_ordered_seq) {
            trace!("delivering buffered packet {} with ordered sequence number {}", packet_id, self.next_ordered_seq);
            result.extend(records.into_iter().map(|r| Delivery::new(packet_id, r)));
            self.next_ordered_seq += 1;
        }
    }

    fn window_threshold(&self) -> Option<PacketId> {
        self.highest_received - self.config.duplicate_window_size
    }

    fn is_below_window(&self, packet_id: PacketId) -> bool {
        self.window_threshold()
            .map_or(false, |threshold| packet_id <= threshold)
    }

    fn register_received(&mut self, packet_id: PacketId) {
        self.received.insert(packet_id);
        if packet_id > self.highest_received {
            self.highest_received = packet_id;
            if let Some(threshold) = self.window_threshold() {
                self.received = self.received.split_off(&threshold.next());
            }
        }
    }
}
