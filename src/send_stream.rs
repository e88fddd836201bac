use crate::config::RudpConfig;
use crate::end_point::EndPoint;
use crate::message::{ContentId, MessageId, NetworkMessage};
use crate::message_header::MessageHeader;
use crate::packet_header::{PacketHeader, PacketKind, NO_SESSION};
use crate::packet_id::PacketId;
use crate::receive_stream::PendingAcks;
use crate::ref_counted::Handle;
use crate::send_socket::SendSocket;
use anyhow::bail;
use bytes::{BufMut, BytesMut};
use rustc_hash::FxHashMap;
use std::cmp::min;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

/// A reliable packet that was sent and is waiting for its acknowledgement
struct InFlightPacket {
    ordered_seq: Option<u64>,
    /// only the reliable messages - unreliable messages are never retransmitted
    messages: Vec<Handle<NetworkMessage>>,
    first_sent: Instant,
    retransmit_at: Instant,
    retransmit_timeout: Duration,
    num_retransmissions: u32,
}

fn record_len(msg: &NetworkMessage) -> usize {
    MessageHeader::SERIALIZED_LEN + msg.payload().len()
}

fn new_session_id() -> u64 {
    match Uuid::new_v4().as_u128() as u64 {
        NO_SESSION => 1,
        id => id,
    }
}

pub(crate) struct SendStream {
    config: Arc<RudpConfig>,
    peer_addr: EndPoint,
    send_socket: Arc<dyn SendSocket>,

    /// Identifies this connection object on the wire. Packet ids restart at 1 for every new
    ///  connection to the same peer, so the receiver uses the session to tell them apart.
    session_id: u64,
    /// The peer's session as far as it is known, echoed in every packet
    peer_session_id: u64,

    /// Messages waiting to be packed into a packet, in send order
    outbound: VecDeque<Handle<NetworkMessage>>,

    /// The most recent queued or in-flight message for each (message id, non-zero content id).
    ///  A new message with the same key takes the old one's place in `outbound` if it is still
    ///  queued, or makes it obsolete if it is in flight.
    content_index: FxHashMap<(MessageId, ContentId), Handle<NetworkMessage>>,

    in_flight: BTreeMap<PacketId, InFlightPacket>,

    next_packet_id: PacketId,
    /// Packets containing reliable in-order messages are numbered contiguously in addition to
    ///  their packet id, so the receiver can detect gaps in the ordered stream
    next_ordered_seq: u64,

    smoothed_rtt: Option<Duration>,

    num_packets_sent: u64,
    num_packets_retransmitted: u64,
}

impl SendStream {
    pub fn new(config: Arc<RudpConfig>, peer_addr: EndPoint, send_socket: Arc<dyn SendSocket>) -> SendStream {
        SendStream {
            config,
            peer_addr,
            send_socket,
            session_id: new_session_id(),
            peer_session_id: NO_SESSION,
            outbound: VecDeque::new(),
            content_index: FxHashMap::default(),
            in_flight: BTreeMap::new(),
            next_packet_id: PacketId::FIRST,
            next_ordered_seq: 1,
            smoothed_rtt: None,
            num_packets_sent: 0,
            num_packets_retransmitted: 0,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn peer_session_id(&self) -> u64 {
        self.peer_session_id
    }

    pub fn set_peer_session_id(&mut self, peer_session_id: u64) {
        self.peer_session_id = peer_session_id;
    }

    /// The peer started a new session: everything sent to its previous session is lost, and
    ///  numbering starts over. Our own session id stays the same.
    pub fn restart(&mut self, peer_session_id: u64) {
        self.abandon();
        self.peer_session_id = peer_session_id;
        self.next_packet_id = PacketId::FIRST;
        self.next_ordered_seq = 1;
    }

    fn new_header(&self, kind: PacketKind, packet_id: PacketId) -> PacketHeader {
        let mut header = PacketHeader::new(kind, packet_id);
        header.session_id = self.session_id;
        header.peer_session_id = self.peer_session_id;
        header
    }

    pub fn num_packets_sent(&self) -> u64 {
        self.num_packets_sent
    }

    pub fn num_packets_retransmitted(&self) -> u64 {
        self.num_packets_retransmitted
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.smoothed_rtt
    }

    pub fn has_queued_messages(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn next_retransmit(&self) -> Option<Instant> {
        self.in_flight.values()
            .map(|p| p.retransmit_at)
            .min()
    }

    fn retransmit_timeout(&self) -> Duration {
        match self.smoothed_rtt {
            None => self.config.initial_retransmit_timeout,
            Some(rtt) => (rtt * 2).clamp(self.config.min_retransmit_timeout, self.config.max_retransmit_timeout),
        }
    }

    fn on_rtt_sample(&mut self, sample: Duration) {
        self.smoothed_rtt = Some(match self.smoothed_rtt {
            None => sample,
            Some(prev) => (prev * 7 + sample) / 8,
        });
        trace!("RTT sample {:?} for {:?}, smoothed RTT is now {:?}", sample, self.peer_addr, self.smoothed_rtt);
    }

    pub fn enqueue(&mut self, msg: Handle<NetworkMessage>) {
        if let Some(key) = msg.content_key() {
            if let Some(prev) = self.content_index.insert(key, msg.clone()) {
                prev.mark_obsolete();

                if let Some(pos) = self.outbound.iter().position(|m| *m == prev) {
                    trace!("replacing queued message {:?} with content id {}", key.0, key.1);
                    self.outbound[pos] = msg;
                    return;
                }
                trace!("message {:?} with content id {} superseded while in flight", key.0, key.1);
            }
        }
        self.outbound.push_back(msg);
    }

    fn remove_from_index(&mut self, msg: &Handle<NetworkMessage>) {
        if let Some(key) = msg.content_key() {
            if self.content_index.get(&key) == Some(msg) {
                self.content_index.remove(&key);
            }
        }
    }

    /// Packs all queued messages into packets and sends them, piggybacking pending acks
    pub fn flush(&mut self, now: Instant, pending_acks: &mut PendingAcks) -> io::Result<()> {
        while !self.outbound.is_empty() {
            self.send_next_packet(now, pending_acks)?;
        }
        Ok(())
    }

    fn send_next_packet(&mut self, now: Instant, pending_acks: &mut PendingAcks) -> io::Result<()> {
        let acks = pending_acks.take(self.config.max_acks_per_packet);
        // always leave room for an ordered sequence number
        let capacity = self.config.payload_size_inside_udp - PacketHeader::serialized_len_for(true, acks.len());

        let mut messages = Vec::new();
        let mut used = 0;
        while let Some(msg) = self.outbound.pop_front() {
            let len = record_len(&msg);
            if used + len > capacity {
                self.outbound.push_front(msg);
                break;
            }
            used += len;
            messages.push(msg);
        }
        debug_assert!(!messages.is_empty(), "messages are limited to a size that fits into a packet");

        let reliable = messages.iter().any(|m| m.flags().is_reliable());
        let ordered_seq = if messages.iter().any(|m| m.flags().is_reliable_in_order()) {
            let seq = self.next_ordered_seq;
            self.next_ordered_seq += 1;
            Some(seq)
        }
        else {
            None
        };

        let packet_id = self.next_packet_id;
        self.next_packet_id += 1;

        let mut header = self.new_header(PacketKind::Data, packet_id);
        header.reliable = reliable;
        header.ordered_seq = ordered_seq;
        header.acks = acks;
        trace!("sending packet {:?} with {} messages to {:?}", header, messages.len(), self.peer_addr);
        if let Err(e) = self.send_packet(&header, &messages) {
            // the messages stay queued so abandon() can still reach them
            for msg in messages.into_iter().rev() {
                self.outbound.push_front(msg);
            }
            return Err(e);
        }

        for msg in &messages {
            msg.mark_sent();
            if !msg.flags().is_reliable() {
                self.remove_from_index(msg);
            }
        }

        if reliable {
            let retransmit_timeout = self.retransmit_timeout();
            self.in_flight.insert(packet_id, InFlightPacket {
                ordered_seq,
                messages: messages.into_iter()
                    .filter(|m| m.flags().is_reliable())
                    .collect(),
                first_sent: now,
                retransmit_at: now + retransmit_timeout,
                retransmit_timeout,
                num_retransmissions: 0,
            });
        }
        Ok(())
    }

    fn send_packet(&mut self, header: &PacketHeader, messages: &[Handle<NetworkMessage>]) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(self.config.payload_size_inside_udp);
        header.ser(&mut buf);
        for msg in messages {
            MessageHeader::for_message(msg.message_id(), msg.flags(), msg.payload()).ser(&mut buf);
            buf.put_slice(msg.payload());
        }
        debug_assert!(buf.len() <= self.config.payload_size_inside_udp);

        PacketHeader::init_checksum(&mut buf);
        self.send_socket.do_send_packet(self.peer_addr, &buf)?;
        self.num_packets_sent += 1;
        Ok(())
    }

    /// Sends pending acks in packets of their own
    pub fn send_acks(&mut self, pending_acks: &mut PendingAcks) -> io::Result<()> {
        while !pending_acks.is_empty() {
            let packet_id = self.next_packet_id;
            self.next_packet_id += 1;

            let mut header = self.new_header(PacketKind::Data, packet_id);
            header.acks = pending_acks.take(self.config.max_acks_per_packet);
            trace!("sending ack packet {:?} to {:?}", header, self.peer_addr);
            self.send_packet(&header, &[])?;
        }
        Ok(())
    }

    pub fn send_disconnect(&mut self) -> io::Result<()> {
        let packet_id = self.next_packet_id;
        self.next_packet_id += 1;

        debug!("sending disconnect to {:?}", self.peer_addr);
        let header = self.new_header(PacketKind::Disconnect, packet_id);
        self.send_packet(&header, &[])
    }

    pub fn on_acks(&mut self, acks: &[PacketId], now: Instant) {
        for ack in acks {
            let Some(packet) = self.in_flight.remove(ack) else {
                trace!("ack for packet {} which is not in flight - ignoring", ack);
                continue;
            };

            // a retransmitted packet's ack is ambiguous, so it is not used for estimating RTT
            if packet.num_retransmissions == 0 {
                self.on_rtt_sample(now.saturating_duration_since(packet.first_sent));
            }

            for msg in &packet.messages {
                msg.mark_acknowledged();
                self.remove_from_index(msg);
            }
        }
    }

    /// Retransmits all unacknowledged packets whose timeout expired. Fails if a packet exhausted
    ///  its retransmissions, or if sending fails.
    pub fn retransmit_due(&mut self, now: Instant, pending_acks: &mut PendingAcks) -> anyhow::Result<()> {
        let due: Vec<PacketId> = self.in_flight.iter()
            .filter(|(_, p)| p.retransmit_at <= now)
            .map(|(&id, _)| id)
            .collect();

        for packet_id in due {
            let Some(packet) = self.in_flight.get(&packet_id) else {
                continue;
            };
            if packet.num_retransmissions >= self.config.max_retransmissions {
                bail!("packet {} to {:?} still unacknowledged after {} retransmissions", packet_id, self.peer_addr, packet.num_retransmissions);
            }

            let Some(mut packet) = self.in_flight.remove(&packet_id) else {
                continue;
            };

            packet.messages.retain(|m| !m.is_obsolete());
            if packet.messages.is_empty() && packet.ordered_seq.is_none() {
                debug!("all messages in packet {} to {:?} are obsolete - not retransmitting", packet_id, self.peer_addr);
                continue;
            }

            let body_len: usize = packet.messages.iter().map(|m| record_len(m)).sum();
            let mut header = self.new_header(PacketKind::Data, packet_id);
            header.reliable = true;
            header.ordered_seq = packet.ordered_seq;
            header.acks = pending_acks.take(self.num_acks_that_fit(body_len));

            debug!("retransmitting packet {} to {:?} ({} messages)", packet_id, self.peer_addr, packet.messages.len());
            if let Err(e) = self.send_packet(&header, &packet.messages) {
                self.in_flight.insert(packet_id, packet);
                return Err(e.into());
            }
            self.num_packets_retransmitted += 1;

            packet.num_retransmissions += 1;
            packet.retransmit_timeout = min(packet.retransmit_timeout * 2, self.config.max_retransmit_timeout);
            packet.retransmit_at = now + packet.retransmit_timeout;
            self.in_flight.insert(packet_id, packet);
        }
        Ok(())
    }

    fn num_acks_that_fit(&self, body_len: usize) -> usize {
        let mut result = self.config.max_acks_per_packet;
        while result > 0 && PacketHeader::serialized_len_for(true, result) + body_len > self.config.payload_size_inside_udp {
            result -= 1;
        }
        result
    }

    /// Discards everything that is queued or in flight, e.g. when the connection ends
    pub fn abandon(&mut self) {
        for msg in self.outbound.drain(..) {
            msg.mark_obsolete();
        }
        for (_, packet) in std::mem::take(&mut self.in_flight) {
            for msg in packet.messages {
                msg.mark_obsolete();
            }
        }
        self.content_index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageFlags, MessageStatus};
    use crate::receive_stream::{decode_records, ReceivedRecord};
    use crate::send_socket::MockSendSocket;
    use bytes::Bytes;
    use rstest::rstest;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const PEER: EndPoint = EndPoint::new([1, 2, 3, 4], 9);

    const R: MessageFlags = MessageFlags::RELIABLE;
    const U: MessageFlags = MessageFlags::empty();
    const RO: MessageFlags = MessageFlags::RELIABLE.union(MessageFlags::IN_ORDER);

    type Sent = Arc<Mutex<Vec<Vec<u8>>>>;

    fn config() -> RudpConfig {
        let mut config = RudpConfig::default_ipv4();
        config.initial_retransmit_timeout = Duration::from_millis(100);
        config.min_retransmit_timeout = Duration::from_millis(10);
        config.max_retransmit_timeout = Duration::from_millis(300);
        config.max_retransmissions = 3;
        config
    }

    fn capturing_stream(config: RudpConfig) -> (SendStream, Sent) {
        let sent: Sent = Default::default();
        let captured = sent.clone();

        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet()
            .returning(move |to, buf| {
                assert_eq!(to, PEER);
                captured.lock().unwrap().push(buf.to_vec());
                Ok(())
            });

        (SendStream::new(Arc::new(config), PEER, Arc::new(send_socket)), sent)
    }

    /// A stream whose socket starts failing once `broken` is set
    fn breakable_stream(config: RudpConfig) -> (SendStream, Arc<AtomicBool>) {
        let broken = Arc::new(AtomicBool::new(false));
        let is_broken = broken.clone();

        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet()
            .returning(move |_, _| {
                if is_broken.load(Ordering::Acquire) {
                    Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
                }
                else {
                    Ok(())
                }
            });

        (SendStream::new(Arc::new(config), PEER, Arc::new(send_socket)), broken)
    }

    fn decode(raw: &[u8]) -> (PacketHeader, Vec<ReceivedRecord>) {
        assert!(PacketHeader::is_checksum_valid(raw));
        let mut body = Bytes::copy_from_slice(raw);
        let header = PacketHeader::deser(&mut body).unwrap();
        (header, decode_records(body).unwrap())
    }

    fn payloads(records: &[ReceivedRecord]) -> Vec<&[u8]> {
        records.iter().map(|r| r.payload.as_ref()).collect()
    }

    fn msg(message_id: MessageId, content_id: ContentId, flags: MessageFlags, payload: &[u8]) -> Handle<NetworkMessage> {
        Handle::new(NetworkMessage::new(message_id, content_id, flags, Bytes::copy_from_slice(payload)))
    }

    #[test]
    fn test_flush_packs_messages_into_one_packet() {
        let (mut stream, sent) = capturing_stream(config());
        let mut acks = PendingAcks::default();
        acks.add(PacketId::from_raw(17), Instant::now(), Duration::ZERO);

        let m1 = msg(1, 0, U, b"a");
        let m2 = msg(2, 0, RO, b"bb");
        stream.enqueue(m1.clone());
        stream.enqueue(m2.clone());
        stream.flush(Instant::now(), &mut acks).unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (header, records) = decode(&sent[0]);
        assert_eq!(header.packet_id, PacketId::FIRST);
        assert!(header.reliable);
        assert_eq!(header.ordered_seq, Some(1));
        assert_eq!(header.acks, vec![PacketId::from_raw(17)]);
        assert_eq!(payloads(&records), vec![b"a".as_ref(), b"bb".as_ref()]);
        assert_eq!(records[1].header.flags, RO);

        assert!(acks.is_empty());
        assert_eq!(m1.status(), MessageStatus::Sent);
        assert_eq!(m2.status(), MessageStatus::Sent);
        assert_eq!(stream.num_in_flight(), 1);
        assert_eq!(stream.num_packets_sent(), 1);
    }

    #[test]
    fn test_unreliable_packet_not_in_flight() {
        let (mut stream, sent) = capturing_stream(config());
        stream.enqueue(msg(1, 0, U, b"a"));
        stream.flush(Instant::now(), &mut PendingAcks::default()).unwrap();

        let (header, _) = decode(&sent.lock().unwrap()[0]);
        assert!(!header.reliable);
        assert_eq!(header.ordered_seq, None);
        assert_eq!(stream.num_in_flight(), 0);
        assert!(stream.next_retransmit().is_none());
    }

    #[test]
    fn test_flush_splits_at_packet_size() {
        let (mut stream, sent) = capturing_stream(config());
        let payload = vec![7u8; 600];
        for id in 0..5 {
            stream.enqueue(msg(id, 0, R, &payload));
        }
        stream.flush(Instant::now(), &mut PendingAcks::default()).unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        let ids: Vec<Vec<MessageId>> = sent.iter()
            .map(|raw| decode(raw).1.iter().map(|r| r.header.message_id).collect())
            .collect();
        assert_eq!(ids, vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert!(sent.iter().all(|raw| raw.len() <= 1472));

        let packet_ids: Vec<PacketId> = sent.iter().map(|raw| decode(raw).0.packet_id).collect();
        assert_eq!(packet_ids, vec![PacketId::from_raw(1), PacketId::from_raw(2), PacketId::from_raw(3)]);
    }

    #[test]
    fn test_ordered_seq_only_for_reliable_in_order() {
        let (mut stream, sent) = capturing_stream(config());
        let now = Instant::now();
        let mut acks = PendingAcks::default();

        stream.enqueue(msg(1, 0, RO, b"1"));
        stream.flush(now, &mut acks).unwrap();
        stream.enqueue(msg(2, 0, R, b"2"));
        stream.flush(now, &mut acks).unwrap();
        stream.enqueue(msg(3, 0, RO, b"3"));
        stream.flush(now, &mut acks).unwrap();

        let seqs: Vec<Option<u64>> = sent.lock().unwrap().iter().map(|raw| decode(raw).0.ordered_seq).collect();
        assert_eq!(seqs, vec![Some(1), None, Some(2)]);
    }

    #[test]
    fn test_content_id_replaces_queued_message() {
        let (mut stream, sent) = capturing_stream(config());
        let first = msg(4, 9, R, b"old");
        let other = msg(5, 9, R, b"other message id");
        let second = msg(4, 9, R, b"new");
        stream.enqueue(first.clone());
        stream.enqueue(other.clone());
        stream.enqueue(second.clone());
        stream.flush(Instant::now(), &mut PendingAcks::default()).unwrap();

        let (_, records) = decode(&sent.lock().unwrap()[0]);
        assert_eq!(payloads(&records), vec![b"new".as_ref(), b"other message id".as_ref()]);
        assert!(first.is_obsolete());
        assert_eq!(second.status(), MessageStatus::Sent);
        assert_eq!(other.status(), MessageStatus::Sent);
    }

    #[test]
    fn test_content_id_zero_never_replaces() {
        let (mut stream, sent) = capturing_stream(config());
        stream.enqueue(msg(4, 0, R, b"a"));
        stream.enqueue(msg(4, 0, R, b"b"));
        stream.flush(Instant::now(), &mut PendingAcks::default()).unwrap();

        let (_, records) = decode(&sent.lock().unwrap()[0]);
        assert_eq!(payloads(&records), vec![b"a".as_ref(), b"b".as_ref()]);
    }

    #[test]
    fn test_superseded_in_flight_message_is_not_retransmitted() {
        let (mut stream, sent) = capturing_stream(config());
        let now = Instant::now();
        let mut acks = PendingAcks::default();

        let first = msg(4, 9, R, b"old");
        stream.enqueue(first.clone());
        stream.flush(now, &mut acks).unwrap();

        let second = msg(4, 9, R, b"new");
        stream.enqueue(second.clone());
        assert!(first.is_obsolete());
        stream.flush(now, &mut acks).unwrap();
        assert_eq!(stream.num_in_flight(), 2);

        stream.retransmit_due(now + Duration::from_millis(100), &mut acks).unwrap();

        let sent = sent.lock().unwrap();
        // packet 1 is dropped, packet 2 is retransmitted
        assert_eq!(sent.len(), 3);
        let (header, records) = decode(&sent[2]);
        assert_eq!(header.packet_id, PacketId::from_raw(2));
        assert_eq!(payloads(&records), vec![b"new".as_ref()]);
        assert_eq!(stream.num_in_flight(), 1);
        assert_eq!(stream.num_packets_retransmitted(), 1);
    }

    #[test]
    fn test_obsolete_ordered_packet_is_retransmitted_empty() {
        let (mut stream, sent) = capturing_stream(config());
        let now = Instant::now();
        let mut acks = PendingAcks::default();

        stream.enqueue(msg(4, 9, RO, b"old"));
        stream.flush(now, &mut acks).unwrap();
        stream.enqueue(msg(4, 9, RO, b"new"));

        stream.retransmit_due(now + Duration::from_millis(100), &mut acks).unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        let (header, records) = decode(&sent[1]);
        assert_eq!(header.packet_id, PacketId::FIRST);
        assert_eq!(header.ordered_seq, Some(1));
        assert!(header.reliable);
        assert!(records.is_empty());
    }

    #[test]
    fn test_ack_completes_packet() {
        let (mut stream, _sent) = capturing_stream(config());
        let now = Instant::now();
        let m = msg(4, 9, R, b"x");
        stream.enqueue(m.clone());
        stream.flush(now, &mut PendingAcks::default()).unwrap();

        stream.on_acks(&[PacketId::from_raw(99), PacketId::FIRST], now + Duration::from_millis(40));
        assert_eq!(m.status(), MessageStatus::Acknowledged);
        assert_eq!(stream.num_in_flight(), 0);
        assert_eq!(stream.round_trip_time(), Some(Duration::from_millis(40)));
        assert!(stream.content_index.is_empty());

        // the content id is free again: a new message is queued rather than replacing anything
        let m2 = msg(4, 9, R, b"y");
        stream.enqueue(m2.clone());
        assert_eq!(m.status(), MessageStatus::Acknowledged);
        assert!(stream.has_queued_messages());
    }

    #[test]
    fn test_rtt_drives_retransmit_timeout() {
        let (mut stream, _sent) = capturing_stream(config());
        let now = Instant::now();
        assert_eq!(stream.retransmit_timeout(), Duration::from_millis(100));

        stream.on_rtt_sample(Duration::from_millis(40));
        assert_eq!(stream.retransmit_timeout(), Duration::from_millis(80));
        stream.on_rtt_sample(Duration::from_millis(120));
        assert_eq!(stream.round_trip_time(), Some(Duration::from_millis(50)));

        stream.on_rtt_sample(Duration::from_secs(10));
        assert_eq!(stream.retransmit_timeout(), Duration::from_millis(300));
        stream.smoothed_rtt = Some(Duration::from_millis(1));
        assert_eq!(stream.retransmit_timeout(), Duration::from_millis(10));

        stream.enqueue(msg(1, 0, R, b"x"));
        stream.flush(now, &mut PendingAcks::default()).unwrap();
        assert_eq!(stream.next_retransmit(), Some(now + Duration::from_millis(10)));
    }

    #[test]
    fn test_retransmission_backoff_and_karn() {
        let (mut stream, sent) = capturing_stream(config());
        let now = Instant::now();
        let mut acks = PendingAcks::default();

        stream.enqueue(msg(1, 0, R, b"x"));
        stream.flush(now, &mut acks).unwrap();
        assert_eq!(stream.next_retransmit(), Some(now + Duration::from_millis(100)));

        stream.retransmit_due(now + Duration::from_millis(99), &mut acks).unwrap();
        assert_eq!(sent.lock().unwrap().len(), 1);

        let t1 = now + Duration::from_millis(100);
        stream.retransmit_due(t1, &mut acks).unwrap();
        assert_eq!(stream.next_retransmit(), Some(t1 + Duration::from_millis(200)));

        let t2 = t1 + Duration::from_millis(200);
        stream.retransmit_due(t2, &mut acks).unwrap();
        assert_eq!(stream.next_retransmit(), Some(t2 + Duration::from_millis(300)));
        assert_eq!(sent.lock().unwrap().len(), 3);

        stream.on_acks(&[PacketId::FIRST], t2 + Duration::from_millis(5));
        assert_eq!(stream.round_trip_time(), None);
        assert_eq!(stream.num_in_flight(), 0);
    }

    #[test]
    fn test_retransmissions_exhausted() {
        let (mut stream, _sent) = capturing_stream(config());
        let mut now = Instant::now();
        let mut acks = PendingAcks::default();

        stream.enqueue(msg(1, 0, R, b"x"));
        stream.flush(now, &mut acks).unwrap();
        for _ in 0..3 {
            now += Duration::from_secs(1);
            stream.retransmit_due(now, &mut acks).unwrap();
        }
        now += Duration::from_secs(1);
        assert!(stream.retransmit_due(now, &mut acks).is_err());
    }

    #[test]
    fn test_exhausted_packet_stays_in_flight_until_abandoned() {
        let (mut stream, _sent) = capturing_stream(config());
        let mut now = Instant::now();
        let mut acks = PendingAcks::default();

        let m = msg(1, 0, R, b"x");
        stream.enqueue(m.clone());
        stream.flush(now, &mut acks).unwrap();
        for _ in 0..3 {
            now += Duration::from_secs(1);
            stream.retransmit_due(now, &mut acks).unwrap();
        }
        now += Duration::from_secs(1);
        assert!(stream.retransmit_due(now, &mut acks).is_err());
        assert_eq!(stream.num_in_flight(), 1);
        assert!(!m.is_obsolete());

        stream.abandon();
        assert!(m.is_obsolete());
        assert_eq!(stream.num_in_flight(), 0);
    }

    #[test]
    fn test_failed_retransmission_stays_in_flight_until_abandoned() {
        let (mut stream, broken) = breakable_stream(config());
        let now = Instant::now();
        let mut acks = PendingAcks::default();

        let m = msg(1, 0, R, b"x");
        stream.enqueue(m.clone());
        stream.flush(now, &mut acks).unwrap();

        broken.store(true, Ordering::Release);
        assert!(stream.retransmit_due(now + Duration::from_secs(1), &mut acks).is_err());
        assert_eq!(stream.num_in_flight(), 1);
        assert_eq!(stream.num_packets_retransmitted(), 0);

        stream.abandon();
        assert!(m.is_obsolete());
    }

    #[rstest]
    #[case::single(vec![(1, R)])]
    #[case::mixed(vec![(1, U), (2, RO), (3, R)])]
    fn test_failed_flush_keeps_messages_queued(#[case] messages: Vec<(MessageId, MessageFlags)>) {
        let (mut stream, broken) = breakable_stream(config());
        broken.store(true, Ordering::Release);

        let handles: Vec<Handle<NetworkMessage>> = messages.iter()
            .map(|&(id, flags)| msg(id, 0, flags, b"payload"))
            .collect();
        for h in &handles {
            stream.enqueue(h.clone());
        }
        assert!(stream.flush(Instant::now(), &mut PendingAcks::default()).is_err());
        assert!(stream.has_queued_messages());
        assert_eq!(stream.num_in_flight(), 0);
        assert!(handles.iter().all(|h| h.status() == MessageStatus::Queued));

        let queued: Vec<MessageId> = stream.outbound.iter().map(|m| m.message_id()).collect();
        let expected: Vec<MessageId> = messages.iter().map(|&(id, _)| id).collect();
        assert_eq!(queued, expected);

        stream.abandon();
        assert!(handles.iter().all(|h| h.is_obsolete()));
    }

    #[test]
    fn test_retransmission_piggybacks_acks() {
        let (mut stream, sent) = capturing_stream(config());
        let now = Instant::now();
        let mut acks = PendingAcks::default();

        stream.enqueue(msg(1, 0, R, b"x"));
        stream.flush(now, &mut acks).unwrap();

        acks.add(PacketId::from_raw(5), now, Duration::ZERO);
        stream.retransmit_due(now + Duration::from_secs(1), &mut acks).unwrap();

        let (header, _) = decode(&sent.lock().unwrap()[1]);
        assert_eq!(header.packet_id, PacketId::FIRST);
        assert_eq!(header.acks, vec![PacketId::from_raw(5)]);
        assert!(acks.is_empty());
    }

    #[test]
    fn test_send_acks() {
        let mut config = config();
        config.max_acks_per_packet = 2;
        let (mut stream, sent) = capturing_stream(config);
        let now = Instant::now();

        let mut acks = PendingAcks::default();
        for id in [3, 4, 8] {
            acks.add(PacketId::from_raw(id), now, Duration::ZERO);
        }
        stream.send_acks(&mut acks).unwrap();

        let sent = sent.lock().unwrap();
        let headers: Vec<PacketHeader> = sent.iter().map(|raw| decode(raw).0).collect();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].acks, vec![PacketId::from_raw(3), PacketId::from_raw(4)]);
        assert_eq!(headers[1].acks, vec![PacketId::from_raw(8)]);
        assert!(headers.iter().all(|h| !h.reliable && h.kind == PacketKind::Data));
        assert_eq!(stream.num_in_flight(), 0);
    }

    #[test]
    fn test_send_error_is_propagated() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet()
            .returning(|_, _| Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")));
        let mut stream = SendStream::new(Arc::new(config()), PEER, Arc::new(send_socket));

        stream.enqueue(msg(1, 0, R, b"x"));
        assert!(stream.flush(Instant::now(), &mut PendingAcks::default()).is_err());
        assert!(stream.send_disconnect().is_err());
    }

    #[test]
    fn test_packets_carry_both_sessions() {
        let (mut stream, sent) = capturing_stream(config());
        assert_ne!(stream.session_id(), NO_SESSION);
        assert_eq!(stream.peer_session_id(), NO_SESSION);

        stream.enqueue(msg(1, 0, R, b"x"));
        stream.flush(Instant::now(), &mut PendingAcks::default()).unwrap();
        stream.set_peer_session_id(77);
        stream.send_disconnect().unwrap();

        let sent = sent.lock().unwrap();
        let (data, _) = decode(&sent[0]);
        assert_eq!(data.session_id, stream.session_id());
        assert_eq!(data.peer_session_id, NO_SESSION);
        let (disconnect, _) = decode(&sent[1]);
        assert_eq!(disconnect.session_id, stream.session_id());
        assert_eq!(disconnect.peer_session_id, 77);
    }

    #[test]
    fn test_sessions_differ_between_streams() {
        let (a, _) = capturing_stream(config());
        let (b, _) = capturing_stream(config());
        assert_ne!(a.session_id(), b.session_id());
    }

    #[test]
    fn test_restart_starts_numbering_over() {
        let (mut stream, sent) = capturing_stream(config());
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        let own_session = stream.session_id();

        let old = msg(1, 0, RO, b"old");
        stream.enqueue(old.clone());
        stream.enqueue(msg(2, 0, RO, b"old too"));
        stream.flush(now, &mut acks).unwrap();
        let queued = msg(3, 0, R, b"queued");
        stream.enqueue(queued.clone());

        stream.restart(99);
        assert!(old.is_obsolete());
        assert!(queued.is_obsolete());
        assert_eq!(stream.num_in_flight(), 0);
        assert!(!stream.has_queued_messages());

        stream.enqueue(msg(4, 0, RO, b"new"));
        stream.flush(now, &mut acks).unwrap();

        let (header, records) = decode(sent.lock().unwrap().last().unwrap());
        assert_eq!(header.packet_id, PacketId::FIRST);
        assert_eq!(header.ordered_seq, Some(1));
        assert_eq!(header.session_id, own_session);
        assert_eq!(header.peer_session_id, 99);
        assert_eq!(payloads(&records), vec![b"new".as_ref()]);
    }

    #[test]
    fn test_abandon() {
        let (mut stream, sent) = capturing_stream(config());
        let in_flight = msg(1, 3, R, b"x");
        stream.enqueue(in_flight.clone());
        stream.flush(Instant::now(), &mut PendingAcks::default()).unwrap();
        let queued = msg(2, 0, U, b"y");
        stream.enqueue(queued.clone());

        stream.abandon();
        assert!(in_flight.is_obsolete());
        assert!(queued.is_obsolete());
        assert_eq!(stream.num_in_flight(), 0);
        assert!(!stream.has_queued_messages());

        stream.send_disconnect().unwrap();
        let (header, records) = decode(&sent.lock().unwrap()[1]);
        assert_eq!(header.kind, PacketKind::Disconnect);
        assert_eq!(header.packet_id, PacketId::from_raw(2));
        assert!(records.is_empty());
    }
}
