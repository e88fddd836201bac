use crate::config::RudpConfig;
use crate::end_point::EndPoint;
use crate::event::WaitableEvent;
use crate::message::{MessageFlags, MessageId, NetworkMessage};
use crate::message_handler::MessageHandler;
use crate::packet_header::{PacketHeader, PacketKind, NO_SESSION};
use crate::receive_stream::{decode_records, Delivery, ReceiveStream};
use crate::ref_counted::{Handle, RefCount, RefCounted};
use crate::send_socket::SendSocket;
use crate::send_stream::SendStream;
use anyhow::bail;
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Open,
    /// closed by either side, or by shutting down the network
    Closed,
    /// a reliable packet exhausted its retransmissions, or the socket reported an error
    Failed,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_retransmitted: u64,
    pub duplicates_discarded: u64,
    /// reliable packets waiting for their acknowledgement
    pub packets_in_flight: usize,
}

enum ConnectionEvent {
    Message(Delivery),
    StateChanged(ConnectionState),
}

/// Late packets from a peer's earlier sessions are recognized for this many restarts
const MAX_RETIRED_SESSIONS: usize = 8;

struct ConnectionInner {
    state: ConnectionState,
    send_stream: SendStream,
    receive_stream: ReceiveStream,
    retired_peer_sessions: VecDeque<u64>,
}

impl ConnectionInner {
    fn end(&mut self, state: ConnectionState) {
        self.state = state;
        self.send_stream.abandon();
    }

    /// Checks a packet's sessions against the ones this connection knows, starting over if the
    ///  peer started a new session. Returns false if the packet belongs to an earlier session
    ///  of either side and must be discarded.
    fn check_sessions(&mut self, header: &PacketHeader, peer_addr: EndPoint) -> bool {
        if header.peer_session_id != NO_SESSION && header.peer_session_id != self.send_stream.session_id() {
            debug!("packet {} from {:?} is addressed to an earlier connection - discarding it", header.packet_id, peer_addr);
            return false;
        }

        let known = self.send_stream.peer_session_id();
        if header.session_id == NO_SESSION || header.session_id == known {
            return true;
        }
        if self.retired_peer_sessions.contains(&header.session_id) {
            debug!("packet {} from {:?} belongs to the peer's earlier session - discarding it", header.packet_id, peer_addr);
            return false;
        }

        if known == NO_SESSION {
            trace!("peer {:?} has session {:x}", peer_addr, header.session_id);
            self.send_stream.set_peer_session_id(header.session_id);
            return true;
        }

        info!("peer {:?} started a new session - discarding all state of the previous one", peer_addr);
        if self.retired_peer_sessions.len() == MAX_RETIRED_SESSIONS {
            self.retired_peer_sessions.pop_front();
        }
        self.retired_peer_sessions.push_back(known);
        self.receive_stream.reset();
        self.send_stream.restart(header.session_id);
        true
    }
}

/// The association between the local socket and one remote peer. Connections are created by
///  the [Network](crate::network::Network) and shared with the application through
///  [Handle]s.
///
/// The application calls [MessageConnection::send] and [MessageConnection::close] from any
///  thread, while the network's worker thread does all the packet I/O.
pub struct MessageConnection {
    ref_count: RefCount,
    peer_addr: EndPoint,
    config: Arc<RudpConfig>,
    handler: Arc<dyn MessageHandler>,
    /// wakes up the worker thread when there are messages to send
    wake: WaitableEvent,
    inner: Mutex<ConnectionInner>,
}

impl RefCounted for MessageConnection {
    fn ref_count(&self) -> &RefCount {
        &self.ref_count
    }
}

impl Debug for MessageConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CONN{{{:?}}}", self.peer_addr)
    }
}

impl MessageConnection {
    pub(crate) fn new(
        peer_addr: EndPoint,
        config: Arc<RudpConfig>,
        send_socket: Arc<dyn SendSocket>,
        handler: Arc<dyn MessageHandler>,
        wake: WaitableEvent,
    ) -> MessageConnection {
        MessageConnection {
            ref_count: RefCount::new(),
            peer_addr,
            config: config.clone(),
            handler,
            wake,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Open,
                send_stream: SendStream::new(config.clone(), peer_addr, send_socket),
                receive_stream: ReceiveStream::new(config),
                retired_peer_sessions: VecDeque::new(),
            }),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, ConnectionInner> {
        // all state changes are completed before anything can panic, so the data stays consistent
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn peer_addr(&self) -> EndPoint {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_inner().state
    }

    pub fn stats(&self) -> ConnectionStats {
        let inner = self.lock_inner();
        ConnectionStats {
            packets_sent: inner.send_stream.num_packets_sent(),
            packets_received: inner.receive_stream.num_packets_received(),
            packets_retransmitted: inner.send_stream.num_packets_retransmitted(),
            duplicates_discarded: inner.receive_stream.num_duplicates_discarded(),
            packets_in_flight: inner.send_stream.num_in_flight(),
        }
    }

    /// The smoothed round trip time, once an acknowledgement was received
    pub fn round_trip_time(&self) -> Option<Duration> {
        self.lock_inner().send_stream.round_trip_time()
    }

    /// Queues a message for sending. The returned handle can be used to observe the message's
    ///  progress.
    ///
    /// Fails if the payload does not fit into a single packet or the connection is no longer open.
    pub fn send(&self, message_id: MessageId, payload: &[u8], flags: MessageFlags) -> anyhow::Result<Handle<NetworkMessage>> {
        let max_len = self.config.max_message_payload_len();
        if payload.len() > max_len {
            bail!("message {} has {} bytes of payload, but the maximum is {}", message_id, payload.len(), max_len);
        }

        let content_id = self.handler.compute_content_id(message_id, payload);
        let msg = Handle::new(NetworkMessage::new(message_id, content_id, flags, Bytes::copy_from_slice(payload)));

        let mut inner = self.lock_inner();
        if inner.state != ConnectionState::Open {
            bail!("connection to {:?} is {:?}", self.peer_addr, inner.state);
        }
        trace!("queueing {:?} for {:?}", msg, self.peer_addr);
        inner.send_stream.enqueue(msg.clone());

        // NB: the wake event is valid as long as the connection is open, and this is checked under the lock
        self.wake.set();
        Ok(msg)
    }

    /// Closes the connection, discarding all messages that are not acknowledged yet, and notifies
    ///  the peer. Closing a connection that is not open has no effect.
    pub fn close(&self) -> anyhow::Result<()> {
        let mut inner = self.lock_inner();
        if inner.state != ConnectionState::Open {
            return Ok(());
        }
        debug!("closing connection to {:?}", self.peer_addr);
        inner.end(ConnectionState::Closed);
        self.wake.set();

        inner.send_stream.send_disconnect()?;
        Ok(())
    }

    /// The next point in time at which [MessageConnection::process] has work to do, if any
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let inner = self.lock_inner();
        if inner.state != ConnectionState::Open {
            return None;
        }
        if inner.send_stream.has_queued_messages() {
            return Some(Instant::now());
        }
        match (inner.send_stream.next_retransmit(), inner.receive_stream.ack_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Handles a datagram from this connection's peer. The header was decoded and the checksum
    ///  verified by the caller.
    pub(crate) fn on_packet(this: &Handle<MessageConnection>, header: PacketHeader, body: Bytes, now: Instant) {
        let records = match decode_records(body) {
            Ok(records) => records,
            Err(e) => {
                debug!("discarding malformed packet {} from {:?}: {}", header.packet_id, this.peer_addr, e);
                return;
            }
        };

        let mut events = Vec::new();
        {
            let mut inner = this.lock_inner();
            if inner.state != ConnectionState::Open {
                trace!("connection to {:?} is {:?} - discarding packet {}", this.peer_addr, inner.state, header.packet_id);
                return;
            }
            if !inner.check_sessions(&header, this.peer_addr) {
                return;
            }

            match header.kind {
                PacketKind::Disconnect => {
                    debug!("peer {:?} closed the connection", this.peer_addr);
                    inner.end(ConnectionState::Closed);
                    events.push(ConnectionEvent::StateChanged(ConnectionState::Closed));
                }
                PacketKind::Data => {
                    inner.send_stream.on_acks(&header.acks, now);
                    let deliveries = inner.receive_stream.on_packet(&header, records, now);
                    events.extend(deliveries.into_iter().map(ConnectionEvent::Message));
                }
            }
        }
        Self::dispatch(this, events);
    }

    /// Does all time or queue driven work: retransmissions, sending queued messages, and
    ///  sending acks that are due.
    pub(crate) fn process(this: &Handle<MessageConnection>, now: Instant) {
        let mut events = Vec::new();
        {
            let mut inner = this.lock_inner();
            if inner.state != ConnectionState::Open {
                return;
            }

            let ConnectionInner { send_stream, receive_stream, .. } = &mut *inner;
            if let Err(e) = Self::do_process(&this.config, send_stream, receive_stream, now) {
                warn!("connection to {:?} failed: {}", this.peer_addr, e);
                inner.end(ConnectionState::Failed);
                // the peer closes its side too, so it does not wait for packets that will never come
                if let Err(e) = inner.send_stream.send_disconnect() {
                    debug!("error notifying {:?} of the failure: {}", this.peer_addr, e);
                }
                events.push(ConnectionEvent::StateChanged(ConnectionState::Failed));
            }
        }
        Self::dispatch(this, events);
    }

    fn do_process(config: &RudpConfig, send_stream: &mut SendStream, receive_stream: &mut ReceiveStream, now: Instant) -> anyhow::Result<()> {
        send_stream.retransmit_due(now, receive_stream.pending_acks())?;
        send_stream.flush(now, receive_stream.pending_acks())?;

        if receive_stream.pending_acks().is_due(now, config.max_acks_per_packet) {
            send_stream.send_acks(receive_stream.pending_acks())?;
        }
        Ok(())
    }

    /// Ends the connection as part of shutting down the network, notifying the peer on a best
    ///  effort basis
    pub(crate) fn shut_down(&self) {
        if let Err(e) = self.close() {
            debug!("error notifying {:?} of shutdown: {}", self.peer_addr, e);
        }
    }

    fn dispatch(this: &Handle<MessageConnection>, events: Vec<ConnectionEvent>) {
        for event in events {
            match event {
                ConnectionEvent::Message(delivery) => {
                    this.handler.handle_message(this, delivery.packet_id, delivery.message_id, &delivery.data);
                }
                ConnectionEvent::StateChanged(state) => {
                    this.handler.on_connection_state_changed(this, state);
                }
            }
        }
    }
}
