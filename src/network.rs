use crate::config::RudpConfig;
use crate::connection::{ConnectionState, MessageConnection};
use crate::end_point::EndPoint;
use crate::event::{EventWaitType, OwnedEvent, WaitableEvent};
use crate::event_set::EventSet;
use crate::message_handler::MessageHandler;
use crate::packet_header::{PacketHeader, PacketKind};
use crate::ref_counted::Handle;
use crate::safe_converter::PrecheckedCast;
use crate::send_socket::SendSocket;
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;

/// big enough for any UDP datagram
const RECEIVE_BUFFER_SIZE: usize = 65536;

struct NetworkInner {
    config: Arc<RudpConfig>,
    socket: Arc<UdpSocket>,
    handler: Arc<dyn MessageHandler>,
    /// wakes up the worker thread - closed when the last reference to the network goes away,
    ///  i.e. after all connections were closed
    wake: OwnedEvent,
    connections: Mutex<FxHashMap<EndPoint, Handle<MessageConnection>>>,
    is_shut_down: AtomicBool,
}

/// A Network owns a UDP socket and the worker thread that does all I/O on it. It keeps one
///  [MessageConnection] per remote peer.
///
/// Connections are created either explicitly through [Network::connect], or (if
///  [RudpConfig::accept_incoming] is set) when the first datagram from an unknown peer arrives.
///  There is no handshake - a connection is just the state kept for a peer.
pub struct Network {
    inner: Arc<NetworkInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Network {
    /// Creates and binds the socket. The network does not receive or send anything before
    ///  [Network::start] is called.
    pub fn bind(config: RudpConfig, handler: Arc<dyn MessageHandler>) -> anyhow::Result<Network> {
        config.validate()?;

        let socket = create_socket(&config)?;
        info!("bound UDP socket to {:?}", socket.local_addr()?);

        Ok(Network {
            inner: Arc::new(NetworkInner {
                config: Arc::new(config),
                socket: Arc::new(socket),
                handler,
                wake: OwnedEvent::new(EventWaitType::Signal)?,
                connections: Default::default(),
                is_shut_down: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Spawns the worker thread
    pub fn start(&self) -> anyhow::Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            bail!("network is already started");
        }
        if self.inner.is_shut_down.load(Ordering::Acquire) {
            bail!("network is shut down");
        }

        let inner = self.inner.clone();
        *worker = Some(thread::Builder::new()
            .name("rudp-worker".to_string())
            .spawn(move || inner.run_worker())?
        );
        Ok(())
    }

    pub fn local_addr(&self) -> EndPoint {
        SendSocket::local_addr(&self.inner.socket)
    }

    /// Returns the connection to a peer, creating it if necessary
    pub fn connect(&self, peer_addr: EndPoint) -> anyhow::Result<Handle<MessageConnection>> {
        let mut connections = self.inner.lock_connections();
        if self.inner.is_shut_down.load(Ordering::Acquire) {
            bail!("network is shut down");
        }

        if let Some(existing) = connections.get(&peer_addr) {
            if existing.state() == ConnectionState::Open {
                return Ok(existing.clone());
            }
        }

        debug!("connecting to {:?}", peer_addr);
        let conn = self.inner.new_connection(peer_addr);
        connections.insert(peer_addr, conn.clone());
        Ok(conn)
    }

    /// A snapshot of all connections
    pub fn connections(&self) -> Vec<Handle<MessageConnection>> {
        self.inner.connections_snapshot()
    }

    /// Stops the worker thread and closes all connections. Calling this more than once has no
    ///  effect.
    pub fn shutdown(&self) {
        if self.inner.is_shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down network on {:?}", self.local_addr());

        self.inner.wake.set();
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }

        let connections: Vec<Handle<MessageConnection>> = self.inner.lock_connections()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            conn.shut_down();
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn create_socket(config: &RudpConfig) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if let Some(buffer_size) = config.socket_buffer_size {
        socket.set_send_buffer_size(buffer_size)?;
        socket.set_recv_buffer_size(buffer_size)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&config.self_addr.into())?;
    Ok(socket.into())
}

impl NetworkInner {
    fn lock_connections(&self) -> MutexGuard<'_, FxHashMap<EndPoint, Handle<MessageConnection>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connections_snapshot(&self) -> Vec<Handle<MessageConnection>> {
        self.lock_connections().values().cloned().collect()
    }

    fn new_connection(&self, peer_addr: EndPoint) -> Handle<MessageConnection> {
        Handle::new(MessageConnection::new(
            peer_addr,
            self.config.clone(),
            Arc::new(self.socket.clone()),
            self.handler.clone(),
            self.wake.alias(),
        ))
    }

    fn run_worker(&self) {
        info!("starting worker thread");

        let mut events = EventSet::new();
        let wake_index = events.add(self.wake.alias());
        let socket_index = events.add(WaitableEvent::from_socket(self.socket.as_ref(), EventWaitType::Read));

        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        while !self.is_shut_down.load(Ordering::Acquire) {
            let timeout = self.wait_timeout(Instant::now());
            let fired = events.wait(timeout);

            if fired.contains(&wake_index) {
                self.wake.reset();
            }
            if fired.contains(&socket_index) {
                self.receive_all(&mut buf);
            }
            self.process_connections(Instant::now());
        }

        info!("worker thread finished");
    }

    /// Milliseconds until the earliest connection deadline, rounded up and capped at the
    ///  configured maximum wait
    fn wait_timeout(&self, now: Instant) -> u64 {
        let earliest = self.connections_snapshot().iter()
            .filter_map(|conn| conn.next_deadline())
            .min();

        let duration = match earliest {
            Some(deadline) => deadline.saturating_duration_since(now).min(self.config.max_wait),
            None => self.config.max_wait,
        };
        millis_rounded_up(duration)
    }

    fn receive_all(&self, buf: &mut [u8]) {
        loop {
            match self.socket.recv_from(buf) {
                Ok((num_read, from)) => self.on_datagram(EndPoint::from(from), &buf[..num_read]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("socket error: {}", e);
                    break;
                }
            }
        }
    }

    fn on_datagram(&self, from: EndPoint, raw: &[u8]) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "packet_received", ?correlation_id);
        let _entered = span.enter();

        trace!("received {} bytes from {:?}", raw.len(), from);

        if !PacketHeader::is_checksum_valid(raw) {
            debug!("invalid checksum in packet from {:?} - dropping", from);
            return;
        }

        let mut body = Bytes::copy_from_slice(raw);
        let header = match PacketHeader::deser(&mut body) {
            Ok(header) => header,
            Err(e) => {
                debug!("received packet with unparsable header from {:?}: {} - dropping", from, e);
                return;
            }
        };
        trace!("packet header: {:?}", header);

        let Some(conn) = self.connection_for_packet(from, &header) else {
            return;
        };
        MessageConnection::on_packet(&conn, header, body, Instant::now());
    }

    fn connection_for_packet(&self, from: EndPoint, header: &PacketHeader) -> Option<Handle<MessageConnection>> {
        let conn = {
            let mut connections = self.lock_connections();
            if let Some(conn) = connections.get(&from) {
                return Some(conn.clone());
            }

            if header.kind != PacketKind::Data {
                trace!("{:?} from unknown peer {:?} - dropping", header.kind, from);
                return None;
            }
            if !self.config.accept_incoming {
                debug!("packet from unknown peer {:?} - dropping", from);
                return None;
            }

            info!("new inbound connection from {:?}", from);
            let conn = self.new_connection(from);
            connections.insert(from, conn.clone());
            conn
        };

        self.handler.on_connection_state_changed(&conn, ConnectionState::Open);
        Some(conn)
    }

    /// Processes all connections and removes those that are no longer open
    fn process_connections(&self, now: Instant) {
        for conn in self.connections_snapshot() {
            MessageConnection::process(&conn, now);
        }

        self.lock_connections().retain(|peer_addr, conn| {
            let state = conn.state();
            if state != ConnectionState::Open {
                debug!("removing connection to {:?} ({:?})", peer_addr, state);
            }
            state == ConnectionState::Open
        });
    }
}

fn millis_rounded_up(duration: Duration) -> u64 {
    duration.as_micros()
        .div_ceil(1000)
        .prechecked_cast()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageFlags, MessageId};
    use crate::message_handler::MockMessageHandler;
    use crate::packet_id::PacketId;
    use bytes::{BufMut, BytesMut};
    use rstest::rstest;
    use std::net::SocketAddr;
    use std::sync::mpsc;

    fn loopback_config() -> RudpConfig {
        let mut config = RudpConfig::default_ipv4();
        config.self_addr = "127.0.0.1:0".parse().unwrap();
        config.max_wait = Duration::from_millis(20);
        config
    }

    fn forwarding_handler(tx: mpsc::Sender<(EndPoint, MessageId, Vec<u8>)>) -> MockMessageHandler {
        let tx = Mutex::new(tx);
        let mut handler = MockMessageHandler::new();
        handler.expect_handle_message()
            .returning(move |source, _, message_id, data| {
                tx.lock().unwrap().send((source.peer_addr(), message_id, data.to_vec())).unwrap();
            });
        handler.expect_compute_content_id().returning(|_, _| 0);
        handler.expect_on_connection_state_changed().returning(|_, _| {});
        handler
    }

    #[rstest]
    #[case(Duration::ZERO, 0)]
    #[case(Duration::from_micros(1), 1)]
    #[case(Duration::from_millis(5), 5)]
    #[case(Duration::from_micros(5001), 6)]
    fn test_millis_rounded_up(#[case] duration: Duration, #[case] expected: u64) {
        assert_eq!(millis_rounded_up(duration), expected);
    }

    #[test]
    fn test_bind_rejects_invalid_config() {
        let mut config = loopback_config();
        config.payload_size_inside_udp = 10;
        assert!(Network::bind(config, Arc::new(MockMessageHandler::new())).is_err());
    }

    #[test]
    fn test_start_twice_and_after_shutdown() {
        let network = Network::bind(loopback_config(), Arc::new(MockMessageHandler::new())).unwrap();
        network.start().unwrap();
        assert!(network.start().is_err());
        network.shutdown();
        network.shutdown();
        assert!(network.start().is_err());
        assert!(network.connect(EndPoint::new([127, 0, 0, 1], 9)).is_err());
    }

    #[test]
    fn test_connect_returns_existing_connection() {
        let network = Network::bind(loopback_config(), Arc::new(MockMessageHandler::new())).unwrap();
        let peer = EndPoint::new([127, 0, 0, 1], 9);

        let a = network.connect(peer).unwrap();
        let b = network.connect(peer).unwrap();
        assert_eq!(a, b);
        assert_eq!(network.connections().len(), 1);

        a.close().unwrap();
        let c = network.connect(peer).unwrap();
        assert_ne!(a, c);
        assert_eq!(c.state(), ConnectionState::Open);

        network.shutdown();
        assert_eq!(c.state(), ConnectionState::Closed);
        assert!(network.connections().is_empty());
    }

    #[test]
    fn test_send_and_receive() {
        let (tx, rx) = mpsc::channel();
        let receiver = Network::bind(loopback_config(), Arc::new(forwarding_handler(tx))).unwrap();
        receiver.start().unwrap();

        let (unused_tx, _unused_rx) = mpsc::channel();
        let sender = Network::bind(loopback_config(), Arc::new(forwarding_handler(unused_tx))).unwrap();
        sender.start().unwrap();

        let conn = sender.connect(receiver.local_addr()).unwrap();
        conn.send(3, b"hello", MessageFlags::RELIABLE).unwrap();

        let (from, message_id, data) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(from, sender.local_addr());
        assert_eq!(message_id, 3);
        assert_eq!(data, b"hello");

        sender.shutdown();
        receiver.shutdown();
    }

    #[test]
    fn test_garbage_and_unknown_peers_are_dropped() {
        let (tx, rx) = mpsc::channel();
        let mut config = loopback_config();
        config.accept_incoming = false;
        let network = Network::bind(config, Arc::new(forwarding_handler(tx))).unwrap();
        network.start().unwrap();

        let raw_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let to = SocketAddr::from(network.local_addr());

        // valid packet, but from an unknown peer
        let mut header = PacketHeader::new(PacketKind::Data, PacketId::FIRST);
        header.reliable = true;
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        buf.put_slice(&[0, 0, 0, 1, 1, 0, 1, 42]);
        PacketHeader::init_checksum(&mut buf);
        raw_socket.send_to(&buf, to).unwrap();

        // garbage
        raw_socket.send_to(b"garbage", to).unwrap();
        raw_socket.send_to(&[], to).unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(network.connections().is_empty());

        // once the peer is known, the same packet is accepted
        network.connect(EndPoint::from(raw_socket.local_addr().unwrap())).unwrap();
        raw_socket.send_to(&buf, to).unwrap();
        let (_, message_id, data) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(message_id, 1);
        assert_eq!(data, vec![42]);
    }
}
