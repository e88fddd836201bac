use crate::message_header::MessageHeader;
use crate::packet_header::PacketHeader;
use anyhow::bail;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// The largest UDP payload that IP V4 can carry
const MAX_UDP_PAYLOAD_IPV4: usize = 65507;

/// poll(2) takes its timeout as a C int in milliseconds
const MAX_WAIT_LIMIT: Duration = Duration::from_millis(i32::MAX as u64);

#[derive(Debug, Clone)]
pub struct RudpConfig {
    /// The local address the UDP socket is bound to. Port 0 lets the OS pick a free port, which is
    ///  then available through [Network::local_addr](crate::network::Network::local_addr).
    pub self_addr: SocketAddr,

    /// This is the payload size inside UDP packets that RUDP assumes. RUDP never relies on IP
    ///  fragmentation, so this payload size (and the implied packet size) must be supported by
    ///  all network connections between the peers.
    ///
    /// With full Ethernet frames and no optional IP headers, this payload is `1500 - 20 - 8 = 1472`
    ///  for IPV4. There may be surprising network hardware on (some of) the routes, and RUDP does
    ///  not attempt to guess or compensate for that - choosing this value too big causes packets
    ///  to be dropped, choosing it too small wastes bandwidth.
    pub payload_size_inside_udp: usize,

    /// Send and receive buffer size requested from the OS for the UDP socket, `None` for the
    ///  OS default
    pub socket_buffer_size: Option<usize>,

    /// Acknowledgements are piggybacked on outgoing data packets. If there is no outgoing traffic,
    ///  they are sent in a separate packet after this delay.
    pub ack_delay: Duration,
    pub max_acks_per_packet: usize,

    /// The retransmission timeout before there is a round trip time estimate
    pub initial_retransmit_timeout: Duration,
    pub min_retransmit_timeout: Duration,
    /// Upper bound for the exponential backoff of retransmissions
    pub max_retransmit_timeout: Duration,
    /// A connection fails if a packet is still unacknowledged after this many retransmissions
    pub max_retransmissions: u32,

    /// The number of packet ids (below the highest id received) for which the receiver remembers
    ///  whether they were received. Packets older than that are treated as duplicates.
    pub duplicate_window_size: u64,

    /// Upper bound for a single blocking wait of the worker thread
    pub max_wait: Duration,

    /// If `true`, a datagram from an unknown peer creates a new connection. Otherwise such
    ///  datagrams are discarded, and connections must be created explicitly.
    pub accept_incoming: bool,
}

impl RudpConfig {
    /// IP V4 with end-to-end full Ethernet MTU and without optional IP headers, binding to an
    ///  OS assigned port on all interfaces
    pub fn default_ipv4() -> RudpConfig {
        RudpConfig {
            self_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            payload_size_inside_udp: 1472,
            socket_buffer_size: None,
            ack_delay: Duration::from_millis(5),
            max_acks_per_packet: 32,
            initial_retransmit_timeout: Duration::from_millis(200),
            min_retransmit_timeout: Duration::from_millis(20),
            max_retransmit_timeout: Duration::from_secs(3),
            max_retransmissions: 10,
            duplicate_window_size: 4096,
            max_wait: Duration::from_millis(100),
            accept_incoming: true,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.self_addr.is_ipv4() {
            bail!("only IP V4 addresses are supported");
        }
        if self.payload_size_inside_udp < 100 {
            bail!("Payload size is too small");
        }
        if self.payload_size_inside_udp > MAX_UDP_PAYLOAD_IPV4 {
            bail!("Payload size {} exceeds the maximum UDP payload", self.payload_size_inside_udp);
        }
        if self.max_acks_per_packet == 0 {
            bail!("at least one ack must fit into a packet");
        }
        if self.max_message_payload_len() == 0 {
            bail!("{} acks per packet leave no room for messages in a packet with payload size {}", self.max_acks_per_packet, self.payload_size_inside_udp);
        }
        if self.min_retransmit_timeout.is_zero() {
            bail!("minimum retransmit timeout must be positive");
        }
        if self.min_retransmit_timeout > self.max_retransmit_timeout {
            bail!("minimum retransmit timeout {:?} is bigger than the maximum {:?}", self.min_retransmit_timeout, self.max_retransmit_timeout);
        }
        if self.initial_retransmit_timeout < self.min_retransmit_timeout || self.initial_retransmit_timeout > self.max_retransmit_timeout {
            bail!("initial retransmit timeout {:?} is outside the range [{:?}, {:?}]", self.initial_retransmit_timeout, self.min_retransmit_timeout, self.max_retransmit_timeout);
        }
        if self.duplicate_window_size == 0 {
            bail!("duplicate window must not be empty");
        }
        if self.max_wait.is_zero() {
            bail!("max wait must be positive");
        }
        if self.max_wait > MAX_WAIT_LIMIT {
            bail!("max wait {:?} exceeds the limit of {:?}", self.max_wait, MAX_WAIT_LIMIT);
        }

        Ok(())
    }

    /// The biggest message payload that is guaranteed to fit into a single packet, together with
    ///  an ordered sequence number and the maximum number of piggybacked acks
    pub fn max_message_payload_len(&self) -> usize {
        let overhead = PacketHeader::serialized_len_for(true, self.max_acks_per_packet) + MessageHeader::SERIALIZED_LEN;
        self.payload_size_inside_udp
            .saturating_sub(overhead)
            .min(u16::MAX as usize)
    }
}
