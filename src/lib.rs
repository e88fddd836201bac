//! A message transport over UDP for real-time interactive applications (games, simulations) that
//!  want UDP's latency characteristics, but TCP-like delivery guarantees for *some* of their
//!  messages.
//!
//! ## Design goals
//!
//! * The protocol is peer-to-peer without a dedicated server vs. client
//!   * each node has a single UDP socket that handles all 'connections'
//!   * there is no handshake: a connection is the state a node keeps for a peer, created
//!      explicitly or on the first datagram from that peer
//!   * IP V4 only
//! * The abstraction is sending / receiving *messages*, i.e. defined-length chunks of data
//!    that fit into a single packet. The application tags each message with a message id.
//! * Delivery guarantees are chosen per message:
//!   * *unreliable*: sent once, delivered on arrival
//!   * *sequenced* (unreliable, in order): sent once, discarded on arrival if a more recent
//!      sequenced message was delivered already
//!   * *reliable*: retransmitted until acknowledged, delivered on arrival
//!   * *reliable, in order*: retransmitted until acknowledged, delivered in send order
//! * Duplicate packets are never delivered twice
//! * A newer message can replace an older one with the same 'content id' while the older one
//!    is still queued or waiting for its acknowledgement, so e.g. a position update that was
//!    superseded is never retransmitted. Content ids are computed by the application and opaque
//!    to the transport.
//! * Small messages are combined into a single packet
//! * There is a checksum per packet
//! * All I/O happens on a single worker thread per socket that blocks on socket readiness and
//!    application signals at the same time (see [event_set::EventSet])
//!
//! ## Packet structure
//!
//! All numbers in network byte order (BE):
//! ```ascii
//! 0:  checksum (u32): CRC-32C of the rest of the packet
//! 4:  protocol version (u8) = 1
//! 5:  flags (8 bits):
//!     * bit 0-1: kind of packet:
//!       * 00 data
//!       * 01 disconnect
//!     * bit 2: reliable - the packet must be acknowledged
//!     * bit 3: ordered sequence number is present
//!     * 4-7: unused, should be 0
//! 6:  session id (u64): random and non-zero, identifies the sending connection object
//! 14: peer session id (u64): the receiver's session id as far as the sender knows it, 0 if it
//!      did not hear from the receiver yet
//! 22: packet id (u64): assigned by the sender, starting at 1. Retransmitted packets keep their id.
//! *:  ordered sequence number (u64): contiguous numbering of those packets that contain
//!      reliable in-order messages. Present only if flag bit 3 is set.
//! *:  number of acks (varint usize)
//! *:  (repeated) acknowledged packet id (u64)
//! *:  messages until the end of the packet
//! ```
//!
//! Message header, followed by the message's payload:
//!
//! ```ascii
//! 0: message id (u32)
//! 4: flags (8 bits):
//!     * bit 0: reliable
//!     * bit 1: in order
//!     * 2-7: unused, must be 0
//! 5: payload length (u16)
//! ```
//!
//! ## Acknowledgement and retransmission
//!
//! Received reliable packets are acknowledged by their id. Acks are piggybacked on the next
//!  outgoing data packet, or sent in a packet of their own after a configurable delay.
//!
//! Reliable packets are retransmitted after a timeout that is derived from the smoothed round
//!  trip time and doubles with every retransmission. A retransmitted packet contains only those
//!  reliable messages that were not superseded in the meantime. If a connection exceeds the
//!  maximum number of retransmissions for a packet, it fails.
//!
//! The receiver remembers packet ids in a window below the highest id it received. Packets below
//!  that window are discarded without an acknowledgement, so a reliable packet that arrives too
//!  late makes its sender fail rather than being lost silently.
//!
//! ## Sessions
//!
//! Packet ids start at 1 for every connection object, so a peer that reconnects (or restarts)
//!  on the same address would have its packets discarded as duplicates. Every packet therefore
//!  carries the sender's session id, and echoes the receiver's. When a connection sees a new
//!  session id from its peer, it discards everything it knows about the previous one and
//!  starts over. Packets from a retired session, or addressed to an earlier local connection,
//!  are discarded.
//!
//! ## Related:
//! * ENet, RakNet
//!   * same reliability / ordering categories per message
//!   * ordering channels
//!   * fragmentation of big messages
//! * QUIC
//!   * connection based - initial handshake
//!   * enforces encryption (TLS 1.3)
//!   * stream multiplexing

pub mod config;
pub mod connection;
pub mod end_point;
pub mod event;
pub mod event_set;
pub mod logging;
pub mod message;
pub mod message_handler;
pub mod message_header;
pub mod network;
pub mod packet_header;
pub mod packet_id;
mod receive_stream;
pub mod ref_counted;
pub mod safe_converter;
pub mod send_socket;
mod send_stream;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
