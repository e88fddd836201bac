use crate::end_point::EndPoint;
#[cfg(test)] use mockall::automock;
use std::io;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use tracing::trace;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
pub trait SendSocket: Send + Sync + 'static {
    fn do_send_packet(&self, to: EndPoint, packet_buf: &[u8]) -> io::Result<()>;

    fn local_addr(&self) -> EndPoint;
}

impl SendSocket for Arc<UdpSocket> {
    fn do_send_packet(&self, to: EndPoint, packet_buf: &[u8]) -> io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);

        match self.send_to(packet_buf, SocketAddr::from(to)) {
            Ok(_) => Ok(()),
            // a full socket buffer is equivalent to a packet dropped on the network
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                trace!("UDP socket send buffer full - dropping packet to {:?}", to);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> EndPoint {
        self.as_ref().local_addr()
            .map(EndPoint::from)
            .unwrap_or_default()
    }
}
