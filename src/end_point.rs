use std::fmt::{Debug, Display, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// EndPoint is the (ip, port) source or destination of a datagram. It is a plain value used as a
///  map key for connections, so its ordering is total and deterministic: lexicographic over the
///  four address octets, then the port.
///
/// NB: This is IP V4 only - the address is stored as four octets, and converting from an
///      IP V6 socket address yields the zero address (keeping the port)
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EndPoint {
    pub ip: [u8; 4],
    pub port: u16,
}

impl EndPoint {
    pub const fn new(ip: [u8; 4], port: u16) -> EndPoint {
        EndPoint { ip, port }
    }

    /// Clears address and port to zero
    pub fn reset(&mut self) {
        *self = EndPoint::default();
    }

    pub fn from_sock_addr(addr: &SocketAddrV4) -> EndPoint {
        EndPoint {
            ip: addr.ip().octets(),
            port: addr.port(),
        }
    }

    pub fn to_sock_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.ip), self.port)
    }

    /// "a.b.c.d" without the port
    pub fn ip_to_string(&self) -> String {
        format!("{}.{}.{}.{}", self.ip[0], self.ip[1], self.ip[2], self.ip[3])
    }
}

impl From<SocketAddrV4> for EndPoint {
    fn from(value: SocketAddrV4) -> Self {
        EndPoint::from_sock_addr(&value)
    }
}

impl From<SocketAddr> for EndPoint {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(addr) => EndPoint::from_sock_addr(&addr),
            SocketAddr::V6(addr) => EndPoint::new([0; 4], addr.port()),
        }
    }
}

impl From<EndPoint> for SocketAddr {
    fn from(value: EndPoint) -> Self {
        SocketAddr::V4(value.to_sock_addr())
    }
}

impl Display for EndPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip_to_string(), self.port)
    }
}

impl Debug for EndPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self)
    }
}
