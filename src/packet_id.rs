use std::fmt::{Debug, Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

/// Identifies a datagram within a connection. Ids are assigned by the sender, starting at
///  [PacketId::FIRST] and incremented for every datagram sent - a retransmitted datagram keeps its
///  original id, which is what allows the receiver to recognize duplicates.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PacketId(u64);

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl PacketId {
    pub const ZERO: PacketId = PacketId(0);
    pub const FIRST: PacketId = PacketId(1);

    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> PacketId {
        *self + 1
    }
}

impl Add<u64> for PacketId {
    type Output = PacketId;

    fn add(self, rhs: u64) -> Self::Output {
        PacketId(
            self.0.checked_add(rhs)
                .expect("packet ids are 64 bit and should never overflow")
        )
    }
}

impl AddAssign<u64> for PacketId {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl Sub<u64> for PacketId {
    type Output = Option<PacketId>;

    fn sub(self, rhs: u64) -> Self::Output {
        self.0.checked_sub(rhs).map(PacketId)
    }
}
