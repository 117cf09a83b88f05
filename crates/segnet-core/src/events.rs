//! Semantic readiness events delivered by the reactor.

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Bitmask of READ / WRITE / CONNECT / CLOSE / ACCEPT.
///
/// The same type doubles as an interest mask on registration and as the
/// fired set handed to a dispatcher. CLOSE wins over everything else when a
/// handler decides what to do.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Events(u8);

impl Events {
    pub const NONE: Events = Events(0);
    pub const READ: Events = Events(0x01);
    pub const WRITE: Events = Events(0x02);
    pub const CONNECT: Events = Events(0x04);
    pub const CLOSE: Events = Events(0x08);
    pub const ACCEPT: Events = Events(0x10);

    const ALL_BITS: u8 = 0x1F;

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Unknown bits are dropped.
    #[inline]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Events(bits & Self::ALL_BITS)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: Events) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub const fn intersects(self, other: Events) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: Events) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Events) {
        self.0 &= !other.0;
    }

    /// Interest that needs the descriptor in the poller's read set.
    #[inline]
    pub const fn wants_read(self) -> bool {
        self.intersects(Events(Self::READ.0 | Self::ACCEPT.0))
    }

    /// Interest that needs the descriptor in the poller's write set.
    #[inline]
    pub const fn wants_write(self) -> bool {
        self.intersects(Events(Self::WRITE.0 | Self::CONNECT.0))
    }
}

impl BitOr for Events {
    type Output = Events;
    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Events {
    type Output = Events;
    fn bitand(self, rhs: Events) -> Events {
        Events(self.0 & rhs.0)
    }
}

impl Not for Events {
    type Output = Events;
    fn not(self) -> Events {
        Events(!self.0 & Self::ALL_BITS)
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let names = [
            (Events::READ, "READ"),
            (Events::WRITE, "WRITE"),
            (Events::CONNECT, "CONNECT"),
            (Events::CLOSE, "CLOSE"),
            (Events::ACCEPT, "ACCEPT"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_values() {
        assert_eq!(Events::READ.bits(), 0x01);
        assert_eq!(Events::WRITE.bits(), 0x02);
        assert_eq!(Events::CONNECT.bits(), 0x04);
        assert_eq!(Events::CLOSE.bits(), 0x08);
        assert_eq!(Events::ACCEPT.bits(), 0x10);
    }

    #[test]
    fn test_set_ops() {
        let mut ev = Events::READ | Events::WRITE;
        assert!(ev.contains(Events::READ));
        assert!(!ev.contains(Events::CLOSE));
        assert!(!ev.contains(Events::NONE));
        ev.remove(Events::READ);
        assert_eq!(ev, Events::WRITE);
        ev.insert(Events::CLOSE);
        assert_eq!(format!("{:?}", ev), "WRITE|CLOSE");
        assert_eq!(!Events::NONE, Events::from_bits_truncate(0xFF));
    }

    #[test]
    fn test_interest_sets() {
        assert!(Events::ACCEPT.wants_read());
        assert!(Events::CONNECT.wants_write());
        assert!(!Events::READ.wants_write());
        assert!(!Events::CLOSE.wants_read());
    }
}
