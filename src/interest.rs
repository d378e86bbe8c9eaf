use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Readiness bits, OR-combinable (spec §6). `PERSIST` is only meaningful as
/// an argument to [`crate::readiness::ReadinessEvent::on_persist`]; passing
/// it to [`crate::readiness::ReadinessEvent::on`] is an [`crate::Error`] with
/// kind [`crate::error::ErrorKind::InvalidArgument`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Interest(u8);

const READ: u8 = 0b0_0001;
const WRITE: u8 = 0b0_0010;
const TIMEOUT: u8 = 0b0_0100;
const CLOSED: u8 = 0b0_1000;
const PERSIST: u8 = 0b1_0000;

impl Interest {
    pub const READ: Interest = Interest(READ);
    pub const WRITE: Interest = Interest(WRITE);
    pub const TIMEOUT: Interest = Interest(TIMEOUT);
    pub const CLOSED: Interest = Interest(CLOSED);
    pub const PERSIST: Interest = Interest(PERSIST);
    pub const NONE: Interest = Interest(0);

    pub const fn is_readable(self) -> bool {
        self.0 & READ != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & WRITE != 0
    }

    pub const fn is_timeout(self) -> bool {
        self.0 & TIMEOUT != 0
    }

    pub const fn is_closed(self) -> bool {
        self.0 & CLOSED != 0
    }

    pub const fn is_persist(self) -> bool {
        self.0 & PERSIST != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    /// Only the bits relevant to registering interest with the selector
    /// (READ/WRITE); TIMEOUT and CLOSED are synthesized by the reactor and
    /// PERSIST never reaches the selector.
    pub(crate) fn selector_mask(self) -> Interest {
        Interest(self.0 & (READ | WRITE))
    }
}

impl BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut put = |f: &mut fmt::Formatter<'_>, name: &str| -> fmt::Result {
            if !first {
                write!(f, " | ")?;
            }
            first = false;
            f.write_str(name)
        };
        if self.is_readable() {
            put(f, "READ")?;
        }
        if self.is_writable() {
            put(f, "WRITE")?;
        }
        if self.is_timeout() {
            put(f, "TIMEOUT")?;
        }
        if self.is_closed() {
            put(f, "CLOSED")?;
        }
        if self.is_persist() {
            put(f, "PERSIST")?;
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_or_combines() {
        let both = Interest::READ | Interest::WRITE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!both.is_closed());
    }

    #[test]
    fn selector_mask_drops_synthetic_bits() {
        let mask = (Interest::READ | Interest::TIMEOUT | Interest::PERSIST).selector_mask();
        assert!(mask.is_readable());
        assert!(!mask.is_timeout());
        assert!(!mask.is_persist());
    }
}
