//! Readiness interest flags.

use std::fmt;

/// Interest flags indicating which I/O readiness events to monitor.
///
/// Only four values exist: [`Interest::NONE`], [`Interest::READABLE`],
/// [`Interest::WRITABLE`], and [`Interest::BOTH`]. The same type describes
/// both what a handler watches and what a poll pass delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
    /// No interest; registering a handler with this value unregisters it.
    pub const NONE: Interest = Self(0b00);
    /// Interest in readable events.
    pub const READABLE: Interest = Self(0b01);
    /// Interest in writable events.
    pub const WRITABLE: Interest = Self(0b10);
    /// Interest in both readable and writable events.
    pub const BOTH: Interest = Self(0b11);

    /// Returns true if readable interest is set.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if writable interest is set.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Returns true if no interest is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Combines interests.
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: Interest) -> Self {
        Self(self.0 | other.0)
    }

    /// Removes interest.
    #[must_use]
    pub const fn remove(self, other: Interest) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns the interest common to both sets.
    #[must_use]
    pub const fn intersection(self, other: Interest) -> Self {
        Self(self.0 & other.0)
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => write!(f, "RW"),
            (true, false) => write!(f, "R"),
            (false, true) => write!(f, "W"),
            (false, false) => write!(f, "-"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sets_bits() {
        assert_eq!(Interest::NONE.add(Interest::READABLE), Interest::READABLE);
        assert_eq!(Interest::READABLE.add(Interest::WRITABLE), Interest::BOTH);
        assert_eq!(Interest::WRITABLE.add(Interest::WRITABLE), Interest::WRITABLE);
    }

    #[test]
    fn remove_clears_bits() {
        assert_eq!(Interest::BOTH.remove(Interest::WRITABLE), Interest::READABLE);
        assert_eq!(Interest::READABLE.remove(Interest::WRITABLE), Interest::READABLE);
        assert_eq!(Interest::WRITABLE.remove(Interest::WRITABLE), Interest::NONE);
    }

    #[test]
    fn intersection_masks() {
        assert_eq!(Interest::BOTH.intersection(Interest::READABLE), Interest::READABLE);
        assert_eq!(Interest::READABLE.intersection(Interest::WRITABLE), Interest::NONE);
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(format!("{}", Interest::READABLE), "R");
        assert_eq!(format!("{}", Interest::WRITABLE), "W");
        assert_eq!(format!("{}", Interest::BOTH), "RW");
        assert_eq!(format!("{}", Interest::NONE), "-");
    }
}
