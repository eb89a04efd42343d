use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// An address in the patched system's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Addr(pub u64);

impl Addr {
    pub const NULL: Addr = Addr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether `self` lies in `[start, start + len)`.
    pub fn within(self, start: Addr, len: u64) -> bool {
        self.0 >= start.0 && self.0 - start.0 < len
    }

    pub fn offset(self, delta: i64) -> Addr {
        Addr(self.0.wrapping_add(delta as u64))
    }
}

impl Add<u64> for Addr {
    type Output = Addr;

    fn add(self, rhs: u64) -> Addr {
        Addr(self.0.wrapping_add(rhs))
    }
}

impl Sub<Addr> for Addr {
    type Output = i64;

    fn sub(self, rhs: Addr) -> i64 {
        self.0.wrapping_sub(rhs.0) as i64
    }
}

impl From<u64> for Addr {
    fn from(v: u64) -> Self {
        Addr(v)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::Addr;

    #[test]
    fn within_is_half_open() {
        let base = Addr(0x1000);
        assert!(Addr(0x1000).within(base, 5));
        assert!(Addr(0x1004).within(base, 5));
        assert!(!Addr(0x1005).within(base, 5));
        assert!(!Addr(0xfff).within(base, 5));
        assert!(!Addr(0x1000).within(base, 0));
    }

    #[test]
    fn offsets() {
        assert_eq!(Addr(0x2000).offset(-0x10), Addr(0x1ff0));
        assert_eq!(Addr(0x2000) - Addr(0x1000), 0x1000);
        assert_eq!(format!("{}", Addr(0xdead)), "0xdead");
    }
}
