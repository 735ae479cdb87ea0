//! Sector arithmetic.
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, BitAnd, Div, Mul, Not, Rem, Sub, SubAssign};

/// Size of one sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// The highest representable sector.
///
/// Used as "none" / "complete" marker for checkpoints and reshape positions.
pub const MAX_SECTOR: Sectors = Sectors(!0);

/// A number of 512 byte sectors.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sectors(pub u64);

impl Sectors {
    /// Creates a new `Sectors` instance from a byte count.
    ///
    /// # Panics
    ///
    /// Panics in debug mode if `bytes` is not a multiple of `SECTOR_SIZE`.
    pub fn from_bytes(bytes: u64) -> Self {
        debug_assert!(bytes % SECTOR_SIZE as u64 == 0);
        Sectors(bytes / SECTOR_SIZE as u64)
    }

    /// Converts a count of 1 KiB blocks.
    pub fn from_kib(kib: u64) -> Self {
        Sectors(kib.saturating_mul(2))
    }

    /// Returns the number of sectors as a number of bytes.
    pub fn to_bytes(self) -> u64 {
        self.0 * SECTOR_SIZE as u64
    }

    /// Returns the number of whole 1 KiB blocks.
    pub fn as_kib(self) -> u64 {
        self.0 / 2
    }

    /// Returns the raw sector count.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` for the `MAX_SECTOR` marker.
    pub fn is_max(self) -> bool {
        self == MAX_SECTOR
    }

    /// Subtraction clamped at zero.
    pub fn saturating_sub(self, rhs: Self) -> Self {
        Sectors(self.0.saturating_sub(rhs.0))
    }

    /// Subtraction returning `None` on underflow.
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Sectors)
    }

    /// Rounds down to a multiple of `align` sectors (`align` is a power of two).
    pub fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two());
        Sectors(self.0 & !(align - 1))
    }
}

impl fmt::Display for Sectors {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Sectors {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Sectors(self.0 + rhs.0)
    }
}

impl AddAssign for Sectors {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Add<u64> for Sectors {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Sectors(self.0 + rhs)
    }
}

impl Sub for Sectors {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Sectors(self.0 - rhs.0)
    }
}

impl SubAssign for Sectors {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Sub<u64> for Sectors {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output {
        Sectors(self.0 - rhs)
    }
}

impl Mul<u64> for Sectors {
    type Output = Self;

    fn mul(self, rhs: u64) -> Self::Output {
        Sectors(self.0 * rhs)
    }
}

impl Div<u64> for Sectors {
    type Output = Self;

    fn div(self, rhs: u64) -> Self::Output {
        Sectors(self.0 / rhs)
    }
}

impl Rem<u64> for Sectors {
    type Output = u64;

    fn rem(self, rhs: u64) -> u64 {
        self.0 % rhs
    }
}

impl BitAnd<u64> for Sectors {
    type Output = Self;

    fn bitand(self, rhs: u64) -> Self::Output {
        Sectors(self.0 & rhs)
    }
}

impl Not for Sectors {
    type Output = Self;

    fn not(self) -> Self::Output {
        Sectors(!self.0)
    }
}

impl Sum for Sectors {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Sectors(iter.map(|s| s.0).sum())
    }
}

impl From<u64> for Sectors {
    fn from(n: u64) -> Self {
        Sectors(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[quickcheck]
    fn align_down_is_aligned(n: u64, shift: u8) -> bool {
        let align = 1u64 << (shift % 16);
        let aligned = Sectors(n).align_down(align);
        aligned.0 % align == 0 && aligned <= Sectors(n) && Sectors(n).0 - aligned.0 < align
    }

    #[test]
    fn kib_conversion() {
        assert_eq!(Sectors::from_kib(4), Sectors(8));
        assert_eq!(Sectors(9).as_kib(), 4);
        assert_eq!(Sectors::from_kib(u64::max_value()), MAX_SECTOR);
    }
}
