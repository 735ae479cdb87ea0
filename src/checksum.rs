//! This module provides the superblock checksum.
//!
//! Both superblock formats sum the image as little-endian 32 bit words into
//! a 64 bit accumulator and fold the carry back into 32 bits. A trailing
//! 16 bit half word (1.x role tables of odd length) is added as is.

use byteorder::{ByteOrder, LittleEndian};
use std::error::Error;
use std::fmt;
use std::iter::once;

/// Holds a state for building a new `Csum`.
pub trait State {
    /// The resulting checksum.
    type Checksum;

    /// Ingests the given data into the state.
    fn ingest(&mut self, data: &[u8]);

    /// Builds the actual checksum.
    fn finish(self) -> Self::Checksum;
}

/// A folded 32 bit superblock checksum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Csum(pub u32);

impl Csum {
    /// Computes the checksum of the given buffer.
    pub fn of(data: &[u8]) -> Self {
        Csum::of_buffer(once(data))
    }

    /// Computes the checksum of a buffer which consists of multiple slices.
    pub fn of_buffer<I: IntoIterator<Item = T>, T: AsRef<[u8]>>(data: I) -> Self {
        let mut state = WordSum::default();
        for x in data {
            state.ingest(x.as_ref());
        }
        state.finish()
    }

    /// Verifies the contents of the given buffer.
    pub fn verify(self, data: &[u8]) -> Result<(), ChecksumError> {
        if Csum::of(data) == self {
            Ok(())
        } else {
            Err(ChecksumError)
        }
    }

    /// The 16 bit fold used by some legacy 0.90 writers.
    pub fn fold16(self) -> Self {
        let mut c = self.0;
        c = (c & 0xffff) + (c >> 16);
        c = (c & 0xffff) + (c >> 16);
        Csum(c)
    }
}

/// Running word sum.
#[derive(Default)]
pub struct WordSum {
    sum: u64,
    pending: [u8; 4],
    pending_len: usize,
}

impl State for WordSum {
    type Checksum = Csum;

    fn ingest(&mut self, mut data: &[u8]) {
        if self.pending_len > 0 {
            let n = (4 - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + n].copy_from_slice(&data[..n]);
            self.pending_len += n;
            data = &data[n..];
            if self.pending_len < 4 {
                return;
            }
            self.sum += u64::from(LittleEndian::read_u32(&self.pending));
            self.pending_len = 0;
        }
        let mut words = data.chunks_exact(4);
        for w in &mut words {
            self.sum += u64::from(LittleEndian::read_u32(w));
        }
        let rest = words.remainder();
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    fn finish(self) -> Csum {
        let mut sum = self.sum;
        match self.pending_len {
            0 => {}
            2 => sum += u64::from(LittleEndian::read_u16(&self.pending[..2])),
            n => {
                let mut word = [0u8; 4];
                word[..n].copy_from_slice(&self.pending[..n]);
                sum += u64::from(LittleEndian::read_u32(&word));
            }
        }
        Csum(((sum & 0xffff_ffff) + (sum >> 32)) as u32)
    }
}

/// This is the error that will be returned when a `Csum` does not match.
#[derive(Debug)]
pub struct ChecksumError;

impl fmt::Display for ChecksumError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Failed to verify the integrity")
    }
}

impl Error for ChecksumError {
    fn description(&self) -> &str {
        "a checksum error occurred"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::test::generate_data;
    use crate::units::Sectors;

    #[quickcheck]
    fn split_ingest_matches_whole(seed: u8, len: u16, split: u16) -> bool {
        let data = generate_data(seed as usize, Sectors(0), len as usize % 2048);
        let split = split as usize % (data.len() + 1);
        Csum::of_buffer(vec![&data[..split], &data[split..]]) == Csum::of(&data)
    }

    #[test]
    fn carry_is_folded() {
        let data = [0xffu8; 8];
        // 2 * 0xffff_ffff = 0x1_ffff_fffe, folded: 0xffff_fffe + 1.
        assert_eq!(Csum::of(&data), Csum(0xffff_ffff));
    }

    #[test]
    fn trailing_half_word() {
        let data = [1, 0, 0, 0, 2, 0];
        assert_eq!(Csum::of(&data), Csum(3));
    }

    #[test]
    fn fold16() {
        assert_eq!(Csum(0x0001_ffff).fold16(), Csum(0x0001));
        assert_eq!(Csum(0x1234_0000).fold16(), Csum(0x1234));
    }
}
