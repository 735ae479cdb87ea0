//! This module provides the `BlockDevice` abstraction for member storage.
//!
//! Member devices are addressed in 512 byte sectors. Implementations must
//! be usable from several threads because superblock writes of one update
//! cycle are issued in parallel.

use crate::units::Sectors;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

mod errors;
pub use self::errors::*;

mod file;
pub use self::file::{DevPathOpener, File};

#[cfg(test)]
pub mod test;

/// Kernel style device number.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DevId {
    /// Major number.
    pub major: u32,
    /// Minor number.
    pub minor: u32,
}

impl DevId {
    /// Creates a new `DevId`.
    pub fn new(major: u32, minor: u32) -> Self {
        DevId { major, minor }
    }
}

impl fmt::Display for DevId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

impl FromStr for DevId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let mut parts = s.splitn(2, ':');
        let parse = |p: Option<&str>| -> Result<u32> {
            p.and_then(|p| p.parse().ok())
                .ok_or_else(|| ErrorKind::InvalidDevId(s.to_owned()).into())
        };
        let major = parse(parts.next())?;
        let minor = parse(parts.next())?;
        // Linux dev_t carries 12 bit majors and 20 bit minors.
        if major >= 1 << 12 || minor >= 1 << 20 {
            bail!(ErrorKind::InvalidDevId(s.to_owned()));
        }
        Ok(DevId { major, minor })
    }
}

/// I/O statistics of a block device, counted in sectors.
#[derive(Debug, Default, Clone, Copy)]
pub struct Statistics {
    /// The total number of sectors read.
    pub read: Sectors,
    /// The total number of sectors written.
    pub written: Sectors,
    /// The total number of sectors of failed reads.
    pub failed_reads: Sectors,
    /// The total number of sectors of failed writes.
    pub failed_writes: Sectors,
    /// Number of completed write requests.
    pub write_requests: u64,
}

#[derive(Default, Debug)]
pub(crate) struct AtomicStatistics {
    pub(crate) read: AtomicU64,
    pub(crate) written: AtomicU64,
    pub(crate) failed_reads: AtomicU64,
    pub(crate) failed_writes: AtomicU64,
    pub(crate) write_requests: AtomicU64,
}

impl AtomicStatistics {
    pub(crate) fn as_stats(&self) -> Statistics {
        Statistics {
            read: Sectors(self.read.load(Ordering::Relaxed)),
            written: Sectors(self.written.load(Ordering::Relaxed)),
            failed_reads: Sectors(self.failed_reads.load(Ordering::Relaxed)),
            failed_writes: Sectors(self.failed_writes.load(Ordering::Relaxed)),
            write_requests: self.write_requests.load(Ordering::Relaxed),
        }
    }
}

/// Sector addressed storage contributed to an array.
pub trait BlockDevice: Send + Sync {
    /// Returns the name of this device, used in log messages.
    fn id(&self) -> &str;

    /// Returns the device number.
    fn dev_id(&self) -> DevId;

    /// Returns the capacity in sectors.
    fn size(&self) -> Sectors;

    /// Returns the logical block size in bytes.
    fn logical_block_size(&self) -> usize {
        crate::units::SECTOR_SIZE
    }

    /// Returns `true` if the device refuses writes.
    fn read_only(&self) -> bool {
        false
    }

    /// Reads `buf.len()` bytes starting at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: Sectors) -> Result<()>;

    /// Writes `data` starting at `offset`.
    fn write_at(&self, data: &[u8], offset: Sectors) -> Result<()>;

    /// Flushes volatile caches.
    fn flush(&self) -> Result<()>;

    /// Returns the I/O statistics of this device.
    fn stats(&self) -> Statistics;
}

impl fmt::Debug for dyn BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.id(), self.dev_id())
    }
}

/// Resolves device numbers to opened block devices.
///
/// Used by the `new_dev` attribute which names devices by `major:minor`.
pub trait DeviceOpener: Send + Sync {
    /// Opens the device with the given number.
    fn open(&self, dev: DevId) -> Result<Box<dyn BlockDevice>>;
}
