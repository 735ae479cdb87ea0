//! On-disk RAID superblocks.
//!
//! Two incompatible formats are supported: the legacy 0.90 format with a
//! fixed 27 entry descriptor table at the end of the device, and the
//! extensible 1.x format whose location depends on the minor version.
//!
//! For every format this module provides
//! - `parse`: validate and decode a raw image,
//! - `load_super`: locate, read and decode the superblock of a device and
//!   rank it against a reference,
//! - `validate`: apply a loaded superblock to the array,
//! - `sync`: generate a fresh image from array and device state,
//! - `rdev_size_change`: move the superblock for a new component size.

use crate::blockdev::BlockDevice;
use crate::device::{MemberDevice, SbState};
use crate::meta::{ArrayMeta, Metadata};
use crate::units::Sectors;

mod errors;
pub use self::errors::*;

pub mod v090;
pub mod v1;

pub use self::v090::Sb090;
pub use self::v1::Sb1;

/// A decoded superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Superblock {
    /// Version 0.90.
    V090(Box<Sb090>),
    /// Version 1.x.
    V1(Box<Sb1>),
}

impl Superblock {
    /// The event counter.
    pub fn events(&self) -> u64 {
        match *self {
            Superblock::V090(ref sb) => sb.events,
            Superblock::V1(ref sb) => sb.events,
        }
    }

    /// The array UUID.
    pub fn uuid(&self) -> [u8; 16] {
        match *self {
            Superblock::V090(ref sb) => sb.uuid(),
            Superblock::V1(ref sb) => sb.set_uuid,
        }
    }

    /// The RAID level.
    pub fn level(&self) -> i32 {
        match *self {
            Superblock::V090(ref sb) => sb.level,
            Superblock::V1(ref sb) => sb.level,
        }
    }

    /// The format of this superblock.
    pub fn format(&self) -> Format {
        match *self {
            Superblock::V090(_) => Format::V090,
            Superblock::V1(_) => Format::V1,
        }
    }
}

/// Result of ranking a superblock against a reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// Same array, not more recent than the reference.
    Older,
    /// Same array, strictly more recent than the reference.
    Newer,
    /// Belongs to a different array.
    Incompatible,
}

/// Ranks `candidate` against `reference`.
///
/// Both must describe the same array: equal UUIDs, and for 0.90 equal
/// generic constant words ignoring `nr_disks`, for 1.x equal level, layout
/// and chunk size. The candidate is newer iff its event counter is
/// strictly greater.
pub fn compare(candidate: &Superblock, reference: &Superblock) -> Freshness {
    let same_array = match (candidate, reference) {
        (Superblock::V090(c), Superblock::V090(r)) => v090::same_array(c, r),
        (Superblock::V1(c), Superblock::V1(r)) => v1::same_array(c, r),
        _ => false,
    };
    if !same_array {
        Freshness::Incompatible
    } else if candidate.events() > reference.events() {
        Freshness::Newer
    } else {
        Freshness::Older
    }
}

/// Array side context for `validate`.
#[derive(Debug, Copy, Clone, Default)]
pub struct ValidateMode {
    /// A personality is attached.
    pub running: bool,
    /// Recovery is frozen.
    pub frozen: bool,
}

/// Superblock format.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Format {
    /// Version 0.90.
    V090,
    /// Version 1.x.
    V1,
}

impl Format {
    /// Returns the format for a major version.
    pub fn for_major(major: u32) -> Option<Format> {
        match major {
            0 => Some(Format::V090),
            1 => Some(Format::V1),
            _ => None,
        }
    }

    /// Returns the format of persistent metadata.
    pub fn from_metadata(metadata: &Metadata) -> Result<(Format, u32)> {
        match *metadata {
            Metadata::Persistent { major, minor } => match Format::for_major(major) {
                Some(format) => Ok((format, minor)),
                None => bail!(ErrorKind::UnsupportedVersion(String::new(), major, minor)),
            },
            _ => bail!(ErrorKind::NoMetadata),
        }
    }

    /// Name of the format.
    pub fn name(self) -> &'static str {
        match self {
            Format::V090 => "0.90.0",
            Format::V1 => "md-1",
        }
    }

    /// Capacity of the descriptor table.
    pub fn max_disks(self) -> u32 {
        match self {
            Format::V090 => v090::MAX_DISKS,
            Format::V1 => v1::MAX_DEVS,
        }
    }

    /// Location of the superblock on a device of `dev_size` sectors.
    pub fn sb_offset(self, dev_size: Sectors, minor: u32) -> Option<Sectors> {
        match self {
            Format::V090 => v090::sb_offset(dev_size),
            Format::V1 => v1::sb_offset(dev_size, minor),
        }
    }

    /// Validates and decodes a raw superblock image.
    ///
    /// Fails with `InvalidMagic`, `UnsupportedVersion`, `ChecksumMismatch`,
    /// `SizeTooSmall` or `InvalidLayout`.
    pub fn parse(self, buf: &[u8], minor: u32, dev: &str) -> Result<Superblock> {
        match self {
            Format::V090 => v090::parse(buf, dev).map(|sb| Superblock::V090(Box::new(sb))),
            Format::V1 => v1::parse(buf, minor, dev).map(|sb| Superblock::V1(Box::new(sb))),
        }
    }

    /// Reads the superblock of `dev` and fills in the device record.
    ///
    /// With a `reference` the result tells whether `dev` is more recent.
    /// Without one, `Newer` is returned unless the device is a spare.
    pub fn load_super(
        self,
        dev: &mut MemberDevice,
        reference: Option<&Superblock>,
        minor: u32,
    ) -> Result<Freshness> {
        match self {
            Format::V090 => v090::load_super(dev, reference),
            Format::V1 => v1::load_super(dev, reference, minor),
        }
    }

    /// Applies the loaded superblock of `dev` to the array.
    ///
    /// The first device of an array (`raid_disks == 0`) establishes the
    /// array geometry.
    pub fn validate(self, meta: &mut ArrayMeta, dev: &mut MemberDevice, mode: ValidateMode) -> Result<()> {
        match self {
            Format::V090 => v090::validate(meta, dev, mode),
            Format::V1 => v1::validate(meta, dev, mode),
        }
    }

    /// Generates the superblock image for `disks[idx]`.
    ///
    /// The image is stored on the device and marked dirty.
    pub fn sync(self, meta: &mut ArrayMeta, in_sync: bool, disks: &mut [MemberDevice], idx: usize) {
        match self {
            Format::V090 => v090::sync(meta, in_sync, disks, idx),
            Format::V1 => v1::sync(meta, in_sync, disks, idx),
        }
    }

    /// Computes the usable size for a requested component size and writes
    /// the superblock to its new location.
    ///
    /// A request of zero asks for the largest possible size. The result is
    /// never smaller than `meta.dev_sectors`.
    pub fn rdev_size_change(self, meta: &ArrayMeta, dev: &mut MemberDevice, num_sectors: Sectors) -> Result<Sectors> {
        if num_sectors != Sectors(0) && num_sectors < meta.dev_sectors {
            bail!(ErrorKind::ResizeRefused(dev.name().to_owned()));
        }
        let sectors = match self {
            Format::V090 => v090::rdev_size_change(meta, dev, num_sectors)?,
            Format::V1 => v1::rdev_size_change(meta, dev, num_sectors)?,
        };
        if sectors < meta.dev_sectors {
            bail!(ErrorKind::ResizeRefused(dev.name().to_owned()));
        }
        write_image(dev)?;
        Ok(sectors)
    }
}

/// Reads `len` bytes at `offset` from a device.
pub(crate) fn read_image(bdev: &dyn BlockDevice, offset: Sectors, len: usize) -> Result<Box<[u8]>> {
    let mut buf = vec![0; len].into_boxed_slice();
    bdev.read_at(&mut buf, offset)?;
    Ok(buf)
}

/// Writes the current superblock image of `dev` to `sb_start`.
pub(crate) fn write_image(dev: &mut MemberDevice) -> Result<()> {
    if let Some(ref image) = dev.sb_image {
        let len = dev.sb_size.min(image.len());
        dev.bdev.write_at(&image[..len], dev.sb_start)?;
        dev.bdev.flush()?;
        dev.sb_state = SbState::Clean;
    }
    Ok(())
}

/// Rounds a superblock size up to the logical block size.
pub(crate) fn round_to_block(size: usize, block_size: usize) -> usize {
    let bmask = block_size.max(1) - 1;
    if size & bmask != 0 {
        (size | bmask) + 1
    } else {
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_sizes() {
        assert_eq!(round_to_block(256, 512), 512);
        assert_eq!(round_to_block(512, 512), 512);
        assert_eq!(round_to_block(513, 512), 1024);
        assert_eq!(round_to_block(300, 4096), 4096);
    }

    #[test]
    fn formats_by_major() {
        assert_eq!(Format::for_major(0), Some(Format::V090));
        assert_eq!(Format::for_major(1), Some(Format::V1));
        assert_eq!(Format::for_major(2), None);
        assert_eq!(Format::V090.max_disks(), 27);
        assert_eq!(Format::V1.max_disks(), 1920);
    }
}
