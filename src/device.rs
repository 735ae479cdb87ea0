//! Member devices of an array.
use crate::blockdev::{BlockDevice, DevId};
use crate::superblock::Superblock;
use crate::units::Sectors;
use std::fmt;

bitflags! {
    /// Per-device state bits.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct DevFlags: u32 {
        /// The device has failed.
        const FAULTY = 1;
        /// The device is fully synchronised with its slot.
        const IN_SYNC = 1 << 1;
        /// Prefer other mirrors for reads.
        const WRITE_MOSTLY = 1 << 2;
        /// Metadata may use the whole device.
        const ALL_RESERVED = 1 << 3;
        /// Failure handling is deferred to user space.
        const BLOCKED = 1 << 4;
        /// Added by in-kernel style autodetection.
        const AUTO_DETECTED = 1 << 5;
        /// The failure has been written to the superblocks.
        const FAULT_RECORDED = 1 << 6;
        /// Must be resynced from the bitmap before use.
        const BITMAP_SYNC = 1 << 7;
    }
}

/// Role of a device as seen from the array.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// Occupies slot `n`.
    Active(u32),
    /// Bound but without a slot.
    Spare,
    /// Failed.
    Faulty,
}

/// State of the in-memory superblock image of a device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SbState {
    /// Nothing has been loaded or generated.
    Empty,
    /// A new image is waiting to be written.
    Dirty,
    /// The image on disk is current.
    Clean,
}

/// One block device contributed to an array.
///
/// Owns the storage handle. While bound, the device itself is owned by the
/// array's registry.
pub struct MemberDevice {
    pub(crate) bdev: Box<dyn BlockDevice>,
    pub(crate) dev: DevId,
    /// Usable data sectors.
    pub(crate) sectors: Sectors,
    pub(crate) sb_start: Sectors,
    /// Superblock size in bytes.
    pub(crate) sb_size: usize,
    pub(crate) sb: Option<Superblock>,
    pub(crate) sb_image: Option<Box<[u8]>>,
    pub(crate) sb_state: SbState,
    pub(crate) sb_events: u64,
    pub(crate) desc_nr: Option<u32>,
    pub(crate) raid_disk: Option<u32>,
    pub(crate) saved_raid_disk: Option<u32>,
    /// Slot proposed by a level takeover.
    pub(crate) new_raid_disk: Option<u32>,
    pub(crate) flags: DevFlags,
    pub(crate) data_offset: Sectors,
    pub(crate) new_data_offset: Sectors,
    pub(crate) recovery_offset: Sectors,
    pub(crate) corrected_errors: u32,
    pub(crate) preferred_minor: Option<u32>,
    /// Unit of the array this device is bound to.
    pub(crate) owner: Option<u32>,
}

impl MemberDevice {
    /// Wraps an opened block device.
    ///
    /// The superblock is not read; see `superblock::Format::load_super`.
    pub fn new(bdev: Box<dyn BlockDevice>) -> Self {
        let dev = bdev.dev_id();
        MemberDevice {
            bdev,
            dev,
            sectors: Sectors(0),
            sb_start: Sectors(0),
            sb_size: 0,
            sb: None,
            sb_image: None,
            sb_state: SbState::Empty,
            sb_events: 0,
            desc_nr: None,
            raid_disk: None,
            saved_raid_disk: None,
            new_raid_disk: None,
            flags: DevFlags::empty(),
            data_offset: Sectors(0),
            new_data_offset: Sectors(0),
            recovery_offset: Sectors(0),
            corrected_errors: 0,
            preferred_minor: None,
            owner: None,
        }
    }

    /// Returns the device number.
    pub fn dev_id(&self) -> DevId {
        self.dev
    }

    /// Returns the name of the underlying device.
    pub fn name(&self) -> &str {
        self.bdev.id()
    }

    /// Returns the underlying block device.
    pub fn block_device(&self) -> &dyn BlockDevice {
        &*self.bdev
    }

    /// Capacity of the underlying device.
    pub fn device_size(&self) -> Sectors {
        self.bdev.size()
    }

    /// Usable data sectors.
    pub fn sectors(&self) -> Sectors {
        self.sectors
    }

    /// Descriptor number in the superblock tables.
    pub fn desc_nr(&self) -> Option<u32> {
        self.desc_nr
    }

    /// Slot in the array.
    pub fn raid_disk(&self) -> Option<u32> {
        self.raid_disk
    }

    /// Sets the slot, used by personalities when adding spares.
    pub fn set_raid_disk(&mut self, slot: Option<u32>) {
        self.raid_disk = slot;
    }

    /// Sets the slot this device takes after a level takeover.
    pub fn set_new_raid_disk(&mut self, slot: Option<u32>) {
        self.new_raid_disk = slot;
    }

    /// Current flags.
    pub fn flags(&self) -> DevFlags {
        self.flags
    }

    /// Mutable access to the flags.
    pub fn flags_mut(&mut self) -> &mut DevFlags {
        &mut self.flags
    }

    /// Start of the data area.
    pub fn data_offset(&self) -> Sectors {
        self.data_offset
    }

    /// Data area start after a pending reshape.
    pub fn new_data_offset(&self) -> Sectors {
        self.new_data_offset
    }

    /// Recovery progress for a device that is not yet in sync.
    pub fn recovery_offset(&self) -> Sectors {
        self.recovery_offset
    }

    /// Updates the recovery progress.
    pub fn set_recovery_offset(&mut self, offset: Sectors) {
        self.recovery_offset = offset;
    }

    /// Location of the superblock.
    pub fn sb_start(&self) -> Sectors {
        self.sb_start
    }

    /// Event count of the last superblock written to this device.
    pub fn sb_events(&self) -> u64 {
        self.sb_events
    }

    /// The parsed superblock, if one was loaded.
    pub fn superblock(&self) -> Option<&Superblock> {
        self.sb.as_ref()
    }

    /// Count of read errors corrected by rewriting.
    pub fn corrected_errors(&self) -> u32 {
        self.corrected_errors
    }

    /// Returns `true` if the device is faulty.
    pub fn is_faulty(&self) -> bool {
        self.flags.contains(DevFlags::FAULTY)
    }

    /// Returns `true` if the device is in sync.
    pub fn is_in_sync(&self) -> bool {
        self.flags.contains(DevFlags::IN_SYNC)
    }

    /// Role derived from flags and slot.
    pub fn role(&self) -> Role {
        if self.is_faulty() {
            Role::Faulty
        } else {
            match self.raid_disk {
                Some(n) => Role::Active(n),
                None => Role::Spare,
            }
        }
    }

    /// Returns `true` if `[data_offset, data_offset + sectors)` of both
    /// devices intersect.
    pub fn overlaps(&self, other: &MemberDevice) -> bool {
        ranges_overlap(self.data_offset, self.sectors, other.data_offset, other.sectors)
    }

    pub(crate) fn info(&self) -> DeviceInfo {
        DeviceInfo {
            dev: self.dev,
            name: self.name().to_owned(),
            desc_nr: self.desc_nr,
            raid_disk: self.raid_disk,
            flags: self.flags,
            read_only: self.bdev.read_only(),
            data_offset: self.data_offset,
            sectors: self.sectors,
        }
    }
}

pub(crate) fn ranges_overlap(s1: Sectors, l1: Sectors, s2: Sectors, l2: Sectors) -> bool {
    !(s1 + l1 <= s2 || s2 + l2 <= s1)
}

impl fmt::Debug for MemberDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemberDevice")
            .field("dev", &self.dev)
            .field("name", &self.name())
            .field("desc_nr", &self.desc_nr)
            .field("raid_disk", &self.raid_disk)
            .field("flags", &self.flags)
            .field("sectors", &self.sectors)
            .field("sb_events", &self.sb_events)
            .finish()
    }
}

/// Immutable snapshot of a member device for lock-free readers.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device number.
    pub dev: DevId,
    /// Name of the underlying device.
    pub name: String,
    /// Descriptor number.
    pub desc_nr: Option<u32>,
    /// Slot.
    pub raid_disk: Option<u32>,
    /// Flags at the time of the snapshot.
    pub flags: DevFlags,
    /// The underlying device refuses writes.
    pub read_only: bool,
    /// Start of the data area.
    pub data_offset: Sectors,
    /// Usable data sectors.
    pub sectors: Sectors,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[quickcheck]
    fn overlap_is_symmetric(s1: u16, l1: u16, s2: u16, l2: u16) -> bool {
        let (s1, l1, s2, l2) = (
            Sectors(s1.into()),
            Sectors(l1.into()),
            Sectors(s2.into()),
            Sectors(l2.into()),
        );
        ranges_overlap(s1, l1, s2, l2) == ranges_overlap(s2, l2, s1, l1)
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        assert!(!ranges_overlap(Sectors(0), Sectors(10), Sectors(10), Sectors(5)));
        assert!(ranges_overlap(Sectors(0), Sectors(11), Sectors(10), Sectors(5)));
    }

    #[test]
    fn flags() {
        let mut f = DevFlags::empty();
        f.insert(DevFlags::FAULTY);
        f.set(DevFlags::IN_SYNC, true);
        assert!(f.contains(DevFlags::FAULTY));
        f.remove(DevFlags::FAULTY);
        assert!(!f.contains(DevFlags::FAULTY));
        assert!(f.contains(DevFlags::IN_SYNC));
        f.insert(DevFlags::FAULT_RECORDED | DevFlags::BLOCKED);
        f.remove(DevFlags::BLOCKED | DevFlags::FAULTY);
        assert_eq!(f, DevFlags::IN_SYNC | DevFlags::FAULT_RECORDED);
        assert_eq!(f.bits(), 1 << 1 | 1 << 6);
    }
}
