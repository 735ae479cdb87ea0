//! Version 0.90 superblocks.
//!
//! The image is 4096 bytes of 32 bit words at the start of the last 64 KiB
//! aligned block of the device. Words 0..32 hold values that never change
//! for the lifetime of the array, words 32..64 the state, word 64 onwards
//! level specific values and from word 128 the descriptor table.
//! Fields are stored little-endian.

use super::errors::*;
use super::{read_image, Freshness, Superblock, ValidateMode};
use crate::checksum::Csum;
use crate::device::{DevFlags, MemberDevice, SbState};
use crate::meta::{ArrayMeta, Bitmap, Metadata, LEVEL_MULTIPATH};
use crate::units::{Sectors, MAX_SECTOR};
use byteorder::{ByteOrder, LittleEndian};

/// Superblock magic.
pub const MAGIC: u32 = 0xa92b_4efc;
/// Size of the image.
pub const SB_BYTES: usize = 4096;
/// Size of the descriptor table.
pub const MAX_DISKS: u32 = 27;
/// Sectors reserved at the end of the device.
pub const RESERVED_SECTORS: u64 = 128;

/// Array state bit: cleanly shut down.
pub const SB_CLEAN: u32 = 0;
/// Array state bit: errors occurred.
pub const SB_ERRORS: u32 = 1;
/// Array state bit: a bitmap follows the superblock.
pub const SB_BITMAP_PRESENT: u32 = 8;

/// Descriptor state bit: device failed.
pub const DISK_FAULTY: u32 = 0;
/// Descriptor state bit: device occupies a slot.
pub const DISK_ACTIVE: u32 = 1;
/// Descriptor state bit: device is in sync.
pub const DISK_SYNC: u32 = 2;
/// Descriptor state bit: device is missing.
pub const DISK_REMOVED: u32 = 3;
/// Descriptor state bit: avoid reads.
pub const DISK_WRITEMOSTLY: u32 = 9;

const GENERIC_CONSTANT_BYTES: usize = 128;
const NR_DISKS_OFFSET: usize = 36;
const CSUM_OFFSET: usize = 152;
const DISKS_OFFSET: usize = 512;
const DESCRIPTOR_BYTES: usize = 128;
const THIS_DISK_OFFSET: usize = 3968;

/// Maximum component size the 32 bit KiB size field can describe.
const MAX_COMPONENT: Sectors = Sectors((2 << 32) - 2);

/// One entry of the descriptor table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskDescriptor {
    /// Index in the table.
    pub number: u32,
    /// Device major.
    pub major: u32,
    /// Device minor.
    pub minor: u32,
    /// Slot.
    pub raid_disk: u32,
    /// `DISK_*` bits.
    pub state: u32,
}

impl DiskDescriptor {
    fn has(&self, bit: u32) -> bool {
        self.state & (1 << bit) != 0
    }

    fn decode(b: &[u8]) -> Self {
        DiskDescriptor {
            number: LittleEndian::read_u32(&b[0..]),
            major: LittleEndian::read_u32(&b[4..]),
            minor: LittleEndian::read_u32(&b[8..]),
            raid_disk: LittleEndian::read_u32(&b[12..]),
            state: LittleEndian::read_u32(&b[16..]),
        }
    }

    fn encode(&self, b: &mut [u8]) {
        LittleEndian::write_u32(&mut b[0..], self.number);
        LittleEndian::write_u32(&mut b[4..], self.major);
        LittleEndian::write_u32(&mut b[8..], self.minor);
        LittleEndian::write_u32(&mut b[12..], self.raid_disk);
        LittleEndian::write_u32(&mut b[16..], self.state);
    }
}

/// A decoded 0.90 superblock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sb090 {
    pub major_version: u32,
    pub minor_version: u32,
    pub patch_version: u32,
    pub gvalid_words: u32,
    pub set_uuid: [u32; 4],
    pub ctime: u32,
    pub level: i32,
    /// Component size in KiB.
    pub size: u32,
    pub nr_disks: u32,
    pub raid_disks: u32,
    pub md_minor: u32,
    pub not_persistent: u32,
    pub utime: u32,
    pub state: u32,
    pub active_disks: u32,
    pub working_disks: u32,
    pub failed_disks: u32,
    pub spare_disks: u32,
    pub sb_csum: u32,
    pub events: u64,
    pub cp_events: u64,
    pub recovery_cp: u32,
    pub reshape_position: u64,
    pub new_level: i32,
    pub delta_disks: i32,
    pub new_layout: u32,
    /// Bytes.
    pub new_chunk: u32,
    pub layout: u32,
    /// Bytes.
    pub chunk_size: u32,
    pub disks: [DiskDescriptor; MAX_DISKS as usize],
    pub this_disk: DiskDescriptor,
}

impl Sb090 {
    /// Array UUID in memory byte order.
    pub fn uuid(&self) -> [u8; 16] {
        let mut uuid = [0; 16];
        for (chunk, word) in uuid.chunks_mut(4).zip(self.set_uuid.iter()) {
            LittleEndian::write_u32(chunk, *word);
        }
        uuid
    }

    fn has_state(&self, bit: u32) -> bool {
        self.state & (1 << bit) != 0
    }

    /// Decodes an image without any validation.
    pub fn decode(b: &[u8]) -> Self {
        let word = |i: usize| LittleEndian::read_u32(&b[i * 4..]);
        let mut disks = [DiskDescriptor::default(); MAX_DISKS as usize];
        for (i, d) in disks.iter_mut().enumerate() {
            *d = DiskDescriptor::decode(&b[DISKS_OFFSET + i * DESCRIPTOR_BYTES..]);
        }
        Sb090 {
            major_version: word(1),
            minor_version: word(2),
            patch_version: word(3),
            gvalid_words: word(4),
            set_uuid: [word(5), word(13), word(14), word(15)],
            ctime: word(6),
            level: word(7) as i32,
            size: word(8),
            nr_disks: word(9),
            raid_disks: word(10),
            md_minor: word(11),
            not_persistent: word(12),
            utime: word(32),
            state: word(33),
            active_disks: word(34),
            working_disks: word(35),
            failed_disks: word(36),
            spare_disks: word(37),
            sb_csum: word(38),
            events: LittleEndian::read_u64(&b[156..]),
            cp_events: LittleEndian::read_u64(&b[164..]),
            recovery_cp: word(43),
            reshape_position: LittleEndian::read_u64(&b[176..]),
            new_level: word(46) as i32,
            delta_disks: word(47) as i32,
            new_layout: word(48),
            new_chunk: word(49),
            layout: word(64),
            chunk_size: word(65),
            disks,
            this_disk: DiskDescriptor::decode(&b[THIS_DISK_OFFSET..]),
        }
    }

    /// Encodes the superblock; `sb_csum` is written as is.
    pub fn encode(&self) -> Box<[u8]> {
        let mut b = vec![0u8; SB_BYTES].into_boxed_slice();
        {
            let mut put = |i: usize, v: u32| LittleEndian::write_u32(&mut b[i * 4..], v);
            put(0, MAGIC);
            put(1, self.major_version);
            put(2, self.minor_version);
            put(3, self.patch_version);
            put(4, self.gvalid_words);
            put(5, self.set_uuid[0]);
            put(6, self.ctime);
            put(7, self.level as u32);
            put(8, self.size);
            put(9, self.nr_disks);
            put(10, self.raid_disks);
            put(11, self.md_minor);
            put(12, self.not_persistent);
            put(13, self.set_uuid[1]);
            put(14, self.set_uuid[2]);
            put(15, self.set_uuid[3]);
            put(32, self.utime);
            put(33, self.state);
            put(34, self.active_disks);
            put(35, self.working_disks);
            put(36, self.failed_disks);
            put(37, self.spare_disks);
            put(38, self.sb_csum);
            put(43, self.recovery_cp);
            put(46, self.new_level as u32);
            put(47, self.delta_disks as u32);
            put(48, self.new_layout);
            put(49, self.new_chunk);
            put(64, self.layout);
            put(65, self.chunk_size);
        }
        LittleEndian::write_u64(&mut b[156..], self.events);
        LittleEndian::write_u64(&mut b[164..], self.cp_events);
        LittleEndian::write_u64(&mut b[176..], self.reshape_position);
        for (i, d) in self.disks.iter().enumerate() {
            d.encode(&mut b[DISKS_OFFSET + i * DESCRIPTOR_BYTES..]);
        }
        self.this_disk.encode(&mut b[THIS_DISK_OFFSET..]);
        b
    }
}

/// Checksum of an image with the checksum field taken as zero.
pub fn calc_csum(b: &[u8]) -> Csum {
    Csum::of_buffer(vec![&b[..CSUM_OFFSET], &[0; 4][..], &b[CSUM_OFFSET + 4..SB_BYTES]])
}

/// Superblock location: the last 64 KiB aligned 64 KiB block.
pub fn sb_offset(dev_size: Sectors) -> Option<Sectors> {
    dev_size
        .align_down(RESERVED_SECTORS)
        .checked_sub(Sectors(RESERVED_SECTORS))
}

pub(super) fn same_array(a: &Sb090, b: &Sb090) -> bool {
    if a.set_uuid != b.set_uuid {
        return false;
    }
    // The generic constant words must agree, except for nr_disks.
    let (mut ea, mut eb) = (a.encode(), b.encode());
    LittleEndian::write_u32(&mut ea[NR_DISKS_OFFSET..], 0);
    LittleEndian::write_u32(&mut eb[NR_DISKS_OFFSET..], 0);
    ea[..GENERIC_CONSTANT_BYTES] == eb[..GENERIC_CONSTANT_BYTES]
}

/// Validates and decodes a raw image.
pub fn parse(buf: &[u8], dev: &str) -> Result<Sb090> {
    if buf.len() < SB_BYTES {
        bail!(ErrorKind::InvalidLayout(dev.to_owned(), "short superblock"));
    }
    if LittleEndian::read_u32(buf) != MAGIC {
        bail!(ErrorKind::InvalidMagic(dev.to_owned()));
    }
    let sb = Sb090::decode(buf);
    if sb.major_version != 0 || sb.minor_version < 90 || sb.minor_version > 91 {
        bail!(ErrorKind::UnsupportedVersion(
            dev.to_owned(),
            sb.major_version,
            sb.minor_version
        ));
    }
    if sb.raid_disks == 0 || sb.raid_disks as i32 <= 0 {
        bail!(ErrorKind::InvalidLayout(dev.to_owned(), "no raid disks"));
    }
    let computed = calc_csum(buf);
    let stored = Csum(sb.sb_csum);
    // Some writers stored the 16 bit fold of the checksum.
    if computed != stored && computed.fold16() != stored.fold16() {
        bail!(ErrorKind::ChecksumMismatch(dev.to_owned()));
    }
    Ok(sb)
}

fn is_spare(sb: &Sb090, desc_nr: Option<u32>) -> bool {
    if sb.level == LEVEL_MULTIPATH {
        return false;
    }
    match desc_nr {
        Some(nr) if nr < MAX_DISKS => {
            let d = &sb.disks[nr as usize];
            !(d.has(DISK_SYNC) || d.has(DISK_ACTIVE))
        }
        _ => true,
    }
}

pub(super) fn load_super(dev: &mut MemberDevice, reference: Option<&Superblock>) -> Result<Freshness> {
    let name = dev.name().to_owned();
    let sb_start = match sb_offset(dev.device_size()) {
        Some(s) => s,
        None => bail!(ErrorKind::SizeTooSmall(name)),
    };
    dev.sb_start = sb_start;
    let buf = read_image(&*dev.bdev, sb_start, SB_BYTES)?;
    let sb = parse(&buf, &name)?;

    dev.preferred_minor = Some(sb.md_minor);
    dev.data_offset = Sectors(0);
    dev.new_data_offset = Sectors(0);
    dev.sb_size = SB_BYTES;
    dev.desc_nr = if sb.level == LEVEL_MULTIPATH {
        None
    } else {
        Some(sb.this_disk.number)
    };

    let spare = is_spare(&sb, dev.desc_nr);
    let freshness = match reference {
        None if spare => Freshness::Older,
        None => Freshness::Newer,
        Some(Superblock::V090(refsb)) => {
            if refsb.set_uuid != sb.set_uuid {
                warn!("md: {} has different UUID", name);
                bail!(ErrorKind::Incompatible(name));
            }
            if !same_array(&sb, refsb) {
                warn!("md: {} has same UUID but different superblock", name);
                bail!(ErrorKind::Incompatible(name));
            }
            if !spare && sb.events > refsb.events {
                Freshness::Newer
            } else {
                Freshness::Older
            }
        }
        Some(_) => bail!(ErrorKind::Incompatible(name)),
    };

    dev.sectors = sb_start;
    // The KiB size field cannot describe more than 4 TiB.
    if dev.sectors >= Sectors(2 << 32) && sb.level >= 1 {
        dev.sectors = MAX_COMPONENT;
    }
    if dev.sectors < Sectors::from_kib(u64::from(sb.size)) && sb.level >= 1 {
        bail!(ErrorKind::SizeTooSmall(name));
    }
    dev.sb = Some(Superblock::V090(Box::new(sb)));
    dev.sb_image = Some(buf);
    dev.sb_state = SbState::Clean;
    Ok(freshness)
}

pub(super) fn validate(meta: &mut ArrayMeta, dev: &mut MemberDevice, mode: ValidateMode) -> Result<()> {
    let sb = match dev.sb {
        Some(Superblock::V090(ref sb)) => sb.clone(),
        _ => bail!(ErrorKind::Incompatible(dev.name().to_owned())),
    };
    let events = sb.events;
    dev.raid_disk = None;
    dev.flags.remove(DevFlags::FAULTY);
    dev.flags.remove(DevFlags::IN_SYNC);
    dev.flags.remove(DevFlags::BITMAP_SYNC);
    dev.flags.remove(DevFlags::WRITE_MOSTLY);

    let desc = dev
        .desc_nr
        .filter(|&nr| nr < MAX_DISKS)
        .map(|nr| sb.disks[nr as usize]);

    if meta.raid_disks == 0 {
        meta.metadata = Metadata::Persistent {
            major: 0,
            minor: sb.minor_version,
        };
        meta.patch_version = sb.patch_version;
        meta.chunk_sectors = sb.chunk_size >> 9;
        meta.ctime = u64::from(sb.ctime);
        meta.utime = u64::from(sb.utime);
        meta.level = sb.level;
        meta.clevel.clear();
        meta.layout = sb.layout;
        meta.raid_disks = sb.raid_disks;
        meta.dev_sectors = Sectors::from_kib(u64::from(sb.size));
        meta.events = events;
        meta.bitmap = None;
        meta.reshape_backwards = false;
        if sb.minor_version >= 91 {
            meta.reshape_position = Sectors(sb.reshape_position);
            meta.delta_disks = sb.delta_disks;
            meta.new_level = sb.new_level;
            meta.new_layout = sb.new_layout;
            meta.new_chunk_sectors = sb.new_chunk >> 9;
            if meta.delta_disks < 0 {
                meta.reshape_backwards = true;
            }
        } else {
            meta.reshape_position = MAX_SECTOR;
            meta.delta_disks = 0;
            meta.new_level = meta.level;
            meta.new_layout = meta.layout;
            meta.new_chunk_sectors = meta.chunk_sectors;
        }
        if meta.level == 0 {
            meta.layout = !0;
        }
        meta.recovery_cp = if sb.has_state(SB_CLEAN) {
            MAX_SECTOR
        } else if sb.events == sb.cp_events {
            Sectors(u64::from(sb.recovery_cp))
        } else {
            Sectors(0)
        };
        meta.uuid = sb.uuid();
        meta.max_disks = MAX_DISKS;
        if sb.has_state(SB_BITMAP_PRESENT) {
            // The bitmap lives in the 60 KiB after the superblock.
            meta.bitmap = Some(Bitmap {
                offset: (SB_BYTES >> 9) as i32,
                events_cleared: 0,
            });
        }
    } else if !mode.running {
        // Insist on a good event counter while assembling, except for spares.
        if let Some(d) = desc {
            if (d.has(DISK_SYNC) || d.has(DISK_ACTIVE)) && events + 1 < meta.events {
                bail!(ErrorKind::NonFresh(dev.name().to_owned(), events, meta.events));
            }
        }
    } else if let Some(bitmap) = meta.bitmap {
        if events < bitmap.events_cleared {
            return Ok(());
        }
        if events < meta.events {
            dev.flags.insert(DevFlags::BITMAP_SYNC);
        }
    } else if events < meta.events {
        // A hot-add of an outdated device, it stays a spare.
        return Ok(());
    }

    if meta.level != LEVEL_MULTIPATH {
        let d = match desc {
            Some(d) => d,
            None => return Ok(()),
        };
        if d.has(DISK_FAULTY) {
            dev.flags.insert(DevFlags::FAULTY);
        } else if d.has(DISK_SYNC) {
            dev.flags.insert(DevFlags::IN_SYNC);
            dev.raid_disk = Some(d.raid_disk);
            dev.saved_raid_disk = Some(d.raid_disk);
        } else if d.has(DISK_ACTIVE) && meta.minor_version().map_or(false, |m| m >= 91) {
            // Active but not in sync: recovery up to the reshape position,
            // which is not recorded, so start over.
            dev.recovery_offset = Sectors(0);
            dev.raid_disk = Some(d.raid_disk);
        }
        if d.has(DISK_WRITEMOSTLY) {
            dev.flags.insert(DevFlags::WRITE_MOSTLY);
        }
    } else {
        dev.flags.insert(DevFlags::IN_SYNC);
    }
    Ok(())
}

pub(super) fn sync(meta: &mut ArrayMeta, in_sync: bool, disks: &mut [MemberDevice], idx: usize) {
    let mut sb = Sb090::default();
    sb.major_version = 0;
    sb.patch_version = meta.patch_version;
    for (word, chunk) in sb.set_uuid.iter_mut().zip(meta.uuid.chunks(4)) {
        *word = LittleEndian::read_u32(chunk);
    }
    sb.ctime = meta.ctime.min(u64::from(u32::max_value())) as u32;
    sb.level = meta.level;
    sb.size = meta.dev_sectors.as_kib() as u32;
    sb.raid_disks = meta.raid_disks;
    sb.md_minor = meta.md_minor;
    sb.utime = meta.utime.min(u64::from(u32::max_value())) as u32;
    sb.events = meta.events;

    if meta.reshape_pending() {
        sb.minor_version = 91;
        sb.reshape_position = meta.reshape_position.as_u64();
        sb.new_level = meta.new_level;
        sb.delta_disks = meta.delta_disks;
        sb.new_layout = meta.new_layout;
        sb.new_chunk = meta.new_chunk_sectors << 9;
    } else {
        sb.minor_version = 90;
    }
    meta.set_minor_version(sb.minor_version);

    if in_sync {
        sb.recovery_cp = meta.recovery_cp.as_u64() as u32;
        sb.cp_events = meta.events;
        if meta.recovery_cp.is_max() {
            sb.state = 1 << SB_CLEAN;
        }
    } else {
        sb.recovery_cp = 0;
    }
    sb.layout = meta.layout;
    sb.chunk_size = meta.chunk_sectors << 9;
    if meta.bitmap.is_some() {
        sb.state |= 1 << SB_BITMAP_PRESENT;
    }

    sb.disks[0].state = 1 << DISK_REMOVED;
    let (mut active, mut working, mut failed, mut spare, mut nr_disks) = (0, 0, 0, 0, 0);
    let mut next_spare = meta.raid_disks;
    for dev in disks.iter_mut() {
        let faulty = dev.flags.contains(DevFlags::FAULTY);
        let mut is_active = dev.flags.contains(DevFlags::IN_SYNC);
        if dev.raid_disk.is_some() && sb.minor_version >= 91 {
            // Recovery offset piggybacks on the reshape position.
            is_active = true;
        }
        if dev.raid_disk.is_none() || faulty {
            is_active = false;
        }
        let desc_nr = match (is_active, dev.raid_disk) {
            (true, Some(slot)) => slot,
            _ => {
                next_spare += 1;
                next_spare - 1
            }
        };
        dev.desc_nr = Some(desc_nr);
        if desc_nr >= MAX_DISKS {
            warn!("md: {} has descriptor {} beyond the 0.90 table", dev.name(), desc_nr);
            continue;
        }
        let d = &mut sb.disks[desc_nr as usize];
        nr_disks += 1;
        d.number = desc_nr;
        d.major = dev.dev.major;
        d.minor = dev.dev.minor;
        d.raid_disk = match (is_active, dev.raid_disk) {
            (true, Some(slot)) => slot,
            _ => desc_nr,
        };
        if faulty {
            d.state = 1 << DISK_FAULTY;
        } else if is_active {
            d.state = 1 << DISK_ACTIVE;
            if dev.flags.contains(DevFlags::IN_SYNC) {
                d.state |= 1 << DISK_SYNC;
            }
            active += 1;
            working += 1;
        } else {
            d.state = 0;
            spare += 1;
            working += 1;
        }
        if dev.flags.contains(DevFlags::WRITE_MOSTLY) {
            d.state |= 1 << DISK_WRITEMOSTLY;
        }
    }
    // Mark missing devices removed and faulty.
    for i in 0..meta.raid_disks.min(MAX_DISKS) {
        let d = &mut sb.disks[i as usize];
        if d.state == 0 && d.number == 0 {
            d.number = i;
            d.raid_disk = i;
            d.state = (1 << DISK_REMOVED) | (1 << DISK_FAULTY);
            failed += 1;
        }
    }
    sb.nr_disks = nr_disks;
    sb.active_disks = active;
    sb.working_disks = working;
    sb.failed_disks = failed;
    sb.spare_disks = spare;

    let dev = &mut disks[idx];
    if let Some(nr) = dev.desc_nr.filter(|&nr| nr < MAX_DISKS) {
        sb.this_disk = sb.disks[nr as usize];
    }
    let mut image = sb.encode();
    sb.sb_csum = calc_csum(&image).0;
    LittleEndian::write_u32(&mut image[CSUM_OFFSET..], sb.sb_csum);

    dev.sb_size = SB_BYTES;
    dev.sb = Some(Superblock::V090(Box::new(sb)));
    dev.sb_image = Some(image);
    dev.sb_state = SbState::Dirty;
}

pub(super) fn rdev_size_change(meta: &ArrayMeta, dev: &mut MemberDevice, num_sectors: Sectors) -> Result<Sectors> {
    if meta.bitmap.is_some() {
        // The bitmap cannot be moved.
        bail!(ErrorKind::ResizeRefused(dev.name().to_owned()));
    }
    let sb_start = match sb_offset(dev.device_size()) {
        Some(s) => s,
        None => bail!(ErrorKind::SizeTooSmall(dev.name().to_owned())),
    };
    dev.sb_start = sb_start;
    let mut sectors = num_sectors;
    if sectors == Sectors(0) || sectors > sb_start {
        sectors = sb_start;
    }
    if sectors >= Sectors(2 << 32) && meta.level >= 1 {
        sectors = MAX_COMPONENT;
    }
    Ok(sectors)
}
