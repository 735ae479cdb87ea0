//! Version 1.x superblocks.
//!
//! A 256 byte header followed by a table of 16 bit device roles. The minor
//! version selects the location: 1.0 at the end of the device, 1.1 at the
//! start and 1.2 4 KiB from the start.

use super::errors::*;
use super::{read_image, round_to_block, Freshness, Superblock, ValidateMode};
use crate::checksum::Csum;
use crate::device::{DevFlags, MemberDevice, SbState};
use crate::meta::{ArrayMeta, Bitmap, Metadata, LEVEL_MULTIPATH};
use crate::units::{Sectors, MAX_SECTOR};
use byteorder::{ByteOrder, LittleEndian};

/// Superblock magic, shared with 0.90.
pub const MAGIC: u32 = 0xa92b_4efc;
/// Size of the fixed header.
pub const HEADER_BYTES: usize = 256;
/// Bytes read from the device when loading.
pub const READ_BYTES: usize = 4096;
/// Largest role table that fits into 4 KiB.
pub const MAX_DEVS: u32 = ((READ_BYTES - HEADER_BYTES) / 2) as u32;

pub const FEATURE_BITMAP_OFFSET: u32 = 1;
pub const FEATURE_RECOVERY_OFFSET: u32 = 2;
pub const FEATURE_RESHAPE_ACTIVE: u32 = 4;
pub const FEATURE_BAD_BLOCKS: u32 = 8;
pub const FEATURE_REPLACEMENT: u32 = 16;
pub const FEATURE_RESHAPE_BACKWARDS: u32 = 32;
pub const FEATURE_NEW_OFFSET: u32 = 64;
pub const FEATURE_RECOVERY_BITMAP: u32 = 128;
pub const FEATURE_CLUSTERED: u32 = 256;
pub const FEATURE_JOURNAL: u32 = 512;
pub const FEATURE_PPL: u32 = 1024;
pub const FEATURE_MULTIPLE_PPLS: u32 = 2048;
pub const FEATURE_RAID0_LAYOUT: u32 = 4096;
/// Every feature bit this implementation understands.
pub const FEATURE_ALL: u32 = FEATURE_BITMAP_OFFSET
    | FEATURE_RECOVERY_OFFSET
    | FEATURE_RESHAPE_ACTIVE
    | FEATURE_BAD_BLOCKS
    | FEATURE_REPLACEMENT
    | FEATURE_RESHAPE_BACKWARDS
    | FEATURE_NEW_OFFSET
    | FEATURE_RECOVERY_BITMAP
    | FEATURE_CLUSTERED
    | FEATURE_JOURNAL
    | FEATURE_PPL
    | FEATURE_MULTIPLE_PPLS
    | FEATURE_RAID0_LAYOUT;

/// Role of a spare.
pub const ROLE_SPARE: u16 = 0xffff;
/// Role of a failed or unused descriptor.
pub const ROLE_FAULTY: u16 = 0xfffe;
/// Role of a journal device.
pub const ROLE_JOURNAL: u16 = 0xfffd;
/// Roles at or above this are not slots.
pub const ROLE_MAX: u16 = 0xff00;

/// `devflags` bit: prefer other mirrors for reads.
pub const DEVFLAG_WRITE_MOSTLY: u8 = 1;

const CSUM_OFFSET: usize = 216;

/// A decoded 1.x superblock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sb1 {
    pub feature_map: u32,
    pub pad0: u32,
    pub set_uuid: [u8; 16],
    pub set_name: [u8; 32],
    pub ctime: u64,
    pub level: i32,
    pub layout: u32,
    /// Component size in sectors.
    pub size: u64,
    /// Sectors.
    pub chunksize: u32,
    pub raid_disks: u32,
    /// Sectors from the superblock, signed.
    pub bitmap_offset: u32,
    pub new_level: i32,
    pub reshape_position: u64,
    pub delta_disks: i32,
    pub new_layout: u32,
    pub new_chunk: u32,
    /// Signed offset to the new data area.
    pub new_offset: u32,
    pub data_offset: u64,
    pub data_size: u64,
    pub super_offset: u64,
    pub recovery_offset: u64,
    pub dev_number: u32,
    pub cnt_corrected_read: u32,
    pub device_uuid: [u8; 16],
    pub devflags: u8,
    pub bblog_shift: u8,
    pub bblog_size: u16,
    pub bblog_offset: u32,
    pub utime: u64,
    pub events: u64,
    pub resync_offset: u64,
    pub sb_csum: u32,
    pub max_dev: u32,
    pub pad3: [u8; 32],
    pub dev_roles: Vec<u16>,
}

impl Sb1 {
    fn has_feature(&self, feature: u32) -> bool {
        self.feature_map & feature != 0
    }

    /// Role of descriptor `desc_nr`, if it is within the table.
    pub fn role(&self, desc_nr: Option<u32>) -> Option<u16> {
        desc_nr
            .filter(|&nr| nr < self.max_dev)
            .and_then(|nr| self.dev_roles.get(nr as usize).cloned())
    }

    /// Length of the checksummed image.
    pub fn sb_bytes(&self) -> usize {
        HEADER_BYTES + 2 * self.max_dev as usize
    }

    /// Decodes an image without any validation.
    ///
    /// `b` must hold the role table, i.e. at least `sb_bytes()` bytes.
    pub fn decode(b: &[u8]) -> Self {
        let max_dev = LittleEndian::read_u32(&b[220..]);
        let n = (max_dev as usize).min((b.len().saturating_sub(HEADER_BYTES)) / 2);
        let mut dev_roles = vec![0; n];
        LittleEndian::read_u16_into(&b[HEADER_BYTES..HEADER_BYTES + 2 * n], &mut dev_roles);
        let mut sb = Sb1 {
            feature_map: LittleEndian::read_u32(&b[8..]),
            pad0: LittleEndian::read_u32(&b[12..]),
            ctime: LittleEndian::read_u64(&b[64..]),
            level: LittleEndian::read_i32(&b[72..]),
            layout: LittleEndian::read_u32(&b[76..]),
            size: LittleEndian::read_u64(&b[80..]),
            chunksize: LittleEndian::read_u32(&b[88..]),
            raid_disks: LittleEndian::read_u32(&b[92..]),
            bitmap_offset: LittleEndian::read_u32(&b[96..]),
            new_level: LittleEndian::read_i32(&b[100..]),
            reshape_position: LittleEndian::read_u64(&b[104..]),
            delta_disks: LittleEndian::read_i32(&b[112..]),
            new_layout: LittleEndian::read_u32(&b[116..]),
            new_chunk: LittleEndian::read_u32(&b[120..]),
            new_offset: LittleEndian::read_u32(&b[124..]),
            data_offset: LittleEndian::read_u64(&b[128..]),
            data_size: LittleEndian::read_u64(&b[136..]),
            super_offset: LittleEndian::read_u64(&b[144..]),
            recovery_offset: LittleEndian::read_u64(&b[152..]),
            dev_number: LittleEndian::read_u32(&b[160..]),
            cnt_corrected_read: LittleEndian::read_u32(&b[164..]),
            devflags: b[184],
            bblog_shift: b[185],
            bblog_size: LittleEndian::read_u16(&b[186..]),
            bblog_offset: LittleEndian::read_u32(&b[188..]),
            utime: LittleEndian::read_u64(&b[192..]),
            events: LittleEndian::read_u64(&b[200..]),
            resync_offset: LittleEndian::read_u64(&b[208..]),
            sb_csum: LittleEndian::read_u32(&b[216..]),
            max_dev,
            dev_roles,
            ..Default::default()
        };
        sb.set_uuid.copy_from_slice(&b[16..32]);
        sb.set_name.copy_from_slice(&b[32..64]);
        sb.device_uuid.copy_from_slice(&b[168..184]);
        sb.pad3.copy_from_slice(&b[224..256]);
        sb
    }

    /// Encodes into an image of `len` bytes; `sb_csum` is written as is.
    pub fn encode(&self, len: usize) -> Box<[u8]> {
        let mut b = vec![0u8; len.max(self.sb_bytes())].into_boxed_slice();
        LittleEndian::write_u32(&mut b[0..], MAGIC);
        LittleEndian::write_u32(&mut b[4..], 1);
        LittleEndian::write_u32(&mut b[8..], self.feature_map);
        LittleEndian::write_u32(&mut b[12..], self.pad0);
        b[16..32].copy_from_slice(&self.set_uuid);
        b[32..64].copy_from_slice(&self.set_name);
        LittleEndian::write_u64(&mut b[64..], self.ctime);
        LittleEndian::write_i32(&mut b[72..], self.level);
        LittleEndian::write_u32(&mut b[76..], self.layout);
        LittleEndian::write_u64(&mut b[80..], self.size);
        LittleEndian::write_u32(&mut b[88..], self.chunksize);
        LittleEndian::write_u32(&mut b[92..], self.raid_disks);
        LittleEndian::write_u32(&mut b[96..], self.bitmap_offset);
        LittleEndian::write_i32(&mut b[100..], self.new_level);
        LittleEndian::write_u64(&mut b[104..], self.reshape_position);
        LittleEndian::write_i32(&mut b[112..], self.delta_disks);
        LittleEndian::write_u32(&mut b[116..], self.new_layout);
        LittleEndian::write_u32(&mut b[120..], self.new_chunk);
        LittleEndian::write_u32(&mut b[124..], self.new_offset);
        LittleEndian::write_u64(&mut b[128..], self.data_offset);
        LittleEndian::write_u64(&mut b[136..], self.data_size);
        LittleEndian::write_u64(&mut b[144..], self.super_offset);
        LittleEndian::write_u64(&mut b[152..], self.recovery_offset);
        LittleEndian::write_u32(&mut b[160..], self.dev_number);
        LittleEndian::write_u32(&mut b[164..], self.cnt_corrected_read);
        b[168..184].copy_from_slice(&self.device_uuid);
        b[184] = self.devflags;
        b[185] = self.bblog_shift;
        LittleEndian::write_u16(&mut b[186..], self.bblog_size);
        LittleEndian::write_u32(&mut b[188..], self.bblog_offset);
        LittleEndian::write_u64(&mut b[192..], self.utime);
        LittleEndian::write_u64(&mut b[200..], self.events);
        LittleEndian::write_u64(&mut b[208..], self.resync_offset);
        LittleEndian::write_u32(&mut b[216..], self.sb_csum);
        LittleEndian::write_u32(&mut b[220..], self.max_dev);
        b[224..256].copy_from_slice(&self.pad3);
        let roles = self.dev_roles.len().min(self.max_dev as usize);
        LittleEndian::write_u16_into(
            &self.dev_roles[..roles],
            &mut b[HEADER_BYTES..HEADER_BYTES + 2 * roles],
        );
        b
    }

    /// Encodes with a freshly computed checksum.
    pub(crate) fn seal(&mut self, len: usize) -> Box<[u8]> {
        let mut image = self.encode(len);
        self.sb_csum = calc_csum(&image, self.max_dev).0;
        LittleEndian::write_u32(&mut image[CSUM_OFFSET..], self.sb_csum);
        image
    }
}

/// Checksum over header and role table with the checksum field as zero.
pub fn calc_csum(b: &[u8], max_dev: u32) -> Csum {
    let end = HEADER_BYTES + 2 * max_dev as usize;
    Csum::of_buffer(vec![&b[..CSUM_OFFSET], &[0; 4][..], &b[CSUM_OFFSET + 4..end]])
}

/// Superblock location for a minor version.
///
/// - 0: at least 8 KiB from the end, 4 KiB aligned
/// - 1: at the start
/// - 2: 4 KiB from the start
pub fn sb_offset(dev_size: Sectors, minor: u32) -> Option<Sectors> {
    match minor {
        0 => dev_size.checked_sub(Sectors(16)).map(|s| s.align_down(8)),
        1 => Some(Sectors(0)),
        2 => Some(Sectors(8)),
        _ => None,
    }
}

pub(super) fn same_array(a: &Sb1, b: &Sb1) -> bool {
    a.set_uuid == b.set_uuid && a.level == b.level && a.layout == b.layout && a.chunksize == b.chunksize
}

/// Validates and decodes a raw image.
pub fn parse(buf: &[u8], minor: u32, dev: &str) -> Result<Sb1> {
    if buf.len() < HEADER_BYTES {
        bail!(ErrorKind::InvalidLayout(dev.to_owned(), "short superblock"));
    }
    if LittleEndian::read_u32(buf) != MAGIC {
        bail!(ErrorKind::InvalidMagic(dev.to_owned()));
    }
    let major = LittleEndian::read_u32(&buf[4..]);
    if major != 1 || minor > 2 {
        bail!(ErrorKind::UnsupportedVersion(dev.to_owned(), major, minor));
    }
    let max_dev = LittleEndian::read_u32(&buf[220..]);
    if max_dev > MAX_DEVS || buf.len() < HEADER_BYTES + 2 * max_dev as usize {
        bail!(ErrorKind::InvalidLayout(dev.to_owned(), "role table too large"));
    }
    if LittleEndian::read_u32(&buf[8..]) & !FEATURE_ALL != 0 {
        bail!(ErrorKind::InvalidLayout(dev.to_owned(), "unknown feature bits"));
    }
    if calc_csum(buf, max_dev) != Csum(LittleEndian::read_u32(&buf[CSUM_OFFSET..])) {
        bail!(ErrorKind::ChecksumMismatch(dev.to_owned()));
    }
    let sb = Sb1::decode(buf);
    if sb.data_size < 10 {
        bail!(ErrorKind::SizeTooSmall(dev.to_owned()));
    }
    // Non-zero padding might be a feature we do not know.
    if sb.pad0 != 0 || sb.pad3.iter().any(|&b| b != 0) {
        bail!(ErrorKind::InvalidLayout(dev.to_owned(), "non-zero padding"));
    }
    Ok(sb)
}

fn is_spare(sb: &Sb1, desc_nr: Option<u32>) -> bool {
    match sb.role(desc_nr) {
        Some(role) => !(role < ROLE_MAX || role == ROLE_JOURNAL),
        None => true,
    }
}

pub(super) fn load_super(dev: &mut MemberDevice, reference: Option<&Superblock>, minor: u32) -> Result<Freshness> {
    let name = dev.name().to_owned();
    let size = dev.device_size();
    let sb_start = match sb_offset(size, minor) {
        Some(s) => s,
        None if minor > 2 => bail!(ErrorKind::UnsupportedVersion(name, 1, minor)),
        None => bail!(ErrorKind::SizeTooSmall(name)),
    };
    if sb_start + Sectors::from_bytes(READ_BYTES as u64) > size {
        bail!(ErrorKind::SizeTooSmall(name));
    }
    dev.sb_start = sb_start;
    let buf = read_image(&*dev.bdev, sb_start, READ_BYTES)?;
    let sb = parse(&buf, minor, &name)?;
    if sb.super_offset != sb_start.as_u64() {
        bail!(ErrorKind::InvalidLayout(name, "superblock not at its recorded offset"));
    }

    dev.preferred_minor = None;
    dev.data_offset = Sectors(sb.data_offset);
    dev.new_data_offset = dev.data_offset;
    if sb.has_feature(FEATURE_RESHAPE_ACTIVE) && sb.has_feature(FEATURE_NEW_OFFSET) {
        let shifted = sb.data_offset as i64 + i64::from(sb.new_offset as i32);
        dev.new_data_offset = Sectors(shifted.max(0) as u64);
    }
    dev.corrected_errors = sb.cnt_corrected_read;
    dev.sb_size = round_to_block(sb.sb_bytes(), dev.bdev.logical_block_size());
    let sb_end = sb_start + Sectors((dev.sb_size / 512) as u64);
    if minor != 0 && (dev.data_offset < sb_end || dev.new_data_offset < sb_end) {
        bail!(ErrorKind::InvalidLayout(name, "data overlaps superblock"));
    }
    dev.desc_nr = if sb.level == LEVEL_MULTIPATH {
        None
    } else {
        Some(sb.dev_number)
    };

    let spare = is_spare(&sb, dev.desc_nr);
    let freshness = match reference {
        None if spare => Freshness::Older,
        None => Freshness::Newer,
        Some(Superblock::V1(refsb)) => {
            if !same_array(&sb, refsb) {
                warn!("md: {} has strangely different superblock", name);
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

    let available = if minor != 0 {
        size.saturating_sub(dev.data_offset)
    } else {
        sb_start
    };
    if available < Sectors(sb.data_size) {
        bail!(ErrorKind::SizeTooSmall(name));
    }
    dev.sectors = Sectors(sb.data_size);
    dev.sb = Some(Superblock::V1(Box::new(sb)));
    dev.sb_image = Some(buf);
    dev.sb_state = SbState::Clean;
    Ok(freshness)
}

pub(super) fn validate(meta: &mut ArrayMeta, dev: &mut MemberDevice, mode: ValidateMode) -> Result<()> {
    let sb = match dev.sb {
        Some(Superblock::V1(ref sb)) => sb.clone(),
        _ => bail!(ErrorKind::Incompatible(dev.name().to_owned())),
    };
    let events = sb.events;
    dev.raid_disk = None;
    dev.flags.remove(DevFlags::FAULTY);
    dev.flags.remove(DevFlags::IN_SYNC);
    dev.flags.remove(DevFlags::BITMAP_SYNC);
    dev.flags.remove(DevFlags::WRITE_MOSTLY);

    if meta.raid_disks == 0 {
        let minor = meta.minor_version().unwrap_or(2);
        meta.metadata = Metadata::Persistent { major: 1, minor };
        meta.patch_version = 0;
        meta.chunk_sectors = sb.chunksize;
        meta.ctime = sb.ctime;
        meta.utime = sb.utime;
        meta.level = sb.level;
        meta.clevel.clear();
        meta.layout = sb.layout;
        meta.raid_disks = sb.raid_disks;
        meta.dev_sectors = Sectors(sb.size);
        meta.events = events;
        meta.bitmap = None;
        meta.reshape_backwards = false;
        meta.recovery_cp = Sectors(sb.resync_offset);
        meta.uuid = sb.set_uuid;
        meta.set_name = sb.set_name;
        meta.max_disks = MAX_DEVS;
        if sb.has_feature(FEATURE_BITMAP_OFFSET) {
            meta.bitmap = Some(Bitmap {
                offset: sb.bitmap_offset as i32,
                events_cleared: 0,
            });
        }
        if sb.has_feature(FEATURE_RESHAPE_ACTIVE) {
            meta.reshape_position = Sectors(sb.reshape_position);
            meta.delta_disks = sb.delta_disks;
            meta.new_level = sb.new_level;
            meta.new_layout = sb.new_layout;
            meta.new_chunk_sectors = sb.new_chunk;
            if meta.delta_disks < 0
                || (meta.delta_disks == 0 && sb.has_feature(FEATURE_RESHAPE_BACKWARDS))
            {
                meta.reshape_backwards = true;
            }
        } else {
            meta.reshape_position = MAX_SECTOR;
            meta.delta_disks = 0;
            meta.new_level = meta.level;
            meta.new_layout = meta.layout;
            meta.new_chunk_sectors = meta.chunk_sectors;
        }
        if meta.level == 0 && !sb.has_feature(FEATURE_RAID0_LAYOUT) {
            meta.layout = !0;
        }
    } else if !mode.running {
        // Insist on a good event counter while assembling, except for spares.
        if !is_spare(&sb, dev.desc_nr) && events + 1 < meta.events {
            bail!(ErrorKind::NonFresh(dev.name().to_owned(), events, meta.events));
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
        let role = match sb.role(dev.desc_nr) {
            Some(role) => role,
            None => {
                dev.desc_nr = None;
                ROLE_SPARE
            }
        };
        match role {
            ROLE_SPARE | ROLE_JOURNAL => {}
            ROLE_FAULTY => dev.flags.insert(DevFlags::FAULTY),
            slot => {
                dev.saved_raid_disk = Some(u32::from(slot));
                if sb.has_feature(FEATURE_RECOVERY_OFFSET) {
                    dev.recovery_offset = Sectors(sb.recovery_offset);
                    if !sb.has_feature(FEATURE_RECOVERY_BITMAP) {
                        dev.saved_raid_disk = None;
                    }
                } else if !mode.frozen {
                    // A frozen array cannot have this device in sync.
                    dev.flags.insert(DevFlags::IN_SYNC);
                }
                dev.raid_disk = Some(u32::from(slot));
            }
        }
        if sb.devflags & DEVFLAG_WRITE_MOSTLY != 0 {
            dev.flags.insert(DevFlags::WRITE_MOSTLY);
        }
    } else {
        dev.flags.insert(DevFlags::IN_SYNC);
    }
    Ok(())
}

fn fresh_sb(meta: &ArrayMeta, dev: &MemberDevice) -> Sb1 {
    let mut device_uuid = meta.uuid;
    for (b, x) in device_uuid
        .iter_mut()
        .zip(dev.dev.major.to_le_bytes().iter().chain(dev.dev.minor.to_le_bytes().iter()))
    {
        *b ^= *x ^ 0xa5;
    }
    Sb1 {
        set_uuid: meta.uuid,
        set_name: meta.set_name,
        ctime: meta.ctime,
        device_uuid,
        ..Default::default()
    }
}

pub(super) fn sync(meta: &mut ArrayMeta, in_sync: bool, disks: &mut [MemberDevice], idx: usize) {
    let needed_max_dev = disks
        .iter()
        .filter_map(|d| d.desc_nr)
        .map(|nr| nr + 1)
        .max()
        .unwrap_or(0)
        .min(MAX_DEVS);

    let dev = &disks[idx];
    let mut sb = match dev.sb {
        Some(Superblock::V1(ref sb)) => (**sb).clone(),
        _ => fresh_sb(meta, dev),
    };
    sb.feature_map = 0;
    sb.pad0 = 0;
    sb.recovery_offset = 0;
    sb.pad3 = [0; 32];
    sb.utime = meta.utime;
    sb.events = meta.events;
    sb.resync_offset = if in_sync {
        meta.recovery_cp.as_u64()
    } else {
        0
    };
    sb.cnt_corrected_read = dev.corrected_errors;
    sb.raid_disks = meta.raid_disks;
    sb.size = meta.dev_sectors.as_u64();
    sb.chunksize = meta.chunk_sectors;
    sb.level = meta.level;
    sb.layout = meta.layout;
    if let Some(nr) = dev.desc_nr {
        sb.dev_number = nr;
    }
    sb.super_offset = dev.sb_start.as_u64();
    if dev.flags.contains(DevFlags::WRITE_MOSTLY) {
        sb.devflags |= DEVFLAG_WRITE_MOSTLY;
    } else {
        sb.devflags &= !DEVFLAG_WRITE_MOSTLY;
    }
    sb.data_offset = dev.data_offset.as_u64();
    sb.data_size = dev.sectors.as_u64();

    if let Some(bitmap) = meta.bitmap {
        sb.bitmap_offset = bitmap.offset as u32;
        sb.feature_map = FEATURE_BITMAP_OFFSET;
    }
    if dev.raid_disk.is_some() && !dev.flags.contains(DevFlags::IN_SYNC) {
        sb.feature_map |= FEATURE_RECOVERY_OFFSET;
        sb.recovery_offset = dev.recovery_offset.as_u64();
        if dev.saved_raid_disk.is_some() && meta.bitmap.is_some() {
            sb.feature_map |= FEATURE_RECOVERY_BITMAP;
        }
    }
    if meta.reshape_pending() {
        sb.feature_map |= FEATURE_RESHAPE_ACTIVE;
        sb.reshape_position = meta.reshape_position.as_u64();
        sb.new_layout = meta.new_layout;
        sb.delta_disks = meta.delta_disks;
        sb.new_level = meta.new_level;
        sb.new_chunk = meta.new_chunk_sectors;
        if meta.delta_disks == 0 && meta.reshape_backwards {
            sb.feature_map |= FEATURE_RESHAPE_BACKWARDS;
        }
        if dev.new_data_offset != dev.data_offset {
            sb.feature_map |= FEATURE_NEW_OFFSET;
            sb.new_offset = (dev.new_data_offset.as_u64() as i64 - dev.data_offset.as_u64() as i64) as u32;
        }
    }

    let mut sb_size = dev.sb_size;
    if needed_max_dev > sb.max_dev {
        sb.max_dev = needed_max_dev;
        sb_size = round_to_block(sb.sb_bytes(), dev.bdev.logical_block_size());
    }
    sb_size = sb_size.max(round_to_block(sb.sb_bytes(), dev.bdev.logical_block_size()));

    let mut roles = vec![ROLE_FAULTY; sb.max_dev as usize];
    for other in disks.iter() {
        let i = match other.desc_nr {
            Some(i) if i < sb.max_dev => i as usize,
            _ => continue,
        };
        roles[i] = if other.flags.contains(DevFlags::FAULTY) {
            ROLE_FAULTY
        } else if let Some(slot) = other.raid_disk {
            slot as u16
        } else {
            ROLE_SPARE
        };
    }
    sb.dev_roles = roles;

    let image = sb.seal(sb_size);
    let dev = &mut disks[idx];
    dev.sb_size = sb_size;
    dev.sb = Some(Superblock::V1(Box::new(sb)));
    dev.sb_image = Some(image);
    dev.sb_state = SbState::Dirty;
}

/// Bitmap space reserved in front of a 1.0 superblock.
fn choose_bm_space(dev_size: Sectors) -> Sectors {
    // 4 KiB normally, 64 KiB above 8 GiB, 128 KiB above 200 GiB.
    if dev_size < Sectors(64 * 2) {
        Sectors(0)
    } else if dev_size - Sectors(64 * 2) >= Sectors(200 * 1024 * 1024 * 2) {
        Sectors(128 * 2)
    } else if dev_size - Sectors(4 * 2) > Sectors(8 * 1024 * 1024 * 2) {
        Sectors(64 * 2)
    } else {
        Sectors(4 * 2)
    }
}

pub(super) fn rdev_size_change(meta: &ArrayMeta, dev: &mut MemberDevice, num_sectors: Sectors) -> Result<Sectors> {
    let name = dev.name().to_owned();
    if dev.data_offset != dev.new_data_offset {
        bail!(ErrorKind::ResizeRefused(name));
    }
    let dev_size = dev.device_size();
    let mut sectors = num_sectors;
    if dev.sb_start < dev.data_offset {
        // 1.1 and 1.2: superblock before the data.
        let max_sectors = dev_size.saturating_sub(dev.data_offset);
        if sectors == Sectors(0) || sectors > max_sectors {
            sectors = max_sectors;
        }
    } else if meta.bitmap.is_some() {
        // 1.0 with a bitmap that cannot move.
        bail!(ErrorKind::ResizeRefused(name));
    } else {
        // 1.0: superblock after the data, then bitmap and bad block space.
        let sb_start = match sb_offset(dev_size, 0) {
            Some(s) => s,
            None => bail!(ErrorKind::SizeTooSmall(name)),
        };
        let reserved = choose_bm_space(dev_size) + Sectors(4 * 2);
        let max_sectors = sb_start.saturating_sub(reserved);
        if sectors == Sectors(0) || sectors > max_sectors {
            sectors = max_sectors;
        }
        dev.sb_start = sb_start;
    }
    let sb_start = dev.sb_start;
    let sb_size = dev.sb_size;
    if let Some(Superblock::V1(ref mut sb)) = dev.sb {
        sb.data_size = sectors.as_u64();
        sb.super_offset = sb_start.as_u64();
        dev.sb_image = Some(sb.seal(sb_size));
    }
    Ok(sectors)
}

#[cfg(test)]
mod tests {
    use super::super::{compare, write_image, Format};
    use super::*;
    use crate::blockdev::test::{init_logging, FailingDevice};
    use crate::blockdev::DevId;
    use quickcheck::TestResult;

    fn raid5_meta(minor: u32) -> ArrayMeta {
        let mut meta = ArrayMeta::new(0);
        meta.metadata = Metadata::Persistent { major: 1, minor };
        meta.level = 5;
        meta.layout = 2;
        meta.raid_disks = 3;
        meta.chunk_sectors = 1024;
        meta.dev_sectors = Sectors(2048);
        meta.uuid = *b"0123456789abcdef";
        meta.set_name[..4].copy_from_slice(b"test");
        meta.events = 7;
        meta.recovery_cp = MAX_SECTOR;
        meta.max_disks = MAX_DEVS;
        meta
    }

    fn members(minor: u32, n: u32, size: Sectors) -> (Vec<FailingDevice>, Vec<MemberDevice>) {
        let devs: Vec<_> = (0..n)
            .map(|i| FailingDevice::new(size, DevId::new(8, 16 * i)))
            .collect();
        let members = devs
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let mut m = MemberDevice::new(d.boxed());
                m.raid_disk = Some(i as u32);
                m.desc_nr = Some(i as u32);
                m.flags.insert(DevFlags::IN_SYNC);
                m.sb_start = sb_offset(size, minor).unwrap();
                m.data_offset = if minor == 0 { Sectors(0) } else { Sectors(2048) };
                m.new_data_offset = m.data_offset;
                m.sectors = Sectors(2048);
                m
            })
            .collect();
        (devs, members)
    }

    #[test]
    fn placement() {
        assert_eq!(sb_offset(Sectors(10_000), 0), Some(Sectors(9984)));
        assert_eq!(sb_offset(Sectors(10_000), 1), Some(Sectors(0)));
        assert_eq!(sb_offset(Sectors(10_000), 2), Some(Sectors(8)));
        assert_eq!(sb_offset(Sectors(10_000), 3), None);
        assert_eq!(sb_offset(Sectors(8), 0), None);
    }

    #[test]
    fn sync_write_load_validate() {
        init_logging();
        for &minor in &[0, 1, 2] {
            let mut meta = raid5_meta(minor);
            let (devs, mut disks) = members(minor, 3, Sectors(8192));
            for i in 0..3 {
                sync(&mut meta, true, &mut disks, i);
                write_image(&mut disks[i]).unwrap();
            }
            let mut loaded = MemberDevice::new(devs[2].boxed());
            let freshness = Format::V1.load_super(&mut loaded, None, minor).unwrap();
            assert_eq!(freshness, Freshness::Newer);
            assert_eq!(loaded.desc_nr, Some(2));
            assert_eq!(loaded.sectors, Sectors(2048));
            assert_eq!(loaded.data_offset, disks[2].data_offset);
            assert_eq!(loaded.sb_size, 512);

            let mut array = ArrayMeta::new(1);
            array.metadata = Metadata::Persistent { major: 1, minor };
            Format::V1
                .validate(&mut array, &mut loaded, ValidateMode::default())
                .unwrap();
            assert_eq!(array.level, 5);
            assert_eq!(array.layout, 2);
            assert_eq!(array.raid_disks, 3);
            assert_eq!(array.chunk_sectors, 1024);
            assert_eq!(array.dev_sectors, Sectors(2048));
            assert_eq!(array.events, 7);
            assert_eq!(array.uuid, meta.uuid);
            assert_eq!(array.set_name, meta.set_name);
            assert_eq!(array.recovery_cp, MAX_SECTOR);
            assert!(!array.reshape_pending());
            assert_eq!(loaded.raid_disk, Some(2));
            assert!(loaded.is_in_sync());
        }
    }

    #[test]
    fn roles_and_growth_of_max_dev() {
        let mut meta = raid5_meta(2);
        let (_devs, mut disks) = members(2, 3, Sectors(8192));
        disks[1].flags.insert(DevFlags::FAULTY);
        disks[2].raid_disk = None;
        disks[2].flags.remove(DevFlags::IN_SYNC);
        disks[2].desc_nr = Some(300);
        sync(&mut meta, true, &mut disks, 0);
        let sb = match disks[0].sb {
            Some(Superblock::V1(ref sb)) => sb.clone(),
            _ => panic!("no superblock"),
        };
        assert_eq!(sb.max_dev, 301);
        // 256 + 602 bytes rounded to the sector size.
        assert_eq!(disks[0].sb_size, 1024);
        assert_eq!(sb.dev_roles[0], 0);
        assert_eq!(sb.dev_roles[1], ROLE_FAULTY);
        assert_eq!(sb.dev_roles[2], ROLE_FAULTY);
        assert_eq!(sb.dev_roles[300], ROLE_SPARE);
        let parsed = parse(disks[0].sb_image.as_ref().unwrap(), 2, "test").unwrap();
        assert_eq!(parsed, *sb);
    }

    #[test]
    fn recovering_device_records_offset() {
        let mut meta = raid5_meta(1);
        let (_devs, mut disks) = members(1, 3, Sectors(8192));
        disks[1].flags.remove(DevFlags::IN_SYNC);
        disks[1].recovery_offset = Sectors(640);
        sync(&mut meta, false, &mut disks, 1);
        let sb = parse(disks[1].sb_image.as_ref().unwrap(), 1, "test").unwrap();
        assert!(sb.has_feature(FEATURE_RECOVERY_OFFSET));
        assert_eq!(sb.recovery_offset, 640);
        assert_eq!(sb.resync_offset, 0);

        let mut array = raid5_meta(1);
        disks[1].sb = Some(Superblock::V1(Box::new(sb)));
        validate(&mut array, &mut disks[1], ValidateMode::default()).unwrap();
        assert_eq!(disks[1].raid_disk, Some(1));
        assert_eq!(disks[1].recovery_offset, Sectors(640));
        assert!(!disks[1].is_in_sync());
    }

    #[test]
    fn frozen_array_keeps_devices_out_of_sync() {
        let mut meta = raid5_meta(2);
        let (_devs, mut disks) = members(2, 3, Sectors(8192));
        sync(&mut meta, true, &mut disks, 0);
        let mut array = ArrayMeta::new(0);
        let mode = ValidateMode {
            running: false,
            frozen: true,
        };
        validate(&mut array, &mut disks[0], mode).unwrap();
        assert_eq!(disks[0].raid_disk, Some(0));
        assert!(!disks[0].is_in_sync());
    }

    #[test]
    fn reshape_fields() {
        let mut meta = raid5_meta(2);
        meta.reshape_position = Sectors(4096);
        meta.delta_disks = 1;
        meta.new_level = 6;
        meta.new_layout = 18;
        meta.new_chunk_sectors = 512;
        let (_devs, mut disks) = members(2, 3, Sectors(8192));
        disks[0].new_data_offset = Sectors(1024);
        sync(&mut meta, true, &mut disks, 0);
        let sb = parse(disks[0].sb_image.as_ref().unwrap(), 2, "test").unwrap();
        assert!(sb.has_feature(FEATURE_RESHAPE_ACTIVE));
        assert!(sb.has_feature(FEATURE_NEW_OFFSET));
        assert_eq!(sb.new_offset as i32, -1024);
        assert_eq!(sb.reshape_position, 4096);

        let mut array = ArrayMeta::new(0);
        disks[0].sb = Some(Superblock::V1(Box::new(sb)));
        validate(&mut array, &mut disks[0], ValidateMode::default()).unwrap();
        assert_eq!(array.reshape_position, Sectors(4096));
        assert_eq!(array.delta_disks, 1);
        assert_eq!(array.new_level, 6);
        assert_eq!(array.new_chunk_sectors, 512);
        assert!(!array.reshape_backwards);
    }

    #[quickcheck]
    fn single_bit_flip_is_detected(events: u64, bit: u16) -> TestResult {
        let mut meta = raid5_meta(2);
        meta.events = events;
        let (_devs, mut disks) = members(2, 3, Sectors(8192));
        sync(&mut meta, true, &mut disks, 0);
        let mut image = disks[0].sb_image.clone().unwrap().to_vec();
        let covered = HEADER_BYTES + 2 * 3;
        let bit = bit as usize % (covered * 8);
        image[bit / 8] ^= 1 << (bit % 8);
        TestResult::from_bool(parse(&image, 2, "test").is_err())
    }

    #[test]
    fn unknown_features_and_padding_are_rejected() {
        let mut meta = raid5_meta(2);
        let (_devs, mut disks) = members(2, 1, Sectors(8192));
        sync(&mut meta, true, &mut disks, 0);
        let mut sb = match disks[0].sb {
            Some(Superblock::V1(ref sb)) => (**sb).clone(),
            _ => panic!("no superblock"),
        };
        sb.feature_map |= 1 << 20;
        let image = sb.seal(512);
        assert!(parse(&image, 2, "test").is_err());

        sb.feature_map = 0;
        sb.pad3[7] = 1;
        let image = sb.seal(512);
        match parse(&image, 2, "test") {
            Err(Error(ErrorKind::InvalidLayout(_, _), _)) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn compare_requires_same_geometry() {
        let mut meta = raid5_meta(2);
        let (_devs, mut disks) = members(2, 1, Sectors(8192));
        sync(&mut meta, true, &mut disks, 0);
        let a = disks[0].sb.clone().unwrap();
        meta.events += 1;
        sync(&mut meta, true, &mut disks, 0);
        let b = disks[0].sb.clone().unwrap();
        assert_eq!(compare(&b, &a), Freshness::Newer);
        assert_eq!(compare(&a, &b), Freshness::Older);
        meta.layout = 3;
        sync(&mut meta, true, &mut disks, 0);
        let c = disks[0].sb.clone().unwrap();
        assert_eq!(compare(&c, &a), Freshness::Incompatible);
    }

    #[test]
    fn data_overlapping_superblock_is_rejected() {
        let mut meta = raid5_meta(1);
        let (devs, mut disks) = members(1, 1, Sectors(8192));
        disks[0].data_offset = Sectors(0);
        disks[0].new_data_offset = Sectors(0);
        sync(&mut meta, true, &mut disks, 0);
        write_image(&mut disks[0]).unwrap();
        let mut loaded = MemberDevice::new(devs[0].boxed());
        assert!(Format::V1.load_super(&mut loaded, None, 1).is_err());
    }

    #[test]
    fn load_against_reference() {
        let mut meta = raid5_meta(2);
        let (devs, mut disks) = members(2, 2, Sectors(8192));
        sync(&mut meta, true, &mut disks, 0);
        write_image(&mut disks[0]).unwrap();
        meta.events = 9;
        sync(&mut meta, true, &mut disks, 1);
        write_image(&mut disks[1]).unwrap();

        let mut first = MemberDevice::new(devs[0].boxed());
        Format::V1.load_super(&mut first, None, 2).unwrap();
        let mut second = MemberDevice::new(devs[1].boxed());
        let freshness = Format::V1
            .load_super(&mut second, first.superblock(), 2)
            .unwrap();
        assert_eq!(freshness, Freshness::Newer);
        let freshness = Format::V1
            .load_super(&mut first, second.superblock(), 2)
            .unwrap();
        assert_eq!(freshness, Freshness::Older);
    }

    #[test]
    fn size_change_by_placement() {
        let meta = raid5_meta(2);
        let (_devs, mut disks) = members(2, 1, Sectors(8192));
        let s = rdev_size_change(&meta, &mut disks[0], Sectors(0)).unwrap();
        assert_eq!(s, Sectors(8192 - 2048));

        let meta = raid5_meta(0);
        let (_devs, mut disks) = members(0, 1, Sectors(8192));
        let s = rdev_size_change(&meta, &mut disks[0], Sectors(0)).unwrap();
        // sb at 8176, 4 KiB bitmap and 4 KiB bad block space in front.
        assert_eq!(disks[0].sb_start, Sectors(8176));
        assert_eq!(s, Sectors(8176 - 16));

        let mut with_bitmap = raid5_meta(0);
        with_bitmap.bitmap = Some(Bitmap {
            offset: -16,
            events_cleared: 0,
        });
        assert!(rdev_size_change(&with_bitmap, &mut disks[0], Sectors(0)).is_err());

        disks[0].new_data_offset = Sectors(8);
        assert!(rdev_size_change(&meta, &mut disks[0], Sectors(0)).is_err());
    }

    #[test]
    fn bm_space() {
        assert_eq!(choose_bm_space(Sectors(100)), Sectors(0));
        assert_eq!(choose_bm_space(Sectors(1 << 20)), Sectors(8));
        assert_eq!(choose_bm_space(Sectors(20 << 21)), Sectors(128));
        assert_eq!(choose_bm_space(Sectors(300 << 21)), Sectors(256));
    }
}
