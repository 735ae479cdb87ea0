use super::Array;
use crate::blockdev::test::{FailingDevice, MemoryOpener};
use crate::blockdev::DevId;
use crate::context::MdContext;
use crate::device::{DevFlags, MemberDevice};
use crate::meta::{ArrayMeta, Metadata};
use crate::personality::test::MockPersonality;
use crate::superblock::{v1, write_image, Format};
use crate::units::{Sectors, MAX_SECTOR};
use std::sync::Arc;

/// A context with the mock personalities registered.
pub fn context() -> (MdContext, Arc<MemoryOpener>) {
    let opener = Arc::new(MemoryOpener::default());
    let ctx = MdContext::new(opener.clone());
    ctx.register_personality(Arc::new(MockPersonality::linear()));
    ctx.register_personality(Arc::new(MockPersonality::raid0()));
    ctx.register_personality(Arc::new(MockPersonality::raid1()));
    ctx.register_personality(Arc::new(MockPersonality::raid5()));
    (ctx, opener)
}

pub fn member(dev: &FailingDevice) -> MemberDevice {
    MemberDevice::new(dev.boxed())
}

/// Three device array of `level` with 1.`minor` metadata.
pub fn raid_meta(level: i32, minor: u32) -> ArrayMeta {
    let mut meta = ArrayMeta::new(0);
    meta.metadata = Metadata::Persistent { major: 1, minor };
    meta.level = level;
    meta.new_level = level;
    meta.layout = if level == 5 { 2 } else { 0 };
    meta.new_layout = meta.layout;
    meta.chunk_sectors = if level == 1 { 0 } else { 128 };
    meta.new_chunk_sectors = meta.chunk_sectors;
    meta.raid_disks = 3;
    meta.dev_sectors = Sectors(2048);
    meta.uuid = *b"0123456789abcdef";
    meta.set_name[..5].copy_from_slice(b"array");
    meta.events = 10;
    meta.recovery_cp = MAX_SECTOR;
    meta.max_disks = v1::MAX_DEVS;
    meta
}

/// Writes superblocks for `n` devices of `size` sectors. Devices beyond
/// `meta.raid_disks` become spares.
pub fn format_devices(meta: &ArrayMeta, n: u32, size: Sectors) -> Vec<FailingDevice> {
    let minor = meta.minor_version().unwrap_or(2);
    let mut meta = meta.clone();
    let devs: Vec<_> = (0..n)
        .map(|i| FailingDevice::new(size, DevId::new(8, 16 * i)))
        .collect();
    let mut disks: Vec<_> = devs
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let mut m = MemberDevice::new(d.boxed());
            m.desc_nr = Some(i as u32);
            if (i as u32) < meta.raid_disks {
                m.raid_disk = Some(i as u32);
                m.flags.insert(DevFlags::IN_SYNC);
            }
            m.sb_start = v1::sb_offset(size, minor).unwrap();
            m.data_offset = if minor == 0 { Sectors(0) } else { Sectors(2048) };
            m.new_data_offset = m.data_offset;
            m.sectors = meta.dev_sectors;
            m
        })
        .collect();
    for i in 0..disks.len() {
        Format::V1.sync(&mut meta, true, &mut disks, i);
        write_image(&mut disks[i]).unwrap();
    }
    devs
}

/// Assembles and runs an array from formatted devices.
pub fn assemble(ctx: &MdContext, unit: u32, devs: &[FailingDevice], minor: u32) -> Arc<Array> {
    let array = ctx.array(unit);
    {
        let mut md = array.lock();
        md.meta_mut().metadata = Metadata::Persistent { major: 1, minor };
        for d in devs {
            md.add_device(d.boxed()).unwrap();
        }
        md.run().unwrap();
    }
    array
}
