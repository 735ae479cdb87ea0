//! Geometry changes: reshape requests, component and array size changes and
//! the suspend window.
use super::{Array, ArrayCore, ErrorKind, Mode, Recovery, Result, SbFlags};
use crate::blockdev::DevId;
use crate::device::ranges_overlap;
use crate::personality::Personality;
use crate::superblock::Format;
use crate::units::{Sectors, MAX_SECTOR};
use std::sync::Arc;

/// A single geometry change.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReshapeChange {
    /// Change the number of active slots.
    RaidDisks(u32),
    /// Change the layout.
    Layout(u32),
    /// Change the chunk size, in sectors.
    ChunkSectors(u32),
}

impl ArrayCore {
    /// Requests a geometry change.
    ///
    /// An inactive array only records the new geometry. A running one asks
    /// the personality whether the change is possible; the reshape itself
    /// is started by `start_reshape` or by the recovery manager.
    pub fn reshape_request(&mut self, change: ReshapeChange) -> Result<()> {
        let pers = match self.personality() {
            Some(pers) => pers,
            None => {
                self.record_geometry(change);
                return Ok(());
            }
        };
        if self.disks.iter().any(|d| d.data_offset != d.new_data_offset) {
            bail!(ErrorKind::Busy("data offset is being changed".to_owned()));
        }
        if self.meta.reshape_pending() || self.meta.delta_disks != 0 {
            bail!(ErrorKind::Busy("reshape already pending".to_owned()));
        }
        if self.sync_thread.is_some() || self.shared.recovery.test(Recovery::RUNNING) {
            bail!(ErrorKind::Busy("sync in progress".to_owned()));
        }
        if !pers.can_reshape() {
            bail!(ErrorKind::InvalidArgument(format!("{} cannot reshape", pers.name())));
        }
        if self.mode() != Mode::ReadWrite {
            bail!(ErrorKind::ReadOnly(self.name.clone()));
        }

        match change {
            ReshapeChange::RaidDisks(n) => {
                if n == 0 || (self.meta.max_disks != 0 && n > self.meta.max_disks) {
                    bail!(ErrorKind::InvalidArgument(format!("{} devices", n)));
                }
                let delta = n as i32 - self.meta.raid_disks as i32;
                self.meta.delta_disks = delta;
                self.meta.reshape_backwards = delta < 0;
                if let Err(e) = pers.check_reshape(self) {
                    self.meta.delta_disks = 0;
                    self.meta.reshape_backwards = false;
                    return Err(e);
                }
            }
            ReshapeChange::Layout(layout) => {
                self.meta.new_layout = layout;
                if let Err(e) = pers.check_reshape(self) {
                    self.meta.new_layout = self.meta.layout;
                    return Err(e);
                }
            }
            ReshapeChange::ChunkSectors(chunk) => {
                self.meta.new_chunk_sectors = chunk;
                if let Err(e) = pers.check_reshape(self) {
                    self.meta.new_chunk_sectors = self.meta.chunk_sectors;
                    return Err(e);
                }
            }
        }
        self.set_sb_flags(SbFlags::CHANGE_DEVS);
        self.shared.recovery.set(Recovery::NEEDED);
        self.wake_daemon();
        info!("md: {}: reshape request {:?} accepted", self.name, change);
        Ok(())
    }

    fn record_geometry(&mut self, change: ReshapeChange) {
        let pending = self.meta.reshape_pending();
        let meta = &mut self.meta;
        match change {
            ReshapeChange::RaidDisks(n) => {
                if pending {
                    let old = meta.raid_disks as i32 - meta.delta_disks;
                    meta.delta_disks = n as i32 - old;
                    if meta.delta_disks != 0 {
                        meta.reshape_backwards = meta.delta_disks < 0;
                    }
                }
                meta.raid_disks = n;
            }
            ReshapeChange::Layout(layout) => {
                meta.new_layout = layout;
                if !pending {
                    meta.layout = layout;
                }
            }
            ReshapeChange::ChunkSectors(chunk) => {
                meta.new_chunk_sectors = chunk;
                if !pending {
                    meta.chunk_sectors = chunk;
                }
            }
        }
    }

    /// Starts the reshape recorded by `reshape_request`.
    pub fn start_reshape(&mut self) -> Result<()> {
        let pers = match self.personality() {
            Some(pers) => pers,
            None => bail!(ErrorKind::NotRunning),
        };
        if !pers.can_reshape() {
            bail!(ErrorKind::InvalidArgument(format!("{} cannot reshape", pers.name())));
        }
        let shared = Arc::clone(&self.shared);
        let r = &shared.recovery;
        if r.test(Recovery::RUNNING) || self.sync_thread.is_some() {
            bail!(ErrorKind::Busy("sync in progress".to_owned()));
        }
        if self.mode() == Mode::ReadOnly {
            bail!(ErrorKind::ReadOnly(self.name.clone()));
        }
        if self.mode() == Mode::ReadAuto {
            self.set_mode(Mode::ReadWrite);
        }

        if self.meta.reshape_pending() && pers.check_reshape(self).is_ok() {
            // Interrupted reshape, the recovery manager picks it up.
            r.clear(Recovery::FROZEN);
        } else {
            pers.start_reshape(self)?;
            r.clear(Recovery::SYNC | Recovery::CHECK | Recovery::REQUESTED | Recovery::RECOVER);
            r.set(Recovery::RESHAPE | Recovery::RUNNING);
            self.set_sb_flags(SbFlags::CHANGE_DEVS);
            if let Err(e) = self.start_sync_thread(Arc::clone(&pers)) {
                r.clear(Recovery::RESHAPE | Recovery::RUNNING);
                return Err(e);
            }
            info!(
                "md: {}: reshape to {} devices started",
                self.name, self.meta.raid_disks
            );
        }
        r.set(Recovery::NEEDED);
        self.wake_daemon();
        Ok(())
    }

    /// Makes the new geometry current once the reshape has finished.
    pub(crate) fn commit_reshape(&mut self, pers: &dyn Personality) {
        for dev in self.disks.iter_mut() {
            dev.data_offset = dev.new_data_offset;
        }
        let meta = &mut self.meta;
        meta.level = meta.new_level;
        meta.layout = meta.new_layout;
        meta.chunk_sectors = meta.new_chunk_sectors;
        meta.delta_disks = 0;
        meta.reshape_backwards = false;
        meta.reshape_position = MAX_SECTOR;
        let size = pers.size(self, Sectors(0), 0);
        self.set_array_sectors(size);
        self.set_sb_flags(SbFlags::CHANGE_DEVS);
        info!(
            "md: {}: reshape finished, {} devices, {} sectors",
            self.name,
            self.meta.raid_disks,
            self.meta.array_sectors.as_u64()
        );
    }

    /// Changes the component size.
    ///
    /// Zero asks for the largest size all member devices allow. An
    /// inactive array can only shrink.
    pub fn resize_array(&mut self, sectors: Sectors) -> Result<()> {
        let pers = match self.personality() {
            Some(pers) => pers,
            None => {
                if self.meta.dev_sectors == Sectors(0) || self.meta.dev_sectors > sectors {
                    self.meta.dev_sectors = sectors;
                    return Ok(());
                }
                bail!(ErrorKind::CapacityExceeded(format!(
                    "{} sectors on an inactive array",
                    sectors.as_u64()
                )));
            }
        };
        if self.shared.recovery.test(Recovery::RUNNING)
            || self.sync_thread.is_some()
            || self.meta.reshape_pending()
        {
            bail!(ErrorKind::Busy("sync in progress".to_owned()));
        }
        if self.mode() != Mode::ReadWrite {
            bail!(ErrorKind::ReadOnly(self.name.clone()));
        }

        let fit = sectors == Sectors(0);
        let mut num = sectors;
        for dev in self.disks.iter().filter(|d| d.raid_disk.is_some() && !d.is_faulty()) {
            let avail = dev.sectors;
            if fit && (num == Sectors(0) || num > avail) {
                num = avail;
            }
            if avail < num {
                bail!(ErrorKind::CapacityExceeded(format!(
                    "{} has only {} sectors",
                    dev.name(),
                    avail.as_u64()
                )));
            }
        }
        pers.resize(self, num)?;
        info!("md: {}: component size now {} sectors", self.name, num.as_u64());
        self.update_superblocks(true)
    }

    /// Sets the exported size. `None` returns to the size the personality
    /// computes.
    pub fn set_array_size(&mut self, size: Option<Sectors>) -> Result<()> {
        let pers = self.personality();
        let sectors = match size {
            None => {
                self.meta.external_size = false;
                match pers {
                    Some(pers) => pers.size(self, Sectors(0), 0),
                    None => self.meta.array_sectors,
                }
            }
            Some(sectors) => {
                if let Some(pers) = pers {
                    if pers.size(self, Sectors(0), 0) < sectors {
                        bail!(ErrorKind::CapacityExceeded(format!(
                            "array size {} beyond the devices",
                            sectors.as_u64()
                        )));
                    }
                }
                self.meta.external_size = true;
                sectors
            }
        };
        self.meta.array_sectors = sectors;
        Ok(())
    }

    /// Suspend window `[lo, hi)`.
    pub fn suspend_window(&self) -> (Sectors, Sectors) {
        self.shared.suspend.read()
    }

    /// Moves the start of the suspend window.
    pub fn set_suspend_lo(&mut self, lo: Sectors) {
        self.suspend();
        self.shared.suspend.lock_write().0 = lo;
        self.resume();
    }

    /// Moves the end of the suspend window.
    pub fn set_suspend_hi(&mut self, hi: Sectors) {
        self.suspend();
        self.shared.suspend.lock_write().1 = hi;
        self.resume();
    }

    /// Records where an interrupted reshape stopped. `None` means no
    /// reshape is in progress. Only for inactive arrays.
    pub fn set_reshape_position(&mut self, position: Option<Sectors>) -> Result<()> {
        if self.is_running() {
            bail!(ErrorKind::Busy(self.name.clone()));
        }
        let meta = &mut self.meta;
        meta.reshape_position = position.unwrap_or(MAX_SECTOR);
        meta.delta_disks = 0;
        meta.reshape_backwards = false;
        meta.clear_reshape_request();
        for dev in self.disks.iter_mut() {
            dev.new_data_offset = dev.data_offset;
        }
        Ok(())
    }

    /// Computes the new size of `disks()[idx]` for a requested size. Zero
    /// asks for the largest size possible.
    fn compute_device_size(&mut self, idx: usize, requested: Sectors) -> Result<Sectors> {
        let (active, avail) = {
            let dev = &self.disks[idx];
            if dev.data_offset != dev.new_data_offset {
                bail!(ErrorKind::Busy(format!("{}: data offset is changing", dev.name())));
            }
            (dev.raid_disk.is_some(), dev.device_size().saturating_sub(dev.data_offset))
        };
        let mut sectors = requested;
        if let (Some(pers), true) = (self.personality(), active) {
            if !pers.can_resize() {
                bail!(ErrorKind::InvalidArgument(format!("{} cannot resize", pers.name())));
            }
            if self.meta.persistent() {
                let (format, _) = Format::from_metadata(&self.meta.metadata)?;
                sectors = format.rdev_size_change(&self.meta, &mut self.disks[idx], requested)?;
            } else if sectors == Sectors(0) {
                sectors = avail;
            }
        }
        if sectors < self.meta.dev_sectors {
            bail!(ErrorKind::InvalidArgument(format!(
                "{} sectors is below the component size",
                sectors.as_u64()
            )));
        }
        Ok(sectors)
    }
}

impl Array {
    /// Changes the usable size of a member device.
    ///
    /// With external metadata a growing device is checked against all
    /// other arrays sharing the same block device; an overlap restores the
    /// old size.
    pub fn resize_device(&self, dev: DevId, requested: Sectors) -> Result<Sectors> {
        let (old, new, offset, external) = {
            let mut md = self.lock();
            let idx = match md.position(dev) {
                Some(idx) => idx,
                None => bail!(ErrorKind::NoSuchDevice(dev.to_string())),
            };
            let sectors = md.compute_device_size(idx, requested)?;
            let external = md.meta.external();
            let d = &mut md.disks[idx];
            let old = d.sectors;
            d.sectors = sectors;
            (old, sectors, d.data_offset, external)
        };
        if new <= old || !external {
            return Ok(new);
        }

        // Every array lock is taken on its own to avoid lock ordering
        // issues; the device is already resized.
        let mut overlap = false;
        if let Some(registry) = self.registry.upgrade() {
            for array in registry.arrays() {
                let md = array.lock();
                overlap = md.disks.iter().any(|d| {
                    d.dev == dev
                        && array.unit() != self.unit()
                        && ranges_overlap(offset, new, d.data_offset, d.sectors)
                });
                if overlap {
                    break;
                }
            }
        }
        if overlap {
            let mut md = self.lock();
            if let Some(idx) = md.position(dev) {
                md.disks[idx].sectors = old;
            }
            warn!("md: {}: {} would overlap another array", self.name, dev);
            bail!(ErrorKind::Overlap(dev.to_string()));
        }
        Ok(new)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test::{assemble, context, format_devices, raid_meta};
    use super::*;
    use crate::array::{ErrorClass, IoRequest, SyncAction};
    use crate::blockdev::test::{init_logging, FailingDevice};
    use crate::blockdev::BlockDevice;
    use crate::meta::Metadata;
    use crate::personality::test::MockPersonality;
    use quickcheck::TestResult;
    use std::time::Duration;

    #[test]
    fn raid5_grows_by_one_device() {
        init_logging();
        let (ctx, _) = context();
        let devs = format_devices(&raid_meta(5, 2), 4, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        {
            let mut md = array.lock();
            assert_eq!(md.meta().array_sectors, Sectors(2 * 2048));
            md.reshape_request(ReshapeChange::RaidDisks(4)).unwrap();
            assert_eq!(md.meta().delta_disks, 1);
            let err = md.reshape_request(ReshapeChange::RaidDisks(5)).unwrap_err();
            assert_eq!(err.class(), ErrorClass::Concurrency);
            md.set_sync_action(SyncAction::Reshape).unwrap();
            assert!(md.recovery().test(Recovery::RESHAPE));
        }
        array.wait_for_sync(Duration::from_secs(10)).unwrap();
        let md = array.lock();
        let meta = md.meta();
        assert_eq!(meta.raid_disks, 4);
        assert_eq!(meta.delta_disks, 0);
        assert!(!meta.reshape_pending());
        assert_eq!(meta.array_sectors, Sectors(3 * 2048));
        assert!(md.disks()[3].is_in_sync());
        assert_eq!(md.disks()[3].raid_disk(), Some(3));
    }

    #[test]
    fn rejected_layout_is_reverted() {
        let (ctx, _) = context();
        let devs = format_devices(&raid_meta(5, 2), 3, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        let mut md = array.lock();
        assert!(md.reshape_request(ReshapeChange::ChunkSectors(100)).is_err());
        assert_eq!(md.meta().new_chunk_sectors, 128);
        assert!(md.reshape_request(ReshapeChange::RaidDisks(0)).is_err());
        assert_eq!(md.meta().delta_disks, 0);
    }

    #[test]
    fn striping_cannot_reshape() {
        let (ctx, _) = context();
        let devs = format_devices(&raid_meta(0, 2), 3, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        let err = array.lock().reshape_request(ReshapeChange::RaidDisks(4)).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Invalid);
    }

    #[test]
    fn raid1_adds_a_mirror() {
        let (ctx, _) = context();
        let mut meta = raid_meta(1, 2);
        meta.raid_disks = 2;
        let devs = format_devices(&meta, 3, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        array.lock().reshape_request(ReshapeChange::RaidDisks(3)).unwrap();
        array.check_recovery();
        array.wait_for_sync(Duration::from_secs(10)).unwrap();
        let md = array.lock();
        assert_eq!(md.meta().raid_disks, 3);
        assert_eq!(md.disks()[2].raid_disk(), Some(2));
        assert!(md.disks()[2].is_in_sync());
    }

    #[test]
    fn inactive_geometry_is_recorded() {
        let (ctx, _) = context();
        let array = ctx.array(0);
        let mut md = array.lock();
        md.reshape_request(ReshapeChange::RaidDisks(4)).unwrap();
        md.reshape_request(ReshapeChange::Layout(2)).unwrap();
        assert_eq!(md.meta().raid_disks, 4);
        assert_eq!(md.meta().layout, 2);

        md.set_reshape_position(Some(Sectors(64))).unwrap();
        md.reshape_request(ReshapeChange::RaidDisks(5)).unwrap();
        assert_eq!(md.meta().delta_disks, 1);
        md.set_reshape_position(None).unwrap();
        assert!(!md.meta().reshape_pending());
        assert_eq!(md.meta().delta_disks, 0);
    }

    #[test]
    fn grow_component_size() {
        let (ctx, _) = context();
        let mut meta = raid_meta(1, 2);
        meta.raid_disks = 2;
        let devs = format_devices(&meta, 2, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        {
            let mut md = array.lock();
            for idx in 0..2 {
                md.disks[idx].sectors = Sectors(4096);
            }
            let err = md.resize_array(Sectors(5000)).unwrap_err();
            assert_eq!(err.class(), ErrorClass::Capacity);
            md.resize_array(Sectors(0)).unwrap();
            assert_eq!(md.meta().dev_sectors, Sectors(4096));
            assert_eq!(md.meta().recovery_cp, Sectors(2048));
        }
        array.check_recovery();
        array.wait_for_sync(Duration::from_secs(10)).unwrap();
        assert_eq!(array.lock().meta().recovery_cp, MAX_SECTOR);
    }

    #[test]
    fn inactive_array_only_shrinks() {
        let (ctx, _) = context();
        let array = ctx.array(0);
        let mut md = array.lock();
        md.resize_array(Sectors(4096)).unwrap();
        md.resize_array(Sectors(1024)).unwrap();
        let err = md.resize_array(Sectors(2048)).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Capacity);
        assert_eq!(md.meta().dev_sectors, Sectors(1024));
    }

    #[test]
    fn explicit_array_size() {
        let (ctx, _) = context();
        let devs = format_devices(&raid_meta(5, 2), 3, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        let mut md = array.lock();
        let err = md.set_array_size(Some(Sectors(5000))).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Capacity);
        md.set_array_size(Some(Sectors(1000))).unwrap();
        assert!(md.meta().external_size);
        md.set_array_sectors(Sectors(4096));
        assert_eq!(md.meta().array_sectors, Sectors(1000));
        md.set_array_size(None).unwrap();
        assert_eq!(md.meta().array_sectors, Sectors(4096));
    }

    #[test]
    fn suspended_range_blocks_writes() {
        let (ctx, _) = context();
        let devs = format_devices(&raid_meta(5, 2), 3, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        {
            let mut md = array.lock();
            md.set_suspend_hi(Sectors(100));
            md.set_suspend_lo(Sectors(50));
            assert_eq!(md.suspend_window(), (Sectors(50), Sectors(100)));
        }
        let w = array.shared.write.lock();
        assert!(array.shared.suspended(&w, &IoRequest::write(Sectors(60), Sectors(8))));
        assert!(!array.shared.suspended(&w, &IoRequest::write(Sectors(100), Sectors(8))));
        assert!(!array.shared.suspended(&w, &IoRequest::read(Sectors(60), Sectors(8))));
    }

    fn external_array(ctx: &crate::context::MdContext, unit: u32, dev: &FailingDevice, offset: u64) -> Arc<Array> {
        let array = ctx.array(unit);
        {
            let mut md = array.lock();
            md.meta_mut().metadata = Metadata::External("imsm".to_owned());
            let idx = md.add_device(dev.boxed()).unwrap();
            md.disks[idx].data_offset = Sectors(offset);
            md.disks[idx].new_data_offset = Sectors(offset);
            md.disks[idx].sectors = Sectors(1000);
        }
        array
    }

    #[test]
    fn growing_into_another_array_is_refused() {
        init_logging();
        let (ctx, _) = context();
        let dev = FailingDevice::new(Sectors(8192), DevId::new(8, 0));
        let first = external_array(&ctx, 0, &dev, 0);
        let _second = external_array(&ctx, 1, &dev, 2000);

        assert_eq!(first.resize_device(dev.dev_id(), Sectors(2000)).unwrap(), Sectors(2000));
        let err = first.resize_device(dev.dev_id(), Sectors(3000)).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Capacity);
        assert_eq!(first.lock().disks()[0].sectors(), Sectors(2000));

        let missing = first.resize_device(DevId::new(9, 9), Sectors(10)).unwrap_err();
        assert_eq!(missing.class(), ErrorClass::Invalid);
    }

    #[quickcheck]
    fn device_never_shrinks_below_component(request: u16) -> TestResult {
        let (ctx, _) = context();
        let mut meta = raid_meta(1, 2);
        meta.raid_disks = 2;
        let devs = format_devices(&meta, 2, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        match array.resize_device(devs[0].dev_id(), Sectors(u64::from(request))) {
            Ok(s) => TestResult::from_bool(s >= Sectors(2048) && s <= Sectors(8192 - 2048)),
            Err(_) => TestResult::from_bool(request != 0 && u64::from(request) < 2048),
        }
    }
}
