//! Keeping the superblocks of all members in step with the array.
use super::{ArrayCore, ErrorKind, Mode, Recovery, Result, SbFlags, IO_THREADS};
use crate::device::{DevFlags, SbState};
use crate::meta::LEVEL_MULTIPATH;
use crate::superblock::{self, Format, Freshness, Superblock, ValidateMode};
use crate::units::Sectors;
use parking_lot::Mutex;
use scoped_threadpool::Pool;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

impl ArrayCore {
    /// Assembles the array from the superblocks of the bound devices.
    ///
    /// The freshest superblock defines the array. Devices that cannot be
    /// read, belong to another array or are too old are unbound.
    pub fn analyze_superblocks(&mut self) -> Result<()> {
        let (format, minor) = Format::from_metadata(&self.meta.metadata)?;

        let mut freshest: Option<(crate::blockdev::DevId, Superblock)> = None;
        let mut idx = 0;
        while idx < self.disks.len() {
            let reference = freshest.as_ref().map(|(_, sb)| sb.clone());
            match format.load_super(&mut self.disks[idx], reference.as_ref(), minor) {
                Ok(Freshness::Newer) => {
                    if let Some(sb) = self.disks[idx].superblock() {
                        freshest = Some((self.disks[idx].dev, sb.clone()));
                    }
                    idx += 1;
                }
                Ok(_) => idx += 1,
                Err(e) => {
                    warn!(
                        "md: fatal superblock inconsistency in {} -- removing from array: {}",
                        self.disks[idx].name(),
                        e
                    );
                    self.kick(idx);
                }
            }
        }
        let freshest = match freshest {
            Some((dev, _)) => dev,
            None => {
                warn!("md: {}: cannot find a valid disk", self.name());
                bail!(ErrorKind::NoValidDevice(self.name().to_owned()));
            }
        };

        let mode = ValidateMode {
            running: false,
            frozen: self.shared.recovery.test(Recovery::FROZEN),
        };
        let first = self.position(freshest).unwrap_or(0);
        format.validate(&mut self.meta, &mut self.disks[first], mode)?;

        let mut i = 0;
        let mut multipath_nr = 0;
        while i < self.disks.len() {
            if let Some(nr) = self.disks[i].desc_nr {
                if self.meta.max_disks != 0 && nr >= self.meta.max_disks {
                    warn!(
                        "md: {}: {}: only {} devices permitted",
                        self.name(),
                        self.disks[i].name(),
                        self.meta.max_disks
                    );
                    self.kick(i);
                    continue;
                }
            }
            if self.disks[i].dev != freshest {
                if let Err(e) = format.validate(&mut self.meta, &mut self.disks[i], mode) {
                    warn!("md: kicking non-fresh {} from array: {}", self.disks[i].name(), e);
                    self.kick(i);
                    continue;
                }
            }
            let raid_disks = self.meta.raid_disks;
            let limit = raid_disks as i64 - i64::from(self.meta.delta_disks.min(0));
            let dev = &mut self.disks[i];
            if self.meta.level == LEVEL_MULTIPATH {
                dev.desc_nr = Some(multipath_nr);
                dev.raid_disk = Some(multipath_nr);
                dev.flags.insert(DevFlags::IN_SYNC);
                multipath_nr += 1;
            } else if dev.raid_disk.map_or(false, |slot| i64::from(slot) >= limit) {
                dev.raid_disk = None;
                dev.flags.remove(DevFlags::IN_SYNC);
            }
            i += 1;
        }
        Ok(())
    }

    /// Brings the superblocks of all members up to date.
    ///
    /// `force_change` marks a change of the device set. Otherwise the event
    /// counter may be rolled back for a clean/dirty transition so spares do
    /// not have to be written.
    pub fn update_superblocks(&mut self, force_change: bool) -> Result<()> {
        let mut force_change = force_change;
        if self.mode() != Mode::ReadWrite {
            if force_change {
                self.set_sb_flags(SbFlags::CHANGE_DEVS);
            }
            return Ok(());
        }

        loop {
            let completed = Sectors(self.shared.curr_resync_completed.load(Ordering::SeqCst));
            let recovery = &self.shared.recovery;
            if self.meta.delta_disks >= 0
                && recovery.test(Recovery::RUNNING)
                && recovery.test(Recovery::RECOVER)
                && !recovery.test(Recovery::RESHAPE)
            {
                for dev in self.disks.iter_mut() {
                    if dev.raid_disk.is_some()
                        && !dev.is_faulty()
                        && !dev.is_in_sync()
                        && completed > dev.recovery_offset
                    {
                        dev.recovery_offset = completed;
                    }
                }
            }

            if !self.meta.persistent() {
                let mut w = self.shared.write.lock();
                w.sb_flags.remove(SbFlags::CHANGE_CLEAN | SbFlags::CHANGE_DEVS);
                if !self.meta.external() {
                    w.sb_flags.remove(SbFlags::CHANGE_PENDING);
                }
                self.shared.sb_wait.notify_all();
                return Ok(());
            }

            let (in_sync, nospares) = {
                let mut w = self.shared.write.lock();
                self.meta.utime = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let had_devs = w.sb_flags.take(SbFlags::CHANGE_DEVS);
                let had_clean = w.sb_flags.take(SbFlags::CHANGE_CLEAN);
                if had_devs {
                    force_change = true;
                }
                let mut nospares = had_clean;
                if force_change || self.meta.degraded > 0 {
                    nospares = false;
                }
                let clean = w.in_sync && self.meta.recovery_cp.is_max();
                let events = self.meta.events;
                // A clean->dirty->clean cycle can go back one step so the
                // spares need not be written.
                let new_events = if nospares && clean && events & 1 == 1 && events != 1 {
                    events - 1
                } else {
                    let next = events.wrapping_add(1);
                    if clean == (next & 1 == 1) {
                        nospares = false;
                    }
                    next
                };
                if new_events == 0 {
                    w.sb_flags.set(SbFlags::CHANGE_DEVS, had_devs);
                    w.sb_flags.set(SbFlags::CHANGE_CLEAN, had_clean);
                    drop(w);
                    error!("md: {}: event counter wrapped", self.name());
                    bail!(ErrorKind::EventCounterWrapped(self.name().to_owned()));
                }
                self.meta.events = new_events;
                (w.in_sync, nospares)
            };

            for dev in self.disks.iter_mut() {
                if dev.is_faulty() {
                    dev.flags.insert(DevFlags::FAULT_RECORDED);
                }
            }
            self.sync_sbs(nospares, in_sync)?;
            debug!(
                "md: updating {} RAID superblock on device (in sync {})",
                self.name(),
                in_sync
            );

            for idx in self.write_superblocks() {
                self.md_error(idx);
            }

            let repeat = {
                let mut w = self.shared.write.lock();
                if !w.sb_flags.intersects(SbFlags::CHANGE_DEVS | SbFlags::CHANGE_CLEAN) {
                    w.sb_flags.remove(SbFlags::CHANGE_PENDING);
                }
                let repeat = w.in_sync != in_sync || w.sb_flags.contains(SbFlags::CHANGE_DEVS);
                if !repeat {
                    self.shared.sb_wait.notify_all();
                }
                repeat
            };
            if !repeat || self.mode() != Mode::ReadWrite {
                break;
            }
        }

        for dev in self.disks.iter_mut() {
            if dev.flags.contains(DevFlags::FAULT_RECORDED) {
                dev.flags.remove(DevFlags::FAULT_RECORDED | DevFlags::BLOCKED);
            }
        }
        Ok(())
    }

    /// Generates new superblock images for all devices that need one.
    fn sync_sbs(&mut self, nospares: bool, in_sync: bool) -> Result<()> {
        let (format, _) = Format::from_metadata(&self.meta.metadata)?;
        let events = self.meta.events;
        for idx in 0..self.disks.len() {
            let dev = &mut self.disks[idx];
            if dev.sb_events == events
                || (nospares && dev.raid_disk.is_none() && dev.sb_events.wrapping_add(1) == events)
            {
                // Don't update this superblock.
                if dev.sb_state == SbState::Dirty {
                    dev.sb_state = SbState::Clean;
                }
                continue;
            }
            format.sync(&mut self.meta, in_sync, &mut self.disks, idx);
        }
        Ok(())
    }

    /// Writes all dirty superblock images in parallel.
    ///
    /// Returns the indices of devices that failed.
    fn write_superblocks(&mut self) -> Vec<usize> {
        let events = self.meta.events;
        let multipath = self.meta.level == LEVEL_MULTIPATH;
        let mut targets = Vec::new();
        for (idx, dev) in self.disks.iter().enumerate() {
            if dev.sb_state != SbState::Dirty || dev.is_faulty() {
                continue;
            }
            targets.push(idx);
            if multipath {
                // Only need to write one superblock.
                break;
            }
        }
        if targets.is_empty() {
            return Vec::new();
        }

        let failed = Mutex::new(Vec::new());
        let pool = self.io_pool.get_or_insert_with(|| Pool::new(IO_THREADS));
        let disks = &mut self.disks;
        pool.scoped(|scope| {
            for (idx, dev) in disks.iter_mut().enumerate() {
                if !targets.contains(&idx) {
                    continue;
                }
                let failed = &failed;
                scope.execute(move || match superblock::write_image(dev) {
                    Ok(()) => dev.sb_events = events,
                    Err(e) => {
                        warn!("md: super_written gets error on {}: {}", dev.name(), e);
                        failed.lock().push(idx);
                    }
                });
            }
        });
        let mut failed = failed.into_inner();
        failed.sort();
        failed
    }
}
