//! This module provides the `Personality` trait implemented by RAID levels
//! and the table personalities are registered in.
//!
//! Personalities are compiled in and registered at start up. Arrays look
//! them up by level number or by name.

use crate::array::{ArrayCore, ErrorKind, IoRequest, Result, SbFlags};
use crate::device::{DevFlags, DeviceInfo};
use crate::units::{Sectors, MAX_SECTOR};
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;


/// A RAID level implementation.
///
/// All methods except `sync_request` and `make_request` are called with
/// the reconfiguration lock of the array held.
pub trait Personality: Send + Sync {
    /// Name, e.g. `raid1`.
    fn name(&self) -> &'static str;

    /// Level number.
    fn level(&self) -> i32;

    /// Starts the personality on an assembled array.
    ///
    /// Must set the private data, `degraded` and the array size.
    fn run(&self, md: &mut ArrayCore) -> Result<()>;

    /// Stops the personality. The private data is handed to `free`
    /// afterwards.
    fn stop(&self, _md: &mut ArrayCore) {}

    /// Releases private data.
    fn free(&self, _md: &mut ArrayCore, _private: Box<dyn Any + Send>) {}

    /// Returns `true` if I/O can be quiesced. Required for level changes and
    /// suspend ranges.
    fn can_quiesce(&self) -> bool {
        false
    }

    /// Blocks (`true`) or resumes (`false`) internal I/O.
    fn quiesce(&self, _md: &mut ArrayCore, _quiesce: bool) {}

    /// Array size for the given component size and number of disks.
    ///
    /// Zero selects the current value.
    fn size(&self, md: &ArrayCore, sectors: Sectors, raid_disks: u32) -> Sectors;

    /// Returns `true` if the component size can change while running.
    fn can_resize(&self) -> bool {
        false
    }

    /// Changes the component size to `sectors`.
    fn resize(&self, _md: &mut ArrayCore, _sectors: Sectors) -> Result<()> {
        bail!(ErrorKind::InvalidArgument(format!("{} cannot resize", self.name())))
    }

    /// Returns `true` if geometry changes are supported.
    fn can_reshape(&self) -> bool {
        false
    }

    /// Checks the requested `new_*` fields and `delta_disks`.
    ///
    /// On error the caller reverts the request.
    fn check_reshape(&self, _md: &mut ArrayCore) -> Result<()> {
        bail!(ErrorKind::InvalidArgument(format!("{} cannot reshape", self.name())))
    }

    /// Prepares a reshape; the sync thread is started by the caller.
    fn start_reshape(&self, _md: &mut ArrayCore) -> Result<()> {
        bail!(ErrorKind::InvalidArgument(format!("{} cannot reshape", self.name())))
    }

    /// Called after a reshape ran to completion, before the new geometry is
    /// committed.
    fn finish_reshape(&self, _md: &mut ArrayCore) {}

    /// Takes over an array running a different personality.
    ///
    /// Sets the `new_*` fields of the array and returns new private data.
    /// Must not change anything on error.
    fn takeover(&self, _md: &mut ArrayCore) -> Result<Box<dyn Any + Send>> {
        bail!(ErrorKind::InvalidArgument(format!("{} does not support takeover", self.name())))
    }

    /// Gives the spare `md.disks()[idx]` a slot.
    fn hot_add_disk(&self, _md: &mut ArrayCore, _idx: usize) -> Result<()> {
        bail!(ErrorKind::InvalidArgument(format!("{} has no spare slots", self.name())))
    }

    /// Releases the slot of `md.disks()[idx]`.
    fn hot_remove_disk(&self, md: &mut ArrayCore, idx: usize) -> Result<()> {
        let dev = &md.disks()[idx];
        if dev.is_in_sync() && !dev.is_faulty() {
            bail!(ErrorKind::Busy(format!("{} is in use", dev.name())));
        }
        Ok(())
    }

    /// Marks recovered devices in sync. Returns their number.
    fn spare_active(&self, md: &mut ArrayCore) -> u32 {
        let mut count = 0;
        for idx in 0..md.disks().len() {
            let dev = md.disk_mut(idx);
            if dev.raid_disk().is_some()
                && !dev.is_faulty()
                && !dev.is_in_sync()
                && dev.recovery_offset() == MAX_SECTOR
            {
                dev.flags_mut().insert(DevFlags::IN_SYNC);
                count += 1;
            }
        }
        let meta = md.meta_mut();
        meta.degraded = meta.degraded.saturating_sub(count);
        count
    }

    /// Handles a failed device.
    fn error_handler(&self, md: &mut ArrayCore, idx: usize) {
        let was_in_sync = {
            let dev = md.disk_mut(idx);
            let in_sync = dev.is_in_sync();
            dev.flags_mut().remove(DevFlags::IN_SYNC);
            dev.flags_mut().insert(DevFlags::FAULTY);
            in_sync
        };
        if was_in_sync {
            md.meta_mut().degraded += 1;
        }
        md.set_sb_flags(SbFlags::CHANGE_DEVS | SbFlags::CHANGE_PENDING);
    }

    /// Returns `true` for levels with redundancy.
    fn has_sync_request(&self) -> bool {
        false
    }

    /// Synchronises from `sector` towards `max_sector`. Returns the number of
    /// sectors handled; zero ends the pass.
    fn sync_request(&self, _sector: Sectors, _max_sector: Sectors) -> Sectors {
        Sectors(0)
    }

    /// Maps a request onto the member devices.
    fn make_request(&self, devices: &[DeviceInfo], req: &IoRequest) -> Result<()>;
}

/// Registered personalities.
#[derive(Default)]
pub struct PersonalityTable {
    list: RwLock<Vec<Arc<dyn Personality>>>,
}

impl PersonalityTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers `pers`, replacing one of the same name.
    pub fn register(&self, pers: Arc<dyn Personality>) {
        info!("md: {} personality registered for level {}", pers.name(), pers.level());
        let mut list = self.list.write();
        list.retain(|p| p.name() != pers.name());
        list.push(pers);
    }

    /// Removes the personality called `name`.
    pub fn unregister(&self, name: &str) -> bool {
        let mut list = self.list.write();
        let len = list.len();
        list.retain(|p| p.name() != name);
        if list.len() != len {
            info!("md: {} personality unregistered", name);
            true
        } else {
            false
        }
    }

    /// Finds a personality by level, or by name if no level is given.
    pub fn find(&self, level: Option<i32>, name: &str) -> Option<Arc<dyn Personality>> {
        let list = self.list.read();
        list.iter()
            .find(|p| match level {
                Some(level) => p.level() == level,
                None => p.name() == name,
            })
            .cloned()
    }

    /// Names of all registered personalities.
    pub fn names(&self) -> Vec<&'static str> {
        self.list.read().iter().map(|p| p.name()).collect()
    }
}
