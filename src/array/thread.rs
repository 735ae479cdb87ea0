//! Background threads and recovery management.
//!
//! Each running array may have a daemon thread which periodically calls
//! `check_recovery`, and at most one sync thread performing a resync,
//! recovery or reshape pass. The sync thread only talks to the personality
//! and the shared recovery bits; everything it leaves behind is cleaned up
//! by `check_recovery` under the reconfiguration lock.

use super::{Array, ArrayCore, ErrorKind, Mode, Recovery, Result, SbFlags, Shared};
use crate::device::DevFlags;
use crate::personality::Personality;
use crate::units::{Sectors, MAX_SECTOR};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the daemon sleeps without being woken.
const DAEMON_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_TIMEOUT: Duration = Duration::from_millis(10);

/// A named thread with a stop flag.
pub(crate) struct MdThread {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MdThread {
    pub(crate) fn spawn<F>(name: String, f: F) -> Result<MdThread>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || f(flag))?;
        debug!("md: {} started", name);
        Ok(MdThread {
            name,
            stop,
            handle: Some(handle),
        })
    }

    /// Asks the thread to stop and waits for it.
    pub(crate) fn stop(mut self, shared: &Shared) {
        self.stop.store(true, Ordering::SeqCst);
        shared.wake_daemon();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("md: {} panicked", self.name);
            }
        }
        debug!("md: {} stopped", self.name);
    }
}

impl Drop for MdThread {
    fn drop(&mut self) {
        // Detach; the thread notices the flag on its next wake up.
        self.stop.store(true, Ordering::SeqCst);
    }
}

pub(crate) fn daemon(array: Weak<Array>, shared: Arc<Shared>, stop: Arc<AtomicBool>) {
    let mut timeout = DAEMON_TIMEOUT;
    while !stop.load(Ordering::SeqCst) {
        shared.wait_event(timeout);
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let checked = match array.upgrade() {
            Some(array) => array.check_recovery_nowait(),
            None => break,
        };
        // Somebody holds the reconfiguration lock, try again soon.
        timeout = if checked { DAEMON_TIMEOUT } else { RETRY_TIMEOUT };
    }
}

fn sync_thread(shared: Arc<Shared>, pers: Arc<dyn Personality>, start: Sectors, end: Sectors) {
    let mut pos = start;
    while pos < end && !shared.recovery.test(Recovery::INTR) {
        let done = pers.sync_request(pos, end);
        if done == Sectors(0) {
            break;
        }
        pos = (pos + done).min(end);
        shared.curr_resync_completed.store(pos.as_u64(), Ordering::SeqCst);
    }
    if pos < end && !shared.recovery.test(Recovery::INTR) {
        // The personality gave up.
        shared.recovery.set(Recovery::INTR | Recovery::ERROR);
    }
    shared.recovery.set(Recovery::DONE);
    shared.wake_daemon();
}

/// Requested or running sync activity.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Nothing running.
    Idle,
    /// No recovery may be started.
    Frozen,
    /// Resync of the whole array.
    Resync,
    /// Rebuild of spares.
    Recover,
    /// Geometry change.
    Reshape,
    /// Read-only consistency check.
    Check,
    /// Check and fix.
    Repair,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            SyncAction::Idle => "idle",
            SyncAction::Frozen => "frozen",
            SyncAction::Resync => "resync",
            SyncAction::Recover => "recover",
            SyncAction::Reshape => "reshape",
            SyncAction::Check => "check",
            SyncAction::Repair => "repair",
        })
    }
}

impl FromStr for SyncAction {
    type Err = super::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim() {
            "idle" => SyncAction::Idle,
            "frozen" => SyncAction::Frozen,
            "resync" => SyncAction::Resync,
            "recover" => SyncAction::Recover,
            "reshape" => SyncAction::Reshape,
            "check" => SyncAction::Check,
            "repair" => SyncAction::Repair,
            other => bail!(ErrorKind::InvalidArgument(format!("unknown sync action {:?}", other))),
        })
    }
}

impl ArrayCore {
    /// Reports the current sync activity.
    pub fn sync_action(&self) -> SyncAction {
        let r = &self.shared.recovery;
        if r.test(Recovery::FROZEN) {
            SyncAction::Frozen
        } else if r.test(Recovery::RUNNING) || r.test(Recovery::NEEDED) {
            if r.test(Recovery::RESHAPE) {
                SyncAction::Reshape
            } else if r.test(Recovery::SYNC) {
                if !r.test(Recovery::REQUESTED) {
                    SyncAction::Resync
                } else if r.test(Recovery::CHECK) {
                    SyncAction::Check
                } else {
                    SyncAction::Repair
                }
            } else if r.test(Recovery::RECOVER) {
                SyncAction::Recover
            } else {
                SyncAction::Idle
            }
        } else {
            SyncAction::Idle
        }
    }

    /// Starts, stops or freezes sync activity.
    pub fn set_sync_action(&mut self, action: SyncAction) -> Result<()> {
        let pers = match self.personality() {
            Some(pers) if pers.has_sync_request() => pers,
            _ => bail!(ErrorKind::InvalidArgument(format!("{} cannot sync", self.name))),
        };
        let shared = Arc::clone(&self.shared);
        let r = &shared.recovery;
        match action {
            SyncAction::Idle | SyncAction::Frozen => {
                if action == SyncAction::Frozen {
                    r.set(Recovery::FROZEN);
                } else {
                    r.clear(Recovery::FROZEN);
                }
                self.stop_sync_thread();
            }
            _ if r.test(Recovery::RUNNING) => {
                bail!(ErrorKind::Busy("sync in progress".to_owned()));
            }
            SyncAction::Recover => {
                r.clear(Recovery::FROZEN);
                r.set(Recovery::RECOVER);
            }
            SyncAction::Reshape => {
                r.clear(Recovery::FROZEN);
                return self.start_reshape();
            }
            SyncAction::Resync => {
                r.clear(Recovery::FROZEN);
            }
            SyncAction::Check | SyncAction::Repair => {
                if action == SyncAction::Check {
                    r.set(Recovery::CHECK);
                }
                r.set(Recovery::REQUESTED | Recovery::SYNC);
                r.clear(Recovery::FROZEN);
            }
        }
        if self.mode() == Mode::ReadAuto {
            // A write to sync_action is enough to justify read-write.
            self.set_mode(Mode::ReadWrite);
        }
        self.shared.recovery.set(Recovery::NEEDED);
        self.wake_daemon();
        debug!("md: {}: sync_action {} ({})", self.name, action, pers.name());
        Ok(())
    }

    /// Handles a failed member device.
    pub fn md_error(&mut self, idx: usize) {
        if self.disks[idx].is_faulty() {
            return;
        }
        let pers = match self.personality() {
            Some(pers) => pers,
            None => return,
        };
        warn!("md: {}: {} failed", self.name, self.disks[idx].name());
        pers.error_handler(self, idx);
        if !pers.has_sync_request() || (self.meta.raid_disks > 0 && self.meta.degraded >= self.meta.raid_disks) {
            self.broken = true;
        }
        if self.meta.degraded > 0 && !self.broken {
            self.shared.recovery.set(Recovery::RECOVER);
        }
        self.shared.recovery.set(Recovery::INTR | Recovery::NEEDED);
        self.wake_daemon();
    }

    /// Interrupts and reaps a running sync thread.
    pub(crate) fn stop_sync_thread(&mut self) {
        if self.sync_thread.is_some() {
            self.shared.recovery.set(Recovery::INTR);
            self.reap_sync_thread();
        }
    }

    /// One pass of recovery management.
    ///
    /// Writes pending superblock changes, reaps a finished sync thread and
    /// decides whether a new sync pass is needed.
    pub fn check_recovery(&mut self) {
        let shared = Arc::clone(&self.shared);
        let r = &shared.recovery;
        if !self.is_running() {
            return;
        }

        if self.mode() != Mode::ReadWrite {
            // Only remove failed devices; nothing is written.
            if r.test(Recovery::NEEDED) && !r.test(Recovery::RUNNING) {
                self.remove_and_add_spares(None, true);
                r.clear(Recovery::NEEDED);
            }
            return;
        }

        let safemode = {
            let w = self.shared.write.lock();
            w.safemode && w.writes_pending == 0 && !w.in_sync && !self.meta.external()
        };
        let flags = self.sb_flags();
        if !(r.test(Recovery::NEEDED) || r.test(Recovery::DONE) || safemode || !flags.is_empty()) {
            return;
        }
        if safemode {
            self.shared.set_in_sync();
        }
        if !self.sb_flags().is_empty() {
            if let Err(e) = self.update_superblocks(false) {
                error!("md: {}: superblock update failed: {}", self.name, e);
            }
        }

        if r.test(Recovery::RUNNING) && !r.test(Recovery::DONE) {
            // Resync is running; nothing to do until it finishes.
            r.clear(Recovery::NEEDED);
            return;
        }
        if self.sync_thread.is_some() {
            self.reap_sync_thread();
            return;
        }

        // Set RUNNING before clearing NEEDED so no one else starts a pass.
        r.set(Recovery::RUNNING);
        r.clear(Recovery::INTR | Recovery::DONE | Recovery::ERROR);
        if !r.test_and_clear(Recovery::NEEDED) || r.test(Recovery::FROZEN) {
            self.not_running();
            return;
        }

        if self.meta.reshape_pending() {
            let pers = self.personality();
            let resumable = pers.map_or(false, |p| p.can_reshape() && p.check_reshape(self).is_ok());
            if !resumable {
                // Cannot proceed.
                self.not_running();
                return;
            }
            r.set(Recovery::RESHAPE);
            r.clear(Recovery::RECOVER);
        } else if self.remove_and_add_spares(None, false) > 0 {
            r.clear(Recovery::SYNC | Recovery::CHECK | Recovery::REQUESTED);
            r.set(Recovery::RECOVER);
        } else if !self.meta.recovery_cp.is_max() || r.test(Recovery::REQUESTED) {
            r.clear(Recovery::RECOVER);
            r.set(Recovery::SYNC);
        } else if !r.test(Recovery::SYNC) {
            // Nothing to be done...
            self.not_running();
            return;
        }

        let pers = match self.personality() {
            Some(pers) if pers.has_sync_request() => pers,
            _ => {
                self.not_running();
                return;
            }
        };
        if let Err(e) = self.start_sync_thread(pers) {
            error!("md: {}: could not start sync thread: {}", self.name, e);
            self.not_running();
        }
    }

    fn not_running(&mut self) {
        let r = &self.shared.recovery;
        r.clear(
            Recovery::RUNNING
                | Recovery::SYNC
                | Recovery::RESHAPE
                | Recovery::RECOVER
                | Recovery::REQUESTED
                | Recovery::CHECK,
        );
    }

    pub(super) fn start_sync_thread(&mut self, pers: Arc<dyn Personality>) -> Result<()> {
        let r = &self.shared.recovery;
        let end = self.meta.dev_sectors;
        let (start, what) = if r.test(Recovery::RESHAPE) {
            let start = if self.meta.reshape_position.is_max() || self.meta.reshape_backwards {
                Sectors(0)
            } else {
                self.meta.reshape_position
            };
            (start, "reshape")
        } else if r.test(Recovery::RECOVER) {
            let start = self
                .disks
                .iter()
                .filter(|d| d.raid_disk.is_some() && !d.is_faulty() && !d.is_in_sync())
                .map(|d| d.recovery_offset)
                .min()
                .unwrap_or(Sectors(0));
            (start, "recovery")
        } else if r.test(Recovery::REQUESTED) {
            (Sectors(0), if r.test(Recovery::CHECK) { "check" } else { "requested-resync" })
        } else {
            (self.meta.recovery_cp.min(end), "resync")
        };
        let start = start.min(end);
        self.resync_max = end;
        self.shared.curr_resync_completed.store(start.as_u64(), Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let thread = MdThread::spawn(format!("{}_resync", self.name), move |_| {
            sync_thread(shared, pers, start, end)
        })?;
        self.sync_thread = Some(thread);
        info!(
            "md: {}: {} from sector {} to {}",
            self.name,
            what,
            start.as_u64(),
            end.as_u64()
        );
        Ok(())
    }

    fn reap_sync_thread(&mut self) {
        if let Some(thread) = self.sync_thread.take() {
            thread.stop(&self.shared);
        }
        let shared = Arc::clone(&self.shared);
        let r = &shared.recovery;
        let interrupted = r.test(Recovery::INTR);
        let completed = Sectors(self.shared.curr_resync_completed.load(Ordering::SeqCst));

        if !r.test(Recovery::CHECK) {
            if r.test(Recovery::SYNC) && !r.test(Recovery::RESHAPE) {
                if interrupted {
                    if completed >= self.meta.recovery_cp || self.meta.recovery_cp.is_max() {
                        self.meta.recovery_cp = completed;
                    }
                } else {
                    self.meta.recovery_cp = MAX_SECTOR;
                }
            } else {
                let reached = if interrupted { completed } else { MAX_SECTOR };
                if self.meta.delta_disks >= 0 {
                    for dev in self.disks.iter_mut() {
                        if dev.raid_disk.is_some()
                            && !dev.is_faulty()
                            && !dev.is_in_sync()
                            && dev.recovery_offset < reached
                        {
                            dev.recovery_offset = reached;
                        }
                    }
                }
            }
        }
        self.set_sb_flags(SbFlags::CHANGE_DEVS);

        let pers = self.personality();
        if !interrupted && !r.test(Recovery::REQUESTED) && self.meta.degraded != self.meta.raid_disks {
            if let Some(ref pers) = pers {
                if pers.spare_active(self) > 0 {
                    self.set_sb_flags(SbFlags::CHANGE_DEVS);
                }
            }
        }
        if r.test(Recovery::RESHAPE) {
            if interrupted {
                self.meta.reshape_position = completed;
            } else if let Some(ref pers) = pers {
                pers.finish_reshape(self);
                self.commit_reshape(&**pers);
            }
        }
        if self.meta.degraded == 0 {
            for dev in self.disks.iter_mut() {
                dev.saved_raid_disk = None;
            }
        }
        if let Err(e) = self.update_superblocks(true) {
            error!("md: {}: superblock update failed: {}", self.name, e);
        }
        if !interrupted {
            info!("md: {}: sync done.", self.name);
        }
        self.not_running();
        // Flag recovery needed just to double check.
        r.set(Recovery::NEEDED);
    }

    /// Removes failed devices from their slots and gives spares a slot.
    ///
    /// With `this` only that device is considered for removal. Returns the
    /// number of devices that need recovery.
    pub(crate) fn remove_and_add_spares(&mut self, this: Option<usize>, read_only: bool) -> u32 {
        let pers = match self.personality() {
            Some(pers) => pers,
            None => return 0,
        };
        let mut removed = false;
        for idx in 0..self.disks.len() {
            if this.map_or(false, |t| t != idx) {
                continue;
            }
            let dev = &self.disks[idx];
            let removable = dev.raid_disk.is_some()
                && !dev.flags.contains(DevFlags::BLOCKED)
                && (dev.is_faulty() || (this.is_some() && !dev.is_in_sync()));
            if !removable {
                continue;
            }
            if pers.hot_remove_disk(self, idx).is_ok() {
                let dev = &mut self.disks[idx];
                info!("md: {}: removed {} from slot {:?}", self.name, dev.name(), dev.raid_disk);
                dev.saved_raid_disk = dev.raid_disk;
                dev.raid_disk = None;
                removed = true;
            }
        }
        if removed {
            self.set_sb_flags(SbFlags::CHANGE_DEVS);
        }
        if this.is_some() || read_only {
            return 0;
        }

        let mut spares = 0;
        for idx in 0..self.disks.len() {
            let dev = &self.disks[idx];
            if dev.is_faulty() {
                continue;
            }
            if dev.raid_disk.is_some() {
                if !dev.is_in_sync() {
                    spares += 1;
                }
                continue;
            }
            if self.meta.recovery_disabled {
                continue;
            }
            self.disks[idx].recovery_offset = Sectors(0);
            if pers.hot_add_disk(self, idx).is_ok() {
                let dev = &mut self.disks[idx];
                dev.flags.remove(DevFlags::IN_SYNC);
                info!("md: {}: added {} as slot {:?}", self.name, dev.name(), dev.raid_disk);
                spares += 1;
                self.set_sb_flags(SbFlags::CHANGE_DEVS);
            }
        }
        spares
    }
}

#[cfg(test)]
mod tests {
    use super::super::test::{assemble, context, format_devices, raid_meta};
    use super::*;
    use crate::array::ArrayState;
    use crate::blockdev::test::init_logging;
    use crate::personality::test::MockPersonality;
    use std::time::Duration;

    #[test]
    fn parse_actions() {
        for s in &["idle", "frozen", "resync", "recover", "reshape", "check", "repair"] {
            assert_eq!(s.parse::<SyncAction>().unwrap().to_string(), *s);
        }
        assert!("scrub".parse::<SyncAction>().is_err());
    }

    #[test]
    fn dirty_array_resyncs() {
        init_logging();
        let (ctx, _) = context();
        let pers = Arc::new(MockPersonality::raid1());
        ctx.register_personality(pers.clone());
        let mut meta = raid_meta(1, 2);
        meta.recovery_cp = Sectors(512);
        let devs = format_devices(&meta, 2, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        assert_eq!(array.lock().meta().recovery_cp, Sectors(512));
        array.check_recovery();
        assert!(array.recovery().test(Recovery::RUNNING));
        array.wait_for_sync(Duration::from_secs(10)).unwrap();
        let md = array.lock();
        assert_eq!(md.meta().recovery_cp, MAX_SECTOR);
        assert_eq!(pers.synced.load(Ordering::SeqCst), 2048 - 512);
        assert_eq!(md.sync_action(), SyncAction::Idle);
    }

    #[test]
    fn failed_device_is_replaced_by_spare() {
        init_logging();
        let (ctx, _) = context();
        let mut meta = raid_meta(1, 2);
        meta.raid_disks = 2;
        let devs = format_devices(&meta, 3, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        {
            let mut md = array.lock();
            assert_eq!(md.disks()[2].raid_disk(), None);
            md.md_error(0);
            assert!(md.disks()[0].is_faulty());
            assert_eq!(md.meta().degraded, 1);
        }
        array.check_recovery();
        array.wait_for_sync(Duration::from_secs(10)).unwrap();
        let md = array.lock();
        assert_eq!(md.meta().degraded, 0);
        let spare = &md.disks()[2];
        assert_eq!(spare.raid_disk(), Some(0));
        assert!(spare.is_in_sync());
        assert_eq!(md.disks()[0].raid_disk(), None);
        assert_eq!(md.array_state(), ArrayState::Clean);
        let events = md.meta().events;
        assert!(md.disks()[1..].iter().all(|d| d.sb_events() == events));
    }

    #[test]
    fn interrupted_recovery_keeps_progress() {
        init_logging();
        let (ctx, _) = context();
        let pers = Arc::new(MockPersonality::raid1());
        pers.delay.store(20_000, Ordering::SeqCst);
        ctx.register_personality(pers.clone());
        let mut meta = raid_meta(1, 2);
        meta.raid_disks = 2;
        let devs = format_devices(&meta, 3, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        array.lock().md_error(1);
        array.check_recovery();
        thread::sleep(Duration::from_millis(50));
        let mut md = array.lock();
        md.set_sync_action(SyncAction::Frozen).unwrap();
        assert!(!md.recovery().test(Recovery::RUNNING));
        let offset = md.disks()[2].recovery_offset();
        assert!(offset < md.meta().dev_sectors);
        assert!(!md.disks()[2].is_in_sync());
        assert_eq!(md.sync_action(), SyncAction::Frozen);

        pers.delay.store(0, Ordering::SeqCst);
        md.set_sync_action(SyncAction::Idle).unwrap();
        drop(md);
        array.check_recovery();
        array.wait_for_sync(Duration::from_secs(10)).unwrap();
        assert!(array.lock().disks()[2].is_in_sync());
    }

    #[test]
    fn check_requires_redundancy() {
        let (ctx, _) = context();
        let devs = format_devices(&raid_meta(0, 2), 3, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        assert!(array.lock().set_sync_action(SyncAction::Check).is_err());
    }

    #[test]
    fn requested_check_runs_whole_device() {
        let (ctx, _) = context();
        let pers = Arc::new(MockPersonality::raid5());
        ctx.register_personality(pers.clone());
        let devs = format_devices(&raid_meta(5, 2), 3, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        array.lock().set_sync_action(SyncAction::Check).unwrap();
        array.check_recovery();
        array.wait_for_sync(Duration::from_secs(10)).unwrap();
        assert_eq!(pers.synced.load(Ordering::SeqCst), 2048);
        assert_eq!(array.lock().meta().recovery_cp, MAX_SECTOR);
    }

    #[test]
    fn daemon_handles_recovery() {
        init_logging();
        let (ctx, _) = context();
        let mut meta = raid_meta(1, 2);
        meta.raid_disks = 2;
        let devs = format_devices(&meta, 3, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        array.start_daemon().unwrap();
        array.lock().md_error(0);
        let mut spins = 0;
        while !array.lock().disks()[2].is_in_sync() {
            spins += 1;
            assert!(spins < 10_000, "recovery did not finish");
            thread::sleep(Duration::from_millis(1));
        }
        array.stop_daemon();
    }
}
