//! The array state machine: starting, stopping, access modes and the write
//! path.
use super::thread::{self, MdThread};
use super::{Array, ArrayCore, ErrorKind, IoRequest, Mode, Recovery, Result, SbFlags};
use crate::meta::LEVEL_NONE;
use crate::units::Sectors;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Externally visible state of an array.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArrayState {
    /// No devices, no configuration.
    Clear,
    /// Configured but not running.
    Inactive,
    /// I/O is suspended.
    Suspended,
    /// Running, read-only.
    ReadOnly,
    /// Running, read-only until the first write.
    ReadAuto,
    /// Running, no writes since the last superblock update.
    Clean,
    /// Running with writes.
    Active,
    /// Writes wait for a superblock update.
    WritePending,
    /// Running with writes, none in flight.
    ActiveIdle,
    /// Too many devices failed.
    Broken,
}

impl ArrayState {
    fn as_str(self) -> &'static str {
        match self {
            ArrayState::Clear => "clear",
            ArrayState::Inactive => "inactive",
            ArrayState::Suspended => "suspended",
            ArrayState::ReadOnly => "readonly",
            ArrayState::ReadAuto => "read-auto",
            ArrayState::Clean => "clean",
            ArrayState::Active => "active",
            ArrayState::WritePending => "write-pending",
            ArrayState::ActiveIdle => "active-idle",
            ArrayState::Broken => "broken",
        }
    }
}

impl fmt::Display for ArrayState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArrayState {
    type Err = super::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim() {
            "clear" => ArrayState::Clear,
            "inactive" => ArrayState::Inactive,
            "suspended" => ArrayState::Suspended,
            "readonly" => ArrayState::ReadOnly,
            "read-auto" => ArrayState::ReadAuto,
            "clean" => ArrayState::Clean,
            "active" => ArrayState::Active,
            "write-pending" => ArrayState::WritePending,
            "active-idle" => ArrayState::ActiveIdle,
            "broken" => ArrayState::Broken,
            other => bail!(ErrorKind::InvalidArgument(format!("unknown array state {:?}", other))),
        })
    }
}

/// What `stop` leaves behind.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopMode {
    /// Release all devices and forget the configuration.
    Clear,
    /// Detach the personality, keep devices and configuration.
    Inactive,
}

impl ArrayCore {
    /// Current state as shown to user space.
    pub fn array_state(&self) -> ArrayState {
        if self.is_running() {
            let w = self.shared.write.lock();
            let state = match w.mode {
                Mode::ReadOnly => ArrayState::ReadOnly,
                Mode::ReadAuto => ArrayState::ReadAuto,
                Mode::ReadWrite => {
                    if w.sb_flags.contains(SbFlags::CHANGE_PENDING) {
                        ArrayState::WritePending
                    } else if w.in_sync {
                        ArrayState::Clean
                    } else if w.safemode {
                        ArrayState::ActiveIdle
                    } else {
                        ArrayState::Active
                    }
                }
            };
            match state {
                ArrayState::Clean | ArrayState::Active if self.broken => ArrayState::Broken,
                state => state,
            }
        } else if self.disks.is_empty()
            && self.meta.raid_disks == 0
            && self.meta.dev_sectors == Sectors(0)
        {
            ArrayState::Clear
        } else {
            ArrayState::Inactive
        }
    }

    /// Requests a state transition.
    pub fn set_array_state(&mut self, state: ArrayState) -> Result<()> {
        let running = self.is_running();
        let result = match state {
            ArrayState::Suspended | ArrayState::WritePending | ArrayState::ActiveIdle | ArrayState::Broken => {
                bail!(ErrorKind::InvalidArgument(format!("cannot set state {}", state)))
            }
            ArrayState::Clear => self.stop(StopMode::Clear),
            ArrayState::Inactive => {
                if running {
                    self.stop(StopMode::Inactive)
                } else {
                    Ok(())
                }
            }
            ArrayState::ReadOnly => {
                if running {
                    self.set_readonly()
                } else {
                    self.set_mode(Mode::ReadOnly);
                    self.do_run()
                }
            }
            ArrayState::ReadAuto => {
                if running {
                    match self.mode() {
                        Mode::ReadWrite => self.set_readonly()?,
                        Mode::ReadOnly => self.restart()?,
                        Mode::ReadAuto => {}
                    }
                    self.set_mode(Mode::ReadAuto);
                    Ok(())
                } else {
                    self.set_mode(Mode::ReadAuto);
                    self.do_run()
                }
            }
            ArrayState::Clean => {
                if !running {
                    bail!(ErrorKind::InvalidArgument("array is not running".to_owned()));
                }
                if self.mode() != Mode::ReadWrite {
                    self.restart()?;
                }
                if self.shared.set_in_sync() {
                    Ok(())
                } else {
                    bail!(ErrorKind::Busy("writes in flight".to_owned()))
                }
            }
            ArrayState::Active => {
                if running {
                    if self.mode() != Mode::ReadWrite {
                        self.restart()?;
                    }
                    let mut w = self.shared.write.lock();
                    w.sb_flags.remove(SbFlags::CHANGE_PENDING);
                    w.safemode = false;
                    self.shared.sb_wait.notify_all();
                    Ok(())
                } else {
                    self.set_mode(Mode::ReadWrite);
                    self.do_run()
                }
            }
        };
        if result.is_ok() {
            debug!("md: {}: array_state -> {}", self.name(), self.array_state());
        }
        result
    }

    /// Runs the array and kicks the daemon.
    pub fn do_run(&mut self) -> Result<()> {
        self.run()?;
        self.wake_daemon();
        Ok(())
    }

    /// Attaches the personality selected by `level`/`clevel` and starts
    /// the array.
    pub fn run(&mut self) -> Result<()> {
        if self.disks.is_empty() {
            bail!(ErrorKind::InvalidArgument("cannot run an array without devices".to_owned()));
        }
        if self.is_running() {
            bail!(ErrorKind::Busy(format!("{} is already running", self.name())));
        }

        // Analyze all devices unless the geometry was configured by hand.
        if self.meta.raid_disks == 0 {
            if !self.meta.persistent() {
                bail!(ErrorKind::InvalidArgument("array has no geometry".to_owned()));
            }
            self.analyze_superblocks()?;
        }

        for dev in self.disks.iter().filter(|d| !d.is_faulty()) {
            if self.shared.mode() != Mode::ReadOnly && dev.bdev.read_only() {
                info!("md: {}: {} is read-only, starting array read-only", self.name, dev.name());
                self.shared.set_mode(Mode::ReadOnly);
            }
            // The data area must not overlap the superblock.
            let sb_end = dev.sb_start + Sectors((dev.sb_size / 512) as u64);
            if dev.data_offset < dev.sb_start {
                if self.meta.dev_sectors != Sectors(0) && dev.data_offset + self.meta.dev_sectors > dev.sb_start {
                    warn!("md: {}: data overlaps metadata", self.name);
                    bail!(ErrorKind::InvalidArgument(format!("{}: data overlaps metadata", dev.name())));
                }
            } else if sb_end > dev.data_offset {
                warn!("md: {}: metadata overlaps data", self.name);
                bail!(ErrorKind::InvalidArgument(format!("{}: metadata overlaps data", dev.name())));
            }
        }

        let level = if self.meta.level != LEVEL_NONE {
            Some(self.meta.level)
        } else {
            None
        };
        let pers = match self.personalities.find(level, &self.meta.clevel) {
            Some(pers) => pers,
            None => {
                let wanted = match level {
                    Some(level) => level.to_string(),
                    None => self.meta.clevel.clone(),
                };
                warn!("md: personality for level {} is not loaded!", wanted);
                bail!(ErrorKind::NoPersonality(wanted));
            }
        };
        if self.meta.level != pers.level() {
            self.meta.level = pers.level();
            self.meta.new_level = pers.level();
        }
        self.meta.clevel = pers.name().to_owned();

        if self.meta.reshape_pending() && !pers.can_reshape() {
            warn!("md: {}: reshape_position is set but personality cannot reshape", self.name);
            bail!(ErrorKind::InvalidArgument(format!("{} cannot reshape", pers.name())));
        }

        self.shared.recovery.reset();
        self.shared.curr_resync_completed.store(0, Ordering::SeqCst);
        if let Err(e) = pers.run(self) {
            warn!("md: {}: {} failed to run: {}", self.name, pers.name(), e);
            self.private = None;
            return Err(e);
        }
        if pers.size(self, Sectors(0), 0) < self.meta.array_sectors {
            if self.meta.external_size {
                warn!("md: {}: array_size too small to hold current array", self.name);
            }
            pers.stop(self);
            if let Some(private) = self.private.take() {
                pers.free(self, private);
            }
            bail!(ErrorKind::CapacityExceeded("array_size exceeds the component size".to_owned()));
        }
        if !pers.has_sync_request() && self.mode() == Mode::ReadAuto {
            self.set_mode(Mode::ReadWrite);
        }
        {
            let mut w = self.shared.write.lock();
            w.in_sync = true;
            w.safemode = false;
            w.writes_pending = 0;
        }
        self.shared.persistent.store(self.meta.persistent(), Ordering::SeqCst);
        *self.shared.pers.write() = Some(Arc::clone(&pers));
        self.broken = false;
        self.publish();

        if self.meta.degraded > 0 && self.mode() == Mode::ReadWrite {
            self.shared.recovery.set(Recovery::RECOVER);
        }
        self.shared.recovery.set(Recovery::NEEDED);
        if !self.sb_flags().is_empty() {
            self.update_superblocks(false)?;
        }
        info!(
            "md: {}: {} started with {} of {} devices",
            self.name,
            pers.name(),
            self.meta.raid_disks - self.meta.degraded.min(self.meta.raid_disks),
            self.meta.raid_disks
        );
        Ok(())
    }

    /// Stops a running array.
    ///
    /// Refused while the array is open.
    pub fn stop(&mut self, mode: StopMode) -> Result<()> {
        if self.meta.external() && self.sb_flags().contains(SbFlags::CHANGE_PENDING) {
            bail!(ErrorKind::Busy("metadata update pending".to_owned()));
        }
        let did_freeze = !self.shared.recovery.test(Recovery::FROZEN);
        self.shared.recovery.set(Recovery::FROZEN);
        self.stop_sync_thread();

        if self.shared.openers.load(Ordering::SeqCst) > 0 {
            warn!("md: {} still in use.", self.name);
            if did_freeze {
                self.shared.recovery.clear(Recovery::FROZEN);
                self.shared.recovery.set(Recovery::NEEDED);
                self.wake_daemon();
            }
            bail!(ErrorKind::Busy(format!("{} is open", self.name)));
        }

        if let Some(pers) = self.personality() {
            self.stop_writes();
            pers.stop(self);
            *self.shared.pers.write() = None;
            if let Some(private) = self.private.take() {
                pers.free(self, private);
            }
            self.set_mode(Mode::ReadWrite);
            self.shared.recovery.clear(Recovery::FROZEN);
            info!("md: {}: {} stopped", self.name, pers.name());
        }

        if mode == StopMode::Clear {
            info!("md: {} stopped.", self.name);
            self.export_array();
            self.clean();
        }
        Ok(())
    }

    /// Resets everything to the state of a new array.
    fn clean(&mut self) {
        self.meta.clear();
        self.broken = false;
        *self.shared.write.lock() = super::WriteState::new();
        {
            let mut suspend = self.shared.suspend.lock_write();
            *suspend = (Sectors(0), Sectors(0));
        }
        self.shared.recovery.reset();
        self.shared.curr_resync_completed.store(0, Ordering::SeqCst);
        self.shared.persistent.store(false, Ordering::SeqCst);
        self.resync_max = Sectors(0);
    }

    /// Marks the array clean and writes the superblocks before a stop or
    /// a switch to read-only.
    pub(crate) fn stop_writes(&mut self) {
        self.shared.recovery.set(Recovery::FROZEN);
        self.stop_sync_thread();
        if let Some(pers) = self.personality() {
            pers.quiesce(self, true);
            pers.quiesce(self, false);
        }
        let dirty = {
            let mut w = self.shared.write.lock();
            let dirty = w.mode == Mode::ReadWrite && (!w.in_sync || !w.sb_flags.is_empty());
            if dirty {
                // Mark array as shutdown cleanly.
                w.in_sync = true;
            }
            w.safemode = false;
            dirty
        };
        if dirty {
            if let Err(e) = self.update_superblocks(true) {
                error!("md: {}: final superblock update failed: {}", self.name, e);
            }
        }
    }

    /// Switches a running array to read-only.
    pub fn set_readonly(&mut self) -> Result<()> {
        if self.meta.external() && self.sb_flags().contains(SbFlags::CHANGE_PENDING) {
            bail!(ErrorKind::Busy("metadata update pending".to_owned()));
        }
        let did_freeze = !self.shared.recovery.test(Recovery::FROZEN);
        self.shared.recovery.set(Recovery::FROZEN);
        self.stop_sync_thread();

        let result = if self.shared.openers.load(Ordering::SeqCst) > 0 {
            warn!("md: {} still in use.", self.name);
            Err(ErrorKind::Busy(format!("{} is open", self.name)).into())
        } else if self.is_running() {
            self.stop_writes();
            if self.mode() == Mode::ReadOnly {
                Err(ErrorKind::ReadOnly(format!("{} is already read-only", self.name)).into())
            } else {
                self.set_mode(Mode::ReadOnly);
                info!("md: {} switched to read-only mode.", self.name);
                Ok(())
            }
        } else {
            Ok(())
        };

        if (self.is_running() && result.is_ok()) || did_freeze {
            self.shared.recovery.clear(Recovery::FROZEN);
            self.shared.recovery.set(Recovery::NEEDED);
            self.wake_daemon();
        }
        result
    }

    /// Switches a read-only array back to read-write.
    pub fn restart(&mut self) -> Result<()> {
        self.publish();
        self.shared.restart()
    }

    /// Blocks new I/O and waits for in-flight requests.
    pub(crate) fn suspend(&mut self) {
        {
            let mut w = self.shared.write.lock();
            w.suspended += 1;
            while w.active_io > 0 {
                self.shared.suspend_wait.wait(&mut w);
            }
        }
        if let Some(pers) = self.personality() {
            pers.quiesce(self, true);
        }
    }

    /// Ends a `suspend`.
    pub(crate) fn resume(&mut self) {
        {
            let mut w = self.shared.write.lock();
            w.suspended = w.suspended.saturating_sub(1);
            if w.suspended == 0 {
                self.shared.suspend_wait.notify_all();
            }
        }
        if let Some(pers) = self.personality() {
            pers.quiesce(self, false);
        }
        self.shared.recovery.set(Recovery::NEEDED);
        self.wake_daemon();
    }

    /// Switches a running array to another personality, or records the
    /// level of an inactive one.
    pub fn level_change(&mut self, clevel: &str) -> Result<()> {
        let clevel = clevel.trim();
        if clevel.is_empty() {
            bail!(ErrorKind::InvalidArgument("empty level".to_owned()));
        }
        let old = match self.personality() {
            Some(pers) => pers,
            None => {
                self.meta.clevel = clevel.to_owned();
                self.meta.level = LEVEL_NONE;
                return Ok(());
            }
        };
        if self.mode() != Mode::ReadWrite {
            bail!(ErrorKind::ReadOnly(format!("{} is read-only", self.name)));
        }
        if self.sync_thread.is_some()
            || self.shared.recovery.test(Recovery::RUNNING)
            || self.meta.reshape_pending()
            || self.meta.delta_disks != 0
        {
            bail!(ErrorKind::Busy("recovery or reshape in progress".to_owned()));
        }
        if !old.can_quiesce() {
            warn!("md: {}: {} does not support online personality change", self.name, old.name());
            bail!(ErrorKind::InvalidArgument(format!("{} cannot quiesce", old.name())));
        }

        let level = clevel.parse::<i32>().ok();
        let pers = match self.personalities.find(level, clevel) {
            Some(pers) => pers,
            None => {
                warn!("md: {}: personality {} not loaded", self.name, clevel);
                bail!(ErrorKind::InvalidArgument(format!("unknown level {}", clevel)));
            }
        };
        if pers.name() == old.name() {
            // Nothing to do!
            return Ok(());
        }

        for dev in self.disks.iter_mut() {
            dev.new_raid_disk = dev.raid_disk;
        }
        let private = match pers.takeover(self) {
            Ok(private) => private,
            Err(e) => {
                let meta = &mut self.meta;
                meta.new_level = meta.level;
                meta.new_layout = meta.layout;
                meta.new_chunk_sectors = meta.chunk_sectors;
                meta.raid_disks = (meta.raid_disks as i64 - i64::from(meta.delta_disks)) as u32;
                meta.delta_disks = 0;
                meta.reshape_backwards = false;
                warn!("md: {}: {} would not accept array: {}", self.name, pers.name(), e);
                return Err(e);
            }
        };

        // Looks like we have a winner.
        self.suspend();
        let old_private = self.private.take();
        *self.shared.pers.write() = Some(Arc::clone(&pers));
        self.private = Some(private);
        {
            let meta = &mut self.meta;
            meta.clevel = pers.name().to_owned();
            meta.level = meta.new_level;
            meta.layout = meta.new_layout;
            meta.chunk_sectors = meta.new_chunk_sectors;
            meta.delta_disks = 0;
            meta.reshape_backwards = false;
            meta.degraded = 0;
        }
        if !old.has_sync_request() && self.meta.external() {
            // The old personality never marked the array dirty.
            let mut w = self.shared.write.lock();
            w.in_sync = false;
            w.safemode = false;
        }
        if let Some(private) = old_private {
            old.free(self, private);
        }

        let raid_disks = self.meta.raid_disks;
        for dev in self.disks.iter_mut() {
            if dev.raid_disk.is_none() {
                continue;
            }
            if dev.new_raid_disk.map_or(false, |slot| slot >= raid_disks) {
                dev.new_raid_disk = None;
            }
            if dev.new_raid_disk == dev.raid_disk {
                continue;
            }
            dev.raid_disk = dev.new_raid_disk;
            if dev.raid_disk.is_none() {
                dev.flags.remove(crate::device::DevFlags::IN_SYNC);
            }
        }

        if !pers.has_sync_request() {
            // This is now an array without redundancy.
            self.shared.write.lock().in_sync = true;
        }
        if let Err(e) = pers.run(self) {
            error!("md: {}: {} failed to run after takeover: {}", self.name, pers.name(), e);
        }
        self.set_sb_flags(SbFlags::CHANGE_DEVS);
        self.resume();
        if !self.shared.daemon_running.load(Ordering::SeqCst) {
            self.update_superblocks(true)?;
        }
        info!("md: {}: level changed from {} to {}", self.name, old.name(), pers.name());
        Ok(())
    }

    /// Starts the management thread.
    pub(crate) fn start_daemon(&mut self) -> Result<()> {
        if self.daemon.is_some() {
            return Ok(());
        }
        let array = self.this.clone();
        let shared = Arc::clone(&self.shared);
        let name = format!("{}_raid", self.name);
        self.daemon = Some(MdThread::spawn(name, move |stop| thread::daemon(array, shared, stop))?);
        self.shared.daemon_running.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Array {
    /// Current state as shown to user space.
    pub fn array_state(&self) -> ArrayState {
        self.lock().array_state()
    }

    /// Requests a state transition.
    ///
    /// Switching a running read-write array between `Clean` and `Active`
    /// does not take the reconfiguration lock.
    pub fn set_array_state(&self, state: ArrayState) -> Result<()> {
        if (state == ArrayState::Clean || state == ArrayState::Active)
            && self.is_running()
            && self.mode() != Mode::ReadOnly
        {
            if self.mode() == Mode::ReadAuto {
                if let Err(e) = self.shared.restart() {
                    warn!("md: {}: {} refused: {}", self.name, state, e);
                    return Err(e);
                }
            }
            let done = if state == ArrayState::Active {
                let mut w = self.shared.write.lock();
                w.sb_flags.remove(SbFlags::CHANGE_PENDING);
                self.shared.sb_wait.notify_all();
                true
            } else {
                self.shared.set_in_sync()
            };
            self.shared.wake_daemon();
            return if done {
                Ok(())
            } else {
                Err(ErrorKind::Busy("writes in flight".to_owned()).into())
            };
        }
        self.lock().set_array_state(state)
    }

    /// Marks the array dirty before a write.
    ///
    /// Blocks until the dirty state is on disk for persistent metadata.
    pub fn write_start(&self) -> Result<()> {
        let mut did_change = false;
        {
            let mut w = self.shared.write.lock();
            if w.mode == Mode::ReadOnly {
                bail!(ErrorKind::ReadOnly(format!("{} is read-only", self.name)));
            }
            if w.mode == Mode::ReadAuto {
                // Need to switch to read/write.
                w.mode = Mode::ReadWrite;
                self.shared.recovery.set(Recovery::NEEDED);
                did_change = true;
            }
            w.writes_pending += 1;
            w.safemode = false;
            if w.in_sync {
                w.in_sync = false;
                w.sb_flags.insert(SbFlags::CHANGE_CLEAN | SbFlags::CHANGE_PENDING);
                did_change = true;
            }
        }
        if did_change {
            if self.shared.daemon_running.load(Ordering::SeqCst) {
                self.shared.wake_daemon();
            } else {
                self.check_recovery();
            }
        }
        if !self.shared.persistent.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut w = self.shared.write.lock();
        while w.sb_flags.contains(SbFlags::CHANGE_PENDING) && w.mode == Mode::ReadWrite {
            self.shared.sb_wait.wait(&mut w);
        }
        Ok(())
    }

    /// Ends a write started with `write_start`.
    pub fn write_end(&self) {
        let mut w = self.shared.write.lock();
        w.writes_pending = w.writes_pending.saturating_sub(1);
        if w.writes_pending == 0 {
            w.safemode = true;
            drop(w);
            self.shared.wake_daemon();
        }
    }

    /// Submits a request to the personality.
    pub fn submit(&self, req: &IoRequest) -> Result<()> {
        let pers = match self.shared.personality() {
            Some(pers) => pers,
            None => bail!(ErrorKind::NotRunning),
        };
        if req.write {
            self.write_start()?;
        }
        {
            let mut w = self.shared.write.lock();
            while self.shared.suspended(&w, req) {
                self.shared.suspend_wait.wait(&mut w);
            }
            w.active_io += 1;
        }
        let devices = self.devices();
        let result = pers.make_request(&devices, req);
        {
            let mut w = self.shared.write.lock();
            w.active_io -= 1;
            if w.active_io == 0 {
                self.shared.suspend_wait.notify_all();
            }
        }
        if req.write {
            self.write_end();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::test::{assemble, context, format_devices, raid_meta};
    use super::*;
    use crate::array::ErrorClass;
    use crate::blockdev::test::{init_logging, FailingDevice};
    use crate::blockdev::DevId;
    use crate::personality::test::MockPersonality;
    use crate::units::MAX_SECTOR;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[test]
    fn parse_states() {
        for s in &["clear", "inactive", "readonly", "read-auto", "clean", "active", "broken"] {
            assert_eq!(s.parse::<ArrayState>().unwrap().to_string(), *s);
        }
        assert!("bogus".parse::<ArrayState>().is_err());
    }

    #[test]
    fn run_and_stop() {
        init_logging();
        let (ctx, _) = context();
        let pers = Arc::new(MockPersonality::raid5());
        ctx.register_personality(pers.clone());
        let devs = format_devices(&raid_meta(5, 2), 3, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        assert!(array.is_running());
        assert_eq!(array.array_state(), ArrayState::Clean);
        assert_eq!(pers.runs.load(Ordering::SeqCst), 1);
        {
            let mut md = array.lock();
            assert_eq!(md.meta().array_sectors, Sectors(4096));
            assert_eq!(md.meta().clevel, "raid5");
            match *md.run().unwrap_err().kind() {
                ErrorKind::Busy(_) => {}
                ref e => panic!("unexpected error {:?}", e),
            }
        }

        array.open();
        let err = array.set_array_state(ArrayState::Inactive).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Concurrency);
        assert!(array.is_running());
        array.close();

        array.set_array_state(ArrayState::Inactive).unwrap();
        assert_eq!(array.array_state(), ArrayState::Inactive);
        assert_eq!(pers.frees.load(Ordering::SeqCst), 1);
        assert_eq!(array.devices().len(), 3);

        array.set_array_state(ArrayState::Clear).unwrap();
        assert_eq!(array.array_state(), ArrayState::Clear);
        assert!(array.devices().is_empty());
    }

    #[test]
    fn missing_personality() {
        let (ctx, _) = context();
        ctx.unregister_personality("raid5");
        let devs = format_devices(&raid_meta(5, 2), 3, Sectors(8192));
        let array = ctx.array(0);
        let mut md = array.lock();
        md.meta_mut().metadata = crate::meta::Metadata::Persistent { major: 1, minor: 2 };
        for d in &devs {
            md.add_device(d.boxed()).unwrap();
        }
        match *md.run().unwrap_err().kind() {
            ErrorKind::NoPersonality(_) => {}
            ref e => panic!("unexpected error {:?}", e),
        }
        assert!(!md.is_running());
    }

    #[test]
    fn run_without_devices() {
        let (ctx, _) = context();
        let array = ctx.array(0);
        let err = array.set_array_state(ArrayState::Active).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Invalid);
    }

    #[test]
    fn clean_store_writes_each_superblock_once() {
        init_logging();
        let (ctx, _) = context();
        let devs = format_devices(&raid_meta(1, 2), 3, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        array.check_recovery();

        array.write_start().unwrap();
        array.write_end();
        assert_eq!(array.array_state(), ArrayState::ActiveIdle);

        let before: Vec<_> = devs.iter().map(|d| d.write_requests()).collect();
        array.set_array_state(ArrayState::Clean).unwrap();
        array.check_recovery();
        for (d, b) in devs.iter().zip(before.iter()) {
            assert_eq!(d.write_requests(), b + 1);
        }
        assert_eq!(array.array_state(), ArrayState::Clean);
        array.check_recovery();
        for (d, b) in devs.iter().zip(before.iter()) {
            assert_eq!(d.write_requests(), b + 1);
        }
    }

    #[test]
    fn clean_store_fails_with_writes_in_flight() {
        let (ctx, _) = context();
        let devs = format_devices(&raid_meta(1, 2), 2, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        array.write_start().unwrap();
        let err = array.set_array_state(ArrayState::Clean).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Concurrency);
        array.write_end();
        array.set_array_state(ArrayState::Clean).unwrap();
    }

    #[test]
    fn readonly_and_back() {
        init_logging();
        let (ctx, _) = context();
        let devs = format_devices(&raid_meta(1, 2), 2, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        array.set_array_state(ArrayState::ReadOnly).unwrap();
        assert_eq!(array.array_state(), ArrayState::ReadOnly);
        match *array.write_start().unwrap_err().kind() {
            ErrorKind::ReadOnly(_) => {}
            ref e => panic!("unexpected error {:?}", e),
        }
        let err = array.lock().set_readonly().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Invalid);

        array.set_array_state(ArrayState::ReadAuto).unwrap();
        assert_eq!(array.array_state(), ArrayState::ReadAuto);
        // The first write switches to read-write.
        array.write_start().unwrap();
        assert_eq!(array.mode(), Mode::ReadWrite);
        array.write_end();
    }

    #[test]
    fn read_auto_with_read_only_member_refuses_active() {
        init_logging();
        let (ctx, _) = context();
        let devs = format_devices(&raid_meta(1, 2), 2, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        array.set_array_state(ArrayState::ReadAuto).unwrap();
        devs[1].set_read_only(true);
        drop(array.lock());

        for state in &[ArrayState::Active, ArrayState::Clean] {
            match *array.set_array_state(*state).unwrap_err().kind() {
                ErrorKind::ReadOnly(_) => {}
                ref e => panic!("unexpected error {:?}", e),
            }
            assert_eq!(array.mode(), Mode::ReadAuto);
        }

        devs[1].set_read_only(false);
        drop(array.lock());
        array.set_array_state(ArrayState::Active).unwrap();
        assert_eq!(array.mode(), Mode::ReadWrite);
        array.set_array_state(ArrayState::Active).unwrap();
    }

    #[test]
    fn read_only_member_starts_read_only() {
        let (ctx, _) = context();
        let devs = format_devices(&raid_meta(1, 2), 2, Sectors(8192));
        devs[1].set_read_only(true);
        let array = assemble(&ctx, 0, &devs, 2);
        assert_eq!(array.mode(), Mode::ReadOnly);
        let err = array.lock().restart().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Invalid);
        devs[1].set_read_only(false);
        array.lock().restart().unwrap();
        assert_eq!(array.mode(), Mode::ReadWrite);
    }

    #[test]
    fn submit_routes_to_personality() {
        let (ctx, _) = context();
        let pers = Arc::new(MockPersonality::raid1());
        ctx.register_personality(pers.clone());
        let devs = format_devices(&raid_meta(1, 2), 2, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        array.start_daemon().unwrap();
        array
            .submit(&IoRequest::write(Sectors(0), Sectors(8)))
            .unwrap();
        array.submit(&IoRequest::read(Sectors(0), Sectors(8))).unwrap();
        assert_eq!(pers.writes.load(Ordering::SeqCst), 1);
        array.stop_daemon();
        array.lock().stop(StopMode::Inactive).unwrap();
        match *array.submit(&IoRequest::read(Sectors(0), Sectors(8))).unwrap_err().kind() {
            ErrorKind::NotRunning => {}
            ref e => panic!("unexpected error {:?}", e),
        }
    }

    #[test]
    fn takeover_between_levels() {
        init_logging();
        let (ctx, _) = context();
        let raid1 = Arc::new(MockPersonality::raid1());
        let raid5 = Arc::new(MockPersonality::raid5());
        ctx.register_personality(raid1.clone());
        ctx.register_personality(raid5.clone());
        let mut meta = raid_meta(1, 2);
        meta.raid_disks = 2;
        let devs = format_devices(&meta, 2, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        let mut md = array.lock();
        let events = md.meta().events;
        md.level_change("raid5").unwrap();
        assert_eq!(md.meta().level, 5);
        assert_eq!(md.meta().layout, 2);
        assert_eq!(md.meta().chunk_sectors, 128);
        assert_eq!(md.meta().clevel, "raid5");
        assert_eq!(md.personality().unwrap().name(), "raid5");
        assert_eq!(raid1.frees.load(Ordering::SeqCst), 1);
        assert!(md.meta().events > events);
        assert!(md.disks().iter().all(|d| d.raid_disk().is_some()));
    }

    #[test]
    fn failed_takeover_rolls_back() {
        let (ctx, _) = context();
        let devs = format_devices(&raid_meta(1, 2), 3, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        let mut md = array.lock();
        // Three mirrors cannot become raid5 in place.
        assert!(md.level_change("raid5").is_err());
        assert_eq!(md.meta().level, 1);
        assert_eq!(md.meta().new_level, 1);
        assert_eq!(md.meta().raid_disks, 3);
        assert_eq!(md.personality().unwrap().name(), "raid1");

        assert!(md.level_change("raid6").is_err());
        md.level_change("raid1").unwrap();
    }

    #[test]
    fn level_of_inactive_array_is_recorded() {
        let (ctx, _) = context();
        let array = ctx.array(0);
        let mut md = array.lock();
        md.level_change("raid1").unwrap();
        assert_eq!(md.meta().clevel, "raid1");
        assert_eq!(md.meta().level, crate::meta::LEVEL_NONE);
    }

    #[test]
    fn manual_geometry_without_superblocks() {
        let (ctx, _) = context();
        let array = ctx.array(0);
        let devs: Vec<_> = (0..2)
            .map(|i| FailingDevice::new(Sectors(4096), DevId::new(8, i)))
            .collect();
        let mut md = array.lock();
        md.level_change("raid0").unwrap();
        md.meta_mut().raid_disks = 2;
        md.meta_mut().chunk_sectors = 128;
        for (i, d) in devs.iter().enumerate() {
            let idx = md.add_device(d.boxed()).unwrap();
            let dev = md.disk_mut(idx);
            dev.set_raid_disk(Some(i as u32));
            dev.flags_mut().insert(crate::device::DevFlags::IN_SYNC);
            dev.sectors = Sectors(4096);
        }
        md.meta_mut().dev_sectors = Sectors(4096);
        md.meta_mut().recovery_cp = MAX_SECTOR;
        md.set_array_state(ArrayState::Active).unwrap();
        assert_eq!(md.meta().array_sectors, Sectors(8192));
        let events = md.meta().events;
        md.update_superblocks(true).unwrap();
        assert_eq!(md.meta().events, events);
        drop(md);
        array.wait_for_sync(Duration::from_secs(1)).unwrap();
    }
}
