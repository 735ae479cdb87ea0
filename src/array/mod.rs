//! This module provides `Array`, a RAID array assembled from member
//! devices, and the state machine driving it.
//!
//! Every array carries one reconfiguration lock, the `Mutex` around
//! `ArrayCore`. All configuration changes, superblock updates and recovery
//! decisions happen while it is held. The I/O path never takes it: writers
//! only touch the small `Shared` state (write state, recovery bits, suspend
//! window) and a snapshot of the device list which is republished whenever
//! an `ArrayGuard` is dropped.

use crate::blockdev::DevId;
use crate::context::Registry;
use crate::device::{DeviceInfo, MemberDevice};
use crate::meta::ArrayMeta;
use crate::personality::{Personality, PersonalityTable};
use crate::units::Sectors;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use scoped_threadpool::Pool;
use seqlock::SeqLock;
use std::any::Any;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

mod errors;
pub use self::errors::*;

mod attr;
mod registry;
mod reshape;
mod state;
mod sync;
mod thread;

#[cfg(test)]
pub(crate) mod test;

pub use self::registry::import_device;
pub use self::reshape::ReshapeChange;
pub use self::state::{ArrayState, StopMode};
pub use self::thread::SyncAction;

use self::thread::MdThread;

/// Number of threads writing superblocks in parallel.
const IO_THREADS: u32 = 4;

/// Access mode of a running array.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Normal operation.
    ReadWrite,
    /// No writes, no recovery.
    ReadOnly,
    /// Read-only until the first write arrives.
    ReadAuto,
}

bitflags! {
    /// Pending superblock changes.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SbFlags: u32 {
        /// The device set or device states changed.
        const CHANGE_DEVS = 1;
        /// Only the clean/dirty state changed.
        const CHANGE_CLEAN = 1 << 1;
        /// Writes must wait until the superblocks are written.
        const CHANGE_PENDING = 1 << 2;
    }
}

impl SbFlags {
    /// Clears the bits of `other`, returning `true` if any was set.
    pub fn take(&mut self, other: SbFlags) -> bool {
        let set = self.intersects(other);
        self.remove(other);
        set
    }
}

bitflags! {
    /// Recovery state bits.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Recovery: u32 {
        /// A sync thread exists.
        const RUNNING = 1;
        /// Resync (parity or mirror) of the whole array.
        const SYNC = 1 << 1;
        /// Rebuild of devices that are not in sync.
        const RECOVER = 1 << 2;
        /// Interrupt the sync thread.
        const INTR = 1 << 3;
        /// The sync thread finished.
        const DONE = 1 << 4;
        /// The daemon should look at the array.
        const NEEDED = 1 << 5;
        /// The resync was requested explicitly.
        const REQUESTED = 1 << 6;
        /// Read-only check, nothing is repaired.
        const CHECK = 1 << 7;
        /// A reshape is running.
        const RESHAPE = 1 << 8;
        /// No new sync thread may be started.
        const FROZEN = 1 << 9;
        /// The last sync pass failed.
        const ERROR = 1 << 10;
    }
}

/// `Recovery` bits, readable without the reconfiguration lock.
#[derive(Debug, Default)]
pub struct AtomicRecovery(AtomicU32);

impl AtomicRecovery {
    /// Returns `true` if any bit of `bits` is set.
    pub fn test(&self, bits: Recovery) -> bool {
        self.load().intersects(bits)
    }

    /// Sets `bits`.
    pub fn set(&self, bits: Recovery) {
        self.0.fetch_or(bits.bits(), Ordering::SeqCst);
    }

    /// Clears `bits`.
    pub fn clear(&self, bits: Recovery) {
        self.0.fetch_and(!bits.bits(), Ordering::SeqCst);
    }

    /// Clears `bits`, returning whether any of them was set.
    pub fn test_and_clear(&self, bits: Recovery) -> bool {
        Recovery::from_bits_truncate(self.0.fetch_and(!bits.bits(), Ordering::SeqCst))
            .intersects(bits)
    }

    /// Returns all bits.
    pub fn load(&self) -> Recovery {
        Recovery::from_bits_truncate(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

/// A request submitted to a running array.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IoRequest {
    /// First sector.
    pub sector: Sectors,
    /// Length.
    pub sectors: Sectors,
    /// `true` for writes.
    pub write: bool,
}

impl IoRequest {
    /// A read of `sectors` starting at `sector`.
    pub fn read(sector: Sectors, sectors: Sectors) -> Self {
        IoRequest {
            sector,
            sectors,
            write: false,
        }
    }

    /// A write of `sectors` starting at `sector`.
    pub fn write(sector: Sectors, sectors: Sectors) -> Self {
        IoRequest {
            sector,
            sectors,
            write: true,
        }
    }
}

#[derive(Debug)]
pub(crate) struct WriteState {
    pub(crate) mode: Mode,
    pub(crate) in_sync: bool,
    pub(crate) sb_flags: SbFlags,
    pub(crate) writes_pending: u64,
    pub(crate) active_io: u64,
    pub(crate) suspended: u32,
    pub(crate) safemode: bool,
}

impl WriteState {
    fn new() -> Self {
        WriteState {
            mode: Mode::ReadWrite,
            in_sync: false,
            sb_flags: SbFlags::empty(),
            writes_pending: 0,
            active_io: 0,
            suspended: 0,
            safemode: false,
        }
    }
}

/// State shared between the reconfiguration path, the I/O path and the
/// background threads.
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) write: Mutex<WriteState>,
    /// Signalled when pending superblock changes have been written.
    pub(crate) sb_wait: Condvar,
    /// Signalled when in-flight I/O drains or a suspension ends.
    pub(crate) suspend_wait: Condvar,
    pub(crate) recovery: AtomicRecovery,
    pub(crate) curr_resync_completed: AtomicU64,
    pub(crate) suspend: SeqLock<(Sectors, Sectors)>,
    pub(crate) pers: RwLock<Option<Arc<dyn Personality>>>,
    pub(crate) devices: RwLock<Arc<Vec<DeviceInfo>>>,
    pub(crate) openers: AtomicUsize,
    pub(crate) persistent: AtomicBool,
    pub(crate) daemon_running: AtomicBool,
    event: Mutex<bool>,
    event_cv: Condvar,
}

impl Shared {
    fn new(name: String) -> Self {
        Shared {
            name,
            write: Mutex::new(WriteState::new()),
            sb_wait: Condvar::new(),
            suspend_wait: Condvar::new(),
            recovery: AtomicRecovery::default(),
            curr_resync_completed: AtomicU64::new(0),
            suspend: SeqLock::new((Sectors(0), Sectors(0))),
            pers: RwLock::new(None),
            devices: RwLock::new(Arc::new(Vec::new())),
            openers: AtomicUsize::new(0),
            persistent: AtomicBool::new(false),
            daemon_running: AtomicBool::new(false),
            event: Mutex::new(false),
            event_cv: Condvar::new(),
        }
    }

    pub(crate) fn personality(&self) -> Option<Arc<dyn Personality>> {
        self.pers.read().clone()
    }

    /// Wakes the daemon thread.
    pub(crate) fn wake_daemon(&self) {
        let mut event = self.event.lock();
        *event = true;
        self.event_cv.notify_all();
    }

    /// Waits for `wake_daemon` or the timeout.
    pub(crate) fn wait_event(&self, timeout: Duration) {
        let mut event = self.event.lock();
        if !*event {
            self.event_cv.wait_for(&mut event, timeout);
        }
        *event = false;
    }

    pub(crate) fn set_sb_flags(&self, flags: SbFlags) {
        self.write.lock().sb_flags.insert(flags);
    }

    pub(crate) fn sb_flags(&self) -> SbFlags {
        self.write.lock().sb_flags
    }

    pub(crate) fn mode(&self) -> Mode {
        self.write.lock().mode
    }

    pub(crate) fn set_mode(&self, mode: Mode) {
        self.write.lock().mode = mode;
    }

    /// Marks the array clean if no writes are in flight.
    ///
    /// Returns the resulting in-sync state.
    pub(crate) fn set_in_sync(&self) -> bool {
        let mut w = self.write.lock();
        if !w.in_sync && w.writes_pending == 0 {
            w.in_sync = true;
            w.sb_flags.insert(SbFlags::CHANGE_CLEAN);
        }
        w.safemode = false;
        w.in_sync
    }

    /// Switches a read-only array back to read-write.
    pub(crate) fn restart(&self) -> Result<()> {
        let devices = self.devices.read().clone();
        if devices.is_empty() {
            bail!(ErrorKind::InvalidArgument("array has no devices".to_owned()));
        }
        if self.pers.read().is_none() {
            bail!(ErrorKind::InvalidArgument("array is not running".to_owned()));
        }
        {
            let mut w = self.write.lock();
            if w.mode == Mode::ReadWrite {
                bail!(ErrorKind::Busy(format!("{} is already read-write", self.name)));
            }
            if let Some(dev) = devices.iter().find(|d| d.read_only && !d.flags.contains(crate::device::DevFlags::FAULTY)) {
                warn!("md: {}: {} is read-only", self.name, dev.name);
                bail!(ErrorKind::ReadOnly(dev.name.clone()));
            }
            w.mode = Mode::ReadWrite;
            w.safemode = false;
        }
        self.recovery.set(Recovery::NEEDED);
        self.wake_daemon();
        debug!("md: {} switched to read-write mode", self.name);
        Ok(())
    }

    /// Returns `true` if a request for `[lo, hi)` must wait.
    fn suspended(&self, w: &WriteState, req: &IoRequest) -> bool {
        if w.suspended > 0 {
            return true;
        }
        if !req.write {
            return false;
        }
        let (lo, hi) = self.suspend.read();
        lo < hi && req.sector < hi && req.sector + req.sectors > lo
    }
}

/// Array state protected by the reconfiguration lock.
pub struct ArrayCore {
    unit: u32,
    name: String,
    pub(crate) meta: ArrayMeta,
    pub(crate) disks: Vec<MemberDevice>,
    /// Unbound devices, released when the lock is dropped.
    deleting: Vec<MemberDevice>,
    private: Option<Box<dyn Any + Send>>,
    pub(crate) shared: Arc<Shared>,
    personalities: Arc<PersonalityTable>,
    registry: Weak<Registry>,
    this: Weak<Array>,
    daemon: Option<MdThread>,
    sync_thread: Option<MdThread>,
    /// End of the running sync pass.
    resync_max: Sectors,
    broken: bool,
    io_pool: Option<Pool>,
}

impl ArrayCore {
    /// Unit number.
    pub fn unit(&self) -> u32 {
        self.unit
    }

    /// Name of the array, e.g. `md0`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Array metadata.
    pub fn meta(&self) -> &ArrayMeta {
        &self.meta
    }

    /// Mutable array metadata.
    pub fn meta_mut(&mut self) -> &mut ArrayMeta {
        &mut self.meta
    }

    /// Bound devices.
    pub fn disks(&self) -> &[MemberDevice] {
        &self.disks
    }

    /// Mutable access to a bound device.
    pub fn disk_mut(&mut self, idx: usize) -> &mut MemberDevice {
        &mut self.disks[idx]
    }

    /// Private data of the running personality.
    pub fn private(&self) -> Option<&(dyn Any + Send)> {
        self.private.as_ref().map(|p| &**p)
    }

    /// Replaces the private data of the personality.
    pub fn set_private(&mut self, private: Box<dyn Any + Send>) {
        self.private = Some(private);
    }

    /// Sets the exported size unless it was configured explicitly.
    pub fn set_array_sectors(&mut self, sectors: Sectors) {
        if !self.meta.external_size {
            self.meta.array_sectors = sectors;
        }
    }

    /// Marks superblock changes.
    pub fn set_sb_flags(&mut self, flags: SbFlags) {
        self.shared.set_sb_flags(flags);
    }

    /// Pending superblock changes.
    pub fn sb_flags(&self) -> SbFlags {
        self.shared.sb_flags()
    }

    /// Recovery state bits.
    pub fn recovery(&self) -> &AtomicRecovery {
        &self.shared.recovery
    }

    /// Access mode.
    pub fn mode(&self) -> Mode {
        self.shared.mode()
    }

    pub(crate) fn set_mode(&mut self, mode: Mode) {
        self.shared.set_mode(mode);
    }

    /// Returns `true` if the array is marked clean.
    pub fn in_sync(&self) -> bool {
        self.shared.write.lock().in_sync
    }

    /// Returns `true` if a personality is attached.
    pub fn is_running(&self) -> bool {
        self.shared.pers.read().is_some()
    }

    /// The attached personality.
    pub fn personality(&self) -> Option<Arc<dyn Personality>> {
        self.shared.personality()
    }

    /// Returns `true` once the array has lost too many devices to operate.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub(crate) fn wake_daemon(&self) {
        self.shared.wake_daemon();
    }

    /// Republishes the device snapshot read by the I/O path.
    pub(crate) fn publish(&self) {
        let snapshot: Vec<DeviceInfo> = self.disks.iter().map(MemberDevice::info).collect();
        *self.shared.devices.write() = Arc::new(snapshot);
    }

    fn reap_deleted(&mut self) {
        for dev in self.deleting.drain(..) {
            debug!("md: export_rdev({})", dev.name());
        }
    }

    pub(crate) fn position(&self, dev: DevId) -> Option<usize> {
        self.disks.iter().position(|d| d.dev == dev)
    }
}

impl fmt::Debug for ArrayCore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ArrayCore")
            .field("name", &self.name)
            .field("meta", &self.meta)
            .field("disks", &self.disks)
            .finish()
    }
}

/// A RAID array.
pub struct Array {
    unit: u32,
    name: String,
    inner: Mutex<ArrayCore>,
    shared: Arc<Shared>,
    registry: Weak<Registry>,
}

/// Holds the reconfiguration lock of an `Array`.
///
/// Dropping the guard releases unbound devices and republishes the device
/// snapshot.
pub struct ArrayGuard<'a> {
    guard: MutexGuard<'a, ArrayCore>,
}

impl<'a> Deref for ArrayGuard<'a> {
    type Target = ArrayCore;

    fn deref(&self) -> &ArrayCore {
        &self.guard
    }
}

impl<'a> DerefMut for ArrayGuard<'a> {
    fn deref_mut(&mut self) -> &mut ArrayCore {
        &mut self.guard
    }
}

impl<'a> Drop for ArrayGuard<'a> {
    fn drop(&mut self) {
        self.guard.reap_deleted();
        self.guard.publish();
    }
}

impl Array {
    pub(crate) fn new(unit: u32, registry: Weak<Registry>, personalities: Arc<PersonalityTable>) -> Arc<Array> {
        let name = format!("md{}", unit);
        let shared = Arc::new(Shared::new(name.clone()));
        Arc::new_cyclic(|this| Array {
            unit,
            name: name.clone(),
            inner: Mutex::new(ArrayCore {
                unit,
                name: name.clone(),
                meta: ArrayMeta::new(unit),
                disks: Vec::new(),
                deleting: Vec::new(),
                private: None,
                shared: Arc::clone(&shared),
                personalities,
                registry: registry.clone(),
                this: this.clone(),
                daemon: None,
                sync_thread: None,
                resync_max: Sectors(0),
                broken: false,
                io_pool: None,
            }),
            shared,
            registry,
        })
    }

    /// Unit number.
    pub fn unit(&self) -> u32 {
        self.unit
    }

    /// Name, e.g. `md0`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Takes the reconfiguration lock.
    pub fn lock(&self) -> ArrayGuard {
        ArrayGuard {
            guard: self.inner.lock(),
        }
    }

    /// Takes the reconfiguration lock, giving up after `timeout`.
    pub fn lock_timeout(&self, timeout: Duration) -> Result<ArrayGuard> {
        match self.inner.try_lock_for(timeout) {
            Some(guard) => Ok(ArrayGuard { guard }),
            None => bail!(ErrorKind::Interrupted),
        }
    }

    /// Takes the reconfiguration lock if it is free.
    pub fn try_lock(&self) -> Option<ArrayGuard> {
        self.inner.try_lock().map(|guard| ArrayGuard { guard })
    }

    /// Snapshot of the member devices.
    pub fn devices(&self) -> Arc<Vec<DeviceInfo>> {
        self.shared.devices.read().clone()
    }

    /// Returns `true` if a personality is attached.
    pub fn is_running(&self) -> bool {
        self.shared.pers.read().is_some()
    }

    /// Access mode.
    pub fn mode(&self) -> Mode {
        self.shared.mode()
    }

    /// Recovery state bits.
    pub fn recovery(&self) -> &AtomicRecovery {
        &self.shared.recovery
    }

    /// Registers an opener. Open arrays cannot be stopped.
    pub fn open(&self) {
        self.shared.openers.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops an opener.
    pub fn close(&self) {
        let prev = self.shared.openers.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    /// Number of openers.
    pub fn open_count(&self) -> usize {
        self.shared.openers.load(Ordering::SeqCst)
    }

    /// Returns `true` if the array holds no devices and no configuration.
    pub fn is_unused(&self) -> bool {
        let md = self.lock();
        md.disks.is_empty() && md.meta.raid_disks == 0 && !md.meta.persistent() && !md.meta.external()
    }

    /// Starts the management thread handling recovery in the background.
    pub fn start_daemon(&self) -> Result<()> {
        let mut md = self.lock();
        md.start_daemon()
    }

    /// Stops the management thread.
    pub fn stop_daemon(&self) {
        let daemon = self.lock().daemon.take();
        if let Some(daemon) = daemon {
            self.shared.daemon_running.store(false, Ordering::SeqCst);
            daemon.stop(&self.shared);
        }
    }

    /// Runs one pass of recovery management.
    pub fn check_recovery(&self) {
        let mut md = self.lock();
        md.check_recovery();
    }

    fn check_recovery_nowait(&self) -> bool {
        match self.try_lock() {
            Some(mut md) => {
                md.check_recovery();
                true
            }
            None => false,
        }
    }

    /// Waits until the sync thread has finished and been reaped.
    pub fn wait_for_sync(&self, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.shared.recovery.test(Recovery::DONE) {
                self.check_recovery();
            }
            if !self.shared.recovery.test(Recovery::RUNNING) {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                bail!(ErrorKind::Interrupted);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Array").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{AtomicRecovery, Recovery, SbFlags};

    #[test]
    fn sb_flags_take_clears_only_requested_bits() {
        let mut f = SbFlags::CHANGE_DEVS | SbFlags::CHANGE_PENDING;
        assert!(f.take(SbFlags::CHANGE_DEVS | SbFlags::CHANGE_CLEAN));
        assert_eq!(f, SbFlags::CHANGE_PENDING);
        assert!(!f.take(SbFlags::CHANGE_CLEAN));
        assert!(f.take(SbFlags::CHANGE_PENDING));
        assert!(f.is_empty());
    }

    #[test]
    fn recovery_bits() {
        let r = AtomicRecovery::default();
        r.set(Recovery::RUNNING | Recovery::SYNC);
        assert!(r.test(Recovery::SYNC | Recovery::RECOVER));
        assert!(!r.test(Recovery::RECOVER));
        assert!(r.test_and_clear(Recovery::SYNC));
        assert!(!r.test_and_clear(Recovery::SYNC));
        assert_eq!(r.load(), Recovery::RUNNING);
        r.clear(Recovery::RUNNING);
        assert!(r.load().is_empty());
        r.set(Recovery::INTR | Recovery::ERROR);
        r.reset();
        assert_eq!(r.load(), Recovery::empty());
    }
}
