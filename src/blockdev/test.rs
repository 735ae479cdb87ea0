use super::{AtomicStatistics, BlockDevice, DevId, DeviceOpener, Error, ErrorKind, Result, Statistics};
use crate::units::{Sectors, SECTOR_SIZE};
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_xorshift::XorShiftRng;
use seqlock::SeqLock;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FailureMode {
    NoFail,
    FailOperation,
    BadData,
}

/// In-memory device with injectable failures. Clones share the buffer.
#[derive(Clone)]
pub struct FailingDevice {
    inner: Arc<Inner>,
}

struct Inner {
    buffer: Mutex<Box<[u8]>>,
    id: String,
    dev: DevId,
    read_only: SeqLock<bool>,
    fail_reads: SeqLock<FailureMode>,
    fail_writes: SeqLock<FailureMode>,
    stats: AtomicStatistics,
}

impl FailingDevice {
    pub fn new(size: Sectors, dev: DevId) -> Self {
        FailingDevice {
            inner: Arc::new(Inner {
                buffer: Mutex::new(vec![0; size.to_bytes() as usize].into_boxed_slice()),
                id: format!("mem{}", dev),
                dev,
                read_only: SeqLock::new(false),
                fail_reads: SeqLock::new(FailureMode::NoFail),
                fail_writes: SeqLock::new(FailureMode::NoFail),
                stats: Default::default(),
            }),
        }
    }

    pub fn boxed(&self) -> Box<dyn BlockDevice> {
        Box::new(self.clone())
    }

    pub fn fail_writes(&self, failure_mode: FailureMode) {
        *self.inner.fail_writes.lock_write() = failure_mode;
    }

    pub fn fail_reads(&self, failure_mode: FailureMode) {
        *self.inner.fail_reads.lock_write() = failure_mode;
    }

    pub fn set_read_only(&self, read_only: bool) {
        *self.inner.read_only.lock_write() = read_only;
    }

    pub fn write_requests(&self) -> u64 {
        self.inner.stats.write_requests.load(Ordering::Relaxed)
    }

    /// Returns a copy of `len` bytes at `offset`.
    pub fn contents(&self, offset: Sectors, len: usize) -> Vec<u8> {
        let start = offset.to_bytes() as usize;
        self.inner.buffer.lock()[start..start + len].to_vec()
    }

    /// Overwrites the stored bytes at `offset` without counting a request.
    pub fn poke(&self, offset: Sectors, data: &[u8]) {
        let start = offset.to_bytes() as usize;
        self.inner.buffer.lock()[start..start + data.len()].copy_from_slice(data);
    }

    fn range(&self, len: usize, offset: Sectors) -> Result<(usize, usize)> {
        let start = offset.to_bytes() as usize;
        let end = start + len;
        if end > self.inner.buffer.lock().len() {
            bail!(ErrorKind::OutOfRange(self.inner.id.clone()));
        }
        Ok((start, end))
    }
}

impl BlockDevice for FailingDevice {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn dev_id(&self) -> DevId {
        self.inner.dev
    }

    fn size(&self) -> Sectors {
        Sectors::from_bytes(self.inner.buffer.lock().len() as u64)
    }

    fn read_only(&self) -> bool {
        self.inner.read_only.read()
    }

    fn read_at(&self, buf: &mut [u8], offset: Sectors) -> Result<()> {
        let (start, end) = self.range(buf.len(), offset)?;
        let sectors = (buf.len() / SECTOR_SIZE) as u64;
        self.inner.stats.read.fetch_add(sectors, Ordering::Relaxed);
        match self.inner.fail_reads.read() {
            FailureMode::NoFail => {
                buf.copy_from_slice(&self.inner.buffer.lock()[start..end]);
                Ok(())
            }
            FailureMode::FailOperation => {
                self.inner
                    .stats
                    .failed_reads
                    .fetch_add(sectors, Ordering::Relaxed);
                Err(Error::from(ErrorKind::ReadError(self.inner.id.clone())))
            }
            FailureMode::BadData => {
                for (x, b) in buf.iter_mut().enumerate() {
                    *b = (3 * x + start) as u8;
                }
                Ok(())
            }
        }
    }

    fn write_at(&self, data: &[u8], offset: Sectors) -> Result<()> {
        let (start, end) = self.range(data.len(), offset)?;
        let sectors = (data.len() / SECTOR_SIZE) as u64;
        self.inner.stats.written.fetch_add(sectors, Ordering::Relaxed);
        if self.read_only() {
            bail!(ErrorKind::WriteError(self.inner.id.clone()));
        }
        let bad_data;
        let slice = match self.inner.fail_writes.read() {
            FailureMode::NoFail => data,
            FailureMode::FailOperation => {
                self.inner
                    .stats
                    .failed_writes
                    .fetch_add(sectors, Ordering::Relaxed);
                return Err(Error::from(ErrorKind::WriteError(self.inner.id.clone())));
            }
            FailureMode::BadData => {
                bad_data = (0..data.len())
                    .map(|x| (7 * x + start) as u8)
                    .collect::<Vec<_>>();
                &bad_data[..]
            }
        };
        self.inner.buffer.lock()[start..end].copy_from_slice(slice);
        self.inner
            .stats
            .write_requests
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> Statistics {
        self.inner.stats.as_stats()
    }
}

/// Hands out registered `FailingDevice`s by device number.
#[derive(Default)]
pub struct MemoryOpener {
    devices: Mutex<HashMap<DevId, FailingDevice>>,
}

impl MemoryOpener {
    pub fn insert(&self, dev: FailingDevice) {
        self.devices.lock().insert(dev.dev_id(), dev);
    }
}

impl DeviceOpener for MemoryOpener {
    fn open(&self, dev: DevId) -> Result<Box<dyn BlockDevice>> {
        match self.devices.lock().get(&dev) {
            Some(d) => Ok(d.boxed()),
            None => bail!(ErrorKind::NoSuchDevice(dev.to_string())),
        }
    }
}

pub fn generate_data(idx: usize, offset: Sectors, len: usize) -> Box<[u8]> {
    let mut seed = [0u8; 16];
    seed[..4].copy_from_slice(&(len as u32 + 1).to_le_bytes());
    seed[4..8].copy_from_slice(&(idx as u32).to_le_bytes());
    seed[8..].copy_from_slice(&offset.as_u64().to_le_bytes());
    let mut rng = XorShiftRng::from_seed(seed);

    let mut data = vec![0; len].into_boxed_slice();
    rng.fill_bytes(&mut data);
    data
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
