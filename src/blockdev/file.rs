use super::errors::*;
use super::{AtomicStatistics, BlockDevice, DevId, DeviceOpener, Statistics};
use crate::units::{Sectors, SECTOR_SIZE};
use libc::{c_int, c_ulong, ioctl};
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, FileTypeExt, MetadataExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::Ordering;

/// `BlockDevice` that is backed by a file or a block device node.
pub struct File {
    file: fs::File,
    id: String,
    dev: DevId,
    size: Sectors,
    block_size: usize,
    read_only: bool,
    stats: AtomicStatistics,
}

impl File {
    /// Creates a new `File`.
    ///
    /// Regular files get the device number `0:<inode>` since they have no
    /// device node of their own.
    pub fn new(file: fs::File, id: String, read_only: bool) -> Result<Self> {
        let metadata = file.metadata()?;
        let file_type = metadata.file_type();
        let (size, block_size, dev) = if file_type.is_file() {
            let size = Sectors(metadata.len() / SECTOR_SIZE as u64);
            (size, SECTOR_SIZE, DevId::new(0, metadata.ino() as u32))
        } else if file_type.is_block_device() {
            let rdev = metadata.rdev();
            let dev = DevId::new(libc::major(rdev) as u32, libc::minor(rdev) as u32);
            (
                get_block_device_size(&file)?,
                get_logical_block_size(&file)?,
                dev,
            )
        } else {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("Unsupported file type: {:?}", file_type),
            )
            .into());
        };
        if size == Sectors(0) {
            bail!(ErrorKind::Empty(id));
        }
        Ok(File {
            file,
            id,
            dev,
            size,
            block_size,
            read_only,
            stats: Default::default(),
        })
    }

    /// Opens `path` read-write, or read-only if `read_only` is set.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        File::new(file, path.to_string_lossy().into_owned(), read_only)
    }

    fn check_range(&self, len: usize, offset: Sectors) -> Result<()> {
        let end = offset.to_bytes() + len as u64;
        if end > self.size.to_bytes() {
            bail!(ErrorKind::OutOfRange(self.id.clone()));
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn get_block_device_size(file: &fs::File) -> Result<Sectors> {
    const BLKGETSIZE64: c_ulong = 2148012658;
    let mut size: u64 = 0;
    let result = unsafe { ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
    if result == 0 {
        Ok(Sectors(size / SECTOR_SIZE as u64))
    } else {
        Err(io::Error::last_os_error().into())
    }
}

#[cfg(target_os = "linux")]
fn get_logical_block_size(file: &fs::File) -> Result<usize> {
    const BLKSSZGET: c_ulong = 0x1268;
    let mut size: c_int = 0;
    let result = unsafe { ioctl(file.as_raw_fd(), BLKSSZGET, &mut size) };
    if result == 0 && size > 0 {
        Ok(size as usize)
    } else {
        Err(io::Error::last_os_error().into())
    }
}

impl BlockDevice for File {
    fn id(&self) -> &str {
        &self.id
    }

    fn dev_id(&self) -> DevId {
        self.dev
    }

    fn size(&self) -> Sectors {
        self.size
    }

    fn logical_block_size(&self) -> usize {
        self.block_size
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn read_at(&self, buf: &mut [u8], offset: Sectors) -> Result<()> {
        self.check_range(buf.len(), offset)?;
        let sectors = (buf.len() / SECTOR_SIZE) as u64;
        self.stats.read.fetch_add(sectors, Ordering::Relaxed);
        match self.file.read_exact_at(buf, offset.to_bytes()) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.stats.failed_reads.fetch_add(sectors, Ordering::Relaxed);
                Err(Error::from(e)).chain_err(|| ErrorKind::ReadError(self.id.clone()))
            }
        }
    }

    fn write_at(&self, data: &[u8], offset: Sectors) -> Result<()> {
        if self.read_only {
            bail!(ErrorKind::WriteError(self.id.clone()));
        }
        self.check_range(data.len(), offset)?;
        let sectors = (data.len() / SECTOR_SIZE) as u64;
        self.stats.written.fetch_add(sectors, Ordering::Relaxed);
        match self.file.write_all_at(data, offset.to_bytes()) {
            Ok(()) => {
                self.stats.write_requests.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.failed_writes.fetch_add(sectors, Ordering::Relaxed);
                Err(Error::from(e)).chain_err(|| ErrorKind::WriteError(self.id.clone()))
            }
        }
    }

    fn flush(&self) -> Result<()> {
        Ok(self.file.sync_data()?)
    }

    fn stats(&self) -> Statistics {
        self.stats.as_stats()
    }
}

/// Opens devices through the `/dev/block/<major>:<minor>` links.
#[derive(Debug, Default)]
pub struct DevPathOpener;

impl DeviceOpener for DevPathOpener {
    fn open(&self, dev: DevId) -> Result<Box<dyn BlockDevice>> {
        let path = format!("/dev/block/{}", dev);
        match File::open(&path, false) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) => Err(e).chain_err(|| ErrorKind::NoSuchDevice(dev.to_string())),
        }
    }
}
