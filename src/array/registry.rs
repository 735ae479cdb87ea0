//! Binding devices to arrays.
use super::{ArrayCore, ErrorKind, Mode, Result};
use crate::blockdev::{BlockDevice, DevId};
use crate::device::{DevFlags, MemberDevice};
use crate::meta::Metadata;
use crate::superblock::Format;
use crate::units::Sectors;

/// Wraps `bdev` into a `MemberDevice`.
///
/// With a format the superblock is loaded and checked for consistency on
/// its own. Devices without capacity are refused.
pub fn import_device(bdev: Box<dyn BlockDevice>, format: Option<(Format, u32)>) -> Result<MemberDevice> {
    let mut dev = MemberDevice::new(bdev);
    if dev.device_size() == Sectors(0) {
        warn!("md: {} has zero or unknown size, marking faulty!", dev.name());
        bail!(ErrorKind::InvalidArgument(format!("{} has zero size", dev.name())));
    }
    if let Some((format, minor)) = format {
        if let Err(e) = format.load_super(&mut dev, None, minor) {
            warn!("md: could not read {}'s superblock: {}", dev.name(), e);
            return Err(e.into());
        }
    }
    Ok(dev)
}

impl ArrayCore {
    /// Attaches `dev` to this array.
    ///
    /// Returns the index of the device in `disks()`.
    pub fn bind(&mut self, mut dev: MemberDevice) -> Result<usize> {
        let running = self.is_running();
        if self.position(dev.dev).is_some() {
            bail!(ErrorKind::DuplicateDevice(dev.name().to_owned()));
        }
        if dev.bdev.read_only() && running && self.mode() == Mode::ReadWrite {
            bail!(ErrorKind::ReadOnly(dev.name().to_owned()));
        }

        // Make sure the device is big enough for the array.
        if dev.sectors != Sectors(0)
            && (self.meta.dev_sectors == Sectors(0) || dev.sectors < self.meta.dev_sectors)
        {
            if running {
                // Cannot change the size while running, except for
                // levels without a component size.
                if self.meta.level > 0 {
                    bail!(ErrorKind::SizeMismatch(dev.name().to_owned()));
                }
            } else {
                self.meta.dev_sectors = dev.sectors;
            }
        }

        let desc_nr = match dev.desc_nr {
            Some(nr) => {
                if self.find_by_number(nr).is_some() {
                    bail!(ErrorKind::Busy(format!("descriptor {} is taken", nr)));
                }
                nr
            }
            None => {
                let mut choice = if running { self.meta.raid_disks } else { 0 };
                while self.find_by_number(choice).is_some() {
                    choice += 1;
                }
                choice
            }
        };
        if self.meta.max_disks != 0 && desc_nr >= self.meta.max_disks {
            warn!(
                "md: {}: array is limited to {} devices",
                self.name(),
                self.meta.max_disks
            );
            bail!(ErrorKind::CapacityExceeded(format!(
                "descriptor {} beyond {} devices",
                desc_nr, self.meta.max_disks
            )));
        }
        dev.desc_nr = Some(desc_nr);
        dev.owner = Some(self.unit());
        self.meta.recovery_disabled = false;
        debug!("md: bind<{}>", dev.name());
        self.disks.push(dev);
        Ok(self.disks.len() - 1)
    }

    /// Detaches `disks()[idx]`. The device is released when the lock is
    /// dropped.
    pub fn unbind(&mut self, idx: usize) {
        let mut dev = self.disks.remove(idx);
        debug!("md: unbind<{}>", dev.name());
        dev.owner = None;
        dev.flags.remove(DevFlags::BLOCKED);
        self.deleting.push(dev);
    }

    /// Unbinds a device found unusable during assembly.
    pub(crate) fn kick(&mut self, idx: usize) {
        info!("md: kicking {} from array!", self.disks[idx].name());
        self.unbind(idx);
    }

    /// Unbinds all devices and forgets the geometry.
    pub fn export_array(&mut self) {
        while !self.disks.is_empty() {
            let last = self.disks.len() - 1;
            self.unbind(last);
        }
        self.meta.raid_disks = 0;
        if let Metadata::Persistent { ref mut major, .. } = self.meta.metadata {
            *major = 0;
        }
    }

    /// Finds a device by descriptor number.
    pub fn find_by_number(&self, desc_nr: u32) -> Option<&MemberDevice> {
        self.disks.iter().find(|d| d.desc_nr == Some(desc_nr))
    }

    /// Finds a device by device number.
    pub fn find_by_identity(&self, dev: DevId) -> Option<&MemberDevice> {
        self.disks.iter().find(|d| d.dev == dev)
    }

    /// Imports and binds a device.
    ///
    /// For persistent metadata the superblock must match the first bound
    /// device. External metadata marks the device in sync; user space
    /// manages its state from then on.
    pub fn add_device(&mut self, bdev: Box<dyn BlockDevice>) -> Result<usize> {
        if self.position(bdev.dev_id()).is_some() {
            bail!(ErrorKind::DuplicateDevice(bdev.id().to_owned()));
        }
        let idx = match self.meta.metadata.clone() {
            Metadata::Persistent { .. } => {
                let (format, minor) = Format::from_metadata(&self.meta.metadata)?;
                let mut dev = import_device(bdev, None)?;
                let reference = self.disks.first().and_then(|d| d.superblock().cloned());
                if let Err(e) = format.load_super(&mut dev, reference.as_ref(), minor) {
                    warn!(
                        "md: {} has different UUID to {}",
                        dev.name(),
                        self.disks.first().map(|d| d.name()).unwrap_or("array")
                    );
                    return Err(e.into());
                }
                self.bind(dev)?
            }
            Metadata::External(_) => {
                let mut dev = import_device(bdev, None)?;
                dev.flags.insert(DevFlags::IN_SYNC);
                self.bind(dev)?
            }
            Metadata::None => self.bind(import_device(bdev, None)?)?,
        };
        Ok(idx)
    }
}
