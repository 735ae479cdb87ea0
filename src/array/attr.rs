//! Textual attributes of arrays and their member devices.
//!
//! Values are parsed and formatted the way `mdadm` expects them in sysfs:
//! sizes in KiB unless noted otherwise, `none` for unset positions.
use super::{Array, ArrayCore, ArrayState, ErrorKind, Recovery, ReshapeChange, Result, SbFlags, SyncAction};
use crate::blockdev::DevId;
use crate::device::DevFlags;
use crate::meta::{Metadata, LEVEL_NONE};
use crate::units::{Sectors, MAX_SECTOR};
use std::str::FromStr;

fn parse<T: FromStr>(attr: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ErrorKind::InvalidArgument(format!("{}: cannot parse {:?}", attr, value)).into())
}

fn parse_position(attr: &str, value: &str) -> Result<Option<Sectors>> {
    if value.trim() == "none" {
        Ok(None)
    } else {
        parse(attr, value).map(|n| Some(Sectors(n)))
    }
}

fn show_position(pos: Sectors) -> String {
    if pos.is_max() {
        "none".to_owned()
    } else {
        pos.as_u64().to_string()
    }
}

fn unknown(attr: &str) -> ErrorKind {
    ErrorKind::InvalidArgument(format!("unknown attribute {}", attr))
}

impl ArrayCore {
    fn show_level(&self) -> String {
        if let Some(pers) = self.personality() {
            pers.name().to_owned()
        } else if !self.meta.clevel.is_empty() {
            self.meta.clevel.clone()
        } else if self.meta.level != LEVEL_NONE {
            self.meta.level.to_string()
        } else {
            String::new()
        }
    }

    fn show_metadata_version(&self) -> String {
        match self.meta.metadata {
            Metadata::Persistent { major, minor } => format!("{}.{:02}", major, minor),
            Metadata::External(ref name) => format!("external:{}", name),
            Metadata::None => "none".to_owned(),
        }
    }

    fn store_metadata_version(&mut self, value: &str) -> Result<()> {
        let value = value.trim();
        let external = value.starts_with("external:");
        if !(self.meta.external() && external) && !self.disks.is_empty() {
            bail!(ErrorKind::Busy(format!("{} has devices", self.name)));
        }
        self.meta.metadata = if value == "none" {
            Metadata::None
        } else if external {
            Metadata::External(value["external:".len()..].to_owned())
        } else {
            let mut parts = value.splitn(2, '.');
            let major: u32 = parse("metadata_version", parts.next().unwrap_or(""))?;
            let minor: u32 = parse("metadata_version", parts.next().unwrap_or(""))?;
            if major > 1 {
                bail!(ErrorKind::InvalidArgument(format!("metadata version {}", value)));
            }
            Metadata::Persistent { major, minor }
        };
        debug!("md: {}: metadata {}", self.name, self.show_metadata_version());
        Ok(())
    }

    fn store_resync_start(&mut self, value: &str) -> Result<()> {
        if self.is_running() && !self.shared.recovery.test(Recovery::FROZEN) {
            bail!(ErrorKind::Busy(format!("{} is syncing", self.name)));
        }
        self.meta.recovery_cp = parse_position("resync_start", value)?.unwrap_or(MAX_SECTOR);
        if self.is_running() {
            self.set_sb_flags(SbFlags::CHANGE_CLEAN);
        }
        Ok(())
    }

    fn device_index(&self, dev: DevId) -> Result<usize> {
        match self.position(dev) {
            Some(idx) => Ok(idx),
            None => bail!(ErrorKind::NoSuchDevice(dev.to_string())),
        }
    }

    fn show_device_state(&self, idx: usize) -> String {
        let dev = &self.disks[idx];
        let flags = dev.flags;
        let mut words = Vec::new();
        if flags.contains(DevFlags::FAULTY) {
            words.push("faulty");
        }
        if flags.contains(DevFlags::IN_SYNC) {
            words.push("in_sync");
        }
        if flags.contains(DevFlags::WRITE_MOSTLY) {
            words.push("write_mostly");
        }
        if flags.contains(DevFlags::BLOCKED) {
            words.push("blocked");
        }
        if !flags.contains(DevFlags::FAULTY) && !flags.contains(DevFlags::IN_SYNC) {
            words.push("spare");
        }
        words.join(",")
    }

    fn store_device_state(&mut self, idx: usize, value: &str) -> Result<()> {
        match value.trim() {
            "faulty" => {
                if !self.is_running() {
                    bail!(ErrorKind::NotRunning);
                }
                self.md_error(idx);
                if !self.disks[idx].is_faulty() {
                    bail!(ErrorKind::Busy(format!("{} cannot fail", self.disks[idx].name())));
                }
            }
            "remove" => {
                if self.is_running() {
                    self.disks[idx].flags.remove(DevFlags::BLOCKED);
                    self.remove_and_add_spares(Some(idx), false);
                }
                if self.disks[idx].raid_disk.is_some() {
                    bail!(ErrorKind::Busy(format!("{} is active", self.disks[idx].name())));
                }
                self.unbind(idx);
                if self.is_running() {
                    self.set_sb_flags(SbFlags::CHANGE_DEVS);
                    self.update_superblocks(true)?;
                }
            }
            "writemostly" => self.disks[idx].flags.insert(DevFlags::WRITE_MOSTLY),
            "-writemostly" => self.disks[idx].flags.remove(DevFlags::WRITE_MOSTLY),
            "blocked" => self.disks[idx].flags.insert(DevFlags::BLOCKED),
            "-blocked" => {
                self.disks[idx].flags.remove(DevFlags::BLOCKED);
                self.shared.recovery.set(Recovery::NEEDED);
                self.wake_daemon();
            }
            "insync" => {
                if self.disks[idx].raid_disk.is_some() {
                    bail!(ErrorKind::Busy(format!("{} has a slot", self.disks[idx].name())));
                }
                self.disks[idx].flags.insert(DevFlags::IN_SYNC);
            }
            other => bail!(ErrorKind::InvalidArgument(format!("device state {:?}", other))),
        }
        Ok(())
    }

    fn store_slot(&mut self, idx: usize, value: &str) -> Result<()> {
        let slot = match value.trim() {
            "none" => None,
            v => Some(parse::<u32>("slot", v)?),
        };
        let limit = (self.meta.raid_disks as i64 + i64::from(self.meta.delta_disks).max(0)) as u32;
        let pers = match self.personality() {
            Some(pers) => pers,
            None => {
                if let Some(s) = slot {
                    if s >= self.meta.raid_disks && s >= limit {
                        bail!(ErrorKind::CapacityExceeded(format!("slot {}", s)));
                    }
                }
                let dev = &mut self.disks[idx];
                dev.raid_disk = slot;
                if slot.is_some() {
                    dev.flags.remove(DevFlags::FAULTY);
                    dev.flags.remove(DevFlags::WRITE_MOSTLY);
                    dev.flags.insert(DevFlags::IN_SYNC);
                }
                return Ok(());
            }
        };
        match slot {
            None => {
                if self.disks[idx].raid_disk.is_none() {
                    return Ok(());
                }
                self.remove_and_add_spares(Some(idx), false);
                if self.disks[idx].raid_disk.is_some() {
                    bail!(ErrorKind::Busy(format!("{} is active", self.disks[idx].name())));
                }
            }
            Some(s) => {
                if self.disks[idx].raid_disk.is_some() {
                    bail!(ErrorKind::Busy(format!("{} already has a slot", self.disks[idx].name())));
                }
                if s >= limit {
                    bail!(ErrorKind::CapacityExceeded(format!("slot {}", s)));
                }
                {
                    let dev = &mut self.disks[idx];
                    dev.flags.remove(DevFlags::IN_SYNC);
                    dev.raid_disk = Some(s);
                    dev.saved_raid_disk = Some(s);
                    dev.recovery_offset = Sectors(0);
                }
                if let Err(e) = pers.hot_add_disk(self, idx) {
                    self.disks[idx].raid_disk = None;
                    return Err(e);
                }
                self.set_sb_flags(SbFlags::CHANGE_DEVS);
                self.shared.recovery.set(Recovery::NEEDED);
                self.wake_daemon();
            }
        }
        Ok(())
    }

    fn store_offset(&mut self, idx: usize, value: &str) -> Result<()> {
        let offset = Sectors(parse("offset", value)?);
        let external = self.meta.external();
        let running = self.is_running();
        let dev = &mut self.disks[idx];
        if running && dev.raid_disk.is_some() {
            bail!(ErrorKind::Busy(format!("{} is active", dev.name())));
        }
        if dev.sectors != Sectors(0) && external {
            // The offset must be set before the size.
            bail!(ErrorKind::Busy(format!("{} already has a size", dev.name())));
        }
        dev.data_offset = offset;
        dev.new_data_offset = offset;
        Ok(())
    }
}

impl Array {
    /// Formats an array attribute.
    pub fn show(&self, attr: &str) -> Result<String> {
        let md = self.lock();
        let meta = &md.meta;
        let pending = meta.reshape_pending();
        let value = match attr {
            "level" => md.show_level(),
            "layout" => {
                if pending && meta.layout != meta.new_layout {
                    format!("{} ({})", meta.new_layout, meta.layout)
                } else {
                    meta.layout.to_string()
                }
            }
            "raid_disks" => {
                if pending && meta.delta_disks != 0 {
                    let old = meta.raid_disks as i64 - i64::from(meta.delta_disks);
                    format!("{} ({})", meta.raid_disks, old)
                } else {
                    meta.raid_disks.to_string()
                }
            }
            "chunk_size" => {
                if pending && meta.chunk_sectors != meta.new_chunk_sectors {
                    format!(
                        "{} ({})",
                        u64::from(meta.new_chunk_sectors) << 9,
                        u64::from(meta.chunk_sectors) << 9
                    )
                } else {
                    (u64::from(meta.chunk_sectors) << 9).to_string()
                }
            }
            "array_state" => md.array_state().to_string(),
            "resync_start" => show_position(meta.recovery_cp),
            "metadata_version" => md.show_metadata_version(),
            "component_size" | "size" => meta.dev_sectors.as_kib().to_string(),
            "array_size" => {
                if meta.external_size {
                    meta.array_sectors.as_kib().to_string()
                } else {
                    "default".to_owned()
                }
            }
            "sync_action" => md.sync_action().to_string(),
            "suspend_lo" => md.suspend_window().0.as_u64().to_string(),
            "suspend_hi" => md.suspend_window().1.as_u64().to_string(),
            "reshape_position" => show_position(meta.reshape_position),
            "degraded" => meta.degraded.to_string(),
            _ => return Err(unknown(attr).into()),
        };
        Ok(value)
    }

    /// Parses and applies an array attribute.
    pub fn store(&self, attr: &str, value: &str) -> Result<()> {
        let result = self.store_attr(attr, value);
        if let Err(ref e) = result {
            warn!("md: {}: {} <- {:?} refused: {}", self.name, attr, value.trim(), e);
        }
        result
    }

    fn store_attr(&self, attr: &str, value: &str) -> Result<()> {
        match attr {
            "array_state" => return self.set_array_state(value.parse::<ArrayState>()?),
            "new_dev" => return self.store_new_dev(value),
            _ => {}
        }
        let mut md = self.lock();
        match attr {
            "level" => md.level_change(value),
            "layout" => md.reshape_request(ReshapeChange::Layout(parse(attr, value)?)),
            "raid_disks" => md.reshape_request(ReshapeChange::RaidDisks(parse(attr, value)?)),
            "chunk_size" => {
                let bytes: u64 = parse(attr, value)?;
                if bytes % 512 != 0 {
                    bail!(ErrorKind::InvalidArgument(format!("chunk size {}", bytes)));
                }
                md.reshape_request(ReshapeChange::ChunkSectors((bytes >> 9) as u32))
            }
            "resync_start" => md.store_resync_start(value),
            "metadata_version" => md.store_metadata_version(value),
            "component_size" | "size" => md.resize_array(Sectors::from_kib(parse(attr, value)?)),
            "array_size" => {
                if value.trim() == "default" {
                    md.set_array_size(None)
                } else {
                    md.set_array_size(Some(Sectors::from_kib(parse(attr, value)?)))
                }
            }
            "sync_action" => md.set_sync_action(value.parse::<SyncAction>()?),
            "suspend_lo" => {
                md.set_suspend_lo(Sectors(parse(attr, value)?));
                Ok(())
            }
            "suspend_hi" => {
                md.set_suspend_hi(Sectors(parse(attr, value)?));
                Ok(())
            }
            "reshape_position" => md.set_reshape_position(parse_position(attr, value)?),
            _ => Err(unknown(attr).into()),
        }
    }

    fn store_new_dev(&self, value: &str) -> Result<()> {
        let dev: DevId = value.parse()?;
        let registry = match self.registry.upgrade() {
            Some(registry) => registry,
            None => bail!(ErrorKind::NotRunning),
        };
        let bdev = registry.opener().open(dev)?;
        let mut md = self.lock();
        md.add_device(bdev)?;
        Ok(())
    }

    /// Formats an attribute of the member device `dev`.
    pub fn show_device(&self, dev: DevId, attr: &str) -> Result<String> {
        let md = self.lock();
        let idx = md.device_index(dev)?;
        let d = &md.disks[idx];
        let value = match attr {
            "state" => md.show_device_state(idx),
            "errors" => d.corrected_errors.to_string(),
            "slot" => d.raid_disk.map_or_else(|| "none".to_owned(), |s| s.to_string()),
            "offset" => d.data_offset.as_u64().to_string(),
            "size" => d.sectors.as_kib().to_string(),
            "recovery_start" => {
                if d.is_in_sync() || d.is_faulty() {
                    "none".to_owned()
                } else {
                    d.recovery_offset.as_u64().to_string()
                }
            }
            _ => return Err(unknown(attr).into()),
        };
        Ok(value)
    }

    /// Parses and applies an attribute of the member device `dev`.
    pub fn store_device(&self, dev: DevId, attr: &str, value: &str) -> Result<()> {
        let result = self.store_device_attr(dev, attr, value);
        if let Err(ref e) = result {
            warn!(
                "md: {}: {} {} <- {:?} refused: {}",
                self.name,
                dev,
                attr,
                value.trim(),
                e
            );
        }
        result
    }

    fn store_device_attr(&self, dev: DevId, attr: &str, value: &str) -> Result<()> {
        if attr == "size" {
            let kib: u64 = parse(attr, value)?;
            return self.resize_device(dev, Sectors::from_kib(kib)).map(|_| ());
        }
        let mut md = self.lock();
        let idx = md.device_index(dev)?;
        match attr {
            "state" => md.store_device_state(idx, value),
            "errors" => {
                md.disks[idx].corrected_errors = parse(attr, value)?;
                Ok(())
            }
            "slot" => md.store_slot(idx, value),
            "offset" => md.store_offset(idx, value),
            _ => Err(unknown(attr).into()),
        }
    }
}
