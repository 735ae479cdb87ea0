//! Array assembly configuration.
use crate::array::{self, Array, ArrayState, ReshapeChange};
use crate::blockdev::{self, BlockDevice, File};
use crate::context::MdContext;
use crate::device::DevFlags;
use crate::meta::Metadata;
use crate::units::Sectors;
use itertools::Itertools;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Describes one array: how to find its members and, for arrays without
/// superblocks, its geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Unit number of the array.
    pub unit: u32,
    /// `1.2`, `0.90`, `external:<name>` or `none`.
    #[serde(default = "default_metadata")]
    pub metadata: String,
    /// Level name, required without superblocks.
    #[serde(default)]
    pub level: Option<String>,
    /// Layout, without superblocks.
    #[serde(default)]
    pub layout: Option<u32>,
    /// Chunk size such as `64K`, without superblocks.
    #[serde(default)]
    pub chunk: Option<String>,
    /// Component size such as `1G`; defaults to the smallest member.
    #[serde(default)]
    pub size: Option<String>,
    /// Start the array read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Member devices.
    pub devices: Vec<Member>,
}

/// A member device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Member {
    /// The member fills the next slot.
    Active(PathBuf),
    /// The member is a spare.
    Spare(PathBuf),
}

fn default_metadata() -> String {
    "1.2".to_owned()
}

error_chain! {
    links {
        Array(array::Error, array::ErrorKind);
        Device(blockdev::Error, blockdev::ErrorKind);
    }
    foreign_links {
        Toml(::toml::de::Error);
        TomlSer(::toml::ser::Error);
    }
    errors {
        #[allow(missing_docs)]
        InvalidKeyword(keyword: String) {
            description("invalid keyword")
            display("invalid keyword '{}'", keyword)
        }
        #[allow(missing_docs)]
        InvalidValue(key: String, value: String) {
            description("invalid value")
            display("invalid value '{}' for {}", value, key)
        }
    }
}

impl Configuration {
    /// Returns a new `Configuration` for array `unit` assembled from
    /// `devices`.
    pub fn new(unit: u32, devices: Vec<Member>) -> Self {
        Configuration {
            unit,
            metadata: default_metadata(),
            level: None,
            layout: None,
            chunk: None,
            size: None,
            read_only: false,
            devices,
        }
    }

    /// Parses a TOML document.
    pub fn from_toml(s: &str) -> Result<Self> {
        Ok(::toml::from_str(s)?)
    }

    /// Serializes to TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(::toml::to_string(self)?)
    }

    /// Parses the configuration from an mdadm-like representation.
    ///
    /// The first token names the array (`mdN`). Options are given as
    /// `--key=value`; paths are members filling slots in order, the keyword
    /// `spare` makes all immediately following paths spares.
    ///
    /// # Example
    /// `md0 --level=raid1 --metadata=none /dev/sda /dev/sdb spare /dev/sdc`
    /// describes a two way mirror without superblocks and one spare.
    pub fn parse_mdadm_like<I, S>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut iter = iter.into_iter().peekable();
        let unit = match iter.next() {
            Some(name) => parse_unit(name.as_ref())?,
            None => bail!(ErrorKind::InvalidKeyword(String::new())),
        };
        let mut cfg = Configuration::new(unit, Vec::new());
        while let Some(s) = iter.next() {
            let s = s.as_ref();
            if is_path(s) {
                cfg.devices.push(Member::Active(PathBuf::from(s)));
                continue;
            }
            if s == "spare" {
                let spares = iter
                    .peeking_take_while(|s| is_path(s))
                    .map(|s| Member::Spare(PathBuf::from(s.as_ref())))
                    .collect_vec();
                cfg.devices.extend(spares);
                continue;
            }
            let (key, value) = match s.trim_start_matches("--").splitn(2, '=').collect_tuple() {
                Some(kv) => kv,
                None => bail!(ErrorKind::InvalidKeyword(s.to_owned())),
            };
            let invalid = || ErrorKind::InvalidValue(key.to_owned(), value.to_owned());
            match key {
                "level" => cfg.level = Some(value.to_owned()),
                "metadata" => cfg.metadata = value.to_owned(),
                "layout" => cfg.layout = Some(value.parse().map_err(|_| invalid())?),
                "chunk" => cfg.chunk = Some(value.to_owned()),
                "size" => cfg.size = Some(value.to_owned()),
                "readonly" => cfg.read_only = value.parse().map_err(|_| invalid())?,
                _ => bail!(ErrorKind::InvalidKeyword(key.to_owned())),
            }
        }
        cfg.metadata()?;
        Ok(cfg)
    }

    /// Returns the configuration in an mdadm-like string representation.
    ///
    /// See `parse_mdadm_like` for more information.
    pub fn mdadm_like(&self) -> String {
        let mut tokens = vec![format!("md{}", self.unit), format!("--metadata={}", self.metadata)];
        if let Some(ref level) = self.level {
            tokens.push(format!("--level={}", level));
        }
        if let Some(layout) = self.layout {
            tokens.push(format!("--layout={}", layout));
        }
        if let Some(ref chunk) = self.chunk {
            tokens.push(format!("--chunk={}", chunk));
        }
        if let Some(ref size) = self.size {
            tokens.push(format!("--size={}", size));
        }
        if self.read_only {
            tokens.push("--readonly=true".to_owned());
        }
        let (active, spares): (Vec<_>, Vec<_>) = self.devices.iter().partition(|m| match **m {
            Member::Active(_) => true,
            Member::Spare(_) => false,
        });
        tokens.extend(active.iter().map(|m| m.path().display().to_string()));
        if !spares.is_empty() {
            tokens.push("spare".to_owned());
            tokens.extend(spares.iter().map(|m| m.path().display().to_string()));
        }
        tokens.join(" ")
    }

    /// The metadata format.
    pub fn metadata(&self) -> Result<Metadata> {
        let value = self.metadata.trim();
        let invalid = || ErrorKind::InvalidValue("metadata".to_owned(), value.to_owned());
        if value == "none" {
            return Ok(Metadata::None);
        }
        if value.starts_with("external:") {
            return Ok(Metadata::External(value["external:".len()..].to_owned()));
        }
        let (major, minor) = match value.splitn(2, '.').collect_tuple() {
            Some(v) => v,
            None => bail!(invalid()),
        };
        let major: u32 = major.parse().map_err(|_| invalid())?;
        let minor: u32 = minor.parse().map_err(|_| invalid())?;
        match (major, minor) {
            (0, 90) | (1, 0) | (1, 1) | (1, 2) => Ok(Metadata::Persistent { major, minor }),
            _ => bail!(invalid()),
        }
    }

    fn sectors(key: &str, value: &Option<String>) -> Result<Option<Sectors>> {
        match *value {
            Some(ref v) => match ::unbytify::unbytify(v) {
                Ok(bytes) => Ok(Some(Sectors::from_bytes(bytes))),
                Err(_) => bail!(ErrorKind::InvalidValue(key.to_owned(), v.clone())),
            },
            None => Ok(None),
        }
    }

    /// Opens files and block devices.
    pub fn build(&self) -> Result<Vec<Box<dyn BlockDevice>>> {
        self.devices
            .iter()
            .map(|m| {
                let file = File::open(m.path(), self.read_only)?;
                Ok(Box::new(file) as Box<dyn BlockDevice>)
            })
            .collect()
    }

    /// Opens the devices, binds them to the array and starts it.
    pub fn assemble(&self, ctx: &MdContext) -> Result<Arc<Array>> {
        self.assemble_devices(ctx, self.build()?)
    }

    /// Binds already opened `devices` (in the order of `self.devices`) to
    /// the array and starts it.
    pub fn assemble_devices(&self, ctx: &MdContext, devices: Vec<Box<dyn BlockDevice>>) -> Result<Arc<Array>> {
        let metadata = self.metadata()?;
        let array = ctx.array(self.unit);
        {
            let mut md = array.lock();
            if md.is_running() || !md.disks().is_empty() {
                let busy = array::ErrorKind::Busy(format!("{} is in use", array.name()));
                return Err(array::Error::from(busy).into());
            }
            md.meta_mut().metadata = metadata.clone();
            let result = if let Metadata::Persistent { .. } = metadata {
                devices
                    .into_iter()
                    .map(|bdev| md.add_device(bdev).map(|_| ()))
                    .collect::<array::Result<()>>()
            } else {
                self.configure(&mut md, devices)
            };
            if let Err(e) = result {
                md.export_array();
                return Err(e.into());
            }
            let state = if self.read_only {
                ArrayState::ReadOnly
            } else {
                ArrayState::Active
            };
            if let Err(e) = md.set_array_state(state) {
                warn!("md: {}: assembly failed: {}", array.name(), e);
                md.export_array();
                return Err(e.into());
            }
        }
        info!("md: {} assembled from {} devices", array.name(), self.devices.len());
        Ok(array)
    }

    /// Sets up the geometry of an array without superblocks.
    fn configure(&self, md: &mut array::ArrayCore, devices: Vec<Box<dyn BlockDevice>>) -> array::Result<()> {
        let level = match self.level {
            Some(ref level) => level.clone(),
            None => bail!(array::ErrorKind::InvalidArgument("level is required".to_owned())),
        };
        let invalid = |e: Error| array::ErrorKind::InvalidArgument(e.to_string());
        let chunk = Configuration::sectors("chunk", &self.chunk).map_err(invalid)?;
        let size = Configuration::sectors("size", &self.size).map_err(invalid)?;
        let active = self
            .devices
            .iter()
            .filter(|m| match **m {
                Member::Active(_) => true,
                Member::Spare(_) => false,
            })
            .count() as u32;

        md.level_change(&level)?;
        md.reshape_request(ReshapeChange::RaidDisks(active))?;
        md.reshape_request(ReshapeChange::Layout(self.layout.unwrap_or(0)))?;
        if let Some(chunk) = chunk {
            md.reshape_request(ReshapeChange::ChunkSectors(chunk.as_u64() as u32))?;
        }

        let mut slot = 0;
        for (member, bdev) in self.devices.iter().zip(devices) {
            let idx = md.add_device(bdev)?;
            let dev = md.disk_mut(idx);
            if let Member::Active(_) = *member {
                dev.raid_disk = Some(slot);
                dev.flags.insert(DevFlags::IN_SYNC);
                slot += 1;
            } else {
                dev.flags.remove(DevFlags::IN_SYNC);
            }
        }

        let smallest = md.disks().iter().map(|d| d.device_size()).min().unwrap_or(Sectors(0));
        let mut sectors = size.unwrap_or(smallest).min(smallest);
        if let Some(chunk) = chunk {
            if chunk.as_u64() > 0 {
                sectors = sectors - sectors % chunk.as_u64();
            }
        }
        md.resize_array(sectors)?;
        for idx in 0..md.disks().len() {
            md.disk_mut(idx).sectors = sectors;
        }
        md.meta_mut().recovery_cp = crate::units::MAX_SECTOR;
        Ok(())
    }
}

fn parse_unit(name: &str) -> Result<u32> {
    let name = name.trim_start_matches("/dev/");
    if name.starts_with("md") {
        if let Ok(unit) = name[2..].parse() {
            return Ok(unit);
        }
    }
    bail!(ErrorKind::InvalidKeyword(name.to_owned()))
}

fn is_path<S: AsRef<str> + ?Sized>(s: &S) -> bool {
    match s.as_ref().chars().next() {
        Some('.') | Some('/') => true,
        _ => false,
    }
}

impl Member {
    /// Path of the device or file.
    pub fn path(&self) -> &PathBuf {
        match *self {
            Member::Active(ref p) | Member::Spare(ref p) => p,
        }
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "md{} metadata={}", self.unit, self.metadata)?;
        if let Some(ref level) = self.level {
            write!(f, " level={}", level)?;
        }
        writeln!(f)?;
        let mut spares = false;
        for member in &self.devices {
            match *member {
                Member::Active(ref path) => writeln!(f, "{:indent$}{}", "", path.display(), indent = 4)?,
                Member::Spare(ref path) => {
                    if !spares {
                        writeln!(f, "{:indent$}spare", "", indent = 4)?;
                        spares = true;
                    }
                    writeln!(f, "{:indent$}{}", "", path.display(), indent = 8)?;
                }
            }
        }
        Ok(())
    }
}
