//! Persistent array-wide metadata.
use crate::units::{Sectors, MAX_SECTOR};

/// No level has been configured.
pub const LEVEL_NONE: i32 = -1_000_000;
/// Concatenation.
pub const LEVEL_LINEAR: i32 = -1;
/// Multipath: every member is a path to the same storage.
pub const LEVEL_MULTIPATH: i32 = -4;
/// Fault injection.
pub const LEVEL_FAULTY: i32 = -5;

/// Write intent bitmap location.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Bitmap {
    /// Offset from the superblock in sectors.
    pub offset: i32,
    /// Events up to which the bitmap was cleared.
    pub events_cleared: u64,
}

/// How the superblocks of an array are managed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metadata {
    /// No superblocks.
    None,
    /// Managed by user space, the tag names the format.
    External(String),
    /// Persistent in-band superblocks of the given version.
    Persistent {
        /// 0 or 1.
        major: u32,
        /// 90/91 for major 0, 0..=2 for major 1.
        minor: u32,
    },
}

/// The array fields stored in (or derived from) superblocks.
#[derive(Debug, Clone)]
pub struct ArrayMeta {
    /// Format of the superblocks.
    pub metadata: Metadata,
    /// Patch level of 0.90 superblocks.
    pub patch_version: u32,
    /// RAID level.
    pub level: i32,
    /// Level name requested before a personality was attached.
    pub clevel: String,
    /// Level specific layout.
    pub layout: u32,
    /// Chunk size in sectors.
    pub chunk_sectors: u32,
    /// Number of slots.
    pub raid_disks: u32,
    /// Sectors used on each member.
    pub dev_sectors: Sectors,
    /// Exported size.
    pub array_sectors: Sectors,
    /// `array_sectors` has been set explicitly.
    pub external_size: bool,
    /// Array UUID.
    pub uuid: [u8; 16],
    /// Name of the set (1.x only).
    pub set_name: [u8; 32],
    /// Creation time in seconds.
    pub ctime: u64,
    /// Last update time in seconds.
    pub utime: u64,
    /// Event counter.
    pub events: u64,
    /// Resync checkpoint; `MAX_SECTOR` when fully synced.
    pub recovery_cp: Sectors,
    /// Next address to reshape; `MAX_SECTOR` when no reshape is pending.
    pub reshape_position: Sectors,
    /// Target level of a reshape.
    pub new_level: i32,
    /// Target layout of a reshape.
    pub new_layout: u32,
    /// Target chunk size of a reshape.
    pub new_chunk_sectors: u32,
    /// Change in `raid_disks` of a reshape.
    pub delta_disks: i32,
    /// The reshape runs towards lower addresses.
    pub reshape_backwards: bool,
    /// Descriptor table capacity of the format.
    pub max_disks: u32,
    /// Preferred minor number.
    pub md_minor: u32,
    /// Optional write intent bitmap.
    pub bitmap: Option<Bitmap>,
    /// Number of missing or failed slots, maintained by the personality.
    pub degraded: u32,
    /// Set when recovery failed and must not be retried for the current
    /// devices.
    pub recovery_disabled: bool,
}

impl ArrayMeta {
    /// An empty, unconfigured array.
    pub fn new(unit: u32) -> Self {
        ArrayMeta {
            metadata: Metadata::None,
            patch_version: 0,
            level: LEVEL_NONE,
            clevel: String::new(),
            layout: 0,
            chunk_sectors: 0,
            raid_disks: 0,
            dev_sectors: Sectors(0),
            array_sectors: Sectors(0),
            external_size: false,
            uuid: [0; 16],
            set_name: [0; 32],
            ctime: 0,
            utime: 0,
            events: 0,
            recovery_cp: Sectors(0),
            reshape_position: MAX_SECTOR,
            new_level: LEVEL_NONE,
            new_layout: 0,
            new_chunk_sectors: 0,
            delta_disks: 0,
            reshape_backwards: false,
            max_disks: 0,
            md_minor: unit,
            bitmap: None,
            degraded: 0,
            recovery_disabled: false,
        }
    }

    /// Returns `true` if superblocks are kept on the members.
    pub fn persistent(&self) -> bool {
        match self.metadata {
            Metadata::Persistent { .. } => true,
            _ => false,
        }
    }

    /// Returns `true` for externally managed metadata.
    pub fn external(&self) -> bool {
        match self.metadata {
            Metadata::External(_) => true,
            _ => false,
        }
    }

    /// Major version of persistent metadata.
    pub fn major_version(&self) -> Option<u32> {
        match self.metadata {
            Metadata::Persistent { major, .. } => Some(major),
            _ => None,
        }
    }

    /// Minor version of persistent metadata.
    pub fn minor_version(&self) -> Option<u32> {
        match self.metadata {
            Metadata::Persistent { minor, .. } => Some(minor),
            _ => None,
        }
    }

    pub(crate) fn set_minor_version(&mut self, new_minor: u32) {
        if let Metadata::Persistent { ref mut minor, .. } = self.metadata {
            *minor = new_minor;
        }
    }

    /// Returns `true` while a reshape is recorded.
    pub fn reshape_pending(&self) -> bool {
        !self.reshape_position.is_max()
    }

    /// Forgets speculative reshape parameters.
    pub fn clear_reshape_request(&mut self) {
        self.new_level = self.level;
        self.new_layout = self.layout;
        self.new_chunk_sectors = self.chunk_sectors;
        self.delta_disks = 0;
        self.reshape_backwards = false;
    }

    /// Resets the array to the state of a freshly created one.
    pub fn clear(&mut self) {
        let md_minor = self.md_minor;
        *self = ArrayMeta::new(md_minor);
    }
}
