#![allow(missing_docs, unused_doc_comments)]
error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    links {
        Device(crate::blockdev::Error, crate::blockdev::ErrorKind);
    }
    errors {
        InvalidMagic(dev: String) {
            description("bad superblock magic")
            display("{}: bad superblock magic", dev)
        }
        UnsupportedVersion(dev: String, major: u32, minor: u32) {
            description("unsupported superblock version")
            display("{}: unsupported superblock version {}.{}", dev, major, minor)
        }
        ChecksumMismatch(dev: String) {
            description("invalid superblock checksum")
            display("{}: invalid superblock checksum", dev)
        }
        SizeTooSmall(dev: String) {
            description("device too small for superblock contents")
            display("{}: device too small for the recorded size", dev)
        }
        InvalidLayout(dev: String, what: &'static str) {
            description("inconsistent superblock layout")
            display("{}: inconsistent superblock: {}", dev, what)
        }
        Incompatible(dev: String) {
            description("superblock belongs to a different array")
            display("{}: superblock does not match the array", dev)
        }
        NonFresh(dev: String, events: u64, array_events: u64) {
            description("device is out of date")
            display("{}: events {} too old for array at {}", dev, events, array_events)
        }
        ResizeRefused(dev: String) {
            description("superblock placement forbids resize")
            display("{}: cannot resize with the current superblock placement", dev)
        }
        NoMetadata {
            description("array has no persistent metadata")
            display("array has no persistent metadata")
        }
    }
}

/// Coarse classification of superblock errors.
impl ErrorKind {
    /// Returns `true` for defects of the on-disk image itself.
    pub fn is_format(&self) -> bool {
        match *self {
            ErrorKind::InvalidMagic(..)
            | ErrorKind::UnsupportedVersion(..)
            | ErrorKind::ChecksumMismatch(..)
            | ErrorKind::InvalidLayout(..) => true,
            _ => false,
        }
    }
}
