#![allow(missing_docs, unused_doc_comments)]
use crate::superblock;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    links {
        Superblock(superblock::Error, superblock::ErrorKind);
        Device(crate::blockdev::Error, crate::blockdev::ErrorKind);
    }
    foreign_links {
        Io(::std::io::Error);
    }
    errors {
        DuplicateDevice(dev: String) {
            description("device already bound")
            display("{} is already bound to the array", dev)
        }
        SizeMismatch(dev: String) {
            description("device too small for the array")
            display("{} is smaller than the component size", dev)
        }
        CapacityExceeded(what: String) {
            description("capacity exceeded")
            display("capacity exceeded: {}", what)
        }
        Busy(what: String) {
            description("resource busy")
            display("busy: {}", what)
        }
        InvalidArgument(what: String) {
            description("invalid argument")
            display("invalid argument: {}", what)
        }
        ReadOnly(what: String) {
            description("read-only")
            display("read-only: {}", what)
        }
        Overlap(dev: String) {
            description("data area overlaps another array")
            display("{}: data area overlaps a device of another array", dev)
        }
        NoPersonality(level: String) {
            description("personality not registered")
            display("no personality for level {}", level)
        }
        NotRunning {
            description("array is not running")
            display("array is not running")
        }
        Interrupted {
            description("interrupted while waiting for the array")
            display("interrupted while waiting for the array")
        }
        EventCounterWrapped(array: String) {
            description("event counter wrapped")
            display("{}: event counter wrapped to zero", array)
        }
        NoValidDevice(array: String) {
            description("no valid superblock found")
            display("{}: cannot find a valid disk", array)
        }
        NoSuchDevice(dev: String) {
            description("device not bound")
            display("{} is not bound to the array", dev)
        }
    }
}

/// Error taxonomy shared by all operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// The on-disk image is damaged or of an unknown version.
    Format,
    /// Devices disagree about the array.
    Consistency,
    /// Not enough room.
    Capacity,
    /// Retry later.
    Concurrency,
    /// A bug.
    Internal,
    /// The request itself is not acceptable.
    Invalid,
    /// Device I/O failed.
    Io,
}

impl Error {
    /// Classifies this error.
    pub fn class(&self) -> ErrorClass {
        match *self.kind() {
            ErrorKind::Superblock(ref kind) => match *kind {
                superblock::ErrorKind::Device(_) => ErrorClass::Io,
                superblock::ErrorKind::Incompatible(_) | superblock::ErrorKind::NonFresh(..) => {
                    ErrorClass::Consistency
                }
                superblock::ErrorKind::SizeTooSmall(_) | superblock::ErrorKind::ResizeRefused(_) => {
                    ErrorClass::Capacity
                }
                superblock::ErrorKind::NoMetadata => ErrorClass::Invalid,
                ref kind if kind.is_format() => ErrorClass::Format,
                _ => ErrorClass::Internal,
            },
            ErrorKind::Device(_) | ErrorKind::Io(_) => ErrorClass::Io,
            ErrorKind::NoValidDevice(_) => ErrorClass::Consistency,
            ErrorKind::SizeMismatch(_) | ErrorKind::CapacityExceeded(_) | ErrorKind::Overlap(_) => {
                ErrorClass::Capacity
            }
            ErrorKind::Busy(_) | ErrorKind::Interrupted => ErrorClass::Concurrency,
            ErrorKind::EventCounterWrapped(_) | ErrorKind::Msg(_) => ErrorClass::Internal,
            ErrorKind::DuplicateDevice(_)
            | ErrorKind::InvalidArgument(_)
            | ErrorKind::ReadOnly(_)
            | ErrorKind::NoPersonality(_)
            | ErrorKind::NotRunning
            | ErrorKind::NoSuchDevice(_) => ErrorClass::Invalid,
            _ => ErrorClass::Internal,
        }
    }
}
