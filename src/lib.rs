//! Core of a Linux-compatible software RAID (MD) layer: on-disk superblock
//! formats, member device registry, array state machine, superblock
//! synchronization and reshape coordination.
//!
//! The data path itself is left to pluggable personalities registered with
//! an `MdContext`.
#![warn(missing_docs)]

#[macro_use]
extern crate bitflags;
extern crate byteorder;
#[cfg(test)]
extern crate env_logger;
#[macro_use]
extern crate error_chain;
extern crate itertools;
extern crate libc;
#[macro_use]
extern crate log;
extern crate parking_lot;
#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use]
extern crate quickcheck_macros;
#[cfg(test)]
extern crate rand;
#[cfg(test)]
extern crate rand_xorshift;
extern crate scoped_threadpool;
extern crate seqlock;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate toml;
extern crate unbytify;

pub mod array;
pub mod blockdev;
pub mod checksum;
pub mod configuration;
pub mod context;
pub mod device;
pub mod meta;
pub mod personality;
pub mod superblock;
pub mod units;

pub use self::array::{Array, ArrayState, Error, SyncAction};
pub use self::configuration::Configuration;
pub use self::context::MdContext;
pub use self::superblock::Format;
pub use self::units::Sectors;
