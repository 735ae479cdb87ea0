//! This module provides `MdContext`, the process-wide table of arrays and
//! personalities.
//!
//! Arrays hold a weak reference to the `Registry` so cross-array checks can
//! enumerate their siblings. The registry lock is never held while an array
//! lock is taken.
use crate::array::{Array, StopMode};
use crate::blockdev::DeviceOpener;
use crate::personality::{Personality, PersonalityTable};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Arrays by unit number together with the shared lookup tables.
pub struct Registry {
    arrays: Mutex<BTreeMap<u32, Arc<Array>>>,
    personalities: Arc<PersonalityTable>,
    opener: Arc<dyn DeviceOpener>,
}

impl Registry {
    /// Snapshot of all arrays.
    pub fn arrays(&self) -> Vec<Arc<Array>> {
        self.arrays.lock().values().cloned().collect()
    }

    /// Opens devices by number.
    pub fn opener(&self) -> &dyn DeviceOpener {
        &*self.opener
    }

    /// Registered personalities.
    pub fn personalities(&self) -> &PersonalityTable {
        &self.personalities
    }
}

/// Entry point of the crate.
pub struct MdContext {
    registry: Arc<Registry>,
}

impl MdContext {
    /// Creates an empty context opening devices through `opener`.
    pub fn new(opener: Arc<dyn DeviceOpener>) -> Self {
        MdContext {
            registry: Arc::new(Registry {
                arrays: Mutex::new(BTreeMap::new()),
                personalities: Arc::new(PersonalityTable::new()),
                opener,
            }),
        }
    }

    /// Registers a personality. A personality with the same name is
    /// replaced.
    pub fn register_personality(&self, pers: Arc<dyn Personality>) {
        self.registry.personalities.register(pers);
    }

    /// Removes a personality. Running arrays keep their reference.
    pub fn unregister_personality(&self, name: &str) -> bool {
        self.registry.personalities.unregister(name)
    }

    /// Names of the registered personalities.
    pub fn personalities(&self) -> Vec<&'static str> {
        self.registry.personalities.names()
    }

    /// Returns the array `unit`, creating it on first reference.
    pub fn array(&self, unit: u32) -> Arc<Array> {
        let mut arrays = self.registry.arrays.lock();
        let registry = Arc::downgrade(&self.registry);
        let personalities = Arc::clone(&self.registry.personalities);
        Arc::clone(
            arrays
                .entry(unit)
                .or_insert_with(|| Array::new(unit, registry, personalities)),
        )
    }

    /// Returns the array `unit` if it exists.
    pub fn find(&self, unit: u32) -> Option<Arc<Array>> {
        self.registry.arrays.lock().get(&unit).cloned()
    }

    /// Snapshot of all arrays.
    pub fn arrays(&self) -> Vec<Arc<Array>> {
        self.registry.arrays()
    }

    /// The shared registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Forgets array `unit` if it holds no devices, has no geometry and
    /// nobody has it open. Returns `true` if it was removed.
    pub fn release(&self, unit: u32) -> bool {
        let array = match self.find(unit) {
            Some(array) => array,
            None => return false,
        };
        if !array.is_unused() || array.open_count() > 0 {
            return false;
        }
        let mut arrays = self.registry.arrays.lock();
        // Only the table and our local copy may reference it.
        if Arc::strong_count(&array) > 2 {
            return false;
        }
        arrays.remove(&unit);
        debug!("md: {} released", array.name());
        true
    }

    /// Stops every array and clears the table.
    pub fn shutdown(&self) {
        for array in self.arrays() {
            array.stop_daemon();
            let mut md = array.lock();
            if md.is_running() || !md.disks().is_empty() {
                if let Err(e) = md.stop(StopMode::Clear) {
                    warn!("md: {}: stop on shutdown failed: {}", array.name(), e);
                }
            }
        }
        self.registry.arrays.lock().clear();
    }
}

impl Drop for MdContext {
    fn drop(&mut self) {
        for array in self.registry.arrays() {
            array.stop_daemon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::test::{assemble, context, format_devices, raid_meta};
    use crate::array::ArrayState;
    use crate::personality::test::MockPersonality;
    use crate::units::Sectors;

    #[test]
    fn arrays_are_created_on_first_reference() {
        let (ctx, _) = context();
        assert!(ctx.find(4).is_none());
        let a = ctx.array(4);
        let b = ctx.array(4);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "md4");
        assert_eq!(ctx.arrays().len(), 1);
        assert_eq!(ctx.registry().arrays().len(), 1);
    }

    #[test]
    fn release_only_unused_arrays() {
        let (ctx, _) = context();
        let devs = format_devices(&raid_meta(1, 2), 3, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        drop(array);
        assert!(!ctx.release(0));
        ctx.array(0).lock().stop(StopMode::Clear).unwrap();
        assert!(ctx.release(0));
        assert!(ctx.find(0).is_none());
        assert!(!ctx.release(0));

        let opened = ctx.array(1);
        opened.open();
        assert!(!ctx.release(1));
        opened.close();
        drop(opened);
        assert!(ctx.release(1));
    }

    #[test]
    fn personalities_are_replaced_by_name() {
        let (ctx, _) = context();
        let mut names = ctx.personalities();
        names.sort();
        assert_eq!(names, vec!["linear", "raid0", "raid1", "raid5"]);
        ctx.register_personality(Arc::new(MockPersonality::raid1()));
        assert_eq!(ctx.personalities().len(), 4);
        assert!(ctx.unregister_personality("raid0"));
        assert!(!ctx.unregister_personality("raid0"));
    }

    #[test]
    fn shutdown_stops_everything() {
        let (ctx, _) = context();
        let devs = format_devices(&raid_meta(5, 2), 3, Sectors(8192));
        let array = assemble(&ctx, 0, &devs, 2);
        array.start_daemon().unwrap();
        ctx.shutdown();
        assert_eq!(array.array_state(), ArrayState::Clear);
        assert!(ctx.arrays().is_empty());
    }
}
