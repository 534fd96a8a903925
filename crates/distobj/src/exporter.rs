//! Exported objects
//!
//! Objects vended by reference are registered under a target id. Each
//! vend adds one reference; the peer gives references back with a proxy
//! release. The root object is pinned and never unregistered.
//!
//! An unregistered target still resolves while the object is alive
//! elsewhere in this process: a release can overtake a reply that names
//! the same target. Vending the object again reuses that target, so each
//! live object holds at most one retired entry.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::object::DoObject;

struct ExportEntry {
    object: Arc<dyn DoObject>,
    refs: u32,
    pinned: bool,
}

#[derive(Default)]
struct ExportTable {
    next_target: u32,
    entries: HashMap<u32, ExportEntry>,
    by_identity: HashMap<usize, u32>,
    retired: HashMap<u32, Weak<dyn DoObject>>,
    retired_by_identity: HashMap<usize, u32>,
}

impl ExportTable {
    /// Take back the retired target of `object`, if it still names it
    fn revive(&mut self, key: usize, object: &Arc<dyn DoObject>) -> Option<u32> {
        let target = self.retired_by_identity.remove(&key)?;
        let weak = self.retired.remove(&target)?;
        match weak.upgrade() {
            Some(retired) if identity(&retired) == identity(object) => Some(target),
            // The address was reused by a new object after the old one died.
            _ => None,
        }
    }

    fn prune_retired(&mut self) {
        self.retired.retain(|_, weak| weak.strong_count() > 0);
        let retired = &self.retired;
        self.retired_by_identity
            .retain(|_, target| retired.contains_key(target));
    }
}

/// Retired entries are pruned once there are more than this many
const RETIRED_PRUNE_THRESHOLD: usize = 64;

/// Per-connection table of vended objects
#[derive(Default)]
pub struct Exporter {
    table: Mutex<ExportTable>,
}

fn identity(object: &Arc<dyn DoObject>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

impl Exporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `object` as the pinned root, replacing any previous root pin
    pub fn set_root(&self, object: Arc<dyn DoObject>) -> u32 {
        let mut table = self.table.lock();
        for entry in table.entries.values_mut() {
            entry.pinned = false;
        }
        let target = Self::register(&mut table, object, 0);
        if let Some(entry) = table.entries.get_mut(&target) {
            entry.pinned = true;
        }
        target
    }

    /// Add one reference to `object`, registering it if needed
    pub fn export(&self, object: Arc<dyn DoObject>) -> u32 {
        let mut table = self.table.lock();
        Self::register(&mut table, object, 1)
    }

    fn register(table: &mut ExportTable, object: Arc<dyn DoObject>, refs: u32) -> u32 {
        let key = identity(&object);
        if let Some(target) = table.by_identity.get(&key).copied() {
            if let Some(entry) = table.entries.get_mut(&target) {
                entry.refs = entry.refs.saturating_add(refs);
                return target;
            }
        }
        if let Some(target) = table.revive(key, &object) {
            debug!("Exporting {} again as target {}", object.class_name(), target);
            table.by_identity.insert(key, target);
            table.entries.insert(
                target,
                ExportEntry {
                    object,
                    refs,
                    pinned: false,
                },
            );
            return target;
        }
        // Target ids start at 1; 0 never names an object.
        table.next_target = table.next_target.wrapping_add(1).max(1);
        while table.entries.contains_key(&table.next_target) || table.retired.contains_key(&table.next_target) {
            table.next_target = table.next_target.wrapping_add(1).max(1);
        }
        let target = table.next_target;
        debug!("Exporting {} as target {}", object.class_name(), target);
        table.by_identity.insert(key, target);
        table.entries.insert(
            target,
            ExportEntry {
                object,
                refs,
                pinned: false,
            },
        );
        target
    }

    /// The pinned root object, if one was set
    pub fn root(&self) -> Option<Arc<dyn DoObject>> {
        let table = self.table.lock();
        table
            .entries
            .values()
            .find(|entry| entry.pinned)
            .map(|entry| entry.object.clone())
    }

    pub fn get(&self, target: u32) -> Option<Arc<dyn DoObject>> {
        let table = self.table.lock();
        match table.entries.get(&target) {
            Some(entry) => Some(entry.object.clone()),
            None => table.retired.get(&target).and_then(Weak::upgrade),
        }
    }

    /// Target id of an exported object
    pub fn target_of(&self, object: &Arc<dyn DoObject>) -> Option<u32> {
        self.table.lock().by_identity.get(&identity(object)).copied()
    }

    /// Drop `count` references. Returns true if the object was unregistered.
    pub fn release(&self, target: u32, count: u32) -> bool {
        let removed = {
            let mut table = self.table.lock();
            let Some(entry) = table.entries.get_mut(&target) else {
                return false;
            };
            entry.refs = entry.refs.saturating_sub(count);
            if entry.refs > 0 || entry.pinned {
                return false;
            }
            let removed = table.entries.remove(&target);
            if let Some(entry) = &removed {
                let key = identity(&entry.object);
                table.by_identity.remove(&key);
                if table.retired.len() >= RETIRED_PRUNE_THRESHOLD {
                    table.prune_retired();
                }
                table.retired.insert(target, Arc::downgrade(&entry.object));
                match table.retired_by_identity.insert(key, target) {
                    Some(stale) if stale != target => {
                        table.retired.remove(&stale);
                    }
                    _ => {}
                }
            }
            removed
        };
        // Dropped outside the lock: the object may be a proxy of another connection.
        if let Some(entry) = removed {
            debug!("Unexported target {} ({})", target, entry.object.class_name());
        }
        true
    }

    pub fn refs(&self, target: u32) -> Option<u32> {
        self.table.lock().entries.get(&target).map(|e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every object, pinned or not
    pub fn clear(&self) {
        let entries = {
            let mut table = self.table.lock();
            table.by_identity.clear();
            table.retired.clear();
            table.retired_by_identity.clear();
            std::mem::take(&mut table.entries)
        };
        drop(entries);
    }
}
