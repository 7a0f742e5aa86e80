//! Externally tracked descriptors (file handles and the like opened on behalf of a page).
//! A page reload leaves them behind; they are marked stale so later use is rejected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::protocol::CoreError;

#[derive(Debug)]
pub struct Descriptor {
    id: u64,
    resource: String,
    stale: Mutex<bool>,
}

impl Descriptor {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn is_stale(&self) -> bool {
        *self.stale.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_stale(&self) {
        *self.stale.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

#[derive(Debug, Default)]
pub struct DescriptorTable {
    entries: Mutex<HashMap<u64, Arc<Descriptor>>>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `resource` under `id`, replacing any previous descriptor with that id.
    pub fn insert(&self, id: u64, resource: impl Into<String>) -> Arc<Descriptor> {
        let desc = Arc::new(Descriptor {
            id,
            resource: resource.into(),
            stale: Mutex::new(false),
        });
        self.lock().insert(id, desc.clone());
        desc
    }

    /// Live descriptor for `id`. Stale descriptors are rejected, not returned.
    pub fn get(&self, id: u64) -> Result<Arc<Descriptor>, CoreError> {
        let desc = self
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("No descriptor with specified id"))?;
        if desc.is_stale() {
            return Err(CoreError::StaleDescriptor(id));
        }
        Ok(desc)
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Descriptor>> {
        self.lock().remove(&id)
    }

    /// Mark every tracked descriptor stale, each under its own lock. Returns how many.
    pub fn mark_all_stale(&self) -> usize {
        let entries = self.lock();
        for desc in entries.values() {
            desc.mark_stale();
        }
        if !entries.is_empty() {
            debug!(count = entries.len(), "descriptors marked stale");
        }
        entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<Descriptor>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ERR_STALE_DESCRIPTOR;

    #[test]
    fn insert_get_remove() {
        let table = DescriptorTable::new();
        table.insert(4, "/tmp/a");
        assert_eq!(table.get(4).unwrap().resource(), "/tmp/a");
        assert!(table.remove(4).is_some());
        assert!(matches!(table.get(4), Err(CoreError::NotFound(_))));
        assert!(table.is_empty());
    }

    #[test]
    fn stale_descriptors_are_rejected() {
        let table = DescriptorTable::new();
        let held = table.insert(1, "a");
        table.insert(2, "b");
        assert_eq!(table.mark_all_stale(), 2);
        assert!(held.is_stale());
        let err = table.get(1).unwrap_err();
        assert_eq!(err, CoreError::StaleDescriptor(1));
        assert_eq!(err.code(), Some(ERR_STALE_DESCRIPTOR));
        assert_eq!(err.type_name(), "InvalidStateError");
        // Stale entries stay tracked until removed.
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn reinsert_after_reload_is_fresh() {
        let table = DescriptorTable::new();
        table.insert(1, "a");
        table.mark_all_stale();
        table.insert(1, "a");
        assert!(table.get(1).is_ok());
    }
}
