//! Reference store: integer handles for frames, objects, map entries and
//! scripts reported to the client.

use crate::error::{Error, Result};
use crate::vm::types::{Frame, InstanceKind, InstanceRef, ObjRef, ScriptRef};
use std::collections::HashMap;

/// Handle value meaning "nothing to expand".
pub const NO_REFERENCE: i64 = 0;

/// Thread and pause generation a handle was minted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub thread_id: i64,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoredData {
    Frame(Frame),
    Instance(InstanceRef),
    /// One map entry; `evaluate_name` addresses its value when the key is atomic.
    MapAssociation {
        key: ObjRef,
        value: ObjRef,
        evaluate_name: Option<String>,
    },
    Script(ScriptRef),
}

impl StoredData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            StoredData::Frame(_) => "frame",
            StoredData::Instance(_) => "object",
            StoredData::MapAssociation { .. } => "map entry",
            StoredData::Script(_) => "script",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub owner: Owner,
    pub data: StoredData,
}

/// Arena with monotonically increasing keys. A key is never handed out twice.
#[derive(Debug)]
pub struct RefStore {
    next: i64,
    entries: HashMap<i64, StoredEntry>,
}

impl Default for RefStore {
    fn default() -> Self {
        Self {
            next: NO_REFERENCE + 1,
            entries: HashMap::new(),
        }
    }
}

impl RefStore {
    pub fn store(&mut self, owner: Owner, data: StoredData) -> i64 {
        let handle = self.next;
        self.next += 1;
        self.entries.insert(handle, StoredEntry { owner, data });
        handle
    }

    /// Store an evaluation result. Atomic values and non-instances get [`NO_REFERENCE`].
    pub fn store_object(
        &mut self,
        owner: Owner,
        obj: &ObjRef,
        is_atomic: impl Fn(InstanceKind) -> bool,
    ) -> i64 {
        match obj {
            ObjRef::Instance(instance) if !is_atomic(instance.kind) => {
                self.store(owner, StoredData::Instance(instance.clone()))
            }
            _ => NO_REFERENCE,
        }
    }

    /// Resolve a handle. `current_generation` reports the pause generation the
    /// owning thread is in now, or `None` if the thread is gone or running.
    pub fn resolve(
        &self,
        handle: i64,
        current_generation: impl FnOnce(i64) -> Option<u64>,
    ) -> Result<&StoredEntry> {
        let entry = self
            .entries
            .get(&handle)
            .ok_or(Error::StaleReference(handle))?;
        match current_generation(entry.owner.thread_id) {
            Some(generation) if generation == entry.owner.generation => Ok(entry),
            _ => Err(Error::StaleReference(handle)),
        }
    }

    /// Forget every handle minted for a thread.
    pub fn release_thread(&mut self, thread_id: i64) {
        self.entries.retain(|_, entry| entry.owner.thread_id != thread_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, kind: InstanceKind) -> ObjRef {
        ObjRef::Instance(InstanceRef {
            id: id.to_string(),
            kind,
            ..Default::default()
        })
    }

    fn is_atomic(kind: InstanceKind) -> bool {
        matches!(kind, InstanceKind::Int | InstanceKind::String)
    }

    #[test]
    fn test_handles_are_monotonic() {
        let mut store = RefStore::default();
        let owner = Owner {
            thread_id: 1,
            generation: 1,
        };
        let a = store.store_object(owner, &instance("objects/1", InstanceKind::List), is_atomic);
        let b = store.store_object(owner, &instance("objects/1", InstanceKind::List), is_atomic);
        assert!(a > NO_REFERENCE);
        assert!(b > a);

        store.release_thread(1);
        let c = store.store(owner, StoredData::Frame(Frame::default()));
        assert!(c > b);
    }

    #[test]
    fn test_atomic_values_get_no_handle() {
        let mut store = RefStore::default();
        let owner = Owner {
            thread_id: 1,
            generation: 1,
        };
        assert_eq!(
            store.store_object(owner, &instance("objects/2", InstanceKind::Int), is_atomic),
            NO_REFERENCE
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_handle_goes_stale_on_new_pause() {
        let mut store = RefStore::default();
        let owner = Owner {
            thread_id: 3,
            generation: 7,
        };
        let handle = store.store(owner, StoredData::Frame(Frame::default()));

        let entry = store.resolve(handle, |_| Some(7)).unwrap();
        assert_eq!(entry.owner.thread_id, 3);

        assert!(matches!(
            store.resolve(handle, |_| Some(8)),
            Err(Error::StaleReference(h)) if h == handle
        ));
        assert!(store.resolve(handle, |_| None).is_err());
        assert!(matches!(
            store.resolve(999, |_| Some(7)),
            Err(Error::StaleReference(999))
        ));
    }
}
