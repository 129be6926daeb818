use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::heap::CellId;
use crate::obj_index::ObjectIndex;
use crate::types::ContainerId;

pub(crate) struct HandleInner {
    pub id: ContainerId,
    pub rec: CellId,
    pub obj_index: ObjectIndex,
    refs: AtomicU32,
}

/// An open container. Handles are cheap to clone inside the pool; the
/// cached entry survives as long as at least one handle does.
pub struct ContainerHandle {
    pub(crate) inner: Arc<HandleInner>,
}

impl ContainerHandle {
    pub fn id(&self) -> ContainerId {
        self.inner.id
    }

    /// Number of open handles sharing this cache entry
    pub fn ref_count(&self) -> u32 {
        self.inner.refs.load(Ordering::Acquire)
    }
}

/// Volatile cache of open container handles, keyed by container id.
///
/// Entries are inserted on first open, shared by every subsequent open,
/// and evicted exactly when the last handle is closed. A live entry
/// pins its container against destroy.
#[derive(Default)]
pub(crate) struct HandleCache {
    map: HashMap<ContainerId, Arc<HandleInner>>,
}

impl HandleCache {
    /// Take another reference on an already-cached container, if any
    pub(crate) fn lookup(&self, id: &ContainerId) -> Option<ContainerHandle> {
        self.map.get(id).map(|inner| {
            inner.refs.fetch_add(1, Ordering::AcqRel);
            ContainerHandle {
                inner: Arc::clone(inner),
            }
        })
    }

    pub(crate) fn insert(
        &mut self,
        id: ContainerId,
        rec: CellId,
        obj_index: ObjectIndex,
    ) -> ContainerHandle {
        let inner = Arc::new(HandleInner {
            id,
            rec,
            obj_index,
            refs: AtomicU32::new(1),
        });
        self.map.insert(id, Arc::clone(&inner));
        ContainerHandle { inner }
    }

    /// Drop one reference; evict the entry when it was the last one.
    /// Consuming the handle is what makes a double release impossible.
    pub(crate) fn release(&mut self, handle: ContainerHandle) {
        let id = handle.inner.id;
        if handle.inner.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(inner) = self.map.remove(&id) {
                inner.obj_index.evict();
                log::debug!("evicted container {} from handle cache", id);
            }
        }
    }

    pub(crate) fn contains(&self, id: &ContainerId) -> bool {
        self.map.contains_key(id)
    }

    pub(crate) fn evict_all(&mut self) {
        for (_, inner) in self.map.drain() {
            inner.obj_index.evict();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class;
    use crate::constants::PoolFlags;
    use crate::heap::Heap;

    fn test_index() -> (tempfile::TempDir, ObjectIndex) {
        class::ensure_builtin();
        let dir = tempfile::tempdir().unwrap();
        let mut heap = Heap::create(dir.path().join("pool"), 1 << 20, PoolFlags::empty()).unwrap();
        let mut tx = heap.tx().unwrap();
        let meta = ObjectIndex::create(&mut tx).unwrap();
        tx.commit().unwrap();
        let index = ObjectIndex::open(&heap, meta).unwrap();
        (dir, index)
    }

    #[test]
    fn release_evicts_only_at_zero() {
        let (_dir, index) = test_index();
        let id = ContainerId::from_u128(7);
        let mut cache = HandleCache::default();
        let h1 = cache.insert(id, CellId::NULL, index);
        let h2 = cache.lookup(&id).unwrap();
        assert_eq!(h2.ref_count(), 2);

        cache.release(h1);
        assert!(cache.contains(&id));
        cache.release(h2);
        assert!(!cache.contains(&id));
    }

    #[test]
    fn lookup_misses_after_evict_all() {
        let (_dir, index) = test_index();
        let id = ContainerId::from_u128(9);
        let mut cache = HandleCache::default();
        let _h = cache.insert(id, CellId::NULL, index);
        cache.evict_all();
        assert!(cache.lookup(&id).is_none());
    }
}
