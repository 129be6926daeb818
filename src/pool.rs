use std::path::Path;

use lazy_static::lazy_static;
use parking_lot::{Mutex, MutexGuard};

use crate::cache::{ContainerHandle, HandleCache};
use crate::class::{self, CLASS_CONTAINER_DIR};
use crate::constants::{PoolFlags, CT_TREE_ORDER};
use crate::container::ContainerRecord;
use crate::cursor::ContainerIter;
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::obj_index::ObjectIndex;
use crate::tree::{SeekBound, Tree};
use crate::types::{ContainerId, ContainerInfo, ObjectId, PoolInfo};

lazy_static! {
    /// Flags that may change on a live pool; the rest are fixed at attach
    static ref CHANGEABLE_FLAGS: PoolFlags = PoolFlags::NOSYNC;
}

/// An attached pool: the persistent heap plus the volatile handle cache.
///
/// The heap mutex makes every persistent operation single-writer. Lock
/// order is heap before cache: the busy check in destroy and the insert
/// in open both run under the heap lock, so neither can slip between
/// the other's directory read and cache step.
pub struct Pool {
    heap: Mutex<Heap>,
    cache: Mutex<HandleCache>,
}

impl Pool {
    /// Format a new pool file and plant an empty container directory at
    /// the heap root
    pub fn create<P: AsRef<Path>>(path: P, size: u64, flags: PoolFlags) -> Result<Pool> {
        class::ensure_builtin();
        let mut heap = Heap::create(path.as_ref(), size, flags)?;
        {
            let mut tx = heap.tx()?;
            let meta = Tree::create(&mut tx, CLASS_CONTAINER_DIR, CT_TREE_ORDER)?;
            tx.set_root(meta)?;
            tx.commit()?;
        }
        log::info!("created pool {:?} ({} bytes)", path.as_ref(), size);
        Ok(Pool {
            heap: Mutex::new(heap),
            cache: Mutex::new(HandleCache::default()),
        })
    }

    /// Attach to an existing pool file
    pub fn open<P: AsRef<Path>>(path: P, flags: PoolFlags) -> Result<Pool> {
        class::ensure_builtin();
        let heap = Heap::open(path.as_ref(), flags)?;
        if heap.root().is_null() {
            return Err(Error::Corrupted);
        }
        Self::directory(&heap)?;
        log::info!("opened pool {:?}", path.as_ref());
        Ok(Pool {
            heap: Mutex::new(heap),
            cache: Mutex::new(HandleCache::default()),
        })
    }

    pub(crate) fn directory(heap: &Heap) -> Result<Tree> {
        Tree::open(heap, heap.root())
    }

    pub(crate) fn lock_heap(&self) -> MutexGuard<'_, Heap> {
        self.heap.lock()
    }

    pub(crate) fn cache_contains(&self, id: &ContainerId) -> bool {
        self.cache.lock().contains(id)
    }

    /// Create a container. Fails with `AlreadyExists` without touching
    /// the directory if the id is taken.
    pub fn create_container(&self, id: ContainerId) -> Result<()> {
        let mut heap = self.heap.lock();
        let dir = Self::directory(&heap)?;
        match dir.lookup(&heap, id.as_bytes()) {
            Ok(_) => return Err(Error::AlreadyExists),
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        let mut tx = heap.tx()?;
        dir.update(&mut tx, id.as_bytes(), &[])?;
        tx.commit()?;
        log::info!("created container {}", id);
        Ok(())
    }

    /// Open a handle on a container, sharing the cached entry when one
    /// already exists
    pub fn open_container(&self, id: ContainerId) -> Result<ContainerHandle> {
        if let Some(handle) = self.cache.lock().lookup(&id) {
            return Ok(handle);
        }

        let heap = self.heap.lock();
        let dir = Self::directory(&heap)?;
        let view = dir.lookup(&heap, id.as_bytes())?;
        let record = ContainerRecord::read(&heap, view.rec)?;
        let obj_index = ObjectIndex::open(&heap, record.obtable)?;

        // insert while still holding the heap lock; a concurrent destroy
        // cannot have deleted the record we just read, and its busy check
        // will see this entry
        let mut cache = self.cache.lock();
        if let Some(handle) = cache.lookup(&id) {
            return Ok(handle);
        }
        Ok(cache.insert(id, view.rec, obj_index))
    }

    /// Close a handle. Consuming it is what makes a stale or repeated
    /// close impossible to express.
    pub fn close_container(&self, handle: ContainerHandle) {
        self.cache.lock().release(handle);
    }

    pub fn query_container(&self, handle: &ContainerHandle) -> Result<ContainerInfo> {
        let heap = self.heap.lock();
        let record = ContainerRecord::read(&heap, handle.inner.rec)?;
        let objects = handle.inner.obj_index.len(&heap)?;
        Ok(ContainerInfo {
            objects,
            used_bytes: record.used_bytes,
        })
    }

    /// Destroy a container and everything under it. A container with open
    /// handles is `Busy`.
    pub fn destroy_container(&self, id: ContainerId) -> Result<()> {
        let mut heap = self.heap.lock();
        // heap lock first, so an opener cannot insert a handle between
        // this check and the delete below
        if self.cache.lock().contains(&id) {
            return Err(Error::Busy);
        }
        let dir = Self::directory(&heap)?;
        dir.lookup(&heap, id.as_bytes())?;

        let mut tx = heap.tx()?;
        dir.delete(&mut tx, id.as_bytes())?;
        tx.commit()?;
        log::info!("destroyed container {}", id);
        Ok(())
    }

    /// Insert or overwrite an object in the container's index
    pub fn object_insert(
        &self,
        handle: &ContainerHandle,
        oid: ObjectId,
        value: &[u8],
    ) -> Result<()> {
        let mut heap = self.heap.lock();
        let index = &handle.inner.obj_index;
        let tree = index.tree().clone();

        let old_len = match tree.lookup(&heap, oid.as_bytes()) {
            Ok(view) => Some(view.value.len() as u64),
            Err(Error::NotFound) => None,
            Err(e) => return Err(e),
        };

        let mut tx = heap.tx()?;
        tree.update(&mut tx, oid.as_bytes(), value)?;
        let mut record = ContainerRecord::read(&tx, handle.inner.rec)?;
        record.used_bytes =
            record.used_bytes.saturating_sub(old_len.unwrap_or(0)) + value.len() as u64;
        record.write(&mut tx, handle.inner.rec)?;
        tx.commit()?;

        let h = oid.to_u128();
        if let Some((hk, rec)) = tree.seek(&heap, SeekBound::Ge(h))? {
            if hk == h {
                index.remember(h, rec);
            }
        }
        Ok(())
    }

    /// Fetch an object's value
    pub fn object_fetch(&self, handle: &ContainerHandle, oid: ObjectId) -> Result<Vec<u8>> {
        let heap = self.heap.lock();
        let index = &handle.inner.obj_index;
        let h = oid.to_u128();

        if let Some(rec) = index.cached(h) {
            match index.tree().fetch_rec(&heap, rec) {
                Ok(value) => return Ok(value),
                // stale cache entry, fall through to the tree
                Err(Error::NotFound) => index.forget(h),
                Err(e) => return Err(e),
            }
        }

        let view = index.tree().lookup(&heap, oid.as_bytes())?;
        index.remember(h, view.rec);
        Ok(view.value)
    }

    /// Remove an object and release its space accounting
    pub fn object_remove(&self, handle: &ContainerHandle, oid: ObjectId) -> Result<()> {
        let mut heap = self.heap.lock();
        let index = &handle.inner.obj_index;
        let tree = index.tree().clone();
        let old = tree.lookup(&heap, oid.as_bytes())?;

        let mut tx = heap.tx()?;
        tree.delete(&mut tx, oid.as_bytes())?;
        let mut record = ContainerRecord::read(&tx, handle.inner.rec)?;
        record.used_bytes = record.used_bytes.saturating_sub(old.value.len() as u64);
        record.write(&mut tx, handle.inner.rec)?;
        tx.commit()?;

        index.forget(oid.to_u128());
        Ok(())
    }

    pub fn info(&self) -> Result<PoolInfo> {
        let heap = self.heap.lock();
        let dir = Self::directory(&heap)?;
        Ok(PoolInfo {
            containers: dir.len(&heap)?,
            heap_size: heap.size(),
            heap_used: heap.used_bytes(),
        })
    }

    pub fn flags(&self) -> PoolFlags {
        self.heap.lock().flags()
    }

    /// Turn flags on or off on a live pool; only the changeable subset
    /// may be touched
    pub fn set_flags(&self, flags: PoolFlags, onoff: bool) -> Result<()> {
        if !(flags & !*CHANGEABLE_FLAGS).is_empty() {
            return Err(Error::FlagsImmutable);
        }
        let mut heap = self.heap.lock();
        let mut current = heap.flags();
        current.set(flags, onoff);
        heap.set_flags(current);
        Ok(())
    }

    /// Ordered scan over the container directory
    pub fn iter_containers(&self) -> Result<ContainerIter<'_>> {
        ContainerIter::new(self)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.cache.lock().evict_all();
    }
}
