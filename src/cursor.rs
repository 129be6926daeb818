use crate::class::HKey;
use crate::constants::CursorFlags;
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::pool::Pool;
use crate::tree::{SeekBound, Tree};
use crate::types::ContainerId;

/// Cursor state over one tree, positioned by hash key rather than by a
/// node path. Every step re-descends from the root, so a position stays
/// valid across deletes anywhere in the tree.
struct TreeCursor {
    pos: Option<HKey>,
    flags: CursorFlags,
}

impl TreeCursor {
    fn new() -> TreeCursor {
        TreeCursor {
            pos: None,
            flags: CursorFlags::empty(),
        }
    }

    fn positioned(&self) -> Result<HKey> {
        if !self.flags.contains(CursorFlags::INITIALIZED) || self.flags.contains(CursorFlags::EOF) {
            return Err(Error::InvalidState);
        }
        self.pos.ok_or(Error::InvalidState)
    }

    fn settle(&mut self, found: Option<HKey>) -> bool {
        self.flags.insert(CursorFlags::INITIALIZED);
        match found {
            Some(h) => {
                self.pos = Some(h);
                self.flags.remove(CursorFlags::EOF);
                true
            }
            None => {
                self.pos = None;
                self.flags.insert(CursorFlags::EOF);
                false
            }
        }
    }
}

/// Ordered iterator over the pool's container directory.
///
/// The protocol is probe, then alternate fetch and next; fetch before a
/// successful probe is `InvalidState`. Entries come out in hash-key
/// order, which for container ids is their little-endian integer order.
pub struct ContainerIter<'p> {
    pool: &'p Pool,
    tree: Tree,
    cursor: TreeCursor,
}

impl<'p> ContainerIter<'p> {
    pub(crate) fn new(pool: &'p Pool) -> Result<ContainerIter<'p>> {
        let heap = pool.lock_heap();
        let tree = Pool::directory(&heap)?;
        Ok(ContainerIter {
            pool,
            tree,
            cursor: TreeCursor::new(),
        })
    }

    /// Position at the first entry, or at the first entry with id >= the
    /// anchor. Returns whether an entry was found.
    pub fn probe(&mut self, anchor: Option<ContainerId>) -> Result<bool> {
        let bound = match anchor {
            Some(id) => SeekBound::Ge(self.tree.hkey_of(id.as_bytes())?),
            None => SeekBound::First,
        };
        let heap = self.pool.lock_heap();
        let found = self.tree.seek(&heap, bound)?;
        Ok(self.cursor.settle(found.map(|(h, _)| h)))
    }

    /// Read the container id under the cursor
    pub fn fetch(&self) -> Result<ContainerId> {
        let h = self.cursor.positioned()?;
        let heap = self.pool.lock_heap();
        self.id_at(&heap, h)
    }

    fn id_at(&self, heap: &Heap, h: HKey) -> Result<ContainerId> {
        let (hk, rec) = self
            .tree
            .seek(heap, SeekBound::Ge(h))?
            .ok_or(Error::NotFound)?;
        if hk != h {
            // the entry went away under us
            return Err(Error::NotFound);
        }
        let bytes = self.tree.fetch_rec(heap, rec)?;
        if bytes.len() != 16 {
            return Err(Error::Corrupted);
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes);
        Ok(ContainerId::from_bytes(id))
    }

    /// Advance past the current position. Returns whether an entry
    /// remains.
    pub fn next(&mut self) -> Result<bool> {
        if !self.cursor.flags.contains(CursorFlags::INITIALIZED) {
            return Err(Error::InvalidState);
        }
        let h = match self.cursor.pos {
            Some(h) => h,
            None => return Ok(false),
        };
        let heap = self.pool.lock_heap();
        let found = self.tree.seek(&heap, SeekBound::Gt(h))?;
        Ok(self.cursor.settle(found.map(|(hk, _)| hk)))
    }

    /// Destroy the container under the cursor. The position is left on
    /// the deleted key, so the following `next` behaves as usual. Open
    /// handles make the container `Busy`, same as a direct destroy.
    pub fn delete(&mut self) -> Result<()> {
        let h = self.cursor.positioned()?;
        let mut heap = self.pool.lock_heap();
        let id = self.id_at(&heap, h)?;
        // busy check under the heap lock, same order as a direct destroy
        if self.pool.cache_contains(&id) {
            return Err(Error::Busy);
        }

        let mut tx = heap.tx()?;
        self.tree.delete_hkey(&mut tx, h)?;
        tx.commit()?;
        log::debug!("iterator destroyed container {}", id);
        Ok(())
    }

    /// End the scan and release the cursor
    pub fn finish(self) {}
}
