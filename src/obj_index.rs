use std::collections::HashMap;

use parking_lot::Mutex;

use crate::class::{HKey, IndexClass, CLASS_OBJECT_DIR};
use crate::constants::{HKEY_SIZE, OI_TREE_ORDER};
use crate::error::{Error, Result};
use crate::heap::{CellId, Heap};
use crate::tree::Tree;

// Object record: oid | payload CellId. The payload lives in its own cell
// so an update can swap it without moving the record.
const OBJ_REC_SIZE: usize = 24;

/// Index class for per-container object directories
pub struct ObjectClass;

impl IndexClass for ObjectClass {
    fn hkey_size(&self) -> usize {
        HKEY_SIZE
    }

    fn hkey_gen(&self, key: &[u8]) -> HKey {
        let mut b = [0u8; 16];
        b.copy_from_slice(&key[..16]);
        u128::from_le_bytes(b)
    }

    fn rec_alloc(&self, heap: &mut Heap, key: &[u8], val: &[u8]) -> Result<CellId> {
        if key.len() != 16 {
            return Err(Error::InvalidArgument);
        }
        let rec = heap.alloc(OBJ_REC_SIZE)?;
        heap.write(rec, 0, key)?;
        // a zeroed cell does not decode as NULL, so write it out before
        // anything can fail
        heap.write(rec, 16, &CellId::NULL.encode())?;

        if !val.is_empty() {
            let payload = match store_payload(heap, val) {
                Ok(id) => id,
                Err(e) => {
                    // unwind the partial record through our own free path
                    self.rec_free(heap, rec)?;
                    return Err(e);
                }
            };
            heap.write(rec, 16, &payload.encode())?;
        }
        Ok(rec)
    }

    fn rec_free(&self, heap: &mut Heap, rec: CellId) -> Result<()> {
        let payload = read_payload_id(heap, rec)?;
        if !payload.is_null() {
            heap.free(payload)?;
        }
        heap.free(rec)
    }

    fn rec_fetch(&self, heap: &Heap, rec: CellId) -> Result<Vec<u8>> {
        let payload = read_payload_id(heap, rec)?;
        if payload.is_null() {
            return Ok(Vec::new());
        }
        Ok(heap.read(payload)?.to_vec())
    }

    fn rec_update(&self, heap: &mut Heap, rec: CellId, _key: &[u8], val: &[u8]) -> Result<()> {
        let old = read_payload_id(heap, rec)?;
        let new = if val.is_empty() {
            CellId::NULL
        } else {
            store_payload(heap, val)?
        };
        heap.write(rec, 16, &new.encode())?;
        if !old.is_null() {
            heap.free(old)?;
        }
        Ok(())
    }
}

fn store_payload(heap: &mut Heap, val: &[u8]) -> Result<CellId> {
    let id = heap.alloc(val.len())?;
    heap.write(id, 0, val)?;
    Ok(id)
}

fn read_payload_id(heap: &Heap, rec: CellId) -> Result<CellId> {
    let bytes = heap.read(rec)?;
    if bytes.len() < OBJ_REC_SIZE {
        return Err(Error::Corrupted);
    }
    Ok(CellId::decode(&bytes[16..24]))
}

/// Volatile attachment to one container's nested object index: the tree
/// handle plus a transient oid-to-record cache
pub struct ObjectIndex {
    tree: Tree,
    lookup_cache: Mutex<HashMap<u128, CellId>>,
}

impl ObjectIndex {
    pub(crate) fn create(heap: &mut Heap) -> Result<CellId> {
        Tree::create(heap, CLASS_OBJECT_DIR, OI_TREE_ORDER)
    }

    pub(crate) fn destroy(heap: &mut Heap, meta: CellId) -> Result<()> {
        Tree::destroy(heap, meta)
    }

    pub(crate) fn open(heap: &Heap, meta: CellId) -> Result<ObjectIndex> {
        let tree = Tree::open(heap, meta)?;
        Ok(ObjectIndex {
            tree,
            lookup_cache: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Number of objects in the index
    pub fn len(&self, heap: &Heap) -> Result<u64> {
        self.tree.len(heap)
    }

    pub(crate) fn cached(&self, oid: u128) -> Option<CellId> {
        self.lookup_cache.lock().get(&oid).copied()
    }

    pub(crate) fn remember(&self, oid: u128, rec: CellId) {
        self.lookup_cache.lock().insert(oid, rec);
    }

    pub(crate) fn forget(&self, oid: u128) {
        self.lookup_cache.lock().remove(&oid);
    }

    /// Drop every transient entry; called when the owning handle closes
    pub fn evict(&self) {
        let mut cache = self.lookup_cache.lock();
        if !cache.is_empty() {
            log::debug!("evicting {} cached object records", cache.len());
        }
        cache.clear();
    }
}
