use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::constants::HKEY_SIZE;
use crate::container::ContainerClass;
use crate::error::{Error, Result};
use crate::heap::{CellId, Heap};
use crate::obj_index::ObjectClass;

/// Fixed-size hash key the tree engine compares
pub type HKey = u128;

/// Small integer identifying a registered index class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassTag(pub u16);

/// Class of the pool-level container directory
pub const CLASS_CONTAINER_DIR: ClassTag = ClassTag(1);
/// Class of per-container object indexes
pub const CLASS_OBJECT_DIR: ClassTag = ClassTag(2);

/// Per-class callbacks the index engine dispatches through.
///
/// The allocate callback is the only place a record's persistent layout is
/// materialized and the free callback the only place it is torn down; this
/// confines layout knowledge to one type per directory kind. An allocate
/// implementation that fails partway must tear down what it built through
/// its own free path before returning the error.
pub trait IndexClass: Send + Sync {
    /// Size of the generated hash key
    fn hkey_size(&self) -> usize;

    /// Reduce an arbitrary key to the fixed-size hash key
    fn hkey_gen(&self, key: &[u8]) -> HKey;

    /// Materialize a new record for `key`/`val`
    fn rec_alloc(&self, heap: &mut Heap, key: &[u8], val: &[u8]) -> Result<CellId>;

    /// Tear down a record, including anything nested under it
    fn rec_free(&self, heap: &mut Heap, rec: CellId) -> Result<()>;

    /// Convert a record to its value representation
    fn rec_fetch(&self, heap: &Heap, rec: CellId) -> Result<Vec<u8>>;

    /// Called on update of a key that already has a record
    fn rec_update(&self, heap: &mut Heap, rec: CellId, key: &[u8], val: &[u8]) -> Result<()>;
}

static REGISTRY: Lazy<RwLock<HashMap<u16, Arc<dyn IndexClass>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register an index class.
///
/// A class must be registered exactly once before a tree of that class is
/// created or opened; re-registration is not supported and the registry is
/// never torn down.
pub fn register_class(tag: ClassTag, class: Arc<dyn IndexClass>) -> Result<()> {
    if class.hkey_size() != HKEY_SIZE {
        return Err(Error::InvalidArgument);
    }
    let mut reg = REGISTRY.write();
    if reg.contains_key(&tag.0) {
        return Err(Error::ClassExists(tag.0));
    }
    log::debug!("registering index class {}", tag.0);
    reg.insert(tag.0, class);
    Ok(())
}

pub(crate) fn get_class(tag: ClassTag) -> Result<Arc<dyn IndexClass>> {
    REGISTRY
        .read()
        .get(&tag.0)
        .cloned()
        .ok_or(Error::ClassUnknown(tag.0))
}

/// Idempotently register the built-in directory classes; called on every
/// pool attach
pub(crate) fn ensure_builtin() {
    let mut reg = REGISTRY.write();
    reg.entry(CLASS_CONTAINER_DIR.0)
        .or_insert_with(|| Arc::new(ContainerClass) as Arc<dyn IndexClass>);
    reg.entry(CLASS_OBJECT_DIR.0)
        .or_insert_with(|| Arc::new(ObjectClass) as Arc<dyn IndexClass>);
}
