//! Persistent container store: a transactional heap, a class-pluggable
//! ordered index engine, and pool/container lifecycle on top.

mod cache;
mod class;
mod constants;
mod container;
mod cursor;
mod error;
mod heap;
mod obj_index;
mod pool;
mod tree;
mod types;

pub use cache::ContainerHandle;
pub use class::{register_class, ClassTag, HKey, IndexClass, CLASS_CONTAINER_DIR, CLASS_OBJECT_DIR};
pub use constants::PoolFlags;
pub use cursor::ContainerIter;
pub use error::{Error, Result};
pub use heap::{CellId, Heap, TxGuard};
pub use pool::Pool;
pub use tree::{RecordView, SeekBound, Tree, UpdateOutcome};
pub use types::{ContainerId, ContainerInfo, ObjectId, PoolInfo};
