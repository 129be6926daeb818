use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for durastore operations
pub type Result<T> = result::Result<T, Error>;

/// Error taxonomy for the persistence core
#[derive(Debug, Error)]
pub enum Error {
    /// Null or otherwise unusable handle, key, or parameter
    #[error("invalid argument")]
    InvalidArgument,
    /// No matching directory entry or record
    #[error("entry not found")]
    NotFound,
    /// Attempt to create a container that already exists
    #[error("container already exists")]
    AlreadyExists,
    /// Structural deletion attempted while open handles exist
    #[error("container has open handles")]
    Busy,
    /// Persistent heap allocation failure
    #[error("out of persistent memory")]
    NoMemory,
    /// Underlying transaction aborted while syncing state
    #[error("transaction fault")]
    IoFault,
    /// Operation invoked out of sequence (no transaction, unprobed cursor)
    #[error("invalid state for operation")]
    InvalidState,
    /// Undo log exhausted within a single transaction
    #[error("transaction undo log full")]
    TxnFull,
    /// Index class tag registered twice
    #[error("index class {0} already registered")]
    ClassExists(u16),
    /// Tree refers to a class tag nobody registered
    #[error("index class {0} not registered")]
    ClassUnknown(u16),
    /// Pool file failed structural validation
    #[error("pool file is corrupted")]
    Corrupted,
    /// Pool file was formatted by an incompatible version
    #[error("pool format version mismatch")]
    VersionMismatch,
    /// Pool is attached read-only
    #[error("pool is read-only")]
    ReadOnly,
    /// Flags outside the changeable mask cannot be modified after attach
    #[error("pool flags cannot be modified")]
    FlagsImmutable,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
