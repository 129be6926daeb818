use bitflags::bitflags;

// Pool flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolFlags: u32 {
        const RDONLY = 0x01;
        const NOSYNC = 0x02;
    }
}

// Cursor state flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CursorFlags: u32 {
        const INITIALIZED = 0x01;
        const EOF = 0x02;
    }
}

/// Magic number identifying a pool file
pub const HEAP_MAGIC: u32 = 0xD05E_CAFE;
/// Version numbers major
pub const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 1;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 0;
/// On-media format version
pub const HEAP_VERSION: u32 = VERSION_MAJOR << 24 | VERSION_MINOR << 16 | VERSION_PATCH;

/// Branching order of the container directory tree
pub const CT_TREE_ORDER: u16 = 20;
/// Branching order of per-container object indexes
pub const OI_TREE_ORDER: u16 = 20;
/// Size of a generated hash key, in bytes
pub const HKEY_SIZE: usize = 16;
