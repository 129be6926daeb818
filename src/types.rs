use std::fmt;

/// 128-bit container identifier.
///
/// Identifiers are opaque fixed-width values; no textual canonicalization
/// is enforced at this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerId([u8; 16]);

impl ContainerId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        ContainerId(bytes)
    }

    pub const fn from_u128(v: u128) -> Self {
        ContainerId(v.to_le_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_u128(&self) -> u128 {
        u128::from_le_bytes(self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// 128-bit object identifier within a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 16]);

impl ObjectId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        ObjectId(bytes)
    }

    pub const fn from_u128(v: u128) -> Self {
        ObjectId(v.to_le_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_u128(&self) -> u128 {
        u128::from_le_bytes(self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Read-only copy of a container record's metadata block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContainerInfo {
    /// Number of objects in the nested index
    pub objects: u64,
    /// Bytes of object payload held by the container
    pub used_bytes: u64,
}

/// Pool-level statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolInfo {
    /// Number of containers in the directory
    pub containers: u64,
    /// Total size of the persistent heap
    pub heap_size: u64,
    /// Bytes consumed in the heap data region
    pub heap_used: u64,
}
