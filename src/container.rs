use crate::class::{HKey, IndexClass};
use crate::constants::HKEY_SIZE;
use crate::error::{Error, Result};
use crate::heap::{CellId, Heap};
use crate::obj_index::ObjectIndex;
use crate::types::ContainerId;

// Container record: id | object index meta | used bytes | reserved
const CONTAINER_REC_SIZE: usize = 40;

/// Persistent image of one container directory record.
///
/// The object index reference is non-null for the record's entire life:
/// it is created atomically with the record and destroyed atomically
/// before the record is unlinked.
pub(crate) struct ContainerRecord {
    pub id: [u8; 16],
    pub obtable: CellId,
    pub used_bytes: u64,
}

impl ContainerRecord {
    pub(crate) fn read(heap: &Heap, rec: CellId) -> Result<ContainerRecord> {
        let bytes = heap.read(rec)?;
        if bytes.len() < CONTAINER_REC_SIZE {
            return Err(Error::Corrupted);
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[..16]);
        let mut used = [0u8; 8];
        used.copy_from_slice(&bytes[24..32]);
        Ok(ContainerRecord {
            id,
            obtable: CellId::decode(&bytes[16..24]),
            used_bytes: u64::from_le_bytes(used),
        })
    }

    pub(crate) fn write(&self, heap: &mut Heap, rec: CellId) -> Result<()> {
        let mut buf = [0u8; CONTAINER_REC_SIZE];
        buf[..16].copy_from_slice(&self.id);
        buf[16..24].copy_from_slice(&self.obtable.encode());
        buf[24..32].copy_from_slice(&self.used_bytes.to_le_bytes());
        heap.write(rec, 0, &buf)
    }
}

/// Index class for the pool-level container directory. Each record owns a
/// nested object index, so record alloc and free are the only two places
/// where that coupling exists.
pub struct ContainerClass;

impl IndexClass for ContainerClass {
    fn hkey_size(&self) -> usize {
        HKEY_SIZE
    }

    fn hkey_gen(&self, key: &[u8]) -> HKey {
        let mut b = [0u8; 16];
        b.copy_from_slice(&key[..16]);
        u128::from_le_bytes(b)
    }

    fn rec_alloc(&self, heap: &mut Heap, key: &[u8], _val: &[u8]) -> Result<CellId> {
        if key.len() != 16 {
            return Err(Error::InvalidArgument);
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(key);
        log::debug!(
            "allocating record for container {}",
            ContainerId::from_bytes(id)
        );

        let rec = heap.alloc(CONTAINER_REC_SIZE)?;
        let record = ContainerRecord {
            id,
            obtable: CellId::NULL,
            used_bytes: 0,
        };
        record.write(heap, rec)?;

        let obtable = match ObjectIndex::create(heap) {
            Ok(meta) => meta,
            Err(e) => {
                log::error!("object index create failure: {}", e);
                self.rec_free(heap, rec)?;
                return Err(e);
            }
        };
        heap.write(rec, 16, &obtable.encode())?;
        Ok(rec)
    }

    fn rec_free(&self, heap: &mut Heap, rec: CellId) -> Result<()> {
        let record = ContainerRecord::read(heap, rec)?;
        if !record.obtable.is_null() {
            ObjectIndex::destroy(heap, record.obtable)?;
        }
        heap.free(rec)
    }

    fn rec_fetch(&self, heap: &Heap, rec: CellId) -> Result<Vec<u8>> {
        Ok(ContainerRecord::read(heap, rec)?.id.to_vec())
    }

    fn rec_update(&self, _heap: &mut Heap, _rec: CellId, _key: &[u8], _val: &[u8]) -> Result<()> {
        log::debug!("container record exists already, nothing to do");
        Ok(())
    }
}
