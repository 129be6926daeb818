use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::constants::{PoolFlags, HEAP_MAGIC, HEAP_VERSION};
use crate::error::{Error, Result};

// Header field offsets, all little-endian
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_HEAP_SIZE: usize = 8;
const OFF_UNDO_CAP: usize = 16;
const OFF_SLOT_COUNT: usize = 24;
const OFF_TXN_STATE: usize = 28;
const OFF_UNDO_ENTRIES: usize = 32;
const OFF_DATA_HEAD: usize = 40;
const OFF_ROOT: usize = 48;

const HEADER_SIZE: usize = 64;
const UNDO_OFF: usize = HEADER_SIZE;
const SLOT_ENTRY_SIZE: usize = 16;
const UNDO_REC_HDR: usize = 12;

const TXN_IDLE: u32 = 0;
const TXN_ACTIVE: u32 = 1;

/// Generation-checked reference to a heap cell.
///
/// A `CellId` is the persistent replacement for a pointer: it survives
/// remapping, and resolving a stale id (the cell was freed, possibly
/// reallocated) fails instead of aliasing unrelated bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId {
    slot: u32,
    gen: u32,
}

impl CellId {
    pub const NULL: CellId = CellId {
        slot: u32::MAX,
        gen: 0,
    };

    pub fn is_null(&self) -> bool {
        self.slot == u32::MAX
    }

    pub(crate) fn encode(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[..4].copy_from_slice(&self.slot.to_le_bytes());
        b[4..].copy_from_slice(&self.gen.to_le_bytes());
        b
    }

    pub(crate) fn decode(b: &[u8]) -> CellId {
        let mut s = [0u8; 4];
        let mut g = [0u8; 4];
        s.copy_from_slice(&b[..4]);
        g.copy_from_slice(&b[4..8]);
        CellId {
            slot: u32::from_le_bytes(s),
            gen: u32::from_le_bytes(g),
        }
    }
}

struct TxState {
    undo_used: usize,
}

/// Allocator over a memory-mapped persistent region.
///
/// Every mutation must happen inside a transaction; an interrupted
/// transaction is rolled back from the persisted undo log the next time
/// the heap is opened.
pub struct Heap {
    path: PathBuf,
    file: File,
    map: MmapMut,
    flags: PoolFlags,
    heap_size: u64,
    undo_cap: u64,
    slot_count: u32,
    tx: Option<TxState>,
}

impl Heap {
    /// Format a new heap file
    pub fn create<P: AsRef<Path>>(path: P, size: u64, flags: PoolFlags) -> Result<Heap> {
        let undo_cap = (size / 16).clamp(64 * 1024, 1024 * 1024);
        let slot_count = (size / 1024).clamp(256, 65536) as u32;
        let data_start =
            HEADER_SIZE as u64 + undo_cap + u64::from(slot_count) * SLOT_ENTRY_SIZE as u64;
        if data_start + 4096 > size {
            return Err(Error::InvalidArgument);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        file.set_len(size)?;
        let map = unsafe { MmapOptions::new().len(size as usize).map_mut(&file)? };

        let mut heap = Heap {
            path: path.as_ref().to_path_buf(),
            file,
            map,
            flags,
            heap_size: size,
            undo_cap,
            slot_count,
            tx: None,
        };

        heap.put_u32(OFF_MAGIC, HEAP_MAGIC);
        heap.put_u32(OFF_VERSION, HEAP_VERSION);
        heap.put_u64(OFF_HEAP_SIZE, size);
        heap.put_u64(OFF_UNDO_CAP, undo_cap);
        heap.put_u32(OFF_SLOT_COUNT, slot_count);
        heap.put_u32(OFF_TXN_STATE, TXN_IDLE);
        heap.put_u32(OFF_UNDO_ENTRIES, 0);
        heap.put_u64(OFF_DATA_HEAD, data_start);
        heap.put_bytes(OFF_ROOT, &CellId::NULL.encode());
        heap.flush_all()?;

        log::debug!(
            "formatted heap {:?}: {} bytes, {} slots",
            heap.path,
            size,
            slot_count
        );
        Ok(heap)
    }

    /// Attach to an existing heap file, rolling back any interrupted
    /// transaction before returning
    pub fn open<P: AsRef<Path>>(path: P, flags: PoolFlags) -> Result<Heap> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let size = file.metadata()?.len();
        if size < (HEADER_SIZE + 4096) as u64 {
            return Err(Error::Corrupted);
        }
        let map = unsafe { MmapOptions::new().len(size as usize).map_mut(&file)? };

        let mut heap = Heap {
            path: path.as_ref().to_path_buf(),
            file,
            map,
            flags,
            heap_size: size,
            undo_cap: 0,
            slot_count: 0,
            tx: None,
        };

        if heap.get_u32(OFF_MAGIC) != HEAP_MAGIC {
            return Err(Error::Corrupted);
        }
        if heap.get_u32(OFF_VERSION) != HEAP_VERSION {
            return Err(Error::VersionMismatch);
        }
        if heap.get_u64(OFF_HEAP_SIZE) != size {
            return Err(Error::Corrupted);
        }
        heap.undo_cap = heap.get_u64(OFF_UNDO_CAP);
        heap.slot_count = heap.get_u32(OFF_SLOT_COUNT);

        // region sizes come from the file; bound them before any slot or
        // undo offset is computed from them
        let data_start = (UNDO_OFF as u64)
            .checked_add(heap.undo_cap)
            .and_then(|v| v.checked_add(u64::from(heap.slot_count) * SLOT_ENTRY_SIZE as u64))
            .ok_or(Error::Corrupted)?;
        if data_start > size {
            return Err(Error::Corrupted);
        }

        if heap.get_u32(OFF_TXN_STATE) == TXN_ACTIVE {
            let n = heap.get_u32(OFF_UNDO_ENTRIES);
            log::warn!(
                "heap {:?}: rolling back interrupted transaction ({} undo records)",
                heap.path,
                n
            );
            heap.rollback_undo()?;
        }

        Ok(heap)
    }

    pub fn flags(&self) -> PoolFlags {
        self.flags
    }

    pub(crate) fn set_flags(&mut self, flags: PoolFlags) {
        self.flags = flags;
    }

    pub fn size(&self) -> u64 {
        self.heap_size
    }

    /// Bytes consumed in the data region
    pub fn used_bytes(&self) -> u64 {
        self.get_u64(OFF_DATA_HEAD) - self.data_start()
    }

    /// Well-known root cell (the container directory meta)
    pub fn root(&self) -> CellId {
        CellId::decode(&self.map[OFF_ROOT..OFF_ROOT + 8])
    }

    pub fn set_root(&mut self, id: CellId) -> Result<()> {
        self.ensure_tx()?;
        let bytes = id.encode();
        self.tx_write(OFF_ROOT, &bytes)
    }

    /// Allocate a zeroed cell of `len` bytes
    pub fn alloc(&mut self, len: usize) -> Result<CellId> {
        self.ensure_tx()?;
        self.ensure_writable()?;
        if len == 0 {
            return Err(Error::InvalidArgument);
        }

        let slot = self.find_free_slot().ok_or(Error::NoMemory)?;
        let data_off = align8(self.get_u64(OFF_DATA_HEAD));
        if data_off + len as u64 > self.heap_size {
            return Err(Error::NoMemory);
        }

        let (_, _, gen) = self.slot_entry(slot);
        let mut entry = [0u8; SLOT_ENTRY_SIZE];
        entry[..8].copy_from_slice(&data_off.to_le_bytes());
        entry[8..12].copy_from_slice(&(len as u32).to_le_bytes());
        entry[12..].copy_from_slice(&gen.to_le_bytes());
        self.tx_write(self.slot_off(slot), &entry)?;
        self.tx_write(OFF_DATA_HEAD, &(data_off + len as u64).to_le_bytes())?;

        // fresh cells are zeroed, umem_znew style
        let zeros = vec![0u8; len];
        self.tx_write(data_off as usize, &zeros)?;

        Ok(CellId { slot, gen })
    }

    /// Free a cell; its generation is bumped so stale ids fail to resolve
    pub fn free(&mut self, id: CellId) -> Result<()> {
        self.ensure_tx()?;
        self.resolve(id)?;
        let (off, _, gen) = self.slot_entry(id.slot);
        let mut entry = [0u8; SLOT_ENTRY_SIZE];
        entry[..8].copy_from_slice(&off.to_le_bytes());
        entry[8..12].copy_from_slice(&0u32.to_le_bytes());
        entry[12..].copy_from_slice(&gen.wrapping_add(1).to_le_bytes());
        self.tx_write(self.slot_off(id.slot), &entry)
    }

    /// Resolve a cell to its bytes
    pub fn read(&self, id: CellId) -> Result<&[u8]> {
        let (off, len) = self.resolve(id)?;
        Ok(&self.map[off..off + len])
    }

    /// Overwrite part of a cell
    pub fn write(&mut self, id: CellId, off: usize, data: &[u8]) -> Result<()> {
        self.ensure_tx()?;
        let (cell_off, cell_len) = self.resolve(id)?;
        if off + data.len() > cell_len {
            return Err(Error::InvalidArgument);
        }
        self.tx_write(cell_off + off, data)
    }

    /// Begin a scoped transaction; dropping the guard without an explicit
    /// commit aborts it
    pub fn tx(&mut self) -> Result<TxGuard<'_>> {
        self.tx_begin()?;
        Ok(TxGuard {
            heap: self,
            done: false,
        })
    }

    pub fn in_tx(&self) -> bool {
        self.tx.is_some()
    }

    pub(crate) fn tx_begin(&mut self) -> Result<()> {
        self.ensure_writable()?;
        if self.tx.is_some() || self.get_u32(OFF_TXN_STATE) != TXN_IDLE {
            return Err(Error::InvalidState);
        }
        self.put_u32(OFF_UNDO_ENTRIES, 0);
        self.put_u32(OFF_TXN_STATE, TXN_ACTIVE);
        self.flush_header()?;
        self.tx = Some(TxState { undo_used: 0 });
        Ok(())
    }

    pub(crate) fn tx_commit(&mut self) -> Result<()> {
        self.ensure_tx()?;
        if !self.flags.contains(PoolFlags::NOSYNC) {
            if self.map.flush().is_err() {
                // data durability is unknown, fall back to the undo log
                let _ = self.tx_abort();
                return Err(Error::IoFault);
            }
        }
        self.put_u32(OFF_TXN_STATE, TXN_IDLE);
        self.put_u32(OFF_UNDO_ENTRIES, 0);
        self.flush_header()?;
        self.tx = None;
        Ok(())
    }

    pub(crate) fn tx_abort(&mut self) -> Result<()> {
        self.ensure_tx()?;
        self.rollback_undo()?;
        self.tx = None;
        Ok(())
    }

    fn ensure_tx(&self) -> Result<()> {
        if self.tx.is_none() {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.flags.contains(PoolFlags::RDONLY) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Log the pre-image of `[off, off + data.len())`, then overwrite it.
    /// The undo record is made durable before the target bytes change.
    fn tx_write(&mut self, off: usize, data: &[u8]) -> Result<()> {
        let undo_used = match &self.tx {
            Some(t) => t.undo_used,
            None => return Err(Error::InvalidState),
        };
        let rec_len = UNDO_REC_HDR + data.len();
        if undo_used + rec_len > self.undo_cap as usize {
            return Err(Error::TxnFull);
        }

        let pre: Vec<u8> = self.map[off..off + data.len()].to_vec();
        let undo_pos = UNDO_OFF + undo_used;
        self.map[undo_pos..undo_pos + 8].copy_from_slice(&(off as u64).to_le_bytes());
        self.map[undo_pos + 8..undo_pos + 12].copy_from_slice(&(data.len() as u32).to_le_bytes());
        self.map[undo_pos + 12..undo_pos + rec_len].copy_from_slice(&pre);
        self.maybe_flush_range(undo_pos, rec_len)?;

        let n = self.get_u32(OFF_UNDO_ENTRIES);
        self.put_u32(OFF_UNDO_ENTRIES, n + 1);
        self.flush_header()?;

        self.map[off..off + data.len()].copy_from_slice(data);
        if let Some(t) = &mut self.tx {
            t.undo_used = undo_used + rec_len;
        }
        Ok(())
    }

    /// Apply the undo log in reverse and clear the transaction state
    fn rollback_undo(&mut self) -> Result<()> {
        let n = self.get_u32(OFF_UNDO_ENTRIES);
        let mut records = Vec::with_capacity(n as usize);
        let mut pos = UNDO_OFF;
        for _ in 0..n {
            let off = self.get_u64(pos) as usize;
            let len = self.get_u32(pos + 8) as usize;
            let pre = self.map[pos + 12..pos + 12 + len].to_vec();
            records.push((off, pre));
            pos += UNDO_REC_HDR + len;
        }
        for (off, pre) in records.iter().rev() {
            self.map[*off..*off + pre.len()].copy_from_slice(pre);
        }
        self.put_u32(OFF_TXN_STATE, TXN_IDLE);
        self.put_u32(OFF_UNDO_ENTRIES, 0);
        self.flush_all()?;
        Ok(())
    }

    fn resolve(&self, id: CellId) -> Result<(usize, usize)> {
        if id.is_null() {
            return Err(Error::InvalidArgument);
        }
        if id.slot >= self.slot_count {
            return Err(Error::InvalidArgument);
        }
        let (off, len, gen) = self.slot_entry(id.slot);
        if len == 0 || gen != id.gen {
            return Err(Error::NotFound);
        }
        Ok((off as usize, len as usize))
    }

    fn find_free_slot(&self) -> Option<u32> {
        (0..self.slot_count).find(|s| self.slot_entry(*s).1 == 0)
    }

    fn slot_off(&self, slot: u32) -> usize {
        UNDO_OFF + self.undo_cap as usize + slot as usize * SLOT_ENTRY_SIZE
    }

    fn slot_entry(&self, slot: u32) -> (u64, u32, u32) {
        let off = self.slot_off(slot);
        (
            self.get_u64(off),
            self.get_u32(off + 8),
            self.get_u32(off + 12),
        )
    }

    fn data_start(&self) -> u64 {
        self.slot_off(self.slot_count) as u64
    }

    fn get_u32(&self, off: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.map[off..off + 4]);
        u32::from_le_bytes(b)
    }

    fn get_u64(&self, off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.map[off..off + 8]);
        u64::from_le_bytes(b)
    }

    // raw header writes, not undo-logged; only transaction bookkeeping
    // fields go through these
    fn put_u32(&mut self, off: usize, v: u32) {
        self.map[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, off: usize, v: u64) {
        self.map[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    fn put_bytes(&mut self, off: usize, data: &[u8]) {
        self.map[off..off + data.len()].copy_from_slice(data);
    }

    fn flush_header(&self) -> Result<()> {
        self.maybe_flush_range(0, HEADER_SIZE)
    }

    fn flush_all(&self) -> Result<()> {
        if self.flags.contains(PoolFlags::NOSYNC) {
            return Ok(());
        }
        self.map.flush().map_err(|_| Error::IoFault)
    }

    fn maybe_flush_range(&self, off: usize, len: usize) -> Result<()> {
        if self.flags.contains(PoolFlags::NOSYNC) {
            return Ok(());
        }
        self.map.flush_range(off, len).map_err(|_| Error::IoFault)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // best-effort writeback on detach; an open transaction is left for
        // recovery exactly as a crash would leave it
        if !self.flags.contains(PoolFlags::NOSYNC) {
            let _ = self.map.flush();
        }
        let _ = self.file.sync_all();
    }
}

/// Scoped transaction over a heap.
///
/// Commit is explicit; every other exit path aborts.
pub struct TxGuard<'h> {
    heap: &'h mut Heap,
    done: bool,
}

impl<'h> TxGuard<'h> {
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        self.heap.tx_commit()
    }

    pub fn abort(mut self) -> Result<()> {
        self.done = true;
        self.heap.tx_abort()
    }
}

impl Deref for TxGuard<'_> {
    type Target = Heap;

    fn deref(&self) -> &Heap {
        self.heap
    }
}

impl DerefMut for TxGuard<'_> {
    fn deref_mut(&mut self) -> &mut Heap {
        self.heap
    }
}

impl Drop for TxGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.heap.tx_abort();
        }
    }
}

fn align8(v: u64) -> u64 {
    (v + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_heap(dir: &TempDir) -> Heap {
        Heap::create(dir.path().join("pool"), 1024 * 1024, PoolFlags::empty()).unwrap()
    }

    #[test]
    fn alloc_write_read() {
        let dir = TempDir::new().unwrap();
        let mut heap = new_heap(&dir);

        let mut tx = heap.tx().unwrap();
        let cell = tx.alloc(32).unwrap();
        tx.write(cell, 0, b"hello").unwrap();
        tx.commit().unwrap();

        assert_eq!(&heap.read(cell).unwrap()[..5], b"hello");
        assert_eq!(heap.read(cell).unwrap().len(), 32);
    }

    #[test]
    fn mutation_requires_transaction() {
        let dir = TempDir::new().unwrap();
        let mut heap = new_heap(&dir);
        assert!(matches!(heap.alloc(16), Err(Error::InvalidState)));
    }

    #[test]
    fn stale_id_fails_resolution() {
        let dir = TempDir::new().unwrap();
        let mut heap = new_heap(&dir);

        let mut tx = heap.tx().unwrap();
        let cell = tx.alloc(16).unwrap();
        tx.free(cell).unwrap();
        tx.commit().unwrap();

        assert!(matches!(heap.read(cell), Err(Error::NotFound)));
    }

    #[test]
    fn abort_restores_pre_state() {
        let dir = TempDir::new().unwrap();
        let mut heap = new_heap(&dir);

        let mut tx = heap.tx().unwrap();
        let cell = tx.alloc(16).unwrap();
        tx.write(cell, 0, b"persist").unwrap();
        tx.commit().unwrap();
        let used = heap.used_bytes();

        let mut tx = heap.tx().unwrap();
        let scratch = tx.alloc(64).unwrap();
        tx.write(cell, 0, b"clobber").unwrap();
        tx.abort().unwrap();

        assert_eq!(&heap.read(cell).unwrap()[..7], b"persist");
        assert!(matches!(heap.read(scratch), Err(Error::NotFound)));
        assert_eq!(heap.used_bytes(), used);
    }

    #[test]
    fn guard_drop_aborts() {
        let dir = TempDir::new().unwrap();
        let mut heap = new_heap(&dir);

        let mut tx = heap.tx().unwrap();
        let cell = tx.alloc(16).unwrap();
        drop(tx);

        assert!(matches!(heap.read(cell), Err(Error::NotFound)));
        assert!(!heap.in_tx());
    }

    #[test]
    fn reopen_rolls_back_interrupted_transaction() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool");
        let cell;
        {
            let mut heap = Heap::create(&path, 1024 * 1024, PoolFlags::empty()).unwrap();
            let mut tx = heap.tx().unwrap();
            cell = tx.alloc(16).unwrap();
            tx.write(cell, 0, b"stable").unwrap();
            tx.commit().unwrap();

            // crash mid-transaction: mutate, then drop without commit or
            // abort; Heap::drop only flushes, leaving the crash image
            heap.tx_begin().unwrap();
            heap.write(cell, 0, b"torn").unwrap();
            let scratch = heap.alloc(16).unwrap();
            heap.write(scratch, 0, b"garbage").unwrap();
        }

        let heap = Heap::open(&path, PoolFlags::empty()).unwrap();
        assert_eq!(&heap.read(cell).unwrap()[..6], b"stable");
    }

    #[test]
    fn open_rejects_oversized_region_headers() {
        use std::io::{Seek, SeekFrom, Write};

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool");
        Heap::create(&path, 1024 * 1024, PoolFlags::empty()).unwrap();

        // corrupt the undo capacity field to a value past the file end
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(OFF_UNDO_CAP as u64)).unwrap();
        file.write_all(&u64::MAX.to_le_bytes()).unwrap();
        drop(file);

        assert!(matches!(
            Heap::open(&path, PoolFlags::empty()),
            Err(Error::Corrupted)
        ));

        // same for an absurd slot count
        Heap::create(dir.path().join("pool2"), 1024 * 1024, PoolFlags::empty()).unwrap();
        let mut file = OpenOptions::new()
            .write(true)
            .open(dir.path().join("pool2"))
            .unwrap();
        file.seek(SeekFrom::Start(OFF_SLOT_COUNT as u64)).unwrap();
        file.write_all(&u32::MAX.to_le_bytes()).unwrap();
        drop(file);

        assert!(matches!(
            Heap::open(dir.path().join("pool2"), PoolFlags::empty()),
            Err(Error::Corrupted)
        ));
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool");
        std::fs::write(&path, vec![0u8; 64 * 1024]).unwrap();
        assert!(matches!(
            Heap::open(&path, PoolFlags::empty()),
            Err(Error::Corrupted)
        ));
    }
}
