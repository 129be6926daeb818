use std::sync::Arc;

use crate::class::{get_class, ClassTag, HKey, IndexClass};
use crate::error::{Error, Result};
use crate::heap::{CellId, Heap};

// Meta cell: tag u16 | order u16 | root CellId | nentries u64
const META_SIZE: usize = 20;

/// Insert-or-existing outcome of `Tree::update`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A new record was allocated and linked
    Created,
    /// The key already had a record; the class update callback ran
    Found,
}

/// Lookup result: the record cell plus its class-defined value bytes
#[derive(Debug, Clone)]
pub struct RecordView {
    pub rec: CellId,
    pub value: Vec<u8>,
}

/// Seek target for ordered scans
#[derive(Debug, Clone, Copy)]
pub enum SeekBound {
    /// Smallest entry in the tree
    First,
    /// Smallest entry with hkey >= the bound
    Ge(HKey),
    /// Smallest entry with hkey > the bound
    Gt(HKey),
}

/// Volatile view of one attached tree.
///
/// All tree state lives in the heap; this handle carries only the meta
/// cell id and the resolved class vtable. The engine holds no locks and
/// requires the caller to supply the transaction boundary for every
/// mutating call.
#[derive(Clone)]
pub struct Tree {
    meta: CellId,
    order: usize,
    class: Arc<dyn IndexClass>,
}

// In-memory image of one node. Leaves hold (hkey, rec) pairs; inner nodes
// hold separator hkeys and count+1 children.
struct Node {
    leaf: bool,
    hkeys: Vec<HKey>,
    recs: Vec<CellId>,
    children: Vec<CellId>,
}

impl Node {
    fn count(&self) -> usize {
        self.hkeys.len()
    }
}

impl Tree {
    /// Build an empty tree of the given class and branching order.
    /// Requires an active transaction; returns the meta cell to embed in
    /// caller-owned storage.
    pub fn create(heap: &mut Heap, tag: ClassTag, order: u16) -> Result<CellId> {
        if !heap.in_tx() {
            return Err(Error::InvalidState);
        }
        if order < 2 {
            return Err(Error::InvalidArgument);
        }
        get_class(tag)?;

        let meta = heap.alloc(META_SIZE)?;
        let mut buf = [0u8; META_SIZE];
        buf[..2].copy_from_slice(&tag.0.to_le_bytes());
        buf[2..4].copy_from_slice(&order.to_le_bytes());
        buf[4..12].copy_from_slice(&CellId::NULL.encode());
        buf[12..20].copy_from_slice(&0u64.to_le_bytes());
        heap.write(meta, 0, &buf)?;
        Ok(meta)
    }

    /// Attach to an existing tree
    pub fn open(heap: &Heap, meta: CellId) -> Result<Tree> {
        let bytes = heap.read(meta)?;
        if bytes.len() < META_SIZE {
            return Err(Error::Corrupted);
        }
        let tag = u16::from_le_bytes([bytes[0], bytes[1]]);
        let order = u16::from_le_bytes([bytes[2], bytes[3]]);
        if order < 2 {
            return Err(Error::Corrupted);
        }
        let class = get_class(ClassTag(tag))?;
        Ok(Tree {
            meta,
            order: order as usize,
            class,
        })
    }

    /// Tear down a whole tree: every record through the class free
    /// callback, every node, then the meta cell
    pub fn destroy(heap: &mut Heap, meta: CellId) -> Result<()> {
        if !heap.in_tx() {
            return Err(Error::InvalidState);
        }
        let tree = Tree::open(heap, meta)?;
        let m = tree.read_meta(heap)?;
        if !m.root.is_null() {
            tree.destroy_node(heap, m.root)?;
        }
        heap.free(meta)
    }

    pub fn meta_id(&self) -> CellId {
        self.meta
    }

    /// Number of live entries
    pub fn len(&self, heap: &Heap) -> Result<u64> {
        Ok(self.read_meta(heap)?.nentries)
    }

    pub fn is_empty(&self, heap: &Heap) -> Result<bool> {
        Ok(self.len(heap)? == 0)
    }

    /// Generate the class hash key for `key`; keys shorter than the
    /// class's declared hkey width are rejected before the class sees
    /// them
    pub fn hkey_of(&self, key: &[u8]) -> Result<HKey> {
        if key.len() < self.class.hkey_size() {
            return Err(Error::InvalidArgument);
        }
        Ok(self.class.hkey_gen(key))
    }

    /// Fetch a record's value representation through the class callback
    pub fn fetch_rec(&self, heap: &Heap, rec: CellId) -> Result<Vec<u8>> {
        self.class.rec_fetch(heap, rec)
    }

    /// Exact lookup by key
    pub fn lookup(&self, heap: &Heap, key: &[u8]) -> Result<RecordView> {
        let h = self.hkey_of(key)?;
        match self.seek(heap, SeekBound::Ge(h))? {
            Some((hk, rec)) if hk == h => {
                let value = self.class.rec_fetch(heap, rec)?;
                Ok(RecordView { rec, value })
            }
            _ => Err(Error::NotFound),
        }
    }

    /// Insert a record, or hand an existing one to the class update
    /// callback. Requires an active transaction.
    pub fn update(&self, heap: &mut Heap, key: &[u8], val: &[u8]) -> Result<UpdateOutcome> {
        if !heap.in_tx() {
            return Err(Error::InvalidState);
        }
        let h = self.hkey_of(key)?;
        let mut meta = self.read_meta(heap)?;

        if meta.root.is_null() {
            let root = self.alloc_node(heap)?;
            let rec = self.class.rec_alloc(heap, key, val)?;
            let node = Node {
                leaf: true,
                hkeys: vec![h],
                recs: vec![rec],
                children: Vec::new(),
            };
            self.write_node(heap, root, &node)?;
            meta.root = root;
            meta.nentries = 1;
            self.write_meta(heap, &meta)?;
            return Ok(UpdateOutcome::Created);
        }

        // grow the tree upward before descending
        let root_node = self.read_node(heap, meta.root)?;
        if root_node.count() == self.order {
            let new_root_id = self.alloc_node(heap)?;
            let mut new_root = Node {
                leaf: false,
                hkeys: Vec::new(),
                recs: Vec::new(),
                children: vec![meta.root],
            };
            self.split_child(heap, &mut new_root, 0)?;
            self.write_node(heap, new_root_id, &new_root)?;
            meta.root = new_root_id;
            self.write_meta(heap, &meta)?;
        }

        let mut cur = meta.root;
        loop {
            let node = self.read_node(heap, cur)?;
            if node.leaf {
                return match node.hkeys.binary_search(&h) {
                    Ok(i) => {
                        self.class.rec_update(heap, node.recs[i], key, val)?;
                        Ok(UpdateOutcome::Found)
                    }
                    Err(i) => {
                        let rec = self.class.rec_alloc(heap, key, val)?;
                        let mut node = node;
                        node.hkeys.insert(i, h);
                        node.recs.insert(i, rec);
                        self.write_node(heap, cur, &node)?;
                        meta.nentries += 1;
                        self.write_meta(heap, &meta)?;
                        Ok(UpdateOutcome::Created)
                    }
                };
            }

            let idx = route(&node.hkeys, h);
            let child_id = node.children[idx];
            let child = self.read_node(heap, child_id)?;
            if child.count() == self.order {
                let mut parent = node;
                self.split_child(heap, &mut parent, idx)?;
                self.write_node(heap, cur, &parent)?;
                let idx = route(&parent.hkeys, h);
                cur = parent.children[idx];
            } else {
                cur = child_id;
            }
        }
    }

    /// Unlink a key and free its record. Requires an active transaction.
    pub fn delete(&self, heap: &mut Heap, key: &[u8]) -> Result<()> {
        self.delete_hkey(heap, self.hkey_of(key)?)
    }

    pub(crate) fn delete_hkey(&self, heap: &mut Heap, h: HKey) -> Result<()> {
        if !heap.in_tx() {
            return Err(Error::InvalidState);
        }
        let mut meta = self.read_meta(heap)?;
        if meta.root.is_null() {
            return Err(Error::NotFound);
        }
        let mut cur = meta.root;
        loop {
            let node = self.read_node(heap, cur)?;
            if node.leaf {
                return match node.hkeys.binary_search(&h) {
                    Ok(i) => {
                        let mut node = node;
                        let rec = node.recs[i];
                        node.hkeys.remove(i);
                        node.recs.remove(i);
                        // emptied leaves stay behind as routing stubs;
                        // space comes back when the tree is destroyed
                        self.write_node(heap, cur, &node)?;
                        self.class.rec_free(heap, rec)?;
                        meta.nentries -= 1;
                        self.write_meta(heap, &meta)?;
                        Ok(())
                    }
                    Err(_) => Err(Error::NotFound),
                };
            }
            cur = node.children[route(&node.hkeys, h)];
        }
    }

    /// Find the first entry satisfying the bound, in hkey order
    pub fn seek(&self, heap: &Heap, bound: SeekBound) -> Result<Option<(HKey, CellId)>> {
        let meta = self.read_meta(heap)?;
        if meta.root.is_null() {
            return Ok(None);
        }
        self.seek_node(heap, meta.root, bound)
    }

    fn seek_node(
        &self,
        heap: &Heap,
        node_id: CellId,
        bound: SeekBound,
    ) -> Result<Option<(HKey, CellId)>> {
        let node = self.read_node(heap, node_id)?;
        if node.leaf {
            let start = match bound {
                SeekBound::First => 0,
                SeekBound::Ge(h) => node.hkeys.partition_point(|k| *k < h),
                SeekBound::Gt(h) => node.hkeys.partition_point(|k| *k <= h),
            };
            if start < node.hkeys.len() {
                return Ok(Some((node.hkeys[start], node.recs[start])));
            }
            return Ok(None);
        }
        let start = match bound {
            SeekBound::First => 0,
            SeekBound::Ge(h) | SeekBound::Gt(h) => route(&node.hkeys, h),
        };
        for i in start..node.children.len() {
            if let Some(found) = self.seek_node(heap, node.children[i], bound)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    // Split the full child at `parent.children[idx]`; the parent image is
    // updated in memory, the caller writes it back.
    fn split_child(&self, heap: &mut Heap, parent: &mut Node, idx: usize) -> Result<()> {
        let child_id = parent.children[idx];
        let mut child = self.read_node(heap, child_id)?;
        let mid = child.count() / 2;
        let right_id = self.alloc_node(heap)?;

        let (sep, right) = if child.leaf {
            let hk = child.hkeys.split_off(mid);
            let rc = child.recs.split_off(mid);
            let sep = hk[0];
            (
                sep,
                Node {
                    leaf: true,
                    hkeys: hk,
                    recs: rc,
                    children: Vec::new(),
                },
            )
        } else {
            let mut hk = child.hkeys.split_off(mid);
            let ch = child.children.split_off(mid + 1);
            let sep = hk.remove(0);
            (
                sep,
                Node {
                    leaf: false,
                    hkeys: hk,
                    recs: Vec::new(),
                    children: ch,
                },
            )
        };

        self.write_node(heap, right_id, &right)?;
        self.write_node(heap, child_id, &child)?;
        parent.hkeys.insert(idx, sep);
        parent.children.insert(idx + 1, right_id);
        Ok(())
    }

    fn destroy_node(&self, heap: &mut Heap, node_id: CellId) -> Result<()> {
        let node = self.read_node(heap, node_id)?;
        if node.leaf {
            for rec in &node.recs {
                self.class.rec_free(heap, *rec)?;
            }
        } else {
            for child in &node.children {
                self.destroy_node(heap, *child)?;
            }
        }
        heap.free(node_id)
    }

    fn alloc_node(&self, heap: &mut Heap) -> Result<CellId> {
        heap.alloc(node_size(self.order))
    }

    fn read_meta(&self, heap: &Heap) -> Result<MetaBlock> {
        let bytes = heap.read(self.meta)?;
        let mut n = [0u8; 8];
        n.copy_from_slice(&bytes[12..20]);
        Ok(MetaBlock {
            root: CellId::decode(&bytes[4..12]),
            nentries: u64::from_le_bytes(n),
        })
    }

    fn write_meta(&self, heap: &mut Heap, m: &MetaBlock) -> Result<()> {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&m.root.encode());
        buf[8..].copy_from_slice(&m.nentries.to_le_bytes());
        heap.write(self.meta, 4, &buf)
    }

    fn read_node(&self, heap: &Heap, id: CellId) -> Result<Node> {
        let bytes = heap.read(id)?;
        if bytes.len() < node_size(self.order) {
            return Err(Error::Corrupted);
        }
        let leaf = bytes[0] != 0;
        let count = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        if count > self.order {
            return Err(Error::Corrupted);
        }

        let mut hkeys = Vec::with_capacity(count);
        let mut recs = Vec::new();
        let mut children = Vec::new();
        if leaf {
            let mut off = 4;
            for _ in 0..count {
                let mut k = [0u8; 16];
                k.copy_from_slice(&bytes[off..off + 16]);
                hkeys.push(u128::from_le_bytes(k));
                recs.push(CellId::decode(&bytes[off + 16..off + 24]));
                off += 24;
            }
        } else {
            let mut off = 4;
            for _ in 0..count {
                let mut k = [0u8; 16];
                k.copy_from_slice(&bytes[off..off + 16]);
                hkeys.push(u128::from_le_bytes(k));
                off += 16;
            }
            let mut coff = 4 + self.order * 16;
            for _ in 0..count + 1 {
                children.push(CellId::decode(&bytes[coff..coff + 8]));
                coff += 8;
            }
        }
        Ok(Node {
            leaf,
            hkeys,
            recs,
            children,
        })
    }

    fn write_node(&self, heap: &mut Heap, id: CellId, node: &Node) -> Result<()> {
        let mut buf = vec![0u8; node_size(self.order)];
        buf[0] = node.leaf as u8;
        buf[2..4].copy_from_slice(&(node.count() as u16).to_le_bytes());
        if node.leaf {
            let mut off = 4;
            for (k, r) in node.hkeys.iter().zip(node.recs.iter()) {
                buf[off..off + 16].copy_from_slice(&k.to_le_bytes());
                buf[off + 16..off + 24].copy_from_slice(&r.encode());
                off += 24;
            }
        } else {
            let mut off = 4;
            for k in &node.hkeys {
                buf[off..off + 16].copy_from_slice(&k.to_le_bytes());
                off += 16;
            }
            let mut coff = 4 + self.order * 16;
            for c in &node.children {
                buf[coff..coff + 8].copy_from_slice(&c.encode());
                coff += 8;
            }
        }
        heap.write(id, 0, &buf)
    }
}

struct MetaBlock {
    root: CellId,
    nentries: u64,
}

// Route a key to the child that may contain it: separators are the first
// hkey of their right subtree, so keys >= separator go right.
fn route(seps: &[HKey], h: HKey) -> usize {
    seps.partition_point(|s| *s <= h)
}

fn node_size(order: usize) -> usize {
    4 + order * 24 + 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::register_class;
    use crate::constants::PoolFlags;
    use crate::obj_index::ObjectClass;
    use tempfile::TempDir;

    const TEST_TAG: ClassTag = ClassTag(100);

    fn setup() -> (TempDir, Heap, Tree) {
        match register_class(TEST_TAG, Arc::new(ObjectClass)) {
            Ok(()) | Err(Error::ClassExists(_)) => {}
            Err(e) => panic!("class registration failed: {}", e),
        }
        let dir = TempDir::new().unwrap();
        let mut heap =
            Heap::create(dir.path().join("pool"), 4 * 1024 * 1024, PoolFlags::empty()).unwrap();
        let mut tx = heap.tx().unwrap();
        // low order so a few dozen keys build real depth
        let meta = Tree::create(&mut tx, TEST_TAG, 4).unwrap();
        tx.commit().unwrap();
        let tree = Tree::open(&heap, meta).unwrap();
        (dir, heap, tree)
    }

    fn key(v: u128) -> [u8; 16] {
        v.to_le_bytes()
    }

    fn insert(heap: &mut Heap, tree: &Tree, v: u128, val: &[u8]) -> UpdateOutcome {
        let mut tx = heap.tx().unwrap();
        let outcome = tree.update(&mut tx, &key(v), val).unwrap();
        tx.commit().unwrap();
        outcome
    }

    fn scan(heap: &Heap, tree: &Tree) -> Vec<u128> {
        let mut out = Vec::new();
        let mut bound = SeekBound::First;
        while let Some((h, _)) = tree.seek(heap, bound).unwrap() {
            out.push(h);
            bound = SeekBound::Gt(h);
        }
        out
    }

    #[test]
    fn create_requires_transaction() {
        let dir = TempDir::new().unwrap();
        let mut heap =
            Heap::create(dir.path().join("pool"), 1024 * 1024, PoolFlags::empty()).unwrap();
        assert!(matches!(
            Tree::create(&mut heap, TEST_TAG, 4),
            Err(Error::InvalidState)
        ));
    }

    #[test]
    fn create_rejects_unknown_class() {
        let dir = TempDir::new().unwrap();
        let mut heap =
            Heap::create(dir.path().join("pool"), 1024 * 1024, PoolFlags::empty()).unwrap();
        let mut tx = heap.tx().unwrap();
        assert!(matches!(
            Tree::create(&mut tx, ClassTag(9999), 4),
            Err(Error::ClassUnknown(9999))
        ));
    }

    #[test]
    fn insert_and_lookup_across_splits() {
        let (_dir, mut heap, tree) = setup();
        // shuffled enough to split in both directions
        for v in (0..100u128).map(|i| (i * 37) % 100) {
            assert_eq!(insert(&mut heap, &tree, v, b"v"), UpdateOutcome::Created);
        }
        assert_eq!(tree.len(&heap).unwrap(), 100);

        for v in 0..100u128 {
            let view = tree.lookup(&heap, &key(v)).unwrap();
            assert_eq!(view.value, b"v");
        }
        assert!(matches!(
            tree.lookup(&heap, &key(100)),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn update_existing_replaces_value() {
        let (_dir, mut heap, tree) = setup();
        insert(&mut heap, &tree, 1, b"old");
        assert_eq!(insert(&mut heap, &tree, 1, b"new"), UpdateOutcome::Found);
        assert_eq!(tree.len(&heap).unwrap(), 1);
        assert_eq!(tree.lookup(&heap, &key(1)).unwrap().value, b"new");
    }

    #[test]
    fn scan_is_ordered_and_complete() {
        let (_dir, mut heap, tree) = setup();
        for v in [9u128, 3, 27, 1, 81, 40, 2] {
            insert(&mut heap, &tree, v, b"v");
        }
        assert_eq!(scan(&heap, &tree), vec![1, 2, 3, 9, 27, 40, 81]);
    }

    #[test]
    fn delete_unlinks_and_scan_skips_emptied_leaves() {
        let (_dir, mut heap, tree) = setup();
        for v in 0..50u128 {
            insert(&mut heap, &tree, v, b"v");
        }
        // hollow out the middle, leaving empty leaves behind
        for v in 10..40u128 {
            let mut tx = heap.tx().unwrap();
            tree.delete(&mut tx, &key(v)).unwrap();
            tx.commit().unwrap();
        }
        assert_eq!(tree.len(&heap).unwrap(), 20);

        let expected: Vec<u128> = (0..10).chain(40..50).collect();
        assert_eq!(scan(&heap, &tree), expected);

        let mut tx = heap.tx().unwrap();
        assert!(matches!(
            tree.delete(&mut tx, &key(20)),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn short_key_is_rejected() {
        let (_dir, mut heap, tree) = setup();
        insert(&mut heap, &tree, 1, b"v");

        // shorter than the class hkey width must error, not panic
        assert!(matches!(
            tree.lookup(&heap, b"short"),
            Err(Error::InvalidArgument)
        ));

        let mut tx = heap.tx().unwrap();
        assert!(matches!(
            tree.update(&mut tx, b"short", b"v"),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(
            tree.delete(&mut tx, b"short"),
            Err(Error::InvalidArgument)
        ));
        tx.commit().unwrap();

        assert_eq!(tree.len(&heap).unwrap(), 1);
    }

    #[test]
    fn seek_bounds() {
        let (_dir, mut heap, tree) = setup();
        assert!(tree.seek(&heap, SeekBound::First).unwrap().is_none());

        for v in [2u128, 4, 6] {
            insert(&mut heap, &tree, v, b"v");
        }
        assert_eq!(tree.seek(&heap, SeekBound::First).unwrap().unwrap().0, 2);
        assert_eq!(tree.seek(&heap, SeekBound::Ge(4)).unwrap().unwrap().0, 4);
        assert_eq!(tree.seek(&heap, SeekBound::Gt(4)).unwrap().unwrap().0, 6);
        assert!(tree.seek(&heap, SeekBound::Gt(6)).unwrap().is_none());
    }

    #[test]
    fn destroy_frees_the_whole_tree() {
        let (_dir, mut heap, tree) = setup();
        for v in 0..30u128 {
            insert(&mut heap, &tree, v, b"payload");
        }
        let meta = tree.meta_id();

        let mut tx = heap.tx().unwrap();
        Tree::destroy(&mut tx, meta).unwrap();
        tx.commit().unwrap();

        assert!(matches!(heap.read(meta), Err(Error::NotFound)));
    }
}
