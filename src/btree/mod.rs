//! Disk-resident B+Tree.
//!
//! The tree spans two buffered files. The index file holds one node
//! per block behind a block-0 header naming the root and the ends of
//! the leaf chain; the data file holds one value per block, named from
//! the leaves by `(block, offset)` pairs. All traffic goes through the
//! buffer pools; the node codec in [`node`] is the only place that
//! touches raw bytes.
//!
//! Inserts split proactively on the way down, so a full child is split
//! before it is entered and nothing ever propagates back up. Deletes
//! strip every occurrence of the key from the leaf, then heal
//! underflow bottom-up by borrowing from a rich sibling or merging
//! with a poor one, and finally repair any separator copies of the
//! removed key with its successor. Equal keys are allowed; they sit
//! adjacently (insertion order preserved) and may straddle leaves.
//!
//! The comparator is an injected strategy: any strict less-than over
//! the key bytes works, `Ord` being merely the default.

use std::marker::PhantomData;
use std::mem;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use log::{debug, trace};
use zerocopy::{AsBytes, FromBytes};

use crate::bio::{BufferedFile, PoolConfig};
use crate::disk::BlockNo;
use crate::error::{Error, Result};
use crate::header;
use crate::param::{DATA_POOL_BLOCKS, MAX_DEPTH, ROOT_CHANCES};
use crate::pool::Replacement;

pub mod node;

use node::{Node, NodeKind, NodeLayout, ValueRef, NIL};

/// Comparator type of trees opened with the `Ord`-derived default.
pub type LessFn<K> = fn(&K, &K) -> bool;

fn ord_less<K: Ord>(a: &K, b: &K) -> bool {
    a < b
}

pub struct BTree<K, V, C = LessFn<K>> {
    index: BufferedFile,
    data: BufferedFile,
    layout: NodeLayout,
    root: BlockNo,
    leaf_head: BlockNo,
    leaf_tail: BlockNo,
    len: u64,
    less: C,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> BTree<K, V, LessFn<K>>
where
    K: AsBytes + FromBytes + Copy + Ord,
    V: AsBytes + FromBytes + Copy,
{
    /// Opens (or creates) a tree ordered by `K`'s `Ord`.
    pub fn open(path: &Path, config: PoolConfig) -> Result<Self> {
        Self::open_with(path, config, ord_less::<K>)
    }
}

impl<K, V, C> BTree<K, V, C>
where
    K: AsBytes + FromBytes + Copy,
    V: AsBytes + FromBytes + Copy,
    C: Fn(&K, &K) -> bool,
{
    /// Opens (or creates) a tree ordered by `less`, a strict
    /// less-than. Keys compare equal when neither orders before the
    /// other.
    ///
    /// The index file sits at `path`; the value file sits next to it
    /// under the name recorded in the header. The same block size and
    /// comparator must be used across opens.
    pub fn open_with(path: &Path, config: PoolConfig, less: C) -> Result<Self> {
        let index_config = PoolConfig {
            replacement: Replacement::SecondChance,
            ..config
        };
        let mut index = BufferedFile::open(path, index_config)?;

        let layout = NodeLayout::new(index_config.block_size, mem::size_of::<K>());
        if layout.order < 4 {
            return Err(Error::Corruption("block size too small for this key size"));
        }

        let tree_header = if header::is_blank(&index) {
            let name = data_file_name(path)?;
            header::init_tree(
                &mut index,
                mem::size_of::<K>() as u32,
                mem::size_of::<V>() as u32,
                &name,
            )?;
            header::load_tree(&index, mem::size_of::<K>() as u32, mem::size_of::<V>() as u32)?
        } else {
            header::load_tree(&index, mem::size_of::<K>() as u32, mem::size_of::<V>() as u32)?
        };

        let data_block_size = mem::size_of::<V>().max(mem::size_of::<u64>());
        let data_config = PoolConfig {
            block_size: data_block_size,
            pool_bytes: data_block_size * DATA_POOL_BLOCKS,
            replacement: Replacement::Lru,
        };
        let data_path = match path.parent() {
            Some(dir) => dir.join(tree_header.data_name.as_str()),
            None => PathBuf::from(tree_header.data_name.as_str()),
        };
        let data = BufferedFile::open(&data_path, data_config)?;

        let mut tree = BTree {
            index,
            data,
            layout,
            root: tree_header.root,
            leaf_head: tree_header.leaf_head,
            leaf_tail: tree_header.leaf_tail,
            len: 0,
            less,
            _marker: PhantomData,
        };

        if tree.root == NIL {
            let root = Node(tree.index.allot_block());
            root.init(&mut tree.index, NodeKind::Leaf, NIL)?;
            tree.root = root.0;
            tree.leaf_head = root.0;
            tree.leaf_tail = root.0;
            tree.store_links();
        } else {
            tree.len = tree.recount()?;
        }

        debug!(
            "btree: opened {} (order {}, {} keys)",
            path.display(),
            tree.layout.order,
            tree.len
        );
        Ok(tree)
    }

    /// Number of stored pairs, duplicates included.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum keys per node plus one; fixed by the block size at
    /// creation.
    pub fn order(&self) -> usize {
        self.layout.order
    }

    fn keys_equal(&self, a: &K, b: &K) -> bool {
        !(self.less)(a, b) && !(self.less)(b, a)
    }

    fn store_links(&mut self) {
        header::store_tree_links(&mut self.index, self.root, self.leaf_head, self.leaf_tail);
    }

    /// Recomputes the pair count by walking the leaf chain; the header
    /// does not store it.
    fn recount(&mut self) -> Result<u64> {
        let mut total = 0u64;
        let mut cursor = self.leaf_head;
        let mut steps = 0;
        while cursor != NIL {
            steps += 1;
            if steps > self.index.last_block() {
                return Err(Error::Corruption("leaf chain does not terminate"));
            }
            let leaf = Node(cursor);
            if leaf.kind(&mut self.index)? != NodeKind::Leaf {
                return Err(Error::Corruption("leaf chain visits an internal node"));
            }
            total += leaf.count(&mut self.index)? as u64;
            cursor = leaf.next(&mut self.index)?;
        }
        Ok(total)
    }

    /// Child to descend into for `key`: ties go right, so an equal
    /// separator routes into its right subtree.
    fn child_index(&mut self, node: Node, key: &K) -> Result<usize> {
        let count = node.count(&mut self.index)?;
        for slot in 0..count {
            let sep: K = node.key(&mut self.index, &self.layout, slot)?;
            if (self.less)(key, &sep) {
                return Ok(slot);
            }
        }
        Ok(count)
    }

    /// Walks from the root to the leaf `key` belongs to, recording
    /// `(node, child slot)` per internal level for bottom-up repairs.
    fn descend(&mut self, key: &K) -> Result<(Node, Vec<(Node, usize)>)> {
        self.index.promote(self.root, ROOT_CHANCES)?;

        let mut node = Node(self.root);
        let mut path = Vec::new();
        loop {
            if path.len() > MAX_DEPTH {
                return Err(Error::Corruption("descent exceeds the maximum depth"));
            }
            match node.kind(&mut self.index)? {
                NodeKind::Leaf => return Ok((node, path)),
                NodeKind::Internal => {
                    let slot = self.child_index(node, key)?;
                    let child = node.child(&mut self.index, &self.layout, slot)?;
                    if child == NIL {
                        return Err(Error::Corruption("missing child pointer"));
                    }
                    if Node(child).parent(&mut self.index)? != node.0 {
                        return Err(Error::Corruption("parent pointer mismatch"));
                    }
                    path.push((node, slot));
                    node = Node(child);
                }
            }
        }
    }

    /// Looks `key` up and reads one of its values. With duplicates,
    /// any occurrence may answer.
    pub fn get(&mut self, key: &K) -> Result<V> {
        let (leaf, _) = self.descend(key)?;
        let count = leaf.count(&mut self.index)?;
        for slot in 0..count {
            let stored: K = leaf.key(&mut self.index, &self.layout, slot)?;
            if self.keys_equal(&stored, key) {
                let vref = leaf.value_ref(&mut self.index, &self.layout, slot)?;
                return self.data.read(vref.block, vref.offset as usize);
            }
            if (self.less)(key, &stored) {
                break;
            }
        }
        Err(Error::NotFound)
    }

    /// Inserts a pair. Equal keys are kept, ordered by insertion.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        let full = self.layout.max_keys();
        self.index.promote(self.root, ROOT_CHANCES)?;

        if Node(self.root).count(&mut self.index)? == full {
            self.grow_root()?;
        }

        let mut node = Node(self.root);
        let mut depth = 0;
        loop {
            depth += 1;
            if depth > MAX_DEPTH {
                return Err(Error::Corruption("descent exceeds the maximum depth"));
            }
            match node.kind(&mut self.index)? {
                NodeKind::Leaf => break,
                NodeKind::Internal => {
                    let slot = self.child_index(node, &key)?;
                    let child = Node(node.child(&mut self.index, &self.layout, slot)?);
                    if child.0 == NIL {
                        return Err(Error::Corruption("missing child pointer"));
                    }
                    if child.count(&mut self.index)? == full {
                        let (median, right) = self.split_child(node, slot, child)?;
                        // Re-decide which side of the promoted median
                        // the key falls on; ties keep going right.
                        node = if (self.less)(&key, &median) { child } else { right };
                    } else {
                        node = child;
                    }
                }
            }
        }

        // The slot just after any existing equals, so iteration yields
        // duplicates in insertion order.
        let count = node.count(&mut self.index)?;
        let mut slot = count;
        for candidate in 0..count {
            let stored: K = node.key(&mut self.index, &self.layout, candidate)?;
            if (self.less)(&key, &stored) {
                slot = candidate;
                break;
            }
        }

        let data_block = self.data.allot_block();
        self.data.write(data_block, 0, &value)?;

        node.shift_keys(&mut self.index, &self.layout, slot, count - slot, slot + 1)?;
        node.shift_refs(&mut self.index, &self.layout, slot, count - slot, slot + 1)?;
        node.set_key(&mut self.index, &self.layout, slot, &key)?;
        let vref = ValueRef { block: data_block, offset: 0 };
        node.set_value_ref(&mut self.index, &self.layout, slot, &vref)?;
        node.set_count(&mut self.index, count + 1)?;
        self.len += 1;
        trace!("btree: inserted into leaf {} slot {}", node.0, slot);
        Ok(())
    }

    /// Removes every occurrence of `key`, returning how many there
    /// were. A missing key is a silent no-op.
    pub fn delete(&mut self, key: &K) -> Result<u64> {
        let mut removed = 0u64;

        // Duplicates may straddle leaves; each pass strips the leaf
        // the descent lands on until a pass finds nothing.
        loop {
            let (leaf, path) = self.descend(key)?;
            let count = leaf.count(&mut self.index)?;

            let mut lo = 0;
            while lo < count {
                let stored: K = leaf.key(&mut self.index, &self.layout, lo)?;
                if !(self.less)(&stored, key) {
                    break;
                }
                lo += 1;
            }
            let mut hi = lo;
            while hi < count {
                let stored: K = leaf.key(&mut self.index, &self.layout, hi)?;
                if !self.keys_equal(&stored, key) {
                    break;
                }
                hi += 1;
            }
            if hi == lo {
                break;
            }

            for slot in lo..hi {
                let vref = leaf.value_ref(&mut self.index, &self.layout, slot)?;
                self.data.delete_block(vref.block);
            }
            leaf.shift_keys(&mut self.index, &self.layout, hi, count - hi, lo)?;
            leaf.shift_refs(&mut self.index, &self.layout, hi, count - hi, lo)?;
            leaf.set_count(&mut self.index, count - (hi - lo))?;
            removed += (hi - lo) as u64;
            self.len -= (hi - lo) as u64;

            self.rebalance(leaf, path)?;
            self.fix_separators(key)?;
        }

        if removed > 0 {
            trace!("btree: deleted {} occurrence(s)", removed);
        }
        Ok(removed)
    }

    /// Number of occurrences of `key`.
    pub fn count(&mut self, key: &K) -> Result<u64> {
        let (leaf, _) = self.descend(key)?;
        let count = leaf.count(&mut self.index)?;

        let mut first = None;
        for slot in 0..count {
            let stored: K = leaf.key(&mut self.index, &self.layout, slot)?;
            if self.keys_equal(&stored, key) {
                first = Some(slot);
                break;
            }
            if (self.less)(key, &stored) {
                break;
            }
        }
        let first = match first {
            Some(slot) => slot,
            None => return Ok(0),
        };

        let mut total = 0u64;
        let mut slot = first;
        while slot < count {
            let stored: K = leaf.key(&mut self.index, &self.layout, slot)?;
            if !self.keys_equal(&stored, key) {
                break;
            }
            total += 1;
            slot += 1;
        }

        // The run may continue into earlier leaves.
        let mut cursor = leaf.prev(&mut self.index)?;
        'chain: while cursor != NIL {
            let prev = Node(cursor);
            let prev_count = prev.count(&mut self.index)?;
            let mut slot = prev_count;
            while slot > 0 {
                let stored: K = prev.key(&mut self.index, &self.layout, slot - 1)?;
                if !self.keys_equal(&stored, key) {
                    break 'chain;
                }
                total += 1;
                slot -= 1;
            }
            cursor = prev.prev(&mut self.index)?;
        }
        Ok(total)
    }

    /// Ordered traversal over all pairs, both directions.
    pub fn iter(&mut self) -> Iter<'_, K, V, C> {
        let front = (self.leaf_head, 0);
        let back = (self.leaf_tail, None);
        let remaining = self.len;
        Iter { tree: self, front, back, remaining }
    }

    /// Flushes both files without closing; the durability point short
    /// of `close`.
    pub fn flush(&mut self) -> Result<()> {
        self.store_links();
        self.data.flush()?;
        self.index.flush()
    }

    /// Writes the header through, flushes, truncates, and unlocks both
    /// files.
    pub fn close(self) -> Result<()> {
        let BTree {
            mut index,
            data,
            root,
            leaf_head,
            leaf_tail,
            ..
        } = self;
        header::store_tree_links(&mut index, root, leaf_head, leaf_tail);
        data.close()?;
        index.close()
    }

    fn grow_root(&mut self) -> Result<()> {
        let old_root = Node(self.root);
        let new_root = Node(self.index.allot_block());
        new_root.init(&mut self.index, NodeKind::Internal, NIL)?;
        new_root.set_child(&mut self.index, &self.layout, 0, old_root.0)?;
        old_root.set_parent(&mut self.index, new_root.0)?;
        self.root = new_root.0;
        self.store_links();
        debug!("btree: grew root into block {}", new_root.0);
        self.split_child(new_root, 0, old_root).map(|_| ())
    }

    /// Splits the full `child` (at `slot` under `parent`), promoting
    /// its median. Returns the median and the new right sibling; on a
    /// leaf split the median key itself stays on the right.
    fn split_child(&mut self, parent: Node, slot: usize, child: Node) -> Result<(K, Node)> {
        self.index.pin(parent.0, 0)?;
        self.index.pin(child.0, 0)?;
        let outcome = self.split_child_pinned(parent, slot, child);
        self.index.unpin(child.0);
        self.index.unpin(parent.0);
        outcome
    }

    fn split_child_pinned(&mut self, parent: Node, slot: usize, child: Node) -> Result<(K, Node)> {
        let count = child.count(&mut self.index)?;
        let median = count / 2;
        let kind = child.kind(&mut self.index)?;

        let right = Node(self.index.allot_block());
        right.init(&mut self.index, kind, parent.0)?;
        self.index.pin(right.0, 0)?;

        let promoted: K;
        match kind {
            NodeKind::Leaf => {
                let moved = count - median;
                child.copy_keys_to(&mut self.index, &self.layout, right, median, moved, 0)?;
                child.copy_refs_to(&mut self.index, &self.layout, right, median, moved, 0)?;
                right.set_count(&mut self.index, moved)?;
                child.set_count(&mut self.index, median)?;
                promoted = right.key(&mut self.index, &self.layout, 0)?;

                let old_next = child.next(&mut self.index)?;
                right.set_prev(&mut self.index, child.0)?;
                right.set_next(&mut self.index, old_next)?;
                child.set_next(&mut self.index, right.0)?;
                if old_next != NIL {
                    Node(old_next).set_prev(&mut self.index, right.0)?;
                } else {
                    self.leaf_tail = right.0;
                }
            }
            NodeKind::Internal => {
                promoted = child.key(&mut self.index, &self.layout, median)?;
                let moved = count - median - 1;
                child.copy_keys_to(&mut self.index, &self.layout, right, median + 1, moved, 0)?;
                child.copy_children_to(&mut self.index, &self.layout, right, median + 1, moved + 1, 0)?;
                right.set_count(&mut self.index, moved)?;
                child.set_count(&mut self.index, median)?;
                self.adopt_children(right, 0, moved + 1)?;
            }
        }

        let parent_count = parent.count(&mut self.index)?;
        parent.shift_keys(&mut self.index, &self.layout, slot, parent_count - slot, slot + 1)?;
        parent.shift_children(&mut self.index, &self.layout, slot + 1, parent_count - slot, slot + 2)?;
        parent.set_key(&mut self.index, &self.layout, slot, &promoted)?;
        parent.set_child(&mut self.index, &self.layout, slot + 1, right.0)?;
        parent.set_count(&mut self.index, parent_count + 1)?;

        self.index.unpin(right.0);
        self.store_links();
        trace!("btree: split {} into {} at median slot {}", child.0, right.0, median);
        Ok((promoted, right))
    }

    fn adopt_children(&mut self, node: Node, from: usize, n: usize) -> Result<()> {
        for slot in from..from + n {
            let child = node.child(&mut self.index, &self.layout, slot)?;
            if child == NIL {
                return Err(Error::Corruption("missing child pointer"));
            }
            Node(child).set_parent(&mut self.index, node.0)?;
        }
        Ok(())
    }

    /// Heals underflow from `leaf` upwards along the recorded path.
    fn rebalance(&mut self, leaf: Node, mut path: Vec<(Node, usize)>) -> Result<()> {
        let min = self.layout.min_keys();

        let mut cur = leaf;
        while let Some((parent, slot)) = path.pop() {
            if cur.count(&mut self.index)? >= min {
                break;
            }
            self.index.pin(parent.0, 0)?;
            self.index.pin(cur.0, 0)?;
            let outcome = self.rebalance_once(parent, slot, cur);
            self.index.unpin(cur.0);
            self.index.unpin(parent.0);
            if outcome? {
                break;
            }
            cur = parent;
        }

        // An internal root left with no keys hands its only child the
        // crown.
        let root = Node(self.root);
        if root.kind(&mut self.index)? == NodeKind::Internal && root.count(&mut self.index)? == 0 {
            let child = root.child(&mut self.index, &self.layout, 0)?;
            if child == NIL {
                return Err(Error::Corruption("missing child pointer"));
            }
            Node(child).set_parent(&mut self.index, NIL)?;
            self.index.delete_block(root.0);
            self.root = child;
            self.store_links();
            debug!("btree: root collapsed into block {}", child);
        }
        Ok(())
    }

    /// Borrows until `cur` is whole or its siblings are poor, then
    /// merges. Returns whether the parent kept its key count.
    fn rebalance_once(&mut self, parent: Node, slot: usize, cur: Node) -> Result<bool> {
        let min = self.layout.min_keys();
        let parent_count = parent.count(&mut self.index)?;

        loop {
            if cur.count(&mut self.index)? >= min {
                return Ok(true);
            }
            if slot > 0 {
                let left = Node(parent.child(&mut self.index, &self.layout, slot - 1)?);
                if left.count(&mut self.index)? > min {
                    self.borrow_from_left(parent, slot, left, cur)?;
                    continue;
                }
            }
            if slot < parent_count {
                let right = Node(parent.child(&mut self.index, &self.layout, slot + 1)?);
                if right.count(&mut self.index)? > min {
                    self.borrow_from_right(parent, slot, cur, right)?;
                    continue;
                }
            }
            break;
        }

        let sep_slot = if slot > 0 { slot - 1 } else { slot };
        self.merge_children(parent, sep_slot)?;
        Ok(false)
    }

    /// Moves the left sibling's last key over and lifts it into the
    /// separator (leaves), or rotates through the parent (internals).
    fn borrow_from_left(&mut self, parent: Node, slot: usize, left: Node, cur: Node) -> Result<()> {
        self.index.pin(left.0, 0)?;
        let outcome: Result<()> = (|| {
            let left_count = left.count(&mut self.index)?;
            let cur_count = cur.count(&mut self.index)?;

            match cur.kind(&mut self.index)? {
                NodeKind::Leaf => {
                    let key: K = left.key(&mut self.index, &self.layout, left_count - 1)?;
                    let vref = left.value_ref(&mut self.index, &self.layout, left_count - 1)?;
                    cur.shift_keys(&mut self.index, &self.layout, 0, cur_count, 1)?;
                    cur.shift_refs(&mut self.index, &self.layout, 0, cur_count, 1)?;
                    cur.set_key(&mut self.index, &self.layout, 0, &key)?;
                    cur.set_value_ref(&mut self.index, &self.layout, 0, &vref)?;
                    cur.set_count(&mut self.index, cur_count + 1)?;
                    left.set_count(&mut self.index, left_count - 1)?;
                    parent.set_key(&mut self.index, &self.layout, slot - 1, &key)?;
                }
                NodeKind::Internal => {
                    let separator: K = parent.key(&mut self.index, &self.layout, slot - 1)?;
                    let moved_child = left.child(&mut self.index, &self.layout, left_count)?;
                    cur.shift_keys(&mut self.index, &self.layout, 0, cur_count, 1)?;
                    cur.shift_children(&mut self.index, &self.layout, 0, cur_count + 1, 1)?;
                    cur.set_key(&mut self.index, &self.layout, 0, &separator)?;
                    cur.set_child(&mut self.index, &self.layout, 0, moved_child)?;
                    Node(moved_child).set_parent(&mut self.index, cur.0)?;
                    cur.set_count(&mut self.index, cur_count + 1)?;

                    let lifted: K = left.key(&mut self.index, &self.layout, left_count - 1)?;
                    parent.set_key(&mut self.index, &self.layout, slot - 1, &lifted)?;
                    left.set_count(&mut self.index, left_count - 1)?;
                }
            }
            trace!("btree: {} borrowed from left sibling {}", cur.0, left.0);
            Ok(())
        })();
        self.index.unpin(left.0);
        outcome
    }

    /// Mirror image of `borrow_from_left`.
    fn borrow_from_right(&mut self, parent: Node, slot: usize, cur: Node, right: Node) -> Result<()> {
        self.index.pin(right.0, 0)?;
        let outcome: Result<()> = (|| {
            let right_count = right.count(&mut self.index)?;
            let cur_count = cur.count(&mut self.index)?;

            match cur.kind(&mut self.index)? {
                NodeKind::Leaf => {
                    let key: K = right.key(&mut self.index, &self.layout, 0)?;
                    let vref = right.value_ref(&mut self.index, &self.layout, 0)?;
                    cur.set_key(&mut self.index, &self.layout, cur_count, &key)?;
                    cur.set_value_ref(&mut self.index, &self.layout, cur_count, &vref)?;
                    cur.set_count(&mut self.index, cur_count + 1)?;

                    right.shift_keys(&mut self.index, &self.layout, 1, right_count - 1, 0)?;
                    right.shift_refs(&mut self.index, &self.layout, 1, right_count - 1, 0)?;
                    right.set_count(&mut self.index, right_count - 1)?;

                    let new_first: K = right.key(&mut self.index, &self.layout, 0)?;
                    parent.set_key(&mut self.index, &self.layout, slot, &new_first)?;
                }
                NodeKind::Internal => {
                    let separator: K = parent.key(&mut self.index, &self.layout, slot)?;
                    let moved_child = right.child(&mut self.index, &self.layout, 0)?;
                    cur.set_key(&mut self.index, &self.layout, cur_count, &separator)?;
                    cur.set_child(&mut self.index, &self.layout, cur_count + 1, moved_child)?;
                    Node(moved_child).set_parent(&mut self.index, cur.0)?;
                    cur.set_count(&mut self.index, cur_count + 1)?;

                    let lifted: K = right.key(&mut self.index, &self.layout, 0)?;
                    parent.set_key(&mut self.index, &self.layout, slot, &lifted)?;
                    right.shift_keys(&mut self.index, &self.layout, 1, right_count - 1, 0)?;
                    right.shift_children(&mut self.index, &self.layout, 1, right_count, 0)?;
                    right.set_count(&mut self.index, right_count - 1)?;
                }
            }
            trace!("btree: {} borrowed from right sibling {}", cur.0, right.0);
            Ok(())
        })();
        self.index.unpin(right.0);
        outcome
    }

    /// Fuses `child[sep_slot]` with `child[sep_slot + 1]`, dropping
    /// the separator on leaf merges and pulling it down on internal
    /// ones.
    fn merge_children(&mut self, parent: Node, sep_slot: usize) -> Result<()> {
        let left = Node(parent.child(&mut self.index, &self.layout, sep_slot)?);
        let right = Node(parent.child(&mut self.index, &self.layout, sep_slot + 1)?);
        self.index.pin(left.0, 0)?;
        self.index.pin(right.0, 0)?;
        let outcome = self.merge_children_pinned(parent, sep_slot, left, right);
        self.index.unpin(right.0);
        self.index.unpin(left.0);
        outcome?;
        self.index.delete_block(right.0);
        self.store_links();
        trace!("btree: merged {} into {}", right.0, left.0);
        Ok(())
    }

    fn merge_children_pinned(
        &mut self,
        parent: Node,
        sep_slot: usize,
        left: Node,
        right: Node,
    ) -> Result<()> {
        let left_count = left.count(&mut self.index)?;
        let right_count = right.count(&mut self.index)?;

        match left.kind(&mut self.index)? {
            NodeKind::Leaf => {
                right.copy_keys_to(&mut self.index, &self.layout, left, 0, right_count, left_count)?;
                right.copy_refs_to(&mut self.index, &self.layout, left, 0, right_count, left_count)?;
                left.set_count(&mut self.index, left_count + right_count)?;

                let right_next = right.next(&mut self.index)?;
                left.set_next(&mut self.index, right_next)?;
                if right_next != NIL {
                    Node(right_next).set_prev(&mut self.index, left.0)?;
                } else {
                    self.leaf_tail = left.0;
                }
            }
            NodeKind::Internal => {
                let separator: K = parent.key(&mut self.index, &self.layout, sep_slot)?;
                left.set_key(&mut self.index, &self.layout, left_count, &separator)?;
                right.copy_keys_to(&mut self.index, &self.layout, left, 0, right_count, left_count + 1)?;
                right.copy_children_to(
                    &mut self.index,
                    &self.layout,
                    left,
                    0,
                    right_count + 1,
                    left_count + 1,
                )?;
                left.set_count(&mut self.index, left_count + right_count + 1)?;
                self.adopt_children(left, left_count + 1, right_count + 1)?;
            }
        }

        let parent_count = parent.count(&mut self.index)?;
        parent.shift_keys(&mut self.index, &self.layout, sep_slot + 1, parent_count - sep_slot - 1, sep_slot)?;
        parent.shift_children(
            &mut self.index,
            &self.layout,
            sep_slot + 2,
            parent_count - sep_slot - 1,
            sep_slot + 1,
        )?;
        parent.set_count(&mut self.index, parent_count - 1)
    }

    /// Replaces internal copies of a deleted key with its successor,
    /// the smallest key of the copy's right subtree. Rebalancing can
    /// shift slots around, so the copies are re-found by descent
    /// rather than remembered.
    fn fix_separators(&mut self, key: &K) -> Result<()> {
        let mut node = Node(self.root);
        let mut depth = 0;
        loop {
            if node.kind(&mut self.index)? == NodeKind::Leaf {
                return Ok(());
            }
            depth += 1;
            if depth > MAX_DEPTH {
                return Err(Error::Corruption("descent exceeds the maximum depth"));
            }

            let slot = self.child_index(node, key)?;
            // Equal copies sit contiguously just left of the descent
            // boundary.
            let mut fix = slot;
            while fix > 0 {
                let separator: K = node.key(&mut self.index, &self.layout, fix - 1)?;
                if !self.keys_equal(&separator, key) {
                    break;
                }
                let right_subtree = node.child(&mut self.index, &self.layout, fix)?;
                match self.smallest_key_of(right_subtree)? {
                    Some(successor) => {
                        node.set_key(&mut self.index, &self.layout, fix - 1, &successor)?
                    }
                    None => break,
                }
                fix -= 1;
            }

            node = Node(node.child(&mut self.index, &self.layout, slot)?);
            if node.0 == NIL {
                return Err(Error::Corruption("missing child pointer"));
            }
        }
    }

    /// First key of the leftmost leaf under `block`; `None` only for
    /// an empty (root) leaf.
    fn smallest_key_of(&mut self, block: BlockNo) -> Result<Option<K>> {
        let mut node = Node(block);
        let mut depth = 0;
        loop {
            depth += 1;
            if depth > MAX_DEPTH {
                return Err(Error::Corruption("descent exceeds the maximum depth"));
            }
            match node.kind(&mut self.index)? {
                NodeKind::Internal => {
                    node = Node(node.child(&mut self.index, &self.layout, 0)?);
                }
                NodeKind::Leaf => {
                    if node.count(&mut self.index)? == 0 {
                        return Ok(None);
                    }
                    return self.key_at(node, 0).map(Some);
                }
            }
        }
    }

    fn key_at(&mut self, node: Node, slot: usize) -> Result<K> {
        node.key(&mut self.index, &self.layout, slot)
    }

    /// Walks the whole structure and fails with `Corruption` on any
    /// violated invariant: fanout bounds, separator ordering, chain
    /// symmetry, parent back-pointers, and the pair count.
    pub fn validate(&mut self) -> Result<()> {
        let root = Node(self.root);
        if root.parent(&mut self.index)? != NIL {
            return Err(Error::Corruption("root has a parent"));
        }

        let mut leaves = Vec::new();
        let total = self.validate_node(root, true, 0, &mut leaves)?;
        if total != self.len {
            return Err(Error::Corruption("key count drifted from len()"));
        }
        if let Some((_, first_depth)) = leaves.first() {
            if leaves.iter().any(|(_, depth)| depth != first_depth) {
                return Err(Error::Corruption("leaves at unequal depths"));
            }
        }

        // The chain must span exactly the leaves, in tree order, with
        // symmetric links.
        let mut chained = Vec::new();
        let mut prev = NIL;
        let mut cursor = self.leaf_head;
        while cursor != NIL {
            if chained.len() > leaves.len() {
                return Err(Error::Corruption("leaf chain does not terminate"));
            }
            if Node(cursor).prev(&mut self.index)? != prev {
                return Err(Error::Corruption("asymmetric leaf chain link"));
            }
            chained.push(cursor);
            prev = cursor;
            cursor = Node(cursor).next(&mut self.index)?;
        }
        if prev != self.leaf_tail {
            return Err(Error::Corruption("leaf tail disagrees with the chain"));
        }
        if chained != leaves.iter().map(|(block, _)| *block).collect::<Vec<_>>() {
            return Err(Error::Corruption("leaf chain disagrees with the tree"));
        }

        // Keys ascend across the whole chain.
        let mut keys = Vec::new();
        for (block, _) in &leaves {
            let leaf = Node(*block);
            let count = leaf.count(&mut self.index)?;
            for slot in 0..count {
                keys.push(self.key_at(leaf, slot)?);
            }
        }
        for (a, b) in keys.iter().tuple_windows() {
            if (self.less)(b, a) {
                return Err(Error::Corruption("keys out of order"));
            }
        }
        Ok(())
    }

    fn validate_node(
        &mut self,
        node: Node,
        is_root: bool,
        depth: usize,
        leaves: &mut Vec<(BlockNo, usize)>,
    ) -> Result<u64> {
        if depth > MAX_DEPTH {
            return Err(Error::Corruption("tree deeper than the maximum depth"));
        }
        if node.0 == NIL || node.0 > self.index.last_block() {
            return Err(Error::Corruption("node outside the allotted range"));
        }

        let count = node.count(&mut self.index)?;
        if count > self.layout.max_keys() {
            return Err(Error::Corruption("overfull node"));
        }
        if !is_root && count < self.layout.min_keys() {
            return Err(Error::Corruption("underfull node"));
        }

        match node.kind(&mut self.index)? {
            NodeKind::Leaf => {
                leaves.push((node.0, depth));
                Ok(count as u64)
            }
            NodeKind::Internal => {
                if count == 0 {
                    return Err(Error::Corruption("internal node without keys"));
                }
                let mut total = 0;
                for slot in 0..=count {
                    let child = node.child(&mut self.index, &self.layout, slot)?;
                    if child == NIL {
                        return Err(Error::Corruption("missing child pointer"));
                    }
                    if Node(child).parent(&mut self.index)? != node.0 {
                        return Err(Error::Corruption("parent pointer mismatch"));
                    }
                    // Ties go right: separators bound their left
                    // subtree from above and equal the minimum of
                    // their right subtree.
                    if slot < count {
                        let separator: K = self.key_at(node, slot)?;
                        let right_child = node.child(&mut self.index, &self.layout, slot + 1)?;
                        if let Some(right_min) = self.smallest_key_of(right_child)? {
                            if (self.less)(&right_min, &separator) {
                                return Err(Error::Corruption("separator above its right subtree"));
                            }
                        }
                    }
                    total += self.validate_node(Node(child), false, depth + 1, leaves)?;
                }
                Ok(total)
            }
        }
    }
}

fn data_file_name(path: &Path) -> Result<String> {
    let stem = path
        .file_name()
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "index path has no file name",
            ))
        })?
        .to_string_lossy()
        .into_owned();
    Ok(format!("{}_data", stem))
}

/// Double-ended ordered traversal along the leaf chain. Holding the
/// iterator borrows the tree, so the chain cannot shift underneath it.
pub struct Iter<'a, K, V, C> {
    tree: &'a mut BTree<K, V, C>,
    front: (BlockNo, usize),
    /// `None` until the first back step reads the tail's count.
    back: (BlockNo, Option<usize>),
    remaining: u64,
}

impl<K, V, C> Iter<'_, K, V, C>
where
    K: AsBytes + FromBytes + Copy,
    V: AsBytes + FromBytes + Copy,
    C: Fn(&K, &K) -> bool,
{
    fn read_pair(&mut self, block: BlockNo, slot: usize) -> Result<(K, V)> {
        let leaf = Node(block);
        let key: K = leaf.key(&mut self.tree.index, &self.tree.layout, slot)?;
        let vref = leaf.value_ref(&mut self.tree.index, &self.tree.layout, slot)?;
        let value: V = self.tree.data.read(vref.block, vref.offset as usize)?;
        Ok((key, value))
    }

    fn step_front(&mut self) -> Result<(K, V)> {
        loop {
            let leaf = Node(self.front.0);
            if self.front.1 < leaf.count(&mut self.tree.index)? {
                break;
            }
            let next = leaf.next(&mut self.tree.index)?;
            if next == NIL {
                return Err(Error::Corruption("leaf chain ended early"));
            }
            self.front = (next, 0);
        }
        let pair = self.read_pair(self.front.0, self.front.1)?;
        self.front.1 += 1;
        Ok(pair)
    }

    fn step_back(&mut self) -> Result<(K, V)> {
        loop {
            let slot = match self.back.1 {
                Some(slot) => slot,
                None => {
                    let count = Node(self.back.0).count(&mut self.tree.index)?;
                    self.back.1 = Some(count);
                    count
                }
            };
            if slot > 0 {
                break;
            }
            let prev = Node(self.back.0).prev(&mut self.tree.index)?;
            if prev == NIL {
                return Err(Error::Corruption("leaf chain ended early"));
            }
            self.back = (prev, None);
        }
        let slot = self.back.1.unwrap() - 1;
        self.back.1 = Some(slot);
        self.read_pair(self.back.0, slot)
    }
}

impl<K, V, C> Iterator for Iter<'_, K, V, C>
where
    K: AsBytes + FromBytes + Copy,
    V: AsBytes + FromBytes + Copy,
    C: Fn(&K, &K) -> bool,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match self.step_front() {
            Ok(pair) => {
                self.remaining -= 1;
                Some(Ok(pair))
            }
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining as usize, Some(self.remaining as usize))
    }
}

impl<K, V, C> DoubleEndedIterator for Iter<'_, K, V, C>
where
    K: AsBytes + FromBytes + Copy,
    V: AsBytes + FromBytes + Copy,
    C: Fn(&K, &K) -> bool,
{
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match self.step_back() {
            Ok(pair) => {
                self.remaining -= 1;
                Some(Ok(pair))
            }
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::PoolConfig;

    // Order 4 (three keys per node): the smallest geometry, so splits
    // and merges fire early.
    fn small_config() -> PoolConfig {
        PoolConfig {
            block_size: 160,
            pool_bytes: 160 * 8,
            replacement: Replacement::SecondChance,
        }
    }

    fn open_small(dir: &tempfile::TempDir) -> BTree<u64, u64> {
        BTree::open(&dir.path().join("tree"), small_config()).unwrap()
    }

    fn keys_of(tree: &mut BTree<u64, u64>) -> Vec<u64> {
        tree.iter().map(|pair| pair.unwrap().0).collect()
    }

    fn root_kind(tree: &mut BTree<u64, u64>) -> NodeKind {
        Node(tree.root).kind(&mut tree.index).unwrap()
    }

    fn root_keys(tree: &mut BTree<u64, u64>) -> Vec<u64> {
        let root = Node(tree.root);
        let count = root.count(&mut tree.index).unwrap();
        (0..count)
            .map(|slot| root.key::<u64>(&mut tree.index, &tree.layout, slot).unwrap())
            .collect()
    }

    #[test]
    fn splits_trigger_exactly_at_a_full_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_small(&dir);
        assert_eq!(tree.order(), 4);

        for key in 1..=3u64 {
            tree.insert(key, key * 10).unwrap();
            assert_eq!(root_kind(&mut tree), NodeKind::Leaf);
        }
        tree.insert(4, 40).unwrap();
        assert_eq!(root_kind(&mut tree), NodeKind::Internal);
        tree.validate().unwrap();
    }

    #[test]
    fn leaf_split_keeps_the_median_on_the_right() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_small(&dir);

        for key in 1..=4u64 {
            tree.insert(key, key * 10).unwrap();
        }

        // [1 2 3] split at median slot 1: the median key 2 moves to
        // the right sibling and is promoted as the separator.
        assert_eq!(root_keys(&mut tree), vec![2]);
        let head = Node(tree.leaf_head);
        assert_eq!(head.count(&mut tree.index).unwrap(), 1);
        let tail = Node(tree.leaf_tail);
        assert_eq!(tail.key::<u64>(&mut tree.index, &tree.layout, 0).unwrap(), 2);
        assert_eq!(tail.count(&mut tree.index).unwrap(), 3);
        tree.validate().unwrap();
    }

    #[test]
    fn search_finds_what_was_inserted() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_small(&dir);

        for key in 1..=5u64 {
            tree.insert(key, key * 10).unwrap();
        }
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.get(&3).unwrap(), 30);
        assert!(matches!(tree.get(&6), Err(Error::NotFound)));
        assert_eq!(keys_of(&mut tree), vec![1, 2, 3, 4, 5]);
        tree.validate().unwrap();
    }

    #[test]
    fn duplicates_enumerate_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_small(&dir);

        for (nth, value) in (0..6u64).enumerate() {
            tree.insert(7, 70 + value).unwrap();
            assert_eq!(tree.count(&7).unwrap(), nth as u64 + 1);
        }
        // Six equal keys straddle several leaves at order 4, yet come
        // back in insertion order.
        let values: Vec<u64> = tree.iter().map(|pair| pair.unwrap().1).collect();
        assert_eq!(values, vec![70, 71, 72, 73, 74, 75]);
        tree.validate().unwrap();

        assert_eq!(tree.delete(&7).unwrap(), 6);
        assert_eq!(tree.count(&7).unwrap(), 0);
        assert!(tree.is_empty());
        tree.validate().unwrap();
    }

    #[test]
    fn underflow_borrows_from_a_rich_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_small(&dir);

        for key in 1..=4u64 {
            tree.insert(key, key * 10).unwrap();
        }
        // Leaves are [1] and [2 3 4]; stripping the head leaf forces a
        // borrow from the right, lifting its new first key into the
        // separator.
        assert_eq!(tree.delete(&1).unwrap(), 1);
        assert_eq!(tree.len(), 3);
        assert_eq!(root_keys(&mut tree), vec![3]);
        assert_eq!(keys_of(&mut tree), vec![2, 3, 4]);
        tree.validate().unwrap();
    }

    #[test]
    fn separator_copy_is_replaced_by_the_successor() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_small(&dir);

        for key in 1..=4u64 {
            tree.insert(key, key * 10).unwrap();
        }
        assert_eq!(root_keys(&mut tree), vec![2]);

        // Deleting 2 removes the separator's leaf twin; the copy in
        // the root is rewritten to the successor, 3.
        assert_eq!(tree.delete(&2).unwrap(), 1);
        assert_eq!(root_keys(&mut tree), vec![3]);
        assert_eq!(keys_of(&mut tree), vec![1, 3, 4]);
        tree.validate().unwrap();
    }

    #[test]
    fn merge_collapses_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_small(&dir);

        for key in 1..=4u64 {
            tree.insert(key, key * 10).unwrap();
        }
        let old_root = tree.root;

        for key in [4u64, 3, 2].iter() {
            tree.delete(key).unwrap();
            tree.validate().unwrap();
        }

        // The last delete merged the leaves and handed the crown to
        // the surviving one.
        assert_eq!(root_kind(&mut tree), NodeKind::Leaf);
        assert_ne!(tree.root, old_root);
        assert_eq!(tree.leaf_head, tree.root);
        assert_eq!(tree.leaf_tail, tree.root);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(&1).unwrap(), 10);

        // Emptying the tree leaves a bare root leaf behind.
        tree.delete(&1).unwrap();
        assert!(tree.is_empty());
        assert!(matches!(tree.get(&1), Err(Error::NotFound)));
        tree.validate().unwrap();
    }

    #[test]
    fn delete_of_a_missing_key_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_small(&dir);

        for key in 1..=8u64 {
            tree.insert(key, key).unwrap();
        }
        assert_eq!(tree.delete(&99).unwrap(), 0);
        assert_eq!(tree.delete(&99).unwrap(), 0);
        assert_eq!(tree.len(), 8);
        tree.validate().unwrap();
    }

    #[test]
    fn insert_then_delete_restores_the_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_small(&dir);

        for key in (1..=20u64).step_by(2) {
            tree.insert(key, key).unwrap();
        }
        let before = keys_of(&mut tree);

        tree.insert(10, 10).unwrap();
        assert_eq!(tree.delete(&10).unwrap(), 1);
        assert_eq!(keys_of(&mut tree), before);
        tree.validate().unwrap();
    }

    #[test]
    fn reverse_iteration_mirrors_forward() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_small(&dir);

        for key in 1..=32u64 {
            tree.insert(key, key).unwrap();
        }
        let forward: Vec<u64> = tree.iter().map(|pair| pair.unwrap().0).collect();
        let mut backward: Vec<u64> = tree.iter().rev().map(|pair| pair.unwrap().0).collect();
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn injected_comparator_reverses_the_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree: BTree<u64, u64, _> = BTree::open_with(
            &dir.path().join("tree"),
            small_config(),
            |a: &u64, b: &u64| b < a,
        )
        .unwrap();

        for key in 1..=10u64 {
            tree.insert(key, key).unwrap();
        }
        let keys: Vec<u64> = tree.iter().map(|pair| pair.unwrap().0).collect();
        assert_eq!(keys, (1..=10u64).rev().collect::<Vec<_>>());
        assert_eq!(tree.get(&4).unwrap(), 4);
        tree.validate().unwrap();
    }

    #[test]
    fn bulk_random_round_trip() {
        use rand::seq::SliceRandom;

        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_small(&dir);

        let mut keys: Vec<u64> = (0..200).collect();
        keys.shuffle(&mut rand::thread_rng());
        for key in &keys {
            tree.insert(*key, key * 7).unwrap();
        }
        tree.validate().unwrap();
        assert_eq!(tree.len(), 200);
        assert_eq!(keys_of(&mut tree), (0..200).collect::<Vec<_>>());

        for key in keys.iter().filter(|key| *key % 2 == 0) {
            assert_eq!(tree.delete(key).unwrap(), 1);
        }
        tree.validate().unwrap();
        assert_eq!(tree.len(), 100);
        for key in 0..200u64 {
            if key % 2 == 0 {
                assert!(matches!(tree.get(&key), Err(Error::NotFound)));
            } else {
                assert_eq!(tree.get(&key).unwrap(), key * 7);
            }
        }
    }
}
