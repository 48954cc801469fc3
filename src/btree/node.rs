//! On-block layout of B+Tree nodes.
//!
//! Every node occupies one block of the index file:
//!
//! | field                         | offset | size          |
//! |-------------------------------|--------|---------------|
//! | node tag (0 internal, 1 leaf) | 0      | 1             |
//! | prev leaf block               | 1      | 8             |
//! | next leaf block               | 9      | 8             |
//! | parent block                  | 17     | 8             |
//! | key count                     | 25     | 8             |
//! | keys                          | 33     | M * key size  |
//! | pointers                      | after  | (M + 1) * ptr |
//!
//! Internal pointers are child block numbers; leaf pointers are
//! `(block, offset)` pairs into the data file. `prev`/`next` are only
//! meaningful on leaves and stay zero elsewhere. `M` is fixed at open
//! as the largest key count whose leaf body (the wider of the two)
//! fits the block.
//!
//! This module is the only place that touches a node's raw bytes; the
//! engine works through the typed accessors and slot movers below.

use std::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::bio::BufferedFile;
use crate::disk::BlockNo;
use crate::error::{Error, Result};

/// "No block here": block 0 holds the header and can never be a node,
/// so it doubles as the null link of the leaf chain and parent fields.
pub const NIL: BlockNo = 0;

pub const OFF_TAG: usize = 0;
pub const OFF_PREV: usize = 1;
pub const OFF_NEXT: usize = 9;
pub const OFF_PARENT: usize = 17;
pub const OFF_COUNT: usize = 25;
pub const OFF_KEYS: usize = 33;

const_assert!(OFF_COUNT == OFF_PARENT + 8);
const_assert!(OFF_KEYS == OFF_COUNT + 8);

/// Where a leaf's value lives: a block of the data file and a byte
/// offset inside it.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct ValueRef {
    pub block: u64,
    pub offset: u64,
}

pub const VALUE_REF_SIZE: usize = mem::size_of::<ValueRef>();
pub const CHILD_SIZE: usize = mem::size_of::<u64>();

const_assert!(VALUE_REF_SIZE == 16);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Internal,
    Leaf,
}

impl NodeKind {
    fn from_tag(tag: u8) -> Result<NodeKind> {
        match tag {
            0 => Ok(NodeKind::Internal),
            1 => Ok(NodeKind::Leaf),
            _ => Err(Error::Corruption("unknown node tag")),
        }
    }

    fn tag(self) -> u8 {
        match self {
            NodeKind::Internal => 0,
            NodeKind::Leaf => 1,
        }
    }
}

/// Node geometry shared by the whole tree: the order `M` and the key
/// width it was derived from.
#[derive(Clone, Copy, Debug)]
pub struct NodeLayout {
    pub order: usize,
    pub key_size: usize,
}

impl NodeLayout {
    /// Largest `M` such that `OFF_KEYS + M * key_size +
    /// (M + 1) * VALUE_REF_SIZE` fits the block, rounded down to even.
    /// An odd order would let an internal split leave its right half
    /// one key short of the minimum.
    pub fn new(block_size: usize, key_size: usize) -> NodeLayout {
        let body = block_size.saturating_sub(OFF_KEYS + VALUE_REF_SIZE);
        NodeLayout {
            order: (body / (key_size + VALUE_REF_SIZE)) & !1,
            key_size,
        }
    }

    /// A full node: splits trigger at this count on entry.
    pub fn max_keys(&self) -> usize {
        self.order - 1
    }

    /// Fewest keys a non-root node may keep.
    pub fn min_keys(&self) -> usize {
        (self.order + 1) / 2 - 1
    }

    fn key_off(&self, slot: usize) -> usize {
        OFF_KEYS + slot * self.key_size
    }

    fn ptr_base(&self) -> usize {
        OFF_KEYS + self.order * self.key_size
    }

    fn child_off(&self, slot: usize) -> usize {
        self.ptr_base() + slot * CHILD_SIZE
    }

    fn ref_off(&self, slot: usize) -> usize {
        self.ptr_base() + slot * VALUE_REF_SIZE
    }
}

/// A node is just its block number; every access resolves through the
/// buffered file, so holding a `Node` pins nothing by itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Node(pub BlockNo);

impl Node {
    /// Formats a freshly allotted block as an empty node.
    pub fn init(self, file: &mut BufferedFile, kind: NodeKind, parent: BlockNo) -> Result<()> {
        file.memset(self.0, 0, 0, file.block_size())?;
        file.write::<u8>(self.0, OFF_TAG, &kind.tag())?;
        file.write::<u64>(self.0, OFF_PARENT, &parent)
    }

    pub fn kind(self, file: &mut BufferedFile) -> Result<NodeKind> {
        NodeKind::from_tag(file.read::<u8>(self.0, OFF_TAG)?)
    }

    pub fn count(self, file: &mut BufferedFile) -> Result<usize> {
        Ok(file.read::<u64>(self.0, OFF_COUNT)? as usize)
    }

    pub fn set_count(self, file: &mut BufferedFile, count: usize) -> Result<()> {
        file.write::<u64>(self.0, OFF_COUNT, &(count as u64))
    }

    pub fn prev(self, file: &mut BufferedFile) -> Result<BlockNo> {
        file.read::<u64>(self.0, OFF_PREV)
    }

    pub fn set_prev(self, file: &mut BufferedFile, prev: BlockNo) -> Result<()> {
        file.write::<u64>(self.0, OFF_PREV, &prev)
    }

    pub fn next(self, file: &mut BufferedFile) -> Result<BlockNo> {
        file.read::<u64>(self.0, OFF_NEXT)
    }

    pub fn set_next(self, file: &mut BufferedFile, next: BlockNo) -> Result<()> {
        file.write::<u64>(self.0, OFF_NEXT, &next)
    }

    pub fn parent(self, file: &mut BufferedFile) -> Result<BlockNo> {
        file.read::<u64>(self.0, OFF_PARENT)
    }

    pub fn set_parent(self, file: &mut BufferedFile, parent: BlockNo) -> Result<()> {
        file.write::<u64>(self.0, OFF_PARENT, &parent)
    }

    pub fn key<K: FromBytes>(
        self,
        file: &mut BufferedFile,
        layout: &NodeLayout,
        slot: usize,
    ) -> Result<K> {
        debug_assert_eq!(mem::size_of::<K>(), layout.key_size);
        file.read(self.0, layout.key_off(slot))
    }

    pub fn set_key<K: AsBytes>(
        self,
        file: &mut BufferedFile,
        layout: &NodeLayout,
        slot: usize,
        key: &K,
    ) -> Result<()> {
        debug_assert_eq!(mem::size_of::<K>(), layout.key_size);
        file.write(self.0, layout.key_off(slot), key)
    }

    pub fn child(
        self,
        file: &mut BufferedFile,
        layout: &NodeLayout,
        slot: usize,
    ) -> Result<BlockNo> {
        file.read(self.0, layout.child_off(slot))
    }

    pub fn set_child(
        self,
        file: &mut BufferedFile,
        layout: &NodeLayout,
        slot: usize,
        child: BlockNo,
    ) -> Result<()> {
        file.write(self.0, layout.child_off(slot), &child)
    }

    pub fn value_ref(
        self,
        file: &mut BufferedFile,
        layout: &NodeLayout,
        slot: usize,
    ) -> Result<ValueRef> {
        file.read(self.0, layout.ref_off(slot))
    }

    pub fn set_value_ref(
        self,
        file: &mut BufferedFile,
        layout: &NodeLayout,
        slot: usize,
        value_ref: &ValueRef,
    ) -> Result<()> {
        file.write(self.0, layout.ref_off(slot), value_ref)
    }

    /// Moves `n` key slots from `src` to `dst` within this node
    /// (overlap-safe).
    pub fn shift_keys(
        self,
        file: &mut BufferedFile,
        layout: &NodeLayout,
        src: usize,
        n: usize,
        dst: usize,
    ) -> Result<()> {
        file.memmove(self.0, layout.key_off(dst), layout.key_off(src), n * layout.key_size)
    }

    pub fn shift_children(
        self,
        file: &mut BufferedFile,
        layout: &NodeLayout,
        src: usize,
        n: usize,
        dst: usize,
    ) -> Result<()> {
        file.memmove(self.0, layout.child_off(dst), layout.child_off(src), n * CHILD_SIZE)
    }

    pub fn shift_refs(
        self,
        file: &mut BufferedFile,
        layout: &NodeLayout,
        src: usize,
        n: usize,
        dst: usize,
    ) -> Result<()> {
        file.memmove(self.0, layout.ref_off(dst), layout.ref_off(src), n * VALUE_REF_SIZE)
    }

    /// Copies `n` key slots into another node, via a bounce buffer
    /// since only one frame is addressable at a time.
    pub fn copy_keys_to(
        self,
        file: &mut BufferedFile,
        layout: &NodeLayout,
        dst_node: Node,
        src: usize,
        n: usize,
        dst: usize,
    ) -> Result<()> {
        let mut buf = vec![0u8; n * layout.key_size];
        file.read_bytes(self.0, layout.key_off(src), &mut buf)?;
        file.write_bytes(dst_node.0, layout.key_off(dst), &buf)
    }

    pub fn copy_children_to(
        self,
        file: &mut BufferedFile,
        layout: &NodeLayout,
        dst_node: Node,
        src: usize,
        n: usize,
        dst: usize,
    ) -> Result<()> {
        let mut buf = vec![0u8; n * CHILD_SIZE];
        file.read_bytes(self.0, layout.child_off(src), &mut buf)?;
        file.write_bytes(dst_node.0, layout.child_off(dst), &buf)
    }

    pub fn copy_refs_to(
        self,
        file: &mut BufferedFile,
        layout: &NodeLayout,
        dst_node: Node,
        src: usize,
        n: usize,
        dst: usize,
    ) -> Result<()> {
        let mut buf = vec![0u8; n * VALUE_REF_SIZE];
        file.read_bytes(self.0, layout.ref_off(src), &mut buf)?;
        file.write_bytes(dst_node.0, layout.ref_off(dst), &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::PoolConfig;

    #[test]
    fn order_follows_the_leaf_body() {
        // 33 + 4*8 + 5*16 = 145 <= 160, with no room for a fifth key.
        assert_eq!(NodeLayout::new(160, 8).order, 4);
        // A raw fit of 5 rounds down to stay even.
        assert_eq!(NodeLayout::new(176, 8).order, 4);
        assert_eq!(NodeLayout::new(4096, 8).order, 168);
        // Hopeless block sizes come out as zero for the caller to
        // reject.
        assert_eq!(NodeLayout::new(48, 8).order, 0);
    }

    #[test]
    fn min_keys_is_half_order_less_one() {
        let layout = |order| NodeLayout { order, key_size: 8 };
        assert_eq!(layout(4).min_keys(), 1);
        assert_eq!(layout(6).min_keys(), 2);
        assert_eq!(layout(8).min_keys(), 3);
    }

    #[test]
    fn fields_round_trip_on_a_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = BufferedFile::open(
            &dir.path().join("index"),
            PoolConfig::with_block_size(176),
        )
        .unwrap();
        let layout = NodeLayout::new(176, 8);

        let node = Node(file.allot_block());
        node.init(&mut file, NodeKind::Leaf, 7).unwrap();

        assert_eq!(node.kind(&mut file).unwrap(), NodeKind::Leaf);
        assert_eq!(node.parent(&mut file).unwrap(), 7);
        assert_eq!(node.count(&mut file).unwrap(), 0);
        assert_eq!(node.prev(&mut file).unwrap(), NIL);

        node.set_key::<u64>(&mut file, &layout, 2, &42).unwrap();
        assert_eq!(node.key::<u64>(&mut file, &layout, 2).unwrap(), 42);

        let vref = ValueRef { block: 9, offset: 0 };
        node.set_value_ref(&mut file, &layout, 2, &vref).unwrap();
        assert_eq!(node.value_ref(&mut file, &layout, 2).unwrap(), vref);
    }

    #[test]
    fn shifts_move_whole_slots() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = BufferedFile::open(
            &dir.path().join("index"),
            PoolConfig::with_block_size(176),
        )
        .unwrap();
        let layout = NodeLayout::new(176, 8);

        let node = Node(file.allot_block());
        node.init(&mut file, NodeKind::Leaf, NIL).unwrap();
        for slot in 0..3u64 {
            node.set_key::<u64>(&mut file, &layout, slot as usize, &(slot + 1)).unwrap();
        }

        // Open a hole at slot 1.
        node.shift_keys(&mut file, &layout, 1, 2, 2).unwrap();
        node.set_key::<u64>(&mut file, &layout, 1, &9).unwrap();

        let keys: Vec<u64> = (0..4)
            .map(|slot| node.key::<u64>(&mut file, &layout, slot).unwrap())
            .collect();
        assert_eq!(keys, vec![1, 9, 2, 3]);
    }
}
