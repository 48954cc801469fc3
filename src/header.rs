//! Block-0 header layouts.
//!
//! Every file of the library opens with the same header family: the
//! allotment counter, a four-byte signature, an eight-byte structure
//! id, and structure-specific fields at fixed offsets. The layout is
//! unpadded, so fields are addressed by explicit offset constants
//! rather than a `repr(C)` struct (which would align `root` up to 32).
//!
//! Disk integers are little-endian; see the crate docs.

use std::convert::TryInto;
use std::str;

use arrayvec::ArrayString;
use static_assertions::const_assert;

use crate::bio::BufferedFile;
use crate::disk::BlockNo;
use crate::error::{Error, Result};
use crate::param::DATA_NAME_LEN;

pub const SIGNATURE: [u8; 4] = *b"RMAD";
pub const BTREE_ID: [u8; 8] = *b"BTREE\0\0\0";
pub const VECTOR_ID: [u8; 8] = *b"VECTOR\0\0";

pub const OFF_LAST_BLOCK: usize = 0;
pub const OFF_SIGNATURE: usize = 8;
pub const OFF_STRUCTURE_ID: usize = 12;
pub const OFF_KEY_SIZE: usize = 20;
pub const OFF_VALUE_SIZE: usize = 24;
pub const OFF_ROOT: usize = 28;
pub const OFF_LEAF_HEAD: usize = 36;
pub const OFF_LEAF_TAIL: usize = 44;
pub const OFF_DATA_NAME: usize = 52;

/// The sequence container stores its element size in the key-size slot
/// and its length where the tree keeps its root.
pub const OFF_ELEM_SIZE: usize = OFF_KEY_SIZE;
pub const OFF_LEN: usize = OFF_ROOT;

pub const HEADER_SIZE: usize = OFF_DATA_NAME + DATA_NAME_LEN;

/// The sequence container's header stops after its length field.
pub const VECTOR_HEADER_SIZE: usize = OFF_LEN + 8;

const_assert!(OFF_STRUCTURE_ID == OFF_SIGNATURE + 4);
const_assert!(OFF_ROOT == OFF_VALUE_SIZE + 4);
const_assert!(HEADER_SIZE == 84);

/// The B+Tree's view of its index-file header, cached in memory and
/// written through on every structural change.
#[derive(Clone, Debug)]
pub struct TreeHeader {
    pub root: BlockNo,
    pub leaf_head: BlockNo,
    pub leaf_tail: BlockNo,
    pub data_name: ArrayString<DATA_NAME_LEN>,
}

/// A file whose signature bytes are still zero has never been
/// initialised.
pub fn is_blank(file: &BufferedFile) -> bool {
    file.header_bytes(OFF_SIGNATURE, 4).iter().all(|b| *b == 0)
}

fn check_signature(file: &BufferedFile, structure_id: &[u8; 8]) -> Result<()> {
    if file.header_bytes(OFF_SIGNATURE, 4) != &SIGNATURE[..] {
        return Err(Error::SignatureMismatch("bad signature"));
    }
    if file.header_bytes(OFF_STRUCTURE_ID, 8) != &structure_id[..] {
        return Err(Error::SignatureMismatch("wrong structure id"));
    }
    Ok(())
}

fn read_name(file: &BufferedFile) -> Result<ArrayString<DATA_NAME_LEN>> {
    let bytes = file.header_bytes(OFF_DATA_NAME, DATA_NAME_LEN);
    let len = bytes.iter().position(|b| *b == 0).unwrap_or(DATA_NAME_LEN);
    let name = str::from_utf8(&bytes[..len])
        .map_err(|_| Error::Corruption("data file name is not utf-8"))?;
    Ok(ArrayString::from(name).unwrap())
}

/// Stamps a fresh index-file header for a B+Tree.
pub fn init_tree(
    file: &mut BufferedFile,
    key_size: u32,
    value_size: u32,
    data_name: &str,
) -> Result<()> {
    debug_assert!(file.block_size() >= HEADER_SIZE);
    if data_name.len() >= DATA_NAME_LEN {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "data file name does not fit the header",
        )));
    }

    file.write_header_bytes(OFF_SIGNATURE, &SIGNATURE);
    file.write_header_bytes(OFF_STRUCTURE_ID, &BTREE_ID);
    file.write_header_bytes(OFF_KEY_SIZE, &key_size.to_le_bytes());
    file.write_header_bytes(OFF_VALUE_SIZE, &value_size.to_le_bytes());
    let mut name = [0u8; DATA_NAME_LEN];
    name[..data_name.len()].copy_from_slice(data_name.as_bytes());
    file.write_header_bytes(OFF_DATA_NAME, &name);
    store_tree_links(file, 0, 0, 0);
    Ok(())
}

/// Parses and verifies an existing B+Tree header.
pub fn load_tree(file: &BufferedFile, key_size: u32, value_size: u32) -> Result<TreeHeader> {
    check_signature(file, &BTREE_ID)?;

    let stored_key = u32::from_le_bytes(file.header_bytes(OFF_KEY_SIZE, 4).try_into().unwrap());
    let stored_value = u32::from_le_bytes(file.header_bytes(OFF_VALUE_SIZE, 4).try_into().unwrap());
    if stored_key != key_size || stored_value != value_size {
        return Err(Error::SignatureMismatch("key or value size changed"));
    }

    Ok(TreeHeader {
        root: read_u64(file, OFF_ROOT),
        leaf_head: read_u64(file, OFF_LEAF_HEAD),
        leaf_tail: read_u64(file, OFF_LEAF_TAIL),
        data_name: read_name(file)?,
    })
}

pub fn store_tree_links(file: &mut BufferedFile, root: BlockNo, head: BlockNo, tail: BlockNo) {
    file.write_header_bytes(OFF_ROOT, &root.to_le_bytes());
    file.write_header_bytes(OFF_LEAF_HEAD, &head.to_le_bytes());
    file.write_header_bytes(OFF_LEAF_TAIL, &tail.to_le_bytes());
}

/// Stamps a fresh header for a sequence container.
pub fn init_vector(file: &mut BufferedFile, elem_size: u32) {
    file.write_header_bytes(OFF_SIGNATURE, &SIGNATURE);
    file.write_header_bytes(OFF_STRUCTURE_ID, &VECTOR_ID);
    file.write_header_bytes(OFF_ELEM_SIZE, &elem_size.to_le_bytes());
    store_vector_len(file, 0);
}

/// Parses and verifies an existing sequence-container header, returning
/// the stored length.
pub fn load_vector(file: &BufferedFile, elem_size: u32) -> Result<u64> {
    check_signature(file, &VECTOR_ID)?;

    let stored = u32::from_le_bytes(file.header_bytes(OFF_ELEM_SIZE, 4).try_into().unwrap());
    if stored != elem_size {
        return Err(Error::SignatureMismatch("element size changed"));
    }
    Ok(read_u64(file, OFF_LEN))
}

pub fn store_vector_len(file: &mut BufferedFile, len: u64) {
    file.write_header_bytes(OFF_LEN, &len.to_le_bytes());
}

fn read_u64(file: &BufferedFile, offset: usize) -> u64 {
    u64::from_le_bytes(file.header_bytes(offset, 8).try_into().unwrap())
}
