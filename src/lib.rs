//! rmad: disk-backed ordered containers over a pinning-aware buffer
//! pool.
//!
//! The library is built in layers, leaves first:
//!   + Disk: positioned block I/O on a locked regular file.
//!   + Pool: buffer frames, recency ring, pin counts, two replacement
//!     policies.
//!   + Bio: the buffered file composing the two, with a resident
//!     block-0 header and typed frame access.
//!   + Containers: a B+Tree with a doubly-linked leaf chain and
//!     duplicate keys, and a packed random-access sequence.
//!
//! Everything is single-threaded; a cross-process exclusive advisory
//! lock guards each file. Durability is reached at `close()` (or an
//! explicit `flush()`): there is no journal, so a crash may leave
//! partially written blocks behind.
//!
//! On-disk integers are little-endian. Big-endian hosts are not
//! supported, and the build says so rather than corrupting files.

#![deny(anonymous_parameters)]
#![deny(keyword_idents)]
#![deny(macro_use_extern_crate)]
#![deny(non_ascii_idents)]
#![deny(rust_2018_idioms)]
#![deny(trivial_numeric_casts)]
#![deny(unused_extern_crates)]
#![deny(unused_import_braces)]

#[cfg(target_endian = "big")]
compile_error!("the on-disk format is little-endian only");

mod bio;
mod btree;
mod disk;
mod error;
mod header;
mod param;
mod pool;
mod vector;

pub use bio::{BufferedFile, PoolConfig};
pub use btree::{BTree, Iter, LessFn};
pub use disk::{BlockFile, BlockNo};
pub use error::{Error, Result};
pub use pool::Replacement;
pub use vector::{DiskVec, VecIter};
