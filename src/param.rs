/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default buffer-pool reservation in bytes.
pub const DEFAULT_POOL_BYTES: usize = 1 << 20;

/// Fewest frames a pool is ever built with, whatever the reservation.
pub const MIN_POOL_FRAMES: usize = 4;

/// Blocks of buffer pool given to a B+Tree's value file.
pub const DATA_POOL_BLOCKS: usize = 32;

/// Second chances granted to the frame holding the tree root.
pub const ROOT_CHANCES: u8 = 3;

/// Bytes reserved in the header for the data file's name (NUL-padded).
pub const DATA_NAME_LEN: usize = 32;

/// Deepest tree any descent will follow before giving up.
pub const MAX_DEPTH: usize = 64;
