//! Buffered block file.
//!
//! `BufferedFile` composes the raw block file with the frame pool into
//! a read-through, write-back cache:
//!
//! * a block→frame map gives O(1) hits and is kept in lockstep with
//!   the pool's recency ring: every insertion into one is paired with
//!   an update to the other;
//! * misses obtain a victim from the pool, write its old contents back
//!   if dirty, and issue a positioned read;
//! * the block-0 header lives in a dedicated frame outside the ring
//!   and can never be evicted;
//! * all mutation goes through typed operations that set the owning
//!   frame's dirty flag, and dirty bytes reach the disk on eviction,
//!   on explicit flush, or at close.
//!
//! Closing writes `last_block_allocated` into the header, flushes,
//! truncates the file to exactly the allotted blocks, and fsyncs.

use std::collections::HashMap;
use std::convert::TryInto;
use std::mem;
use std::path::Path;

use log::{debug, trace, warn};
use zerocopy::{AsBytes, FromBytes};

use crate::disk::{BlockFile, BlockNo};
use crate::error::{Error, Result};
use crate::param::{DEFAULT_BLOCK_SIZE, DEFAULT_POOL_BYTES, MIN_POOL_FRAMES};
use crate::pool::{FrameFlags, FramePool, Replacement};

/// Sizing and policy of a buffered file's cache.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Size of every block in the file. Must not change across opens.
    pub block_size: usize,
    /// Memory reserved for the pool; the pool holds
    /// `pool_bytes / block_size` frames (at least a small minimum).
    pub pool_bytes: usize,
    pub replacement: Replacement,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            pool_bytes: DEFAULT_POOL_BYTES,
            replacement: Replacement::Lru,
        }
    }
}

impl PoolConfig {
    pub fn with_block_size(block_size: usize) -> PoolConfig {
        PoolConfig {
            block_size,
            ..PoolConfig::default()
        }
    }

    fn frame_count(&self) -> usize {
        (self.pool_bytes / self.block_size).max(MIN_POOL_FRAMES)
    }
}

pub struct BufferedFile {
    disk: BlockFile,
    pool: FramePool,
    map: HashMap<BlockNo, usize>,
    /// The header's bytes; a distinguished frame that is always
    /// resident and written back synchronously on demand.
    header: Box<[u8]>,
    header_dirty: bool,
    last_block: BlockNo,
    closed: bool,
}

impl BufferedFile {
    /// Opens or creates the file and reads its header block. A fresh
    /// file has an all-zero header, which callers recognise and
    /// initialise.
    pub fn open(path: &Path, config: PoolConfig) -> Result<BufferedFile> {
        // The header must at least hold the allotment counter.
        assert!(config.block_size >= mem::size_of::<u64>());

        let disk = BlockFile::open(path, config.block_size)?;
        let mut header = vec![0u8; config.block_size].into_boxed_slice();
        disk.read_block(0, &mut header)?;
        let last_block = u64::from_le_bytes(header[..8].try_into().unwrap());

        debug!(
            "bio: opened {} with {} frames, last block {}",
            path.display(),
            config.frame_count(),
            last_block
        );
        Ok(BufferedFile {
            disk,
            pool: FramePool::new(config.frame_count(), config.block_size, config.replacement),
            map: HashMap::new(),
            header,
            header_dirty: false,
            last_block,
            closed: false,
        })
    }

    pub fn block_size(&self) -> usize {
        self.disk.block_size()
    }

    pub fn last_block(&self) -> BlockNo {
        self.last_block
    }

    /// Allots the next block number. Nothing is written until the
    /// block's frame is.
    pub fn allot_block(&mut self) -> BlockNo {
        self.last_block += 1;
        self.header_dirty = true;
        trace!("bio: allotted block {}", self.last_block);
        self.last_block
    }

    /// Releases a block. Only the highest allotted block shrinks the
    /// file; anything lower is merely forgotten by the cache and left
    /// for the owner to account for. Deleting the header is a no-op.
    pub fn delete_block(&mut self, block_no: BlockNo) {
        if block_no == 0 {
            return;
        }
        if let Some(index) = self.map.remove(&block_no) {
            self.pool.evict(index);
        }
        if block_no == self.last_block {
            self.last_block -= 1;
            self.header_dirty = true;
        }
    }

    /// Makes `block_no` resident and returns its frame index, touching
    /// it to the MRU end. This is the read-through path: on a miss the
    /// victim's dirty bytes are written back before it is reused.
    fn frame_for(&mut self, block_no: BlockNo) -> Result<usize> {
        if let Some(&index) = self.map.get(&block_no) {
            self.pool.touch(index);
            return Ok(index);
        }

        let index = self.pool.pick_victim()?;
        {
            let frame = self.pool.frame(index);
            if frame.is_valid() {
                if frame.is_dirty() {
                    trace!("bio: write-back of block {} for {}", frame.block_no, block_no);
                    self.disk.write_block(frame.block_no, frame.data())?;
                }
                let old = frame.block_no;
                self.map.remove(&old);
            }
        }

        let frame = self.pool.frame_mut(index);
        frame.flags = FrameFlags::VALID;
        frame.block_no = block_no;
        self.disk.read_block(block_no, frame.data_mut())?;

        self.map.insert(block_no, index);
        self.pool.touch(index);
        Ok(index)
    }

    fn check_span(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.block_size() {
            return Err(Error::Corruption("access crosses the block boundary"));
        }
        Ok(())
    }

    /// Reads a `T` at `offset` inside block `block_no`.
    pub fn read<T: FromBytes>(&mut self, block_no: BlockNo, offset: usize) -> Result<T> {
        self.check_span(offset, mem::size_of::<T>())?;
        let index = self.frame_for(block_no)?;
        let data = self.pool.frame(index).data();
        Ok(T::read_from(&data[offset..offset + mem::size_of::<T>()]).unwrap())
    }

    /// Writes a `T` at `offset` inside block `block_no`, marking the
    /// frame dirty. Bytes reach the disk on eviction or flush.
    pub fn write<T: AsBytes>(&mut self, block_no: BlockNo, offset: usize, value: &T) -> Result<()> {
        self.check_span(offset, mem::size_of::<T>())?;
        let index = self.frame_for(block_no)?;
        let frame = self.pool.frame_mut(index);
        frame.data_mut()[offset..offset + mem::size_of::<T>()].copy_from_slice(value.as_bytes());
        frame.flags.insert(FrameFlags::DIRTY);
        Ok(())
    }

    pub fn read_bytes(&mut self, block_no: BlockNo, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_span(offset, out.len())?;
        let index = self.frame_for(block_no)?;
        out.copy_from_slice(&self.pool.frame(index).data()[offset..offset + out.len()]);
        Ok(())
    }

    pub fn write_bytes(&mut self, block_no: BlockNo, offset: usize, src: &[u8]) -> Result<()> {
        self.check_span(offset, src.len())?;
        let index = self.frame_for(block_no)?;
        let frame = self.pool.frame_mut(index);
        frame.data_mut()[offset..offset + src.len()].copy_from_slice(src);
        frame.flags.insert(FrameFlags::DIRTY);
        Ok(())
    }

    /// Moves `len` bytes within a block, handling overlap like
    /// `memmove`.
    pub fn memmove(
        &mut self,
        block_no: BlockNo,
        dst_offset: usize,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        self.check_span(dst_offset, len)?;
        self.check_span(src_offset, len)?;
        if len == 0 {
            return Ok(());
        }
        let index = self.frame_for(block_no)?;
        let frame = self.pool.frame_mut(index);
        frame.data_mut().copy_within(src_offset..src_offset + len, dst_offset);
        frame.flags.insert(FrameFlags::DIRTY);
        Ok(())
    }

    pub fn memset(&mut self, block_no: BlockNo, offset: usize, byte: u8, len: usize) -> Result<()> {
        self.check_span(offset, len)?;
        let index = self.frame_for(block_no)?;
        let frame = self.pool.frame_mut(index);
        for b in &mut frame.data_mut()[offset..offset + len] {
            *b = byte;
        }
        frame.flags.insert(FrameFlags::DIRTY);
        Ok(())
    }

    /// Flushes `block_no` if it is cached and dirty. Blocks beyond the
    /// allotted range are a no-op.
    pub fn write_block(&mut self, block_no: BlockNo) -> Result<()> {
        if block_no > self.last_block {
            return Ok(());
        }
        if let Some(&index) = self.map.get(&block_no) {
            let frame = self.pool.frame_mut(index);
            if frame.is_valid() && frame.is_dirty() {
                self.disk.write_block(frame.block_no, frame.data())?;
                self.pool.frame_mut(index).flags.remove(FrameFlags::DIRTY);
            }
        }
        Ok(())
    }

    /// Pins `block_no`'s frame so it cannot be victimised, granting a
    /// second-chance budget on top. Pins stack; every `pin` needs an
    /// `unpin`.
    pub fn pin(&mut self, block_no: BlockNo, max_chance: u8) -> Result<()> {
        let index = self.frame_for(block_no)?;
        self.pool.pin(index, max_chance);
        Ok(())
    }

    pub fn unpin(&mut self, block_no: BlockNo) {
        if let Some(&index) = self.map.get(&block_no) {
            self.pool.unpin(index);
        }
    }

    /// Grants `block_no` a survival hint without pinning it.
    pub fn promote(&mut self, block_no: BlockNo, max_chance: u8) -> Result<()> {
        let index = self.frame_for(block_no)?;
        self.pool.promote(index, max_chance);
        Ok(())
    }

    pub fn read_header<T: FromBytes>(&self, offset: usize) -> T {
        T::read_from(&self.header[offset..offset + mem::size_of::<T>()]).unwrap()
    }

    pub fn write_header<T: AsBytes>(&mut self, offset: usize, value: &T) {
        self.header[offset..offset + mem::size_of::<T>()].copy_from_slice(value.as_bytes());
        self.header_dirty = true;
    }

    pub fn header_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.header[offset..offset + len]
    }

    pub fn write_header_bytes(&mut self, offset: usize, src: &[u8]) {
        self.header[offset..offset + src.len()].copy_from_slice(src);
        self.header_dirty = true;
    }

    /// Writes the header block to disk synchronously.
    pub fn sync_header(&mut self) -> Result<()> {
        self.header[..8].copy_from_slice(&self.last_block.to_le_bytes());
        self.disk.write_block(0, &self.header)?;
        self.header_dirty = false;
        Ok(())
    }

    /// Durability point short of close: header, every dirty frame, and
    /// an fsync. The file keeps its current length.
    pub fn flush(&mut self) -> Result<()> {
        if self.header_dirty {
            self.sync_header()?;
        }
        let mut flushed = 0;
        for index in 0..self.pool.len() {
            let frame = self.pool.frame(index);
            if frame.is_valid() && frame.is_dirty() {
                self.disk.write_block(frame.block_no, frame.data())?;
                self.pool.frame_mut(index).flags.remove(FrameFlags::DIRTY);
                flushed += 1;
            }
        }
        trace!("bio: flushed header and {} dirty frames", flushed);
        self.disk.sync()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.closed = true;
        self.flush()?;
        self.disk.truncate(self.last_block + 1)?;
        self.disk.sync()
    }

    /// Flushes everything, truncates the file to
    /// `(last_block_allocated + 1) * block_size`, fsyncs, and releases
    /// the lock.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }
}

impl Drop for BufferedFile {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.shutdown() {
                warn!("bio: close on drop failed: {}", err);
            }
        }
    }
}
