//! Raw block I/O on a regular file.
//!
//! A `BlockFile` turns a file into a numbered array of fixed-size
//! blocks addressed by positioned reads and writes at
//! `block_number * block_size`. Block 0 is reserved for the header of
//! whichever structure owns the file. The file is guarded by an
//! exclusive advisory lock for its whole lifetime, so a second process
//! opening the same path fails instead of corrupting it.
//!
//! Reading past the end of the file yields zero-filled bytes, which is
//! what a freshly allotted block is expected to contain.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use cfg_if::cfg_if;
use fs4::fs_std::FileExt;
use log::debug;

use crate::error::{Error, Result};

/// Index of a block within a file. Block 0 is the header.
pub type BlockNo = u64;

cfg_if! {
    if #[cfg(unix)] {
        fn file_open_options() -> OpenOptions {
            use std::os::unix::fs::OpenOptionsExt;

            let mut options = OpenOptions::new();
            options.read(true).write(true).create(true).mode(0o755);
            options
        }

        fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            use std::os::unix::fs::FileExt as _;

            file.read_at(buf, offset)
        }

        fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
            use std::os::unix::fs::FileExt as _;

            file.write_at(buf, offset)
        }
    } else if #[cfg(windows)] {
        fn file_open_options() -> OpenOptions {
            let mut options = OpenOptions::new();
            options.read(true).write(true).create(true);
            options
        }

        fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            use std::os::windows::fs::FileExt as _;

            file.seek_read(buf, offset)
        }

        fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
            use std::os::windows::fs::FileExt as _;

            file.seek_write(buf, offset)
        }
    }
}

pub struct BlockFile {
    file: File,
    block_size: usize,
}

impl BlockFile {
    /// Opens (or creates, mode 0755) `path` and takes the exclusive
    /// advisory lock. Fails with [`Error::LockUnavailable`] if another
    /// process holds it.
    pub fn open(path: &Path, block_size: usize) -> Result<BlockFile> {
        let file = file_open_options().open(path)?;
        file.try_lock_exclusive().map_err(|err| {
            if err.kind() == io::ErrorKind::WouldBlock {
                Error::LockUnavailable
            } else {
                Error::Io(err)
            }
        })?;
        debug!("disk: opened {} (block size {})", path.display(), block_size);
        Ok(BlockFile { file, block_size })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn offset_of(&self, block_no: BlockNo) -> u64 {
        block_no * self.block_size as u64
    }

    /// Reads block `block_no` into `buf`. Bytes past the end of the
    /// file come back zeroed.
    pub fn read_block(&self, block_no: BlockNo, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size);
        for byte in buf.iter_mut() {
            *byte = 0;
        }

        let offset = self.offset_of(block_no);
        let mut done = 0;
        while done < buf.len() {
            match read_at(&self.file, &mut buf[done..], offset + done as u64) {
                // Short block at the end of the file; the rest stays zero.
                Ok(0) => break,
                Ok(n) => done += n,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::Io(err)),
            }
        }
        Ok(())
    }

    /// Writes `buf` as block `block_no`.
    pub fn write_block(&self, block_no: BlockNo, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size);

        let offset = self.offset_of(block_no);
        let mut done = 0;
        while done < buf.len() {
            match write_at(&self.file, &buf[done..], offset + done as u64) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "positioned write made no progress",
                    )))
                }
                Ok(n) => done += n,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::Io(err)),
            }
        }
        Ok(())
    }

    /// Cuts the file down to exactly `block_count` blocks.
    pub fn truncate(&self, block_count: u64) -> Result<()> {
        self.file.set_len(block_count * self.block_size as u64)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for BlockFile {
    fn drop(&mut self) {
        // The OS drops the advisory lock with the descriptor; doing it
        // explicitly keeps the release point deterministic.
        let _ = FileExt::unlock(&self.file);
    }
}
