//! The external disk interface (spec.md §4.8): the narrow capability
//! set the codec talks to a concrete disk through, rather than an
//! inheritance hierarchy of disk types.
//!
//! `SourceDisk` is everything the parallel copy engine and the
//! single-threaded `pwrite` driver need from something they read from.
//! `Reader` (`vmdk::reader`) itself satisfies `SourceDisk`, so copying
//! grain-for-grain from one stream-optimized VMDK into a new one is just
//! `writer.copy_disk(&existing_reader, n)` — no separate "VMDK-to-VMDK"
//! code path is needed.

use crate::error::{Error, Result};
use crate::vmdk::layout::open_for_read;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// Capability exposed by anything the copy engine (or a single-threaded
/// caller) can read grains from: total size plus positional read.
///
/// Implementors must be safe to call concurrently from multiple threads
/// with disjoint (or even overlapping) ranges — the copy engine in
/// `vmdk::copy` calls `pread` from `N` worker threads with no
/// synchronization beyond each worker owning its own destination
/// buffer.
pub trait SourceDisk: Sync {
    /// Total addressable size, in bytes.
    fn capacity(&self) -> u64;

    /// Reads up to `buf.len()` bytes starting at byte offset `pos`,
    /// filling `buf` fully unless `pos + buf.len() > capacity()` (in
    /// which case the tail past capacity is left as the caller found
    /// it — callers are expected to clip their read length to
    /// `capacity()` themselves, as `vmdk::copy` does).
    fn pread(&self, buf: &mut [u8], pos: u64) -> Result<()>;
}

/// A `SourceDisk` backed by a plain file on local disk (e.g. a flat raw
/// disk image to be wrapped as a new stream-optimized VMDK).
///
/// Uses `memmap2`, the same dependency the rest of this crate already
/// uses for VMDK file access, rather than seeking a shared file handle
/// per read.
pub struct FileSourceDisk {
    mmap: Mmap,
    len: u64,
}

impl FileSourceDisk {
    pub fn open(path: &Path) -> Result<Self> {
        let file = open_for_read(path)?;
        let len = file.metadata().map_err(|e| Error::io(e, path))?.len();
        // SAFETY: we hold our own handle to a file we just opened
        // read-only; nothing in this process mutates it through this
        // mapping, and the mapping does not outlive `file`'s lifetime
        // extension via the returned `Mmap`.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };
        Ok(Self { mmap, len })
    }

    /// Wraps an already-open file (handy for tests that build the
    /// source in a `tempfile::NamedTempFile`).
    pub fn from_file(file: &File) -> Result<Self> {
        let len = file.metadata().map_err(Error::io_simple)?.len();
        let mmap = unsafe { Mmap::map(file).map_err(Error::io_simple)? };
        Ok(Self { mmap, len })
    }
}

impl SourceDisk for FileSourceDisk {
    fn capacity(&self) -> u64 {
        self.len
    }

    fn pread(&self, buf: &mut [u8], pos: u64) -> Result<()> {
        let start = pos as usize;
        let end = start + buf.len();
        if end > self.mmap.len() {
            return Err(Error::vmdk(format!(
                "Short read: disk is {} bytes, requested [{start}, {end})",
                self.mmap.len()
            )));
        }
        buf.copy_from_slice(&self.mmap[start..end]);
        Ok(())
    }
}
