//! Byte-layout primitives for the sparse VMDK on-disk format.
//!
//! Every multi-byte field in the format is little-endian and several of
//! them sit at unaligned offsets inside a packed header, so plain
//! `u32::from_ne_bytes` on a cast pointer is not an option. This module
//! centralizes the load/store helpers plus the handful of small
//! arithmetic primitives (sector rounding, zero detection) every other
//! `vmdk` module needs.

use crate::error::{Error, Result};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Size of one on-disk sector, in bytes. Every offset and length in the
/// format is expressed as a sector count.
pub const SECTOR_SIZE: u64 = 512;

/// Rounds a byte count up to the next sector boundary, in sectors.
#[inline]
pub fn bytes_to_sectors(bytes: u64) -> u64 {
    (bytes + SECTOR_SIZE - 1) / SECTOR_SIZE
}

/// Rounds a byte count up to the next sector boundary, in bytes.
#[inline]
pub fn round_up_to_sector(bytes: u64) -> u64 {
    bytes_to_sectors(bytes) * SECTOR_SIZE
}

#[inline]
pub fn load_u16_le(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
pub fn load_u32_le(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
pub fn load_u64_le(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

#[inline]
pub fn store_u16_le(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

#[inline]
pub fn store_u32_le(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

#[inline]
pub fn store_u64_le(buf: &mut [u8], off: usize, val: u64) {
    buf[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

/// Fast all-zero test.
///
/// `buf.len()` must be a multiple of 8; every grain-sized buffer the
/// codec tests is grain-size-aligned so this holds in practice. Checks
/// in `u64` lanes rather than byte-by-byte.
pub fn is_all_zero(buf: &[u8]) -> bool {
    debug_assert_eq!(buf.len() % 8, 0, "is_all_zero requires an 8-byte-aligned length");
    buf.chunks_exact(8)
        .all(|chunk| u64::from_ne_bytes(chunk.try_into().unwrap()) == 0)
}

/// Reads exactly `buf.len()` bytes from `file` at byte offset `pos`,
/// failing on short reads rather than silently returning a partial
/// buffer.
pub fn pread_exact_at(file: &File, buf: &mut [u8], pos: u64) -> Result<()> {
    file.read_exact_at(buf, pos).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::vmdk(format!(
                "Short read at offset {pos}: requested {} bytes",
                buf.len()
            ))
        } else {
            Error::io_simple(e)
        }
    })
}

/// Writes all of `buf` to `file` at byte offset `pos`. `write_all_at`
/// already fails on any short write internally (it retries on partial
/// writes and only returns early on an actual error), so there is no
/// separate "short write" case to detect here.
pub fn pwrite_all_at(file: &File, buf: &[u8], pos: u64) -> Result<()> {
    file.write_all_at(buf, pos)
        .map_err(|e| Error::vmdk(format!("Disk full? write failed at offset {pos}: {e}")))
}

/// Opens `path` for positional reads.
pub fn open_for_read(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| Error::io(e, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_rounding() {
        assert_eq!(round_up_to_sector(0), 0);
        assert_eq!(round_up_to_sector(1), SECTOR_SIZE);
        assert_eq!(round_up_to_sector(SECTOR_SIZE), SECTOR_SIZE);
        assert_eq!(round_up_to_sector(SECTOR_SIZE + 1), SECTOR_SIZE * 2);
        assert_eq!(bytes_to_sectors(1025), 3);
    }

    #[test]
    fn le_round_trip() {
        let mut buf = [0u8; 16];
        store_u64_le(&mut buf, 1, 0x0102_0304_0506_0708);
        assert_eq!(load_u64_le(&buf, 1), 0x0102_0304_0506_0708);
        store_u32_le(&mut buf, 0, 0xAABBCCDD);
        assert_eq!(load_u32_le(&buf, 0), 0xAABBCCDD);
        store_u16_le(&mut buf, 14, 0xBEEF);
        assert_eq!(load_u16_le(&buf, 14), 0xBEEF);
    }

    #[test]
    fn zero_detection() {
        let zeros = vec![0u8; 64];
        assert!(is_all_zero(&zeros));
        let mut nonzero = vec![0u8; 64];
        nonzero[63] = 1;
        assert!(!is_all_zero(&nonzero));
    }
}
