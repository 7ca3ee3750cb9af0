//! The sparse extent header: the 512-byte structure at the front (and,
//! double-written, at the front again) of every stream-optimized VMDK.
//!
//! Shared between the writer (which only ever builds one from scratch)
//! and the reader (which parses and validates one from an existing
//! file), so the field layout lives in exactly one place.

use crate::error::{Error, Result};
use crate::vmdk::layout::{load_u16_le, load_u32_le, load_u64_le, store_u16_le, store_u32_le, store_u64_le, SECTOR_SIZE};

/// `"VMDK"` packed as a little-endian u32 (on disk: bytes `4D 56 44 4B`,
/// i.e. `V`,`M`,`D`,`K` read as an LE32 word).
pub const VMDK_MAGIC: u32 = 0x4B44_4D56;

/// The scrambled variant written first during finalize so a reader can
/// tell a torn double-write from a healthy file: canonical XOR
/// `0x20202020` (flips the magic to the lowercase ASCII spelling).
pub const VMDK_MAGIC_SCRAMBLED: u32 = VMDK_MAGIC ^ 0x2020_2020;

/// Highest header version this codec understands.
pub const MAX_VERSION: u32 = 3;

pub const FLAG_VALID_NEWLINE_DETECTOR: u32 = 1 << 0;
pub const FLAG_COMPRESSED: u32 = 1 << 16;
pub const FLAG_EMBEDDED_LBA: u32 = 1 << 17;

/// Bits this codec recognizes; any other set bit in `flags` is an
/// unknown incompatible flag and must cause `open` to reject the file.
const KNOWN_FLAGS: u32 = FLAG_VALID_NEWLINE_DETECTOR | FLAG_COMPRESSED | FLAG_EMBEDDED_LBA;

/// DEFLATE, the only compression algorithm this codec supports.
pub const COMPRESS_ALGORITHM_DEFLATE: u16 = 1;

const NEWLINE_SENTINEL: [u8; 4] = [b'\n', b' ', b'\r', b'\n'];

/// The 512-byte on-disk extent header.
#[derive(Debug, Clone, Copy)]
pub struct SparseExtentHeader {
    pub magic: u32,
    pub version: u32,
    pub flags: u32,
    pub capacity: u64,
    pub grain_size: u64,
    pub descriptor_offset: u64,
    pub descriptor_size: u64,
    pub num_gtes_per_gt: u32,
    pub rgd_offset: u64,
    pub gd_offset: u64,
    pub overhead: u64,
    pub unclean_shutdown: u8,
    pub compress_algorithm: u16,
}

impl SparseExtentHeader {
    /// Builds the header for a freshly created stream-optimized disk.
    /// `overhead`/`gd_offset` are filled in once the writer has reserved
    /// the descriptor and GD/GT regions; this constructor only fixes the
    /// values that are known from `capacity`/`grain_size` alone.
    pub fn new(capacity_sectors: u64, grain_size_sectors: u64, num_gtes_per_gt: u32) -> Self {
        Self {
            magic: VMDK_MAGIC_SCRAMBLED,
            version: 3,
            flags: FLAG_VALID_NEWLINE_DETECTOR | FLAG_COMPRESSED | FLAG_EMBEDDED_LBA,
            capacity: capacity_sectors,
            grain_size: grain_size_sectors,
            descriptor_offset: 0,
            descriptor_size: 0,
            num_gtes_per_gt,
            rgd_offset: 0,
            gd_offset: 0,
            overhead: 0,
            unclean_shutdown: 0,
            compress_algorithm: COMPRESS_ALGORITHM_DEFLATE,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn has_embedded_lba(&self) -> bool {
        self.flags & FLAG_EMBEDDED_LBA != 0
    }

    fn has_newline_detector(&self) -> bool {
        self.flags & FLAG_VALID_NEWLINE_DETECTOR != 0
    }

    pub fn to_bytes(&self) -> [u8; SECTOR_SIZE as usize] {
        let mut buf = [0u8; SECTOR_SIZE as usize];
        store_u32_le(&mut buf, 0, self.magic);
        store_u32_le(&mut buf, 4, self.version);
        store_u32_le(&mut buf, 8, self.flags);
        store_u64_le(&mut buf, 12, self.capacity);
        store_u64_le(&mut buf, 20, self.grain_size);
        store_u64_le(&mut buf, 28, self.descriptor_offset);
        store_u64_le(&mut buf, 36, self.descriptor_size);
        store_u32_le(&mut buf, 44, self.num_gtes_per_gt);
        store_u64_le(&mut buf, 48, self.rgd_offset);
        store_u64_le(&mut buf, 56, self.gd_offset);
        store_u64_le(&mut buf, 64, self.overhead);
        buf[72] = self.unclean_shutdown;
        buf[73..77].copy_from_slice(&NEWLINE_SENTINEL);
        store_u16_le(&mut buf, 77, self.compress_algorithm);
        buf
    }

    /// Parses and validates a header per spec.md §3/§4.6. Returns a
    /// format error for anything this codec doesn't understand.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < SECTOR_SIZE as usize {
            return Err(Error::vmdk("Header short read: less than one sector"));
        }

        let magic = load_u32_le(buf, 0);
        if magic != VMDK_MAGIC {
            return Err(Error::vmdk(format!(
                "Invalid VMDK magic: expected 0x{VMDK_MAGIC:08X}, got 0x{magic:08X}"
            )));
        }

        let version = load_u32_le(buf, 4);
        if version > MAX_VERSION {
            return Err(Error::vmdk(format!(
                "Unsupported VMDK version {version} (max {MAX_VERSION})"
            )));
        }

        let flags = load_u32_le(buf, 8);
        if flags & !KNOWN_FLAGS != 0 {
            return Err(Error::vmdk(format!(
                "Unknown incompatible flag bits: 0x{:08X}",
                flags & !KNOWN_FLAGS
            )));
        }
        if flags & FLAG_EMBEDDED_LBA != 0 && flags & FLAG_COMPRESSED == 0 {
            return Err(Error::vmdk("EMBEDDED_LBA flag set without COMPRESSED"));
        }

        let header = Self {
            magic,
            version,
            flags,
            capacity: load_u64_le(buf, 12),
            grain_size: load_u64_le(buf, 20),
            descriptor_offset: load_u64_le(buf, 28),
            descriptor_size: load_u64_le(buf, 36),
            num_gtes_per_gt: load_u32_le(buf, 44),
            rgd_offset: load_u64_le(buf, 48),
            gd_offset: load_u64_le(buf, 56),
            overhead: load_u64_le(buf, 64),
            unclean_shutdown: buf[72],
            compress_algorithm: load_u16_le(buf, 77),
        };

        if header.has_newline_detector() && buf[73..77] != NEWLINE_SENTINEL {
            return Err(Error::vmdk("Newline sentinel mismatch (corrupted header)"));
        }

        if !header.grain_size.is_power_of_two() || header.grain_size == 0 || header.grain_size > 128 {
            return Err(Error::geometry(format!(
                "grainSize {} is not a power of two in [1, 128]",
                header.grain_size
            )));
        }
        if !header.num_gtes_per_gt.is_power_of_two() || header.num_gtes_per_gt < 128 {
            return Err(Error::geometry(format!(
                "numGTEsPerGT {} is not a power of two >= 128",
                header.num_gtes_per_gt
            )));
        }
        if header.compress_algorithm != COMPRESS_ALGORITHM_DEFLATE {
            return Err(Error::vmdk(format!(
                "Unsupported compression algorithm {}",
                header.compress_algorithm
            )));
        }

        Ok(header)
    }
}
