//! Grain-table geometry: derives GD/GT sizing from a header and owns the
//! contiguous GD+GT slab both the writer and reader index into.
//!
//! Design note (spec.md §9): GD and every GT are allocated as a single
//! contiguous block so that finalize can write the whole index with one
//! positional write. `GrainTableSlab` is that block plus the two views
//! (`gd_entry`/`gt_entry`) spec.md's design note calls for, instead of
//! two separate `Vec<u32>`s that would need to be written out in two
//! I/O calls.

use crate::error::{Error, Result};
use crate::vmdk::layout::{bytes_to_sectors, load_u32_le, store_u32_le, SECTOR_SIZE};

/// A grain table entry of `0` means "not allocated" (hole).
pub const GTE_HOLE: u32 = 0;
/// A grain table entry of `1` means "explicit zero" — read-only sentinel,
/// this codec's writer never produces it (spec.md §4.4).
pub const GTE_ZERO: u32 = 1;
/// A grain directory entry of `0` means the grain table itself was never
/// allocated (legal only when every grain it would cover is a hole).
pub const GDE_UNALLOCATED: u32 = 0;

#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub grain_size_sectors: u64,
    pub num_gtes_per_gt: u32,
    /// Total grain count, including a short tail grain if capacity isn't
    /// grain-aligned.
    pub total_grains: u64,
    /// Number of bytes in the last grain; `0` means the disk ends
    /// exactly on a grain boundary (no short tail grain).
    pub last_grain_size_bytes: u64,
    pub num_gts: u64,
    pub gd_sectors: u64,
    pub gt_sectors: u64,
}

impl Geometry {
    /// Derives geometry from `(capacity, grainSize, numGTEsPerGT)`,
    /// performing the checks spec.md §3 lists (grain size / GTE count
    /// are validated by the header parser already; this only derives
    /// the counts and checks capacity isn't degenerate).
    pub fn derive(capacity_sectors: u64, grain_size_sectors: u64, num_gtes_per_gt: u32) -> Result<Self> {
        if grain_size_sectors == 0 {
            return Err(Error::geometry("grainSize must be nonzero"));
        }

        let last_grain_nr = capacity_sectors / grain_size_sectors;
        let tail_sectors = capacity_sectors % grain_size_sectors;
        let last_grain_size_bytes = tail_sectors * SECTOR_SIZE;
        let total_grains = last_grain_nr + if last_grain_size_bytes != 0 { 1 } else { 0 };

        let num_gts = if total_grains == 0 {
            0
        } else {
            (total_grains + num_gtes_per_gt as u64 - 1) / num_gtes_per_gt as u64
        };

        let gd_sectors = bytes_to_sectors(num_gts * 4).max(if num_gts > 0 { 1 } else { 0 });
        let gt_sectors = bytes_to_sectors(num_gtes_per_gt as u64 * 4);

        Ok(Self {
            grain_size_sectors,
            num_gtes_per_gt,
            total_grains,
            last_grain_size_bytes,
            num_gts,
            gd_sectors,
            gt_sectors,
        })
    }

    pub fn grain_size_bytes(&self) -> u64 {
        self.grain_size_sectors * SECTOR_SIZE
    }

    /// The uncompressed length of `grain_nr`, in bytes: the full grain
    /// size for every grain but a short final grain, `0` past the end
    /// of the disk.
    pub fn grain_len(&self, grain_nr: u64) -> u64 {
        if grain_nr + 1 < self.total_grains {
            self.grain_size_bytes()
        } else if grain_nr + 1 == self.total_grains {
            if self.last_grain_size_bytes != 0 {
                self.last_grain_size_bytes
            } else {
                self.grain_size_bytes()
            }
        } else {
            0
        }
    }

    /// Allocates the zeroed contiguous GD+GT slab this geometry implies.
    pub fn allocate_slab(&self) -> GrainTableSlab {
        let len = ((self.gd_sectors + self.gt_sectors * self.num_gts) * SECTOR_SIZE) as usize;
        GrainTableSlab {
            geometry: *self,
            bytes: vec![0u8; len],
        }
    }
}

/// The contiguous GD+GT block. GD occupies the first `gd_sectors`
/// sectors (only the first `num_gts * 4` bytes of which are meaningful);
/// each GT occupies `gt_sectors` sectors immediately after, in GT-index
/// order.
pub struct GrainTableSlab {
    geometry: Geometry,
    bytes: Vec<u8>,
}

impl GrainTableSlab {
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn gt_region_start(&self) -> usize {
        (self.geometry.gd_sectors * SECTOR_SIZE) as usize
    }

    pub fn gd_entry(&self, gt_index: u64) -> u32 {
        load_u32_le(&self.bytes, gt_index as usize * 4)
    }

    pub fn set_gd_entry(&mut self, gt_index: u64, sector: u32) {
        store_u32_le(&mut self.bytes, gt_index as usize * 4, sector);
    }

    fn gt_entry_offset(&self, grain_nr: u64) -> usize {
        let gt_index = grain_nr / self.geometry.num_gtes_per_gt as u64;
        let gte_index = grain_nr % self.geometry.num_gtes_per_gt as u64;
        self.gt_region_start()
            + (gt_index * self.geometry.gt_sectors * SECTOR_SIZE) as usize
            + gte_index as usize * 4
    }

    pub fn gt_entry(&self, grain_nr: u64) -> u32 {
        load_u32_le(&self.bytes, self.gt_entry_offset(grain_nr))
    }

    pub fn set_gt_entry(&mut self, grain_nr: u64, sector: u32) {
        let off = self.gt_entry_offset(grain_nr);
        store_u32_le(&mut self.bytes, off, sector);
    }

    /// Direct mutable access to one GT's worth of bytes, for the reader's
    /// coalesced-load path (it reads straight into the slab).
    pub fn gt_slice_mut(&mut self, gt_index: u64) -> &mut [u8] {
        let start = self.gt_region_start() + (gt_index * self.geometry.gt_sectors * SECTOR_SIZE) as usize;
        let end = start + (self.geometry.gt_sectors * SECTOR_SIZE) as usize;
        &mut self.bytes[start..end]
    }

    /// Sector offset (from the start of the slab) of a given GT's region
    /// in the file, given the file sector at which GD starts.
    pub fn gt_file_sector(&self, gd_file_sector: u64, gt_index: u64) -> u64 {
        gd_file_sector + self.geometry.gd_sectors + gt_index * self.geometry.gt_sectors
    }

    /// Assigns GD entry `i = start_sector + i * gt_sectors` for every GT
    /// (spec.md §4.2's `prefillGD`), and returns the first sector
    /// available for payload after the whole GD+GT region.
    pub fn prefill_gd(&mut self, start_sector: u64) -> u64 {
        let gt_sectors = self.geometry.gt_sectors;
        for i in 0..self.geometry.num_gts {
            self.set_gd_entry(i, (start_sector + i * gt_sectors) as u32);
        }
        start_sector + self.geometry.num_gts * gt_sectors
    }
}
