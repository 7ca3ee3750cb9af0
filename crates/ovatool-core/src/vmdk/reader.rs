//! The unified stream-optimized VMDK reader (spec.md §4.6): validates
//! the header, loads the GD+GT index with coalesced I/O, and answers
//! random-access decompressed reads and hole-skipping scans.
//!
//! Replaces the teacher's original `VmdkReader` (a structure-agnostic
//! mmap chunk iterator) and `sparse::SparseVmdkReader` (which only
//! handled the non-streamOptimized "hosted sparse" variant and
//! explicitly rejected markers): one header-driven codepath here covers
//! both the embedded-LBA compressed records this codec's own writer
//! produces and the legacy 4-byte-header uncompressed records some
//! third-party producers still emit.

use crate::error::{Error, Result};
use crate::vmdk::compressor::Inflater;
use crate::vmdk::disk::SourceDisk;
use crate::vmdk::geometry::Geometry;
use crate::vmdk::header::SparseExtentHeader;
use crate::vmdk::layout::{load_u32_le, load_u64_le, open_for_read, pread_exact_at, SECTOR_SIZE};
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

/// A GD entry / GT entry of `0` is a hole; `1` is the legacy
/// "explicit zero" sentinel. Both read as zeros.
fn is_zero_fill(sect: u32) -> bool {
    sect == 0 || sect == 1
}

/// An opened, validated stream-optimized VMDK, ready for random-access
/// reads.
pub struct Reader {
    file: File,
    header: SparseExtentHeader,
    geometry: Geometry,
    /// Flat grain-number-indexed grain table: entry `grain_nr` is the
    /// same value `gt[gtIndex][gteIndex]` would be, but addressed
    /// directly since every GT's entries are laid out end-to-end here
    /// in grain order.
    gt_entries: Vec<u32>,
    /// One inflate context shared across every `pread` call, reset
    /// between grains instead of being rebuilt per call (spec.md §9:
    /// "do not allocate a fresh context per grain"). Behind a `Mutex`
    /// rather than `RefCell` because `Reader` must stay `Sync` — it
    /// implements `SourceDisk`, which the parallel copy engine reads
    /// from concurrently when chaining a VMDK-to-VMDK copy.
    inflater: Mutex<Inflater>,
}

impl Reader {
    /// Opens and validates `path`, loading the full grain-table index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = open_for_read(path)?;

        let mut header_buf = [0u8; SECTOR_SIZE as usize];
        pread_exact_at(&file, &mut header_buf, 0)?;
        let header = SparseExtentHeader::from_bytes(&header_buf)?;

        let geometry = Geometry::derive(header.capacity, header.grain_size, header.num_gtes_per_gt)?;

        let mut gd = vec![0u32; geometry.num_gts as usize];
        if geometry.num_gts > 0 {
            let mut gd_buf = vec![0u8; (geometry.gd_sectors * SECTOR_SIZE) as usize];
            pread_exact_at(&file, &mut gd_buf, header.gd_offset * SECTOR_SIZE)?;
            for (i, slot) in gd.iter_mut().enumerate() {
                *slot = load_u32_le(&gd_buf, i * 4);
            }
        }

        let gt_entries = load_gt_entries(&file, &geometry, &gd)?;
        let inflater = Mutex::new(Inflater::new(geometry.grain_size_bytes() as usize));

        Ok(Self {
            file,
            header,
            geometry,
            gt_entries,
            inflater,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn capacity(&self) -> u64 {
        self.header.capacity * SECTOR_SIZE
    }

    /// Reads up to `buf.len()` logical bytes starting at `pos`,
    /// decompressing whichever grains the range touches and
    /// zero-filling holes. Returns the number of bytes actually
    /// written to `buf`.
    ///
    /// Per spec.md §4.6/§8 property 8, a request is *clipped* at the
    /// end of the disk rather than rejected: `read_len` is clipped to
    /// what the current grain and the disk's capacity can still
    /// supply, and the call stops (short of filling all of `buf`) once
    /// it reaches the end, without error — so long as it managed to
    /// read at least one byte. A request that starts entirely past the
    /// end of the disk has nothing to clip to and fails instead.
    pub fn pread(&self, buf: &mut [u8], pos: u64) -> Result<usize> {
        let grain_bytes = self.geometry.grain_size_bytes();
        let mut written = 0usize;
        let mut cur_pos = pos;

        while written < buf.len() {
            let grain_nr = cur_pos / grain_bytes;
            let read_skip = (cur_pos % grain_bytes) as usize;
            let grain_len = self.geometry.grain_len(grain_nr) as usize;

            let remaining_in_grain = grain_len.saturating_sub(read_skip);
            if remaining_in_grain == 0 {
                if written == 0 {
                    return Err(Error::vmdk(format!("pread past end of disk at grain {grain_nr}")));
                }
                break;
            }

            let remaining_in_call = buf.len() - written;
            let read_len = remaining_in_grain.min(remaining_in_call);

            self.read_grain_range(grain_nr, read_skip, &mut buf[written..written + read_len])?;

            written += read_len;
            cur_pos += read_len as u64;
        }

        Ok(written)
    }

    fn read_grain_range(&self, grain_nr: u64, read_skip: usize, dst: &mut [u8]) -> Result<()> {
        let sect = *self.gt_entries.get(grain_nr as usize).unwrap_or(&0);

        if is_zero_fill(sect) {
            dst.fill(0);
            return Ok(());
        }

        if self.header.is_compressed() {
            self.read_compressed_grain(grain_nr, sect as u64, read_skip, dst)
        } else {
            let pos = sect as u64 * SECTOR_SIZE + read_skip as u64;
            pread_exact_at(&self.file, dst, pos)
        }
    }

    fn read_compressed_grain(&self, grain_nr: u64, sect: u64, read_skip: usize, dst: &mut [u8]) -> Result<()> {
        let embedded = self.header.has_embedded_lba();
        let hdr_len = if embedded { 12 } else { 4 };

        let mut first_sector = [0u8; SECTOR_SIZE as usize];
        pread_exact_at(&self.file, &mut first_sector, sect * SECTOR_SIZE)?;

        let (lba, cmp_size) = if embedded {
            (load_u64_le(&first_sector, 0), load_u32_le(&first_sector, 8))
        } else {
            (grain_nr * self.geometry.grain_size_sectors, load_u32_le(&first_sector, 0))
        };

        if embedded && lba != grain_nr * self.geometry.grain_size_sectors {
            return Err(Error::integrity(format!(
                "embedded LBA mismatch on grain {grain_nr}: record claims lba {lba}, expected {}",
                grain_nr * self.geometry.grain_size_sectors
            )));
        }

        let grain_bytes_bound = self.geometry.grain_size_bytes() as usize + hdr_len + 64;
        if cmp_size as usize + hdr_len > grain_bytes_bound {
            return Err(Error::integrity(format!(
                "grain {grain_nr} claims cmpSize {cmp_size}, larger than a grain's worth of compressed data can plausibly be"
            )));
        }

        let total_len = hdr_len + cmp_size as usize;
        let mut record = vec![0u8; total_len.max(SECTOR_SIZE as usize)];
        record[..SECTOR_SIZE as usize].copy_from_slice(&first_sector);
        if total_len > SECTOR_SIZE as usize {
            pread_exact_at(&self.file, &mut record[SECTOR_SIZE as usize..total_len], (sect + 1) * SECTOR_SIZE)?;
        }

        let compressed = &record[hdr_len..total_len];
        let mut inflater = self.inflater.lock().unwrap();
        let decompressed = inflater.inflate(compressed)?;

        let required_len = self.geometry.grain_len(grain_nr) as usize;
        if decompressed.len() < required_len {
            return Err(Error::integrity(format!(
                "grain {grain_nr} inflated to {} bytes, expected at least {required_len}",
                decompressed.len()
            )));
        }

        dst.copy_from_slice(&decompressed[read_skip..read_skip + dst.len()]);
        Ok(())
    }

    /// Finds the next non-hole byte range at or after `pos_hint`. Fails
    /// with `NotFound` if there is no more data before the end of the
    /// disk.
    pub fn next_data(&self, pos_hint: u64) -> Result<(u64, u64)> {
        let grain_bytes = self.geometry.grain_size_bytes();
        let start_grain = pos_hint / grain_bytes;

        let mut start: Option<u64> = None;
        for grain_nr in start_grain..self.geometry.total_grains {
            let sect = *self.gt_entries.get(grain_nr as usize).unwrap_or(&0);
            let grain_start = grain_nr * grain_bytes;

            match (start, is_zero_fill(sect)) {
                (None, true) => continue,
                (None, false) => {
                    start = Some(grain_start.max(pos_hint));
                }
                (Some(s), true) => {
                    return Ok((s, grain_start));
                }
                (Some(_), false) => continue,
            }
        }

        match start {
            Some(s) => Ok((s, self.capacity())),
            None => Err(Error::not_found(format!("no data found at or after offset {pos_hint}"))),
        }
    }

    /// Releases the file handle. A plain `drop` would do the same thing;
    /// this exists so callers have an explicit symmetric counterpart to
    /// `Writer::close`/`Writer::abort`.
    pub fn close(self) {}
}

impl SourceDisk for Reader {
    fn capacity(&self) -> u64 {
        Reader::capacity(self)
    }

    /// `SourceDisk::pread` fills `buf` fully or fails (its callers, like
    /// `vmdk::copy`, already clip their request length to `capacity()`
    /// first); `Reader::pread` itself is the clipping, short-read-aware
    /// entry point public callers should prefer.
    fn pread(&self, buf: &mut [u8], pos: u64) -> Result<()> {
        let n = Reader::pread(self, buf, pos)?;
        if n < buf.len() {
            return Err(Error::vmdk(format!(
                "Short read at offset {pos}: got {n} of {} bytes",
                buf.len()
            )));
        }
        Ok(())
    }
}

/// Loads every GT's entries into one flat, grain-number-indexed vector,
/// coalescing adjacent GT reads into as few positional reads as
/// possible (spec.md §4.6): a run of GD entries is coalesced whenever
/// the next GT's file sector immediately follows the previous one's
/// last sector, which holds for every file this codec's own writer
/// produces (`prefillGD` lays GTs out contiguously) and for any other
/// producer that does the same.
fn load_gt_entries(file: &File, geometry: &Geometry, gd: &[u32]) -> Result<Vec<u32>> {
    let mut gt_entries = vec![0u32; (geometry.num_gts * geometry.num_gtes_per_gt as u64) as usize];
    if geometry.num_gts == 0 {
        return Ok(gt_entries);
    }

    let gt_sectors = geometry.gt_sectors;
    let gtes_per_gt = geometry.num_gtes_per_gt as usize;

    // A pending coalesced run: (file sector of its first GT, number of
    // GTs covered so far, index into gt_entries of its first GT).
    let mut pending: Option<(u64, u64, usize)> = None;

    let mut flush = |pending: &mut Option<(u64, u64, usize)>, gt_entries: &mut [u32]| -> Result<()> {
        if let Some((file_sector, count, dest_index)) = pending.take() {
            let byte_len = (count * gt_sectors * SECTOR_SIZE) as usize;
            let mut buf = vec![0u8; byte_len];
            pread_exact_at(file, &mut buf, file_sector * SECTOR_SIZE)?;
            for (i, slot) in gt_entries[dest_index..dest_index + count as usize * gtes_per_gt].iter_mut().enumerate() {
                *slot = load_u32_le(&buf, i * 4);
            }
        }
        Ok(())
    };

    for i in 0..geometry.num_gts as usize {
        let gde = gd[i];
        if gde == 0 {
            flush(&mut pending, &mut gt_entries)?;
            continue;
        }

        let dest_index = i * gtes_per_gt;
        let file_sector = gde as u64;

        match pending {
            Some((start_sector, count, start_dest))
                if start_sector + count * gt_sectors == file_sector && start_dest + count as usize * gtes_per_gt == dest_index =>
            {
                pending = Some((start_sector, count + 1, start_dest));
            }
            _ => {
                flush(&mut pending, &mut gt_entries)?;
                pending = Some((file_sector, 1, dest_index));
            }
        }
    }
    flush(&mut pending, &mut gt_entries)?;

    Ok(gt_entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmdk::writer::{CreateOptions, Writer};

    fn small_options() -> CreateOptions {
        CreateOptions {
            grain_size_sectors: 8,
            num_gtes_per_gt: 128,
            compression_level: 6,
        }
    }

    #[test]
    fn round_trips_a_single_grain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vmdk");
        let mut writer = Writer::create(&path, 4096, small_options()).unwrap();
        let data: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        writer.pwrite(&data, 0).unwrap();
        writer.close().unwrap();

        let reader = Reader::open(&path).unwrap();
        assert_eq!(reader.capacity(), 4096);
        let mut out = vec![0u8; 4096];
        reader.pread(&mut out, 0).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn holes_read_back_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vmdk");
        let writer = Writer::create(&path, 4096, small_options()).unwrap();
        writer.close().unwrap();

        let reader = Reader::open(&path).unwrap();
        let mut out = vec![0xFFu8; 4096];
        reader.pread(&mut out, 0).unwrap();
        assert_eq!(out, vec![0u8; 4096]);

        assert!(reader.next_data(0).is_err());
    }

    #[test]
    fn next_data_skips_holes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vmdk");
        let mut writer = Writer::create(&path, 4 * 4096, small_options()).unwrap();
        writer.pwrite(&[7u8; 4096], 2 * 4096).unwrap();
        writer.close().unwrap();

        let reader = Reader::open(&path).unwrap();
        let (start, end) = reader.next_data(0).unwrap();
        assert_eq!(start, 2 * 4096);
        assert_eq!(end, 3 * 4096);
    }

    #[test]
    fn rejects_lowercase_magic_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vmdk");
        std::fs::write(&path, vec![0u8; 512]).unwrap();
        assert!(Reader::open(&path).is_err());
    }

    #[test]
    fn tail_grain_reads_back_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vmdk");
        let capacity = 100 * SECTOR_SIZE;
        let mut writer = Writer::create(&path, capacity, small_options()).unwrap();
        let data: Vec<u8> = (0u8..=255).cycle().take(capacity as usize).collect();
        writer.pwrite(&data, 0).unwrap();
        writer.close().unwrap();

        let reader = Reader::open(&path).unwrap();
        let mut out = vec![0u8; capacity as usize];
        reader.pread(&mut out, 0).unwrap();
        assert_eq!(out, data);

        let mut tail = vec![0u8; 1];
        reader.pread(&mut tail, capacity - 1).unwrap();
        assert_eq!(tail[0], data[data.len() - 1]);
    }
}
