//! Per-grain DEFLATE compression (writer side) and the matching inflate
//! context (reader side).
//!
//! Both contexts are reset-and-reused rather than rebuilt per grain
//! (spec.md §9: "do not allocate a fresh context per grain"), and both
//! buffers are sized once up front so neither side ever reallocates
//! mid-stream (spec.md §9: "No `realloc`").

use crate::error::{Error, Result};
use crate::vmdk::layout::{round_up_to_sector, store_u32_le, store_u64_le, SECTOR_SIZE};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// 12-byte embedded-LBA grain record header: `{ lba: LE64, cmpSize: LE32 }`.
const GRAIN_HEADER_LEN: usize = 12;

/// `deflate_bound(n)`, a conservative upper bound on the compressed size
/// of an `n`-byte input (matches zlib's `deflateBound`: input size plus
/// ~0.1% plus a fixed slop for stored-block headers).
fn deflate_bound(input_len: usize) -> usize {
    input_len + (input_len >> 12) + (input_len >> 14) + (input_len >> 25) + 13
}

/// Per-grain compressor: one grain-sized input buffer, one output
/// buffer sized to the worst case compressed length, and a reusable
/// `flate2::Compress` stream.
pub struct Compressor {
    compress: Compress,
    grain_nr: u64,
    input: Vec<u8>,
    valid_end: usize,
    output: Vec<u8>,
}

impl Compressor {
    pub fn new(grain_size_bytes: usize, level: u32) -> Self {
        let output_cap = round_up_to_sector((deflate_bound(grain_size_bytes) + GRAIN_HEADER_LEN) as u64) as usize;
        Self {
            compress: Compress::new(Compression::new(level), false),
            grain_nr: u64::MAX,
            input: vec![0u8; grain_size_bytes],
            valid_end: 0,
            output: vec![0u8; output_cap],
        }
    }

    /// `~0` ("none") is represented as `u64::MAX`.
    pub const NO_GRAIN: u64 = u64::MAX;

    pub fn current_grain(&self) -> u64 {
        self.grain_nr
    }

    pub fn is_empty(&self) -> bool {
        self.grain_nr == Self::NO_GRAIN || self.valid_end == 0
    }

    /// Marks the buffer as belonging to `grain_nr` with an empty valid
    /// range. The underlying buffer is zeroed so any byte range never
    /// touched by `copy_in` reads back as zero, which is what `fill`
    /// relies on.
    pub fn reset(&mut self, grain_nr: u64) {
        self.grain_nr = grain_nr;
        self.valid_end = 0;
        self.input.fill(0);
    }

    /// Copies `data` into the grain buffer at `offset`, growing the
    /// valid range to cover it.
    pub fn copy_in(&mut self, offset: usize, data: &[u8]) {
        self.input[offset..offset + data.len()].copy_from_slice(data);
        self.valid_end = self.valid_end.max(offset + data.len());
    }

    /// Zero-pads (conceptually — the buffer is already zero outside
    /// what `copy_in` has touched) the valid range out to
    /// `expected_len`, so the next `deflate` call covers the whole
    /// grain rather than just the bytes a partial write touched.
    pub fn fill(&mut self, expected_len: usize) {
        self.valid_end = self.valid_end.max(expected_len);
    }

    /// Whether the grain, as filled so far, is entirely zero — such a
    /// grain is written as a hole rather than compressed.
    pub fn is_all_zero(&self, len: usize) -> bool {
        crate::vmdk::layout::is_all_zero(&self.input[..len])
    }

    /// Runs the grain's `[0, len)` bytes through DEFLATE in one shot
    /// (`Z_FINISH`) and returns the compressed bytes.
    pub fn deflate(&mut self, len: usize) -> Result<&[u8]> {
        self.compress.reset();
        let before_out = self.compress.total_out();
        let status = self
            .compress
            .compress(&self.input[..len], &mut self.output, FlushCompress::Finish)
            .map_err(|e| Error::vmdk(format!("deflate failed: {e}")))?;
        if status != Status::StreamEnd {
            return Err(Error::vmdk(
                "deflate did not reach Z_STREAM_END in one call (output buffer undersized?)",
            ));
        }
        let produced = (self.compress.total_out() - before_out) as usize;
        Ok(&self.output[..produced])
    }

    /// Assembles the on-disk embedded-LBA grain record: 12-byte header
    /// + compressed payload, zero-padded to a sector boundary.
    pub fn assemble_record(lba: u64, compressed: &[u8]) -> Vec<u8> {
        let total = round_up_to_sector((GRAIN_HEADER_LEN + compressed.len()) as u64) as usize;
        let mut record = vec![0u8; total];
        store_u64_le(&mut record, 0, lba);
        store_u32_le(&mut record, 8, compressed.len() as u32);
        record[GRAIN_HEADER_LEN..GRAIN_HEADER_LEN + compressed.len()].copy_from_slice(compressed);
        record
    }
}

/// Per-grain inflate context, mirroring `Compressor` on the read side.
pub struct Inflater {
    decompress: Decompress,
    scratch: Vec<u8>,
}

impl Inflater {
    pub fn new(grain_size_bytes: usize) -> Self {
        Self {
            decompress: Decompress::new(false),
            scratch: vec![0u8; grain_size_bytes],
        }
    }

    /// Inflates `compressed` and returns the produced bytes. Resets the
    /// stream for the next grain regardless of outcome.
    pub fn inflate(&mut self, compressed: &[u8]) -> Result<&[u8]> {
        self.decompress.reset(false);
        let before_out = self.decompress.total_out();
        let status = self
            .decompress
            .decompress(compressed, &mut self.scratch, FlushDecompress::Finish)
            .map_err(|e| Error::integrity(format!("inflate failed: {e}")))?;
        let produced = (self.decompress.total_out() - before_out) as usize;
        if status != Status::StreamEnd {
            return Err(Error::integrity("inflate did not reach Z_STREAM_END"));
        }
        Ok(&self.scratch[..produced])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_random_grain() {
        let grain_size = 64 * 1024;
        let mut compressor = Compressor::new(grain_size, 6);
        compressor.reset(0);
        let mut data = vec![0u8; grain_size];
        for (i, b) in data.iter_mut().enumerate() {
            *b = ((i * 37 + 11) % 256) as u8;
        }
        compressor.copy_in(0, &data);
        compressor.fill(grain_size);
        assert!(!compressor.is_all_zero(grain_size));
        let compressed = compressor.deflate(grain_size).unwrap().to_vec();

        let mut inflater = Inflater::new(grain_size);
        let out = inflater.inflate(&compressed).unwrap();
        assert_eq!(out, &data[..]);
    }

    #[test]
    fn all_zero_grain_detected() {
        let grain_size = 64 * 1024;
        let mut compressor = Compressor::new(grain_size, 6);
        compressor.reset(3);
        compressor.fill(grain_size);
        assert!(compressor.is_all_zero(grain_size));
    }

    #[test]
    fn assembled_record_is_sector_aligned() {
        let record = Compressor::assemble_record(128, &[1, 2, 3]);
        assert_eq!(record.len() % SECTOR_SIZE as usize, 0);
        assert_eq!(&record[0..8], &128u64.to_le_bytes());
        assert_eq!(&record[8..12], &3u32.to_le_bytes());
        assert_eq!(&record[12..15], &[1, 2, 3]);
    }

    #[test]
    fn reused_context_does_not_leak_state_between_grains() {
        let grain_size = 4096;
        let mut compressor = Compressor::new(grain_size, 6);
        let mut inflater = Inflater::new(grain_size);

        for g in 0..3u8 {
            compressor.reset(g as u64);
            let data = vec![g; grain_size];
            compressor.copy_in(0, &data);
            compressor.fill(grain_size);
            let compressed = compressor.deflate(grain_size).unwrap().to_vec();
            let out = inflater.inflate(&compressed).unwrap();
            assert_eq!(out, &data[..]);
        }
    }
}
