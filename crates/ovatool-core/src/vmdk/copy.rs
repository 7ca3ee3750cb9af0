//! The parallel grain copy engine (spec.md §4.5): `N` worker threads
//! drain a shared grain cursor, each reading, compressing, and writing
//! whole grains independently. Exactly three small pieces of shared
//! state are synchronized — the next grain to claim, the next free
//! write sector, and a cooperative stop flag — and nothing else; no
//! file I/O ever happens while holding one of those locks.
//!
//! Built on `std::thread::scope` so workers can borrow the `Writer` and
//! `SourceDisk` for the duration of the copy instead of needing
//! `'static` bounds and an `Arc` around everything, the way a detached
//! thread pool would.

use crate::error::{Error, Result};
use crate::vmdk::compressor::Compressor;
use crate::vmdk::disk::SourceDisk;
use crate::vmdk::geometry::Geometry;
use crate::vmdk::layout::{bytes_to_sectors, pwrite_all_at};
use crate::vmdk::writer::Writer;
use std::fs::File;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

const STATE_RUNNING: u8 = 0;
const STATE_FAILED: u8 = 1;

/// Copies every grain of `source` into `writer` using `num_workers`
/// worker threads (clamped to at least 1), invoking `progress` as
/// `(grains_done, total_grains)` after each grain a worker finishes.
///
/// `writer` must be freshly created (no grains written yet) — the copy
/// engine takes over its write cursor and grain table directly rather
/// than going through `Writer::pwrite`.
pub fn copy_disk(
    writer: &mut Writer,
    source: &dyn SourceDisk,
    num_workers: usize,
    progress: Option<&(dyn Fn(u64, u64) + Sync)>,
) -> Result<()> {
    let num_workers = num_workers.max(1);
    let geometry = *writer.geometry();
    let total_grains = geometry.total_grains;
    let compression_level = writer.compression_level();

    if total_grains == 0 {
        return Ok(());
    }

    let (file, slab, cur_sp) = writer.split_for_parallel_copy();
    let grain_bytes = geometry.grain_size_bytes() as usize;

    let read_pos = Mutex::new(0u64);
    let write_sp = Mutex::new(*cur_sp);
    let slab_gate = Mutex::new(slab);
    let state = AtomicU8::new(STATE_RUNNING);
    let done_count = AtomicU64::new(0);
    let first_error: Mutex<Option<Error>> = Mutex::new(None);

    debug!(total_grains, num_workers, "starting parallel grain copy");

    std::thread::scope(|scope| {
        for worker_id in 0..num_workers {
            let read_pos = &read_pos;
            let write_sp = &write_sp;
            let slab_gate = &slab_gate;
            let state = &state;
            let done_count = &done_count;
            let first_error = &first_error;
            let file: &File = file;
            let geometry = geometry;

            scope.spawn(move || {
                let mut compressor = Compressor::new(grain_bytes, compression_level);
                let mut src_buf = vec![0u8; grain_bytes];

                loop {
                    if state.load(Ordering::Acquire) == STATE_FAILED {
                        return;
                    }

                    let grain_nr = {
                        let mut rp = read_pos.lock().unwrap();
                        if *rp >= total_grains {
                            return;
                        }
                        let g = *rp;
                        *rp += 1;
                        g
                    };

                    let result = copy_one_grain(
                        grain_nr,
                        &geometry,
                        source,
                        file,
                        &mut compressor,
                        &mut src_buf,
                        write_sp,
                        slab_gate,
                    );

                    match result {
                        Ok(()) => {
                            let done = done_count.fetch_add(1, Ordering::AcqRel) + 1;
                            if let Some(cb) = progress {
                                cb(done, total_grains);
                            }
                        }
                        Err(e) => {
                            warn!(worker_id, grain_nr, error = %e, "worker failed, signaling peers to stop");
                            *first_error.lock().unwrap() = Some(e);
                            state.store(STATE_FAILED, Ordering::Release);
                            return;
                        }
                    }
                }
            });
        }
    });

    let final_sp = *write_sp.lock().unwrap();
    *cur_sp = final_sp;

    if state.load(Ordering::Acquire) == STATE_FAILED {
        let err = first_error
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Error::vmdk("a copy worker failed"));
        return Err(err);
    }

    Ok(())
}

/// Reads, compresses, and (if non-zero) writes one grain. Everything
/// except the two brief lock sections (claiming a write sector, then
/// recording it in the grain table) runs outside any mutex.
#[allow(clippy::too_many_arguments)]
fn copy_one_grain(
    grain_nr: u64,
    geometry: &Geometry,
    source: &dyn SourceDisk,
    file: &File,
    compressor: &mut Compressor,
    src_buf: &mut [u8],
    write_sp: &Mutex<u64>,
    slab_gate: &Mutex<&mut crate::vmdk::geometry::GrainTableSlab>,
) -> Result<()> {
    let grain_len = geometry.grain_len(grain_nr) as usize;
    let grain_bytes = geometry.grain_size_bytes();
    let pos = grain_nr * grain_bytes;

    let readable = (source.capacity().saturating_sub(pos) as usize).min(grain_len);
    if readable > 0 {
        source.pread(&mut src_buf[..readable], pos)?;
    }
    if readable < grain_len {
        src_buf[readable..grain_len].fill(0);
    }

    compressor.reset(grain_nr);
    compressor.copy_in(0, &src_buf[..grain_len]);
    compressor.fill(grain_len);

    if compressor.is_all_zero(grain_len) {
        return Ok(());
    }

    let lba = grain_nr * geometry.grain_size_sectors;
    let compressed = compressor.deflate(grain_len)?.to_vec();
    let record = Compressor::assemble_record(lba, &compressed);
    let record_sectors = bytes_to_sectors(record.len() as u64);

    let sector = {
        let mut sp = write_sp.lock().unwrap();
        let s = *sp;
        *sp += record_sectors;
        s
    };

    pwrite_all_at(file, &record, sector * crate::vmdk::layout::SECTOR_SIZE)?;

    {
        let mut slab = slab_gate.lock().unwrap();
        slab.set_gt_entry(grain_nr, sector as u32);
    }

    Ok(())
}
