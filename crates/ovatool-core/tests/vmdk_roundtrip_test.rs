//! End-to-end coverage of the stream-optimized VMDK codec's public
//! surface: writing a disk through both the single-threaded and
//! parallel paths, then reading it back.

use ovatool_core::vmdk::{copy_disk, CreateOptions, FileSourceDisk, Reader, SourceDisk, Writer};
use std::io::Write as _;

fn options() -> CreateOptions {
    CreateOptions {
        grain_size_sectors: 8, // 4 KiB grains, small enough to exercise many grains in small tests
        num_gtes_per_gt: 128,
        compression_level: 6,
    }
}

fn patterned_source(len: usize) -> (tempfile::NamedTempFile, FileSourceDisk) {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0u8..=255).cycle().take(len).collect();
    file.write_all(&data).unwrap();
    file.flush().unwrap();
    let disk = FileSourceDisk::open(file.path()).unwrap();
    (file, disk)
}

#[test]
fn round_trip_preserves_every_byte() {
    let (_src, source) = patterned_source(1024 * 1024);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.vmdk");

    let mut writer = Writer::create(&path, source.capacity(), options()).unwrap();
    copy_disk(&mut writer, &source, 1, None).unwrap();
    writer.close().unwrap();

    let reader = Reader::open(&path).unwrap();
    let mut out = vec![0u8; source.capacity() as usize];
    reader.pread(&mut out, 0).unwrap();

    let mut expected = vec![0u8; source.capacity() as usize];
    source.pread(&mut expected, 0).unwrap();
    assert_eq!(out, expected);
}

#[test]
fn holes_and_forced_zero_grains_read_back_identically() {
    // One grain that is never written (a true hole) and one grain
    // explicitly written as all zeros should be indistinguishable to a
    // reader.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.vmdk");
    let grain_bytes = 8 * 512usize;

    let mut writer = Writer::create(&path, (grain_bytes * 2) as u64, options()).unwrap();
    writer.pwrite(&vec![0u8; grain_bytes], grain_bytes as u64).unwrap();
    writer.close().unwrap();

    let reader = Reader::open(&path).unwrap();
    let mut hole = vec![0xFFu8; grain_bytes];
    reader.pread(&mut hole, 0).unwrap();
    let mut forced_zero = vec![0xFFu8; grain_bytes];
    reader.pread(&mut forced_zero, grain_bytes as u64).unwrap();

    assert_eq!(hole, vec![0u8; grain_bytes]);
    assert_eq!(forced_zero, vec![0u8; grain_bytes]);
}

#[test]
fn parallel_copy_output_matches_single_threaded_for_any_worker_count() {
    let (_src, source) = patterned_source(512 * 1024);
    let dir = tempfile::tempdir().unwrap();

    let mut outputs = Vec::new();
    for workers in [1usize, 2, 8] {
        let path = dir.path().join(format!("disk-{workers}.vmdk"));
        let mut writer = Writer::create(&path, source.capacity(), options()).unwrap();
        copy_disk(&mut writer, &source, workers, None).unwrap();
        writer.close().unwrap();

        let reader = Reader::open(&path).unwrap();
        let mut out = vec![0u8; source.capacity() as usize];
        reader.pread(&mut out, 0).unwrap();
        outputs.push(out);
    }

    assert!(outputs.windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn rewriting_a_written_grain_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.vmdk");
    let mut writer = Writer::create(&path, 8 * 512, options()).unwrap();

    writer.pwrite(&[1u8; 4096], 0).unwrap();
    writer.flush().unwrap();

    writer.pwrite(&[2u8; 4096], 0).unwrap();
    assert!(writer.flush().is_err());
}

#[test]
fn finalized_file_starts_with_canonical_magic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.vmdk");
    let writer = Writer::create(&path, 8 * 512, options()).unwrap();
    writer.close().unwrap();

    // A successfully finalized file must open cleanly — this fails if
    // the canonical (not scrambled) magic wasn't the one left behind.
    assert!(Reader::open(&path).is_ok());
}

#[test]
fn a_torn_double_write_is_rejected_by_a_fresh_reader() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.vmdk");
    let writer = Writer::create(&path, 8 * 512, options()).unwrap();
    writer.close().unwrap();

    // Simulate a crash between the scrambled and canonical header
    // writes by flipping the magic back to scrambled after the fact.
    use ovatool_core::vmdk::header::VMDK_MAGIC_SCRAMBLED;
    use std::os::unix::fs::FileExt;
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all_at(&VMDK_MAGIC_SCRAMBLED.to_le_bytes(), 0).unwrap();

    assert!(Reader::open(&path).is_err());
}

#[test]
fn next_data_never_reports_a_hole_grain_and_separates_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.vmdk");
    let grain_bytes = 8 * 512u64;

    // grains: [data][hole][data][hole]
    let mut writer = Writer::create(&path, grain_bytes * 4, options()).unwrap();
    writer.pwrite(&[9u8; 4096], 0).unwrap();
    writer.pwrite(&[9u8; 4096], grain_bytes * 2).unwrap();
    writer.close().unwrap();

    let reader = Reader::open(&path).unwrap();
    let (start, end) = reader.next_data(0).unwrap();
    assert_eq!((start, end), (0, grain_bytes));

    let (start, end) = reader.next_data(end).unwrap();
    assert_eq!((start, end), (grain_bytes * 2, grain_bytes * 3));

    assert!(reader.next_data(end).is_err());
}

#[test]
fn tail_grain_clips_reads_past_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.vmdk");
    let capacity = 100 * 512u64; // not aligned to an 8-sector grain
    let data: Vec<u8> = (0u8..=255).cycle().take(capacity as usize).collect();

    let mut writer = Writer::create(&path, capacity, options()).unwrap();
    writer.pwrite(&data, 0).unwrap();
    writer.close().unwrap();

    let reader = Reader::open(&path).unwrap();
    let mut out = vec![0u8; capacity as usize];
    reader.pread(&mut out, 0).unwrap();
    assert_eq!(out, data);

    // One byte past capacity is unreachable.
    let mut past_end = [0u8; 1];
    assert!(reader.pread(&mut past_end, capacity).is_err());
}

#[test]
fn a_read_straddling_the_tail_is_clipped_not_rejected() {
    // spec.md S3: capacity = 100 bytes, grainSize = 128 sectors, one
    // tail grain. `pread(99, 2)` starts one byte before the end of the
    // disk and asks for two bytes; it must succeed, returning just the
    // single byte that exists, rather than erroring because the second
    // byte isn't there.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.vmdk");
    let capacity = 100u64;
    let data: Vec<u8> = (0u8..=255).cycle().take(capacity as usize).collect();

    let mut writer = Writer::create(&path, capacity, options()).unwrap();
    writer.pwrite(&data, 0).unwrap();
    writer.close().unwrap();

    let reader = Reader::open(&path).unwrap();
    let mut buf = [0xFFu8; 2];
    let n = reader.pread(&mut buf, capacity - 1).unwrap();
    assert_eq!(n, 1);
    assert_eq!(buf[0], data[data.len() - 1]);
}
