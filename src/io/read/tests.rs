// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::io::Write;

use approx::assert_abs_diff_eq;
use byteorder::{LittleEndian, WriteBytesExt};
use ndarray::prelude::*;
use tempfile::NamedTempFile;

use super::*;

/// 2 channels of u16 samples; the value of each sample is 10 * time + chan.
fn make_u16_file(num_samples: usize) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    for t in 0..num_samples {
        for c in 0..2 {
            file.write_u16::<LittleEndian>((10 * t + c) as u16).unwrap();
        }
    }
    file.flush().unwrap();
    file
}

#[test]
fn test_block_lengths_carry_the_fraction() {
    let lengths: Vec<usize> = BlockLengths::new(2.25, 1.0).take(8).collect();
    assert_eq!(lengths, [2, 2, 2, 3, 2, 2, 2, 3]);

    let lengths: Vec<usize> = BlockLengths::new(4.0, 1.0).take(3).collect();
    assert_eq!(lengths, [4, 4, 4]);
}

#[test]
fn test_file_source_reads_until_the_end() {
    let file = make_u16_file(5);
    let mut source = FileSource::new(file.path(), 0.0, 1.0, 4).unwrap();

    let a = source.acquire(0, 2).unwrap();
    assert!(!a.end_of_stream);
    assert_eq!(a.block.num_samples, 2);
    assert_eq!(a.block.bytes.len(), 8);

    let a = source.acquire(1, 2).unwrap();
    assert!(!a.end_of_stream);
    assert_eq!(a.block.index, 1);

    let a = source.acquire(2, 2).unwrap();
    assert!(a.end_of_stream);
    assert_eq!(a.block.num_samples, 1);
    let data = deinterleave(
        &a.block,
        2,
        SampleWidth::Int16,
        PolarizationMode::Intensity,
    );
    assert_abs_diff_eq!(data[0], array![[40.0, 41.0]]);
    assert_eq!(source.samples_consumed(), 5);
    assert!(!source.is_live());
}

#[test]
fn test_file_source_exact_end_gives_an_empty_block() {
    let file = make_u16_file(4);
    let mut source = FileSource::new(file.path(), 0.0, 1.0, 4).unwrap();
    assert!(!source.acquire(0, 2).unwrap().end_of_stream);
    assert!(!source.acquire(1, 2).unwrap().end_of_stream);
    let a = source.acquire(2, 2).unwrap();
    assert!(a.end_of_stream);
    assert_eq!(a.block.num_samples, 0);
}

#[test]
fn test_file_source_skips_the_start_time() {
    let file = make_u16_file(6);
    // 2.5 samples in; the start is floored to a whole sample.
    let mut source = FileSource::new(file.path(), 0.25, 0.1, 4).unwrap();
    assert_eq!(source.samples_remaining(), 4);
    let a = source.acquire(0, 1).unwrap();
    let data = deinterleave(
        &a.block,
        2,
        SampleWidth::Int16,
        PolarizationMode::Intensity,
    );
    assert_abs_diff_eq!(data[0], array![[20.0, 21.0]]);
}

#[test]
fn test_file_source_errors() {
    let empty = NamedTempFile::new().unwrap();
    let result = FileSource::new(empty.path(), 0.0, 1.0, 4);
    assert!(matches!(result, Err(BlockReadError::EmptyFile(_))));

    let file = make_u16_file(3);
    let result = FileSource::new(file.path(), 10.0, 1.0, 4);
    match result {
        Err(BlockReadError::StartBeyondEnd {
            start_time,
            duration,
        }) => {
            assert_abs_diff_eq!(start_time, 10.0);
            assert_abs_diff_eq!(duration, 3.0);
        }
        Err(e) => panic!("Unexpected error: {e}"),
        Ok(_) => panic!("Expected an error"),
    }
}

#[test]
fn test_deinterleave_full_polarisation_is_signed() {
    // 1 time sample, 2 channels, 4 pols.
    let bytes: Vec<u8> = [1i8, -2, 3, -4, 5, -6, 7, -8]
        .iter()
        .map(|&v| v as u8)
        .collect();
    let block = RawBlock {
        index: 0,
        num_samples: 1,
        bytes,
    };
    let data = deinterleave(&block, 2, SampleWidth::Int8, PolarizationMode::Full);
    assert_eq!(data.len(), 4);
    assert_abs_diff_eq!(data[0], array![[1.0, 5.0]]);
    assert_abs_diff_eq!(data[1], array![[-2.0, -6.0]]);
    assert_abs_diff_eq!(data[2], array![[3.0, 7.0]]);
    assert_abs_diff_eq!(data[3], array![[-4.0, -8.0]]);

    // The same bytes as total intensity are unsigned.
    let block = RawBlock {
        index: 0,
        num_samples: 4,
        bytes: block.bytes,
    };
    let data = deinterleave(&block, 2, SampleWidth::Int8, PolarizationMode::Intensity);
    assert_abs_diff_eq!(data[0][(0, 1)], 254.0);
}

#[test]
fn test_deinterleave_floats() {
    let mut bytes = vec![];
    for v in [0.5f32, -1.5, 2.25, 1e6] {
        bytes.write_f32::<LittleEndian>(v).unwrap();
    }
    let block = RawBlock {
        index: 3,
        num_samples: 2,
        bytes,
    };
    let data = deinterleave(
        &block,
        2,
        SampleWidth::Float32,
        PolarizationMode::Intensity,
    );
    assert_abs_diff_eq!(data[0], array![[0.5, -1.5], [2.25, 1e6]]);
}

/// Records of 2 time samples of 2 channels of u8; every byte of record `i` is
/// `i + 1`.
fn record(i: u8) -> Vec<u8> {
    vec![i + 1; 4]
}

#[test]
fn test_ring_source_reads_across_records() {
    let mut image = RingImage::new(4, 4);
    image.set_running(false);
    image.set_current(0, 0);
    for i in 0..3 {
        image.fill_record(i, i as u64, &record(i as u8));
    }
    let mut source = RingSource::new(image.into_ring(), "test".to_string(), 2, 1).unwrap();
    assert!(source.is_live());

    let a = source.acquire(0, 3).unwrap();
    assert!(!a.end_of_stream);
    assert_eq!(a.block.bytes, [1, 1, 1, 1, 2, 2]);

    let a = source.acquire(1, 3).unwrap();
    assert!(!a.end_of_stream);
    assert_eq!(a.block.bytes, [2, 2, 3, 3, 3, 3]);

    // Record 3 was never written and the writer has stopped.
    let a = source.acquire(2, 3).unwrap();
    assert!(a.end_of_stream);
    assert_eq!(a.block.num_samples, 0);
    assert_eq!(source.samples_consumed(), 6);
}

#[test]
fn test_ring_source_does_not_reread_stale_records() {
    let mut image = RingImage::new(4, 4);
    image.set_running(false);
    image.set_current(0, 0);
    for i in 0..4 {
        image.fill_record(i, i as u64, &record(i as u8));
    }
    let mut source = RingSource::new(image.into_ring(), "test".to_string(), 2, 1).unwrap();

    let a = source.acquire(0, 3).unwrap();
    assert!(!a.end_of_stream);
    // Only 8 samples were ever written; after wrapping around, record 0 is
    // old.
    let a = source.acquire(1, 10).unwrap();
    assert!(a.end_of_stream);
    assert_eq!(a.block.num_samples, 5);
    assert_eq!(a.block.bytes, [2, 2, 3, 3, 3, 3, 4, 4, 4, 4]);
}

#[test]
fn test_ring_source_catches_up_with_the_writer() {
    let mut image = RingImage::new(4, 4);
    image.set_running(false);
    // The writer is at sequence number 10, but record 0 is from sequence
    // number 7, so it is about to be overwritten.
    image.set_current(0, 10);
    image.fill_record(0, 7, &record(0));
    image.fill_record(1, 8, &record(1));
    image.fill_record(2, 9, &record(2));
    image.fill_record(3, 6, &record(3));
    let mut source = RingSource::new(image.into_ring(), "test".to_string(), 2, 1).unwrap();

    let a = source.acquire(0, 4).unwrap();
    assert!(!a.end_of_stream);
    assert_eq!(a.block.bytes, [2, 2, 2, 2, 3, 3, 3, 3]);

    let a = source.acquire(1, 4).unwrap();
    assert!(a.end_of_stream);
    assert_eq!(a.block.num_samples, 0);
}

#[test]
fn test_ring_source_rejects_bad_headers() {
    let result = RingSource::new(MemoryRing(vec![0; 10]), "tiny".to_string(), 2, 1);
    assert!(matches!(
        result,
        Err(BlockReadError::RingTooSmall { size: 10, .. })
    ));

    // No records.
    let result = RingSource::new(MemoryRing(vec![0; 64]), "empty".to_string(), 2, 1);
    assert!(matches!(result, Err(BlockReadError::BadRingHeader { .. })));

    // 3 data bytes per record can't hold 2-byte samples.
    let image = RingImage::new(2, 3);
    let result = RingSource::new(image.into_ring(), "odd".to_string(), 4, 2);
    assert!(matches!(
        result,
        Err(BlockReadError::RecordSampleMismatch {
            record_bytes: 3,
            sample_bytes: 2
        })
    ));
}
