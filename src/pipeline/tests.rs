// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{fs, io::Write, path::Path};

use byteorder::{LittleEndian, WriteBytesExt};
use tempfile::{tempdir, TempDir};

use super::*;
use crate::{
    io::read::FileSource,
    params::{tests::test_params, PolarizationMode, SampleWidth},
};

const NUM_CHANNELS: usize = 64;
const BLOCK_LENGTH: usize = 256;
/// 2^-10 s, so that a quarter of a second is exactly 256 samples.
const SAMPLING_INTERVAL: f64 = 0.0009765625;

/// A sample that varies in time and frequency, but whose average over all 64
/// channels only takes 3 nearby values.
fn background(t: usize, c: usize) -> i32 {
    ((7 * t + 13 * c) % 21) as i32 - 10
}

fn intensity_params(dir: &TempDir) -> RunParameters {
    let mut params = test_params(dir.path());
    params.num_channels = NUM_CHANNELS;
    params.start_channel = 0;
    params.stop_channel = NUM_CHANNELS;
    params.sampling_interval = SAMPLING_INTERVAL;
    params.block_duration = 0.25;
    params.chan_flagging = None;
    params
}

/// Write `num_samples` u16 samples of background around 1000, with a bright
/// transient in every channel of `transient_at`.
fn write_intensity_file(path: &Path, num_samples: usize, transient_at: usize) {
    let mut file = fs::File::create(path).unwrap();
    for t in 0..num_samples {
        for c in 0..NUM_CHANNELS {
            let extra = if t == transient_at { 500 } else { 0 };
            file.write_u16::<LittleEndian>((1000 + background(t, c) + extra) as u16)
                .unwrap();
        }
    }
    file.flush().unwrap();
}

fn run(params: &RunParameters, observer: &mut dyn BlockObserver) -> RunSummary {
    let input = match &params.source {
        crate::params::SourceKind::File(f) => f.clone(),
        crate::params::SourceKind::Ring(_) => unreachable!(),
    };
    let mut source = FileSource::new(
        &input,
        params.start_time,
        params.sampling_interval,
        params.bytes_per_time_sample(),
    )
    .unwrap();
    let writer = OutputWriter::new(params).unwrap();
    let cancel = AtomicCell::new(false);
    Pipeline::new(params)
        .run(&mut source, writer, observer, &cancel, None)
        .unwrap()
}

#[derive(Default)]
struct Recorder {
    indices: Vec<usize>,
    time_flags: Vec<Vec<bool>>,
    folded: Vec<bool>,
}

impl BlockObserver for Recorder {
    fn block_finished(&mut self, packet: &Packet, profiles: Option<&[Profile]>) {
        self.indices.push(packet.index);
        self.time_flags.push(packet.pols[0].time_flags.flags.clone());
        self.folded.push(profiles.is_some() && packet.pols[0].fold_start.is_some());
    }
}

#[test]
fn test_transient_is_flagged_in_its_block_only() {
    let dir = tempdir().unwrap();
    let params = intensity_params(&dir);
    let input = dir.path().join("input.raw");
    write_intensity_file(&input, 3 * BLOCK_LENGTH, BLOCK_LENGTH + 100);

    let mut recorder = Recorder::default();
    let summary = run(&params, &mut recorder);
    assert_eq!(
        summary,
        RunSummary {
            // The input is exactly 3 blocks; the empty fourth block is dropped.
            blocks_written: 3,
            samples_consumed: 3 * BLOCK_LENGTH as u64,
            interrupted: false,
        }
    );
    assert_eq!(recorder.indices, [0, 1, 2]);
    assert_eq!(recorder.folded, [true, true, true]);
    for (i, flags) in recorder.time_flags.iter().enumerate() {
        let flagged: Vec<usize> = (0..flags.len()).filter(|&t| flags[t]).collect();
        if i == 1 {
            assert_eq!(flagged, [100]);
        } else {
            assert!(flagged.is_empty(), "block {i} has flags {flagged:?}");
        }
    }

    let timeflags = fs::read(dir.path().join("timeflag.gpt")).unwrap();
    assert_eq!(timeflags.len(), 3 * BLOCK_LENGTH);
    let flagged: Vec<usize> = (0..timeflags.len()).filter(|&t| timeflags[t] == 1).collect();
    assert_eq!(flagged, [BLOCK_LENGTH + 100]);

    // Nothing is delayed at zero DM, so every sample is folded.
    let series = fs::read(dir.path().join("fullDM_filtered.gpt")).unwrap();
    assert_eq!(series.len(), 3 * BLOCK_LENGTH * 4);
    let profile = fs::read_to_string(dir.path().join("profile_filtered.gpt")).unwrap();
    assert_eq!(profile.lines().count(), 1 + params.profile_bins);
    let bandshape = fs::read_to_string(dir.path().join("bandshape.gpt")).unwrap();
    assert_eq!(bandshape.lines().count(), 1 + NUM_CHANNELS);
    let stats = fs::read_to_string(dir.path().join("stats.gpt")).unwrap();
    assert_eq!(stats.lines().count(), 4);
}

#[test]
fn test_filtering_only() {
    let dir = tempdir().unwrap();
    let mut params = intensity_params(&dir);
    params.dedisperse = false;
    params.outputs.filtered_data = Some(dir.path().join("filtered.gpt"));
    let input = dir.path().join("input.raw");
    write_intensity_file(&input, 2 * BLOCK_LENGTH + 10, 5);

    let mut recorder = Recorder::default();
    let summary = run(&params, &mut recorder);
    // The short last block is processed like any other.
    assert_eq!(summary.blocks_written, 3);
    assert_eq!(recorder.folded, [false, false, false]);
    assert_eq!(recorder.time_flags[2].len(), 10);

    let grid = fs::read(dir.path().join("filtered.gpt")).unwrap();
    assert_eq!(grid.len(), (2 * BLOCK_LENGTH + 10) * NUM_CHANNELS * 2);
    // The transient was replaced with zeros.
    let transient = &grid[5 * NUM_CHANNELS * 2..6 * NUM_CHANNELS * 2];
    assert!(transient.iter().all(|&b| b == 0));
    assert!(!dir.path().join("fullDM_filtered.gpt").exists());
    assert!(!dir.path().join("profile_filtered.gpt").exists());
}

/// Cancels the run once `after` blocks have been seen.
struct Canceller<'a> {
    cancel: &'a AtomicCell<bool>,
    after: usize,
    seen: Vec<usize>,
}

impl BlockObserver for Canceller<'_> {
    fn block_finished(&mut self, packet: &Packet, _profiles: Option<&[Profile]>) {
        self.seen.push(packet.index);
        if self.seen.len() == self.after {
            self.cancel.store(true);
        }
    }
}

#[test]
fn test_interrupt_writes_whole_blocks() {
    let dir = tempdir().unwrap();
    let params = intensity_params(&dir);
    let input = dir.path().join("input.raw");
    write_intensity_file(&input, 20 * BLOCK_LENGTH, 0);

    let mut source =
        FileSource::new(&input, 0.0, SAMPLING_INTERVAL, params.bytes_per_time_sample()).unwrap();
    let writer = OutputWriter::new(&params).unwrap();
    let cancel = AtomicCell::new(false);
    let mut canceller = Canceller {
        cancel: &cancel,
        after: 2,
        seen: vec![],
    };
    let summary = Pipeline::new(&params)
        .run(&mut source, writer, &mut canceller, &cancel, Some(20))
        .unwrap();

    assert!(summary.interrupted);
    assert!(summary.blocks_written >= 2);
    assert!(summary.blocks_written < 20);
    let expected: Vec<usize> = (0..summary.blocks_written).collect();
    assert_eq!(canceller.seen, expected);

    let timeflags = fs::read(dir.path().join("timeflag.gpt")).unwrap();
    assert_eq!(timeflags.len(), summary.blocks_written * BLOCK_LENGTH);
    let bandshape = fs::read_to_string(dir.path().join("bandshape.gpt")).unwrap();
    assert_eq!(bandshape.lines().count(), 1 + NUM_CHANNELS);
}

#[test]
fn test_full_polarisation_flags_are_shared() {
    let dir = tempdir().unwrap();
    let mut params = intensity_params(&dir);
    params.polarization = PolarizationMode::Full;
    params.sample_width = SampleWidth::Int8;
    params.block_duration = 64.0 * SAMPLING_INTERVAL;

    // The transient is only in the first polarisation. The second and fourth
    // are flat.
    let input = dir.path().join("input.raw");
    let mut file = fs::File::create(&input).unwrap();
    for t in 0..128 {
        for c in 0..NUM_CHANNELS {
            let p = background(t, c) + if t == 40 { 100 } else { 0 };
            let r = background(t, c);
            file.write_all(&[p as i8 as u8, 3, r as i8 as u8, 3]).unwrap();
        }
    }
    file.flush().unwrap();
    drop(file);

    let summary = run(&params, &mut BlockLogger);
    assert_eq!(summary.blocks_written, 2);
    for k in 1..=4 {
        let flags = fs::read(dir.path().join(format!("timeflag{k}.gpt"))).unwrap();
        let flagged: Vec<usize> = (0..flags.len()).filter(|&t| flags[t] == 1).collect();
        assert_eq!(flagged, [40], "polarisation {k}");
        assert!(dir.path().join(format!("profile_filtered{k}.gpt")).exists());
    }
}

#[test]
fn test_time_first_uses_time_flags_for_the_bandshape() {
    let dir = tempdir().unwrap();
    let mut params = intensity_params(&dir);
    params.flag_order = crate::params::FlagOrder::TimeFirst;
    params.chan_flagging = Some(crate::params::ChannelFlagging {
        selection: crate::params::BandshapeSelection::Mean,
        algorithm: crate::params::FlagAlgorithm::Mad,
        cutoff: 1e6,
    });
    let input = dir.path().join("input.raw");
    write_intensity_file(&input, BLOCK_LENGTH, 100);

    run(&params, &mut BlockLogger);

    // The transient was flagged before the bandshape was formed, so every
    // channel's mean is the background mean.
    let summary = fs::read_to_string(dir.path().join("intensity_summary.gpt")).unwrap();
    let line = summary.lines().nth(1).unwrap();
    let values: Vec<f32> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse().unwrap())
        .collect();
    assert_eq!(values.len(), NUM_CHANNELS);
    for (c, v) in values.into_iter().enumerate() {
        let expected: f32 = (0..BLOCK_LENGTH)
            .filter(|&t| t != 100)
            .map(|t| (1000 + background(t, c)) as f32)
            .sum::<f32>()
            / (BLOCK_LENGTH - 1) as f32;
        assert!((v - expected).abs() < 1e-3, "channel {c}: {v} vs {expected}");
    }
}

#[test]
fn test_time_first_smooth_bandshape_replacement_uses_the_block_bandshape() {
    let dir = tempdir().unwrap();
    let mut params = intensity_params(&dir);
    params.flag_order = crate::params::FlagOrder::TimeFirst;
    params.chan_flagging = Some(crate::params::ChannelFlagging {
        selection: crate::params::BandshapeSelection::Normalized,
        algorithm: crate::params::FlagAlgorithm::Mad,
        cutoff: 1e6,
    });
    params.replacement = crate::params::ReplacementPolicy::SmoothBandshape;
    params.gain = 1.0;
    let grid_file = dir.path().join("filtered.gpt");
    params.outputs.filtered_data = Some(grid_file.clone());
    let input = dir.path().join("input.raw");
    write_intensity_file(&input, BLOCK_LENGTH, 100);

    let mut recorder = Recorder::default();
    let summary = run(&params, &mut recorder);
    assert_eq!(summary.blocks_written, 1);
    assert!(recorder.time_flags[0][100]);

    // The channel stage hasn't run when the grid is formed, so the transient
    // is replaced with each channel's mean over the unflagged samples.
    let grid: Vec<i16> = fs::read(&grid_file)
        .unwrap()
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();
    assert_eq!(grid.len(), BLOCK_LENGTH * NUM_CHANNELS);
    for c in 0..NUM_CHANNELS {
        let mean: f32 = (0..BLOCK_LENGTH)
            .filter(|&t| t != 100)
            .map(|t| (1000 + background(t, c)) as f32)
            .sum::<f32>()
            / (BLOCK_LENGTH - 1) as f32;
        let replaced = grid[100 * NUM_CHANNELS + c];
        assert!((f32::from(replaced) - mean).abs() <= 0.5, "channel {c}: {replaced} vs {mean}");
        assert_eq!(grid[c], (1000 + background(0, c)) as i16);
    }
}

#[test]
fn test_zero_dm_subtraction_without_channel_flagging() {
    let dir = tempdir().unwrap();
    let mut params = intensity_params(&dir);
    assert!(params.chan_flagging.is_none());
    params.zero_dm_subtraction = true;
    let input = dir.path().join("input.raw");
    write_intensity_file(&input, 2 * BLOCK_LENGTH, 300);

    let mut recorder = Recorder::default();
    let summary = run(&params, &mut recorder);
    assert_eq!(summary.blocks_written, 2);
    let flagged: Vec<usize> = recorder
        .time_flags
        .concat()
        .into_iter()
        .enumerate()
        .filter(|(_, f)| *f)
        .map(|(t, _)| t)
        .collect();
    assert_eq!(flagged, [300]);
    assert!(dir.path().join("profile_filtered.gpt").exists());
}
