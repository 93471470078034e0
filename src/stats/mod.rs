// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-block statistics of filterbank data: bandshapes (instantaneous and
//! whole-run), zero-DM time series, data normalisation and the filtered 2D
//! grid.
//!
//! All per-channel vectors here are indexed by absolute channel number and
//! have an entry for every channel of the band; only the channels in the
//! analysis range are ever filled.


use std::{fmt, ops::Range};

use ndarray::prelude::*;

use crate::{constants::CUMULATIVE_SCALE, params::NormalizationSource};

/// The smallest and largest of a set of values, for block observers.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct Extrema {
    pub(crate) min: f32,
    pub(crate) max: f32,
}

impl Extrema {
    pub(crate) fn of<I: IntoIterator<Item = f32>>(values: I) -> Extrema {
        values
            .into_iter()
            .fold(None, |acc: Option<Extrema>, v| match acc {
                None => Some(Extrema { min: v, max: v }),
                Some(e) => Some(Extrema {
                    min: e.min.min(v),
                    max: e.max.max(v),
                }),
            })
            .unwrap_or_default()
    }
}

impl fmt::Display for Extrema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.min, self.max)
    }
}

/// Sums and sums of squares of each channel over the (unflagged) time samples
/// of a block.
#[derive(Debug, Clone)]
pub(crate) struct BandshapeSums {
    pub(crate) sum: Vec<f64>,
    pub(crate) sum_sq: Vec<f64>,

    /// The number of time samples that went into the sums.
    pub(crate) count: u64,
}

/// Sum each channel of `data` (`time × channel`) over time. Time samples
/// flagged in `time_flags` are skipped.
pub(crate) fn bandshape_sums(
    data: ArrayView2<f32>,
    channels: Range<usize>,
    time_flags: Option<&[bool]>,
) -> BandshapeSums {
    let num_channels = data.len_of(Axis(1));
    let mut sum = vec![0.0; num_channels];
    let mut sum_sq = vec![0.0; num_channels];
    let mut count = 0;
    for (i_time, samples) in data.outer_iter().enumerate() {
        if time_flags.map_or(false, |flags| flags[i_time]) {
            continue;
        }
        count += 1;
        for c in channels.clone() {
            let v = f64::from(samples[c]);
            sum[c] += v;
            sum_sq[c] += v * v;
        }
    }
    BandshapeSums { sum, sum_sq, count }
}

/// The mean of each channel over the unflagged time samples of a block. All
/// zero if every sample is flagged.
pub(crate) fn mean_bandshape(
    data: ArrayView2<f32>,
    channels: Range<usize>,
    time_flags: &[bool],
) -> Vec<f32> {
    let sums = bandshape_sums(data, channels, Some(time_flags));
    if sums.count == 0 {
        return vec![0.0; sums.sum.len()];
    }
    let n = sums.count as f64;
    sums.sum.iter().map(|&s| (s / n) as f32).collect()
}

/// Per-channel statistics of one polarisation of one block.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChannelStatistics {
    /// The mean of each channel.
    pub(crate) bandshape: Vec<f32>,

    /// The mean of each channel divided by its standard deviation.
    pub(crate) mean_to_rms: Vec<f32>,

    /// The whole-run smoothed bandshape (or the external reference). Only
    /// filled when it is needed; otherwise all zero.
    pub(crate) smooth: Vec<f32>,

    /// The block bandshape divided by the smoothed bandshape.
    pub(crate) normalized: Vec<f32>,

    pub(crate) bandshape_extrema: Extrema,
    pub(crate) mean_to_rms_extrema: Extrema,
    pub(crate) normalized_extrema: Extrema,

    /// The number of samples that the block bandshape is made from.
    pub(crate) samples_used: u64,

    /// Has `smooth` been filled?
    pub(crate) smoothed: bool,
}

/// Whole-run bandshape accumulators of one polarisation. Sums are scaled down
/// by [`CUMULATIVE_SCALE`] as they're added.
#[derive(Debug, Clone)]
pub(crate) struct CumulativeBandshape {
    pub(crate) sum: Vec<f64>,
    pub(crate) sum_sq: Vec<f64>,
    pub(crate) smooth_sum: Vec<f64>,
    pub(crate) count: Vec<u64>,
}

impl CumulativeBandshape {
    pub(crate) fn new(num_channels: usize) -> CumulativeBandshape {
        CumulativeBandshape {
            sum: vec![0.0; num_channels],
            sum_sq: vec![0.0; num_channels],
            smooth_sum: vec![0.0; num_channels],
            count: vec![0; num_channels],
        }
    }

    /// Add a block's sums to the whole-run accumulators and derive the block's
    /// statistics. If `normalization` is given, the smoothed and normalised
    /// bandshapes are also formed.
    pub(crate) fn accumulate(
        &mut self,
        sums: &BandshapeSums,
        block_length: usize,
        channels: Range<usize>,
        normalization: Option<&NormalizationSource>,
    ) -> ChannelStatistics {
        let num_channels = sums.sum.len();
        let scale = f64::from(CUMULATIVE_SCALE);
        let mut bandshape = vec![0.0; num_channels];
        let mut mean_to_rms = vec![0.0; num_channels];
        let n = sums.count as f64;

        for c in channels.clone() {
            self.sum[c] += sums.sum[c] / scale;
            self.sum_sq[c] += sums.sum_sq[c] / (scale * scale);
            self.count[c] += sums.count;

            if sums.count == 0 {
                continue;
            }
            let mean = sums.sum[c] / n;
            bandshape[c] = mean as f32;
            if mean != 0.0 {
                mean_to_rms[c] = (mean / (sums.sum_sq[c] / n - mean * mean).sqrt()) as f32;
            }
        }

        let mut stats = ChannelStatistics {
            bandshape_extrema: Extrema::of(channels.clone().map(|c| bandshape[c])),
            mean_to_rms_extrema: Extrema::of(channels.clone().map(|c| mean_to_rms[c])),
            bandshape,
            mean_to_rms,
            smooth: vec![0.0; num_channels],
            normalized: vec![0.0; num_channels],
            samples_used: sums.count,
            ..Default::default()
        };

        match normalization {
            Some(NormalizationSource::Smoothed { window }) => {
                self.smooth_and_normalize(&mut stats, *window, block_length, channels.clone())
            }
            Some(NormalizationSource::External(reference)) => {
                for c in channels.clone() {
                    stats.smooth[c] = reference[c];
                    stats.normalized[c] = stats.bandshape[c] / reference[c];
                }
                stats.smoothed = true;
            }
            None => (),
        }
        if stats.smoothed {
            stats.normalized_extrema = Extrema::of(channels.map(|c| stats.normalized[c]));
        }

        stats
    }

    /// Median-smooth the block bandshape across channels, fold the result into
    /// the whole-run smoothed sums, and normalise the block bandshape by the
    /// whole-run smoothed bandshape.
    fn smooth_and_normalize(
        &mut self,
        stats: &mut ChannelStatistics,
        window: usize,
        block_length: usize,
        channels: Range<usize>,
    ) {
        let scale = f64::from(CUMULATIVE_SCALE);
        let start = channels.start;
        let num_in_range = channels.len();
        let half = window / 2;
        let mut neighbours = Vec::with_capacity(window.max(1));

        for j in 0..num_in_range {
            let lo = j.saturating_sub(half);
            let hi = (j + half).min(num_in_range).max(lo + 1);
            neighbours.clear();
            neighbours.extend_from_slice(&stats.bandshape[start + lo..start + hi]);
            neighbours.sort_unstable_by(f32::total_cmp);
            let median = f64::from(neighbours[neighbours.len() / 2]);

            let c = start + j;
            self.smooth_sum[c] += median * block_length as f64 / scale;
            let smooth = if self.count[c] == 0 {
                0.0
            } else {
                (self.smooth_sum[c] * scale / self.count[c] as f64) as f32
            };
            if smooth == 0.0 {
                stats.smooth[c] = 1.0;
                stats.normalized[c] = 0.0;
            } else {
                stats.smooth[c] = smooth;
                stats.normalized[c] = stats.bandshape[c] / smooth;
            }
        }
        stats.smoothed = true;
    }
}

/// The zero-DM time series of one polarisation of a block.
#[derive(Debug, Clone, Default)]
pub(crate) struct ZeroDm {
    /// The average over unflagged in-range channels.
    pub(crate) filtered: Vec<f32>,

    /// The average over all in-range channels.
    pub(crate) unfiltered: Vec<f32>,

    /// The extremes of `filtered`.
    pub(crate) extrema: Extrema,
}

/// Average each time sample of `data` across the channel range. `chan_flags`
/// are relative to the start of the range.
pub(crate) fn zero_dm(data: ArrayView2<f32>, channels: Range<usize>, chan_flags: &[bool]) -> ZeroDm {
    let num_unflagged = chan_flags.iter().filter(|&&f| !f).count();
    let num_in_range = channels.len() as f32;
    let mut filtered = Vec::with_capacity(data.len_of(Axis(0)));
    let mut unfiltered = Vec::with_capacity(data.len_of(Axis(0)));

    for samples in data.outer_iter() {
        let in_range = samples.slice(s![channels.clone()]);
        let mut all = 0.0;
        let mut good = 0.0;
        for (&v, &flagged) in in_range.iter().zip(chan_flags) {
            all += v;
            if !flagged {
                good += v;
            }
        }
        unfiltered.push(all / num_in_range);
        filtered.push(if num_unflagged == 0 {
            0.0
        } else {
            good / num_unflagged as f32
        });
    }

    ZeroDm {
        extrema: Extrema::of(filtered.iter().copied()),
        filtered,
        unfiltered,
    }
}

/// Divide every in-range sample by the smoothed bandshape of its channel.
pub(crate) fn normalize_data(mut data: ArrayViewMut2<f32>, channels: Range<usize>, smooth: &[f32]) {
    let smooth = &smooth[channels.clone()];
    for mut samples in data.outer_iter_mut() {
        samples
            .slice_mut(s![channels.clone()])
            .iter_mut()
            .zip(smooth)
            .for_each(|(v, s)| *v /= s);
    }
}

/// Remove the part of each in-range channel that is correlated with the
/// zero-DM series. Each channel is taken relative to its normalised bandshape.
pub(crate) fn subtract_zero_dm(
    mut data: ArrayViewMut2<f32>,
    channels: Range<usize>,
    zero_dm: &[f32],
    normalized: &[f32],
) {
    let length = zero_dm.len();
    if length == 0 {
        return;
    }
    let l = length as f32;
    let mean = zero_dm.iter().sum::<f32>() / l;
    let variance = zero_dm.iter().map(|z| z * z).sum::<f32>() / l - mean * mean;
    if variance <= 0.0 {
        // A flat zero-DM series has nothing to subtract.
        return;
    }

    let baseline = &normalized[channels.clone()];
    let mut correlation = vec![0.0; channels.len()];
    for (samples, &z) in data.outer_iter().zip(zero_dm) {
        let in_range = samples.slice(s![channels.clone()]);
        for ((corr, &v), &b) in correlation.iter_mut().zip(in_range).zip(baseline) {
            *corr += (z - mean) * (v - b);
        }
    }

    for (mut samples, &z) in data.outer_iter_mut().zip(zero_dm) {
        let mut in_range = samples.slice_mut(s![channels.clone()]);
        for ((v, &corr), &b) in in_range.iter_mut().zip(&correlation).zip(baseline) {
            *v = (*v - b) - (z - mean) * (corr / l) / variance + b;
        }
    }
}

/// Scale a sample by the output gain and round it to the persisted integer
/// width. Values beyond the limits of `i16` saturate.
pub(crate) fn quantize(value: f32, gain: f32) -> i16 {
    (value * gain).round() as i16
}

/// Produce the filtered 2D grid of a block. Unflagged in-range cells keep their
/// value; flagged and out-of-range cells get the replacement value of their
/// channel. Everything is scaled by `gain` and quantized.
pub(crate) fn filtered_grid(
    data: ArrayView2<f32>,
    channels: Range<usize>,
    time_flags: &[bool],
    chan_flags: &[bool],
    replacement: &[f32],
    gain: f32,
) -> Array2<i16> {
    let mut grid = Array2::zeros(data.dim());
    for ((mut row, samples), &time_flagged) in grid
        .outer_iter_mut()
        .zip(data.outer_iter())
        .zip(time_flags)
    {
        for (c, (cell, &v)) in row.iter_mut().zip(samples.iter()).enumerate() {
            let good = channels.contains(&c) && !time_flagged && !chan_flags[c - channels.start];
            *cell = quantize(if good { v } else { replacement[c] }, gain);
        }
    }
    grid
}
