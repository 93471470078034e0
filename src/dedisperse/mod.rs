// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Incoherent dedispersion.
//!
//! Every channel of a block is shifted by its dispersion delay and summed into
//! an accumulator that is `max_delay` samples longer than the block. The tail
//! of the accumulator (the "excess") only has contributions from some channels;
//! it is carried into the head of the next block's accumulator, so blocks must
//! be merged strictly in order.


use std::ops::Range;

use log::debug;
use ndarray::prelude::*;

use crate::{
    constants::{K_DM, MIN_DEDISPERSED_CHANNEL_FRACTION},
    params::{ReferenceEdge, Sideband},
    stats::Extrema,
};

/// The dispersion delay of every channel \[samples\]. Computed once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DelayTable {
    pub(crate) delays: Vec<usize>,

    /// The largest delay. Accumulators are this much longer than their block.
    pub(crate) max_delay: usize,
}

impl DelayTable {
    /// Frequencies are in MHz and the sampling interval in seconds.
    pub(crate) fn new(
        num_channels: usize,
        lowest_freq_mhz: f64,
        bandwidth_mhz: f64,
        sideband: Sideband,
        reference: ReferenceEdge,
        dm: f64,
        sampling_interval: f64,
    ) -> DelayTable {
        let df = bandwidth_mhz / num_channels as f64;
        let f0 = lowest_freq_mhz + df / 2.0;
        let k = K_DM * dm / sampling_interval;

        let raw: Vec<i64> = (0..num_channels)
            .map(|i| {
                let j = match sideband {
                    Sideband::Upper => i,
                    Sideband::Lower => num_channels - i - 1,
                };
                let f = f0 + j as f64 * df;
                let reference = match reference {
                    ReferenceEdge::Low => f0,
                    ReferenceEdge::High => f0 + bandwidth_mhz,
                };
                // Truncation towards zero, also for the negative delays of the
                // high-edge reference.
                ((reference.powi(-2) - f.powi(-2)) * k + 0.5) as i64
            })
            .collect();

        let shift = raw.iter().copied().min().unwrap_or(0).min(0);
        let delays: Vec<usize> = raw.into_iter().map(|d| (d - shift) as usize).collect();
        let max_delay = delays.iter().copied().max().unwrap_or(0);
        debug!("Largest dispersion delay: {max_delay} samples");
        DelayTable { delays, max_delay }
    }
}

/// The part of an accumulator that spills over into the next block.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Excess {
    pub(crate) filtered: Vec<f32>,
    pub(crate) unfiltered: Vec<f32>,
    pub(crate) count: Vec<i32>,
    pub(crate) count_unfiltered: Vec<i32>,
}

/// The dedispersed series of one polarisation of one block.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Dedispersed {
    /// Flagged data is left out of these.
    pub(crate) filtered: Vec<f32>,
    pub(crate) count: Vec<i32>,

    /// Everything, flagged or not.
    pub(crate) unfiltered: Vec<f32>,
    pub(crate) count_unfiltered: Vec<i32>,

    /// One per time sample of the block; set for samples that didn't get
    /// enough channels to be trusted.
    pub(crate) invalid: Vec<bool>,

    pub(crate) extrema: Extrema,
    pub(crate) unfiltered_extrema: Extrema,

    length: usize,
    max_delay: usize,
}

impl Dedispersed {
    pub(crate) fn new(length: usize, max_delay: usize) -> Dedispersed {
        let n = length + max_delay;
        Dedispersed {
            filtered: vec![0.0; n],
            count: vec![0; n],
            unfiltered: vec![0.0; n],
            count_unfiltered: vec![0; n],
            invalid: vec![false; length],
            extrema: Extrema::default(),
            unfiltered_extrema: Extrema::default(),
            length,
            max_delay,
        }
    }

    /// The number of time samples in the block.
    pub(crate) fn len(&self) -> usize {
        self.length
    }

    /// Shift and add the in-range channels of `data` (`time × channel`).
    /// Samples flagged in either flag set only go into the unfiltered series.
    /// `chan_flags` is relative to the start of `channels`.
    pub(crate) fn accumulate(
        &mut self,
        table: &DelayTable,
        data: ArrayView2<f32>,
        channels: Range<usize>,
        time_flags: &[bool],
        chan_flags: &[bool],
    ) {
        for (t, (samples, &time_flagged)) in data.outer_iter().zip(time_flags).enumerate() {
            for (c, (&v, &chan_flagged)) in samples
                .slice(s![channels.clone()])
                .iter()
                .zip(chan_flags)
                .enumerate()
            {
                let pos = t + table.delays[channels.start + c];
                if time_flagged || chan_flagged {
                    self.unfiltered[pos] += v;
                    self.count_unfiltered[pos] += 1;
                } else {
                    self.filtered[pos] += v;
                    self.count[pos] += 1;
                }
            }
        }

        for (u, &f) in self.unfiltered.iter_mut().zip(&self.filtered) {
            *u += f;
        }
        for (u, &c) in self.count_unfiltered.iter_mut().zip(&self.count) {
            *u += c;
        }
    }

    /// Shift and add a filtered grid (in which flagged samples have already
    /// been replaced). The unfiltered series gets the raw data, scaled to the
    /// same units as the grid.
    pub(crate) fn accumulate_grid(
        &mut self,
        table: &DelayTable,
        data: ArrayView2<f32>,
        grid: ArrayView2<i16>,
        channels: Range<usize>,
        gain: f32,
    ) {
        for (t, (samples, cells)) in data.outer_iter().zip(grid.outer_iter()).enumerate() {
            for c in channels.clone() {
                let pos = t + table.delays[c];
                self.filtered[pos] += f32::from(cells[c]);
                self.count[pos] += 1;
                self.unfiltered[pos] += samples[c] * gain;
                self.count_unfiltered[pos] += 1;
            }
        }
    }

    /// Add the excess of the previous block to the head of this one, and split
    /// off this block's excess.
    pub(crate) fn merge_excess(&mut self, previous: Option<&Excess>) -> Excess {
        if let Some(previous) = previous {
            let head = ..self.max_delay;
            add_into(&mut self.filtered[head], &previous.filtered);
            add_into(&mut self.unfiltered[head], &previous.unfiltered);
            add_into(&mut self.count[head], &previous.count);
            add_into(&mut self.count_unfiltered[head], &previous.count_unfiltered);
        }

        let tail = self.length..;
        Excess {
            filtered: self.filtered[tail.clone()].to_vec(),
            unfiltered: self.unfiltered[tail.clone()].to_vec(),
            count: self.count[tail.clone()].to_vec(),
            count_unfiltered: self.count_unfiltered[tail].to_vec(),
        }
    }

    /// Turn the sums of the block's samples into means. Samples made from no
    /// more than 40% of `num_channels_in_range` are marked invalid.
    pub(crate) fn normalize(&mut self, num_channels_in_range: usize) {
        let min_count = MIN_DEDISPERSED_CHANNEL_FRACTION * num_channels_in_range as f32;
        let mut valid = Vec::with_capacity(self.length);
        for t in 0..self.length {
            let count = self.count[t];
            if count == 0 {
                self.invalid[t] = true;
                self.filtered[t] = 0.0;
            } else {
                self.filtered[t] /= count as f32;
                if count as f32 <= min_count {
                    self.invalid[t] = true;
                } else {
                    valid.push(self.filtered[t]);
                }
            }

            let count = self.count_unfiltered[t];
            self.unfiltered[t] = if count > 0 {
                self.unfiltered[t] / count as f32
            } else {
                0.0
            };
        }
        self.extrema = Extrema::of(valid);
        self.unfiltered_extrema = Extrema::of(self.unfiltered[..self.length].iter().copied());
    }

    /// The block's part of the filtered series, from `start`.
    pub(crate) fn filtered_series(&self, start: usize) -> &[f32] {
        &self.filtered[start..self.length]
    }

    pub(crate) fn unfiltered_series(&self, start: usize) -> &[f32] {
        &self.unfiltered[start..self.length]
    }

    pub(crate) fn counts(&self, start: usize) -> &[i32] {
        &self.count[start..self.length]
    }
}

fn add_into<T: Copy + std::ops::AddAssign>(dest: &mut [T], src: &[T]) {
    for (d, &s) in dest.iter_mut().zip(src) {
        *d += s;
    }
}
