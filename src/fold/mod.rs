// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Folding dedispersed series into pulse profiles.

pub(crate) mod polyco;

use log::info;

use crate::{dedisperse::Dedispersed, params::PhaseModel, stats::Extrema};

/// Keeps time for the folding of one polarisation. Lives for the whole run.
#[derive(Debug, Clone, Default)]
pub(crate) struct FoldingClock {
    /// Observation time before folding started \[ms\].
    pub(crate) lag_ms: f64,

    /// Time since folding started \[ms\]. Advances by one sampling interval per
    /// folded sample, whether or not the sample is valid.
    pub(crate) position_ms: f64,

    samples_seen: usize,
    started: bool,

    /// The polyco phase of the first folded sample.
    initial_phase: Option<f64>,
}

impl FoldingClock {
    /// Decide where folding starts in the next block, which has `length`
    /// samples.
    ///
    /// Folding only starts once `max_delay` samples have been seen, so that
    /// every channel has contributed to the dedispersed series. Until then,
    /// whole blocks are skipped (and `None` is returned). The block where the
    /// delay is reached starts folding at the `max_delay`th sample of the run.
    pub(crate) fn gate(
        &mut self,
        length: usize,
        max_delay: usize,
        sampling_interval_ms: f64,
    ) -> Option<usize> {
        let seen = self.samples_seen;
        self.samples_seen += length;
        if self.started {
            return Some(0);
        }
        if length == 0 || (length < max_delay && seen + length < max_delay) {
            self.lag_ms += length as f64 * sampling_interval_ms;
            return None;
        }
        self.started = true;
        let start = max_delay.saturating_sub(seen).min(length);
        self.lag_ms += start as f64 * sampling_interval_ms;
        info!("Started folding after a lag of {} ms", self.lag_ms);
        Some(start)
    }

    fn phase(&mut self, model: &PhaseModel, row: &mut usize) -> f64 {
        match model {
            PhaseModel::Fixed { period_ms } => (self.position_ms / period_ms).rem_euclid(1.0),

            PhaseModel::Polyco { table, mjd_obs, .. } => {
                let mut dt = (self.lag_ms + self.position_ms) / 60000.0
                    + table.minutes_from(*row, *mjd_obs);
                while dt > table.span / 2.0 && *row + 1 < table.sets.len() {
                    dt -= table.span;
                    *row += 1;
                }
                let phase = table.sets[*row].phase(dt);

                // The first sample folded lands in the first bin.
                let initial = *self.initial_phase.get_or_insert(phase.rem_euclid(1.0));
                (phase - initial).rem_euclid(1.0)
            }
        }
    }
}

/// How the dedispersed series are folded.
#[derive(Debug, Clone)]
pub(crate) struct Folder {
    pub(crate) model: PhaseModel,

    /// Added to every phase. In \[0, 1\].
    pub(crate) offset: f64,

    pub(crate) sampling_interval_ms: f64,
}

impl Folder {
    /// Fold the samples of `series` from `start` into `profile`. Invalid
    /// samples are skipped.
    pub(crate) fn fold(
        &self,
        profile: &mut Profile,
        clock: &mut FoldingClock,
        series: &Dedispersed,
        start: usize,
    ) {
        let bins = profile.bins();
        let mut row = match &self.model {
            PhaseModel::Fixed { .. } => 0,
            PhaseModel::Polyco { initial_row, .. } => *initial_row,
        };

        for t in start..series.len() {
            let mut phase = clock.phase(&self.model, &mut row) + self.offset;
            clock.position_ms += self.sampling_interval_ms;
            if series.invalid[t] {
                continue;
            }
            if phase >= 1.0 {
                phase -= 1.0;
            }
            let mut bin = (phase * bins as f64 + 0.5) as usize;
            if bin >= bins {
                bin = 0;
            }
            profile.sum[bin] += f64::from(series.filtered[t]);
            profile.count[bin] += 1;
            profile.sum_unfiltered[bin] += f64::from(series.unfiltered[t]);
            profile.count_unfiltered[bin] += 1;
        }
    }
}

/// The folded profile of one polarisation. Never reset during a run.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Profile {
    pub(crate) sum: Vec<f64>,
    pub(crate) count: Vec<u64>,
    pub(crate) sum_unfiltered: Vec<f64>,
    pub(crate) count_unfiltered: Vec<u64>,
}

/// The average profile so far.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct CurrentProfile {
    pub(crate) filtered: Vec<f32>,
    pub(crate) unfiltered: Vec<f32>,
    /// Only over bins that have data.
    pub(crate) extrema: Extrema,
    pub(crate) unfiltered_extrema: Extrema,
}

impl Profile {
    pub(crate) fn new(bins: usize) -> Profile {
        Profile {
            sum: vec![0.0; bins],
            count: vec![0; bins],
            sum_unfiltered: vec![0.0; bins],
            count_unfiltered: vec![0; bins],
        }
    }

    pub(crate) fn bins(&self) -> usize {
        self.sum.len()
    }

    pub(crate) fn current(&self) -> CurrentProfile {
        fn average(sum: &[f64], count: &[u64]) -> (Vec<f32>, Extrema) {
            let means: Vec<f32> = sum
                .iter()
                .zip(count)
                .map(|(&s, &c)| if c == 0 { 0.0 } else { (s / c as f64) as f32 })
                .collect();
            let extrema = Extrema::of(
                means
                    .iter()
                    .zip(count)
                    .filter(|(_, &c)| c > 0)
                    .map(|(&m, _)| m),
            );
            (means, extrema)
        }

        let (filtered, extrema) = average(&self.sum, &self.count);
        let (unfiltered, unfiltered_extrema) = average(&self.sum_unfiltered, &self.count_unfiltered);
        CurrentProfile {
            filtered,
            unfiltered,
            extrema,
            unfiltered_extrema,
        }
    }
}
