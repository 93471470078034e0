// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! RFI detection. Everything here works on a single 1D array (a bandshape or a
//! zero-DM series): a robust estimate of its central tendency and spread is
//! made, and elements too far from the centre are flagged.


use log::trace;

use crate::{
    constants::{FWHM_TO_SIGMA, MAD_TO_SIGMA, MULTI_POINT_CUTOFFS},
    params::FlagAlgorithm,
};

/// Histograms never have more bins than this; if the current interval would
/// need more, it is widened.
const MAX_HISTOGRAM_BINS: usize = 1 << 20;

/// The robust statistics of an array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Estimate {
    pub(crate) centre: f32,
    pub(crate) spread: f32,
    pub(crate) cutoff: f32,
}

impl Estimate {
    /// The estimate of data that couldn't be characterised. Nothing is ever
    /// flagged against it.
    pub(crate) const UNDETERMINED: Estimate = Estimate {
        centre: f32::NAN,
        spread: f32::NAN,
        cutoff: f32::NAN,
    };

    pub(crate) fn is_determined(&self) -> bool {
        self.spread.is_finite() && self.centre.is_finite()
    }
}

/// Estimate the centre and spread of `data`, and the cutoff (`spread × ratio`)
/// beyond which elements are outliers.
///
/// `interval` is the histogram bin width. If it is `None`, it is seeded from
/// the range of the data. When a histogram estimate succeeds, `interval` is
/// refined for the next call.
pub(crate) fn estimate(
    data: &[f32],
    algorithm: FlagAlgorithm,
    ratio: f32,
    interval: &mut Option<f32>,
) -> Estimate {
    let estimate = match algorithm {
        FlagAlgorithm::Mad => mad(data),
        FlagAlgorithm::Histogram => {
            let width = match *interval {
                Some(w) => w,
                None => match seed_interval(data) {
                    Some(w) => w,
                    None => return Estimate::UNDETERMINED,
                },
            };
            let (estimate, next) = histogram(data, width);
            if let Some(next) = next {
                *interval = Some(next);
            }
            estimate
        }
    };
    Estimate {
        cutoff: estimate.spread * ratio,
        ..estimate
    }
}

fn finite_extrema(data: &[f32]) -> Option<(f32, f32)> {
    data.iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((min, max)) => Some((min.min(v), max.max(v))),
        })
}

/// The first histogram bin width used on `data`: its range divided by the cube
/// root of its size.
pub(crate) fn seed_interval(data: &[f32]) -> Option<f32> {
    let (min, max) = finite_extrema(data)?;
    Some((max - min) / (data.len() as f32).cbrt())
}

/// The median of sorted data; the mean of the middle two for even sizes.
fn median_of_sorted(sorted: &[f32]) -> f32 {
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

/// The median and the median absolute deviation (scaled to a Gaussian sigma).
fn mad(data: &[f32]) -> Estimate {
    if data.is_empty() {
        return Estimate::UNDETERMINED;
    }
    let mut sorted = data.to_vec();
    sorted.sort_unstable_by(f32::total_cmp);
    let centre = median_of_sorted(&sorted);

    for v in sorted.iter_mut() {
        *v = (*v - centre).abs();
    }
    sorted.sort_unstable_by(f32::total_cmp);
    Estimate {
        centre,
        spread: median_of_sorted(&sorted) * MAD_TO_SIGMA,
        cutoff: f32::NAN,
    }
}

/// Bin the data and use the modal bin and the full width at half maximum
/// around it. Also returns the bin width to use next time.
fn histogram(data: &[f32], interval: f32) -> (Estimate, Option<f32>) {
    let (min, max) = match finite_extrema(data) {
        Some(e) => e,
        None => return (Estimate::UNDETERMINED, None),
    };
    if !interval.is_finite() || interval <= 0.0 {
        trace!("Histogram interval {interval} is unusable");
        return (Estimate::UNDETERMINED, None);
    }
    let interval = interval.max((max - min) / MAX_HISTOGRAM_BINS as f32);
    let size = ((max - min) / interval) as usize + 1;

    let mut bins = vec![0_u32; size];
    for &v in data.iter().filter(|v| v.is_finite()) {
        let i = (((v - min) / interval) as usize).min(size - 1);
        bins[i] += 1;
    }

    let (mode, mode_height) = bins
        .iter()
        .copied()
        .enumerate()
        .fold((0, 0), |best, (i, h)| if h > best.1 { (i, h) } else { best });
    if mode_height == 0 {
        return (Estimate::UNDETERMINED, None);
    }
    let half = mode_height as f32 / 2.0;
    let above_half = |i: isize| i >= 0 && (i as usize) < size && bins[i as usize] as f32 >= half;

    let mode = mode as isize;
    let mut p = 0;
    while above_half(mode + p) {
        p += 1;
    }
    let mut q = 0;
    while above_half(mode + q) {
        q -= 1;
    }

    let centre = (mode as f32 + 0.5) * interval + min;
    let spread = (p - q) as f32 * interval / FWHM_TO_SIGMA;
    let next = 4.0 * spread / (data.len() as f32).cbrt();
    (
        Estimate {
            centre,
            spread,
            cutoff: f32::NAN,
        },
        Some(next),
    )
}

/// The cutoff (in units of the spread) that two adjacent samples must both
/// exceed to be flagged, for a single-sample cutoff of `ratio`.
pub(crate) fn two_point_cutoff(ratio: f32) -> f32 {
    let last = MULTI_POINT_CUTOFFS.len() - 1;
    let position = (ratio - 1.0) / 0.1;
    let i1 = (position.floor().max(0.0) as usize).min(last);
    let i2 = (position.ceil().max(0.0) as usize).min(last);
    let (r1, c1) = MULTI_POINT_CUTOFFS[i1];
    let (_, c2) = MULTI_POINT_CUTOFFS[i2];
    c1 + (c2 - c1) / 0.1 * (ratio - r1)
}

/// Flags over one axis of one polarisation of a block.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FlagSet {
    pub(crate) flags: Vec<bool>,
    pub(crate) estimate: Estimate,

    /// The unflagged fraction around each element, if the flags were smoothed.
    pub(crate) smoothed: Option<Vec<f32>>,
}

impl FlagSet {
    /// No flags, and nothing known about the data.
    pub(crate) fn blank(len: usize) -> FlagSet {
        FlagSet {
            flags: vec![false; len],
            estimate: Estimate::UNDETERMINED,
            smoothed: None,
        }
    }

    pub(crate) fn new(len: usize, estimate: Estimate) -> FlagSet {
        FlagSet {
            estimate,
            ..FlagSet::blank(len)
        }
    }

    pub(crate) fn num_flagged(&self) -> usize {
        self.flags.iter().filter(|&&f| f).count()
    }

    /// Flag elements of `data` further than the cutoff from the centre. Existing
    /// flags are kept.
    pub(crate) fn flag(&mut self, data: &[f32]) {
        if !self.estimate.is_determined() {
            return;
        }
        let Estimate { centre, cutoff, .. } = self.estimate;
        for (flag, &v) in self.flags.iter_mut().zip(data) {
            if (v - centre).abs() > cutoff {
                *flag = true;
            }
        }
    }

    /// Replace the flags: element `i` and `i + 1` are flagged when both are
    /// further than the two-point cutoff for `ratio` from the centre.
    pub(crate) fn multi_point_flag(&mut self, data: &[f32], ratio: f32) {
        let Estimate { centre, spread, .. } = self.estimate;
        let cutoff = two_point_cutoff(ratio) * spread;
        self.flags.iter_mut().for_each(|f| *f = false);
        if !self.estimate.is_determined() {
            return;
        }
        for (i, pair) in data.windows(2).enumerate() {
            if (pair[0] - centre).abs() > cutoff && (pair[1] - centre).abs() > cutoff {
                self.flags[i] = true;
                self.flags[i + 1] = true;
            }
        }
    }

    /// Reject whole regions around concentrations of flags: wherever the
    /// unflagged fraction within `window / 2` elements either side is below
    /// `threshold`, that whole window is flagged.
    pub(crate) fn smooth(&mut self, window: usize, threshold: f32) {
        let n = self.flags.len();
        let s = window / 2;
        let around = |i: usize| i.saturating_sub(s)..(i + s + 1).min(n);

        let smoothed: Vec<f32> = (0..n)
            .map(|i| {
                let range = around(i);
                let len = range.len() as f32;
                let flagged = self.flags[range].iter().filter(|&&f| f).count() as f32;
                1.0 - flagged / len
            })
            .collect();
        for (i, &unflagged) in smoothed.iter().enumerate() {
            if unflagged < threshold {
                self.flags[around(i)].iter_mut().for_each(|f| *f = true);
            }
        }
        self.smoothed = Some(smoothed);
    }

    /// Flag the half-open index ranges, which are relative to `offset`.
    /// Indices outside the flags are ignored.
    pub(crate) fn manual_flag(&mut self, ranges: &[(usize, usize)], offset: usize) {
        let n = self.flags.len();
        for &(start, end) in ranges {
            let start = start.max(offset) - offset;
            let end = (end.max(offset) - offset).min(n);
            if start < end {
                self.flags[start..end].iter_mut().for_each(|f| *f = true);
            }
        }
    }
}

/// In full-polarisation mode, the flags of the first and third polarisations
/// (the two total-power products) are combined and used for all four.
pub(crate) fn merge_polarizations(sets: &mut [FlagSet]) {
    if sets.len() != 4 {
        return;
    }
    let merged: Vec<bool> = sets[0]
        .flags
        .iter()
        .zip(&sets[2].flags)
        .map(|(&a, &b)| a || b)
        .collect();
    for set in sets.iter_mut() {
        set.flags.clone_from(&merged);
    }
}
