// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The work done on a packet by each stage after ingest, and the cross-block
//! state each stage owns.
//!
//! Every stage handles one packet per iteration and packets arrive in block
//! order, so the state a stage owns is always updated in block order.
//! Polarisations are independent and are processed in parallel.

use log::trace;
use rayon::prelude::*;

use super::packet::{Packet, PolarizationState};
use crate::{
    dedisperse::{DelayTable, Dedispersed, Excess},
    flagging::{estimate, merge_polarizations, FlagSet},
    fold::{Folder, FoldingClock, Profile},
    io::read::deinterleave,
    params::{BandshapeSelection, ReplacementPolicy, RunParameters},
    stats::{
        bandshape_sums, filtered_grid, mean_bandshape, normalize_data, subtract_zero_dm,
        zero_dm, CumulativeBandshape,
    },
};

/// Decode the raw bytes into one float array per polarisation.
pub(super) fn convert(params: &RunParameters, packet: &mut Packet) {
    let arrays = deinterleave(
        &packet.raw,
        params.num_channels,
        params.sample_width,
        params.polarization,
    );
    packet.raw.bytes = vec![];
    packet.pols = arrays
        .into_iter()
        .map(|data| PolarizationState::new(data, params.num_channels_in_range()))
        .collect();
    trace!("Converted block {}", packet.index);
}

pub(super) struct ChannelStage {
    /// One per polarisation.
    pub(super) cumulative: Vec<CumulativeBandshape>,
}

impl ChannelStage {
    pub(super) fn new(params: &RunParameters) -> ChannelStage {
        ChannelStage {
            cumulative: vec![CumulativeBandshape::new(params.num_channels); params.num_pols()],
        }
    }

    pub(super) fn process(&mut self, params: &RunParameters, packet: &mut Packet) {
        let length = packet.len();
        let range = params.channel_range();
        let normalization = if params.needs_smoothed_bandshape() {
            Some(&params.normalization)
        } else {
            None
        };

        packet
            .pols
            .par_iter_mut()
            .zip(self.cumulative.par_iter_mut())
            .for_each(|(pol, cumulative)| {
                let time_flags = if params.bandshape_uses_time_flags() {
                    Some(pol.time_flags.flags.as_slice())
                } else {
                    None
                };
                let sums = bandshape_sums(pol.data.view(), range.clone(), time_flags);
                pol.channel_stats =
                    cumulative.accumulate(&sums, length, range.clone(), normalization);

                let mut flags = FlagSet::blank(range.len());
                if let Some(flagging) = params.chan_flagging {
                    let stats = &pol.channel_stats;
                    let first = match flagging.selection {
                        BandshapeSelection::Mean => &stats.bandshape,
                        BandshapeSelection::Normalized => &stats.normalized,
                        BandshapeSelection::MeanToRms | BandshapeSelection::Both => {
                            &stats.mean_to_rms
                        }
                    };
                    let mut passes = vec![&first[range.clone()]];
                    if flagging.selection == BandshapeSelection::Both {
                        passes.push(&stats.normalized[range.clone()]);
                    }
                    for values in passes {
                        flags.estimate =
                            estimate(values, flagging.algorithm, flagging.cutoff, &mut None);
                        flags.flag(values);
                    }
                }
                flags.manual_flag(&params.bad_channel_ranges, params.start_channel);
                pol.chan_flags = flags;
            });

        merge_flags(&mut packet.pols, |pol| &mut pol.chan_flags);
        trace!("Channel statistics done for block {}", packet.index);
    }
}

pub(super) struct TimeStage {
    /// The histogram bin width of each polarisation, carried between blocks.
    pub(super) intervals: Vec<Option<f32>>,
}

impl TimeStage {
    pub(super) fn new(params: &RunParameters) -> TimeStage {
        TimeStage {
            intervals: vec![None; params.num_pols()],
        }
    }

    pub(super) fn process(&mut self, params: &RunParameters, packet: &mut Packet) {
        let length = packet.len();
        let range = params.channel_range();
        let blank_chan_flags = vec![false; range.len()];

        packet
            .pols
            .par_iter_mut()
            .zip(self.intervals.par_iter_mut())
            .for_each(|(pol, interval)| {
                if params.normalize_data {
                    normalize_data(pol.data.view_mut(), range.clone(), &pol.channel_stats.smooth);
                }

                let chan_flags = if params.zero_dm_uses_channel_flags() {
                    &pol.chan_flags.flags
                } else {
                    &blank_chan_flags
                };
                pol.zero_dm = zero_dm(pol.data.view(), range.clone(), chan_flags);

                let mut flags = match params.time_flagging {
                    Some(flagging) => {
                        let series = &pol.zero_dm.filtered;
                        // An undetermined estimate flags nothing.
                        let mut flags = FlagSet::new(
                            length,
                            estimate(series, flagging.algorithm, flagging.cutoff, interval),
                        );
                        if flagging.multi_point {
                            flags.multi_point_flag(series, flagging.cutoff);
                        } else {
                            flags.flag(series);
                        }
                        flags
                    }
                    None => FlagSet::blank(length),
                };

                if params.zero_dm_subtraction {
                    // Without a normalised bandshape (the channel stage hasn't
                    // run, or doesn't smooth), every channel is taken relative
                    // to the time-series centre.
                    let fallback;
                    let baseline = if pol.channel_stats.smoothed {
                        &pol.channel_stats.normalized
                    } else {
                        let centre = if flags.estimate.is_determined() {
                            flags.estimate.centre
                        } else {
                            1.0
                        };
                        fallback = vec![centre; params.num_channels];
                        &fallback
                    };
                    subtract_zero_dm(
                        pol.data.view_mut(),
                        range.clone(),
                        &pol.zero_dm.filtered,
                        baseline,
                    );
                }

                if let Some(smoothing) = params.time_flagging.and_then(|f| f.smoothing) {
                    flags.smooth(smoothing.window, smoothing.threshold);
                }

                if params.needs_filtered_grid() {
                    let replacement = match params.replacement {
                        ReplacementPolicy::Zero => vec![0.0; params.num_channels],
                        ReplacementPolicy::Mode => vec![flags.estimate.centre; params.num_channels],
                        ReplacementPolicy::SmoothBandshape if pol.channel_stats.smoothed => {
                            pol.channel_stats.smooth.clone()
                        }
                        // The channel stage comes later, so this block has no
                        // smoothed bandshape yet.
                        ReplacementPolicy::SmoothBandshape => {
                            mean_bandshape(pol.data.view(), range.clone(), &flags.flags)
                        }
                    };
                    pol.grid = Some(filtered_grid(
                        pol.data.view(),
                        range.clone(),
                        &flags.flags,
                        &pol.chan_flags.flags,
                        &replacement,
                        params.gain,
                    ));
                }
                pol.time_flags = flags;
            });

        merge_flags(&mut packet.pols, |pol| &mut pol.time_flags);
        trace!("Time statistics done for block {}", packet.index);
    }
}

pub(super) struct DedisperseStage {
    table: DelayTable,
    folder: Folder,

    /// One of each per polarisation.
    excess: Vec<Option<Excess>>,
    clocks: Vec<FoldingClock>,
    pub(super) profiles: Vec<Profile>,
}

impl DedisperseStage {
    pub(super) fn new(params: &RunParameters) -> DedisperseStage {
        let table = DelayTable::new(
            params.num_channels,
            params.lowest_freq_mhz,
            params.bandwidth_mhz,
            params.sideband,
            params.reference_edge,
            params.dm,
            params.sampling_interval,
        );
        let num_pols = params.num_pols();
        DedisperseStage {
            table,
            folder: Folder {
                model: params.phase_model.clone(),
                offset: params.profile_offset,
                sampling_interval_ms: params.sampling_interval_ms(),
            },
            excess: vec![None; num_pols],
            clocks: vec![FoldingClock::default(); num_pols],
            profiles: vec![Profile::new(params.profile_bins); num_pols],
        }
    }

    pub(super) fn max_delay(&self) -> usize {
        self.table.max_delay
    }

    pub(super) fn process(&mut self, params: &RunParameters, packet: &mut Packet) {
        let length = packet.len();
        let range = params.channel_range();
        let table = &self.table;
        let folder = &self.folder;
        let use_grid = params.replacement != ReplacementPolicy::Zero;

        packet
            .pols
            .par_iter_mut()
            .zip(self.excess.par_iter_mut())
            .zip(self.clocks.par_iter_mut())
            .zip(self.profiles.par_iter_mut())
            .for_each(|(((pol, excess), clock), profile)| {
                let mut series = Dedispersed::new(length, table.max_delay);
                match pol.grid.as_ref() {
                    Some(grid) if use_grid => series.accumulate_grid(
                        table,
                        pol.data.view(),
                        grid.view(),
                        range.clone(),
                        params.gain,
                    ),
                    _ => series.accumulate(
                        table,
                        pol.data.view(),
                        range.clone(),
                        &pol.time_flags.flags,
                        &pol.chan_flags.flags,
                    ),
                }
                *excess = Some(series.merge_excess(excess.as_ref()));
                series.normalize(range.len());

                pol.fold_start =
                    clock.gate(length, table.max_delay, params.sampling_interval_ms());
                if let Some(start) = pol.fold_start {
                    folder.fold(profile, clock, &series, start);
                }
                pol.dedispersed = Some(series);
            });
        trace!("Dedispersed block {}", packet.index);
    }
}

/// In full-polarisation mode, make every polarisation use the combined flags
/// of the total-power products.
fn merge_flags<F>(pols: &mut [PolarizationState], flags_of: F)
where
    F: Fn(&mut PolarizationState) -> &mut FlagSet,
{
    if pols.len() != 4 {
        return;
    }
    let mut sets: Vec<FlagSet> = pols
        .iter_mut()
        .map(|pol| std::mem::replace(flags_of(pol), FlagSet::blank(0)))
        .collect();
    merge_polarizations(&mut sets);
    for (pol, set) in pols.iter_mut().zip(sets) {
        *flags_of(pol) = set;
    }
}
