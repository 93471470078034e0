// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The working set of one block as it moves through the pipeline.

use ndarray::prelude::*;

use crate::{
    dedisperse::Dedispersed,
    flagging::FlagSet,
    io::{read::RawBlock, write::PolarizationProducts},
    stats::{ChannelStatistics, ZeroDm},
};

/// Everything known about one polarisation of a block. Filled in stage by
/// stage.
#[derive(Debug, Clone)]
pub(crate) struct PolarizationState {
    /// `time × channel`, over the whole band.
    pub(crate) data: Array2<f32>,

    pub(crate) channel_stats: ChannelStatistics,

    /// Relative to the first analysed channel.
    pub(crate) chan_flags: FlagSet,
    pub(crate) time_flags: FlagSet,

    pub(crate) zero_dm: ZeroDm,

    /// The filtered 2D data, if it is formed.
    pub(crate) grid: Option<Array2<i16>>,

    pub(crate) dedispersed: Option<Dedispersed>,

    /// Where folding started in this block, if it was folded.
    pub(crate) fold_start: Option<usize>,
}

impl PolarizationState {
    pub(crate) fn new(data: Array2<f32>, num_channels_in_range: usize) -> PolarizationState {
        let length = data.len_of(Axis(0));
        PolarizationState {
            data,
            channel_stats: ChannelStatistics::default(),
            chan_flags: FlagSet::blank(num_channels_in_range),
            time_flags: FlagSet::blank(length),
            zero_dm: ZeroDm::default(),
            grid: None,
            dedispersed: None,
            fold_start: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Packet {
    pub(crate) index: usize,

    /// Emptied once the block has been converted.
    pub(crate) raw: RawBlock,

    /// One per polarisation; empty until the block has been converted.
    pub(crate) pols: Vec<PolarizationState>,

    length: usize,
}

impl Packet {
    pub(crate) fn new(raw: RawBlock) -> Packet {
        Packet {
            index: raw.index,
            length: raw.num_samples,
            raw,
            pols: vec![],
        }
    }

    /// The number of time samples in the block.
    pub(crate) fn len(&self) -> usize {
        self.length
    }

    pub(crate) fn products(&self) -> Vec<PolarizationProducts<'_>> {
        self.pols
            .iter()
            .map(|pol| PolarizationProducts {
                channel_stats: &pol.channel_stats,
                chan_flags: &pol.chan_flags,
                time_flags: &pol.time_flags,
                zero_dm: &pol.zero_dm,
                grid: pol.grid.as_ref().map(|g| g.view()),
                dedispersed: pol.dedispersed.as_ref(),
                dedispersed_start: pol.fold_start.unwrap_or(0),
            })
            .collect()
    }
}
