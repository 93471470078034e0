// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Parameters for a `gptool` run.
//!
//! The code here is kind of "mirroring" the code within the `cli` module; the
//! idea is that `cli` is unparsed, user-facing code, whereas parameters have
//! been parsed and validated and are ready to be used directly. Nothing in here
//! is changed once a run has started.


use std::{ops::Range, path::PathBuf};

use crossbeam_utils::atomic::AtomicCell;
use log::debug;
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    fold::polyco::PolycoTable,
    io::{
        read::{BlockLengths, BlockSource, FileSource, MmapRing, RingSource},
        write::OutputWriter,
    },
    pipeline::{BlockLogger, Pipeline, PipelineError, RunSummary},
};

/// The number of bytes used to store each sample of the input data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SampleWidth {
    /// 8-bit integers; unsigned for total intensity, signed for full
    /// polarisation.
    Int8,

    /// 16-bit integers; unsigned for total intensity, signed for full
    /// polarisation.
    Int16,

    /// Single-precision floats.
    Float32,
}

impl SampleWidth {
    pub(crate) fn from_num_bytes(num_bytes: u8) -> Option<SampleWidth> {
        match num_bytes {
            1 => Some(SampleWidth::Int8),
            2 => Some(SampleWidth::Int16),
            4 => Some(SampleWidth::Float32),
            _ => None,
        }
    }

    pub(crate) fn num_bytes(self) -> usize {
        match self {
            SampleWidth::Int8 => 1,
            SampleWidth::Int16 => 2,
            SampleWidth::Float32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PolarizationMode {
    /// One total-intensity stream.
    Intensity,

    /// Four interleaved polarisation products, stored in the order P, Q, R, S
    /// for each channel of each time sample.
    Full,
}

impl PolarizationMode {
    pub(crate) fn num_pols(self) -> usize {
        match self {
            PolarizationMode::Intensity => 1,
            PolarizationMode::Full => 4,
        }
    }
}

/// Whether sky frequency increases or decreases with channel index.
#[derive(Debug, Display, EnumIter, EnumString, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sideband {
    /// Frequency increases with channel index.
    #[strum(serialize = "usb")]
    Upper,

    /// Frequency decreases with channel index.
    #[strum(serialize = "lsb")]
    Lower,
}

/// Which band edge dedispersion delays are referenced to.
#[derive(Debug, Display, EnumIter, EnumString, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReferenceEdge {
    #[strum(serialize = "low")]
    Low,

    #[strum(serialize = "high")]
    High,
}

/// The per-channel quantity that channel flagging is done on.
#[derive(Debug, Display, EnumIter, EnumString, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BandshapeSelection {
    /// The block's mean bandshape. Only used when re-processing previously
    /// filtered data.
    #[strum(serialize = "mean")]
    Mean,

    /// The block's mean bandshape divided by the smoothed bandshape.
    #[strum(serialize = "normalized")]
    Normalized,

    /// The block's mean-to-rms bandshape.
    #[strum(serialize = "mean-to-rms")]
    MeanToRms,

    /// The mean-to-rms bandshape, followed by the normalised bandshape.
    #[strum(serialize = "both")]
    Both,
}

/// Robust estimators of central tendency and spread.
#[derive(Debug, Display, EnumIter, EnumString, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlagAlgorithm {
    #[strum(serialize = "histogram")]
    Histogram,

    #[strum(serialize = "mad")]
    Mad,
}

/// What flagged samples are replaced with in the filtered 2D output (and in the
/// dedispersed series when not zero).
#[derive(Debug, Display, EnumIter, EnumString, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplacementPolicy {
    #[strum(serialize = "zero")]
    Zero,

    /// The central tendency of the block's zero-DM series.
    #[strum(serialize = "mode")]
    Mode,

    /// The smoothed bandshape value of the flagged sample's channel.
    #[strum(serialize = "smooth-bandshape")]
    SmoothBandshape,
}

#[derive(Debug, Display, EnumIter, EnumString, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlagOrder {
    #[strum(serialize = "channel-first")]
    ChannelFirst,

    #[strum(serialize = "time-first")]
    TimeFirst,
}

/// Where blocks are read from.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SourceKind {
    File(PathBuf),

    /// A file backing a shared-memory ring buffer written by a correlator.
    Ring(PathBuf),
}

/// The bandshape that the block bandshape is normalised against.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NormalizationSource {
    /// A running median-smoothed bandshape with this window length (in
    /// channels).
    Smoothed { window: usize },

    /// A reference bandshape read from a file; one value per channel.
    External(Vec<f32>),
}

#[derive(Debug, Clone)]
pub(crate) enum PhaseModel {
    Fixed {
        period_ms: f64,
    },

    Polyco {
        table: PolycoTable,
        /// The MJD of the first sample of the observation.
        mjd_obs: f64,
        /// The polyco set that the observation starts in.
        initial_row: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ChannelFlagging {
    pub(crate) selection: BandshapeSelection,
    pub(crate) algorithm: FlagAlgorithm,
    pub(crate) cutoff: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TimeFlagging {
    pub(crate) algorithm: FlagAlgorithm,
    pub(crate) cutoff: f32,
    pub(crate) multi_point: bool,
    pub(crate) smoothing: Option<FlagSmoothing>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FlagSmoothing {
    /// The window length \[samples\].
    pub(crate) window: usize,

    /// If the unflagged fraction of a window is below this, the whole window
    /// is flagged.
    pub(crate) threshold: f32,
}

#[derive(Debug, Clone)]
pub(crate) struct OutputParams {
    /// All per-run products are written into this directory.
    pub(crate) dir: PathBuf,

    /// Where the filtered 2D data is written, if it is written at all.
    pub(crate) filtered_data: Option<PathBuf>,

    /// A header file that is copied alongside the filtered data.
    pub(crate) copy_header: Option<PathBuf>,

    pub(crate) chan_flags: bool,
    pub(crate) time_flags: bool,
    pub(crate) dedispersed: bool,
}

/// Everything a run needs to know. Built and validated by the CLI code.
#[derive(Debug, Clone)]
pub(crate) struct RunParameters {
    pub(crate) source: SourceKind,
    pub(crate) outputs: OutputParams,

    pub(crate) num_channels: usize,
    pub(crate) sample_width: SampleWidth,
    pub(crate) polarization: PolarizationMode,
    pub(crate) lowest_freq_mhz: f64,
    pub(crate) bandwidth_mhz: f64,
    pub(crate) sideband: Sideband,
    /// \[seconds\]
    pub(crate) sampling_interval: f64,

    pub(crate) pulsar_name: String,
    pub(crate) dm: f64,
    pub(crate) reference_edge: ReferenceEdge,
    pub(crate) phase_model: PhaseModel,
    pub(crate) profile_bins: usize,
    /// Added to every folding phase. In \[0, 1).
    pub(crate) profile_offset: f64,

    /// \[seconds\]
    pub(crate) block_duration: f64,
    /// \[seconds\] Skipped at the start of a file.
    pub(crate) start_time: f64,

    /// The first channel used for analysis.
    pub(crate) start_channel: usize,
    /// One past the last channel used for analysis.
    pub(crate) stop_channel: usize,
    /// Half-open ranges of channels that are always flagged.
    pub(crate) bad_channel_ranges: Vec<(usize, usize)>,

    pub(crate) chan_flagging: Option<ChannelFlagging>,
    pub(crate) time_flagging: Option<TimeFlagging>,
    pub(crate) flag_order: FlagOrder,

    pub(crate) normalization: NormalizationSource,
    pub(crate) normalize_data: bool,
    pub(crate) replacement: ReplacementPolicy,
    pub(crate) zero_dm_subtraction: bool,

    /// If false, only filtering is done; nothing is dedispersed or folded.
    pub(crate) dedisperse: bool,

    pub(crate) gain: f32,

    /// Make each pipeline iteration last at least one block duration when
    /// reading from a file.
    pub(crate) simulate_realtime: bool,
}

impl RunParameters {
    pub(crate) fn num_pols(&self) -> usize {
        self.polarization.num_pols()
    }

    /// The number of channels that analysis is done on.
    pub(crate) fn num_channels_in_range(&self) -> usize {
        self.stop_channel - self.start_channel
    }

    pub(crate) fn channel_range(&self) -> Range<usize> {
        self.start_channel..self.stop_channel
    }

    /// The number of bytes of a single time sample across all channels and
    /// polarisations.
    pub(crate) fn bytes_per_time_sample(&self) -> usize {
        self.num_channels * self.num_pols() * self.sample_width.num_bytes()
    }

    pub(crate) fn sampling_interval_ms(&self) -> f64 {
        self.sampling_interval * 1000.0
    }

    /// Does the channel-statistics stage use the time flags of the same block
    /// to exclude samples from the bandshape?
    pub(crate) fn bandshape_uses_time_flags(&self) -> bool {
        self.chan_flagging.is_some()
            && self.time_flagging.is_some()
            && self.flag_order == FlagOrder::TimeFirst
    }

    /// Does the channel-statistics stage run before the time-statistics stage?
    pub(crate) fn channel_stage_first(&self) -> bool {
        self.normalize_data || (self.chan_flagging.is_some() && !self.bandshape_uses_time_flags())
    }

    /// Are channel flags available (and used) when the zero-DM series is
    /// formed?
    pub(crate) fn zero_dm_uses_channel_flags(&self) -> bool {
        self.chan_flagging.is_some() && self.channel_stage_first()
    }

    /// Is a smoothed (or reference) bandshape needed at all?
    pub(crate) fn needs_smoothed_bandshape(&self) -> bool {
        self.normalize_data
            || matches!(
                self.chan_flagging.map(|c| c.selection),
                Some(BandshapeSelection::Normalized | BandshapeSelection::Both)
            )
    }

    /// Is the filtered 2D grid formed for each block?
    pub(crate) fn needs_filtered_grid(&self) -> bool {
        self.outputs.filtered_data.is_some() || self.replacement != ReplacementPolicy::Zero
    }

    /// The number of blocks that `num_samples` samples are split into.
    pub(crate) fn expected_num_blocks(&self, num_samples: u64) -> usize {
        let mut remaining = num_samples;
        BlockLengths::new(self.block_duration, self.sampling_interval)
            .take_while(|&len| len > 0)
            .take_while(|&len| {
                let more = remaining > 0;
                remaining = remaining.saturating_sub(len as u64);
                more
            })
            .count()
    }

    /// Attach to the input, then process blocks until the input runs dry or
    /// `cancel` is set.
    pub(crate) fn run(&self, cancel: &AtomicCell<bool>) -> Result<RunSummary, PipelineError> {
        let (mut source, expected_num_blocks): (Box<dyn BlockSource>, Option<usize>) =
            match &self.source {
                SourceKind::File(file) => {
                    let source = FileSource::new(
                        file,
                        self.start_time,
                        self.sampling_interval,
                        self.bytes_per_time_sample(),
                    )?;
                    let expected = self.expected_num_blocks(source.samples_remaining());
                    debug!("Expecting {expected} blocks");
                    (Box::new(source), Some(expected))
                }
                SourceKind::Ring(file) => {
                    let ring = MmapRing::open(file)?;
                    let source = RingSource::new(
                        ring,
                        file.display().to_string(),
                        self.bytes_per_time_sample(),
                        self.sample_width.num_bytes(),
                    )?;
                    (Box::new(source), None)
                }
            };

        // Only create the outputs once the input is known to be readable.
        let writer = OutputWriter::new(self)?;
        Pipeline::new(self).run(
            source.as_mut(),
            writer,
            &mut BlockLogger,
            cancel,
            expected_num_blocks,
        )
    }
}
