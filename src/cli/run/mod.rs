// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Arguments for a run, and their conversion into [`RunParameters`].

#[cfg(test)]
mod tests;

use std::{
    borrow::Cow,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
};

use clap::Parser;
use itertools::Itertools;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use thiserror::Error;

use super::common::{display_warnings, valid_values, InfoPrinter, Warn, ARG_FILE_HELP};
use crate::{
    constants::{
        DEFAULT_BLOCK_DURATION, DEFAULT_CHANNEL_CUTOFF, DEFAULT_FLAG_SMOOTHING_THRESHOLD,
        DEFAULT_GAIN, DEFAULT_POLYCO_COEFFS, DEFAULT_POLYCO_SPAN, DEFAULT_SMOOTHING_WINDOW,
        DEFAULT_TIME_CUTOFF, MULTI_POINT_CUTOFFS,
    },
    fold::polyco::PolycoTable,
    io::{bandshape::read_reference_bandshape, header::read_start_mjd},
    params::{
        BandshapeSelection, ChannelFlagging, FlagAlgorithm, FlagOrder, FlagSmoothing,
        NormalizationSource, OutputParams, PhaseModel, PolarizationMode, ReferenceEdge,
        ReplacementPolicy, RunParameters, SampleWidth, Sideband, SourceKind, TimeFlagging,
    },
    GptoolError,
};

lazy_static::lazy_static! {
    static ref SIDEBAND_HELP: String =
        format!("Whether frequency increases (usb) or decreases (lsb) with channel number. Values: {}. Default: usb", valid_values::<Sideband>());

    static ref REFERENCE_EDGE_HELP: String =
        format!("The band edge that dedispersion delays are relative to. Values: {}. Default: low", valid_values::<ReferenceEdge>());

    static ref CHANNEL_BANDSHAPE_HELP: String =
        format!("The bandshape that channel flagging is done on. Values: {}. Default: normalized", valid_values::<BandshapeSelection>());

    static ref CHANNEL_ALGORITHM_HELP: String =
        format!("The estimator used for channel flagging. Values: {}. Default: mad", valid_values::<FlagAlgorithm>());

    static ref TIME_ALGORITHM_HELP: String =
        format!("The estimator used for time flagging. Values: {}. Default: histogram", valid_values::<FlagAlgorithm>());

    static ref FLAG_ORDER_HELP: String =
        format!("Whether channels or time samples are flagged first. Time-first excludes flagged samples from the bandshape, but can't be used with --normalize. Values: {}. Default: channel-first", valid_values::<FlagOrder>());

    static ref REPLACEMENT_HELP: String =
        format!("What flagged samples are replaced with in the filtered data. Anything but zero also dedisperses the filtered data. Values: {}. Default: zero", valid_values::<ReplacementPolicy>());

    static ref CHANNEL_CUTOFF_HELP: String =
        format!("Channels further than this many spreads from the centre are flagged. Default: {DEFAULT_CHANNEL_CUTOFF}");

    static ref TIME_CUTOFF_HELP: String =
        format!("Time samples further than this many spreads from the centre are flagged. Default: {DEFAULT_TIME_CUTOFF}");

    static ref SMOOTHING_WINDOW_HELP: String =
        format!("The median-smoothing window of the running bandshape [channels]. Default: {DEFAULT_SMOOTHING_WINDOW}");

    static ref FLAG_SMOOTHING_THRESHOLD_HELP: String =
        format!("With --flag-smoothing-window, windows with more than this percentage of flagged samples are flagged entirely. Default: {DEFAULT_FLAG_SMOOTHING_THRESHOLD}");

    static ref BLOCK_DURATION_HELP: String =
        format!("The length of each block of data [seconds]. 0 means one pulsar period. Default: {DEFAULT_BLOCK_DURATION}");

    static ref POLYCO_SPAN_HELP: String =
        format!("The span of each polyco set [minutes]. Default: {DEFAULT_POLYCO_SPAN}");

    static ref POLYCO_COEFFS_HELP: String =
        format!("The number of coefficients of each polyco set. Default: {DEFAULT_POLYCO_COEFFS}");

    static ref GAIN_HELP: String =
        format!("Samples are multiplied by this before being quantised into the filtered data. Default: {DEFAULT_GAIN}");
}

#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
pub(super) struct RunArgs {
    #[clap(name = "ARGUMENTS_FILE", help = ARG_FILE_HELP.as_str(), parse(from_os_str))]
    pub(super) args_file: Option<PathBuf>,

    /// A raw filterbank file to read.
    #[clap(short, long, parse(from_os_str), help_heading = "INPUT")]
    pub(super) input: Option<PathBuf>,

    /// A file backing a shared-memory ring buffer (e.g. under /dev/shm) to read
    /// from instead of a file.
    #[clap(long, parse(from_os_str), help_heading = "INPUT")]
    pub(super) shm: Option<PathBuf>,

    /// The text header holding the observation's start time. Default: the
    /// input file with ".hdr" appended.
    #[clap(long, parse(from_os_str), help_heading = "INPUT")]
    pub(super) header: Option<PathBuf>,

    /// The input is filtered data written by a previous run. Nothing is
    /// flagged, normalised or replaced again.
    #[clap(long, help_heading = "INPUT")]
    #[serde(default)]
    pub(super) filtered_input: bool,

    /// Skip this much of the start of the input file [seconds].
    #[clap(long, help_heading = "INPUT")]
    pub(super) start_time: Option<f64>,

    /// Spend at least one block duration on each block, as if the file was
    /// being recorded.
    #[clap(long, help_heading = "INPUT")]
    #[serde(default)]
    pub(super) simulate_realtime: bool,

    /// The number of frequency channels.
    #[clap(long, help_heading = "OBSERVATION")]
    pub(super) num_channels: Option<usize>,

    /// The size of each sample [bytes]. 1 and 2 are integers; 4 is a float.
    #[clap(long, help_heading = "OBSERVATION")]
    pub(super) sample_width: Option<u8>,

    /// The data has four interleaved polarisation products rather than total
    /// intensity.
    #[clap(long, help_heading = "OBSERVATION")]
    #[serde(default)]
    pub(super) full_polarization: bool,

    /// The lowest frequency of the band [MHz].
    #[clap(long, help_heading = "OBSERVATION")]
    pub(super) lowest_freq: Option<f64>,

    /// The bandwidth [MHz].
    #[clap(long, help_heading = "OBSERVATION")]
    pub(super) bandwidth: Option<f64>,

    #[clap(long, help = SIDEBAND_HELP.as_str(), help_heading = "OBSERVATION")]
    pub(super) sideband: Option<String>,

    /// The sampling interval [milliseconds].
    #[clap(long, help_heading = "OBSERVATION")]
    pub(super) sampling_interval: Option<f64>,

    /// The pulsar's name. Only used in messages.
    #[clap(long, help_heading = "PULSAR")]
    pub(super) pulsar: Option<String>,

    /// Fold with this fixed period [milliseconds].
    #[clap(long, help_heading = "PULSAR")]
    pub(super) period: Option<f64>,

    /// Fold with the ephemeris in this polyco file.
    #[clap(long, parse(from_os_str), help_heading = "PULSAR")]
    pub(super) polyco: Option<PathBuf>,

    #[clap(long, help = POLYCO_SPAN_HELP.as_str(), help_heading = "PULSAR")]
    pub(super) polyco_span: Option<f64>,

    #[clap(long, help = POLYCO_COEFFS_HELP.as_str(), help_heading = "PULSAR")]
    pub(super) polyco_coeffs: Option<usize>,

    /// The MJD of the first sample. Default: read from the header.
    #[clap(long, help_heading = "PULSAR")]
    pub(super) mjd: Option<f64>,

    /// The dispersion measure [pc cm^-3]. A negative value (or none, when a
    /// polyco file is given) uses the DM of the polyco file.
    #[clap(long, allow_hyphen_values = true, help_heading = "PULSAR")]
    pub(super) dm: Option<f64>,

    #[clap(long, help = REFERENCE_EDGE_HELP.as_str(), help_heading = "PULSAR")]
    pub(super) reference_edge: Option<String>,

    /// The number of bins in the folded profile. -1 (the default) gives one
    /// bin per sample of the period.
    #[clap(long, allow_hyphen_values = true, help_heading = "PULSAR")]
    pub(super) bins: Option<i64>,

    /// Shift the folded profile by this phase; between 0 and 1.
    #[clap(long, help_heading = "PULSAR")]
    pub(super) profile_offset: Option<f64>,

    /// Only filter the data; don't dedisperse or fold it.
    #[clap(long, help_heading = "PULSAR")]
    #[serde(default)]
    pub(super) no_dedispersion: bool,

    #[clap(long, help = BLOCK_DURATION_HELP.as_str(), help_heading = "PROCESSING")]
    pub(super) block_duration: Option<f64>,

    /// The first channel to analyse. Default: 0
    #[clap(long, help_heading = "PROCESSING")]
    pub(super) start_channel: Option<usize>,

    /// One past the last channel to analyse. Default: the number of channels
    #[clap(long, help_heading = "PROCESSING")]
    pub(super) stop_channel: Option<usize>,

    /// Ranges of channels that are always flagged, each given as START:END
    /// (END is excluded), e.g. 200:400 1200:1400.
    #[clap(long, multiple_values(true), help_heading = "PROCESSING")]
    pub(super) bad_channels: Option<Vec<String>>,

    /// Don't flag channels.
    #[clap(long, help_heading = "FLAGGING")]
    #[serde(default)]
    pub(super) no_channel_flagging: bool,

    #[clap(long, help = CHANNEL_BANDSHAPE_HELP.as_str(), help_heading = "FLAGGING")]
    pub(super) channel_flag_bandshape: Option<String>,

    #[clap(long, help = CHANNEL_ALGORITHM_HELP.as_str(), help_heading = "FLAGGING")]
    pub(super) channel_flag_algorithm: Option<String>,

    #[clap(long, help = CHANNEL_CUTOFF_HELP.as_str(), help_heading = "FLAGGING")]
    pub(super) channel_cutoff: Option<f32>,

    /// Don't flag time samples.
    #[clap(long, help_heading = "FLAGGING")]
    #[serde(default)]
    pub(super) no_time_flagging: bool,

    #[clap(long, help = TIME_ALGORITHM_HELP.as_str(), help_heading = "FLAGGING")]
    pub(super) time_flag_algorithm: Option<String>,

    #[clap(long, help = TIME_CUTOFF_HELP.as_str(), help_heading = "FLAGGING")]
    pub(super) time_cutoff: Option<f32>,

    /// Also flag pairs of adjacent samples that are both beyond a lower
    /// cutoff. The time cutoff must be between 1 and 10.
    #[clap(long, help_heading = "FLAGGING")]
    #[serde(default)]
    pub(super) multi_point: bool,

    /// Flag whole windows of this length that have too many flagged samples
    /// [seconds].
    #[clap(long, help_heading = "FLAGGING")]
    pub(super) flag_smoothing_window: Option<f64>,

    #[clap(long, help = FLAG_SMOOTHING_THRESHOLD_HELP.as_str(), help_heading = "FLAGGING")]
    pub(super) flag_smoothing_threshold: Option<f32>,

    #[clap(long, help = FLAG_ORDER_HELP.as_str(), help_heading = "FLAGGING")]
    pub(super) flag_order: Option<String>,

    /// Divide the data by the smoothed (or reference) bandshape before
    /// flagging time samples.
    #[clap(long, help_heading = "NORMALISATION")]
    #[serde(default)]
    pub(super) normalize: bool,

    #[clap(long, help = SMOOTHING_WINDOW_HELP.as_str(), help_heading = "NORMALISATION")]
    pub(super) smoothing_window: Option<usize>,

    /// Normalise with the bandshape in this file (lines of "channel value")
    /// instead of the running smoothed bandshape.
    #[clap(long, parse(from_os_str), help_heading = "NORMALISATION")]
    pub(super) reference_bandshape: Option<PathBuf>,

    #[clap(long, help = REPLACEMENT_HELP.as_str(), help_heading = "NORMALISATION")]
    pub(super) replacement: Option<String>,

    /// Subtract the zero-DM time series (scaled by the normalised bandshape)
    /// from every channel.
    #[clap(long, help_heading = "NORMALISATION")]
    #[serde(default)]
    pub(super) zero_dm_subtraction: bool,

    /// The directory that products are written into. Default: the current
    /// directory
    #[clap(short, long, parse(from_os_str), help_heading = "OUTPUT")]
    pub(super) output_dir: Option<PathBuf>,

    /// Write the filtered data to <output-dir>/<input name>.gpt.
    #[clap(long, help_heading = "OUTPUT")]
    #[serde(default)]
    pub(super) write_filtered: bool,

    /// Write the channel flags of each block.
    #[clap(long, help_heading = "OUTPUT")]
    #[serde(default)]
    pub(super) write_chan_flags: bool,

    /// Write the time flags of each block.
    #[clap(long, help_heading = "OUTPUT")]
    #[serde(default)]
    pub(super) write_time_flags: bool,

    /// Write the dedispersed time series.
    #[clap(long, help_heading = "OUTPUT")]
    #[serde(default)]
    pub(super) write_dedispersed: bool,

    #[clap(long, help = GAIN_HELP.as_str(), help_heading = "OUTPUT")]
    pub(super) gain: Option<f32>,
}

impl RunArgs {
    /// Both command-line and file arguments overlap in terms of what is
    /// available; this function consolidates everything that was specified into
    /// a single struct. Where applicable, it will prefer CLI parameters over
    /// those in the file.
    ///
    /// This function should only ever merge arguments, and not try to make
    /// sense of them.
    pub(super) fn merge(self) -> Result<RunArgs, GptoolError> {
        debug!("Merging command-line arguments with the argument file");

        let cli_args = self;

        if let Some(arg_file) = cli_args.args_file {
            // Read in the file arguments. Ensure all of the file args are
            // accounted for by pattern matching.
            let RunArgs {
                args_file: _,
                input,
                shm,
                header,
                filtered_input,
                start_time,
                simulate_realtime,
                num_channels,
                sample_width,
                full_polarization,
                lowest_freq,
                bandwidth,
                sideband,
                sampling_interval,
                pulsar,
                period,
                polyco,
                polyco_span,
                polyco_coeffs,
                mjd,
                dm,
                reference_edge,
                bins,
                profile_offset,
                no_dedispersion,
                block_duration,
                start_channel,
                stop_channel,
                bad_channels,
                no_channel_flagging,
                channel_flag_bandshape,
                channel_flag_algorithm,
                channel_cutoff,
                no_time_flagging,
                time_flag_algorithm,
                time_cutoff,
                multi_point,
                flag_smoothing_window,
                flag_smoothing_threshold,
                flag_order,
                normalize,
                smoothing_window,
                reference_bandshape,
                replacement,
                zero_dm_subtraction,
                output_dir,
                write_filtered,
                write_chan_flags,
                write_time_flags,
                write_dedispersed,
                gain,
            } = unpack_arg_file!(arg_file);

            // Merge all the arguments, preferring the CLI args when available.
            Ok(RunArgs {
                args_file: None,
                input: cli_args.input.or(input),
                shm: cli_args.shm.or(shm),
                header: cli_args.header.or(header),
                filtered_input: cli_args.filtered_input || filtered_input,
                start_time: cli_args.start_time.or(start_time),
                simulate_realtime: cli_args.simulate_realtime || simulate_realtime,
                num_channels: cli_args.num_channels.or(num_channels),
                sample_width: cli_args.sample_width.or(sample_width),
                full_polarization: cli_args.full_polarization || full_polarization,
                lowest_freq: cli_args.lowest_freq.or(lowest_freq),
                bandwidth: cli_args.bandwidth.or(bandwidth),
                sideband: cli_args.sideband.or(sideband),
                sampling_interval: cli_args.sampling_interval.or(sampling_interval),
                pulsar: cli_args.pulsar.or(pulsar),
                period: cli_args.period.or(period),
                polyco: cli_args.polyco.or(polyco),
                polyco_span: cli_args.polyco_span.or(polyco_span),
                polyco_coeffs: cli_args.polyco_coeffs.or(polyco_coeffs),
                mjd: cli_args.mjd.or(mjd),
                dm: cli_args.dm.or(dm),
                reference_edge: cli_args.reference_edge.or(reference_edge),
                bins: cli_args.bins.or(bins),
                profile_offset: cli_args.profile_offset.or(profile_offset),
                no_dedispersion: cli_args.no_dedispersion || no_dedispersion,
                block_duration: cli_args.block_duration.or(block_duration),
                start_channel: cli_args.start_channel.or(start_channel),
                stop_channel: cli_args.stop_channel.or(stop_channel),
                bad_channels: cli_args.bad_channels.or(bad_channels),
                no_channel_flagging: cli_args.no_channel_flagging || no_channel_flagging,
                channel_flag_bandshape: cli_args
                    .channel_flag_bandshape
                    .or(channel_flag_bandshape),
                channel_flag_algorithm: cli_args
                    .channel_flag_algorithm
                    .or(channel_flag_algorithm),
                channel_cutoff: cli_args.channel_cutoff.or(channel_cutoff),
                no_time_flagging: cli_args.no_time_flagging || no_time_flagging,
                time_flag_algorithm: cli_args.time_flag_algorithm.or(time_flag_algorithm),
                time_cutoff: cli_args.time_cutoff.or(time_cutoff),
                multi_point: cli_args.multi_point || multi_point,
                flag_smoothing_window: cli_args.flag_smoothing_window.or(flag_smoothing_window),
                flag_smoothing_threshold: cli_args
                    .flag_smoothing_threshold
                    .or(flag_smoothing_threshold),
                flag_order: cli_args.flag_order.or(flag_order),
                normalize: cli_args.normalize || normalize,
                smoothing_window: cli_args.smoothing_window.or(smoothing_window),
                reference_bandshape: cli_args.reference_bandshape.or(reference_bandshape),
                replacement: cli_args.replacement.or(replacement),
                zero_dm_subtraction: cli_args.zero_dm_subtraction || zero_dm_subtraction,
                output_dir: cli_args.output_dir.or(output_dir),
                write_filtered: cli_args.write_filtered || write_filtered,
                write_chan_flags: cli_args.write_chan_flags || write_chan_flags,
                write_time_flags: cli_args.write_time_flags || write_time_flags,
                write_dedispersed: cli_args.write_dedispersed || write_dedispersed,
                gain: cli_args.gain.or(gain),
            })
        } else {
            Ok(cli_args)
        }
    }

    pub(super) fn parse(self) -> Result<RunParameters, GptoolError> {
        debug!("{:#?}", self);

        let Self {
            args_file: _,
            input,
            shm,
            header,
            filtered_input,
            start_time,
            simulate_realtime,
            num_channels,
            sample_width,
            full_polarization,
            lowest_freq,
            bandwidth,
            sideband,
            sampling_interval,
            pulsar,
            period,
            polyco,
            polyco_span,
            polyco_coeffs,
            mjd,
            dm,
            reference_edge,
            bins,
            profile_offset,
            no_dedispersion,
            block_duration,
            start_channel,
            stop_channel,
            bad_channels,
            mut no_channel_flagging,
            channel_flag_bandshape,
            channel_flag_algorithm,
            channel_cutoff,
            mut no_time_flagging,
            time_flag_algorithm,
            time_cutoff,
            multi_point,
            flag_smoothing_window,
            flag_smoothing_threshold,
            flag_order,
            mut normalize,
            smoothing_window,
            reference_bandshape,
            replacement,
            zero_dm_subtraction,
            output_dir,
            mut write_filtered,
            write_chan_flags,
            write_time_flags,
            write_dedispersed,
            gain,
        } = self;

        let mut problems = Problems::default();

        // Everything else depends on these.
        let source = match (input, shm) {
            (Some(file), None) => Some(SourceKind::File(file)),
            (None, Some(ring)) => Some(SourceKind::Ring(ring)),
            (Some(_), Some(_)) => {
                problems.push("Only one of --input and --shm may be given");
                None
            }
            (None, None) => {
                problems.push("No input was given; use --input or --shm");
                None
            }
        };
        let num_channels = problems.require(num_channels, "--num-channels");
        let sample_width = problems
            .require(sample_width, "--sample-width")
            .and_then(|n| {
                let width = SampleWidth::from_num_bytes(n);
                if width.is_none() {
                    problems.push(format!("--sample-width must be 1, 2 or 4 (bytes), not {n}"));
                }
                width
            });
        let lowest_freq_mhz = problems.require_positive(lowest_freq, "--lowest-freq");
        let bandwidth_mhz = problems.require_positive(bandwidth, "--bandwidth");
        let sampling_interval_ms =
            problems.require_positive(sampling_interval, "--sampling-interval");
        let (
            Some(source),
            Some(num_channels),
            Some(sample_width),
            Some(lowest_freq_mhz),
            Some(bandwidth_mhz),
            Some(sampling_interval_ms),
        ) = (
            source,
            num_channels,
            sample_width,
            lowest_freq_mhz,
            bandwidth_mhz,
            sampling_interval_ms,
        )
        else {
            return Err(problems.into_error());
        };
        if num_channels == 0 {
            problems.push("--num-channels must be positive");
        }
        let sampling_interval = sampling_interval_ms / 1000.0;

        // Choices.
        let sideband = problems.choice(sideband, Sideband::Upper, "--sideband");
        let reference_edge =
            problems.choice(reference_edge, ReferenceEdge::Low, "--reference-edge");
        let selection = problems.choice(
            channel_flag_bandshape,
            BandshapeSelection::Normalized,
            "--channel-flag-bandshape",
        );
        let channel_algorithm =
            problems.choice(channel_flag_algorithm, FlagAlgorithm::Mad, "--channel-flag-algorithm");
        let time_algorithm =
            problems.choice(time_flag_algorithm, FlagAlgorithm::Histogram, "--time-flag-algorithm");
        let flag_order = problems.choice(flag_order, FlagOrder::ChannelFirst, "--flag-order");
        let mut replacement =
            problems.choice(replacement, ReplacementPolicy::Zero, "--replacement");

        if filtered_input {
            let mut ignored = vec![];
            if !no_channel_flagging || !no_time_flagging {
                ignored.push("flagging");
            }
            if normalize {
                ignored.push("--normalize");
            }
            if replacement != ReplacementPolicy::Zero {
                ignored.push("--replacement");
            }
            if write_filtered {
                ignored.push("--write-filtered");
            }
            if !ignored.is_empty() {
                format!(
                    "The input is already filtered; ignoring {}",
                    ignored.iter().join(", ")
                )
                .warn();
            }
            no_channel_flagging = true;
            no_time_flagging = true;
            normalize = false;
            replacement = ReplacementPolicy::Zero;
            write_filtered = false;
        }

        // Channels.
        let start_channel = start_channel.unwrap_or(0);
        let stop_channel = stop_channel.unwrap_or(num_channels);
        if stop_channel > num_channels {
            problems.push(format!(
                "--stop-channel ({stop_channel}) can't be more than the number of channels ({num_channels})"
            ));
        }
        if start_channel >= stop_channel {
            problems.push(format!(
                "--start-channel ({start_channel}) must be less than --stop-channel ({stop_channel})"
            ));
        }
        let mut bad_channel_ranges = vec![];
        for (i, range) in bad_channels.unwrap_or_default().iter().enumerate() {
            match parse_channel_range(range) {
                Some((start, end)) if start < end && end <= num_channels => {
                    bad_channel_ranges.push((start, end))
                }
                Some(_) => problems.push(format!(
                    "Bad channel range {} ('{range}') must have START < END <= {num_channels}",
                    i + 1
                )),
                None => problems.push(format!(
                    "Couldn't parse bad channel range {} ('{range}'); expected START:END",
                    i + 1
                )),
            }
        }

        // Flagging.
        let chan_flagging = if no_channel_flagging {
            None
        } else {
            let cutoff = channel_cutoff.unwrap_or(DEFAULT_CHANNEL_CUTOFF);
            if cutoff <= 0.0 {
                problems.push("--channel-cutoff must be positive");
            }
            Some(ChannelFlagging {
                selection,
                algorithm: channel_algorithm,
                cutoff,
            })
        };
        let time_flagging = if no_time_flagging {
            None
        } else {
            let cutoff = time_cutoff.unwrap_or(DEFAULT_TIME_CUTOFF);
            if cutoff <= 0.0 {
                problems.push("--time-cutoff must be positive");
            }
            let (min_ratio, max_ratio) = (MULTI_POINT_CUTOFFS[0].0, MULTI_POINT_CUTOFFS[90].0);
            if multi_point && !(min_ratio..=max_ratio).contains(&cutoff) {
                problems.push(format!(
                    "With --multi-point, --time-cutoff must be between {min_ratio} and {max_ratio}"
                ));
            }
            let smoothing = match flag_smoothing_window {
                Some(window) if window > 0.0 => {
                    let percent =
                        flag_smoothing_threshold.unwrap_or(DEFAULT_FLAG_SMOOTHING_THRESHOLD);
                    if !(0.0..=100.0).contains(&percent) {
                        problems.push("--flag-smoothing-threshold must be a percentage");
                    }
                    let samples = (window / sampling_interval).round() as usize;
                    if samples == 0 {
                        problems.push("--flag-smoothing-window is shorter than one sample");
                    }
                    Some(FlagSmoothing {
                        window: samples,
                        threshold: 1.0 - percent / 100.0,
                    })
                }
                Some(_) => {
                    problems.push("--flag-smoothing-window must be positive");
                    None
                }
                None => None,
            };
            Some(TimeFlagging {
                algorithm: time_algorithm,
                cutoff,
                multi_point,
                smoothing,
            })
        };
        if no_time_flagging && (multi_point || flag_smoothing_window.is_some()) {
            "Time flagging is off; ignoring --multi-point and --flag-smoothing-window".warn();
        }
        if flag_order == FlagOrder::TimeFirst && normalize {
            problems.push("--flag-order time-first can't be used with --normalize; flag channels first instead");
        }
        if replacement == ReplacementPolicy::Mode && !normalize {
            problems.push("--replacement mode needs normalised data (--normalize)");
        }
        if replacement != ReplacementPolicy::Zero && time_flagging.is_none() {
            problems.push(format!("--replacement {replacement} needs time flagging"));
        }
        let needs_smoothed = normalize
            || matches!(
                chan_flagging.map(|c| c.selection),
                Some(BandshapeSelection::Normalized | BandshapeSelection::Both)
            );
        if replacement == ReplacementPolicy::SmoothBandshape && !needs_smoothed {
            problems.push("--replacement smooth-bandshape needs a smoothed bandshape; use --normalize or flag channels on the normalised bandshape");
        }
        if needs_smoothed && reference_bandshape.is_none() {
            let window = smoothing_window.unwrap_or(DEFAULT_SMOOTHING_WINDOW);
            if window == 0 || window >= num_channels {
                problems.push(format!(
                    "--smoothing-window ({window}) must be positive and less than the number of channels ({num_channels})"
                ));
            }
        }

        // Files.
        if let SourceKind::File(file) = &source {
            if !file.is_file() {
                problems.push(format!("Input file '{}' doesn't exist", file.display()));
            }
        }
        let header = match (&source, header) {
            (_, Some(header)) => {
                if !header.is_file() {
                    problems.push(format!("Header file '{}' doesn't exist", header.display()));
                }
                Some(header)
            }
            (SourceKind::File(file), None) => Some(append_extension(file, "hdr")),
            (SourceKind::Ring(_), None) => None,
        };
        for (file, arg) in [(&polyco, "--polyco"), (&reference_bandshape, "--reference-bandshape")] {
            if let Some(file) = file {
                if !file.is_file() {
                    problems.push(format!("{arg} file '{}' doesn't exist", file.display()));
                }
            }
        }

        // Folding.
        let dedisperse = !no_dedispersion;
        if dedisperse {
            match (&period, &polyco) {
                (Some(_), Some(_)) => problems.push("Only one of --period and --polyco may be given"),
                (None, None) => {
                    problems.push("Folding needs a period; use --period or --polyco (or don't fold with --no-dedispersion)")
                }
                _ => (),
            }
            if matches!(period, Some(p) if p <= 0.0) {
                problems.push("--period must be positive");
            }
            if polyco.is_none() && dm.map_or(true, |d| d < 0.0) {
                problems.push("--dm is required unless a polyco file supplies it");
            }
            if polyco.is_some() && mjd.is_none() && header.is_none() {
                problems.push("--mjd is required to use a polyco file with --shm");
            }
        } else if polyco.is_some() {
            "Nothing is folded; ignoring --polyco".warn();
        }
        let profile_offset = profile_offset.unwrap_or(0.0);
        if !(0.0..=1.0).contains(&profile_offset) {
            problems.push("--profile-offset must be between 0 and 1");
        }
        let start_time = start_time.unwrap_or(0.0);
        if start_time < 0.0 {
            problems.push("--start-time can't be negative");
        } else if start_time > 0.0 && matches!(source, SourceKind::Ring(_)) {
            "Ignoring --start-time; reading starts wherever the shared-memory writer is".warn();
        }
        let gain = gain.unwrap_or(DEFAULT_GAIN);
        if gain <= 0.0 {
            problems.push("--gain must be positive");
        }
        if !problems.is_empty() {
            return Err(problems.into_error());
        }

        // Everything that reads other files.
        let normalization = match &reference_bandshape {
            Some(file) => NormalizationSource::External(read_reference_bandshape(file, num_channels)?),
            None => NormalizationSource::Smoothed {
                window: smoothing_window.unwrap_or(DEFAULT_SMOOTHING_WINDOW),
            },
        };
        let phase_model = match (&polyco, period) {
            (Some(file), _) if dedisperse => {
                let span = polyco_span.unwrap_or(DEFAULT_POLYCO_SPAN);
                let table =
                    PolycoTable::read(file, polyco_coeffs.unwrap_or(DEFAULT_POLYCO_COEFFS), span)?;
                let mjd_obs = match (mjd, &header) {
                    (Some(mjd), _) => mjd,
                    (None, Some(header)) => read_start_mjd(header)?,
                    (None, None) => {
                        return Err(ParamsError::Invalid(vec![
                            "--mjd is required to use a polyco file with --shm".to_string(),
                        ])
                        .into())
                    }
                };
                let initial_row = table.starting_row(mjd_obs)?;
                PhaseModel::Polyco {
                    table,
                    mjd_obs,
                    initial_row,
                }
            }
            // Without folding, a period is only needed for one-period blocks.
            (_, period) => PhaseModel::Fixed {
                period_ms: period.unwrap_or(0.0),
            },
        };
        let period_ms = match &phase_model {
            PhaseModel::Fixed { period_ms } => *period_ms,
            PhaseModel::Polyco {
                table,
                mjd_obs,
                initial_row,
            } => table.period_ms(*initial_row, *mjd_obs),
        };
        let dm = match (dm, &phase_model) {
            (Some(dm), _) if dm >= 0.0 => dm,
            (_, PhaseModel::Polyco { table, .. }) => {
                debug!("Using the DM of the polyco file");
                table.dm()
            }
            _ => 0.0,
        };

        let block_duration = match block_duration.unwrap_or(DEFAULT_BLOCK_DURATION) {
            d if d == 0.0 => period_ms / 1000.0,
            d => d,
        };
        if block_duration < sampling_interval {
            problems.push(format!(
                "Blocks ({block_duration} s) must be at least one sample ({sampling_interval} s) long"
            ));
        }
        let profile_bins = if dedisperse {
            match bins.unwrap_or(-1) {
                -1 => (period_ms / sampling_interval_ms).round() as usize,
                b if b > 0 => b as usize,
                b => {
                    problems.push(format!("--bins must be positive or -1, not {b}"));
                    0
                }
            }
        } else {
            // Nothing is folded.
            0
        };
        if dedisperse && profile_bins == 0 {
            problems.push("The folded profile would have no bins");
        }
        if !problems.is_empty() {
            return Err(problems.into_error());
        }

        // Folding starts at the first sample read, so the phase of the
        // skipped part of the file carries over.
        let mut profile_offset = profile_offset;
        if dedisperse && start_time > 0.0 && matches!(source, SourceKind::File(_)) {
            let periods_skipped = start_time * 1000.0 / period_ms;
            profile_offset += periods_skipped.fract();
            if profile_offset >= 1.0 {
                profile_offset -= 1.0;
            }
            debug!("Profile offset after skipping {start_time} s: {profile_offset}");
        }

        let output_dir = output_dir.unwrap_or_else(|| PathBuf::from("."));
        let (filtered_data, copy_header) = if write_filtered {
            match &source {
                SourceKind::File(file) => {
                    let name = file
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "filtered".to_string());
                    let copy_header = header.clone().filter(|h| h.is_file());
                    if copy_header.is_none() {
                        "No header was found to copy alongside the filtered data".warn();
                    }
                    (Some(output_dir.join(format!("{name}.gpt"))), copy_header)
                }
                SourceKind::Ring(_) => (Some(output_dir.join("filtered.gpt")), None),
            }
        } else {
            (None, None)
        };

        let polarization = if full_polarization {
            PolarizationMode::Full
        } else {
            PolarizationMode::Intensity
        };
        let params = RunParameters {
            source,
            outputs: OutputParams {
                dir: output_dir,
                filtered_data,
                copy_header,
                chan_flags: write_chan_flags,
                time_flags: write_time_flags,
                dedispersed: write_dedispersed,
            },
            num_channels,
            sample_width,
            polarization,
            lowest_freq_mhz,
            bandwidth_mhz,
            sideband,
            sampling_interval,
            pulsar_name: pulsar.unwrap_or_else(|| "unknown".to_string()),
            dm,
            reference_edge,
            phase_model,
            profile_bins,
            profile_offset,
            block_duration,
            start_time,
            start_channel,
            stop_channel,
            bad_channel_ranges,
            chan_flagging,
            time_flagging,
            flag_order,
            normalization,
            normalize_data: normalize,
            replacement,
            zero_dm_subtraction,
            dedisperse,
            gain,
            simulate_realtime,
        };
        print_summary(&params, filtered_input);
        display_warnings();

        Ok(params)
    }

    pub(super) fn run(self, dry_run: bool) -> Result<(), GptoolError> {
        debug!("Converting arguments into parameters");
        trace!("{:#?}", self);
        let params = self.parse()?;

        if dry_run {
            info!("Dry run -- exiting now.");
            return Ok(());
        }

        let summary = params.run(super::interrupt::catch_interrupts())?;
        if summary.interrupted {
            warn!(
                "Interrupted; wrote {} blocks ({} samples read)",
                summary.blocks_written, summary.samples_consumed
            );
        } else {
            info!(
                "Wrote {} blocks ({} samples read)",
                summary.blocks_written, summary.samples_consumed
            );
        }
        Ok(())
    }
}

/// Problems with the arguments, collected so they can all be reported at once.
#[derive(Default)]
struct Problems(Vec<String>);

impl Problems {
    fn push<S: Into<String>>(&mut self, problem: S) {
        self.0.push(problem.into());
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn require<T>(&mut self, value: Option<T>, arg: &str) -> Option<T> {
        if value.is_none() {
            self.push(format!("{arg} is required"));
        }
        value
    }

    fn require_positive(&mut self, value: Option<f64>, arg: &str) -> Option<f64> {
        match self.require(value, arg) {
            Some(v) if v <= 0.0 => {
                self.push(format!("{arg} must be positive"));
                None
            }
            v => v,
        }
    }

    /// Parse one of the values of an enum, or use the default if nothing was
    /// given.
    fn choice<T>(&mut self, value: Option<String>, default: T, arg: &str) -> T
    where
        T: FromStr + IntoEnumIterator + Display,
    {
        match value {
            None => default,
            Some(s) => match T::from_str(&s.to_lowercase()) {
                Ok(v) => v,
                Err(_) => {
                    self.push(format!(
                        "'{s}' isn't a valid value for {arg}; valid values are: {}",
                        valid_values::<T>()
                    ));
                    default
                }
            },
        }
    }

    fn into_error(self) -> GptoolError {
        ParamsError::Invalid(self.0).into()
    }
}

#[derive(Error, Debug)]
pub(crate) enum ParamsError {
    #[error("Invalid arguments:\n{}", .0.iter().map(|p| format!("  - {p}")).join("\n"))]
    Invalid(Vec<String>),
}

/// Parse "START:END".
fn parse_channel_range(s: &str) -> Option<(usize, usize)> {
    let (start, end) = s.split_once(':')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

/// e.g. "data.raw" becomes "data.raw.hdr".
fn append_extension(file: &Path, extension: &str) -> PathBuf {
    let mut s = file.as_os_str().to_owned();
    s.push(".");
    s.push(extension);
    PathBuf::from(s)
}

fn print_summary(params: &RunParameters, filtered_input: bool) {
    let mut printer = InfoPrinter::new("Run set up".into());

    let mut block: Vec<Cow<'static, str>> = match &params.source {
        SourceKind::File(file) => vec![format!("Input file: {}", file.display()).into()],
        SourceKind::Ring(file) => vec![format!("Shared-memory ring: {}", file.display()).into()],
    };
    if filtered_input {
        block.push("Previously filtered data; nothing is flagged".into());
    }
    if params.start_time > 0.0 {
        block.push(format!("Starting {} s in", params.start_time).into());
    }
    printer.push_block(block);

    printer.push_block(vec![
        format!(
            "{} channels from {} MHz over {} MHz ({})",
            params.num_channels, params.lowest_freq_mhz, params.bandwidth_mhz, params.sideband
        )
        .into(),
        format!(
            "{} byte samples every {} ms, {}",
            params.sample_width.num_bytes(),
            params.sampling_interval_ms(),
            match params.polarization {
                PolarizationMode::Intensity => "total intensity",
                PolarizationMode::Full => "full polarisation",
            }
        )
        .into(),
        format!(
            "Analysing channels {} to {}; blocks of {} s",
            params.start_channel, params.stop_channel, params.block_duration
        )
        .into(),
    ]);

    if params.dedisperse {
        let mut block: Vec<Cow<'static, str>> = vec![format!(
            "Pulsar {}: DM {} pc/cc relative to the {} band edge",
            params.pulsar_name, params.dm, params.reference_edge
        )
        .into()];
        match &params.phase_model {
            PhaseModel::Fixed { period_ms } => {
                block.push(format!("Fixed period: {period_ms} ms").into())
            }
            PhaseModel::Polyco {
                table,
                mjd_obs,
                initial_row,
            } => {
                block.push(format!("Polyco: {} (set {})", table.file, initial_row + 1).into());
                block.push(format!("Observation MJD: {mjd_obs}").into());
                block.push(
                    format!("Period at the start: {} ms", table.period_ms(*initial_row, *mjd_obs))
                        .into(),
                );
            }
        }
        block.push(
            format!(
                "{} profile bins, offset by {}",
                params.profile_bins, params.profile_offset
            )
            .into(),
        );
        printer.push_block(block);
    } else {
        printer.push_line("Filtering only; nothing is dedispersed or folded".into());
    }

    let mut block: Vec<Cow<'static, str>> = vec![];
    match params.chan_flagging {
        Some(c) => block.push(
            format!(
                "Channel flagging: {} bandshape, {} at {}",
                c.selection, c.algorithm, c.cutoff
            )
            .into(),
        ),
        None => block.push("No channel flagging".into()),
    }
    match params.time_flagging {
        Some(t) => {
            block.push(
                format!(
                    "Time flagging: {} at {}{}",
                    t.algorithm,
                    t.cutoff,
                    if t.multi_point { " (multi-point)" } else { "" }
                )
                .into(),
            );
            if let Some(s) = t.smoothing {
                block.push(
                    format!(
                        "Windows of {} samples less than {}% unflagged are flagged",
                        s.window,
                        s.threshold * 100.0
                    )
                    .into(),
                );
            }
        }
        None => block.push("No time flagging".into()),
    }
    if !params.bad_channel_ranges.is_empty() {
        block.push(
            format!(
                "Always flagged: {}",
                params
                    .bad_channel_ranges
                    .iter()
                    .map(|(s, e)| format!("{s}:{e}"))
                    .join(" ")
            )
            .into(),
        );
    }
    block.push(format!("Flag order: {}", params.flag_order).into());
    if params.normalize_data {
        block.push(
            match &params.normalization {
                NormalizationSource::Smoothed { window } => {
                    format!("Normalising with a {window}-channel smoothed bandshape")
                }
                NormalizationSource::External(_) => {
                    "Normalising with a reference bandshape".to_string()
                }
            }
            .into(),
        );
    }
    if params.zero_dm_subtraction {
        block.push("Subtracting the zero-DM series".into());
    }
    block.push(format!("Flagged samples replaced with: {}", params.replacement).into());
    printer.push_block(block);

    let mut block: Vec<Cow<'static, str>> =
        vec![format!("Output directory: {}", params.outputs.dir.display()).into()];
    if let Some(file) = &params.outputs.filtered_data {
        block.push(format!("Filtered data: {}", file.display()).into());
    }
    printer.push_block(block);

    printer.display();
}
