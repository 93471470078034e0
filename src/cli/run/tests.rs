// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use approx::assert_abs_diff_eq;
use clap::Parser;
use indoc::{formatdoc, indoc};
use tempfile::{tempdir, TempDir};

use super::*;

const NUM_CHANNELS: usize = 64;

/// 100 samples of 64 16-bit channels.
fn write_input(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = fs::File::create(&path).unwrap();
    for t in 0..100u16 {
        for c in 0..NUM_CHANNELS as u16 {
            file.write_all(&(1000 + (t + c) % 5).to_le_bytes()).unwrap();
        }
    }
    path
}

/// Arguments describing a 64-channel, 1 ms observation in `dir`. Nothing about
/// folding is included.
fn observation_args(dir: &TempDir, input: &Path) -> Vec<String> {
    [
        "gptool",
        "-i",
        &input.display().to_string(),
        "--num-channels",
        "64",
        "--sample-width",
        "2",
        "--lowest-freq",
        "300",
        "--bandwidth",
        "16",
        "--sampling-interval",
        "1",
        "-o",
        &dir.path().join("out").display().to_string(),
    ]
    .into_iter()
    .map(|s| s.to_string())
    .collect()
}

/// [`observation_args`] folding with a 10 ms period.
fn folding_args(dir: &TempDir, input: &Path) -> Vec<String> {
    let mut args = observation_args(dir, input);
    args.extend(["--period", "10", "--dm", "5"].map(|s| s.to_string()));
    args
}

fn parse_with(mut args: Vec<String>, extra: &[&str]) -> Result<RunParameters, GptoolError> {
    args.extend(extra.iter().map(|s| s.to_string()));
    RunArgs::parse_from(args).merge()?.parse()
}

fn args_error(result: Result<RunParameters, GptoolError>) -> String {
    match result {
        Err(GptoolError::Args(msg)) => msg,
        Err(e) => panic!("Expected an argument error, got: {e}"),
        Ok(_) => panic!("Expected an argument error, but parsing succeeded"),
    }
}

#[test]
fn test_defaults() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), "data.raw");
    let params = parse_with(folding_args(&dir, &input), &[]).unwrap();

    assert_eq!(params.source, SourceKind::File(input));
    assert_eq!(params.num_channels, 64);
    assert_eq!(params.sample_width, SampleWidth::Int16);
    assert_eq!(params.polarization, PolarizationMode::Intensity);
    assert_eq!(params.sideband, Sideband::Upper);
    assert_eq!(params.reference_edge, ReferenceEdge::Low);
    assert_abs_diff_eq!(params.sampling_interval, 1e-3);
    assert_abs_diff_eq!(params.block_duration, DEFAULT_BLOCK_DURATION);
    assert_abs_diff_eq!(params.dm, 5.0);
    assert!(matches!(params.phase_model, PhaseModel::Fixed { period_ms } if period_ms == 10.0));
    // One bin per sample of the period.
    assert_eq!(params.profile_bins, 10);
    assert_eq!(params.profile_offset, 0.0);
    assert_eq!(params.channel_range(), 0..NUM_CHANNELS);
    assert!(params.bad_channel_ranges.is_empty());
    assert_eq!(
        params.chan_flagging,
        Some(ChannelFlagging {
            selection: BandshapeSelection::Normalized,
            algorithm: FlagAlgorithm::Mad,
            cutoff: DEFAULT_CHANNEL_CUTOFF,
        })
    );
    assert_eq!(
        params.time_flagging,
        Some(TimeFlagging {
            algorithm: FlagAlgorithm::Histogram,
            cutoff: DEFAULT_TIME_CUTOFF,
            multi_point: false,
            smoothing: None,
        })
    );
    assert_eq!(params.flag_order, FlagOrder::ChannelFirst);
    assert_eq!(
        params.normalization,
        NormalizationSource::Smoothed {
            window: DEFAULT_SMOOTHING_WINDOW
        }
    );
    assert!(!params.normalize_data);
    assert_eq!(params.replacement, ReplacementPolicy::Zero);
    assert!(params.dedisperse);
    assert_eq!(params.gain, DEFAULT_GAIN);
    assert_eq!(params.outputs.dir, dir.path().join("out"));
    assert!(params.outputs.filtered_data.is_none());
}

#[test]
fn test_missing_arguments_are_all_reported() {
    let msg = args_error(RunArgs::parse_from(["gptool"]).parse());
    for expected in [
        "No input was given",
        "--num-channels is required",
        "--sample-width is required",
        "--lowest-freq is required",
        "--bandwidth is required",
        "--sampling-interval is required",
    ] {
        assert!(msg.contains(expected), "'{expected}' isn't in:\n{msg}");
    }
    assert!(msg.starts_with("Invalid arguments:\n  - "));
}

#[test]
fn test_folding_needs_a_period_and_dm() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), "data.raw");
    let msg = args_error(parse_with(observation_args(&dir, &input), &[]));
    assert!(msg.contains("Folding needs a period"));
    assert!(msg.contains("--dm is required"));

    // Neither is needed to only filter.
    let params = parse_with(observation_args(&dir, &input), &["--no-dedispersion"]).unwrap();
    assert!(!params.dedisperse);
    assert_eq!(params.profile_bins, 0);

    let msg = args_error(parse_with(
        folding_args(&dir, &input),
        &["--polyco", "polyco.dat"],
    ));
    assert!(msg.contains("Only one of --period and --polyco"));
}

#[test]
fn test_bad_values() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), "data.raw");
    let msg = args_error(
        RunArgs::parse_from([
            "gptool",
            "-i",
            &input.display().to_string(),
            "--shm",
            "/dev/shm/ring",
            "--num-channels",
            "64",
            "--sample-width",
            "3",
            "--lowest-freq",
            "300",
            "--bandwidth",
            "0",
            "--sampling-interval",
            "1",
        ])
        .parse(),
    );
    assert!(msg.contains("Only one of --input and --shm"));
    assert!(msg.contains("--sample-width must be 1, 2 or 4"));
    assert!(msg.contains("--bandwidth must be positive"));

    // The choice and channel problems are reported once the input is sorted.
    let msg = args_error(parse_with(
        folding_args(&dir, &input),
        &[
            "--sideband",
            "upper",
            "--start-channel",
            "50",
            "--stop-channel",
            "10",
            "--profile-offset",
            "1.5",
        ],
    ));
    assert!(msg.contains("'upper' isn't a valid value for --sideband; valid values are: usb, lsb"));
    assert!(msg.contains("--start-channel (50) must be less than --stop-channel (10)"));
    assert!(msg.contains("--profile-offset must be between 0 and 1"));

    let msg = args_error(parse_with(folding_args(&dir, &input), &["--bins", "0"]));
    assert!(msg.contains("--bins must be positive or -1"));
}

#[test]
fn test_bad_channel_ranges() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), "data.raw");
    let params = parse_with(
        folding_args(&dir, &input),
        &["--bad-channels", "0:4", "60:64"],
    )
    .unwrap();
    assert_eq!(params.bad_channel_ranges, vec![(0, 4), (60, 64)]);

    let msg = args_error(parse_with(
        folding_args(&dir, &input),
        &["--bad-channels", "10:20", "30:20", "abc", "60:70"],
    ));
    assert!(msg.contains("Bad channel range 2 ('30:20')"));
    assert!(msg.contains("Couldn't parse bad channel range 3 ('abc')"));
    assert!(msg.contains("Bad channel range 4 ('60:70')"));
    assert!(!msg.contains("range 1"));
}

#[test]
fn test_incompatible_processing() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), "data.raw");

    let msg = args_error(parse_with(
        folding_args(&dir, &input),
        &["--replacement", "mode"],
    ));
    assert!(msg.contains("--replacement mode needs normalised data"));

    let msg = args_error(parse_with(
        folding_args(&dir, &input),
        &["--flag-order", "time-first", "--normalize"],
    ));
    assert!(msg.contains("time-first can't be used with --normalize"));

    let msg = args_error(parse_with(
        folding_args(&dir, &input),
        &["--replacement", "smooth-bandshape", "--no-time-flagging"],
    ));
    assert!(msg.contains("--replacement smooth-bandshape needs time flagging"));

    let msg = args_error(parse_with(
        folding_args(&dir, &input),
        &["--normalize", "--smoothing-window", "64"],
    ));
    assert!(msg.contains("--smoothing-window (64) must be positive and less than"));

    let msg = args_error(parse_with(
        folding_args(&dir, &input),
        &["--multi-point", "--time-cutoff", "12"],
    ));
    assert!(msg.contains("With --multi-point, --time-cutoff must be between 1 and 10"));

    // All of these are fine together.
    let params = parse_with(
        folding_args(&dir, &input),
        &[
            "--normalize",
            "--replacement",
            "mode",
            "--zero-dm-subtraction",
            "--multi-point",
        ],
    )
    .unwrap();
    assert!(params.normalize_data);
    assert_eq!(params.replacement, ReplacementPolicy::Mode);
    assert!(params.zero_dm_subtraction);
    assert!(params.time_flagging.unwrap().multi_point);
}

#[test]
fn test_flag_smoothing_is_converted_to_samples() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), "data.raw");
    let params = parse_with(
        folding_args(&dir, &input),
        &[
            "--flag-smoothing-window",
            "0.01",
            "--flag-smoothing-threshold",
            "25",
        ],
    )
    .unwrap();
    let smoothing = params.time_flagging.unwrap().smoothing.unwrap();
    assert_eq!(smoothing.window, 10);
    assert_abs_diff_eq!(smoothing.threshold, 0.75);
}

#[test]
fn test_block_duration() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), "data.raw");
    // 0 means one period.
    let params = parse_with(folding_args(&dir, &input), &["--block-duration", "0"]).unwrap();
    assert_abs_diff_eq!(params.block_duration, 0.01);

    let msg = args_error(parse_with(
        folding_args(&dir, &input),
        &["--block-duration", "0.0001"],
    ));
    assert!(msg.contains("must be at least one sample"));
}

#[test]
fn test_start_time_shifts_the_profile() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), "data.raw");
    // 2.5 periods are skipped.
    let params = parse_with(folding_args(&dir, &input), &["--start-time", "0.025"]).unwrap();
    assert_abs_diff_eq!(params.start_time, 0.025);
    assert_abs_diff_eq!(params.profile_offset, 0.5, epsilon = 1e-9);

    // The offset wraps.
    let params = parse_with(
        folding_args(&dir, &input),
        &["--start-time", "0.025", "--profile-offset", "0.7"],
    )
    .unwrap();
    assert_abs_diff_eq!(params.profile_offset, 0.2, epsilon = 1e-9);
}

#[test]
fn test_filtered_input_turns_off_filtering() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), "data.raw.gpt");
    let params = parse_with(
        folding_args(&dir, &input),
        &[
            "--filtered-input",
            "--normalize",
            "--replacement",
            "mode",
            "--write-filtered",
        ],
    )
    .unwrap();
    assert!(params.chan_flagging.is_none());
    assert!(params.time_flagging.is_none());
    assert!(!params.normalize_data);
    assert_eq!(params.replacement, ReplacementPolicy::Zero);
    assert!(params.outputs.filtered_data.is_none());
}

#[test]
fn test_filtered_data_is_named_after_the_input() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), "data.raw");
    let params = parse_with(folding_args(&dir, &input), &["--write-filtered"]).unwrap();
    assert_eq!(
        params.outputs.filtered_data,
        Some(dir.path().join("out").join("data.raw.gpt"))
    );
    assert!(params.outputs.copy_header.is_none());

    // The header is copied when it exists.
    let header = dir.path().join("data.raw.hdr");
    fs::write(&header, "header\n").unwrap();
    let params = parse_with(folding_args(&dir, &input), &["--write-filtered"]).unwrap();
    assert_eq!(params.outputs.copy_header, Some(header));

    // But a named header must exist.
    let msg = args_error(parse_with(
        folding_args(&dir, &input),
        &["--header", "nowhere.hdr"],
    ));
    assert!(msg.contains("Header file 'nowhere.hdr' doesn't exist"));
}

fn write_polyco(dir: &Path) -> PathBuf {
    // 100 turns per second; a 10 ms period.
    let path = dir.join("polyco.dat");
    fs::write(
        &path,
        indoc! {"
            B0000+00   6-Mar-19  120000.00   58548.50000000000           12.500000 -0.656 -6.059
              0.0  100.0    1   60   3    610.000
              0.0 0.0 0.0
        "},
    )
    .unwrap();
    path
}

#[test]
fn test_polyco_supplies_the_period_and_dm() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), "data.raw");
    let polyco = write_polyco(dir.path()).display().to_string();
    let polyco_args = [
        "--polyco",
        polyco.as_str(),
        "--polyco-coeffs",
        "3",
        "--mjd",
        "58548.5",
    ];

    let params = parse_with(observation_args(&dir, &input), &polyco_args).unwrap();
    assert_abs_diff_eq!(params.dm, 12.5);
    assert_eq!(params.profile_bins, 10);
    match params.phase_model {
        PhaseModel::Polyco {
            mjd_obs,
            initial_row,
            ..
        } => {
            assert_abs_diff_eq!(mjd_obs, 58548.5);
            assert_eq!(initial_row, 0);
        }
        PhaseModel::Fixed { .. } => panic!("Expected a polyco phase model"),
    }

    // A given DM wins, unless it's negative.
    let mut args = observation_args(&dir, &input);
    args.extend(["--dm", "3"].map(|s| s.to_string()));
    let params = parse_with(args, &polyco_args).unwrap();
    assert_abs_diff_eq!(params.dm, 3.0);
    let mut args = observation_args(&dir, &input);
    args.extend(["--dm", "-1"].map(|s| s.to_string()));
    let params = parse_with(args, &polyco_args).unwrap();
    assert_abs_diff_eq!(params.dm, 12.5);

    // An observation outside of the polyco's span.
    let result = parse_with(
        observation_args(&dir, &input),
        &["--polyco", polyco.as_str(), "--polyco-coeffs", "3", "--mjd", "58550"],
    );
    assert!(matches!(result, Err(GptoolError::Polyco(_))));
}

#[test]
fn test_polyco_with_a_ring_needs_an_mjd() {
    let dir = tempdir().unwrap();
    let polyco = write_polyco(dir.path()).display().to_string();
    let msg = args_error(
        RunArgs::parse_from([
            "gptool",
            "--shm",
            "/dev/shm/ring",
            "--num-channels",
            "64",
            "--sample-width",
            "2",
            "--lowest-freq",
            "300",
            "--bandwidth",
            "16",
            "--sampling-interval",
            "1",
            "--polyco",
            polyco.as_str(),
        ])
        .parse(),
    );
    assert!(msg.contains("--mjd is required to use a polyco file with --shm"));
}

#[test]
fn test_reference_bandshape_is_read() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), "data.raw");
    let bandshape = dir.path().join("bandshape.dat");
    let contents: String = (0..NUM_CHANNELS).map(|c| format!("{c} {}\n", c + 1)).collect();
    fs::write(&bandshape, contents).unwrap();

    let params = parse_with(
        folding_args(&dir, &input),
        &[
            "--normalize",
            "--reference-bandshape",
            &bandshape.display().to_string(),
        ],
    )
    .unwrap();
    match params.normalization {
        NormalizationSource::External(values) => {
            assert_eq!(values.len(), NUM_CHANNELS);
            assert_abs_diff_eq!(values[63], 64.0);
        }
        NormalizationSource::Smoothed { .. } => panic!("Expected the reference bandshape"),
    }
}

#[test]
fn test_toml_argument_file() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), "data.raw");
    let arg_file = dir.path().join("args.toml");
    fs::write(
        &arg_file,
        formatdoc! {"
            input = '{}'
            num_channels = 64
            sample_width = 2
            lowest_freq = 300.0
            bandwidth = 16.0
            sampling_interval = 1.0
            period = 10.0
            dm = 5.0
            bad_channels = ['0:4']
            normalize = true
        ",
            input.display()
        },
    )
    .unwrap();

    let args = RunArgs::parse_from([
        "gptool",
        &arg_file.display().to_string(),
        "--dm",
        "7",
    ])
    .merge()
    .unwrap();
    // Command-line arguments win.
    assert_eq!(args.dm, Some(7.0));
    assert!(args.normalize);
    let params = args.parse().unwrap();
    assert_abs_diff_eq!(params.dm, 7.0);
    assert_eq!(params.bad_channel_ranges, vec![(0, 4)]);
    assert!(params.normalize_data);
}

#[test]
fn test_json_argument_file() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), "data.raw");
    let arg_file = dir.path().join("args.json");
    let json = serde_json::json!({
        "input": input,
        "num_channels": 64,
        "sample_width": 2,
        "lowest_freq": 300.0,
        "bandwidth": 16.0,
        "sampling_interval": 1.0,
        "no_dedispersion": true,
    });
    fs::write(&arg_file, json.to_string()).unwrap();

    let params = RunArgs::parse_from(["gptool", &arg_file.display().to_string()])
        .merge()
        .unwrap()
        .parse()
        .unwrap();
    assert!(!params.dedisperse);
    assert_eq!(params.num_channels, 64);
}

#[test]
fn test_bad_argument_files() {
    let dir = tempdir().unwrap();
    let yaml = dir.path().join("args.yaml");
    fs::write(&yaml, "num_channels: 64\n").unwrap();
    let result = RunArgs::parse_from(["gptool", &yaml.display().to_string()]).merge();
    match result {
        Err(GptoolError::ArgFile(msg)) => assert!(msg.contains("toml, json")),
        other => panic!("Expected an argument file error, got {other:?}"),
    }

    let toml = dir.path().join("args.toml");
    fs::write(&toml, "num_channels = \"many\"\n").unwrap();
    let result = RunArgs::parse_from(["gptool", &toml.display().to_string()]).merge();
    assert!(matches!(result, Err(GptoolError::ArgFile(_))));
}

#[test]
fn test_dry_run_writes_nothing() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), "data.raw");
    RunArgs::parse_from(folding_args(&dir, &input))
        .run(true)
        .unwrap();
    assert!(!dir.path().join("out").exists());
}
