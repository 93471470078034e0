// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Integration tests.
//!
//! Some help for laying out these tests was taken from:
//! https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    process::Output,
    str::from_utf8,
};

use assert_cmd::{output::OutputError, Command};
use tempfile::{tempdir, TempDir};

const NUM_CHANNELS: usize = 256;
/// 0.25 s blocks of 1 ms samples.
const BLOCK_LENGTH: usize = 250;
const NUM_SAMPLES: usize = 3 * BLOCK_LENGTH;
const TRANSIENT_AT: usize = 400;

fn gptool() -> Command {
    Command::cargo_bin("gptool").unwrap()
}

fn get_cmd_output(result: Result<Output, OutputError>) -> (String, String) {
    let output = match result {
        Ok(o) => o,
        Err(o) => o.as_output().unwrap().clone(),
    };
    (
        from_utf8(&output.stdout).unwrap().to_string(),
        from_utf8(&output.stderr).unwrap().to_string(),
    )
}

/// Write 16-bit total-intensity data with a broadband transient in one sample.
/// The average over all channels only takes a few nearby values elsewhere.
fn write_input(dir: &Path) -> PathBuf {
    let path = dir.join("data.raw");
    let mut f = BufWriter::new(File::create(&path).unwrap());
    for t in 0..NUM_SAMPLES {
        for c in 0..NUM_CHANNELS {
            let background = ((7 * t + 13 * c) % 21) as i32 - 10;
            let transient = if t == TRANSIENT_AT { 500 } else { 0 };
            f.write_all(&((1000 + background + transient) as u16).to_le_bytes())
                .unwrap();
        }
    }
    f.flush().unwrap();
    path
}

fn run_args(dir: &TempDir, input: &Path) -> Vec<String> {
    [
        "-i",
        &input.display().to_string(),
        "--num-channels",
        "256",
        "--sample-width",
        "2",
        "--lowest-freq",
        "300",
        "--bandwidth",
        "32",
        "--sampling-interval",
        "1",
        "--block-duration",
        "0.25",
        "--period",
        "10",
        "--dm",
        "0",
        "--no-channel-flagging",
        "--time-flag-algorithm",
        "mad",
        "-o",
        &dir.path().join("out").display().to_string(),
        "--no-progress-bars",
    ]
    .into_iter()
    .map(|s| s.to_string())
    .collect()
}

#[test]
fn test_help() {
    let cmd = gptool().arg("--help").ok();
    assert!(cmd.is_ok());
    let (stdout, _) = get_cmd_output(cmd);
    for expected in ["--num-channels", "--polyco", "--flag-order", "FLAGGING"] {
        assert!(stdout.contains(expected), "'{expected}' isn't in the help");
    }
}

#[test]
fn test_missing_arguments() {
    let dir = tempdir().unwrap();
    let cmd = gptool()
        .args(["--num-channels", "256", "--no-progress-bars"])
        .current_dir(dir.path())
        .ok();
    assert!(cmd.is_err());
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.contains("Invalid arguments"), "{stderr}");
    assert!(stderr.contains("--sample-width is required"), "{stderr}");
    assert!(stderr.contains("gptool --help"), "{stderr}");
}

#[test]
fn test_dry_run() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path());
    let toml = dir.path().join("run.toml");
    let cmd = gptool()
        .args(run_args(&dir, &input))
        .arg("--dry-run")
        .arg("--save-toml")
        .arg(&toml)
        .ok();
    assert!(cmd.is_ok(), "{:?}", get_cmd_output(cmd));
    let (stdout, _) = get_cmd_output(cmd);
    assert!(stdout.contains("Dry run"));
    assert!(!dir.path().join("out").exists());

    // The saved arguments reproduce the run.
    let cmd = gptool()
        .arg(&toml)
        .args(["--dry-run", "--no-progress-bars"])
        .ok();
    assert!(cmd.is_ok(), "{:?}", get_cmd_output(cmd));
}

#[test]
fn test_transient_is_flagged_and_products_are_written() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path());
    fs::write(dir.path().join("data.raw.hdr"), "header\n").unwrap();
    let cmd = gptool()
        .args(run_args(&dir, &input))
        .args(["--write-filtered", "--write-time-flags", "--write-dedispersed"])
        .ok();
    assert!(cmd.is_ok(), "{:?}", get_cmd_output(cmd));
    let (stdout, _) = get_cmd_output(cmd);
    assert!(stdout.contains("Wrote 3 blocks"), "{stdout}");

    let out = dir.path().join("out");
    let time_flags = fs::read(out.join("timeflag.gpt")).unwrap();
    assert_eq!(time_flags.len(), NUM_SAMPLES);
    assert_eq!(time_flags[TRANSIENT_AT], 1);
    assert!(time_flags.iter().filter(|&&f| f == 1).count() < NUM_SAMPLES / 10);

    // The filtered data has every channel of every sample, and the transient
    // was replaced with zeros.
    let filtered = fs::read(out.join("data.raw.gpt")).unwrap();
    assert_eq!(filtered.len(), NUM_SAMPLES * NUM_CHANNELS * 2);
    let transient = &filtered[TRANSIENT_AT * NUM_CHANNELS * 2..(TRANSIENT_AT + 1) * NUM_CHANNELS * 2];
    assert!(transient.iter().all(|&b| b == 0));
    assert_eq!(
        fs::read_to_string(out.join("data.raw.gpt.hdr")).unwrap(),
        "header\n"
    );

    for product in [
        "stats.gpt",
        "flag_stats.gpt",
        "intensity_summary.gpt",
        "bandshape.gpt",
        "fullDM_filtered.gpt",
        "fullDM_unfiltered.gpt",
        "fullDMCount.gpt",
        "profile_filtered.gpt",
        "profile_unfiltered.gpt",
    ] {
        assert!(out.join(product).exists(), "{product} is missing");
    }
    assert!(!out.join("chanflag.gpt").exists());

    let bandshape = fs::read_to_string(out.join("bandshape.gpt")).unwrap();
    let channel_lines = bandshape
        .lines()
        .filter(|l| !l.starts_with('#'))
        .count();
    assert_eq!(channel_lines, NUM_CHANNELS);
}

#[test]
fn test_missing_input_is_reported() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("nothing.raw");
    let cmd = gptool().args(run_args(&dir, &input)).ok();
    assert!(cmd.is_err());
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.contains("doesn't exist"), "{stderr}");
}
