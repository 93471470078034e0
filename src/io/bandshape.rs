// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reference bandshapes, used instead of the running smoothed bandshape to
//! normalise data.
//!
//! Each line holds a channel index and that channel's value; anything after
//! the second column is ignored, as are blank lines and lines starting with
//! `#`.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use log::{debug, warn};
use thiserror::Error;

/// Channels with no (or a zero) reference value get this instead.
const MISSING_VALUE: f32 = -1.0;

#[derive(Error, Debug)]
pub(crate) enum BandshapeFileError {
    #[error("Couldn't read reference bandshape '{file}': {err}")]
    Read { file: String, err: std::io::Error },

    #[error("Reference bandshape '{file}', line {line_num}: expected a channel index and a value, but got '{text}'")]
    BadLine {
        file: String,
        line_num: usize,
        text: String,
    },

    #[error("Reference bandshape '{file}', line {line_num}: channel {chan} doesn't exist; there are only {num_channels} channels")]
    ChannelOutOfRange {
        file: String,
        line_num: usize,
        chan: usize,
        num_channels: usize,
    },
}

pub(crate) fn read_reference_bandshape(
    file: &Path,
    num_channels: usize,
) -> Result<Vec<f32>, BandshapeFileError> {
    let name = file.display().to_string();
    let handle = File::open(file).map_err(|err| BandshapeFileError::Read {
        file: name.clone(),
        err,
    })?;
    parse_reference_bandshape(BufReader::new(handle), &name, num_channels)
}

pub(crate) fn parse_reference_bandshape<T: BufRead>(
    buf: T,
    file: &str,
    num_channels: usize,
) -> Result<Vec<f32>, BandshapeFileError> {
    let mut values = vec![MISSING_VALUE; num_channels];
    let mut seen = vec![false; num_channels];

    for (i, line) in buf.lines().enumerate() {
        let line_num = i + 1;
        let line = line.map_err(|err| BandshapeFileError::Read {
            file: file.to_string(),
            err,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let bad_line = || BandshapeFileError::BadLine {
            file: file.to_string(),
            line_num,
            text: trimmed.to_string(),
        };
        let mut tokens = trimmed.split_whitespace();
        let chan: usize = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(bad_line)?;
        let value: f32 = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(bad_line)?;
        if chan >= num_channels {
            return Err(BandshapeFileError::ChannelOutOfRange {
                file: file.to_string(),
                line_num,
                chan,
                num_channels,
            });
        }

        values[chan] = if value == 0.0 { MISSING_VALUE } else { value };
        seen[chan] = true;
    }

    let num_missing = seen.iter().filter(|&&s| !s).count();
    if num_missing > 0 {
        warn!("Reference bandshape '{file}' has no values for {num_missing} of {num_channels} channels");
    }
    debug!("Read a reference bandshape from '{file}'");
    Ok(values)
}
