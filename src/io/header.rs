// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Observation start times from the text headers written alongside raw files.
//!
//! A header looks like
//!
//! ```text
//! #Start time and date
//! IST Time: 17:30:00.000123
//! Date: 01:01:2000
//! ```
//!
//! i.e. the start of the observation in Indian Standard Time.

use std::path::Path;

use chrono::{FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::constants::{IST_OFFSET_SECONDS, MJD_UNIX_EPOCH};

lazy_static! {
    static ref TIME_LINE: Regex =
        Regex::new(r"^\s*\S+\s+\S+\s+(\d{1,2}):(\d{1,2}):(\d+(?:\.\d*)?)").unwrap();
    static ref DATE_LINE: Regex = Regex::new(r"^\s*\S+\s+(\d{1,2}):(\d{1,2}):(\d{1,4})").unwrap();
}

#[derive(Error, Debug)]
pub(crate) enum HeaderError {
    #[error("Couldn't read header file '{file}': {err}")]
    Read { file: String, err: std::io::Error },

    #[error("Header file '{file}' has no line {line}; expected\n#Start time and date\nIST Time: HH:MM:SS.ssss\nDate: DD:MM:YYYY")]
    MissingLine { file: String, line: usize },

    #[error("Couldn't parse line {line} of '{file}' ('{text}') as an IST {what}")]
    BadLine {
        file: String,
        line: usize,
        text: String,
        what: &'static str,
    },

    #[error("The start in '{file}' ({date} {time} IST) isn't a valid date and time")]
    InvalidDateTime {
        file: String,
        date: String,
        time: String,
    },
}

/// Read the MJD of the start of an observation from a header file.
pub(crate) fn read_start_mjd(file: &Path) -> Result<f64, HeaderError> {
    let contents = std::fs::read_to_string(file).map_err(|err| HeaderError::Read {
        file: file.display().to_string(),
        err,
    })?;
    parse_start_mjd(&contents, &file.display().to_string())
}

pub(crate) fn parse_start_mjd(contents: &str, file: &str) -> Result<f64, HeaderError> {
    let mut lines = contents.lines().skip(1);
    let missing = |line| HeaderError::MissingLine {
        file: file.to_string(),
        line,
    };
    let time_line = lines.next().ok_or_else(|| missing(2))?;
    let date_line = lines.next().ok_or_else(|| missing(3))?;

    let bad = |line, text: &str, what| HeaderError::BadLine {
        file: file.to_string(),
        line,
        text: text.to_string(),
        what,
    };
    let time = TIME_LINE
        .captures(time_line)
        .ok_or_else(|| bad(2, time_line, "time"))?;
    let date = DATE_LINE
        .captures(date_line)
        .ok_or_else(|| bad(3, date_line, "date"))?;

    // The regexes only match digits, so parsing only fails on overflow.
    let hour: u32 = time[1].parse().map_err(|_| bad(2, time_line, "time"))?;
    let minute: u32 = time[2].parse().map_err(|_| bad(2, time_line, "time"))?;
    let second: f64 = time[3].parse().map_err(|_| bad(2, time_line, "time"))?;
    let day: u32 = date[1].parse().map_err(|_| bad(3, date_line, "date"))?;
    let month: u32 = date[2].parse().map_err(|_| bad(3, date_line, "date"))?;
    let year: i32 = date[3].parse().map_err(|_| bad(3, date_line, "date"))?;

    let invalid = || HeaderError::InvalidDateTime {
        file: file.to_string(),
        date: format!("{day:02}:{month:02}:{year}"),
        time: format!("{hour:02}:{minute:02}:{second}"),
    };
    if !(0.0..60.0).contains(&second) {
        return Err(invalid());
    }
    let whole_seconds = second.trunc() as u32;
    let nanos = (((second - second.trunc()) * 1e9).round() as u32).min(999_999_999);
    let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)?;
    let time = NaiveTime::from_hms_nano_opt(hour, minute, whole_seconds, nanos)
        .ok_or_else(invalid)?;
    let ist = FixedOffset::east_opt(IST_OFFSET_SECONDS).ok_or_else(invalid)?;
    let start = ist
        .from_local_datetime(&NaiveDateTime::new(date, time))
        .single()
        .ok_or_else(invalid)?;

    let unix_seconds = start.timestamp() as f64 + f64::from(start.timestamp_subsec_nanos()) / 1e9;
    Ok(unix_seconds / 86400.0 + MJD_UNIX_EPOCH)
}
