// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reading TEMPO-style polyco files.
//!
//! Each set of a polyco file is
//!
//! ```text
//! <name> <date> <utc> <mjd> <dm> ...
//! <reference phase> <reference rotation frequency [Hz]> ...
//! <coefficients, up to three per line>
//! ```
//!
//! The number of coefficients and the span of each set \[minutes\] are not
//! read from the file; they're run parameters.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use log::debug;
use thiserror::Error;
use vec1::Vec1;

#[derive(Error, Debug)]
pub(crate) enum PolycoError {
    #[error("Couldn't read polyco file '{file}': {err}")]
    Read { file: String, err: std::io::Error },

    #[error("Polyco file '{file}' doesn't contain any polyco sets")]
    Empty { file: String },

    #[error("Polyco file '{file}', line {line_num}: couldn't parse '{string}' as a number")]
    ParseFloat {
        file: String,
        line_num: usize,
        string: String,
    },

    #[error("Polyco file '{file}', line {line_num}: expected {expected}")]
    Malformed {
        file: String,
        line_num: usize,
        expected: &'static str,
    },

    #[error("The observation start (MJD {mjd_obs}) isn't covered by the sets of polyco file '{file}'")]
    NotCovered { file: String, mjd_obs: f64 },
}

/// One set of a polyco file.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PolycoSet {
    /// The MJD at the middle of the set's span.
    pub(crate) mjd: f64,
    pub(crate) dm: f64,
    pub(crate) ref_phase: f64,
    /// \[Hz\]
    pub(crate) ref_freq: f64,
    pub(crate) coeffs: Vec<f64>,
}

impl PolycoSet {
    /// The pulse phase (in turns, not wrapped) `dt` minutes from this set's
    /// MJD.
    pub(crate) fn phase(&self, dt: f64) -> f64 {
        let mut phase = self.ref_phase + dt * 60.0 * self.ref_freq;
        let mut power = 1.0;
        for c in &self.coeffs {
            phase += c * power;
            power *= dt;
        }
        phase
    }

    /// The rotation frequency `dt` minutes from this set's MJD \[turns per
    /// minute\].
    fn rotation_rate(&self, dt: f64) -> f64 {
        let mut rate = self.ref_freq * 60.0;
        let mut power = 1.0;
        for (i, c) in self.coeffs.iter().enumerate().skip(1) {
            rate += i as f64 * c * power;
            power *= dt;
        }
        rate
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PolycoTable {
    pub(crate) sets: Vec1<PolycoSet>,

    /// \[minutes\]
    pub(crate) span: f64,

    /// Where the table was read from; used in messages.
    pub(crate) file: String,
}

impl PolycoTable {
    pub(crate) fn read(
        file: &Path,
        num_coeffs: usize,
        span: f64,
    ) -> Result<PolycoTable, PolycoError> {
        let name = file.display().to_string();
        let handle = File::open(file).map_err(|err| PolycoError::Read {
            file: name.clone(),
            err,
        })?;
        Self::parse(&mut BufReader::new(handle), &name, num_coeffs, span)
    }

    pub(crate) fn parse<T: BufRead>(
        buf: &mut T,
        file: &str,
        num_coeffs: usize,
        span: f64,
    ) -> Result<PolycoTable, PolycoError> {
        let mut lines = Vec::new();
        for line in buf.lines() {
            let line = line.map_err(|err| PolycoError::Read {
                file: file.to_string(),
                err,
            })?;
            lines.push(line);
        }
        // Line numbers are 1-based.
        let mut lines = lines
            .into_iter()
            .enumerate()
            .map(|(i, l)| (i + 1, l))
            .filter(|(_, l)| !l.trim().is_empty());

        let parse_float = |string: &str, line_num: usize| -> Result<f64, PolycoError> {
            // FORTRAN-style exponents are common in polyco files.
            string
                .replace(['D', 'd'], "e")
                .parse()
                .map_err(|_| PolycoError::ParseFloat {
                    file: file.to_string(),
                    line_num,
                    string: string.to_string(),
                })
        };
        let malformed = |line_num: usize, expected: &'static str| PolycoError::Malformed {
            file: file.to_string(),
            line_num,
            expected,
        };

        let mut sets = vec![];
        while let Some((line_num, header)) = lines.next() {
            let tokens: Vec<&str> = header.split_whitespace().collect();
            if tokens.len() < 5 {
                return Err(malformed(line_num, "a header line with an MJD and a DM"));
            }
            let mjd = parse_float(tokens[3], line_num)?;
            let dm = parse_float(tokens[4], line_num)?;

            let (line_num, reference) = lines
                .next()
                .ok_or_else(|| malformed(line_num + 1, "a reference phase and frequency"))?;
            let tokens: Vec<&str> = reference.split_whitespace().collect();
            if tokens.len() < 2 {
                return Err(malformed(line_num, "a reference phase and frequency"));
            }
            let ref_phase = parse_float(tokens[0], line_num)?;
            let ref_freq = parse_float(tokens[1], line_num)?;

            let mut coeffs = Vec::with_capacity(num_coeffs);
            let mut last_line_num = line_num;
            while coeffs.len() < num_coeffs {
                let (line_num, line) = lines
                    .next()
                    .ok_or_else(|| malformed(last_line_num + 1, "more polyco coefficients"))?;
                for token in line.split_whitespace().take(num_coeffs - coeffs.len()) {
                    coeffs.push(parse_float(token, line_num)?);
                }
                last_line_num = line_num;
            }

            sets.push(PolycoSet {
                mjd,
                dm,
                ref_phase,
                ref_freq,
                coeffs,
            });
        }

        let sets = Vec1::try_from_vec(sets).map_err(|_| PolycoError::Empty {
            file: file.to_string(),
        })?;
        debug!("Read {} polyco sets from '{file}'", sets.len());
        Ok(PolycoTable {
            sets,
            span,
            file: file.to_string(),
        })
    }

    /// The DM of the first set.
    pub(crate) fn dm(&self) -> f64 {
        self.sets.first().dm
    }

    /// Minutes from the middle of set `row` to `mjd`.
    pub(crate) fn minutes_from(&self, row: usize, mjd: f64) -> f64 {
        (mjd - self.sets[row].mjd) * 1440.0
    }

    /// The set whose span contains `mjd_obs`.
    pub(crate) fn starting_row(&self, mjd_obs: f64) -> Result<usize, PolycoError> {
        let not_covered = || PolycoError::NotCovered {
            file: self.file.clone(),
            mjd_obs,
        };
        let half_span = self.span / 2.0;
        let estimate = (self.minutes_from(0, mjd_obs) + half_span) / self.span;
        if !estimate.is_finite() || estimate < 0.0 {
            return Err(not_covered());
        }
        let mut row = (estimate as usize).min(self.sets.len() - 1);

        // Sets don't always have the nominal span.
        while self.minutes_from(row, mjd_obs) > half_span {
            row += 1;
            if row == self.sets.len() {
                return Err(not_covered());
            }
        }
        while self.minutes_from(row, mjd_obs) < -half_span {
            if row == 0 {
                return Err(not_covered());
            }
            row -= 1;
        }
        Ok(row)
    }

    /// The apparent pulse period at `mjd_obs` \[ms\].
    pub(crate) fn period_ms(&self, row: usize, mjd_obs: f64) -> f64 {
        let dt = self.minutes_from(row, mjd_obs);
        60.0 * 1000.0 / self.sets[row].rotation_rate(dt)
    }
}
