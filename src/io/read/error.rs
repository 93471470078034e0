// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors from reading blocks of filterbank data.

use thiserror::Error;

#[derive(Error, Debug)]
pub(crate) enum BlockReadError {
    #[error("Input file '{0}' is empty")]
    EmptyFile(String),

    #[error("The requested start time ({start_time} s) is beyond the end of the input file ({duration} s)")]
    StartBeyondEnd { start_time: f64, duration: f64 },

    #[error("Shared-memory ring '{file}' is only {size} bytes; this is too small to hold its header")]
    RingTooSmall { file: String, size: usize },

    #[error("Shared-memory ring '{file}' has an inconsistent header: {reason}")]
    BadRingHeader { file: String, reason: String },

    #[error("Shared-memory records hold {record_bytes} bytes of data, which isn't a multiple of the {sample_bytes}-byte sample width")]
    RecordSampleMismatch {
        record_bytes: usize,
        sample_bytes: usize,
    },

    #[error(transparent)]
    IO(#[from] std::io::Error),
}
