// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all gptool-related errors. This should be the *only* error
//! enum that is publicly visible.

use thiserror::Error;

use super::run::ParamsError;
use crate::{
    fold::polyco::PolycoError,
    io::{
        bandshape::BandshapeFileError, header::HeaderError, read::BlockReadError,
        write::OutputWriteError,
    },
    pipeline::PipelineError,
};

const README: &str = "README.md";

/// The *only* publicly visible error from gptool. Each error message should
/// say where to find more information, unless it's "generic".
#[derive(Error, Debug)]
pub enum GptoolError {
    /// Invalid or missing arguments.
    #[error("{0}\n\nSee `gptool --help` for all arguments and their defaults.")]
    Args(String),

    /// An error related to argument files.
    #[error("{0}\n\nSee the \"Argument files\" section of {README} for more info.")]
    ArgFile(String),

    /// An error related to polyco files.
    #[error("{0}\n\nSee the \"Folding\" section of {README} for more info.")]
    Polyco(String),

    /// An error related to reading filterbank data or the files that describe
    /// it.
    #[error("{0}\n\nSee the \"Input data\" section of {README} for more info.")]
    Input(String),

    /// An error related to writing out products.
    #[error("{0}\n\nSee the \"Output products\" section of {README} for more info.")]
    Output(String),

    /// A generic error that can't be clarified further with documentation, e.g.
    /// IO errors.
    #[error("{0}")]
    Generic(String),
}

// When changing the error propagation below, ensure `Self::from(e)` uses the
// correct `e`!

impl From<ParamsError> for GptoolError {
    fn from(e: ParamsError) -> Self {
        Self::Args(e.to_string())
    }
}

impl From<PolycoError> for GptoolError {
    fn from(e: PolycoError) -> Self {
        Self::Polyco(e.to_string())
    }
}

impl From<HeaderError> for GptoolError {
    fn from(e: HeaderError) -> Self {
        Self::Input(e.to_string())
    }
}

impl From<BandshapeFileError> for GptoolError {
    fn from(e: BandshapeFileError) -> Self {
        Self::Input(e.to_string())
    }
}

impl From<BlockReadError> for GptoolError {
    fn from(e: BlockReadError) -> Self {
        let s = e.to_string();
        match e {
            BlockReadError::EmptyFile(_)
            | BlockReadError::StartBeyondEnd { .. }
            | BlockReadError::RingTooSmall { .. }
            | BlockReadError::BadRingHeader { .. }
            | BlockReadError::RecordSampleMismatch { .. } => Self::Input(s),
            BlockReadError::IO(_) => Self::Generic(s),
        }
    }
}

impl From<OutputWriteError> for GptoolError {
    fn from(e: OutputWriteError) -> Self {
        Self::Output(e.to_string())
    }
}

impl From<PipelineError> for GptoolError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Read(e) => Self::from(e),
            PipelineError::Write(e) => Self::from(e),
        }
    }
}

impl From<std::io::Error> for GptoolError {
    fn from(e: std::io::Error) -> Self {
        Self::Generic(e.to_string())
    }
}
