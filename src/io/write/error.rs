// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with writing out products.

use thiserror::Error;

#[derive(Error, Debug)]
pub(crate) enum OutputWriteError {
    #[error("Couldn't create the output directory '{dir}': {err}")]
    CreateDir { dir: String, err: std::io::Error },

    #[error("Couldn't create output file '{file}' (possible permission issues?): {err}")]
    Create { file: String, err: std::io::Error },

    #[error("Couldn't write to '{file}': {err}")]
    Write { file: String, err: std::io::Error },

    #[error("Couldn't copy header '{from}' to '{to}': {err}")]
    CopyHeader {
        from: String,
        to: String,
        err: std::io::Error,
    },
}
