// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Real-time RFI filtering, dedispersion and folding of pulsar filterbank data.

Blocks of data are read from a file or a shared-memory ring buffer and passed
through a five-stage pipeline: channel statistics and flagging, time
statistics and flagging, dedispersion, folding and writing out.
 */

mod cli;
mod constants;
mod dedisperse;
mod flagging;
mod fold;
mod io;
mod params;
mod pipeline;
mod stats;

use crossbeam_utils::atomic::AtomicCell;

// Re-exports.
pub use cli::{Gptool, GptoolError};

lazy_static::lazy_static! {
    /// Are progress bars being drawn? This should only ever be enabled by CLI
    /// code.
    static ref PROGRESS_BARS: AtomicCell<bool> = AtomicCell::new(false);
}
