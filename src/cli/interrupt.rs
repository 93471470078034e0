// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Ctrl+C handling. The first interrupt asks the pipeline to stop; blocks that
//! are in flight are dropped, and everything finished so far is written out.

use crossbeam_utils::atomic::AtomicCell;

static INTERRUPTED: AtomicCell<bool> = AtomicCell::new(false);

#[cfg(unix)]
extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true);
}

/// Route SIGINT into the returned flag rather than killing the process.
pub(super) fn catch_interrupts() -> &'static AtomicCell<bool> {
    // Safety: the handler only does a lock-free atomic store.
    #[cfg(unix)]
    unsafe {
        libc::signal(
            libc::SIGINT,
            on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
    log::debug!("Catching interrupts");
    &INTERRUPTED
}
