// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The five-stage block pipeline.
//!
//! Blocks move through the stages
//!
//! 1. ingest (acquire a block, and write out the block that left the pipeline);
//! 2. convert;
//! 3. channel statistics *or* time statistics;
//! 4. the other statistics stage;
//! 5. dedisperse and fold.
//!
//! Each iteration, every stage works on a different block at the same time;
//! stage k works on the block that was acquired k iterations ago. Ingest runs
//! on a long-lived thread (it owns the source and the output files) and is
//! driven by a request/reply handshake; the other stages are joined at the end
//! of each iteration before the packets move along.

mod packet;
mod stages;
#[cfg(test)]
mod tests;

pub(crate) use packet::Packet;

use std::{
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, Sender};
use crossbeam_utils::atomic::AtomicCell;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, log_enabled, trace, warn, Level};
use scopeguard::defer_on_unwind;
use thiserror::Error;

use crate::{
    constants::PIPELINE_DEPTH,
    fold::Profile,
    io::{
        read::{Acquired, BlockLengths, BlockReadError, BlockSource},
        write::{OutputWriteError, OutputWriter},
    },
    params::RunParameters,
    PROGRESS_BARS,
};
use stages::{ChannelStage, DedisperseStage, TimeStage};

#[derive(Error, Debug)]
pub(crate) enum PipelineError {
    #[error(transparent)]
    Read(#[from] BlockReadError),

    #[error(transparent)]
    Write(#[from] OutputWriteError),
}

/// Something that wants to see each block once it is finished, e.g. a plotter.
/// Called on the scheduling thread between iterations; it can't change
/// anything.
pub(crate) trait BlockObserver {
    fn block_finished(&mut self, _packet: &Packet, _profiles: Option<&[Profile]>) {}
}

/// Logs the ranges of each finished block's products at trace level (-vv).
pub(crate) struct BlockLogger;

impl BlockObserver for BlockLogger {
    fn block_finished(&mut self, packet: &Packet, profiles: Option<&[Profile]>) {
        if !log_enabled!(Level::Trace) {
            return;
        }
        for (i_pol, pol) in packet.pols.iter().enumerate() {
            let stats = &pol.channel_stats;
            trace!(
                "Block {} pol {i_pol}: bandshape of {} samples {}, mean-to-rms {}, normalised {}",
                packet.index,
                stats.samples_used,
                stats.bandshape_extrema,
                stats.mean_to_rms_extrema,
                stats.normalized_extrema,
            );
            trace!(
                "    zero-DM {}; {}/{} samples and {}/{} channels flagged",
                pol.zero_dm.extrema,
                pol.time_flags.num_flagged(),
                packet.len(),
                pol.chan_flags.num_flagged(),
                pol.chan_flags.flags.len(),
            );
            if let Some(series) = pol.dedispersed.as_ref() {
                trace!(
                    "    dedispersed {} (unfiltered {})",
                    series.extrema,
                    series.unfiltered_extrema
                );
            }
        }
        for (i_pol, profile) in profiles.unwrap_or_default().iter().enumerate() {
            let current = profile.current();
            trace!(
                "    profile {i_pol}: {} (unfiltered {})",
                current.extrema,
                current.unfiltered_extrema
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RunSummary {
    /// The number of blocks written out.
    pub(crate) blocks_written: usize,

    /// The number of time samples read from the source.
    pub(crate) samples_consumed: u64,

    /// Did the run stop early because of an interrupt?
    pub(crate) interrupted: bool,
}

/// What the scheduler asks of the ingest thread each iteration.
struct IngestRequest {
    /// The index and length of the block to acquire.
    next: Option<(usize, usize)>,

    /// A finished packet to write out.
    retired: Option<Packet>,
}

pub(crate) struct Pipeline<'a> {
    params: &'a RunParameters,
    channel_stage: ChannelStage,
    time_stage: TimeStage,
    dedisperse_stage: Option<DedisperseStage>,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(params: &'a RunParameters) -> Pipeline<'a> {
        let dedisperse_stage = if params.dedisperse {
            let stage = DedisperseStage::new(params);
            debug!("Maximum dispersion delay: {} samples", stage.max_delay());
            Some(stage)
        } else {
            None
        };
        Pipeline {
            params,
            channel_stage: ChannelStage::new(params),
            time_stage: TimeStage::new(params),
            dedisperse_stage,
        }
    }

    /// Run until the source runs dry or `cancel` is set, then write the
    /// whole-run products.
    ///
    /// When `cancel` is set, blocks that are still in flight are discarded,
    /// but everything that was finished is written.
    pub(crate) fn run(
        mut self,
        source: &mut dyn BlockSource,
        writer: OutputWriter,
        observer: &mut dyn BlockObserver,
        cancel: &AtomicCell<bool>,
        expected_num_blocks: Option<usize>,
    ) -> Result<RunSummary, PipelineError> {
        let (tx_request, rx_request) = bounded(1);
        let (tx_acquired, rx_acquired) = bounded(1);
        let live = source.is_live();

        // Progress bars.
        let multi_progress = MultiProgress::with_draw_target(if PROGRESS_BARS.load() {
            ProgressDrawTarget::stdout()
        } else {
            ProgressDrawTarget::hidden()
        });
        let new_bar = |message: &'static str| {
            let (pb, template) = match expected_num_blocks {
                Some(n) => (
                    ProgressBar::new(n as _),
                    "{msg:18}: [{wide_bar:.blue}] {pos:2}/{len:2} blocks ({elapsed_precise}<{eta_precise})",
                ),
                None => (
                    ProgressBar::new_spinner(),
                    "{msg:18}: {spinner} {pos} blocks ({elapsed_precise})",
                ),
            };
            multi_progress.add(
                pb.with_style(
                    ProgressStyle::default_bar()
                        .template(template)
                        .unwrap()
                        .progress_chars("=> "),
                )
                .with_position(0)
                .with_message(message),
            )
        };
        let read_progress = new_bar("Reading blocks");
        let write_progress = new_bar("Writing blocks");

        // Use a variable to track whether any threads have an issue.
        let error = AtomicCell::new(false);

        info!("Starting the pipeline");
        let scoped_threads_result = thread::scope(|scope| {
            let ingest_handle = thread::Builder::new()
                .name("ingest".to_string())
                .spawn_scoped(scope, || {
                    // If a panic happens, update our atomic error.
                    defer_on_unwind! { error.store(true); }
                    read_progress.tick();
                    write_progress.tick();

                    let result = ingest(
                        source,
                        writer,
                        rx_request,
                        tx_acquired,
                        &read_progress,
                        &write_progress,
                    );
                    if result.is_err() {
                        error.store(true);
                    }
                    result
                })
                .expect("OS can create threads");

            let schedule = self.schedule(tx_request, rx_acquired, observer, cancel, &error, live);

            // Join the thread handle. This propagates any errors and lets us
            // know if the thread panicked.
            let (writer, samples_consumed) = ingest_handle.join().unwrap()?;
            Ok::<_, PipelineError>((schedule, writer, samples_consumed))
        });
        let ((blocks_written, interrupted), writer, samples_consumed) = scoped_threads_result?;
        read_progress.abandon_with_message("Finished reading");
        write_progress.abandon_with_message("Finished writing");

        let dir = writer.dir().display().to_string();
        writer.finish(
            &self.channel_stage.cumulative,
            self.dedisperse_stage.as_ref().map(|s| s.profiles.as_slice()),
        )?;
        info!("Wrote {blocks_written} blocks ({samples_consumed} samples) to {dir}");

        Ok(RunSummary {
            blocks_written,
            samples_consumed,
            interrupted,
        })
    }

    /// Drive the iterations. Returns the number of packets retired and whether
    /// the run was interrupted.
    fn schedule(
        &mut self,
        tx_request: Sender<IngestRequest>,
        rx_acquired: Receiver<Acquired>,
        observer: &mut dyn BlockObserver,
        cancel: &AtomicCell<bool>,
        error: &AtomicCell<bool>,
        live: bool,
    ) -> (usize, bool) {
        // Packets waiting for stages 2 to 5. Ingest holds the fifth.
        let mut in_flight: [Option<Packet>; PIPELINE_DEPTH - 1] = Default::default();
        let mut lengths = BlockLengths::new(self.params.block_duration, self.params.sampling_interval);
        let mut next_index = 0;
        let mut reading = true;
        let mut interrupted = false;
        let mut retired: Option<Packet> = None;
        let mut num_retired = 0;

        loop {
            let iteration_start = Instant::now();
            if error.load() {
                break;
            }
            if reading && cancel.load() {
                warn!("Interrupted; discarding the blocks still in the pipeline");
                interrupted = true;
                reading = false;
                in_flight.iter_mut().for_each(|slot| *slot = None);
            }

            let next = if reading {
                lengths.next().map(|length| (next_index, length))
            } else {
                None
            };
            let drained = next.is_none() && in_flight.iter().all(Option::is_none);
            if let Some(packet) = retired.as_ref() {
                observer.block_finished(
                    packet,
                    self.dedisperse_stage.as_ref().map(|s| s.profiles.as_slice()),
                );
            }
            if next.is_some() || retired.is_some() {
                num_retired += usize::from(retired.is_some());
                let request = IngestRequest {
                    next,
                    retired: retired.take(),
                };
                if tx_request.send(request).is_err() {
                    // The ingest thread has given up; its error is picked up
                    // when it is joined.
                    break;
                }
            }
            if drained {
                break;
            }

            self.run_stages(&mut in_flight);

            let acquired = match next {
                Some(_) => match rx_acquired.recv() {
                    Ok(a) => Some(a),
                    Err(_) => break,
                },
                None => None,
            };

            // Move everything along.
            retired = in_flight[PIPELINE_DEPTH - 2].take();
            in_flight.rotate_right(1);
            if let Some(Acquired {
                block,
                end_of_stream,
            }) = acquired
            {
                next_index += 1;
                if end_of_stream {
                    info!("Reached the end of the input after {next_index} blocks; closing the pipeline");
                    reading = false;
                }
                // The last block of a stream can be empty.
                if block.num_samples > 0 {
                    in_flight[0] = Some(Packet::new(block));
                }
            }

            if reading && self.params.simulate_realtime && !live {
                let budget = Duration::from_secs_f64(self.params.block_duration);
                let elapsed = iteration_start.elapsed();
                if elapsed < budget {
                    thread::sleep(budget - elapsed);
                }
            }
        }

        // Nothing more will be asked of the ingest thread.
        drop(tx_request);
        (num_retired, interrupted)
    }

    /// Do the work of stages 2 to 5, one thread per stage.
    fn run_stages(&mut self, in_flight: &mut [Option<Packet>; PIPELINE_DEPTH - 1]) {
        let params = self.params;
        let [convert_slot, first_slot, second_slot, dedisperse_slot] = in_flight;
        let (channel_slot, time_slot) = if params.channel_stage_first() {
            (first_slot, second_slot)
        } else {
            (second_slot, first_slot)
        };
        let channel_stage = &mut self.channel_stage;
        let time_stage = &mut self.time_stage;
        let dedisperse_stage = &mut self.dedisperse_stage;

        thread::scope(|scope| {
            let handles = [
                convert_slot.as_mut().map(|packet| {
                    thread::Builder::new()
                        .name("convert".to_string())
                        .spawn_scoped(scope, move || stages::convert(params, packet))
                        .expect("OS can create threads")
                }),
                channel_slot.as_mut().map(|packet| {
                    thread::Builder::new()
                        .name("channel stats".to_string())
                        .spawn_scoped(scope, move || channel_stage.process(params, packet))
                        .expect("OS can create threads")
                }),
                time_slot.as_mut().map(|packet| {
                    thread::Builder::new()
                        .name("time stats".to_string())
                        .spawn_scoped(scope, move || time_stage.process(params, packet))
                        .expect("OS can create threads")
                }),
                dedisperse_slot
                    .as_mut()
                    .zip(dedisperse_stage.as_mut())
                    .map(|(packet, stage)| {
                        thread::Builder::new()
                            .name("dedisperse".to_string())
                            .spawn_scoped(scope, move || stage.process(params, packet))
                            .expect("OS can create threads")
                    }),
            ];
            // The barrier; nothing moves until every stage is done.
            for handle in handles.into_iter().flatten() {
                handle.join().unwrap();
            }
        });
    }
}

/// The ingest thread: write out whatever has left the pipeline, then acquire
/// the next block. Returns the writer once the scheduler hangs up.
fn ingest(
    source: &mut dyn BlockSource,
    mut writer: OutputWriter,
    rx_request: Receiver<IngestRequest>,
    tx_acquired: Sender<Acquired>,
    read_progress: &ProgressBar,
    write_progress: &ProgressBar,
) -> Result<(OutputWriter, u64), PipelineError> {
    for IngestRequest { next, retired } in rx_request.iter() {
        if let Some(packet) = retired {
            writer.write_block(packet.index, packet.len(), &packet.products())?;
            write_progress.inc(1);
        }

        if let Some((index, length)) = next {
            let acquired = source.acquire(index, length)?;
            read_progress.inc(1);
            // If the scheduler has gone, there's nobody to send to.
            if tx_acquired.send(acquired).is_err() {
                break;
            }
        }
    }

    Ok((writer, source.samples_consumed()))
}
