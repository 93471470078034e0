// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Code to write out the products of a run.
//!
//! Per-block files are truncated when the writer is created and appended to
//! as blocks leave the pipeline; whole-run products (the bandshape and the
//! profiles) are written when the run finishes. Runs with all four
//! polarisations write one file per polarisation, numbered from 1 (e.g.
//! `timeflag3.gpt`).

mod error;

pub(crate) use error::OutputWriteError;

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, trace};
use ndarray::prelude::*;

use crate::{
    constants::CUMULATIVE_SCALE,
    dedisperse::Dedispersed,
    flagging::FlagSet,
    fold::Profile,
    params::{BandshapeSelection, RunParameters, SampleWidth},
    stats::{ChannelStatistics, CumulativeBandshape, ZeroDm},
};

const STATS_HEADER: &str = "#window_indx\tmean_pred\tmean_pre\tmean_post\trms_pred\trms_pre\trms_post\tm/r_pred\tm/r_pre\tm/r_post";
const FLAG_STATS_HEADER: &str = "#Each line represents a seperate block. For the particular block, the line contains the percentage of flagged data in each channel";
const INTENSITY_HEADER: &str = "#First element of each line denotes the number of time samples in the block, followed by intensity in each channel";
const BANDSHAPE_HEADER: &str = "# chan_no \t smooth_bshape \t mean_bshape \t rms_bshape";
const PROFILE_HEADER: &str = "#phase\tvalue";

/// Everything written for one polarisation of a finished block.
pub(crate) struct PolarizationProducts<'a> {
    pub(crate) channel_stats: &'a ChannelStatistics,
    /// Relative to the first analysed channel.
    pub(crate) chan_flags: &'a FlagSet,
    pub(crate) time_flags: &'a FlagSet,
    pub(crate) zero_dm: &'a ZeroDm,
    pub(crate) grid: Option<ArrayView2<'a, i16>>,
    pub(crate) dedispersed: Option<&'a Dedispersed>,
    /// The first sample of the dedispersed series that is written.
    pub(crate) dedispersed_start: usize,
}

/// A file being appended to.
struct OutputFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl OutputFile {
    /// Create (or truncate) `path`, and write `header` as its first line.
    fn create(path: PathBuf, header: Option<&str>) -> Result<OutputFile, OutputWriteError> {
        trace!("Creating {}", path.display());
        let handle = File::create(&path).map_err(|err| OutputWriteError::Create {
            file: path.display().to_string(),
            err,
        })?;
        let mut file = OutputFile {
            writer: BufWriter::new(handle),
            path,
        };
        if let Some(header) = header {
            file.write_with(|w| writeln!(w, "{header}"))?;
        }
        Ok(file)
    }

    fn write_with<F>(&mut self, f: F) -> Result<(), OutputWriteError>
    where
        F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
    {
        f(&mut self.writer).map_err(|err| OutputWriteError::Write {
            file: self.path.display().to_string(),
            err,
        })
    }

    fn flush(&mut self) -> Result<(), OutputWriteError> {
        self.write_with(|w| w.flush())
    }
}

struct DedispersedFiles {
    filtered: OutputFile,
    unfiltered: OutputFile,
    count: OutputFile,
}

struct PolarizationFiles {
    time_flags: Option<OutputFile>,
    chan_flags: Option<OutputFile>,
    dedispersed: Option<DedispersedFiles>,
    stats: OutputFile,
    flag_stats: OutputFile,
}

pub(crate) struct OutputWriter {
    dir: PathBuf,
    polar: bool,
    num_channels: usize,
    start_channel: usize,
    stop_channel: usize,
    sample_width: SampleWidth,
    normalized_summary: bool,

    grid: Option<OutputFile>,
    intensity_summary: Option<OutputFile>,
    pols: Vec<PolarizationFiles>,
}

impl OutputWriter {
    /// Create the output directory and truncate every per-block product.
    pub(crate) fn new(params: &RunParameters) -> Result<OutputWriter, OutputWriteError> {
        let outputs = &params.outputs;
        let dir = outputs.dir.clone();
        std::fs::create_dir_all(&dir).map_err(|err| OutputWriteError::CreateDir {
            dir: dir.display().to_string(),
            err,
        })?;

        let polar = params.num_pols() > 1;
        let name = |stem: &str, k: usize| -> PathBuf {
            if polar {
                dir.join(format!("{stem}{}.gpt", k + 1))
            } else {
                dir.join(format!("{stem}.gpt"))
            }
        };

        let mut pols = Vec::with_capacity(params.num_pols());
        for k in 0..params.num_pols() {
            let time_flags = if outputs.time_flags && params.time_flagging.is_some() {
                Some(OutputFile::create(name("timeflag", k), None)?)
            } else {
                None
            };
            let chan_flags = if outputs.chan_flags && params.chan_flagging.is_some() {
                Some(OutputFile::create(name("chanflag", k), None)?)
            } else {
                None
            };
            let dedispersed = if outputs.dedispersed && params.dedisperse {
                Some(DedispersedFiles {
                    filtered: OutputFile::create(name("fullDM_filtered", k), None)?,
                    unfiltered: OutputFile::create(name("fullDM_unfiltered", k), None)?,
                    count: OutputFile::create(name("fullDMCount", k), None)?,
                })
            } else {
                None
            };
            pols.push(PolarizationFiles {
                time_flags,
                chan_flags,
                dedispersed,
                stats: OutputFile::create(name("stats", k), Some(STATS_HEADER))?,
                flag_stats: OutputFile::create(name("flag_stats", k), Some(FLAG_STATS_HEADER))?,
            });
        }

        let grid = match &outputs.filtered_data {
            Some(path) => {
                if let Some(header) = &outputs.copy_header {
                    copy_header(header, path)?;
                }
                Some(OutputFile::create(path.clone(), None)?)
            }
            None => None,
        };
        let intensity_summary = if polar {
            None
        } else {
            Some(OutputFile::create(
                name("intensity_summary", 0),
                Some(INTENSITY_HEADER),
            )?)
        };

        debug!("Writing products to {}", dir.display());
        Ok(OutputWriter {
            polar,
            num_channels: params.num_channels,
            start_channel: params.start_channel,
            stop_channel: params.stop_channel,
            sample_width: params.sample_width,
            normalized_summary: params.normalize_data
                || params.chan_flagging.map(|c| c.selection)
                    == Some(BandshapeSelection::Normalized),
            grid,
            intensity_summary,
            pols,
            dir,
        })
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append the products of a finished block. Everything is flushed before
    /// returning, so interrupted runs only ever have whole blocks on disk.
    pub(crate) fn write_block(
        &mut self,
        block_index: usize,
        block_length: usize,
        products: &[PolarizationProducts],
    ) -> Result<(), OutputWriteError> {
        trace!("Writing block {block_index} ({block_length} samples)");
        self.write_grid(products)?;

        if let (Some(file), Some(p)) = (self.intensity_summary.as_mut(), products.first()) {
            let normalized = self.normalized_summary;
            file.write_with(|w| {
                write!(w, "{block_length}")?;
                let stats = p.channel_stats;
                for (&mean, &smooth) in stats.bandshape.iter().zip(&stats.smooth) {
                    let value = match (normalized, smooth == 0.0) {
                        (false, _) => mean,
                        (true, true) => 0.0,
                        (true, false) => mean / smooth,
                    };
                    write!(w, " {value}")?;
                }
                writeln!(w)
            })?;
            file.flush()?;
        }

        let padding_start = vec![1_u8; self.start_channel];
        let padding_end = vec![1_u8; self.num_channels - self.stop_channel];
        for (files, p) in self.pols.iter_mut().zip(products) {
            if let Some(file) = files.time_flags.as_mut() {
                let flags: Vec<u8> = p.time_flags.flags.iter().map(|&f| u8::from(f)).collect();
                file.write_with(|w| w.write_all(&flags))?;
                file.flush()?;
            }

            if let Some(file) = files.chan_flags.as_mut() {
                let flags: Vec<u8> = p.chan_flags.flags.iter().map(|&f| u8::from(f)).collect();
                file.write_with(|w| {
                    w.write_all(&padding_start)?;
                    w.write_all(&flags)?;
                    w.write_all(&padding_end)
                })?;
                file.flush()?;
            }

            if let (Some(files), Some(series)) = (files.dedispersed.as_mut(), p.dedispersed) {
                let start = p.dedispersed_start;
                files.filtered.write_with(|w| {
                    series
                        .filtered_series(start)
                        .iter()
                        .try_for_each(|&v| w.write_f32::<LittleEndian>(v))
                })?;
                files.unfiltered.write_with(|w| {
                    series
                        .unfiltered_series(start)
                        .iter()
                        .try_for_each(|&v| w.write_f32::<LittleEndian>(v))
                })?;
                files.count.write_with(|w| {
                    series
                        .counts(start)
                        .iter()
                        .try_for_each(|&c| w.write_i32::<LittleEndian>(c))
                })?;
                files.filtered.flush()?;
                files.unfiltered.flush()?;
                files.count.flush()?;
            }

            let line = stats_line(block_index, p.zero_dm, p.time_flags);
            files.stats.write_with(|w| writeln!(w, "{line}"))?;
            files.stats.flush()?;

            let time_percent = if block_length == 0 {
                0.0
            } else {
                p.time_flags.num_flagged() as f32 * 100.0 / block_length as f32
            };
            let (start, stop) = (self.start_channel, self.stop_channel);
            let chan_flags = &p.chan_flags.flags;
            files.flag_stats.write_with(|w| {
                let percentages = (0..self.num_channels).map(|c| {
                    if c < start || c >= stop || chan_flags[c - start] {
                        100.0
                    } else {
                        time_percent
                    }
                });
                for percent in percentages {
                    write!(w, "{percent} ")?;
                }
                writeln!(w)
            })?;
            files.flag_stats.flush()?;
        }

        Ok(())
    }

    /// Write the filtered grids of a block. Polarisations are interleaved per
    /// cell. 1-byte input gives 1-byte output, saturating at the limits of the
    /// type.
    fn write_grid(&mut self, products: &[PolarizationProducts]) -> Result<(), OutputWriteError> {
        let file = match self.grid.as_mut() {
            Some(f) => f,
            None => return Ok(()),
        };
        let grids: Vec<ArrayView2<i16>> = products.iter().filter_map(|p| p.grid).collect();
        if grids.len() != products.len() || grids.is_empty() {
            return Ok(());
        }

        let one_byte = self.sample_width == SampleWidth::Int8;
        let polar = self.polar;
        let num_cells = grids[0].len();
        let mut cells: Vec<_> = grids.iter().map(|g| g.iter()).collect();
        let mut bytes = Vec::with_capacity(num_cells * grids.len() * if one_byte { 1 } else { 2 });
        for _ in 0..num_cells {
            for cell in cells.iter_mut() {
                let v = cell.next().copied().unwrap_or_default();
                match (one_byte, polar) {
                    (true, false) => bytes.push(v.clamp(0, u8::MAX.into()) as u8),
                    (true, true) => bytes.push(v.clamp(i8::MIN.into(), i8::MAX.into()) as i8 as u8),
                    (false, _) => bytes.extend_from_slice(&v.to_le_bytes()),
                }
            }
        }
        file.write_with(|w| w.write_all(&bytes))?;
        file.flush()
    }

    /// Flush everything and write the whole-run products.
    pub(crate) fn finish(
        mut self,
        cumulative: &[CumulativeBandshape],
        profiles: Option<&[Profile]>,
    ) -> Result<(), OutputWriteError> {
        if let Some(grid) = self.grid.as_mut() {
            grid.flush()?;
        }

        let polar = self.polar;
        let dir = &self.dir;
        let name = |stem: &str, k: usize| -> PathBuf {
            if polar {
                dir.join(format!("{stem}{}.gpt", k + 1))
            } else {
                dir.join(format!("{stem}.gpt"))
            }
        };

        let scale = f64::from(CUMULATIVE_SCALE);
        for (k, bandshape) in cumulative.iter().enumerate() {
            let mut file = OutputFile::create(name("bandshape", k), Some(BANDSHAPE_HEADER))?;
            file.write_with(|w| {
                for (c, &count) in bandshape.count.iter().enumerate() {
                    if count == 0 {
                        // Never had any data.
                        writeln!(w, "{c} 0 0 -1")?;
                        continue;
                    }
                    let n = count as f64;
                    let mean = bandshape.sum[c] / n;
                    let rms = (bandshape.sum_sq[c] / n - mean * mean).sqrt();
                    let smooth = bandshape.smooth_sum[c] / n;
                    writeln!(w, "{c} {} {} {}", smooth * scale, mean * scale, rms * scale)?;
                }
                Ok(())
            })?;
            file.flush()?;
        }

        for (k, profile) in profiles.unwrap_or_default().iter().enumerate() {
            let current = profile.current();
            let bins = profile.bins();
            for (stem, values) in [
                ("profile_filtered", &current.filtered),
                ("profile_unfiltered", &current.unfiltered),
            ] {
                let mut file = OutputFile::create(name(stem, k), Some(PROFILE_HEADER))?;
                file.write_with(|w| {
                    for (i, v) in values.iter().enumerate() {
                        writeln!(w, "{}\t {v}", i as f32 / bins as f32)?;
                    }
                    Ok(())
                })?;
                file.flush()?;
            }
        }

        for files in self.pols.iter_mut() {
            files.stats.flush()?;
            files.flag_stats.flush()?;
        }
        Ok(())
    }
}

/// One line of `stats.gpt`: the time-flagging estimate, then the mean and rms
/// of the zero-DM series before and after flagging, then their ratios.
fn stats_line(block_index: usize, zero_dm: &ZeroDm, time_flags: &FlagSet) -> String {
    let mut pre = (0.0, 0.0, 0_usize);
    let mut post = (0.0, 0.0, 0_usize);
    for ((&unfiltered, &filtered), &flagged) in zero_dm
        .unfiltered
        .iter()
        .zip(&zero_dm.filtered)
        .zip(&time_flags.flags)
    {
        let u = f64::from(unfiltered);
        pre = (pre.0 + u, pre.1 + u * u, pre.2 + 1);
        if !flagged {
            let f = f64::from(filtered);
            post = (post.0 + f, post.1 + f * f, post.2 + 1);
        }
    }
    let mean_rms = |(sum, sum_sq, n): (f64, f64, usize)| {
        let n = n as f64;
        let mean = sum / n;
        (mean, (sum_sq / n - mean * mean).sqrt())
    };
    let (mean_pre, rms_pre) = mean_rms(pre);
    let (mean_post, rms_post) = mean_rms(post);
    let estimate = time_flags.estimate;
    format!(
        "{block_index}\t{}\t{mean_pre}\t{mean_post}\t{}\t{rms_pre}\t{rms_post}\t{}\t{}\t{}",
        estimate.centre,
        estimate.spread,
        estimate.centre / estimate.spread,
        mean_pre / rms_pre,
        mean_post / rms_post,
    )
}

/// Put a copy of the input's header next to the filtered data, so the filtered
/// data can be processed again (e.g. `data.gpt` gets `data.gpt.hdr`).
fn copy_header(header: &Path, grid: &Path) -> Result<(), OutputWriteError> {
    let mut to = grid.as_os_str().to_owned();
    to.push(".hdr");
    let to = PathBuf::from(to);
    debug!("Copying {} to {}", header.display(), to.display());
    std::fs::copy(header, &to).map_err(|err| OutputWriteError::CopyHeader {
        from: header.display().to_string(),
        to: to.display().to_string(),
        err,
    })?;
    Ok(())
}
