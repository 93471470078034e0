// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Code to acquire blocks of filterbank data, either from a file or from a
//! shared-memory ring buffer, and to unpack them into floats.

mod error;
mod file;
mod ring;
#[cfg(test)]
mod tests;

pub(crate) use error::BlockReadError;
pub(crate) use file::FileSource;
pub(crate) use ring::{MmapRing, RingSource};
#[cfg(test)]
pub(crate) use ring::{MemoryRing, RingImage};

use byteorder::{ByteOrder, LittleEndian};
use ndarray::prelude::*;

use crate::params::{PolarizationMode, SampleWidth};

/// A block of raw bytes, exactly as it was stored by the source.
#[derive(Debug, Clone)]
pub(crate) struct RawBlock {
    /// The index of this block, counting from the first block of the run.
    pub(crate) index: usize,

    /// The number of time samples in the block. This is less than requested if
    /// the source ran out of data.
    pub(crate) num_samples: usize,

    pub(crate) bytes: Vec<u8>,
}

/// The result of asking a source for a block.
#[derive(Debug)]
pub(crate) struct Acquired {
    pub(crate) block: RawBlock,

    /// The source has no more data after this block. This isn't an error; it
    /// is how every run ends.
    pub(crate) end_of_stream: bool,
}

pub(crate) trait BlockSource: Send {
    /// Read the next block of `num_samples` time samples.
    fn acquire(&mut self, index: usize, num_samples: usize) -> Result<Acquired, BlockReadError>;

    /// The total number of time samples handed out so far.
    fn samples_consumed(&self) -> u64;

    /// Is the data produced in real time by someone else? If so, the source
    /// paces the pipeline itself.
    fn is_live(&self) -> bool;
}

/// Generates the length of each successive block \[samples\]. A block
/// duration is rarely a whole number of samples; the fractional part is
/// carried over so that, on average, blocks have the requested duration.
#[derive(Debug, Clone)]
pub(crate) struct BlockLengths {
    nominal: usize,
    remainder: f64,
    accumulated: f64,
}

impl BlockLengths {
    pub(crate) fn new(block_duration: f64, sampling_interval: f64) -> BlockLengths {
        let exact = block_duration / sampling_interval;
        BlockLengths {
            nominal: exact.floor() as usize,
            remainder: exact.fract(),
            accumulated: 0.0,
        }
    }
}

impl Iterator for BlockLengths {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        self.accumulated += self.remainder;
        if self.accumulated >= 1.0 {
            self.accumulated -= 1.0;
            Some(self.nominal + 1)
        } else {
            Some(self.nominal)
        }
    }
}

/// Convert the raw bytes of a block into one `time × channel` float array per
/// polarisation.
///
/// Full-polarisation data is stored as P, Q, R, S words for each channel of
/// each time sample, and 8- and 16-bit full-polarisation samples are signed.
pub(crate) fn deinterleave(
    block: &RawBlock,
    num_channels: usize,
    sample_width: SampleWidth,
    polarization: PolarizationMode,
) -> Vec<Array2<f32>> {
    let num_pols = polarization.num_pols();
    let num_values = block.num_samples * num_channels * num_pols;
    let bytes = &block.bytes[..num_values * sample_width.num_bytes()];
    let signed = polarization == PolarizationMode::Full;

    let values: Vec<f32> = match sample_width {
        SampleWidth::Int8 if signed => bytemuck::cast_slice::<u8, i8>(bytes)
            .iter()
            .map(|&v| f32::from(v))
            .collect(),
        SampleWidth::Int8 => bytes.iter().map(|&v| f32::from(v)).collect(),
        SampleWidth::Int16 if signed => {
            let mut buf = vec![0; num_values];
            LittleEndian::read_i16_into(bytes, &mut buf);
            buf.into_iter().map(f32::from).collect()
        }
        SampleWidth::Int16 => {
            let mut buf = vec![0; num_values];
            LittleEndian::read_u16_into(bytes, &mut buf);
            buf.into_iter().map(f32::from).collect()
        }
        SampleWidth::Float32 => {
            let mut buf = vec![0.0; num_values];
            LittleEndian::read_f32_into(bytes, &mut buf);
            buf
        }
    };

    // The shape can't be wrong; the slice above has exactly this many values.
    let values_tcp = Array3::from_shape_vec((block.num_samples, num_channels, num_pols), values)
        .expect("number of values matches the block shape");
    values_tcp
        .axis_iter(Axis(2))
        .map(|values_tc| values_tc.to_owned())
        .collect()
}
