// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Blocks from a raw filterbank file.

use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom},
    path::Path,
};

use log::{debug, trace};

use super::{Acquired, BlockReadError, BlockSource, RawBlock};

pub(crate) struct FileSource {
    reader: BufReader<File>,

    /// The size of the file \[bytes\].
    len: u64,

    /// The current read position \[bytes\].
    pos: u64,

    bytes_per_time_sample: usize,
    samples_consumed: u64,
}

impl FileSource {
    /// Open a raw file and skip `start_time` seconds into it.
    pub(crate) fn new(
        file: &Path,
        start_time: f64,
        sampling_interval: f64,
        bytes_per_time_sample: usize,
    ) -> Result<FileSource, BlockReadError> {
        let mut handle = File::open(file)?;
        let len = handle.metadata()?.len();
        if len == 0 {
            return Err(BlockReadError::EmptyFile(file.display().to_string()));
        }

        let start_sample = (start_time / sampling_interval).floor() as u64;
        let pos = start_sample * bytes_per_time_sample as u64;
        if pos > len {
            return Err(BlockReadError::StartBeyondEnd {
                start_time,
                duration: (len / bytes_per_time_sample as u64) as f64 * sampling_interval,
            });
        }
        handle.seek(SeekFrom::Start(pos))?;
        debug!(
            "Reading '{}' ({len} bytes) from byte {pos} (sample {start_sample})",
            file.display()
        );

        Ok(FileSource {
            reader: BufReader::new(handle),
            len,
            pos,
            bytes_per_time_sample,
            samples_consumed: 0,
        })
    }

    /// The number of whole time samples left in the file.
    pub(crate) fn samples_remaining(&self) -> u64 {
        (self.len - self.pos) / self.bytes_per_time_sample as u64
    }
}

impl BlockSource for FileSource {
    fn acquire(&mut self, index: usize, num_samples: usize) -> Result<Acquired, BlockReadError> {
        let wanted = (num_samples * self.bytes_per_time_sample) as u64;
        let remaining = self.len - self.pos;
        let (num_bytes, end_of_stream) = if wanted > remaining {
            // Only whole time samples are handed out.
            let whole = remaining - remaining % self.bytes_per_time_sample as u64;
            (whole, true)
        } else {
            (wanted, false)
        };

        let mut bytes = vec![0; num_bytes as usize];
        self.reader.read_exact(&mut bytes)?;
        // Any trailing partial sample is skipped along with the rest.
        self.pos += if end_of_stream { remaining } else { num_bytes };

        let num_samples = num_bytes as usize / self.bytes_per_time_sample;
        self.samples_consumed += num_samples as u64;
        trace!("Read block {index}: {num_samples} samples (end of stream: {end_of_stream})");

        Ok(Acquired {
            block: RawBlock {
                index,
                num_samples,
                bytes,
            },
            end_of_stream,
        })
    }

    fn samples_consumed(&self) -> u64 {
        self.samples_consumed
    }

    fn is_live(&self) -> bool {
        false
    }
}
