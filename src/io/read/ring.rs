// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Blocks from a shared-memory ring buffer that a correlator writes into.
//!
//! All fields are little endian. The ring starts with a 64-byte header:
//!
//! | offset | type | meaning                                      |
//! |--------|------|----------------------------------------------|
//! | 0      | u32  | writer status; 1 while running, 0 once done  |
//! | 4      | u32  | the record the writer is currently filling   |
//! | 8      | u64  | the sequence number of that record           |
//! | 16     | u32  | the number of records in the ring            |
//! | 20     | u32  | the size of each record \[bytes\]            |
//!
//! followed by one 16-byte slot per record (u32 flags, u32 record index, u64
//! sequence number; bit 0 of the flags is set once the record is complete),
//! followed by the records themselves. Each record starts with
//! [`RECORD_HEADER_BYTES`] of metadata, then filterbank data.

use std::{fs::File, path::Path, thread};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, trace, warn};
use memmap2::Mmap;

use super::{Acquired, BlockReadError, BlockSource, RawBlock};
use crate::constants::{RECORD_HEADER_BYTES, RING_POLL_INTERVAL};

const HEADER_BYTES: usize = 64;
const SLOT_BYTES: usize = 16;
const RECORD_READY: u32 = 1;

// The header fields end at byte 24.
static_assertions::const_assert!(HEADER_BYTES >= 24);

/// Something that exposes the bytes of a ring buffer. The bytes may be changed
/// by another process at any time.
pub(crate) trait RingBuffer: Send {
    fn bytes(&self) -> &[u8];
}

/// A ring buffer backed by a memory-mapped file (e.g. under /dev/shm).
pub(crate) struct MmapRing {
    map: Mmap,
}

impl MmapRing {
    pub(crate) fn open(file: &Path) -> Result<MmapRing, BlockReadError> {
        let handle = File::open(file)?;
        // Safety: the mapping is read only. Another process writes into it,
        // but all reads of shared state are of plain integers and bytes.
        let map = unsafe { Mmap::map(&handle)? };
        Ok(MmapRing { map })
    }
}

impl RingBuffer for MmapRing {
    fn bytes(&self) -> &[u8] {
        &self.map
    }
}

/// A ring buffer that lives entirely in this process.
#[cfg(test)]
pub(crate) struct MemoryRing(pub(crate) Vec<u8>);

#[cfg(test)]
impl RingBuffer for MemoryRing {
    fn bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Builds the bytes of a ring buffer in the layout described above.
#[cfg(test)]
pub(crate) struct RingImage {
    bytes: Vec<u8>,
    max_blocks: usize,
    record_size: usize,
}

#[cfg(test)]
impl RingImage {
    pub(crate) fn new(max_blocks: usize, data_bytes_per_record: usize) -> RingImage {
        let record_size = RECORD_HEADER_BYTES + data_bytes_per_record;
        let mut bytes = vec![0; HEADER_BYTES + max_blocks * (SLOT_BYTES + record_size)];
        LittleEndian::write_u32(&mut bytes[16..20], max_blocks as u32);
        LittleEndian::write_u32(&mut bytes[20..24], record_size as u32);
        RingImage {
            bytes,
            max_blocks,
            record_size,
        }
    }

    pub(crate) fn set_running(&mut self, running: bool) {
        LittleEndian::write_u32(&mut self.bytes[0..4], u32::from(running));
    }

    pub(crate) fn set_current(&mut self, rec: usize, seqnum: u64) {
        LittleEndian::write_u32(&mut self.bytes[4..8], rec as u32);
        LittleEndian::write_u64(&mut self.bytes[8..16], seqnum);
    }

    /// Fill a record with data and mark it complete.
    pub(crate) fn fill_record(&mut self, rec: usize, seqnum: u64, data: &[u8]) {
        let slot = HEADER_BYTES + rec * SLOT_BYTES;
        LittleEndian::write_u32(&mut self.bytes[slot..slot + 4], RECORD_READY);
        LittleEndian::write_u32(&mut self.bytes[slot + 4..slot + 8], rec as u32);
        LittleEndian::write_u64(&mut self.bytes[slot + 8..slot + 16], seqnum);
        let start = HEADER_BYTES
            + self.max_blocks * SLOT_BYTES
            + rec * self.record_size
            + RECORD_HEADER_BYTES;
        self.bytes[start..start + data.len()].copy_from_slice(data);
    }

    pub(crate) fn into_ring(self) -> MemoryRing {
        MemoryRing(self.bytes)
    }
}

pub(crate) struct RingSource<R: RingBuffer> {
    ring: R,
    name: String,
    max_blocks: usize,
    record_size: usize,

    /// The record being read from.
    rec_num: usize,

    /// The number of data bytes of the current record already handed out.
    partial_offset: usize,

    /// The sequence number the current record must have (at least) to be
    /// new data. Unknown until the first record is read.
    expected_seqnum: Option<u64>,

    bytes_per_time_sample: usize,
    samples_consumed: u64,
}

impl<R: RingBuffer> RingSource<R> {
    /// Attach to a ring. Reading starts from the record the writer is
    /// currently filling.
    pub(crate) fn new(
        ring: R,
        name: String,
        bytes_per_time_sample: usize,
        sample_bytes: usize,
    ) -> Result<RingSource<R>, BlockReadError> {
        let bytes = ring.bytes();
        if bytes.len() < HEADER_BYTES {
            return Err(BlockReadError::RingTooSmall {
                file: name,
                size: bytes.len(),
            });
        }

        let max_blocks = LittleEndian::read_u32(&bytes[16..20]) as usize;
        let record_size = LittleEndian::read_u32(&bytes[20..24]) as usize;
        let rec_num = LittleEndian::read_u32(&bytes[4..8]) as usize;
        let bad = |reason: String| BlockReadError::BadRingHeader {
            file: name.clone(),
            reason,
        };
        if max_blocks == 0 {
            return Err(bad("it has no records".to_string()));
        }
        if record_size <= RECORD_HEADER_BYTES {
            return Err(bad(format!(
                "records are {record_size} bytes, but their header alone is {RECORD_HEADER_BYTES} bytes"
            )));
        }
        let expected = HEADER_BYTES + max_blocks * (SLOT_BYTES + record_size);
        if bytes.len() < expected {
            return Err(bad(format!(
                "{max_blocks} records of {record_size} bytes need {expected} bytes, but only {} are mapped",
                bytes.len()
            )));
        }
        if rec_num >= max_blocks {
            return Err(bad(format!(
                "the current record ({rec_num}) is not less than the number of records ({max_blocks})"
            )));
        }
        let record_bytes = record_size - RECORD_HEADER_BYTES;
        if record_bytes % sample_bytes != 0 {
            return Err(BlockReadError::RecordSampleMismatch {
                record_bytes,
                sample_bytes,
            });
        }
        debug!("Attached to ring '{name}': {max_blocks} records of {record_bytes} data bytes; starting at record {rec_num}");

        Ok(RingSource {
            ring,
            name,
            max_blocks,
            record_size,
            rec_num,
            partial_offset: 0,
            expected_seqnum: None,
            bytes_per_time_sample,
            samples_consumed: 0,
        })
    }

    fn writer_running(&self) -> bool {
        LittleEndian::read_u32(&self.ring.bytes()[0..4]) == 1
    }

    fn writer_record(&self) -> (usize, u64) {
        let bytes = self.ring.bytes();
        (
            LittleEndian::read_u32(&bytes[4..8]) as usize,
            LittleEndian::read_u64(&bytes[8..16]),
        )
    }

    fn slot(&self, rec: usize) -> (u32, u64) {
        let start = HEADER_BYTES + rec * SLOT_BYTES;
        let slot = &self.ring.bytes()[start..start + SLOT_BYTES];
        (
            LittleEndian::read_u32(&slot[0..4]),
            LittleEndian::read_u64(&slot[8..16]),
        )
    }

    fn record_data(&self, rec: usize) -> &[u8] {
        let start = HEADER_BYTES
            + self.max_blocks * SLOT_BYTES
            + rec * self.record_size
            + RECORD_HEADER_BYTES;
        &self.ring.bytes()[start..start + self.record_size - RECORD_HEADER_BYTES]
    }

    /// Block until the current record holds new, complete data. Returns false
    /// if the writer stopped before that happened.
    fn wait_for_record(&self) -> bool {
        let mut logged = false;
        loop {
            let (flags, seqnum) = self.slot(self.rec_num);
            let fresh = self.expected_seqnum.map_or(true, |e| seqnum >= e);
            if flags & RECORD_READY != 0 && fresh {
                return true;
            }
            if !self.writer_running() {
                return false;
            }
            if !logged {
                info!("Waiting for record {} of '{}'", self.rec_num, self.name);
                logged = true;
            }
            thread::sleep(RING_POLL_INTERVAL);
        }
    }

    /// If the writer is about to overwrite the record we're reading, jump to
    /// just behind the writer.
    fn catch_up(&mut self) {
        let (_, seqnum) = self.slot(self.rec_num);
        let (writer_rec, writer_seqnum) = self.writer_record();
        let lag = writer_seqnum.saturating_sub(seqnum);
        if lag >= self.max_blocks as u64 - 1 && self.max_blocks > 1 {
            let new_rec = (writer_rec + 3 * self.max_blocks - 3) % self.max_blocks;
            warn!(
                "Processing is {lag} records behind the writer of '{}'; skipping from record {} to {new_rec}",
                self.name, self.rec_num
            );
            self.rec_num = new_rec;
            self.partial_offset = 0;
            self.expected_seqnum = None;
        }
    }
}

impl<R: RingBuffer> BlockSource for RingSource<R> {
    fn acquire(&mut self, index: usize, num_samples: usize) -> Result<Acquired, BlockReadError> {
        let wanted = num_samples * self.bytes_per_time_sample;
        let mut bytes = Vec::with_capacity(wanted);
        let mut end_of_stream = false;

        while bytes.len() < wanted {
            if !self.wait_for_record() {
                end_of_stream = true;
                break;
            }
            self.catch_up();
            if !self.wait_for_record() {
                end_of_stream = true;
                break;
            }

            let (_, seqnum) = self.slot(self.rec_num);
            let data = self.record_data(self.rec_num);
            let record_len = data.len();
            let take = (record_len - self.partial_offset).min(wanted - bytes.len());
            bytes.extend_from_slice(&data[self.partial_offset..self.partial_offset + take]);
            self.partial_offset += take;
            if self.partial_offset == record_len {
                self.partial_offset = 0;
                self.rec_num = (self.rec_num + 1) % self.max_blocks;
                self.expected_seqnum = Some(seqnum + 1);
            }
        }

        if end_of_stream {
            bytes.truncate(bytes.len() - bytes.len() % self.bytes_per_time_sample);
            debug!("The writer of '{}' has stopped", self.name);
        }
        let num_samples = bytes.len() / self.bytes_per_time_sample;
        self.samples_consumed += num_samples as u64;
        trace!("Read block {index} from the ring: {num_samples} samples");

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
        true
    }
}
