//! Single-producer single-consumer byte ring inside a shared mapping.
//!
//! Layout of one ring region:
//!
//! ```text
//! 0   write_pos  u64 LE   total bytes ever published
//! 8   read_pos   u64 LE   total bytes ever consumed
//! 16  sequence   u64 LE   frames ever published
//! 24  capacity   u64 LE   size of the data area
//! 64  data       [len: u32 LE][payload] frames, wrapping at capacity
//! ```
//!
//! The producer only stores `write_pos`/`sequence`, the consumer only stores
//! `read_pos`. Positions grow monotonically and are reduced modulo capacity.

use crate::error::Error;
use memmap2::{MmapMut, MmapOptions};
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};

pub const HEADER_LEN: usize = 64;
pub const PAGE_LEN: usize = 4096;
const LEN_PREFIX: usize = 4;

const WRITE_POS: usize = 0;
const READ_POS: usize = 8;
const SEQUENCE: usize = 16;
const CAPACITY: usize = 24;

/// Bytes one ring occupies in the segment file, rounded up to whole pages.
pub fn region_len(capacity: usize) -> usize {
    (HEADER_LEN + capacity).div_ceil(PAGE_LEN) * PAGE_LEN
}

pub struct Ring {
    map: MmapMut,
    capacity: usize,
}

impl Ring {
    /// Maps a region and resets its header.
    pub fn create(file: &File, offset: usize, capacity: usize) -> Result<Self, Error> {
        let mut ring = Self::map(file, offset, capacity)?;
        ring.map[..HEADER_LEN].fill(0);
        ring.cursor(CAPACITY)
            .store(capacity as u64, Ordering::Release);
        Ok(ring)
    }

    /// Maps a region initialised by the other side.
    pub fn open(file: &File, offset: usize, capacity: usize) -> Result<Self, Error> {
        let ring = Self::map(file, offset, capacity)?;
        let recorded = ring.cursor(CAPACITY).load(Ordering::Acquire);
        if recorded != capacity as u64 {
            return Err(Error::transport(format!(
                "ring capacity mismatch: header says {}, expected {}",
                recorded, capacity
            )));
        }
        Ok(ring)
    }

    fn map(file: &File, offset: usize, capacity: usize) -> Result<Self, Error> {
        if capacity <= LEN_PREFIX {
            return Err(Error::transport(format!("ring capacity {} too small", capacity)));
        }
        let map = unsafe {
            MmapOptions::new()
                .offset(offset as u64)
                .len(HEADER_LEN + capacity)
                .map_mut(file)
                .map_err(|source| Error::IO { source })?
        };
        Ok(Self { map, capacity })
    }

    fn cursor(&self, field: usize) -> &AtomicU64 {
        // Header fields are 8-byte aligned: the mapping starts on a page.
        unsafe { AtomicU64::from_ptr(self.map.as_ptr().add(field) as *mut u64) }
    }

    /// Largest payload a single frame may carry.
    pub fn max_payload(&self) -> usize {
        self.capacity - LEN_PREFIX
    }

    /// Frames published so far.
    pub fn sequence(&self) -> u64 {
        self.cursor(SEQUENCE).load(Ordering::Acquire)
    }

    /// Publishes one frame. `Ok(false)` means the ring lacks space right now.
    pub fn try_write(&mut self, payload: &[u8]) -> Result<bool, Error> {
        if payload.len() > self.max_payload() {
            return Err(Error::FrameTooLarge {
                size: payload.len(),
                capacity: self.max_payload(),
            });
        }
        let write = self.cursor(WRITE_POS).load(Ordering::Relaxed);
        let read = self.cursor(READ_POS).load(Ordering::Acquire);
        let used = write.wrapping_sub(read) as usize;
        let needed = LEN_PREFIX + payload.len();
        if used > self.capacity {
            return Err(Error::transport("ring cursors are corrupt"));
        }
        if self.capacity - used < needed {
            return Ok(false);
        }

        self.copy_in(write, &(payload.len() as u32).to_le_bytes());
        self.copy_in(write + LEN_PREFIX as u64, payload);
        self.cursor(WRITE_POS)
            .store(write + needed as u64, Ordering::Release);
        self.cursor(SEQUENCE).fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Takes the next published frame, if any.
    pub fn try_read(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let read = self.cursor(READ_POS).load(Ordering::Relaxed);
        let write = self.cursor(WRITE_POS).load(Ordering::Acquire);
        if read == write {
            return Ok(None);
        }
        let available = write.wrapping_sub(read) as usize;
        if available > self.capacity || available < LEN_PREFIX {
            return Err(Error::transport("ring cursors are corrupt"));
        }

        let mut prefix = [0u8; LEN_PREFIX];
        self.copy_out(read, &mut prefix);
        let len = u32::from_le_bytes(prefix) as usize;
        if LEN_PREFIX + len > available {
            return Err(Error::transport(format!(
                "frame length {} exceeds published bytes {}",
                len, available
            )));
        }

        let mut payload = vec![0u8; len];
        self.copy_out(read + LEN_PREFIX as u64, &mut payload);
        self.cursor(READ_POS)
            .store(read + (LEN_PREFIX + len) as u64, Ordering::Release);
        Ok(Some(payload))
    }

    fn copy_in(&mut self, pos: u64, bytes: &[u8]) {
        let start = (pos % self.capacity as u64) as usize;
        let first = bytes.len().min(self.capacity - start);
        let data = &mut self.map[HEADER_LEN..];
        data[start..start + first].copy_from_slice(&bytes[..first]);
        data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
    }

    fn copy_out(&self, pos: u64, out: &mut [u8]) {
        let start = (pos % self.capacity as u64) as usize;
        let first = out.len().min(self.capacity - start);
        let data = &self.map[HEADER_LEN..];
        out[..first].copy_from_slice(&data[start..start + first]);
        let rest = out.len() - first;
        out[first..].copy_from_slice(&data[..rest]);
    }
}
