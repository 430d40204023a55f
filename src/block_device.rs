// src/block_device.rs
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub const BLOCK_SIZE: usize = 512;
// Leading bytes cleared on a fresh image (partition table and adjacent metadata)
pub const HEADER_ZERO_LEN: usize = 4096;

/// Callback set the host transport drives against the bound image.
///
/// Calls may arrive from a different thread than the one that bound the
/// device. The transport serializes its own calls.
pub trait BlockDevice: Send + Sync {
    /// Read `count` blocks starting at `lba` into `out`. Returns the number of
    /// bytes placed in `out` and whether the full (clamped) request was served.
    fn read(&self, lba: u32, count: u16, out: &mut [u8]) -> (usize, bool);

    /// Write `count` blocks starting at `lba`. `data.len()` must be exactly
    /// `count * BLOCK_SIZE`.
    fn write(&self, lba: u32, count: u16, data: &[u8]) -> bool;

    fn num_blocks(&self) -> u32;

    /// Host asked for the medium to be removed.
    fn eject(&self);
}

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Image not found: {0:?}")]
    Missing(PathBuf),
    #[error("Short transfer: {obtained} of {expected} bytes")]
    ShortTransfer { obtained: usize, expected: usize },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("No image bound")]
    Unbound,
}

/// Byte offset of a block address. Computed in u64 so large images don't wrap.
pub fn block_offset(lba: u32) -> u64 {
    lba as u64 * BLOCK_SIZE as u64
}

/// Cumulative transfer totals for one session.
#[derive(Debug, Default)]
pub struct IoCounters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl IoCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn add_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::SeqCst)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_read: self.bytes_read(),
            bytes_written: self.bytes_written(),
        }
    }
}
