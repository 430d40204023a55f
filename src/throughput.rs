// src/throughput.rs
use crate::block_device::CounterSnapshot;
use std::time::Instant;

/// Derives bytes-per-second rates from successive counter samples.
#[derive(Debug, Clone)]
pub struct ThroughputTracker {
    last: CounterSnapshot,
    last_time: Instant,
    read_rate: u64,
    write_rate: u64,
}

impl ThroughputTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            last: CounterSnapshot::default(),
            last_time: now,
            read_rate: 0,
            write_rate: 0,
        }
    }

    /// Start over from zeroed counters, as at session bind.
    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(now);
    }

    pub fn sample(&mut self, current: CounterSnapshot, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_time).as_millis() as u64;

        // Zero elapsed keeps the previous rates
        if elapsed_ms > 0 {
            let read_delta = current.bytes_read.saturating_sub(self.last.bytes_read);
            let write_delta = current.bytes_written.saturating_sub(self.last.bytes_written);
            self.read_rate = read_delta.saturating_mul(1000) / elapsed_ms;
            self.write_rate = write_delta.saturating_mul(1000) / elapsed_ms;
        }

        self.last = current;
        self.last_time = now;
    }

    pub fn read_rate(&self) -> u64 {
        self.read_rate
    }

    pub fn write_rate(&self) -> u64 {
        self.write_rate
    }
}
