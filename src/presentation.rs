// src/presentation.rs
use crate::block_device::CounterSnapshot;
use crate::throughput::ThroughputTracker;
use log::info;
use std::fmt::{self, Write};

/// What the status view shows for the bound image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresentationModel {
    pub file_name: String,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub read_speed: u64,
    pub write_speed: u64,
}

impl PresentationModel {
    pub fn set_file_name(&mut self, name: &str) {
        self.file_name = name.to_string();
    }

    pub fn set_stats(&mut self, counters: CounterSnapshot, tracker: &ThroughputTracker) {
        self.bytes_read = counters.bytes_read;
        self.bytes_written = counters.bytes_written;
        self.read_speed = tracker.read_rate();
        self.write_speed = tracker.write_rate();
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn read_line(&self) -> String {
        status_line("R:", self.bytes_read, self.read_speed)
    }

    pub fn write_line(&self) -> String {
        status_line("W:", self.bytes_written, self.write_speed)
    }
}

impl fmt::Display for PresentationModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {} | {}", self.file_name, self.read_line(), self.write_line())
    }
}

fn status_line(prefix: &str, total: u64, speed: u64) -> String {
    let mut line = String::from(prefix);
    append_suffixed_byte_count(&mut line, total);
    if speed > 0 {
        line.push_str("; ");
        append_suffixed_byte_count(&mut line, speed);
        line.push_str("ps");
    }
    line
}

pub fn append_suffixed_byte_count(out: &mut String, count: u64) {
    const K: u64 = 1024;
    let _ = if count < K {
        write!(out, "{}B", count)
    } else if count < K * K {
        write!(out, "{}K", count / K)
    } else if count < K * K * K {
        write!(out, "{:.3}M", count as f64 / (K * K) as f64)
    } else {
        write!(out, "{:.3}G", count as f64 / (K * K * K) as f64)
    };
}

/// Consumer of the presentation model.
pub trait StatusView: Send {
    fn show_file_name(&mut self, name: &str);
    fn show_stats(&mut self, model: &PresentationModel);
}

/// Status view that writes to the log whenever the numbers change.
#[derive(Default)]
pub struct LogStatusView {
    last: Option<(String, String)>,
}

impl StatusView for LogStatusView {
    fn show_file_name(&mut self, name: &str) {
        self.last = None;
        info!("Serving image: {}", name);
    }

    fn show_stats(&mut self, model: &PresentationModel) {
        let lines = (model.read_line(), model.write_line());
        if self.last.as_ref() != Some(&lines) {
            info!("{}  {}", lines.0, lines.1);
            self.last = Some(lines);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn fmt(count: u64) -> String {
        let mut s = String::new();
        append_suffixed_byte_count(&mut s, count);
        s
    }

    #[test]
    fn test_suffixed_byte_count() {
        assert_eq!(fmt(0), "0B");
        assert_eq!(fmt(1023), "1023B");
        assert_eq!(fmt(1024), "1K");
        assert_eq!(fmt(1536), "1K");
        assert_eq!(fmt(1024 * 1024), "1.000M");
        assert_eq!(fmt(3 * 1024 * 1024 / 2), "1.500M");
        assert_eq!(fmt(2 * 1024 * 1024 * 1024), "2.000G");
    }

    #[test]
    fn test_status_lines() {
        let t0 = Instant::now();
        let mut tracker = ThroughputTracker::new(t0);
        let counters = CounterSnapshot { bytes_read: 4096, bytes_written: 512 };
        tracker.sample(CounterSnapshot { bytes_read: 4096, bytes_written: 0 }, t0 + Duration::from_millis(1000));

        let mut model = PresentationModel::default();
        model.set_file_name("test.img");
        model.set_stats(counters, &tracker);

        assert_eq!(model.read_line(), "R:4K; 4Kps");
        assert_eq!(model.write_line(), "W:512B");
        assert_eq!(model.to_string(), "test.img | R:4K; 4Kps | W:512B");

        model.clear();
        assert_eq!(model, PresentationModel::default());
    }
}
