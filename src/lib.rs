// src/lib.rs
//! Serve a disk image file to the host as a block-addressable virtual disk.

pub mod block_device;
pub mod config;
pub mod file_disk;
pub mod fuse_transport;
pub mod image_factory;
pub mod presentation;
pub mod session;
pub mod throughput;
pub mod transport;

pub use block_device::{BlockDevice, CounterSnapshot, DiskError, IoCounters, BLOCK_SIZE};
pub use config::Config;
pub use file_disk::FileDisk;
pub use session::{SessionController, SessionEvent, SessionState};
pub use transport::{LoopbackHost, LoopbackTransport, Transport};
