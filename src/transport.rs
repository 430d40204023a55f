// src/transport.rs
use crate::block_device::{BlockDevice, DiskError};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Host-facing side of a session. Turns host traffic into calls on the bound
/// `BlockDevice`, from its own thread.
pub trait Transport {
    /// Host link is held by something else; binding has to wait.
    fn is_locked(&self) -> bool;

    fn start(&mut self, device_name: &str, device: Arc<dyn BlockDevice>) -> Result<(), DiskError>;

    fn stop(&mut self);
}

#[derive(Default)]
struct LoopbackState {
    attached: Option<(String, Arc<dyn BlockDevice>)>,
    starts: usize,
    stops: usize,
}

/// In-process transport. The paired `LoopbackHost` plays the host and can be
/// driven from any thread.
#[derive(Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<LoopbackState>>,
    locked: Arc<AtomicBool>,
    serial: Arc<Mutex<()>>,
}

#[derive(Clone)]
pub struct LoopbackHost {
    state: Arc<Mutex<LoopbackState>>,
    locked: Arc<AtomicBool>,
    serial: Arc<Mutex<()>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(&self) -> LoopbackHost {
        LoopbackHost {
            state: self.state.clone(),
            locked: self.locked.clone(),
            serial: self.serial.clone(),
        }
    }
}

impl Transport for LoopbackTransport {
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn start(&mut self, device_name: &str, device: Arc<dyn BlockDevice>) -> Result<(), DiskError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.attached.is_some() {
            return Err(DiskError::Transport("Loopback already has a device attached".into()));
        }
        debug!("Loopback: attached '{}'", device_name);
        state.attached = Some((device_name.to_string(), device));
        state.starts += 1;
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.attached.take().is_some() {
            debug!("Loopback: detached");
        }
        state.stops += 1;
    }
}

impl LoopbackHost {
    fn device(&self) -> Option<Arc<dyn BlockDevice>> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.attached.as_ref().map(|(_, dev)| dev.clone())
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    pub fn device_name(&self) -> Option<String> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.attached.as_ref().map(|(name, _)| name.clone())
    }

    pub fn is_attached(&self) -> bool {
        self.device().is_some()
    }

    /// Number of (start, stop) calls seen so far.
    pub fn start_stop_counts(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        (state.starts, state.stops)
    }

    pub fn read(&self, lba: u32, count: u16, out: &mut [u8]) -> Option<(usize, bool)> {
        let device = self.device()?;
        let _serial = self.serial.lock().unwrap_or_else(|p| p.into_inner());
        Some(device.read(lba, count, out))
    }

    pub fn write(&self, lba: u32, count: u16, data: &[u8]) -> Option<bool> {
        let device = self.device()?;
        let _serial = self.serial.lock().unwrap_or_else(|p| p.into_inner());
        Some(device.write(lba, count, data))
    }

    pub fn num_blocks(&self) -> Option<u32> {
        let device = self.device()?;
        let _serial = self.serial.lock().unwrap_or_else(|p| p.into_inner());
        Some(device.num_blocks())
    }

    pub fn eject(&self) -> bool {
        match self.device() {
            Some(device) => {
                device.eject();
                true
            }
            None => false,
        }
    }
}
