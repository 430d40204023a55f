// src/file_disk.rs
use crate::block_device::{block_offset, BlockDevice, DiskError, IoCounters, BLOCK_SIZE};
use crate::session::SessionEvent;
use crossbeam_channel::Sender;
use log::{debug, trace, warn};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// Block device backed by one open image.
///
/// The backing handle sits behind the session guard. Every callback holds the
/// guard for its whole duration and `unbind` takes it before dropping the
/// handle, so teardown waits for an in-flight command and no command ever
/// sees a released handle.
pub struct FileDisk<F = File> {
    backing: Mutex<Option<F>>,
    counters: Arc<IoCounters>,
    events: Sender<SessionEvent>,
}

impl<F: Read + Write + Seek + Send> FileDisk<F> {
    pub fn new(backing: F, counters: Arc<IoCounters>, events: Sender<SessionEvent>) -> Self {
        Self { backing: Mutex::new(Some(backing)), counters, events }
    }

    pub fn counters(&self) -> &Arc<IoCounters> {
        &self.counters
    }

    pub fn is_bound(&self) -> bool {
        self.guard().is_some()
    }

    /// Detach and close the backing handle. Blocks until any in-flight
    /// command finishes. Returns false if nothing was bound.
    pub fn unbind(&self) -> bool {
        let mut guard = self.guard();
        match guard.take() {
            Some(mut backing) => {
                if let Err(e) = backing.flush() {
                    warn!("Flush on unbind failed: {}", e);
                }
                drop(backing);
                debug!("Backing image released");
                true
            }
            None => false,
        }
    }

    fn guard(&self) -> MutexGuard<'_, Option<F>> {
        self.backing.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// Fill as much of `buf` as the backing can provide. Stops at EOF or on the
// first hard error, reporting how far it got either way.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> (usize, Option<io::Error>) {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (filled, Some(e)),
        }
    }
    (filled, None)
}

impl<F: Read + Write + Seek + Send> BlockDevice for FileDisk<F> {
    fn read(&self, lba: u32, count: u16, out: &mut [u8]) -> (usize, bool) {
        trace!("read lba={:08X} count={:04X} out_cap={:08X}", lba, count, out.len());

        let mut guard = self.guard();
        let Some(file) = guard.as_mut() else {
            warn!("read: {}", DiskError::Unbound);
            return (0, false);
        };

        if let Err(e) = file.seek(SeekFrom::Start(block_offset(lba))) {
            warn!("read: seek failed: {}", e);
            return (0, false);
        }

        let requested = count as usize * BLOCK_SIZE;
        let clamp = requested.min(out.len());
        let (obtained, err) = read_up_to(file, &mut out[..clamp]);
        self.counters.add_read(obtained as u64);
        trace!("{}/{}", obtained, requested);

        if let Some(e) = err {
            warn!("read: {}", DiskError::Io(e));
        }
        if obtained != clamp {
            warn!("read: {}", DiskError::ShortTransfer { obtained, expected: clamp });
            return (obtained, false);
        }
        (obtained, true)
    }

    fn write(&self, lba: u32, count: u16, data: &[u8]) -> bool {
        trace!("write lba={:08X} count={:04X} len={:08X}", lba, count, data.len());

        if data.len() != count as usize * BLOCK_SIZE {
            warn!("bad write params count={} len={}", count, data.len());
            return false;
        }

        let mut guard = self.guard();
        let Some(file) = guard.as_mut() else {
            warn!("write: {}", DiskError::Unbound);
            return false;
        };

        if let Err(e) = file.seek(SeekFrom::Start(block_offset(lba))) {
            warn!("write: seek failed: {}", e);
            return false;
        }

        // Counted as attempted: bytes crossed the transport even if the write fails.
        self.counters.add_written(data.len() as u64);

        match file.write_all(data) {
            Ok(()) => true,
            Err(e) => {
                warn!("write: {}", DiskError::Io(e));
                false
            }
        }
    }

    fn num_blocks(&self) -> u32 {
        let mut guard = self.guard();
        let Some(file) = guard.as_mut() else {
            return 0;
        };
        match file.seek(SeekFrom::End(0)) {
            Ok(len) => (len / BLOCK_SIZE as u64).min(u32::MAX as u64) as u32,
            Err(e) => {
                warn!("num_blocks: {}", e);
                0
            }
        }
    }

    fn eject(&self) {
        debug!("EJECT");
        // Held across the send so an eject can't slip in behind a completed unbind.
        let guard = self.guard();
        if guard.is_none() {
            debug!("Eject ignored, nothing bound");
            return;
        }
        if self.events.send(SessionEvent::Eject).is_err() {
            warn!("Eject dropped, session controller is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::CounterSnapshot;
    use crossbeam_channel::{unbounded, Receiver};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::thread;
    use std::time::Duration;

    fn cursor_disk(len: usize) -> (FileDisk<Cursor<Vec<u8>>>, Receiver<SessionEvent>) {
        let (tx, rx) = unbounded();
        let data: Vec<u8> = (0..len).map(|i| (i / BLOCK_SIZE) as u8).collect();
        (FileDisk::new(Cursor::new(data), Arc::new(IoCounters::new()), tx), rx)
    }

    #[test]
    fn test_read_full_request() {
        let (disk, _rx) = cursor_disk(8 * BLOCK_SIZE);
        let mut out = vec![0u8; 3 * BLOCK_SIZE];
        let (n, ok) = disk.read(2, 3, &mut out);
        assert!(ok);
        assert_eq!(n, 3 * BLOCK_SIZE);
        assert!(out[..BLOCK_SIZE].iter().all(|&b| b == 2));
        assert!(out[2 * BLOCK_SIZE..].iter().all(|&b| b == 4));
        assert_eq!(disk.counters().bytes_read(), 3 * BLOCK_SIZE as u64);
    }

    #[test]
    fn test_read_clamps_to_buffer() {
        let (disk, _rx) = cursor_disk(8 * BLOCK_SIZE);
        let mut out = vec![0u8; 700];
        let (n, ok) = disk.read(0, 4, &mut out);
        assert!(ok);
        assert_eq!(n, 700);
        assert_eq!(disk.counters().bytes_read(), 700);
    }

    #[test]
    fn test_short_read_fails_but_counts() {
        let (disk, _rx) = cursor_disk(4 * BLOCK_SIZE);
        let mut out = vec![0u8; 2 * BLOCK_SIZE];
        let (n, ok) = disk.read(3, 2, &mut out);
        assert!(!ok);
        assert_eq!(n, BLOCK_SIZE);
        assert_eq!(disk.counters().bytes_read(), BLOCK_SIZE as u64);
    }

    #[test]
    fn test_write_length_mismatch_rejected() {
        let (disk, _rx) = cursor_disk(4 * BLOCK_SIZE);
        assert!(!disk.write(0, 1, &[0xFF; 100]));
        assert!(!disk.write(0, 2, &[0xFF; BLOCK_SIZE]));
        assert_eq!(disk.counters().bytes_written(), 0);

        let mut out = vec![0u8; BLOCK_SIZE];
        assert_eq!(disk.read(0, 1, &mut out), (BLOCK_SIZE, true));
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_past_end_extends_blocks() {
        let (disk, _rx) = cursor_disk(4 * BLOCK_SIZE);
        assert_eq!(disk.num_blocks(), 4);
        assert!(disk.write(9, 1, &[0x55; BLOCK_SIZE]));
        assert_eq!(disk.num_blocks(), 10);
        assert_eq!(disk.counters().bytes_written(), BLOCK_SIZE as u64);
    }

    #[test]
    fn test_num_blocks_rounds_down() {
        let (disk, _rx) = cursor_disk(4 * BLOCK_SIZE + 100);
        assert_eq!(disk.num_blocks(), 4);
    }

    #[test]
    fn test_callbacks_fail_closed_after_unbind() {
        let (disk, rx) = cursor_disk(4 * BLOCK_SIZE);
        assert!(disk.unbind());
        assert!(!disk.unbind());

        let mut out = vec![0u8; BLOCK_SIZE];
        assert_eq!(disk.read(0, 1, &mut out), (0, false));
        assert!(!disk.write(0, 1, &[0u8; BLOCK_SIZE]));
        assert_eq!(disk.num_blocks(), 0);
        disk.eject();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_eject_notifies_controller() {
        let (disk, rx) = cursor_disk(4 * BLOCK_SIZE);
        disk.eject();
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Eject)));
        assert!(disk.is_bound());
    }

    #[test]
    fn test_file_backing_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(16 * BLOCK_SIZE as u64).unwrap();

        let (tx, _rx) = unbounded();
        let disk = FileDisk::new(file, Arc::new(IoCounters::new()), tx);
        assert!(disk.write(5, 2, &[0xAB; 2 * BLOCK_SIZE]));

        let mut out = vec![0u8; 2 * BLOCK_SIZE];
        assert_eq!(disk.read(5, 2, &mut out), (2 * BLOCK_SIZE, true));
        assert!(out.iter().all(|&b| b == 0xAB));
        assert!(disk.unbind());

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), 16 * BLOCK_SIZE);
        assert!(raw[5 * BLOCK_SIZE..7 * BLOCK_SIZE].iter().all(|&b| b == 0xAB));
    }

    // Backing whose seek or write can be made to fail.
    struct FailingBacking {
        inner: Cursor<Vec<u8>>,
        fail_seek: bool,
        fail_write: bool,
    }

    impl Read for FailingBacking {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Write for FailingBacking {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_write {
                return Err(io::Error::new(io::ErrorKind::Other, "medium error"));
            }
            self.inner.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FailingBacking {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            if self.fail_seek {
                return Err(io::Error::new(io::ErrorKind::Other, "seek error"));
            }
            self.inner.seek(pos)
        }
    }

    fn failing_disk(fail_seek: bool, fail_write: bool) -> FileDisk<FailingBacking> {
        let (tx, _rx) = unbounded();
        let backing = FailingBacking {
            inner: Cursor::new(vec![0u8; 4 * BLOCK_SIZE]),
            fail_seek,
            fail_write,
        };
        FileDisk::new(backing, Arc::new(IoCounters::new()), tx)
    }

    #[test]
    fn test_failed_write_still_counts_attempted_bytes() {
        let disk = failing_disk(false, true);
        assert!(!disk.write(0, 1, &[1u8; BLOCK_SIZE]));
        assert_eq!(disk.counters().bytes_written(), BLOCK_SIZE as u64);
        assert_eq!(disk.counters().bytes_read(), 0);
    }

    #[test]
    fn test_failed_seek_leaves_counters_untouched() {
        let disk = failing_disk(true, false);
        let mut out = vec![0u8; BLOCK_SIZE];
        assert_eq!(disk.read(0, 1, &mut out), (0, false));
        assert!(!disk.write(0, 1, &[1u8; BLOCK_SIZE]));
        assert_eq!(disk.counters().snapshot(), CounterSnapshot::default());
        assert_eq!(disk.num_blocks(), 0);
    }

    // Backing that parks its first read until released, and records the read
    // counter at the moment it is dropped.
    struct GatedBacking {
        inner: Cursor<Vec<u8>>,
        gate: Option<(Sender<()>, Receiver<()>)>,
        counters: Arc<IoCounters>,
        dropped: Arc<AtomicBool>,
        read_at_drop: Arc<AtomicU64>,
    }

    impl Read for GatedBacking {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some((entered, release)) = self.gate.take() {
                let _ = entered.send(());
                let _ = release.recv();
            }
            self.inner.read(buf)
        }
    }

    impl Write for GatedBacking {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for GatedBacking {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    impl Drop for GatedBacking {
        fn drop(&mut self) {
            self.read_at_drop.store(self.counters.bytes_read(), Ordering::SeqCst);
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_unbind_waits_for_in_flight_read() {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let counters = Arc::new(IoCounters::new());
        let dropped = Arc::new(AtomicBool::new(false));
        let read_at_drop = Arc::new(AtomicU64::new(0));

        let backing = GatedBacking {
            inner: Cursor::new(vec![0x11; 4 * BLOCK_SIZE]),
            gate: Some((entered_tx, release_rx)),
            counters: counters.clone(),
            dropped: dropped.clone(),
            read_at_drop: read_at_drop.clone(),
        };
        let (tx, _rx) = unbounded();
        let disk = Arc::new(FileDisk::new(backing, counters.clone(), tx));

        let reader = {
            let disk = disk.clone();
            thread::spawn(move || {
                let mut out = vec![0u8; BLOCK_SIZE];
                let result = disk.read(1, 1, &mut out);
                (result, out)
            })
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (done_tx, done_rx) = unbounded();
        let unbinder = {
            let disk = disk.clone();
            thread::spawn(move || {
                let was_bound = disk.unbind();
                done_tx.send(()).unwrap();
                was_bound
            })
        };

        assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(!dropped.load(Ordering::SeqCst));

        release_tx.send(()).unwrap();
        let ((n, ok), out) = reader.join().unwrap();
        assert_eq!((n, ok), (BLOCK_SIZE, true));
        assert!(out.iter().all(|&b| b == 0x11));

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(unbinder.join().unwrap());
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(read_at_drop.load(Ordering::SeqCst), BLOCK_SIZE as u64);
    }
}
