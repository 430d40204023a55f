// src/fuse_transport.rs
use crate::block_device::{BlockDevice, DiskError, BLOCK_SIZE};
use crate::transport::Transport;
use fuser::{
    BackgroundSession, FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyWrite, Request, TimeOrNow,
};
use libc::{EINVAL, EIO, ENOENT, ENOSPC, EPERM};
use log::{debug, info, warn};
use std::ffi::OsStr;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;
const IMAGE_INO: u64 = 2;
// Largest run of blocks one command can carry (count is 16 bits)
const MAX_BLOCKS_PER_COMMAND: u64 = u16::MAX as u64;

/// Publishes the bound device as a single regular file in a FUSE mount.
/// Kernel reads and writes on that file become block commands; unmounting
/// from the host side counts as an eject.
pub struct FuseTransport {
    mount_point: PathBuf,
    session: Option<BackgroundSession>,
    // Busy mount point already reported to the operator
    busy_reported: AtomicBool,
}

impl FuseTransport {
    pub fn new(mount_point: PathBuf) -> Self {
        Self { mount_point, session: None, busy_reported: AtomicBool::new(false) }
    }

    fn mount_point_busy(&self) -> bool {
        fs::read_dir(&self.mount_point)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }
}

impl Transport for FuseTransport {
    fn is_locked(&self) -> bool {
        if self.session.is_some() {
            return true;
        }
        if !self.mount_point_busy() {
            self.busy_reported.store(false, Ordering::Relaxed);
            return false;
        }
        if !self.busy_reported.swap(true, Ordering::Relaxed) {
            warn!(
                "Mount point {:?} is not empty, waiting for it to be cleared (Ctrl+C to cancel)",
                self.mount_point
            );
        }
        true
    }

    fn start(&mut self, device_name: &str, device: Arc<dyn BlockDevice>) -> Result<(), DiskError> {
        if self.session.is_some() {
            return Err(DiskError::Transport("A device is already mounted".into()));
        }
        if !self.mount_point.exists() {
            info!("Creating mount point at {:?}", self.mount_point);
            fs::create_dir_all(&self.mount_point)?;
        }

        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let fs = DiskFs::new(device, format!("{}.img", device_name), uid, gid);

        let options = vec![
            MountOption::RW,
            MountOption::FSName(format!("massdisk:{}", device_name)),
            MountOption::DefaultPermissions,
        ];

        let session = fuser::spawn_mount2(fs, &self.mount_point, &options)
            .map_err(|e| DiskError::Transport(format!("Mount at {:?} failed: {}", self.mount_point, e)))?;

        info!("Mounted at {:?}", self.mount_point);
        self.session = Some(session);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            // Dropping the session unmounts; the FUSE thread winds down on its own.
            drop(session);
            info!("Unmounted {:?}", self.mount_point);
        }
    }
}

struct DiskFs {
    device: Arc<dyn BlockDevice>,
    file_name: String,
    uid: u32,
    gid: u32,
    mounted_at: SystemTime,
}

impl DiskFs {
    fn new(device: Arc<dyn BlockDevice>, file_name: String, uid: u32, gid: u32) -> Self {
        Self { device, file_name, uid, gid, mounted_at: SystemTime::now() }
    }

    fn capacity(&self) -> u64 {
        self.device.num_blocks() as u64 * BLOCK_SIZE as u64
    }

    fn attr(&self, ino: u64) -> FileAttr {
        let (kind, perm, nlink, size) = if ino == ROOT_INO {
            (FileType::Directory, 0o755, 2, 0)
        } else {
            (FileType::RegularFile, 0o644, 1, self.capacity())
        };
        FileAttr {
            ino, size, blocks: size / 512,
            atime: self.mounted_at, mtime: self.mounted_at, ctime: self.mounted_at, crtime: self.mounted_at,
            kind, perm, nlink,
            uid: self.uid, gid: self.gid,
            rdev: 0, flags: 0, blksize: BLOCK_SIZE as u32,
        }
    }

    fn read_blocks(&self, first: u64, count: u64) -> Result<Vec<u8>, i32> {
        let mut data = vec![0u8; (count as usize) * BLOCK_SIZE];
        let mut done = 0u64;
        while done < count {
            let chunk = std::cmp::min(count - done, MAX_BLOCKS_PER_COMMAND);
            let lba = u32::try_from(first + done).map_err(|_| EINVAL)?;
            let start = done as usize * BLOCK_SIZE;
            let end = start + chunk as usize * BLOCK_SIZE;

            let (_, ok) = self.device.read(lba, chunk as u16, &mut data[start..end]);
            if !ok {
                return Err(EIO);
            }
            done += chunk;
        }
        Ok(data)
    }

    fn write_blocks(&self, first: u64, data: &[u8]) -> Result<(), i32> {
        for (i, chunk) in data.chunks(MAX_BLOCKS_PER_COMMAND as usize * BLOCK_SIZE).enumerate() {
            let lba = u32::try_from(first + i as u64 * MAX_BLOCKS_PER_COMMAND).map_err(|_| EINVAL)?;
            let count = (chunk.len() / BLOCK_SIZE) as u16;
            if !self.device.write(lba, count, chunk) {
                return Err(EIO);
            }
        }
        Ok(())
    }

    /// Byte-granular read over the block device. Stops at the end of the disk.
    fn read_bytes(&self, offset: u64, size: usize) -> Result<Vec<u8>, i32> {
        let capacity = self.capacity();
        if offset >= capacity || size == 0 {
            return Ok(Vec::new());
        }
        let end = std::cmp::min(offset + size as u64, capacity);
        let first = offset / BLOCK_SIZE as u64;
        let last = (end + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64;

        let blocks = self.read_blocks(first, last - first)?;
        let start = (offset - first * BLOCK_SIZE as u64) as usize;
        Ok(blocks[start..start + (end - offset) as usize].to_vec())
    }

    /// Byte-granular write. Partial blocks go through read-modify-write.
    /// The disk never grows: anything past the end is refused.
    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<usize, i32> {
        let capacity = self.capacity();
        if data.is_empty() {
            return Ok(0);
        }
        if offset >= capacity {
            return Err(ENOSPC);
        }
        let end = std::cmp::min(offset + data.len() as u64, capacity);
        let len = (end - offset) as usize;
        let block = BLOCK_SIZE as u64;

        if offset % block == 0 && len as u64 % block == 0 {
            self.write_blocks(offset / block, &data[..len])?;
            return Ok(len);
        }

        let first = offset / block;
        let last = (end + block - 1) / block;
        let mut blocks = self.read_blocks(first, last - first)?;
        let start = (offset - first * block) as usize;
        blocks[start..start + len].copy_from_slice(&data[..len]);
        self.write_blocks(first, &blocks)?;
        Ok(len)
    }
}

impl Filesystem for DiskFs {
    fn destroy(&mut self) {
        debug!("FUSE session ending, ejecting");
        self.device.eject();
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent == ROOT_INO && name.to_str() == Some(self.file_name.as_str()) {
            reply.entry(&TTL, &self.attr(IMAGE_INO), 0);
        } else {
            reply.error(ENOENT);
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        match ino {
            ROOT_INO | IMAGE_INO => reply.attr(&TTL, &self.attr(ino)),
            _ => reply.error(ENOENT),
        }
    }

    fn setattr(&mut self, _req: &Request, ino: u64, _mode: Option<u32>, _uid: Option<u32>, _gid: Option<u32>, size: Option<u64>, _a: Option<TimeOrNow>, _m: Option<TimeOrNow>, _c: Option<SystemTime>, _fh: Option<u64>, _cr: Option<SystemTime>, _ch: Option<SystemTime>, _bk: Option<SystemTime>, _fl: Option<u32>, reply: ReplyAttr) {
        if ino != IMAGE_INO && ino != ROOT_INO {
            reply.error(ENOENT);
            return;
        }
        // Fixed-size medium: truncation is accepted only as a no-op
        if let Some(s) = size {
            if s != self.capacity() {
                reply.error(EPERM);
                return;
            }
        }
        reply.attr(&TTL, &self.attr(ino));
    }

    fn read(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, size: u32, _fl: i32, _l: Option<u64>, reply: ReplyData) {
        if ino != IMAGE_INO {
            reply.error(ENOENT);
            return;
        }
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.read_bytes(offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(code) => {
                warn!("FUSE read at {} failed", offset);
                reply.error(code);
            }
        }
    }

    fn write(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, data: &[u8], _w: u32, _f: i32, _l: Option<u64>, reply: ReplyWrite) {
        if ino != IMAGE_INO {
            reply.error(ENOENT);
            return;
        }
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.write_bytes(offset as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(code) => {
                warn!("FUSE write at {} failed", offset);
                reply.error(code);
            }
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        if ino != ROOT_INO {
            reply.error(ENOENT);
            return;
        }
        let entries = [
            (ROOT_INO, FileType::Directory, "."),
            (ROOT_INO, FileType::Directory, ".."),
            (IMAGE_INO, FileType::RegularFile, self.file_name.as_str()),
        ];
        for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(*entry_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::IoCounters;
    use crate::file_disk::FileDisk;
    use std::io::Cursor;

    fn disk_fs(blocks: usize) -> (DiskFs, Arc<IoCounters>) {
        let counters = Arc::new(IoCounters::new());
        let (tx, _rx) = crossbeam_channel::unbounded();
        let data: Vec<u8> = (0..blocks * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        let device = Arc::new(FileDisk::new(Cursor::new(data), counters.clone(), tx));
        (DiskFs::new(device, "test.img".into(), 0, 0), counters)
    }

    #[test]
    fn test_unaligned_read() {
        let (fs, counters) = disk_fs(4);
        let data = fs.read_bytes(500, 30).unwrap();
        let expected: Vec<u8> = (500..530).map(|i| (i % 251) as u8).collect();
        assert_eq!(data, expected);
        // Covers blocks 0 and 1
        assert_eq!(counters.bytes_read(), 2 * BLOCK_SIZE as u64);
    }

    #[test]
    fn test_read_stops_at_end() {
        let (fs, _) = disk_fs(2);
        assert_eq!(fs.read_bytes(1000, 100).unwrap().len(), 24);
        assert!(fs.read_bytes(1024, 10).unwrap().is_empty());
    }

    #[test]
    fn test_aligned_write_skips_read() {
        let (fs, counters) = disk_fs(4);
        assert_eq!(fs.write_bytes(512, &[0xAA; 1024]).unwrap(), 1024);
        assert_eq!(counters.bytes_read(), 0);
        assert_eq!(counters.bytes_written(), 1024);
        assert!(fs.read_bytes(512, 1024).unwrap().iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_unaligned_write_preserves_neighbours() {
        let (fs, _) = disk_fs(4);
        assert_eq!(fs.write_bytes(510, &[0xFF; 4]).unwrap(), 4);
        let data = fs.read_bytes(508, 8).unwrap();
        assert_eq!(data, vec![(508 % 251) as u8, (509 % 251) as u8, 0xFF, 0xFF, 0xFF, 0xFF, (514 % 251) as u8, (515 % 251) as u8]);
    }

    #[test]
    fn test_write_never_grows_disk() {
        let (fs, _) = disk_fs(2);
        assert_eq!(fs.write_bytes(1020, &[1u8; 10]).unwrap(), 4);
        assert_eq!(fs.write_bytes(1024, &[1u8; 10]), Err(ENOSPC));
        assert_eq!(fs.capacity(), 1024);
    }

    #[test]
    fn test_non_empty_mount_point_locks() {
        let dir = tempfile::tempdir().unwrap();
        let mount_point = dir.path().join("mnt");
        let transport = FuseTransport::new(mount_point.clone());
        assert!(!transport.is_locked());

        fs::create_dir(&mount_point).unwrap();
        assert!(!transport.is_locked());

        fs::write(mount_point.join("stray"), b"x").unwrap();
        assert!(transport.is_locked());
        assert!(transport.is_locked());
        assert!(transport.busy_reported.load(Ordering::Relaxed));

        fs::remove_file(mount_point.join("stray")).unwrap();
        assert!(!transport.is_locked());
        assert!(!transport.busy_reported.load(Ordering::Relaxed));
    }

    #[test]
    fn test_attrs() {
        let (fs, _) = disk_fs(8);
        let image = fs.attr(IMAGE_INO);
        assert_eq!(image.size, 8 * BLOCK_SIZE as u64);
        assert_eq!(image.kind, FileType::RegularFile);
        assert_eq!(fs.attr(ROOT_INO).kind, FileType::Directory);
    }
}
