// src/image_factory.rs
use crate::block_device::{DiskError, HEADER_ZERO_LEN};
use log::{debug, info};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

/// Size choices offered when creating a new image.
pub const IMAGE_SIZES: &[(&str, u64)] = &[
    ("1.44M", 1440 * 1024),
    ("2M", 2 * 1024 * 1024),
    ("4M", 4 * 1024 * 1024),
    ("8M", 8 * 1024 * 1024),
    ("16M", 16 * 1024 * 1024),
    ("32M", 32 * 1024 * 1024),
    ("64M", 64 * 1024 * 1024),
    ("128M", 128 * 1024 * 1024),
    ("256M", 256 * 1024 * 1024),
    ("512M", 512 * 1024 * 1024),
    ("700M", 700 * 1024 * 1024),
    ("1G", 1024 * 1024 * 1024),
    ("2G", 2 * 1024 * 1024 * 1024),
];

pub const DEFAULT_IMAGE_SIZE: &str = "4M";

/// Parse an image size. Accepts the preset names above, plain byte counts,
/// and integers with a K/M/G suffix.
pub fn parse_size(input: &str) -> Result<u64, DiskError> {
    let s = input.trim();
    if let Some(&(_, bytes)) = IMAGE_SIZES.iter().find(|(name, _)| name.eq_ignore_ascii_case(s)) {
        return Ok(bytes);
    }

    let (digits, multiplier) = match s.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&s[..s.len() - 1], 1024u64),
        Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    let size = digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| DiskError::Validation(format!("Unrecognized image size '{}'", input)))?;

    if size == 0 {
        return Err(DiskError::Validation("Image size must be greater than zero".into()));
    }
    Ok(size)
}

/// Create (or truncate) the image at `path`, preallocate it to `size_bytes`
/// and zero its first `HEADER_ZERO_LEN` bytes so no stale partition table
/// survives from a previous file at the same path.
///
/// A partially created file is left behind on failure.
pub fn create_image(path: &Path, size_bytes: u64) -> Result<(), DiskError> {
    if path.as_os_str().is_empty() {
        return Err(DiskError::Validation("Image path is empty".into()));
    }
    if size_bytes == 0 {
        return Err(DiskError::Validation("Image size must be greater than zero".into()));
    }

    info!("Creating image {:?}, len:{}", path, size_bytes);

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    file.set_len(size_bytes)?;
    file.seek(SeekFrom::Start(0))?;

    let zeros = vec![0u8; HEADER_ZERO_LEN];
    file.write_all(&zeros)?;
    file.sync_all()?;

    debug!("Image {:?} ready", path);
    Ok(())
}
