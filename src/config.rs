// src/config.rs
use crate::block_device::DiskError;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_FOLDER: &str = "mass_storage";
pub const DEFAULT_EXTENSION: &str = ".img";
pub const DEFAULT_TICK_MS: u64 = 500;
/// Longest accepted image name, extension excluded.
pub const MAX_NAME_LEN: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Folder new images are created in and bare names are looked up in.
    pub folder: PathBuf,
    /// Image file extension, including the leading dot.
    pub extension: String,
    /// Status refresh cadence while an image is bound.
    pub tick: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            folder: PathBuf::from(DEFAULT_FOLDER),
            extension: DEFAULT_EXTENSION.to_string(),
            tick: Duration::from_millis(DEFAULT_TICK_MS),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            folder: image_folder(),
            extension: image_extension(),
            tick: Duration::from_millis(tick_ms()),
        }
    }

    pub fn with_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.folder = folder.into();
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// `<folder>/<name><extension>`
    pub fn image_path(&self, name: &str) -> PathBuf {
        self.folder.join(format!("{}{}", name, self.extension))
    }

    /// Check a new image name and return the path it will be created at.
    /// The name must be a plain file stem that doesn't collide with an
    /// existing image.
    pub fn validate_name(&self, name: &str) -> Result<PathBuf, DiskError> {
        if name.trim().is_empty() {
            return Err(DiskError::Validation("Image name is empty".into()));
        }
        if name == "." || name == ".." || name.contains(&['/', '\\', '\0'][..]) {
            return Err(DiskError::Validation(format!("'{}' is not a valid file name", name)));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(DiskError::Validation(format!(
                "Image name is longer than {} characters",
                MAX_NAME_LEN
            )));
        }

        let path = self.image_path(name);
        if path.exists() {
            return Err(DiskError::Validation(format!("{:?} already exists", path)));
        }
        Ok(path)
    }

    /// Map an operator-supplied image reference to a path. Anything that looks
    /// like a path is taken as-is; a bare name is looked up in the image folder.
    pub fn resolve_image(&self, image: &str) -> PathBuf {
        let as_given = Path::new(image);
        if as_given.components().count() > 1 || as_given.exists() {
            return as_given.to_path_buf();
        }
        if image.ends_with(&self.extension) {
            self.folder.join(image)
        } else {
            self.image_path(image)
        }
    }
}

fn image_folder() -> PathBuf {
    std::env::var("MASSDISK_FOLDER")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FOLDER))
}

fn image_extension() -> String {
    std::env::var("MASSDISK_EXTENSION")
        .ok()
        .filter(|v| !v.is_empty())
        .map(|v| if v.starts_with('.') { v } else { format!(".{}", v) })
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

fn tick_ms() -> u64 {
    std::env::var("MASSDISK_TICK_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(DEFAULT_TICK_MS)
}
