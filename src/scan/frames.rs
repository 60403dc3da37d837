use image::GrayImage;
use log::warn;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use super::session::ScanError;

/// A pull-based stream of camera frames. `None` means the device stopped
/// producing frames; that ends the session rather than erroring it.
pub trait FrameSource {
    fn next_frame(&mut self) -> Option<GrayImage>;
}

/// Frame source backed by a spool directory: the capture bridge drops image
/// files in, the session reads them back in sorted name order. Also what the
/// tests feed with generated code images.
pub struct DirFrameSource {
    frames: VecDeque<PathBuf>,
}

impl DirFrameSource {
    pub fn open(dir: &Path) -> Result<Self, ScanError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| ScanError::DeviceUnavailable(format!("{}: {}", dir.display(), e)))?;
        let mut frames: Vec<PathBuf> = entries
            .filter_map(|ent| ent.ok())
            .map(|ent| ent.path())
            .filter(|p| p.is_file())
            .collect();
        frames.sort();
        Ok(Self {
            frames: frames.into(),
        })
    }
}

impl FrameSource for DirFrameSource {
    fn next_frame(&mut self) -> Option<GrayImage> {
        while let Some(path) = self.frames.pop_front() {
            match image::open(&path) {
                Ok(img) => return Some(img.to_luma8()),
                Err(e) => {
                    warn!("skipping unreadable frame {}: {}", path.display(), e);
                }
            }
        }
        None
    }
}
