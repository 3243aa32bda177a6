use std::{
    fs::{self, File, OpenOptions},
    path::{Component, Path},
};

use crate::{conf::AllocationStrategy, error::disk::*, storage_info::FileInfo};

pub struct TorrentFile {
    pub info: FileInfo,
    pub handle: File,
}

impl TorrentFile {
    /// Opens (creating if needed) the file at `download_dir` joined with
    /// `info.path`, rejecting any path segment that is empty, absolute, or
    /// a parent-directory reference, and allocates it per `allocation`.
    pub fn new(download_dir: &Path, info: FileInfo, allocation: AllocationStrategy) -> Result<Self, NewTorrentError> {
        for component in info.path.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(NewTorrentError::InvalidPath),
            }
        }
        if info.path.as_os_str().is_empty() {
            return Err(NewTorrentError::InvalidPath);
        }

        log::trace!("opening file {:?} in dir {:?}", info, download_dir);

        let path = download_dir.join(&info.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let handle = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .map_err(|e| {
                log::warn!("failed to open file {:?}", path);
                NewTorrentError::Io(e)
            })?;

        if allocation == AllocationStrategy::Full {
            handle.set_len(info.len)?;
        }

        debug_assert!(path.exists());
        Ok(Self { info, handle })
    }
}
