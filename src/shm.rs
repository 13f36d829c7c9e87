//! File-backed shared memory regions
//!
//! A [`SharedRegion`] is a temporary file mapped read-write with a shared
//! mapping. Any worker (thread or process) that knows its [`RegionHandle`]
//! can map the same bytes and write its own rows in place, so numeric
//! results never travel through a channel.
//!
//! The creating side owns the backing file and removes it on drop. Regions
//! opened from a handle only unmap.

use crate::error::ResourceError;
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Preferred directory for region backing files
const SHM_DIR: &str = "/dev/shm";

/// Everything another worker needs to map a region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionHandle {
    pub path: PathBuf,
    pub len: usize,
}

/// A shared, memory-mapped byte region
#[derive(Debug)]
pub struct SharedRegion {
    path: PathBuf,
    len: usize,
    /// `None` for zero-length regions, which cannot be mapped
    map: Option<MmapMut>,
    /// Backing file, held only by the creator
    owner: Option<NamedTempFile>,
}

/// Directory used when none is configured
///
/// `/dev/shm` keeps regions in RAM on Linux; elsewhere the system temp
/// directory is used.
pub fn default_dir() -> PathBuf {
    let shm = Path::new(SHM_DIR);
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

impl SharedRegion {
    /// Create a zero-filled region of `len` bytes in `dir`
    pub fn create(dir: &Path, len: usize) -> Result<Self, ResourceError> {
        let file = tempfile::Builder::new()
            .prefix("trajpar-")
            .suffix(".buf")
            .tempfile_in(dir)
            .map_err(|e| ResourceError::Region {
                path: dir.to_path_buf(),
                reason: format!("cannot create backing file: {e}"),
            })?;
        let path = file.path().to_path_buf();

        file.as_file()
            .set_len(len as u64)
            .map_err(|e| region_error(&path, "cannot size backing file", e))?;

        let map = if len == 0 {
            None
        } else {
            // SAFETY: the file was just created with a private name and sized
            // above; it is only ever resized by dropping the owner.
            let map = unsafe { MmapMut::map_mut(file.as_file()) }
                .map_err(|e| region_error(&path, "cannot map", e))?;
            Some(map)
        };

        debug!(path = %path.display(), bytes = len, "Created shared region");

        Ok(Self {
            path,
            len,
            map,
            owner: Some(file),
        })
    }

    /// Map an existing region from its handle
    pub fn open(handle: &RegionHandle) -> Result<Self, ResourceError> {
        let path = handle.path.clone();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| region_error(&path, "cannot open", e))?;

        let actual = file
            .metadata()
            .map_err(|e| region_error(&path, "cannot stat", e))?
            .len() as usize;
        if actual < handle.len {
            return Err(ResourceError::RegionSize {
                path,
                expected: handle.len,
                actual,
            });
        }

        let map = if handle.len == 0 {
            None
        } else {
            // SAFETY: the creator keeps the file at its full length until
            // every worker holding a handle has finished.
            let map = unsafe { memmap2::MmapOptions::new().len(handle.len).map_mut(&file) }
                .map_err(|e| region_error(&path, "cannot map", e))?;
            Some(map)
        };

        Ok(Self {
            path,
            len: handle.len,
            map,
            owner: None,
        })
    }

    /// Handle for rebinding from another worker
    pub fn handle(&self) -> RegionHandle {
        RegionHandle {
            path: self.path.clone(),
            len: self.len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this side owns the backing file
    pub fn is_owner(&self) -> bool {
        self.owner.is_some()
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.map {
            Some(map) => &map[..],
            None => &[],
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.map {
            Some(map) => &mut map[..],
            None => &mut [],
        }
    }

    /// Flush pending writes of this mapping
    pub fn flush(&self) -> Result<(), ResourceError> {
        match &self.map {
            Some(map) => map
                .flush()
                .map_err(|e| region_error(&self.path, "cannot flush", e)),
            None => Ok(()),
        }
    }
}

fn region_error(path: &Path, what: &str, err: std::io::Error) -> ResourceError {
    ResourceError::Region {
        path: path.to_path_buf(),
        reason: format!("{what}: {err}"),
    }
}
