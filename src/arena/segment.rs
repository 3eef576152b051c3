//! Named, memory-mapped arena segment

use crate::error::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Prefix of every segment file name
pub const SEGMENT_PREFIX: &str = "vidarena";

/// Plain description of a segment, enough for another participant to attach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// Unique segment name
    pub name: String,
    /// Backing file
    pub path: PathBuf,
    /// Capacity in rows
    pub rows: usize,
    /// Bytes per row
    pub row_bytes: usize,
}

impl SegmentDescriptor {
    pub fn len_bytes(&self) -> usize {
        self.rows * self.row_bytes
    }
}

/// Where segments go when no directory is configured
pub fn default_segment_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// One participant's mapping of the arena bytes
///
/// Each handle maps the backing file independently; the mappings are shared, so
/// bytes written through one are visible through all others once the writer's
/// critical section has been released.
pub struct ArenaSegment {
    mmap: MmapMut,
    descriptor: SegmentDescriptor,
}

impl ArenaSegment {
    /// Create and map a new zeroed segment
    pub fn create(dir: Option<&Path>, rows: usize, row_bytes: usize) -> Result<Self> {
        let dir = dir.map(Path::to_path_buf).unwrap_or_else(default_segment_dir);
        std::fs::create_dir_all(&dir).map_err(|e| Error::ArenaCreate {
            path: dir.clone(),
            cause: e.to_string(),
        })?;

        let name = format!("{SEGMENT_PREFIX}-{}", uuid::Uuid::new_v4().simple());
        let path = dir.join(&name);
        let descriptor = SegmentDescriptor {
            name,
            path,
            rows,
            row_bytes,
        };
        let len = descriptor.len_bytes();
        if len == 0 {
            return Err(Error::ArenaCreate {
                path: descriptor.path,
                cause: "segment must hold at least one byte".into(),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&descriptor.path)
            .map_err(|e| Error::ArenaCreate {
                path: descriptor.path.clone(),
                cause: e.to_string(),
            })?;

        file.set_len(len as u64).map_err(|e| Error::ArenaCreate {
            path: descriptor.path.clone(),
            cause: e.to_string(),
        })?;

        // SAFETY: the file was just created by this segment under a unique name
        // and sized to `len`. Its bytes are only mutated through handles that
        // hold the arena's FIFO permit.
        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .map_mut(&file)
                .map_err(|e| Error::ArenaCreate {
                    path: descriptor.path.clone(),
                    cause: e.to_string(),
                })?
        };

        tracing::debug!(
            segment = %descriptor.name,
            bytes = len,
            "arena segment created"
        );

        Ok(Self { mmap, descriptor })
    }

    /// Map an existing segment by its descriptor
    pub fn attach(descriptor: &SegmentDescriptor) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&descriptor.path)
            .map_err(|e| Error::ArenaCreate {
                path: descriptor.path.clone(),
                cause: e.to_string(),
            })?;

        let actual = file.metadata()?.len();
        if actual != descriptor.len_bytes() as u64 {
            return Err(Error::ArenaCreate {
                path: descriptor.path.clone(),
                cause: format!(
                    "segment is {actual} bytes, descriptor says {}",
                    descriptor.len_bytes()
                ),
            });
        }

        // SAFETY: the file is a segment created by `ArenaSegment::create` and its
        // length was checked above. Writers and readers only touch it while
        // holding the arena's FIFO permit.
        let mmap = unsafe {
            MmapOptions::new()
                .len(descriptor.len_bytes())
                .map_mut(&file)
                .map_err(|e| Error::ArenaCreate {
                    path: descriptor.path.clone(),
                    cause: e.to_string(),
                })?
        };

        Ok(Self {
            mmap,
            descriptor: descriptor.clone(),
        })
    }

    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.descriptor
    }

    /// Copy `bytes` in at row `start`
    pub fn write_rows(&mut self, start: usize, bytes: &[u8]) {
        let offset = start * self.descriptor.row_bytes;
        self.mmap[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Private copy of rows `[start, end)`
    pub fn read_rows(&self, start: usize, end: usize) -> Vec<u8> {
        let row_bytes = self.descriptor.row_bytes;
        self.mmap[start * row_bytes..end * row_bytes].to_vec()
    }

    /// Move `rows` rows from `from` to `to`; ranges may overlap
    pub fn move_rows(&mut self, from: usize, to: usize, rows: usize) {
        let row_bytes = self.descriptor.row_bytes;
        self.mmap
            .copy_within(from * row_bytes..(from + rows) * row_bytes, to * row_bytes);
    }

    /// Remove the backing file; existing mappings stay valid until dropped
    pub fn unlink(&self) -> Result<()> {
        match std::fs::remove_file(&self.descriptor.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for ArenaSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaSegment")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}
