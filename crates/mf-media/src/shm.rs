//! Named shared-memory buffers.
//!
//! Frames and sample buffers handed to a worker process live in POSIX
//! shared memory so the worker can decode straight into them. The buffer
//! travels by name; the receiver maps the same object with
//! [`SharedBuffer::open`]. Only the creator unlinks the name.

use memmap2::MmapMut;
use mf_core::{Error, Result};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fs::File;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

pub struct SharedBuffer {
    name: String,
    map: MmapMut,
    len: usize,
    owner: bool,
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("owner", &self.owner)
            .finish()
    }
}

impl SharedBuffer {
    /// Create a zero-filled buffer of `len` bytes under a fresh name.
    pub fn create(len: usize) -> Result<Self> {
        let name = format!(
            "/mediafork-{}-{}",
            std::process::id(),
            NEXT_ID.fetch_add(1, Ordering::Relaxed)
        );
        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| shm_error(&name, e))?;
        let file = File::from(fd);
        let mut buffer = Self::map(name, &file, len, true)?;
        buffer.map.fill(0);
        Ok(buffer)
    }

    /// Map a buffer created by another process.
    pub fn open(name: &str, len: usize) -> Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|e| shm_error(name, e))?;
        let file = File::from(fd);
        let actual = file.metadata()?.len() as usize;
        if actual < len {
            return Err(Error::Protocol(format!(
                "shared buffer {name} holds {actual} bytes, expected {len}"
            )));
        }
        Self::map(name.to_string(), &file, len, false)
    }

    fn map(name: String, file: &File, len: usize, owner: bool) -> Result<Self> {
        if owner {
            if let Err(e) = file.set_len(len.max(1) as u64) {
                let _ = shm_unlink(name.as_str());
                return Err(e.into());
            }
        }
        // SAFETY: the object is only resized by its creator, before mapping.
        let map = match unsafe { MmapMut::map_mut(file) } {
            Ok(map) => map,
            Err(e) => {
                if owner {
                    let _ = shm_unlink(name.as_str());
                }
                return Err(e.into());
            }
        };
        Ok(Self {
            name,
            map,
            len,
            owner,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Deref for SharedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map[..self.len]
    }
}

impl DerefMut for SharedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.map[..self.len]
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = shm_unlink(self.name.as_str()) {
                tracing::debug!("shm_unlink {} failed: {e}", self.name);
            }
        }
    }
}

fn shm_error(name: &str, errno: nix::errno::Errno) -> Error {
    let source = std::io::Error::from(errno);
    if source.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(format!("shared buffer {name}"))
    } else {
        Error::Io { source }
    }
}
