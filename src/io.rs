//! Disk I/O for container, dependent and spill files

use crate::error::{HfaError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Access mode of an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    Update,
}

/// Read/write counters, used to verify that idle flushes touch nothing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_written: u64,
}

/// Disk-backed file with positioned reads and writes
#[derive(Debug)]
pub struct HfaFile {
    file: File,
    path: PathBuf,
    access: Access,
    stats: IoStats,
}

impl HfaFile {
    /// Create (truncating) a file for update
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(HfaFile {
            file,
            path: path.as_ref().to_path_buf(),
            access: Access::Update,
            stats: IoStats::default(),
        })
    }

    /// Open an existing file
    pub fn open<P: AsRef<Path>>(path: P, access: Access) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(access == Access::Update)
            .open(&path)?;

        Ok(HfaFile {
            file,
            path: path.as_ref().to_path_buf(),
            access,
            stats: IoStats::default(),
        })
    }

    /// Read exactly `buf.len()` bytes at `offset`
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        self.stats.reads += 1;
        Ok(())
    }

    pub fn read_vec(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Read up to `len` bytes, stopping early at end of file
    pub fn read_up_to(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        (&mut self.file).take(len as u64).read_to_end(&mut buf)?;
        self.stats.reads += 1;
        Ok(buf)
    }

    /// Write `data` at `offset`
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.access == Access::ReadOnly {
            return Err(HfaError::ReadOnly);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.stats.writes += 1;
        self.stats.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Current file length
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Extend or truncate the file
    pub fn set_len(&mut self, len: u64) -> Result<()> {
        if self.access == Access::ReadOnly {
            return Err(HfaError::ReadOnly);
        }
        self.file.set_len(len)?;
        self.stats.writes += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn stats(&self) -> IoStats {
        self.stats
    }

    /// Sync all writes to disk
    pub fn sync(&mut self) -> Result<()> {
        if self.access == Access::Update {
            self.file.flush()?;
            self.file.sync_all()?;
        }
        Ok(())
    }
}
