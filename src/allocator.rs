//! End-of-file space allocation
//!
//! Containers never reuse freed space. New entries, block data, metadata
//! strings and dictionary text are all placed at the current end of file,
//! which only ever grows. Offsets are 32-bit on disk, so allocation fails
//! once the file would pass 4 GiB.

use crate::error::{HfaError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceAllocator {
    end_of_file: u32,
}

impl SpaceAllocator {
    pub fn new(end_of_file: u32) -> Self {
        SpaceAllocator { end_of_file }
    }

    /// Start from an existing file length
    pub fn from_file_len(len: u64) -> Result<Self> {
        let end_of_file = u32::try_from(len).map_err(|_| {
            HfaError::OutOfSpace(format!("file length {} exceeds 32-bit offsets", len))
        })?;
        Ok(SpaceAllocator { end_of_file })
    }

    /// Reserve `size` bytes and return their offset
    pub fn allocate(&mut self, size: u32) -> Result<u32> {
        let offset = self.end_of_file;
        self.end_of_file = offset.checked_add(size).ok_or_else(|| {
            HfaError::OutOfSpace(format!(
                "cannot allocate {} bytes at offset {}",
                size, offset
            ))
        })?;
        tracing::debug!("Allocated {} bytes at {}", size, offset);
        Ok(offset)
    }

    /// Reserve space for a length given as `usize`
    pub fn allocate_len(&mut self, size: usize) -> Result<u32> {
        let size = u32::try_from(size)
            .map_err(|_| HfaError::OutOfSpace(format!("allocation of {} bytes", size)))?;
        self.allocate(size)
    }

    pub fn end_of_file(&self) -> u32 {
        self.end_of_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_monotonic() {
        let mut alloc = SpaceAllocator::new(38);
        assert_eq!(alloc.allocate(100).unwrap(), 38);
        assert_eq!(alloc.allocate(0).unwrap(), 138);
        assert_eq!(alloc.allocate(10).unwrap(), 138);
        assert_eq!(alloc.end_of_file(), 148);
    }

    #[test]
    fn test_allocation_overflow() {
        let mut alloc = SpaceAllocator::new(u32::MAX - 4);
        assert!(matches!(alloc.allocate(8), Err(HfaError::OutOfSpace(_))));
        assert_eq!(alloc.end_of_file(), u32::MAX - 4);
    }

    #[test]
    fn test_from_large_file_len() {
        assert!(SpaceAllocator::from_file_len(1u64 << 33).is_err());
        assert_eq!(
            SpaceAllocator::from_file_len(512).unwrap().end_of_file(),
            512
        );
    }
}
