// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::ptr::null_mut;

use crate::errno_result;
use crate::Error;
use crate::Result;

/// An anonymous, private, read/write memory mapping.
///
/// The mapping is page-aligned and unmapped on drop.
#[derive(Debug)]
pub struct MemoryMapping {
    addr: *mut u8,
    size: usize,
}

// Safe because the mapping is owned exclusively and all accessors bounds-check.
unsafe impl Send for MemoryMapping {}
unsafe impl Sync for MemoryMapping {}

impl MemoryMapping {
    /// Maps `size` bytes of zeroed anonymous memory.
    pub fn new(size: usize) -> Result<MemoryMapping> {
        if size == 0 {
            return Err(Error::new(libc::EINVAL));
        }
        // Safe because we request an anonymous mapping at no fixed address and
        // check the result.
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return errno_result();
        }
        Ok(MemoryMapping {
            addr: addr as *mut u8,
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    /// Copies `buf` into the mapping at `offset`.
    pub fn write_slice(&self, buf: &[u8], offset: usize) -> Result<()> {
        let end = offset
            .checked_add(buf.len())
            .ok_or(Error::new(libc::EINVAL))?;
        if end > self.size {
            return Err(Error::new(libc::EINVAL));
        }
        // Safe because the range was checked against the mapping bounds.
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.addr.add(offset), buf.len());
        }
        Ok(())
    }

    /// Copies bytes at `offset` out of the mapping into `buf`.
    pub fn read_slice(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        let end = offset
            .checked_add(buf.len())
            .ok_or(Error::new(libc::EINVAL))?;
        if end > self.size {
            return Err(Error::new(libc::EINVAL));
        }
        // Safe because the range was checked against the mapping bounds.
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr.add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }
}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // Safe because this mapping was returned by mmap with this size.
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read() {
        let m = MemoryMapping::new(4096).unwrap();
        m.write_slice(&[1, 2, 3, 4], 100).unwrap();
        let mut buf = [0u8; 4];
        m.read_slice(&mut buf, 100).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn out_of_bounds() {
        let m = MemoryMapping::new(4096).unwrap();
        assert!(m.write_slice(&[0u8; 8], 4092).is_err());
        let mut buf = [0u8; 8];
        assert!(m.read_slice(&mut buf, usize::MAX).is_err());
    }
}
