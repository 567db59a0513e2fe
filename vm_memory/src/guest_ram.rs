// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use base::pagesize;
use base::MemoryMapping;
use remain::sorted;
use thiserror::Error;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("RAM block {0} overlaps an existing block")]
    BlockOverlap(String),
    #[error("duplicate RAM block name {0}")]
    DuplicateBlock(String),
    #[error("madvise on block {name}: {err}")]
    Madvise { name: String, err: base::Error },
    #[error("failed to map RAM block {name}: {err}")]
    Mmap { name: String, err: base::Error },
    #[error("range {offset:#x}+{len:#x} out of bounds for block {name}")]
    OutOfRange {
        name: String,
        offset: usize,
        len: usize,
    },
    #[error("block length {0:#x} is not a multiple of the page size")]
    UnalignedLength(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A named region of guest RAM backed by a host mapping.
///
/// Guest-physical placement is recorded for overlap checking; all migration
/// work addresses pages by host address or byte offset within the block.
#[derive(Debug)]
pub struct RamBlock {
    name: String,
    guest_base: u64,
    mapping: MemoryMapping,
    page_size: usize,
}

impl RamBlock {
    fn new(name: &str, guest_base: u64, len: usize) -> Result<RamBlock> {
        let page_size = pagesize();
        if len == 0 || len % page_size != 0 {
            return Err(Error::UnalignedLength(len));
        }
        let mapping = MemoryMapping::new(len).map_err(|err| Error::Mmap {
            name: name.to_owned(),
            err,
        })?;
        Ok(RamBlock {
            name: name.to_owned(),
            guest_base,
            mapping,
            page_size,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn guest_base(&self) -> u64 {
        self.guest_base
    }

    pub fn len(&self) -> usize {
        self.mapping.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_pages(&self) -> usize {
        self.len() / self.page_size
    }

    /// Base host address of the mapping.
    pub fn host_addr(&self) -> usize {
        self.mapping.as_ptr() as usize
    }

    pub fn contains_host_addr(&self, addr: usize) -> bool {
        addr >= self.host_addr() && addr < self.host_addr() + self.len()
    }

    /// Byte offset of `addr` within the block, if it falls inside it.
    pub fn offset_of_host_addr(&self, addr: usize) -> Option<usize> {
        if self.contains_host_addr(addr) {
            Some(addr - self.host_addr())
        } else {
            None
        }
    }

    pub fn write_slice(&self, buf: &[u8], offset: usize) -> Result<()> {
        self.mapping
            .write_slice(buf, offset)
            .map_err(|_| self.out_of_range(offset, buf.len()))
    }

    pub fn read_slice(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        self.mapping
            .read_slice(buf, offset)
            .map_err(|_| self.out_of_range(offset, buf.len()))
    }

    /// Releases the pages in `[offset, offset + len)` back to the OS. The
    /// range reads as zeroes afterwards; with userfaultfd registered, the
    /// next access faults.
    pub fn discard_range(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.len())
            .ok_or_else(|| self.out_of_range(offset, len))?;
        if offset % self.page_size != 0 || end % self.page_size != 0 {
            return Err(self.out_of_range(offset, len));
        }
        self.madvise(offset, len, libc::MADV_DONTNEED)
    }

    /// Releases the entire block.
    pub fn discard_all(&self) -> Result<()> {
        self.discard_range(0, self.len())
    }

    /// Toggles transparent huge page backing for the whole block. Postcopy
    /// disables it so pages can be placed one standard page at a time.
    pub fn set_huge_pages(&self, enable: bool) -> Result<()> {
        let advice = if enable {
            libc::MADV_HUGEPAGE
        } else {
            libc::MADV_NOHUGEPAGE
        };
        match self.madvise(0, self.len(), advice) {
            // Kernels built without THP reject the advice; nothing to toggle.
            Err(Error::Madvise { err, .. }) if err.errno() == libc::EINVAL => Ok(()),
            other => other,
        }
    }

    fn madvise(&self, offset: usize, len: usize, advice: libc::c_int) -> Result<()> {
        // Safe because the range was validated against this owned mapping.
        let ret = unsafe {
            libc::madvise(
                (self.host_addr() + offset) as *mut libc::c_void,
                len,
                advice,
            )
        };
        if ret < 0 {
            return Err(Error::Madvise {
                name: self.name.clone(),
                err: base::Error::last(),
            });
        }
        Ok(())
    }

    fn out_of_range(&self, offset: usize, len: usize) -> Error {
        Error::OutOfRange {
            name: self.name.clone(),
            offset,
            len,
        }
    }
}

/// The ordered set of RAM blocks making up guest memory.
#[derive(Debug, Default)]
pub struct GuestRam {
    blocks: Vec<Arc<RamBlock>>,
}

impl GuestRam {
    pub fn new() -> GuestRam {
        GuestRam { blocks: Vec::new() }
    }

    /// Allocates and registers a new block. Names must be unique and guest
    /// ranges must not overlap: every guest-physical address maps to exactly
    /// one block.
    pub fn add_block(&mut self, name: &str, guest_base: u64, len: usize) -> Result<Arc<RamBlock>> {
        if self.find(name).is_some() {
            return Err(Error::DuplicateBlock(name.to_owned()));
        }
        let guest_end = guest_base + len as u64;
        for b in &self.blocks {
            let b_end = b.guest_base() + b.len() as u64;
            if guest_base < b_end && b.guest_base() < guest_end {
                return Err(Error::BlockOverlap(name.to_owned()));
            }
        }
        let block = Arc::new(RamBlock::new(name, guest_base, len)?);
        self.blocks.push(Arc::clone(&block));
        Ok(block)
    }

    pub fn find(&self, name: &str) -> Option<&Arc<RamBlock>> {
        self.blocks.iter().find(|b| b.name() == name)
    }

    /// Maps a faulting host address to its block and byte offset.
    pub fn resolve_host_addr(&self, addr: usize) -> Option<(&Arc<RamBlock>, usize)> {
        for b in &self.blocks {
            if let Some(offset) = b.offset_of_host_addr(addr) {
                return Some((b, offset));
            }
        }
        None
    }

    pub fn blocks(&self) -> &[Arc<RamBlock>] {
        &self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_find() {
        let mut ram = GuestRam::new();
        let psize = pagesize();
        ram.add_block("pc.ram", 0, 16 * psize).unwrap();
        ram.add_block("vga.vram", 0x1000_0000, 4 * psize).unwrap();
        assert!(ram.find("pc.ram").is_some());
        assert!(ram.find("missing").is_none());
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut ram = GuestRam::new();
        let psize = pagesize();
        ram.add_block("pc.ram", 0, psize).unwrap();
        assert!(matches!(
            ram.add_block("pc.ram", 0x1000_0000, psize),
            Err(Error::DuplicateBlock(_))
        ));
    }

    #[test]
    fn overlap_rejected() {
        let mut ram = GuestRam::new();
        let psize = pagesize();
        ram.add_block("a", 0, 4 * psize).unwrap();
        assert!(matches!(
            ram.add_block("b", psize as u64, psize),
            Err(Error::BlockOverlap(_))
        ));
    }

    #[test]
    fn resolve_host_addr() {
        let mut ram = GuestRam::new();
        let psize = pagesize();
        let block = ram.add_block("pc.ram", 0, 8 * psize).unwrap();
        let addr = block.host_addr() + 3 * psize + 7;
        let (found, offset) = ram.resolve_host_addr(addr).unwrap();
        assert_eq!(found.name(), "pc.ram");
        assert_eq!(offset, 3 * psize + 7);
        assert!(ram.resolve_host_addr(block.host_addr() + 8 * psize).is_none());
    }

    #[test]
    fn discard_zeroes_range() {
        let mut ram = GuestRam::new();
        let psize = pagesize();
        let block = ram.add_block("pc.ram", 0, 2 * psize).unwrap();
        block.write_slice(&[0xab; 16], psize).unwrap();
        block.discard_range(psize, psize).unwrap();
        let mut buf = [0xffu8; 16];
        block.read_slice(&mut buf, psize).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn discard_unaligned_rejected() {
        let mut ram = GuestRam::new();
        let psize = pagesize();
        let block = ram.add_block("pc.ram", 0, 2 * psize).unwrap();
        assert!(block.discard_range(1, psize).is_err());
        assert!(block.discard_range(0, 3 * psize).is_err());
    }
}
