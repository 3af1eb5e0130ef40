// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory collaborator used to back channel shares
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PhysicalMemory trait, Frames, HostMemory, MemoryError
//! DEPENDS_ON: nexus_abi::{SharedPages, SharedRegion}
//! INVARIANTS: Allocation is bounded by the page budget; every mapping is tracked per process
//!             until unmapped; released frames return their pages to the budget

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;

use nexus_abi::{Access, PhysAddr, Pid, SharedPages, SharedRegion, SysError, VirtAddr, PAGE_SIZE};

/// Errors from the memory collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// Page budget exhausted.
    OutOfMemory,
    /// Zero pages requested.
    InvalidArgument,
    /// The region is not mapped in that address space.
    NotMapped,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical pages"),
            Self::InvalidArgument => write!(f, "invalid page count"),
            Self::NotMapped => write!(f, "region not mapped"),
        }
    }
}

impl From<MemoryError> for SysError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::OutOfMemory => SysError::OutOfMemory,
            MemoryError::InvalidArgument => SysError::InvalidArgument,
            MemoryError::NotMapped => SysError::IoError,
        }
    }
}

/// Physically contiguous pages handed out by [`PhysicalMemory::allocate`].
#[derive(Debug, Clone)]
pub struct Frames {
    phys: PhysAddr,
    count: usize,
    backing: Arc<SharedPages>,
}

impl Frames {
    /// First physical address.
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Number of pages.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Allocate/map capability consumed by the share table.
pub trait PhysicalMemory {
    /// Allocates `pages` zeroed, physically contiguous pages.
    fn allocate(&mut self, pages: usize) -> Result<Frames, MemoryError>;

    /// Returns frames to the allocator.
    fn release(&mut self, frames: Frames);

    /// Maps `frames` into the address space of `pid`.
    fn map(&mut self, pid: Pid, frames: &Frames, access: Access) -> Result<SharedRegion, MemoryError>;

    /// Removes a mapping created by [`PhysicalMemory::map`].
    fn unmap(&mut self, pid: Pid, region: &SharedRegion) -> Result<(), MemoryError>;

    /// Pages currently allocated.
    fn used_pages(&self) -> usize;
}

const HOST_PHYS_BASE: usize = 0x8000_0000;
const HOST_SHARE_BASE: usize = 0x4000_0000;

/// Page-budgeted allocator backed by host memory.
#[derive(Debug)]
pub struct HostMemory {
    total_pages: usize,
    used_pages: usize,
    next_phys: usize,
    next_virt: BTreeMap<Pid, usize>,
    mappings: BTreeMap<(Pid, VirtAddr), PhysAddr>,
}

impl HostMemory {
    /// Creates an allocator with a budget of `total_pages`.
    pub fn new(total_pages: usize) -> Self {
        Self {
            total_pages,
            used_pages: 0,
            next_phys: HOST_PHYS_BASE,
            next_virt: BTreeMap::new(),
            mappings: BTreeMap::new(),
        }
    }

    /// Live mappings across all address spaces.
    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }
}

impl PhysicalMemory for HostMemory {
    fn allocate(&mut self, pages: usize) -> Result<Frames, MemoryError> {
        if pages == 0 {
            return Err(MemoryError::InvalidArgument);
        }
        if self.used_pages + pages > self.total_pages {
            return Err(MemoryError::OutOfMemory);
        }
        self.used_pages += pages;
        let phys = PhysAddr::new(self.next_phys);
        self.next_phys += pages * PAGE_SIZE;
        Ok(Frames { phys, count: pages, backing: Arc::new(SharedPages::zeroed(pages)) })
    }

    fn release(&mut self, frames: Frames) {
        self.used_pages = self.used_pages.saturating_sub(frames.count);
    }

    fn map(&mut self, pid: Pid, frames: &Frames, access: Access) -> Result<SharedRegion, MemoryError> {
        let cursor = self.next_virt.entry(pid).or_insert(HOST_SHARE_BASE);
        let virt = VirtAddr::new(*cursor);
        *cursor += frames.count * PAGE_SIZE;
        self.mappings.insert((pid, virt), frames.phys);
        Ok(SharedRegion::new(frames.phys, virt, access, Arc::clone(&frames.backing)))
    }

    fn unmap(&mut self, pid: Pid, region: &SharedRegion) -> Result<(), MemoryError> {
        self.mappings.remove(&(pid, region.virt())).map(|_| ()).ok_or(MemoryError::NotMapped)
    }

    fn used_pages(&self) -> usize {
        self.used_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_enforced_and_restored() {
        let mut mem = HostMemory::new(4);
        let frames = mem.allocate(4).unwrap();
        assert_eq!(mem.allocate(1).unwrap_err(), MemoryError::OutOfMemory);
        mem.release(frames);
        assert_eq!(mem.used_pages(), 0);
        assert_eq!(mem.allocate(0).unwrap_err(), MemoryError::InvalidArgument);
    }

    #[test]
    fn two_mappings_alias_one_frame() {
        let mut mem = HostMemory::new(8);
        let frames = mem.allocate(2).unwrap();
        let a = mem.map(Pid::from_raw(1), &frames, Access::READABLE | Access::WRITABLE).unwrap();
        let b = mem.map(Pid::from_raw(2), &frames, Access::READABLE).unwrap();
        assert!(a.same_frames(&b));
        assert_eq!(a.phys(), b.phys());
        assert_eq!(mem.mapping_count(), 2);
        mem.unmap(Pid::from_raw(1), &a).unwrap();
        assert_eq!(mem.unmap(Pid::from_raw(1), &a), Err(MemoryError::NotMapped));
    }
}
