// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory handles.
//!
//! A [`SharedRegion`] is the capability a process holds for pages the kernel mapped into its
//! address space. The backing frames are reference counted, so a region can never outlive the
//! pages it names and dropping the last holder frees them. Memory is modelled as 64-bit atomic
//! words; counters use acquire/release and message bytes travel word by word.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::PAGE_SIZE;

const WORD: usize = core::mem::size_of::<u64>();

bitflags::bitflags! {
    /// Access rights of a mapping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        /// Readable.
        const READABLE = 1 << 0;
        /// Writable.
        const WRITABLE = 1 << 1;
        /// Accessible from user mode.
        const USER = 1 << 2;
        /// Mapped without caching.
        const UNCACHED = 1 << 3;
    }
}

/// Physical address of a frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Wraps a raw physical address.
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw address value.
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }
}

/// Virtual address inside one process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Wraps a raw virtual address.
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw address value.
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }
}

/// Zero-initialised page frames shared between address spaces.
pub struct SharedPages {
    words: Box<[AtomicU64]>,
}

impl SharedPages {
    /// Allocates `pages` zeroed pages.
    pub fn zeroed(pages: usize) -> Self {
        let words: Vec<AtomicU64> = (0..pages * PAGE_SIZE / WORD).map(|_| AtomicU64::new(0)).collect();
        Self { words: words.into_boxed_slice() }
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.words.len() * WORD
    }

    /// Returns `true` for a zero-page allocation.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

impl fmt::Debug for SharedPages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPages").field("bytes", &self.len()).finish()
    }
}

/// Handle on a window of shared pages mapped into one process.
///
/// Offsets passed to the accessors are relative to the start of the window and must lie
/// inside it; word accessors additionally require 8-byte alignment. Violations panic, the
/// same as slice indexing.
#[derive(Clone)]
pub struct SharedRegion {
    phys: PhysAddr,
    virt: VirtAddr,
    access: Access,
    offset: usize,
    size: usize,
    pages: Arc<SharedPages>,
}

impl SharedRegion {
    /// Wraps a whole mapping of `pages`.
    pub fn new(phys: PhysAddr, virt: VirtAddr, access: Access, pages: Arc<SharedPages>) -> Self {
        let size = pages.len();
        Self { phys, virt, access, offset: 0, size, pages }
    }

    /// Physical address of the first byte of the window.
    pub fn phys(&self) -> PhysAddr {
        PhysAddr::new(self.phys.raw() + self.offset)
    }

    /// Virtual address of the first byte of the window.
    pub fn virt(&self) -> VirtAddr {
        VirtAddr::new(self.virt.raw() + self.offset)
    }

    /// Size of the window in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Access rights of the mapping.
    pub fn access(&self) -> Access {
        self.access
    }

    /// Number of whole pages in the window.
    pub fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    /// Narrows the handle to `[offset, offset + size)`, or `None` when out of range or unaligned.
    pub fn subregion(&self, offset: usize, size: usize) -> Option<SharedRegion> {
        let end = offset.checked_add(size)?;
        if end > self.size || offset % WORD != 0 {
            return None;
        }
        Some(Self {
            phys: self.phys,
            virt: self.virt,
            access: self.access,
            offset: self.offset + offset,
            size,
            pages: Arc::clone(&self.pages),
        })
    }

    /// Returns the `index`-th page of the window.
    pub fn page(&self, index: usize) -> Option<SharedRegion> {
        self.subregion(index.checked_mul(PAGE_SIZE)?, PAGE_SIZE)
    }

    /// Returns `true` when both handles name the same frames.
    pub fn same_frames(&self, other: &SharedRegion) -> bool {
        Arc::ptr_eq(&self.pages, &other.pages)
    }

    /// Number of live handles on the backing frames.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.pages)
    }

    fn word(&self, offset: usize) -> &AtomicU64 {
        assert!(offset % WORD == 0 && offset + WORD <= self.size, "unaligned or out-of-range word");
        &self.pages.words[(self.offset + offset) / WORD]
    }

    /// Atomically loads the word at `offset`.
    pub fn load(&self, offset: usize, order: Ordering) -> u64 {
        self.word(offset).load(order)
    }

    /// Atomically stores `value` at `offset`.
    pub fn store(&self, offset: usize, value: u64, order: Ordering) {
        self.word(offset).store(value, order);
    }

    /// Copies `out.len()` bytes starting at `offset` out of the window.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        for (i, chunk) in out.chunks_mut(WORD).enumerate() {
            let bytes = self.load(offset + i * WORD, Ordering::Relaxed).to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    /// Copies `src` into the window at `offset`; a trailing partial word is zero padded.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        for (i, chunk) in src.chunks(WORD).enumerate() {
            let mut bytes = [0u8; WORD];
            bytes[..chunk.len()].copy_from_slice(chunk);
            self.store(offset + i * WORD, u64::from_le_bytes(bytes), Ordering::Relaxed);
        }
    }

    /// Zeroes the whole window.
    pub fn clear(&self) {
        for offset in (0..self.size).step_by(WORD) {
            self.store(offset, 0, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("phys", &format_args!("{:#x}", self.phys().raw()))
            .field("virt", &format_args!("{:#x}", self.virt().raw()))
            .field("size", &self.size)
            .field("access", &self.access)
            .finish()
    }
}

static_assertions::assert_impl_all!(SharedRegion: Send, Sync, Clone);
