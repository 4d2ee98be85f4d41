use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::architecture::VirtAddr;
use crate::error::{RemuError, Result};

/// Live view of the memory region faults are injected into.
///
/// Flips are plain non-atomic read-modify-writes; concurrent writers to
/// the region race with them.
#[derive(Debug)]
pub struct MemMap<'a> {
    buf: *mut u8,
    len: usize,
    _region: PhantomData<&'a mut [u8]>,
}

impl Deref for MemMap<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.buf, self.len) }
    }
}

impl DerefMut for MemMap<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.buf, self.len) }
    }
}

impl<'a> MemMap<'a> {
    pub fn from_slice(buf: &'a mut [u8]) -> MemMap<'a> {
        MemMap {
            buf: buf.as_mut_ptr(),
            len: buf.len(),
            _region: PhantomData,
        }
    }

    /// # Safety
    ///
    /// `buf..buf + len` must be mapped, writable and not accessed through
    /// any other reference for `'a`.
    pub unsafe fn from_raw_parts(buf: *mut u8, len: usize) -> MemMap<'a> {
        MemMap {
            buf,
            len,
            _region: PhantomData,
        }
    }

    pub fn base(&self) -> VirtAddr {
        self.buf as VirtAddr
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        self.offset_of(va).is_some()
    }

    pub fn offset_of(&self, va: VirtAddr) -> Option<usize> {
        let off = va.checked_sub(self.base())?;
        (off < self.len as u64).then_some(off as usize)
    }

    /// XORs `mask` into the byte at `va`. Returns the byte before and
    /// after, or `None` when `va` is outside the region.
    pub fn flip(&mut self, va: VirtAddr, mask: u8) -> Option<(u8, u8)> {
        let off = self.offset_of(va)?;
        let before = self[off];
        self[off] ^= mask;
        Some((before, self[off]))
    }
}

/// Anonymous private mapping, populated on creation so every page has a
/// frame before its pagemap entry is read.
#[derive(Debug)]
pub struct Region {
    ptr: NonNull<u8>,
    len: NonZeroUsize,
}

impl Region {
    pub fn populate(len: usize) -> Result<Region> {
        let len = NonZeroUsize::new(len)
            .ok_or_else(|| RemuError::InvalidConfig("cannot map an empty region".into()))?;
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_POPULATE,
            )
        }
        .map_err(|source| RemuError::Mmap {
            len: len.get(),
            source,
        })?;
        Ok(Region {
            ptr: ptr.cast(),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn mem_map(&mut self) -> MemMap<'_> {
        unsafe { MemMap::from_raw_parts(self.ptr.as_ptr(), self.len.get()) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let _ = unsafe { munmap(self.ptr.cast(), self.len.get()) };
    }
}
