//! Physical memory backing the EPT paging structures.
//!
//! Every table of the tree lives in its own 4KB frame supplied by a [`FrameAllocator`]. A [`Frame`]
//! owns one such frame for as long as the table exists and hands it back when dropped.

use {
    crate::{error::EptError, intel::ept::entry::Table, utils::addresses::PhysicalAddress},
    alloc::alloc::{alloc_zeroed, dealloc},
    core::{
        alloc::Layout,
        ops::{Deref, DerefMut},
        ptr::NonNull,
    },
};

/// Supplies the physically contiguous frames that hold EPT tables.
///
/// # Safety
///
/// `allocate_frame` must return memory that is zero-initialized, aligned to 4KB, at least
/// `size_of::<Table>()` bytes long, and not aliased by anything else until it is passed back to
/// `deallocate_frame`. `pa_from_va` must return the physical address the processor will use to
/// reach the frame.
pub unsafe trait FrameAllocator {
    /// Allocates one zeroed table frame, or `None` if memory is exhausted.
    fn allocate_frame(&self) -> Option<NonNull<Table>>;

    /// Returns a frame obtained from `allocate_frame`.
    ///
    /// # Safety
    ///
    /// `frame` must come from this allocator and must not be used afterwards.
    unsafe fn deallocate_frame(&self, frame: NonNull<Table>);

    /// Converts a virtual address inside an allocated frame to its physical address.
    fn pa_from_va(&self, va: u64) -> u64;
}

unsafe impl<T: FrameAllocator + ?Sized> FrameAllocator for &T {
    fn allocate_frame(&self) -> Option<NonNull<Table>> {
        (**self).allocate_frame()
    }

    unsafe fn deallocate_frame(&self, frame: NonNull<Table>) {
        (**self).deallocate_frame(frame)
    }

    fn pa_from_va(&self, va: u64) -> u64 {
        (**self).pa_from_va(va)
    }
}

/// Allocates table frames from the global heap of an identity-mapped host.
///
/// Virtual addresses are reported as physical addresses, which holds for hosts that map physical
/// memory 1:1.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostAllocator;

unsafe impl FrameAllocator for HostAllocator {
    fn allocate_frame(&self) -> Option<NonNull<Table>> {
        // Layout of `Table` is 4KB sized and 4KB aligned.
        let memory = unsafe { alloc_zeroed(Layout::new::<Table>()) };
        NonNull::new(memory.cast::<Table>())
    }

    unsafe fn deallocate_frame(&self, frame: NonNull<Table>) {
        dealloc(frame.as_ptr().cast::<u8>(), Layout::new::<Table>());
    }

    fn pa_from_va(&self, va: u64) -> u64 {
        va
    }
}

/// Exclusive owner of one allocated table frame.
pub struct Frame<A: FrameAllocator> {
    table: NonNull<Table>,
    pa: PhysicalAddress,
    allocator: A,
}

impl<A: FrameAllocator> Frame<A> {
    /// Allocates a zeroed table frame from `allocator`.
    ///
    /// The frame is released again if its physical address turns out not to be 4KB aligned.
    pub fn new(allocator: A) -> Result<Self, EptError> {
        let Some(table) = allocator.allocate_frame() else {
            log::error!("Failed to allocate an EPT table frame");
            return Err(EptError::MemoryAllocationFailed);
        };

        let pa = PhysicalAddress::from_pa(allocator.pa_from_va(table.as_ptr() as u64));
        let frame = Self {
            table,
            pa,
            allocator,
        };

        if !pa.is_base_page_aligned() {
            log::error!("EPT table frame is not 4KB aligned: {:#x}", pa);
            return Err(EptError::MisalignedFrame { pa: pa.pa() });
        }

        Ok(frame)
    }

    pub fn physical_address(&self) -> PhysicalAddress {
        self.pa
    }

    pub fn virtual_address(&self) -> u64 {
        self.table.as_ptr() as u64
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }
}

impl<A: FrameAllocator> Deref for Frame<A> {
    type Target = Table;

    fn deref(&self) -> &Self::Target {
        // Safety: the frame is owned exclusively by `self` until drop.
        unsafe { self.table.as_ref() }
    }
}

impl<A: FrameAllocator> DerefMut for Frame<A> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: the frame is owned exclusively by `self` until drop.
        unsafe { self.table.as_mut() }
    }
}

impl<A: FrameAllocator> Drop for Frame<A> {
    fn drop(&mut self) {
        unsafe { self.allocator.deallocate_frame(self.table) };
    }
}

// Safety: a frame is uniquely owned memory, so it may move or be shared across threads whenever
// the allocator that releases it may.
unsafe impl<A: FrameAllocator + Send> Send for Frame<A> {}
unsafe impl<A: FrameAllocator + Sync> Sync for Frame<A> {}
