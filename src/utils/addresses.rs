//! Abstraction over physical addresses with utility functions for address conversion.
//!
//! This module introduces the `PhysicalAddress` structure that simplifies operations around
//! physical addresses, such as extracting page frame numbers (PFNs). Translating between virtual
//! and physical addresses is left to the [`FrameAllocator`](crate::utils::alloc::FrameAllocator)
//! that owns the memory.

use {
    core::{fmt, ops::Deref},
    x86::bits64::paging::{PAddr, BASE_PAGE_SHIFT},
};

/// A representation of physical addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalAddress(PAddr);

impl PhysicalAddress {
    /// Constructs a `PhysicalAddress` from a given physical address.
    pub fn from_pa(pa: u64) -> Self {
        Self(PAddr::from(pa))
    }

    /// Retrieves the page frame number (PFN) for the physical address.
    pub fn pfn(&self) -> u64 {
        self.0.as_u64() >> BASE_PAGE_SHIFT
    }

    /// Retrieves the physical address.
    pub fn pa(&self) -> u64 {
        self.0.as_u64()
    }
}

impl Deref for PhysicalAddress {
    type Target = PAddr;

    /// Dereferences the `PhysicalAddress` to retrieve the underlying `PAddr`.
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.pa(), f)
    }
}
