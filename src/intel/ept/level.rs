//! Guest-physical address decomposition for the 4-level EPT walk.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.2 EPT Translation Mechanism
//!
//! | Level | Index bits |
//! |-------|------------|
//! | PML4  | 47:39      |
//! | PDPT  | 38:30      |
//! | PD    | 29:21      |
//! | PT    | 20:12      |
//!
//! Bits 11:0 are the page offset and never index a table. Bits 63:48 are outside the guest
//! physical address width of a 4-level walk and are dropped.

use {
    bit_field::BitField,
    core::fmt,
    x86::bits64::paging::{
        pd_index, pdpt_index, pml4_index, pt_index, VAddr, BASE_PAGE_SIZE, HUGE_PAGE_SIZE,
        LARGE_PAGE_SIZE,
    },
};

/// Guest physical address bits translated by a 4-level walk.
pub const GPA_MASK: u64 = (1 << 48) - 1;

/// One level of the EPT paging hierarchy, numbered by depth from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Pml4 = 0,
    Pdpt = 1,
    Pd = 2,
    Pt = 3,
}

impl Level {
    /// Returns the index into this level's table for the given guest physical address.
    pub fn index(self, gpa: u64) -> usize {
        let gpa = VAddr::from(gpa);

        match self {
            Level::Pml4 => pml4_index(gpa),
            Level::Pdpt => pdpt_index(gpa),
            Level::Pd => pd_index(gpa),
            Level::Pt => pt_index(gpa),
        }
    }

    /// Position of the lowest guest physical address bit used to index this level.
    pub const fn shift(self) -> usize {
        match self {
            Level::Pml4 => 39,
            Level::Pdpt => 30,
            Level::Pd => 21,
            Level::Pt => 12,
        }
    }

    /// Number of guest physical bytes translated by one entry of this level.
    pub const fn coverage(self) -> u64 {
        1 << self.shift()
    }

    /// The level of the tables referenced by this level's table entries.
    pub const fn child(self) -> Option<Level> {
        match self {
            Level::Pml4 => Some(Level::Pdpt),
            Level::Pdpt => Some(Level::Pd),
            Level::Pd => Some(Level::Pt),
            Level::Pt => None,
        }
    }

    /// Granularity of a page entry terminating the walk at this level, if one is allowed.
    pub const fn page_size(self) -> Option<PageSize> {
        match self {
            Level::Pml4 => None,
            Level::Pdpt => Some(PageSize::Size1G),
            Level::Pd => Some(PageSize::Size2M),
            Level::Pt => Some(PageSize::Size4K),
        }
    }
}

/// Granularity of a terminal EPT mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageSize {
    Size4K,
    Size2M,
    Size1G,
}

impl PageSize {
    /// The level at which a walk for this granularity stops in a page entry.
    pub const fn level(self) -> Level {
        match self {
            PageSize::Size4K => Level::Pt,
            PageSize::Size2M => Level::Pd,
            PageSize::Size1G => Level::Pdpt,
        }
    }

    /// Size of the page in bytes.
    pub const fn bytes(self) -> u64 {
        match self {
            PageSize::Size4K => BASE_PAGE_SIZE as u64,
            PageSize::Size2M => LARGE_PAGE_SIZE as u64,
            PageSize::Size1G => HUGE_PAGE_SIZE as u64,
        }
    }

    /// Rounds `gpa` down to the start of the page that contains it.
    pub fn align_down(self, gpa: u64) -> u64 {
        gpa & !(self.bytes() - 1)
    }

    /// Guest physical base of the page that contains `gpa`, without the bits the walk ignores.
    pub fn base(self, gpa: u64) -> u64 {
        self.align_down(gpa & GPA_MASK)
    }

    /// Offset of `gpa` inside the page that contains it.
    pub fn offset(self, gpa: u64) -> u64 {
        gpa.get_bits(0..self.level().shift())
    }

    pub fn is_aligned(self, address: u64) -> bool {
        self.offset(address) == 0
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageSize::Size4K => f.write_str("4KB"),
            PageSize::Size2M => f.write_str("2MB"),
            PageSize::Size1G => f.write_str("1GB"),
        }
    }
}
