//! Hardware format of EPT paging-structure entries.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.2 EPT Translation Mechanism,
//! Table 29-1 through Table 29-6.

use {
    crate::intel::ept::level::Level,
    bitfield::bitfield,
    core::{
        mem::size_of,
        ops::{Index, IndexMut},
    },
    static_assertions::const_assert_eq,
    x86::bits64::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE, PAGE_SIZE_ENTRIES},
};

bitfield! {
    /// Represents an Extended Page Table Entry (EPT Entry).
    ///
    /// The same 64-bit layout is used at every level. Whether an entry references the next table
    /// or maps a page is decided by its level and the page size bit (bit 7).
    ///
    /// An all-zero entry is empty. Entries written by [`ExtendedPageTable`](super::ExtendedPageTable)
    /// are never all-zero: table entries carry read/write/execute and page entries always carry the
    /// page size bit, at the PT level too where the processor ignores it.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.2 EPT Translation Mechanism
    #[repr(transparent)]
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Entry(u64);
    impl Debug;

    readable, set_readable: 0;
    writable, set_writable: 1;
    executable, set_executable: 2;
    mem_type, set_mem_type: 5, 3;
    ignore_pat, set_ignore_pat_bit: 6;
    large, set_large: 7;
    accessed, set_accessed_bit: 8;
    dirty, set_dirty_bit: 9;
    user_executable, set_user_executable_bit: 10;
    pfn, set_pfn: 51, 12;
    suppress_ve, set_suppress_ve_bit: 63;
}
const_assert_eq!(size_of::<Entry>(), size_of::<u64>());

impl Entry {
    /// Returns the raw 64-bit value the processor reads.
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// `true` if no bit of the entry is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// `true` if the processor treats the entry as present (any of read, write or execute).
    pub fn is_present(&self) -> bool {
        !self.access().is_empty()
    }

    /// `true` if the entry terminates the walk at `level`.
    pub fn is_page(&self, level: Level) -> bool {
        !self.is_empty() && (level == Level::Pt || self.large())
    }

    /// `true` if the entry references a table of the next level.
    pub fn is_table(&self, level: Level) -> bool {
        !self.is_empty() && !self.is_page(level)
    }

    /// The page size bit (bit 7).
    pub fn page_size_bit(&self) -> bool {
        self.large()
    }

    /// Physical address of the referenced table or page.
    pub fn physical_address(&self) -> u64 {
        self.pfn() << BASE_PAGE_SHIFT
    }

    /// Points the entry at `pa`. The low 12 bits of `pa` are discarded.
    pub fn set_physical_address(&mut self, pa: u64) {
        self.set_pfn(pa >> BASE_PAGE_SHIFT);
    }

    pub fn access(&self) -> Access {
        let mut access = Access::empty();
        access.set(Access::READ, self.readable());
        access.set(Access::WRITE, self.writable());
        access.set(Access::EXECUTE, self.executable());
        access
    }

    pub fn set_access(&mut self, access: Access) {
        self.set_readable(access.contains(Access::READ));
        self.set_writable(access.contains(Access::WRITE));
        self.set_executable(access.contains(Access::EXECUTE));
    }

    /// Memory type of a page entry, or `None` for reserved encodings (2, 3 and 7).
    pub fn memory_type(&self) -> Option<MemoryType> {
        MemoryType::from_bits(self.mem_type())
    }

    pub fn set_memory_type(&mut self, memory_type: MemoryType) {
        self.set_mem_type(memory_type as u64);
    }

    pub fn ignores_pat(&self) -> bool {
        self.ignore_pat()
    }

    pub fn set_ignore_pat(&mut self, ignore: bool) {
        self.set_ignore_pat_bit(ignore);
    }

    /// Accessed flag, set by the processor when accessed and dirty flags are enabled in the EPTP.
    pub fn is_accessed(&self) -> bool {
        self.accessed()
    }

    /// Dirty flag of a page entry, set by the processor on guest writes.
    pub fn is_dirty(&self) -> bool {
        self.dirty()
    }

    /// Clears the accessed and dirty flags.
    pub fn clear_accessed_dirty(&mut self) {
        self.set_accessed_bit(false);
        self.set_dirty_bit(false);
    }

    /// Execute access for user-mode linear addresses (mode-based execute control).
    pub fn is_user_executable(&self) -> bool {
        self.user_executable()
    }

    pub fn set_user_executable(&mut self, executable: bool) {
        self.set_user_executable_bit(executable);
    }

    pub fn suppresses_ve(&self) -> bool {
        self.suppress_ve()
    }

    pub fn set_suppress_ve(&mut self, suppress: bool) {
        self.set_suppress_ve_bit(suppress);
    }

    /// Turns an empty slot into a page entry mapping the frame at `pa`.
    pub(crate) fn make_page(&mut self, pa: u64) {
        self.set_physical_address(pa);
        self.set_large(true);
    }

    /// Turns an empty slot into a table entry referencing the table at `pa`.
    pub(crate) fn make_table(&mut self, pa: u64) {
        self.set_physical_address(pa);
        self.set_access(Access::READ_WRITE_EXECUTE);
    }

    pub(crate) fn clear(&mut self) {
        self.0 = 0;
    }
}

bitflags::bitflags! {
    /// Represents the different access permissions for an EPT entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        /// The EPT entry allows read access.
        const READ = 0b001;
        /// The EPT entry allows write access.
        const WRITE = 0b010;
        /// The EPT entry allows execute access.
        const EXECUTE = 0b100;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

/// Represents the different types of memory an EPT page entry can select.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.7 EPT and Memory Typing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Memory type: Uncacheable (UC)
    Uncacheable = 0,
    /// Memory type: Write-combining (WC)
    WriteCombining = 1,
    /// Memory type: Write-through (WT)
    WriteThrough = 4,
    /// Memory type: Write-protected (WP)
    WriteProtected = 5,
    /// Memory type: Write-back (WB)
    WriteBack = 6,
}

impl MemoryType {
    fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            0 => Some(MemoryType::Uncacheable),
            1 => Some(MemoryType::WriteCombining),
            4 => Some(MemoryType::WriteThrough),
            5 => Some(MemoryType::WriteProtected),
            6 => Some(MemoryType::WriteBack),
            _ => None,
        }
    }
}

/// One 4KB EPT paging structure: a PML4, PDPT, PD or PT.
#[repr(C, align(4096))]
pub struct Table {
    entries: [Entry; PAGE_SIZE_ENTRIES],
}
const_assert_eq!(size_of::<Table>(), BASE_PAGE_SIZE);
const_assert_eq!(core::mem::align_of::<Table>(), BASE_PAGE_SIZE);

impl Table {
    pub fn entries(&self) -> &[Entry; PAGE_SIZE_ENTRIES] {
        &self.entries
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Entry> {
        self.entries.iter()
    }
}

impl Index<usize> for Table {
    type Output = Entry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for Table {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}
