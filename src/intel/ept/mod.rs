//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)
//! The extended page-table mechanism (EPT) is a feature that can be used to support the virtualization of physical memory.
//! When EPT is in use, certain addresses that would normally be treated as physical addresses (and used to access memory) are instead treated as guest-physical addresses
//! Guest-physical addresses are translated by traversing a set of EPT paging structures to produce physical addresses that are used to access memory.
//!
//! Tables of this tree are created on demand while pages are added and torn down as soon as they
//! no longer hold any entry, so the memory spent on paging structures follows the mappings.

use {
    crate::{
        error::EptError,
        intel::ept::{
            entry::{Access, Entry, MemoryType},
            level::{Level, PageSize},
        },
        utils::alloc::{Frame, FrameAllocator, HostAllocator},
    },
    alloc::{boxed::Box, vec::Vec},
    x86::bits64::paging::PAGE_SIZE_ENTRIES,
};

pub mod descriptor;
pub mod entry;
pub mod level;

/// Represents an EPT page walk length of 4 as encoded in the EPTP (number of levels minus one).
const EPT_PAGE_WALK_LENGTH_4: u64 = 3 << 3;

/// One table of the EPT tree (PML4, PDPT, PD or PT) together with the tables it references.
///
/// The value returned by [`ExtendedPageTable::new`] is the PML4 of a guest. Lower tables are owned
/// by the entry slot that references them: slot `i` owns a child exactly when entry `i` is a table
/// entry, and that child records `i` as its parent slot.
///
/// No locking happens here. Mutations must be serialized by the owner of the guest, and lookups must
/// not run concurrently with a mutation of the same tree.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.2 EPT Translation Mechanism
pub struct ExtendedPageTable<A: FrameAllocator + Clone = HostAllocator> {
    level: Level,
    /// Index of the entry in the parent table that references this table, `None` for the PML4.
    parent_slot: Option<usize>,
    table: Frame<A>,
    children: Vec<Option<Box<ExtendedPageTable<A>>>>,
}

/// What an entry slot currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    Table,
    Page,
}

impl ExtendedPageTable<HostAllocator> {
    /// Creates an empty PML4 backed by the global heap.
    pub fn with_host_allocator() -> Result<Self, EptError> {
        Self::new(HostAllocator)
    }
}

impl<A: FrameAllocator + Clone> ExtendedPageTable<A> {
    /// Creates an empty PML4 whose tables are allocated from `allocator`.
    pub fn new(allocator: A) -> Result<Self, EptError> {
        Self::with_level(allocator, Level::Pml4, None)
    }

    fn with_level(allocator: A, level: Level, parent_slot: Option<usize>) -> Result<Self, EptError> {
        let table = Frame::new(allocator)?;

        let mut children = Vec::with_capacity(PAGE_SIZE_ENTRIES);
        children.resize_with(PAGE_SIZE_ENTRIES, || None);

        log::trace!(
            "Created {:?} table at {:#x}",
            level,
            table.physical_address()
        );

        Ok(Self {
            level,
            parent_slot,
            table,
            children,
        })
    }

    /// Retrieves the entry at `index` of this table.
    pub fn get_entry(&self, index: usize) -> Option<&Entry> {
        self.table.entries().get(index)
    }

    /// Adds a 1GB page containing `gpa`.
    ///
    /// If the gpa is covered by a PDPT entry that references a page directory, the call fails with
    /// [`EptError::TableConflict`]. If a 1GB page is already mapped it is returned unmodified.
    /// Otherwise a new page entry with only the page size bit and the gpa's frame set is returned.
    pub fn add_page_1g(&mut self, gpa: u64) -> Result<&mut Entry, EptError> {
        self.add_page(gpa, PageSize::Size1G)
    }

    /// Adds a 2MB page containing `gpa`.
    ///
    /// Fails with [`EptError::LargePageConflict`] if a 1GB page covers the gpa and with
    /// [`EptError::TableConflict`] if a page table already exists for it. An existing 2MB page is
    /// returned unmodified.
    pub fn add_page_2m(&mut self, gpa: u64) -> Result<&mut Entry, EptError> {
        self.add_page(gpa, PageSize::Size2M)
    }

    /// Adds a 4KB page containing `gpa`.
    ///
    /// Fails with [`EptError::LargePageConflict`] if a 1GB or 2MB page covers the gpa. An existing
    /// 4KB page is returned unmodified.
    pub fn add_page_4k(&mut self, gpa: u64) -> Result<&mut Entry, EptError> {
        self.add_page(gpa, PageSize::Size4K)
    }

    /// Adds a page of `size` containing `gpa`, creating the intermediate tables on the way.
    ///
    /// On failure the tree is left exactly as it was: tables created by this call are released.
    pub fn add_page(&mut self, gpa: u64, size: PageSize) -> Result<&mut Entry, EptError> {
        // The entry is looked up again because a borrow returned from a recursive call cannot be
        // released on the rollback path.
        self.insert(gpa, size)?;
        self.gpa_to_epte_mut(gpa)
    }

    /// Maps the page of `size` containing `gpa` to the host frame at `hpa`.
    ///
    /// # Arguments
    /// - `gpa`: The guest physical address to map.
    /// - `hpa`: The host physical address to map to. Rounded down to `size` if it is not aligned.
    /// - `size`: Granularity of the mapping.
    /// - `access`: The type of access allowed for the page.
    /// - `memory_type`: The memory type the processor uses for the page.
    pub fn map_page(
        &mut self,
        gpa: u64,
        hpa: u64,
        size: PageSize,
        access: Access,
        memory_type: MemoryType,
    ) -> Result<&mut Entry, EptError> {
        if !size.is_aligned(hpa) {
            log::warn!("Host physical address {:#x} is not {} aligned, rounding down", hpa, size);
        }

        let entry = self.add_page(gpa, size)?;

        entry.set_physical_address(size.align_down(hpa));
        entry.set_access(access);
        entry.set_memory_type(memory_type);

        Ok(entry)
    }

    fn insert(&mut self, gpa: u64, size: PageSize) -> Result<(), EptError> {
        let index = self.level.index(gpa);

        if self.level == size.level() {
            return match self.slot(index) {
                Slot::Empty => {
                    self.table[index].make_page(size.base(gpa));
                    log::debug!("Added {} page at {:#x}", size, size.base(gpa));
                    Ok(())
                }
                Slot::Page => Ok(()),
                Slot::Table => {
                    log::warn!(
                        "Refusing to map a {} page over existing tables at {:#x}",
                        size,
                        gpa
                    );
                    Err(EptError::TableConflict { gpa, size })
                }
            };
        }

        match self.children[index].as_deref_mut() {
            Some(child) => child.insert(gpa, size),
            None => {
                if self.slot(index) == Slot::Page {
                    log::warn!(
                        "Refusing to map a {} page inside a larger page at {:#x}",
                        size,
                        gpa
                    );
                    return Err(EptError::LargePageConflict { gpa, size });
                }

                let child = self.attach(index)?;
                let result = child.insert(gpa, size);

                if result.is_err() {
                    self.detach(index);
                }

                result
            }
        }
    }

    /// Removes the page containing `gpa`, whatever its size.
    ///
    /// Tables left without any entry are released on the way back up, except for the PML4. Adding
    /// and removing pages that alternate between regions therefore re-creates the same tables
    /// repeatedly. Removing a gpa that is not mapped does nothing.
    pub fn remove_page(&mut self, gpa: u64) {
        if !self.remove(gpa) {
            log::trace!("No page to remove at {:#x}", gpa);
        }
    }

    /// Returns whether a page entry was cleared.
    fn remove(&mut self, gpa: u64) -> bool {
        let index = self.level.index(gpa);

        match self.children[index].as_deref_mut() {
            Some(child) => {
                let removed = child.remove(gpa);

                if removed && child.empty() {
                    self.detach(index);
                }

                removed
            }
            None => {
                if self.slot(index) != Slot::Page {
                    return false;
                }

                self.table[index].clear();
                log::debug!("Removed {:?} page entry for {:#x}", self.level, gpa);
                true
            }
        }
    }

    /// Locates the page entry that maps `gpa`.
    pub fn gpa_to_epte(&self, gpa: u64) -> Result<&Entry, EptError> {
        let mut table = self;

        loop {
            let index = table.level.index(gpa);

            match table.children[index].as_deref() {
                Some(child) => table = child,
                None if table.slot(index) == Slot::Page => return Ok(&table.table[index]),
                None => return Err(EptError::NotMapped { gpa }),
            }
        }
    }

    /// Locates the page entry that maps `gpa` for modification.
    pub fn gpa_to_epte_mut(&mut self, gpa: u64) -> Result<&mut Entry, EptError> {
        let index = self.level.index(gpa);

        if self.children[index].is_none() {
            return match self.slot(index) {
                Slot::Page => Ok(&mut self.table[index]),
                _ => Err(EptError::NotMapped { gpa }),
            };
        }

        match self.children[index].as_deref_mut() {
            Some(child) => child.gpa_to_epte_mut(gpa),
            None => Err(EptError::NotMapped { gpa }),
        }
    }

    /// `true` if no entry of this table is in use.
    pub fn empty(&self) -> bool {
        self.table.iter().all(Entry::is_empty)
    }

    /// Number of entries in use in this table and all tables below it.
    pub fn global_size(&self) -> usize {
        let size = self.table.iter().filter(|entry| !entry.is_empty()).count();

        size + self.tables().map(Self::global_size).sum::<usize>()
    }

    /// Number of entry slots in this table and all tables below it.
    pub fn global_capacity(&self) -> usize {
        PAGE_SIZE_ENTRIES + self.tables().map(Self::global_capacity).sum::<usize>()
    }

    /// Creates an Extended Page Table Pointer (EPTP) with a Write-Back memory type and a 4-level page walk.
    ///
    /// The physical address of this table is encoded together with the memory type the processor
    /// uses to access the paging structures and the page walk length. Loading the value into the
    /// VMCS is up to the caller.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.11 Extended-Page-Table Pointer (EPTP)
    pub fn eptp(&self) -> u64 {
        self.table.physical_address().pa() | EPT_PAGE_WALK_LENGTH_4 | MemoryType::WriteBack as u64
    }

    pub fn level(&self) -> Level {
        self.level
    }

    fn tables(&self) -> impl Iterator<Item = &ExtendedPageTable<A>> + '_ {
        self.children.iter().filter_map(Option::as_deref)
    }

    fn slot(&self, index: usize) -> Slot {
        let entry = &self.table[index];

        match &self.children[index] {
            Some(_) => Slot::Table,
            None if entry.is_empty() => Slot::Empty,
            None if entry.is_page(self.level) => Slot::Page,
            None => panic!(
                "{:?} entry {} references a table no one owns: {:?}",
                self.level, index, entry
            ),
        }
    }

    /// Allocates the next-level table for `index` and links it into this table.
    fn attach(&mut self, index: usize) -> Result<&mut ExtendedPageTable<A>, EptError> {
        let Some(level) = self.level.child() else {
            panic!("{:?} tables cannot reference another table", self.level);
        };

        let child = Self::with_level(self.table.allocator().clone(), level, Some(index))?;
        self.table[index].make_table(child.table.physical_address().pa());

        Ok(&mut **self.children[index].insert(Box::new(child)))
    }

    /// Unlinks the table referenced by `index` and releases it with everything below it.
    fn detach(&mut self, index: usize) {
        self.table[index].clear();

        if let Some(child) = self.children[index].take() {
            debug_assert_eq!(
                child.parent_slot,
                Some(index),
                "{:?} table linked from the wrong slot",
                child.level
            );
            log::trace!(
                "Released {:?} table at {:#x}",
                child.level,
                child.table.physical_address()
            );
        }
    }
}
