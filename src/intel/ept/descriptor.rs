//! Flat view of the memory that holds the EPT paging structures.

use {
    crate::{intel::ept::ExtendedPageTable, utils::alloc::FrameAllocator},
    alloc::vec::Vec,
    x86::bits64::paging::BASE_PAGE_SIZE,
};

/// One block of memory backing an EPT table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryDescriptor {
    /// Physical base address of the block.
    pub phys: u64,
    /// Virtual address the block is reachable at from the host.
    pub virt: u64,
    /// Size of the block in bytes.
    pub size: u64,
}

impl<A: FrameAllocator + Clone> ExtendedPageTable<A> {
    /// Converts the tree of tables into a linear memory descriptor list.
    ///
    /// Only the tables are reported, not the pages they map. Tables are listed depth first, each
    /// before the tables below it and siblings in entry order, so the list only changes when the
    /// tree does.
    pub fn ept_to_mdl(&self) -> Vec<MemoryDescriptor> {
        let mut mdl = Vec::new();
        self.collect_descriptors(&mut mdl);
        mdl
    }

    fn collect_descriptors(&self, mdl: &mut Vec<MemoryDescriptor>) {
        mdl.push(MemoryDescriptor {
            phys: self.table.physical_address().pa(),
            virt: self.table.virtual_address(),
            size: BASE_PAGE_SIZE as u64,
        });

        for child in self.tables() {
            child.collect_descriptors(mdl);
        }
    }
}
