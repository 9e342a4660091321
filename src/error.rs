use {crate::intel::ept::level::PageSize, thiserror_no_std::Error};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EptError {
    #[error("Failed allocate memory via FrameAllocator")]
    MemoryAllocationFailed,
    #[error("FrameAllocator returned a frame that is not 4KB aligned: {pa:#x}")]
    MisalignedFrame { pa: u64 },
    #[error("Guest physical address {gpa:#x} is already mapped by a page larger than {size}")]
    LargePageConflict { gpa: u64, size: PageSize },
    #[error("Guest physical address {gpa:#x} is already mapped at a finer granularity than {size}")]
    TableConflict { gpa: u64, size: PageSize },
    #[error("Guest physical address {gpa:#x} is not mapped")]
    NotMapped { gpa: u64 },
}

impl EptError {
    /// Returns `true` if the request clashed with an existing mapping of a different granularity.
    ///
    /// The caller can always recover by removing the conflicting mapping first.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EptError::LargePageConflict { .. } | EptError::TableConflict { .. }
        )
    }
}
