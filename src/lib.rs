//! In-memory management of the Intel VT-x Extended Page Tables (EPT) of one guest.
//!
//! An [`ExtendedPageTable`] is the PML4 of a guest's guest-physical to host-physical translation.
//! Pages are added at 1GB, 2MB or 4KB granularity, removed again, and looked up by guest physical
//! address. The tables in between are allocated through a [`FrameAllocator`] when first needed and
//! released as soon as they become empty.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod intel;
pub mod utils;

pub use {
    error::EptError,
    intel::ept::{
        descriptor::MemoryDescriptor,
        entry::{Access, Entry, MemoryType, Table},
        level::{Level, PageSize},
        ExtendedPageTable,
    },
    utils::{
        addresses::PhysicalAddress,
        alloc::{Frame, FrameAllocator, HostAllocator},
    },
};
