//! Demand paging for the Eyrie enclave runtime on RISC-V Sv39.
//!
//! The enclave owns a fixed pool of physical memory. When it runs out, a resident user page is picked at random,
//! its content is parked in a host-provided backing store, and the page table entry is turned into an invalid entry
//! that carries the backing slot's physical page number. A later page fault on that address rotates the content
//! back in.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

pub mod arch;
pub mod backing_store;
pub mod fault;
pub mod page_allocator;
pub mod paging;
pub mod riscv64;
pub mod structs;
pub mod swap;
pub mod victim;
pub mod walker;

pub use backing_store::BackingStore;
pub use fault::{EnclaveContext, FaultTerminator, TrapHandler, TrapTable, paging_handle_page_fault};
pub use paging::PagingState;
pub use riscv64::structs::{PageTableEntry, PteFlags};
pub use structs::{EnclaveLayout, PageLevel, PhysicalAddress, VirtualAddress};

pub type PagingResult<T> = Result<T, PagingError>;

/// Every way the paging engine can fail. Apart from a missing backing store at initialization, the fault path
/// treats all of these as fatal and hands the enclave to the runtime's termination path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    // Faulting address belongs to the runtime, not the user
    AddressAboveLoadBoundary,

    // No page table entry covers the address
    NoMapping,

    // Fault on an entry that is already valid
    EntryAlreadyValid,

    // Invalid entry without a backing store pointer
    MissingBackingPointer,

    // Backing pointer outside the backing store
    BackingPointerOutOfRange,

    // Resident page outside the enclave physical memory
    EpmPageOutOfRange,

    // Incoming page is not the slot being displaced
    SwapSlotMismatch,

    // Swap encryption requested
    EncryptionUnsupported,

    // Victim selection with no resident frames
    EmptyFramePool,

    // The supervisor returned a zero random value
    ZeroRandomDraw,

    // No victim found within the retry bound
    NoVictimPage,

    // Backing store has no free slot
    BackingStoreExhausted,

    // Victim is mapped by a superpage
    UnsupportedVictimLevel,

    // No backing store configured
    PagingDisabled,

    // Unaligned address
    UnalignedAddress,

    // Out of pages for intermediate tables
    OutOfResources,

    // Invalid memory range
    InvalidMemoryRange,
}

#[cfg(test)]
mod tests;
