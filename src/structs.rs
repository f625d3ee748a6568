//! Common data structures and constants for Sv39 page table management, the Eyrie virtual address layout and
//! address translation between the enclave's physical regions and the runtime's kernel mappings.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::{
    fmt::{self, Display, Formatter},
    ops::{Add, Sub},
};

use crate::{PagingError, PagingResult};

// Constants for common sizes.
pub const SIZE_4KB: u64 = 0x1000;
pub const SIZE_2MB: u64 = 0x200000;
pub const SIZE_1GB: u64 = 0x40000000;

/// Size of a page in bytes. Sv39 base pages are 4KB, which is all the swap engine moves.
pub const PAGE_SIZE: u64 = SIZE_4KB;

/// Number of address bits covered by the page offset.
pub const PAGE_BITS: u64 = 12;

/// Number of index bits consumed per page table level.
pub const PT_INDEX_BITS: u64 = 9;

/// Number of entries in a single page table.
pub const MAX_ENTRIES: u64 = 1 << PT_INDEX_BITS;

const PAGE_INDEX_MASK: u64 = MAX_ENTRIES - 1;

/// Number of translation levels in Sv39.
pub const PT_LEVELS: usize = 3;

/// Number of significant virtual address bits in Sv39. Bits above this must match bit 38.
pub const VA_BITS: u64 = 39;

// Eyrie runtime virtual address layout. Everything at or above EYRIE_LOAD_START belongs to the runtime and is
// never paged.
pub const EYRIE_LOAD_START: u64 = 0xffff_ffff_0000_0000;
pub const EYRIE_PAGING_START: u64 = 0xffff_ffff_4000_0000;
pub const EYRIE_UNTRUSTED_START: u64 = 0xffff_ffff_8000_0000;
pub const RUNTIME_VA_START: u64 = 0xffff_ffff_c000_0000;

/// Number of random draws the victim selector makes before giving up.
pub const MAX_VICTIM_RETRIES: usize = 3;

#[derive(PartialEq, Clone, Copy, Debug, Eq, Hash)]
pub enum PageLevel {
    Level3,
    Level2,
    Level1,
}

impl PageLevel {
    pub fn root_level() -> PageLevel {
        PageLevel::Level3
    }

    pub fn next_level(&self) -> Option<PageLevel> {
        match self {
            PageLevel::Level3 => Some(PageLevel::Level2),
            PageLevel::Level2 => Some(PageLevel::Level1),
            PageLevel::Level1 => None,
        }
    }

    pub fn is_lowest_level(&self) -> bool {
        matches!(self, PageLevel::Level1)
    }

    pub fn is_root_level(&self) -> bool {
        matches!(self, PageLevel::Level3)
    }

    pub fn start_bit(&self) -> u64 {
        match self {
            PageLevel::Level3 => 30,
            PageLevel::Level2 => 21,
            PageLevel::Level1 => 12,
        }
    }

    pub fn entry_va_size(&self) -> u64 {
        1 << self.start_bit()
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct VirtualAddress(u64);
impl VirtualAddress {
    pub const fn new(va: u64) -> Self {
        Self(va)
    }

    /// Builds a canonical Sv39 address: bits 63..39 are copies of bit 38.
    pub fn canonical(va: u64) -> Self {
        let shift = 64 - VA_BITS;
        Self((((va << shift) as i64) >> shift) as u64)
    }

    /// Builds the canonical address of the page with the given virtual page number.
    pub fn from_vpn(vpn: u64) -> Self {
        Self::canonical(vpn << PAGE_BITS)
    }

    pub fn vpn(&self) -> u64 {
        (self.0 & ((1 << VA_BITS) - 1)) >> PAGE_BITS
    }

    pub fn is_canonical(&self) -> bool {
        Self::canonical(self.0) == *self
    }

    /// This will return the index at the current entry.
    pub fn get_index(&self, level: PageLevel) -> u64 {
        (self.0 >> level.start_bit()) & PAGE_INDEX_MASK
    }

    pub fn is_page_aligned(&self) -> bool {
        (self.0 & (PAGE_SIZE - 1)) == 0
    }

    pub fn page_base(&self) -> VirtualAddress {
        Self(self.0 & !(PAGE_SIZE - 1))
    }
}

impl From<u64> for VirtualAddress {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<VirtualAddress> for u64 {
    fn from(addr: VirtualAddress) -> Self {
        addr.0
    }
}

impl Display for VirtualAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "0x{:016X}", self.0)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = PagingResult<Self>;

    fn add(self, rhs: u64) -> Self::Output {
        match self.0.checked_add(rhs) {
            Some(result) => Ok(VirtualAddress(result)),
            None => Err(PagingError::InvalidMemoryRange),
        }
    }
}

impl Sub<u64> for VirtualAddress {
    type Output = PagingResult<Self>;

    fn sub(self, rhs: u64) -> Self::Output {
        match self.0.checked_sub(rhs) {
            Some(result) => Ok(VirtualAddress(result)),
            None => Err(PagingError::InvalidMemoryRange),
        }
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct PhysicalAddress(u64);
impl PhysicalAddress {
    pub const fn new(pa: u64) -> Self {
        Self(pa)
    }

    pub fn from_ppn(ppn: u64) -> Self {
        Self(ppn << PAGE_BITS)
    }

    pub fn ppn(&self) -> u64 {
        self.0 >> PAGE_BITS
    }

    pub fn is_page_aligned(&self) -> bool {
        (self.0 & (PAGE_SIZE - 1)) == 0
    }
}

impl From<u64> for PhysicalAddress {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<PhysicalAddress> for u64 {
    fn from(addr: PhysicalAddress) -> Self {
        addr.0
    }
}

impl Display for PhysicalAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "0x{:016X}", self.0)
    }
}

/// Placement of the enclave physical memory (EPM) inside the runtime's address space, as established by the
/// runtime when it sets up the enclave.
///
/// The EPM is mapped linearly: physical `load_pa_start` is visible at `load_start`, and the pool of frames that
/// can hold user pages ends at `freemem_va_start + freemem_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnclaveLayout {
    /// Physical base of the EPM.
    pub load_pa_start: PhysicalAddress,
    /// Kernel virtual address of the EPM base. Also the boundary above which nothing is paged.
    pub load_start: VirtualAddress,
    /// Kernel virtual address of the free memory pool inside the EPM.
    pub freemem_va_start: VirtualAddress,
    /// Size in bytes of the free memory pool.
    pub freemem_size: u64,
}

impl EnclaveLayout {
    /// Layout with the EPM mapped at `EYRIE_LOAD_START`.
    pub fn new(load_pa_start: PhysicalAddress, freemem_va_start: VirtualAddress, freemem_size: u64) -> Self {
        Self { load_pa_start, load_start: VirtualAddress::new(EYRIE_LOAD_START), freemem_va_start, freemem_size }
    }

    /// Kernel virtual address of an EPM physical address.
    pub fn epm_va(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress(pa.0.wrapping_sub(self.load_pa_start.0).wrapping_add(self.load_start.0))
    }

    /// Physical address of an EPM kernel virtual address.
    pub fn epm_pa(&self, va: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress(va.0.wrapping_sub(self.load_start.0).wrapping_add(self.load_pa_start.0))
    }

    /// One past the last EPM kernel virtual address.
    pub fn epm_va_end(&self) -> VirtualAddress {
        VirtualAddress(self.freemem_va_start.0.wrapping_add(self.freemem_size))
    }

    pub fn contains_epm_va(&self, va: VirtualAddress) -> bool {
        va >= self.load_start && va < self.epm_va_end()
    }

    /// Number of frames in the free memory pool.
    pub fn frame_count(&self) -> u64 {
        self.freemem_size >> PAGE_BITS
    }
}
