//! Seams between the paging engine and the platform: how memory is reached and what the security monitor
//! provides.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use crate::structs::{PAGE_SIZE, VirtualAddress};

/// One page worth of bytes.
pub type PageBuffer = [u8; PAGE_SIZE as usize];

/// Access to memory through the runtime's kernel mappings.
///
/// Every address handed to these methods is a kernel virtual address: page tables and EPM frames are reached through
/// the EPM linear map and backing store slots through the mapping at `EYRIE_PAGING_START`. Callers validate ranges
/// before calling in; implementations only move bytes.
pub trait EnclaveMemory {
    /// Reads entry `index` of the page table at `table`.
    fn read_entry(&self, table: VirtualAddress, index: u64) -> u64;

    /// Writes entry `index` of the page table at `table`.
    fn write_entry(&mut self, table: VirtualAddress, index: u64, value: u64);

    fn read_page(&self, page: VirtualAddress, buffer: &mut PageBuffer);

    fn write_page(&mut self, page: VirtualAddress, buffer: &PageBuffer);

    fn zero_page(&mut self, page: VirtualAddress) {
        self.write_page(page, &[0; PAGE_SIZE as usize]);
    }

    /// Drops any cached translation for `va` after its entry changed.
    fn invalidate_tlb(&self, va: VirtualAddress);
}

/// The subset of the security monitor interface consumed by paging.
pub trait Supervisor {
    /// Draws a random value from the monitor's trusted source. Zero is never a legitimate result.
    fn random(&mut self) -> u64;

    /// Size in bytes of the backing memory region, zero if none was provided.
    fn query_multimem_size(&mut self) -> u64;

    /// Physical base address of the backing memory region, zero if none was provided.
    fn query_multimem_addr(&mut self) -> u64;
}
