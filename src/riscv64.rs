//! RISC-V backend: reaches memory through the runtime's kernel mappings and talks to the Keystone security monitor.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
mod sbi;
pub mod structs;

pub use sbi::Sbi;

#[allow(unused_imports)]
use core::arch::asm;

use crate::{
    arch::{EnclaveMemory, PageBuffer},
    structs::{PAGE_SIZE, VirtualAddress},
};

/// `EnclaveMemory` over raw pointers. Every address is dereferenced as is, so this only works from inside the
/// runtime, where the EPM and the backing store are mapped at the addresses the pager computes.
#[derive(Debug)]
pub struct DirectMappedMemory {
    _private: (),
}

impl DirectMappedMemory {
    /// # Safety
    ///
    /// The caller must guarantee that the EPM linear map and, once paging is enabled, the backing store mapping at
    /// `EYRIE_PAGING_START` are live for as long as this value is used.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl EnclaveMemory for DirectMappedMemory {
    fn read_entry(&self, table: VirtualAddress, index: u64) -> u64 {
        let entry = (u64::from(table) + index * 8) as *const u64;
        // SAFETY: tables are mapped per the contract of `new`.
        unsafe { entry.read_volatile() }
    }

    fn write_entry(&mut self, table: VirtualAddress, index: u64, value: u64) {
        let entry = (u64::from(table) + index * 8) as *mut u64;
        // SAFETY: tables are mapped per the contract of `new`.
        unsafe { entry.write_volatile(value) }
    }

    fn read_page(&self, page: VirtualAddress, buffer: &mut PageBuffer) {
        let src = u64::from(page) as *const u8;
        // SAFETY: the page is mapped per the contract of `new` and cannot overlap the caller's buffer.
        unsafe { core::ptr::copy_nonoverlapping(src, buffer.as_mut_ptr(), PAGE_SIZE as usize) }
    }

    fn write_page(&mut self, page: VirtualAddress, buffer: &PageBuffer) {
        let dst = u64::from(page) as *mut u8;
        // SAFETY: the page is mapped per the contract of `new` and cannot overlap the caller's buffer.
        unsafe { core::ptr::copy_nonoverlapping(buffer.as_ptr(), dst, PAGE_SIZE as usize) }
    }

    fn invalidate_tlb(&self, _va: VirtualAddress) {
        #[cfg(all(not(test), target_arch = "riscv64"))]
        unsafe {
            asm!("sfence.vma {}, zero", in(reg) u64::from(_va), options(nostack, preserves_flags));
        }
    }
}
