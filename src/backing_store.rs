//! Bump allocator over the host-provided backing store.
//!
//! Slots are handed out one page at a time and never returned. Once a page has been swapped in, its old slot is
//! only reused because the victim evicted to make room is written into it, never through this allocator.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use crate::structs::{EYRIE_PAGING_START, PAGE_SIZE, PhysicalAddress, VirtualAddress};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingStore {
    /// Physical base of the region.
    pa_start: PhysicalAddress,
    /// Kernel virtual address the region is mapped at.
    va_start: VirtualAddress,
    size: u64,
    next_offset: u64,
}

impl BackingStore {
    /// Backing store of `size` bytes at physical `pa_start`, mapped at `EYRIE_PAGING_START`.
    pub fn new(pa_start: PhysicalAddress, size: u64) -> Self {
        Self::with_mapping(pa_start, VirtualAddress::new(EYRIE_PAGING_START), size)
    }

    pub fn with_mapping(pa_start: PhysicalAddress, va_start: VirtualAddress, size: u64) -> Self {
        Self { pa_start, va_start, size, next_offset: 0 }
    }

    /// Hands out the next free slot, or `None` once the region is used up.
    pub fn allocate_backing_slot(&mut self) -> Option<PhysicalAddress> {
        if self.next_offset >= self.size {
            log::warn!("Backing store exhausted at offset {:#x} of {:#x}", self.next_offset, self.size);
            return None;
        }

        // a size that is not a page multiple leaves a partial tail page that cannot hold a slot
        if self.size - self.next_offset < PAGE_SIZE {
            log::warn!("Backing store has only a partial page left at offset {:#x}", self.next_offset);
            return None;
        }

        let slot = PhysicalAddress::new(u64::from(self.pa_start) + self.next_offset);
        if !slot.is_page_aligned() {
            log::error!("Backing store slot {slot} is not page aligned");
            return None;
        }

        self.next_offset += PAGE_SIZE;
        Some(slot)
    }

    /// Whether `pa` falls inside one of the whole pages of the region. A partial tail page is never mapped and
    /// never holds a slot, so it is outside.
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        let pa = u64::from(pa);
        let start = u64::from(self.pa_start);
        pa >= start && pa - start < self.usable_size()
    }

    pub fn contains_va(&self, va: VirtualAddress) -> bool {
        let va = u64::from(va);
        let start = u64::from(self.va_start);
        va >= start && va - start < self.usable_size()
    }

    fn usable_size(&self) -> u64 {
        self.size & !(PAGE_SIZE - 1)
    }

    /// Kernel virtual address of a backing store physical address.
    pub fn va_of(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(u64::from(pa).wrapping_sub(self.pa_start.into()).wrapping_add(self.va_start.into()))
    }

    /// Physical address of a backing store kernel virtual address.
    pub fn pa_of(&self, va: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress::new(u64::from(va).wrapping_sub(self.va_start.into()).wrapping_add(self.pa_start.into()))
    }

    pub fn pa_start(&self) -> PhysicalAddress {
        self.pa_start
    }

    pub fn va_start(&self) -> VirtualAddress {
        self.va_start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn remaining_slots(&self) -> u64 {
        self.size.saturating_sub(self.next_offset) / PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STORE_PA: u64 = 0x9000_0000;

    #[test]
    fn test_allocate_is_monotonic_until_exhausted() {
        let mut store = BackingStore::new(PhysicalAddress::new(STORE_PA), 4 * PAGE_SIZE);
        let mut previous: Option<u64> = None;

        for i in 0..4 {
            let slot = u64::from(store.allocate_backing_slot().unwrap());
            assert_eq!(slot, STORE_PA + i * PAGE_SIZE);
            assert_eq!(slot % PAGE_SIZE, 0);
            if let Some(prev) = previous {
                assert!(slot >= prev + PAGE_SIZE);
            }
            previous = Some(slot);
        }

        assert_eq!(store.remaining_slots(), 0);
        assert_eq!(store.allocate_backing_slot(), None);
        // stays exhausted, and the offset does not move
        assert_eq!(store.allocate_backing_slot(), None);
        assert_eq!(store.next_offset(), 4 * PAGE_SIZE);
    }

    #[test]
    fn test_partial_tail_page_is_not_handed_out() {
        let mut store = BackingStore::new(PhysicalAddress::new(STORE_PA), PAGE_SIZE + 0x800);
        assert_eq!(store.allocate_backing_slot(), Some(PhysicalAddress::new(STORE_PA)));
        assert_eq!(store.allocate_backing_slot(), None);

        // the tail is not mapped, so nothing in it counts as part of the store
        let tail = PhysicalAddress::new(STORE_PA + PAGE_SIZE);
        assert!(store.contains(PhysicalAddress::new(STORE_PA + PAGE_SIZE - 1)));
        assert!(!store.contains(tail));
        assert!(!store.contains(PhysicalAddress::new(STORE_PA + PAGE_SIZE + 0x7FF)));
        assert!(!store.contains_va(store.va_of(tail)));
    }

    #[test]
    fn test_zero_sized_store_never_allocates() {
        let mut store = BackingStore::new(PhysicalAddress::new(STORE_PA), 0);
        assert_eq!(store.allocate_backing_slot(), None);
        assert!(!store.contains(PhysicalAddress::new(STORE_PA)));
    }

    #[test]
    fn test_contains_and_translation() {
        let store = BackingStore::new(PhysicalAddress::new(STORE_PA), 2 * PAGE_SIZE);

        assert!(store.contains(PhysicalAddress::new(STORE_PA)));
        assert!(store.contains(PhysicalAddress::new(STORE_PA + 2 * PAGE_SIZE - 1)));
        assert!(!store.contains(PhysicalAddress::new(STORE_PA + 2 * PAGE_SIZE)));
        assert!(!store.contains(PhysicalAddress::new(STORE_PA - 1)));

        let va = store.va_of(PhysicalAddress::new(STORE_PA + PAGE_SIZE));
        assert_eq!(va, VirtualAddress::new(EYRIE_PAGING_START + PAGE_SIZE));
        assert!(store.contains_va(va));
        assert_eq!(store.pa_of(va), PhysicalAddress::new(STORE_PA + PAGE_SIZE));
        assert!(!store.contains_va(store.va_of(PhysicalAddress::new(0))));
    }
}
