//! Sv39 page table walker.
//!
//! Two kinds of walk are supported: a point lookup that finds the entry mapping one virtual address, and a full
//! depth-first traversal over every leaf, used to pick the Nth resident user page for eviction.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::ops::ControlFlow;

use crate::{
    arch::{EnclaveMemory, Supervisor},
    paging::PagingState,
    riscv64::structs::PageTableEntry,
    structs::{MAX_ENTRIES, PT_INDEX_BITS, PageLevel, PhysicalAddress, VirtualAddress},
};

/// Where an entry lives: entry `index` of the table mapped at kernel address `table`, which sits at `level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteLocation {
    pub table: VirtualAddress,
    pub index: u64,
    pub level: PageLevel,
}

/// Reconstructs the canonical virtual address of entry `index` in a table at `level`, given the virtual page number
/// bits accumulated by the tables above it. Entries in the upper half of the root table come out sign-extended.
pub fn entry_va(prefix: u64, index: u64, level: PageLevel) -> VirtualAddress {
    VirtualAddress::canonical(((prefix << PT_INDEX_BITS) | index) << level.start_bit())
}

impl<M: EnclaveMemory, S: Supervisor> PagingState<M, S> {
    /// Kernel address of a page table page. Tables always live in the EPM.
    pub(crate) fn table_va(&self, table: PhysicalAddress) -> VirtualAddress {
        self.layout.epm_va(table)
    }

    pub fn read_pte(&self, location: PteLocation) -> PageTableEntry {
        PageTableEntry::decode(self.memory.read_entry(location.table, location.index))
    }

    pub(crate) fn write_pte(&mut self, location: PteLocation, entry: PageTableEntry) {
        self.memory.write_entry(location.table, location.index, entry.encode());
    }

    /// Finds the entry that maps `va`.
    ///
    /// The walk only follows valid intermediate entries. The level 1 entry is returned whatever its state, so a
    /// swapped out or never mapped page still yields a location. A valid leaf above level 1 (superpage) is returned
    /// as is.
    ///
    /// ## Returns
    /// * `None` if `va` is not canonical or an intermediate table is missing
    pub fn pte_of_va(&self, va: VirtualAddress) -> Option<PteLocation> {
        if !va.is_canonical() {
            return None;
        }

        let mut table = self.root;
        let mut level = PageLevel::root_level();

        loop {
            let location = PteLocation { table: self.table_va(table), index: va.get_index(level), level };
            let next_level = match level.next_level() {
                Some(next_level) => next_level,
                None => return Some(location),
            };

            match self.read_pte(location) {
                PageTableEntry::Resident { flags, .. } if flags.is_leaf() => return Some(location),
                PageTableEntry::Resident { frame, .. } => {
                    table = frame;
                    level = next_level;
                }
                _ => return None,
            }
        }
    }

    /// Visits every leaf of the page table in ascending address order. Zero entries are skipped; an entry is a leaf
    /// when it sits at level 1 or has any of R/W/X set. `f` can stop the walk early by returning `Break`.
    pub fn visit_leaves<B, F>(&self, mut f: F) -> ControlFlow<B>
    where
        F: FnMut(VirtualAddress, PteLocation, PageTableEntry) -> ControlFlow<B>,
    {
        self.visit_leaves_internal(PageLevel::root_level(), self.root, 0, &mut f)
    }

    fn visit_leaves_internal<B, F>(
        &self,
        level: PageLevel,
        table: PhysicalAddress,
        prefix: u64,
        f: &mut F,
    ) -> ControlFlow<B>
    where
        F: FnMut(VirtualAddress, PteLocation, PageTableEntry) -> ControlFlow<B>,
    {
        let table_va = self.table_va(table);

        for index in 0..MAX_ENTRIES {
            let raw = self.memory.read_entry(table_va, index);
            if raw == 0 {
                continue;
            }

            let location = PteLocation { table: table_va, index, level };
            let entry = PageTableEntry::decode(raw);

            if level.is_lowest_level() || entry.flags().is_leaf() {
                if let ControlFlow::Break(value) = f(entry_va(prefix, index, level), location, entry) {
                    return ControlFlow::Break(value);
                }
                continue;
            }

            // Only valid entries point at a next level table. Anything else this high up is not a mapping.
            if let (PageTableEntry::Resident { frame, .. }, Some(next_level)) = (entry, level.next_level()) {
                let next_prefix = (prefix << PT_INDEX_BITS) | index;
                if let ControlFlow::Break(value) = self.visit_leaves_internal(next_level, frame, next_prefix, f) {
                    return ControlFlow::Break(value);
                }
            }
        }

        ControlFlow::Continue(())
    }

    /// Returns the virtual address of the `count`th valid user leaf in traversal order, counting from 1.
    ///
    /// The count carries across subtrees, so the result depends only on the table contents and `count`.
    pub fn pick_nth_user_leaf(&self, count: u64) -> Option<VirtualAddress> {
        if count == 0 {
            return None;
        }

        let mut remaining = count;
        let result = self.visit_leaves(|va, _, entry| {
            if entry.is_user_resident() {
                remaining -= 1;
                if remaining == 0 {
                    return ControlFlow::Break(va);
                }
            }
            ControlFlow::Continue(())
        });

        match result {
            ControlFlow::Break(va) => Some(va),
            ControlFlow::Continue(()) => None,
        }
    }
}
