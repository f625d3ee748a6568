//! Paging state and setup: owns the page table root, the enclave layout and the backing store, maps the backing
//! store into the runtime's address space and hooks the fault handler into the trap table.
//!
//! The page table walker, victim selector, swap engine and fault handler extend `PagingState` from their own
//! modules.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use crate::{
    PagingError, PagingResult,
    arch::{EnclaveMemory, Supervisor},
    backing_store::BackingStore,
    fault::{TrapHandler, TrapTable},
    page_allocator::PageAllocator,
    riscv64::structs::{PageTableEntry, PteFlags},
    structs::{EYRIE_PAGING_START, EnclaveLayout, PAGE_BITS, PAGE_SIZE, PageLevel, PhysicalAddress, VirtualAddress},
    walker::PteLocation,
};

/// Everything the pager mutates, owned in one place. There is a single hart and the fault path runs to completion,
/// so every operation takes `&mut self` and nothing else can observe a half-updated table.
#[derive(Debug)]
pub struct PagingState<M: EnclaveMemory, S: Supervisor> {
    pub(crate) memory: M,
    pub(crate) supervisor: S,
    pub(crate) layout: EnclaveLayout,
    /// Physical address of the root (level 3) page table.
    pub(crate) root: PhysicalAddress,
    /// `None` while paging is disabled.
    pub(crate) backing: Option<BackingStore>,
}

impl<M: EnclaveMemory, S: Supervisor> PagingState<M, S> {
    /// Creates a pager over an existing address space. Paging stays disabled until `init_paging` finds a backing
    /// store.
    pub fn new(memory: M, supervisor: S, layout: EnclaveLayout, root: PhysicalAddress) -> PagingResult<Self> {
        if !root.is_page_aligned() {
            log::error!("Page table root {root} is not page aligned");
            return Err(PagingError::UnalignedAddress);
        }

        Ok(Self { memory, supervisor, layout, root, backing: None })
    }

    /// Queries the supervisor for a backing store, maps it at `EYRIE_PAGING_START` and installs `handler` for
    /// instruction, load and store page faults.
    ///
    /// ## Returns
    /// * `Ok(true)` if paging is enabled
    /// * `Ok(false)` if there is no backing store. This is a valid configuration for enclaves that never need to
    ///   swap, the fault handler is not installed.
    ///
    /// ## Errors
    /// * Returns `Err(PagingError)` if the backing store could not be mapped
    pub fn init_paging<A: PageAllocator>(
        &mut self,
        allocator: &mut A,
        trap_table: &mut TrapTable,
        handler: TrapHandler,
    ) -> PagingResult<bool> {
        let size = self.supervisor.query_multimem_size();
        if size == 0 {
            log::warn!("no backing store found");
            return Ok(false);
        }

        let addr = self.supervisor.query_multimem_addr();
        if addr == 0 {
            log::warn!("address is zero");
            return Ok(false);
        }

        let pa_start = PhysicalAddress::new(addr);
        if !pa_start.is_page_aligned() {
            log::error!("Backing store at {pa_start} is not page aligned");
            return Err(PagingError::UnalignedAddress);
        }

        // no execute permission on swapped content
        self.map_pages(
            VirtualAddress::new(EYRIE_PAGING_START),
            pa_start,
            size >> PAGE_BITS,
            PteFlags::R | PteFlags::W | PteFlags::D | PteFlags::A,
            allocator,
        )?;

        let store = BackingStore::new(pa_start, size);
        log::info!(
            "Paging enabled: backing store {} ({} slots) mapped at {}",
            store.pa_start(),
            store.remaining_slots(),
            store.va_start()
        );
        self.backing = Some(store);

        trap_table.register_page_fault_handler(handler);

        Ok(true)
    }

    /// Maps `count` pages starting at `va` to the physical pages starting at `pa`, creating intermediate tables
    /// from `allocator` as needed. Existing level 1 entries are overwritten.
    ///
    /// ## Errors
    /// * `UnalignedAddress` if either address is not page aligned
    /// * `InvalidMemoryRange` if the range is not canonical or runs into a superpage
    /// * Any error from `allocator`
    pub fn map_pages<A: PageAllocator>(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        count: u64,
        flags: PteFlags,
        allocator: &mut A,
    ) -> PagingResult<()> {
        if !va.is_page_aligned() || !pa.is_page_aligned() {
            return Err(PagingError::UnalignedAddress);
        }

        for i in 0..count {
            let page_va = (va + i * PAGE_SIZE)?;
            if !page_va.is_canonical() {
                log::error!("Failed to map {page_va} as it is not a canonical Sv39 address");
                return Err(PagingError::InvalidMemoryRange);
            }

            let location = self.walk_create(page_va, allocator)?;
            let frame = PhysicalAddress::new(u64::from(pa) + i * PAGE_SIZE);
            self.write_pte(location, PageTableEntry::Resident { frame, flags });
            self.memory.invalidate_tlb(page_va);
        }

        Ok(())
    }

    /// Walks to the level 1 entry for `va`, allocating and linking missing tables on the way down.
    fn walk_create<A: PageAllocator>(&mut self, va: VirtualAddress, allocator: &mut A) -> PagingResult<PteLocation> {
        let mut table = self.root;
        let mut level = PageLevel::root_level();

        while let Some(next_level) = level.next_level() {
            let location = PteLocation { table: self.table_va(table), index: va.get_index(level), level };

            table = match self.read_pte(location) {
                PageTableEntry::Resident { flags, .. } if flags.is_leaf() => {
                    log::error!("Failed to map {va} as it falls inside a {level:?} superpage");
                    return Err(PagingError::InvalidMemoryRange);
                }
                PageTableEntry::Resident { frame, .. } => frame,
                _ => {
                    let new_table = allocator.allocate_page()?;
                    if !new_table.is_page_aligned() {
                        return Err(PagingError::UnalignedAddress);
                    }

                    // The allocator does not promise zeroed pages; stale bytes would read as live entries.
                    self.memory.zero_page(self.table_va(new_table));

                    // non-leaf entries only carry V, the leaf decides the permissions
                    self.write_pte(location, PageTableEntry::Resident { frame: new_table, flags: PteFlags::V });
                    new_table
                }
            };
            level = next_level;
        }

        Ok(PteLocation { table: self.table_va(table), index: va.get_index(level), level })
    }

    /// Logs every leaf in the table with its decoded entry.
    pub fn dump_page_tables(&self) {
        log::info!("Page table root {}", self.root);
        log::info!("va                 | size | entry");
        let mut leaves = 0u64;
        let _ = self.visit_leaves::<(), _>(|va, location, entry| {
            log::info!("{va} | {:<4} | {entry:?}", level_size_name(location.level));
            leaves += 1;
            core::ops::ControlFlow::Continue(())
        });
        log::info!("{leaves} leaves");
    }

    pub fn is_enabled(&self) -> bool {
        self.backing.is_some()
    }

    pub fn layout(&self) -> &EnclaveLayout {
        &self.layout
    }

    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    pub fn backing_store(&self) -> Option<&BackingStore> {
        self.backing.as_ref()
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    pub fn supervisor(&self) -> &S {
        &self.supervisor
    }

    pub(crate) fn backing_mut(&mut self) -> PagingResult<&mut BackingStore> {
        self.backing.as_mut().ok_or(PagingError::PagingDisabled)
    }

    pub(crate) fn backing_ref(&self) -> PagingResult<&BackingStore> {
        self.backing.as_ref().ok_or(PagingError::PagingDisabled)
    }
}

fn level_size_name(level: PageLevel) -> &'static str {
    match level {
        PageLevel::Level3 => "1GB",
        PageLevel::Level2 => "2MB",
        PageLevel::Level1 => "4KB",
    }
}
