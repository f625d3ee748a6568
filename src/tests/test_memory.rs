//! Simulated enclave memory, supervisor and page allocator for the paging tests.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
};

use crate::{
    PagingError, PagingResult,
    arch::{EnclaveMemory, PageBuffer, Supervisor},
    fault::{EnclaveContext, FaultTerminator, TrapTable},
    page_allocator::PageAllocator,
    paging::PagingState,
    riscv64::structs::{PageTableEntry, PteFlags},
    structs::{EYRIE_LOAD_START, EnclaveLayout, PAGE_SIZE, PhysicalAddress, VirtualAddress},
};

// Physical layout of the simulated enclave. The root table sits at the base of the EPM, intermediate tables are
// carved from the pages after it and user frames start at FREEMEM_OFFSET.
pub const EPM_PA: u64 = 0x8000_0000;
pub const FREEMEM_OFFSET: u64 = 0x10_0000;
pub const BACKING_PA: u64 = 0x9000_0000;

pub const USER_FLAGS: PteFlags =
    PteFlags::R.union(PteFlags::W).union(PteFlags::U).union(PteFlags::A).union(PteFlags::D);

pub fn frame_pa(frame: u64) -> PhysicalAddress {
    PhysicalAddress::new(EPM_PA + FREEMEM_OFFSET + frame * PAGE_SIZE)
}

pub fn frame_va(frame: u64) -> VirtualAddress {
    VirtualAddress::new(EYRIE_LOAD_START + FREEMEM_OFFSET + frame * PAGE_SIZE)
}

/// Memory keyed by kernel virtual page. Pages that were never written read as zero.
#[derive(Debug, Clone, Default)]
pub struct TestMemory {
    pages: BTreeMap<u64, Box<PageBuffer>>,
    flushes: RefCell<Vec<VirtualAddress>>,
}

impl TestMemory {
    fn split(addr: u64) -> (u64, usize) {
        (addr & !(PAGE_SIZE - 1), (addr & (PAGE_SIZE - 1)) as usize)
    }

    fn page_mut(&mut self, page: u64) -> &mut PageBuffer {
        self.pages.entry(page).or_insert_with(|| Box::new([0; PAGE_SIZE as usize]))
    }

    pub fn fill_page(&mut self, page: VirtualAddress, value: u8) {
        self.write_page(page, &[value; PAGE_SIZE as usize]);
    }

    /// Returns the fill value if every byte of the page is the same.
    pub fn page_fill(&self, page: VirtualAddress) -> Option<u8> {
        let mut buffer = [0; PAGE_SIZE as usize];
        self.read_page(page, &mut buffer);
        buffer.iter().all(|b| *b == buffer[0]).then_some(buffer[0])
    }

    pub fn snapshot(&self) -> BTreeMap<u64, Box<PageBuffer>> {
        self.pages.clone()
    }

    pub fn flushes(&self) -> Vec<VirtualAddress> {
        self.flushes.borrow().clone()
    }
}

impl EnclaveMemory for TestMemory {
    fn read_entry(&self, table: VirtualAddress, index: u64) -> u64 {
        let (page, offset) = Self::split(u64::from(table) + index * 8);
        match self.pages.get(&page) {
            Some(buffer) => u64::from_le_bytes(buffer[offset..offset + 8].try_into().unwrap()),
            None => 0,
        }
    }

    fn write_entry(&mut self, table: VirtualAddress, index: u64, value: u64) {
        let (page, offset) = Self::split(u64::from(table) + index * 8);
        self.page_mut(page)[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn read_page(&self, page: VirtualAddress, buffer: &mut PageBuffer) {
        let (page, offset) = Self::split(page.into());
        assert_eq!(offset, 0, "unaligned page read");
        match self.pages.get(&page) {
            Some(content) => buffer.copy_from_slice(content.as_slice()),
            None => buffer.fill(0),
        }
    }

    fn write_page(&mut self, page: VirtualAddress, buffer: &PageBuffer) {
        let (page, offset) = Self::split(page.into());
        assert_eq!(offset, 0, "unaligned page write");
        self.page_mut(page).copy_from_slice(buffer);
    }

    fn invalidate_tlb(&self, va: VirtualAddress) {
        self.flushes.borrow_mut().push(va);
    }
}

/// Supervisor that replays a fixed list of random values. Running out of values fails the test, so a test that
/// supplies exactly the draws it expects also checks that no extra draw happens.
#[derive(Debug, Default)]
pub struct TestSupervisor {
    randoms: VecDeque<u64>,
    draws: usize,
    region_size: u64,
    region_addr: u64,
}

impl TestSupervisor {
    pub fn new(randoms: &[u64], region_addr: u64, region_size: u64) -> Self {
        Self { randoms: randoms.iter().copied().collect(), draws: 0, region_size, region_addr }
    }

    pub fn draws(&self) -> usize {
        self.draws
    }
}

impl Supervisor for TestSupervisor {
    fn random(&mut self) -> u64 {
        self.draws += 1;
        self.randoms.pop_front().expect("unexpected random draw")
    }

    fn query_multimem_size(&mut self) -> u64 {
        self.region_size
    }

    fn query_multimem_addr(&mut self) -> u64 {
        self.region_addr
    }
}

/// Bump allocator over the EPM pages between the root table and the user frames.
#[derive(Debug)]
pub struct TestPageAllocator {
    next: u64,
    end: u64,
}

impl Default for TestPageAllocator {
    fn default() -> Self {
        Self { next: EPM_PA + PAGE_SIZE, end: EPM_PA + FREEMEM_OFFSET }
    }
}

impl TestPageAllocator {
    pub fn pages_allocated(&self) -> u64 {
        (self.next - EPM_PA - PAGE_SIZE) / PAGE_SIZE
    }
}

impl PageAllocator for TestPageAllocator {
    fn allocate_page(&mut self) -> PagingResult<PhysicalAddress> {
        if self.next >= self.end {
            return Err(PagingError::OutOfResources);
        }

        let page = PhysicalAddress::new(self.next);
        self.next += PAGE_SIZE;
        Ok(page)
    }
}

/// Records every termination instead of tearing anything down.
#[derive(Debug, Default)]
pub struct RecordingTerminator {
    pub errors: Vec<PagingError>,
}

impl FaultTerminator for RecordingTerminator {
    fn terminate(&mut self, _ctx: &mut EnclaveContext, error: PagingError) {
        self.errors.push(error);
    }
}

pub fn noop_handler(_ctx: &mut EnclaveContext) {}

pub struct Fixture {
    pub state: PagingState<TestMemory, TestSupervisor>,
    pub allocator: TestPageAllocator,
    pub trap_table: TrapTable,
}

impl Fixture {
    /// An enclave with `frames` user frames and, if `backing_pages` is not zero, paging enabled over a backing store
    /// of that many pages. `randoms` are the values the supervisor will hand out, in order.
    pub fn new(frames: u64, backing_pages: u64, randoms: &[u64]) -> Self {
        Self::with_backing_size(frames, backing_pages * PAGE_SIZE, randoms)
    }

    /// Like `new`, with the backing store size given in bytes.
    pub fn with_backing_size(frames: u64, backing_size: u64, randoms: &[u64]) -> Self {
        let layout = EnclaveLayout::new(
            PhysicalAddress::new(EPM_PA),
            VirtualAddress::new(EYRIE_LOAD_START + FREEMEM_OFFSET),
            frames * PAGE_SIZE,
        );
        let supervisor = TestSupervisor::new(randoms, BACKING_PA, backing_size);
        let state = PagingState::new(TestMemory::default(), supervisor, layout, PhysicalAddress::new(EPM_PA)).unwrap();

        let mut fixture = Self { state, allocator: TestPageAllocator::default(), trap_table: TrapTable::new() };
        if backing_size > 0 {
            let enabled =
                fixture.state.init_paging(&mut fixture.allocator, &mut fixture.trap_table, noop_handler).unwrap();
            assert!(enabled);
        }
        fixture
    }

    /// Maps user page `va` to user frame `frame` and fills the frame with `fill`.
    pub fn map_user(&mut self, va: u64, frame: u64, fill: u8) {
        self.state.map_pages(VirtualAddress::new(va), frame_pa(frame), 1, USER_FLAGS, &mut self.allocator).unwrap();
        self.state.memory_mut().fill_page(frame_va(frame), fill);
    }

    /// Creates user page `va` as already swapped out to a freshly allocated slot holding `fill`.
    pub fn map_swapped(&mut self, va: u64, fill: u8) -> PhysicalAddress {
        let va = VirtualAddress::new(va);
        // map first so the intermediate tables exist, then turn the leaf into a swapped entry
        self.state.map_pages(va, frame_pa(0), 1, USER_FLAGS, &mut self.allocator).unwrap();
        let slot = self.state.backing_mut().unwrap().allocate_backing_slot().unwrap();
        let location = self.state.pte_of_va(va).unwrap();
        self.state.write_pte(location, PageTableEntry::Swapped { slot, flags: USER_FLAGS });

        let slot_va = self.state.backing_store().unwrap().va_of(slot);
        self.state.memory_mut().fill_page(slot_va, fill);
        slot
    }

    pub fn entry(&self, va: u64) -> PageTableEntry {
        let location = self.state.pte_of_va(VirtualAddress::new(va)).unwrap();
        self.state.read_pte(location)
    }

    /// The fill value of user page `va`, wherever its content currently lives.
    pub fn content(&self, va: u64) -> Option<u8> {
        let page = match self.entry(va) {
            PageTableEntry::Resident { frame, .. } => self.state.layout().epm_va(frame),
            PageTableEntry::Swapped { slot, .. } => self.state.backing_store().unwrap().va_of(slot),
            PageTableEntry::Unmapped => return None,
        };
        self.state.memory().page_fill(page)
    }

    pub fn fault(&mut self, va: u64) -> PagingResult<()> {
        let ctx = EnclaveContext::fault(crate::fault::RISCV_EXCP_LOAD_PAGE_FAULT, va);
        self.state.handle_page_fault(&ctx)
    }
}
