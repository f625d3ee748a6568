//! Page fault handling and the trap table slots it is installed into.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::fmt;

use crate::{
    PagingError, PagingResult,
    arch::{EnclaveMemory, Supervisor},
    paging::PagingState,
    riscv64::structs::PageTableEntry,
    structs::VirtualAddress,
};

// scause values for the faults paging resolves.
pub const RISCV_EXCP_INST_PAGE_FAULT: u64 = 12;
pub const RISCV_EXCP_LOAD_PAGE_FAULT: u64 = 13;
pub const RISCV_EXCP_STORE_PAGE_FAULT: u64 = 15;

/// Number of synchronous exception causes the trap table covers.
pub const TRAP_TABLE_SIZE: usize = 16;

/// Register state saved by the runtime's trap entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnclaveContext {
    /// General purpose registers. Slot 0 holds `sepc` since `x0` is hardwired to zero.
    pub regs: [u64; 32],
    pub sstatus: u64,
    /// Faulting virtual address.
    pub sbadaddr: u64,
    pub scause: u64,
}

impl EnclaveContext {
    pub fn fault(scause: u64, sbadaddr: u64) -> Self {
        Self { scause, sbadaddr, ..Default::default() }
    }

    pub fn sepc(&self) -> u64 {
        self.regs[0]
    }

    pub fn fault_address(&self) -> VirtualAddress {
        VirtualAddress::new(self.sbadaddr)
    }
}

pub type TrapHandler = fn(&mut EnclaveContext);

/// Exception vector: one optional handler per `scause` value.
#[derive(Clone, Copy, Default)]
pub struct TrapTable {
    handlers: [Option<TrapHandler>; TRAP_TABLE_SIZE],
}

impl TrapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self, cause: u64) -> Option<TrapHandler> {
        self.handlers.get(cause as usize).copied().flatten()
    }

    /// Installs `handler` for instruction, load and store page faults.
    pub fn register_page_fault_handler(&mut self, handler: TrapHandler) {
        for cause in [RISCV_EXCP_INST_PAGE_FAULT, RISCV_EXCP_LOAD_PAGE_FAULT, RISCV_EXCP_STORE_PAGE_FAULT] {
            self.handlers[cause as usize] = Some(handler);
        }
    }

    /// Runs the handler registered for `ctx.scause`. Returns `false` if there is none.
    pub fn dispatch(&self, ctx: &mut EnclaveContext) -> bool {
        match self.handler(ctx.scause) {
            Some(handler) => {
                handler(ctx);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for TrapTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let causes = self.handlers.iter().enumerate().filter(|(_, handler)| handler.is_some()).map(|(cause, _)| cause);
        f.debug_set().entries(causes).finish()
    }
}

/// The runtime's way out for a fault paging cannot resolve.
pub trait FaultTerminator {
    fn terminate(&mut self, ctx: &mut EnclaveContext, error: PagingError);
}

impl<M: EnclaveMemory, S: Supervisor> PagingState<M, S> {
    /// Brings the page behind a faulting address back into memory.
    ///
    /// Everything about the faulting entry is checked before anything is touched. The content comes back through a
    /// single rotation: a victim is evicted into the faulting page's own slot while the slot's content moves into the
    /// victim's frame, so no new backing slot is consumed.
    ///
    /// ## Errors
    /// * `AddressAboveLoadBoundary` if the address belongs to the runtime
    /// * `NoMapping` if no entry covers the address
    /// * `EntryAlreadyValid` if the entry is already resident
    /// * `MissingBackingPointer` if the entry does not point into the backing store
    /// * `BackingPointerOutOfRange` if it points outside of it
    /// * Any error from `evict_and_free_one`
    pub fn handle_page_fault(&mut self, ctx: &EnclaveContext) -> PagingResult<()> {
        let addr = ctx.fault_address();

        if addr >= self.layout.load_start {
            log::error!("Page fault at {addr} is in the runtime's address range");
            return Err(PagingError::AddressAboveLoadBoundary);
        }

        let location = match self.pte_of_va(addr) {
            Some(location) => location,
            None => {
                log::error!("Page fault at {addr} has no page table entry");
                return Err(PagingError::NoMapping);
            }
        };

        let (slot, flags) = match self.read_pte(location) {
            PageTableEntry::Swapped { slot, flags } => (slot, flags),
            PageTableEntry::Resident { .. } => {
                log::error!("Page fault at {addr} on a valid entry");
                return Err(PagingError::EntryAlreadyValid);
            }
            PageTableEntry::Unmapped => {
                log::error!("Page fault at {addr} with no backing pointer");
                return Err(PagingError::MissingBackingPointer);
            }
        };

        if !self.backing_ref()?.contains(slot) {
            log::error!("Page fault at {addr} points at {slot}, outside the backing store");
            return Err(PagingError::BackingPointerOutOfRange);
        }

        let frame = self.evict_and_free_one(Some(slot))?;

        self.write_pte(location, PageTableEntry::Resident { frame, flags });
        self.memory.invalidate_tlb(addr.page_base());

        log::debug!("Swapped {addr} in from slot {slot} to frame {frame}");
        Ok(())
    }
}

/// Trap entry for page faults. Anything `handle_page_fault` cannot resolve is fatal and is handed to `terminator`.
pub fn paging_handle_page_fault<M, S, T>(state: &mut PagingState<M, S>, ctx: &mut EnclaveContext, terminator: &mut T)
where
    M: EnclaveMemory,
    S: Supervisor,
    T: FaultTerminator,
{
    if let Err(error) = state.handle_page_fault(ctx) {
        log::warn!("fatal paging failure");
        terminator.terminate(ctx, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark_handled(ctx: &mut EnclaveContext) {
        ctx.regs[10] = 0xAA;
    }

    #[test]
    fn test_page_fault_handler_slots() {
        let mut table = TrapTable::new();
        table.register_page_fault_handler(mark_handled);

        for cause in 0..TRAP_TABLE_SIZE as u64 {
            let expected = matches!(cause, 12 | 13 | 15);
            assert_eq!(table.handler(cause).is_some(), expected, "cause {cause}");
        }
    }

    #[test]
    fn test_dispatch() {
        let mut table = TrapTable::new();
        table.register_page_fault_handler(mark_handled);

        let mut ctx = EnclaveContext::fault(RISCV_EXCP_STORE_PAGE_FAULT, 0x1000);
        assert!(table.dispatch(&mut ctx));
        assert_eq!(ctx.regs[10], 0xAA);

        // breakpoint has no handler
        let mut ctx = EnclaveContext::fault(3, 0x1000);
        assert!(!table.dispatch(&mut ctx));
        assert_eq!(ctx.regs[10], 0);

        // causes past the table have no slot
        let mut ctx = EnclaveContext::fault(64, 0x1000);
        assert!(!table.dispatch(&mut ctx));
    }
}
