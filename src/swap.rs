//! Swap engine: moves page content between enclave frames and backing store slots.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use crate::{
    PagingError, PagingResult,
    arch::{EnclaveMemory, PageBuffer, Supervisor},
    paging::PagingState,
    riscv64::structs::PageTableEntry,
    structs::{PAGE_SIZE, PageLevel, PhysicalAddress, VirtualAddress},
};

impl<M: EnclaveMemory, S: Supervisor> PagingState<M, S> {
    /// Writes the content of `epm_page` to `back_page`. When `swap_page` is given, its previous content is moved
    /// into `epm_page` in the same step, so the frame and the slot trade places.
    ///
    /// All addresses are kernel virtual addresses. Every check runs before the first byte moves.
    ///
    /// ## Errors
    /// * `EpmPageOutOfRange` if `epm_page` is outside the enclave physical memory
    /// * `BackingPointerOutOfRange` if `back_page` is outside the backing store
    /// * `EncryptionUnsupported` if `encrypt` is set
    /// * `SwapSlotMismatch` if `swap_page` is given but is not `back_page`
    /// * `UnalignedAddress` if either page is not page aligned
    pub fn swap_page(
        &mut self,
        back_page: VirtualAddress,
        epm_page: VirtualAddress,
        swap_page: Option<VirtualAddress>,
        encrypt: bool,
    ) -> PagingResult<()> {
        if !self.layout.contains_epm_va(epm_page) {
            log::error!("Swap source {epm_page} is outside the enclave memory");
            return Err(PagingError::EpmPageOutOfRange);
        }

        if !self.backing_ref()?.contains_va(back_page) {
            log::error!("Swap destination {back_page} is outside the backing store");
            return Err(PagingError::BackingPointerOutOfRange);
        }

        if encrypt {
            log::error!("Encrypted swap is not supported");
            return Err(PagingError::EncryptionUnsupported);
        }

        if swap_page.is_some_and(|page| page != back_page) {
            log::error!("Incoming page {swap_page:?} is not the destination slot {back_page}");
            return Err(PagingError::SwapSlotMismatch);
        }

        if !back_page.is_page_aligned() || !epm_page.is_page_aligned() {
            return Err(PagingError::UnalignedAddress);
        }

        let mut incoming: PageBuffer = [0; PAGE_SIZE as usize];
        if let Some(page) = swap_page {
            self.memory.read_page(page, &mut incoming);
        }

        let mut outgoing: PageBuffer = [0; PAGE_SIZE as usize];
        self.memory.read_page(epm_page, &mut outgoing);
        self.memory.write_page(back_page, &outgoing);

        if swap_page.is_some() {
            self.memory.write_page(epm_page, &incoming);
        }

        Ok(())
    }

    /// Evicts one resident user page and returns the frame it occupied.
    ///
    /// With `swap_slot`, the victim is written into that slot and the slot's previous content lands in the freed
    /// frame. This is how the fault path brings a page back in without consuming a new slot. Without it, a fresh
    /// slot is taken from the backing store and the returned frame keeps the victim's stale bytes.
    ///
    /// The victim's entry becomes a swapped entry pointing at the slot, with its permission bits kept.
    ///
    /// ## Errors
    /// * `NoVictimPage` if no victim could be picked
    /// * `AddressAboveLoadBoundary` if the victim belongs to the runtime
    /// * `EpmPageOutOfRange` if the victim's frame is outside the enclave memory
    /// * `BackingStoreExhausted` if no slot was given and the backing store is full
    /// * `UnsupportedVictimLevel` if the victim is mapped by a superpage
    /// * Any error from `pick_victim_page` or `swap_page`
    pub fn evict_and_free_one(&mut self, swap_slot: Option<PhysicalAddress>) -> PagingResult<PhysicalAddress> {
        let victim = match self.pick_victim_page()? {
            Some(victim) => victim,
            None => {
                log::warn!("failed to pick frame to evict");
                return Err(PagingError::NoVictimPage);
            }
        };

        if victim >= self.layout.load_start {
            log::error!("Victim {victim} is in the runtime's address range");
            return Err(PagingError::AddressAboveLoadBoundary);
        }

        let location = match self.pte_of_va(victim) {
            Some(location) => location,
            None => {
                log::error!("Victim {victim} has no page table entry");
                return Err(PagingError::NoMapping);
            }
        };

        if location.level != PageLevel::Level1 {
            log::error!("Victim {victim} is mapped at {:?}, only 4KB pages can be evicted", location.level);
            return Err(PagingError::UnsupportedVictimLevel);
        }

        let (frame, flags) = match self.read_pte(location) {
            PageTableEntry::Resident { frame, flags } => (frame, flags),
            entry => {
                log::error!("Victim {victim} is not resident: {entry:?}");
                return Err(PagingError::NoMapping);
            }
        };

        let epm_page = self.layout.epm_va(frame);
        if !self.layout.contains_epm_va(epm_page) {
            log::error!("Victim {victim} is backed by {frame}, outside the enclave memory");
            return Err(PagingError::EpmPageOutOfRange);
        }

        // slots are never returned, take one only once nothing else can fail
        let dest = match swap_slot {
            Some(slot) => {
                if !self.backing_ref()?.contains(slot) {
                    log::error!("Swap slot {slot} is outside the backing store");
                    return Err(PagingError::BackingPointerOutOfRange);
                }
                slot
            }
            None => match self.backing_mut()?.allocate_backing_slot() {
                Some(slot) => slot,
                None => {
                    log::error!("No backing store slot left to evict {victim} into");
                    return Err(PagingError::BackingStoreExhausted);
                }
            },
        };
        let dest_va = self.backing_ref()?.va_of(dest);

        self.swap_page(dest_va, epm_page, swap_slot.map(|_| dest_va), false)?;

        self.write_pte(location, PageTableEntry::Swapped { slot: dest, flags });
        self.memory.invalidate_tlb(victim);

        log::debug!("Evicted {victim} from frame {frame} to slot {dest}");
        Ok(frame)
    }
}
