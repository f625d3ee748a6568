use bitfield_struct::bitfield;
use bitflags::bitflags;

use crate::structs::{PAGE_BITS, PhysicalAddress};

/// Shift of the physical page number inside an Sv39 entry.
pub const PTE_PPN_SHIFT: u64 = 10;

/// All bits below the physical page number: V, R, W, X, U, G, A, D and the two software bits.
pub const PTE_FLAG_MASK: u64 = 0x3ff;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
        const RSW0 = 1 << 8;
        const RSW1 = 1 << 9;

        const LEAF_MASK = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

impl PteFlags {
    /// An entry with any of R/W/X set maps memory directly, at whatever level it sits.
    pub fn is_leaf(&self) -> bool {
        self.intersects(PteFlags::LEAF_MASK)
    }
}

#[rustfmt::skip]
#[bitfield(u64)]
pub struct Sv39Entry {
    pub valid: bool,          // 1 bit  -  0 = Invalid, 1 = Valid
    pub readable: bool,       // 1 bit  -  Read permission
    pub writable: bool,       // 1 bit  -  Write permission
    pub executable: bool,     // 1 bit  -  Execute permission
    pub user: bool,           // 1 bit  -  Accessible from U-mode
    pub global: bool,         // 1 bit  -  Mapping exists in all address spaces
    pub accessed: bool,       // 1 bit  -  Set on access
    pub dirty: bool,          // 1 bit  -  Set on write
    #[bits(2)]
    pub rsw: u8,              // 2 bits -  Reserved for supervisor software
    #[bits(44)]
    pub ppn: u64,             // 44 bits - Physical page number
    #[bits(10)]
    pub reserved: u16,        // 10 bits - Reserved, must be zero
}

impl Sv39Entry {
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.into_bits() & PTE_FLAG_MASK)
    }

    pub fn address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.ppn() << PAGE_BITS)
    }

    /// Eyrie's `pte_create`: a valid entry for `ppn` with `flags`.
    pub fn create(ppn: u64, flags: PteFlags) -> Self {
        Self::from_bits((ppn << PTE_PPN_SHIFT) | (flags | PteFlags::V).bits())
    }

    /// Eyrie's `pte_create_invalid`: `ppn` is kept but the valid bit is cleared.
    pub fn create_invalid(ppn: u64, flags: PteFlags) -> Self {
        Self::from_bits((ppn << PTE_PPN_SHIFT) | (flags - PteFlags::V).bits())
    }
}

/// Decoded view of one page table entry.
///
/// The hardware layout overloads invalid entries: an entry with V clear but a non-zero PPN records where the page's
/// content was parked in the backing store. `decode` and `encode` convert between this view and the exact bits the
/// MMU walks, so the pager never manipulates raw entries directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableEntry {
    /// Nothing is, or ever was, mapped here.
    Unmapped,
    /// The page lives in the backing store slot at `slot`; `flags` are the permissions it had when resident.
    Swapped { slot: PhysicalAddress, flags: PteFlags },
    /// Valid entry pointing at `frame`. For non-leaf entries `frame` is the next level table.
    Resident { frame: PhysicalAddress, flags: PteFlags },
}

impl PageTableEntry {
    pub fn decode(raw: u64) -> Self {
        let entry = Sv39Entry::from_bits(raw);
        if entry.valid() {
            PageTableEntry::Resident { frame: entry.address(), flags: entry.flags() }
        } else if entry.ppn() != 0 {
            PageTableEntry::Swapped { slot: entry.address(), flags: entry.flags() }
        } else {
            PageTableEntry::Unmapped
        }
    }

    pub fn encode(&self) -> u64 {
        match *self {
            PageTableEntry::Unmapped => 0,
            PageTableEntry::Swapped { slot, flags } => Sv39Entry::create_invalid(slot.ppn(), flags).into_bits(),
            PageTableEntry::Resident { frame, flags } => Sv39Entry::create(frame.ppn(), flags).into_bits(),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, PageTableEntry::Resident { .. })
    }

    /// Valid and user accessible. Among leaves, these are the only entries the victim selector may pick.
    pub fn is_user_resident(&self) -> bool {
        match self {
            PageTableEntry::Resident { flags, .. } => flags.contains(PteFlags::U),
            _ => false,
        }
    }

    pub fn flags(&self) -> PteFlags {
        match self {
            PageTableEntry::Unmapped => PteFlags::empty(),
            PageTableEntry::Swapped { flags, .. } | PageTableEntry::Resident { flags, .. } => *flags,
        }
    }
}
