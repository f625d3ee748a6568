use crate::{PagingResult, structs::PhysicalAddress};

/// PageAllocator trait facilitates `allocate_page()` for the intermediate page tables needed when paging maps the
/// backing store into the runtime's address space.
pub trait PageAllocator {
    /// Allocate one page from the runtime's free memory.
    ///
    /// ## Returns
    /// * `PagingResult<PhysicalAddress>` - Physical address of the allocated page. The page does not need to be
    ///   zeroed, the caller clears it before linking it into the table.
    fn allocate_page(&mut self) -> PagingResult<PhysicalAddress>;
}
