//! Random victim selection.
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
    paging::PagingState,
    structs::{MAX_VICTIM_RETRIES, VirtualAddress},
};

impl<M: EnclaveMemory, S: Supervisor> PagingState<M, S> {
    /// Picks a resident user page to evict.
    ///
    /// Each attempt draws a random value from the supervisor, turns it into a position in `1..=frame_count` and asks
    /// the walker for the user leaf at that position. Positions past the last user leaf miss, so the selector retries
    /// up to `MAX_VICTIM_RETRIES` times.
    ///
    /// ## Returns
    /// * `Ok(Some(va))` - virtual address of the victim
    /// * `Ok(None)` - every attempt missed
    ///
    /// ## Errors
    /// * `EmptyFramePool` if the layout has no frames to pick from
    /// * `ZeroRandomDraw` if the supervisor returns zero
    pub fn pick_victim_page(&mut self) -> PagingResult<Option<VirtualAddress>> {
        let frame_count = self.layout.frame_count();
        if frame_count == 0 {
            log::error!("Cannot pick a victim from an empty frame pool");
            return Err(PagingError::EmptyFramePool);
        }

        for attempt in 0..MAX_VICTIM_RETRIES {
            let rnd = self.supervisor.random();
            if rnd == 0 {
                log::error!("Supervisor returned a zero random value");
                return Err(PagingError::ZeroRandomDraw);
            }

            let count = rnd % frame_count + 1;
            match self.pick_nth_user_leaf(count) {
                Some(va) => {
                    log::debug!("Picked victim {va} (position {count}, attempt {attempt})");
                    return Ok(Some(va));
                }
                None => log::trace!("No user page at position {count} (attempt {attempt})"),
            }
        }

        Ok(None)
    }
}
