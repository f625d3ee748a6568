//! Keystone security monitor calls.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
#[allow(unused_imports)]
use core::arch::asm;

use crate::arch::Supervisor;

/// SBI extension id of the Keystone enclave interface ("\x08BKE").
pub const SBI_EXT_EXPERIMENTAL_KEYSTONE_ENCLAVE: u64 = 0x0842_4b45;

// Security monitor function ids.
pub const SBI_SM_RANDOM: u64 = 3001;
pub const SBI_SM_CALL_PLUGIN: u64 = 4000;

// Multimem plugin, which hands the enclave the extra region used as the backing store.
pub const PLUGIN_ID_MULTIMEM: u64 = 1;
pub const MULTIMEM_GET_OTHER_REGION_SIZE: u64 = 1;
pub const MULTIMEM_GET_OTHER_REGION_ADDR: u64 = 2;

/// Issues an SBI call into the Keystone extension and returns `a0`. Off target, returns zero.
fn sbi_sm_call(_function: u64, _arg0: u64, _arg1: u64) -> u64 {
    let mut _value = 0u64;

    #[cfg(all(not(test), target_arch = "riscv64"))]
    unsafe {
        asm!(
            "ecall",
            inlateout("a0") _arg0 => _value,
            inlateout("a1") _arg1 => _,
            in("a6") _function,
            in("a7") SBI_EXT_EXPERIMENTAL_KEYSTONE_ENCLAVE,
            options(nostack)
        );
    }

    _value
}

/// `Supervisor` backed by real SBI calls.
#[derive(Debug, Default)]
pub struct Sbi;

impl Supervisor for Sbi {
    fn random(&mut self) -> u64 {
        sbi_sm_call(SBI_SM_RANDOM, 0, 0)
    }

    fn query_multimem_size(&mut self) -> u64 {
        sbi_sm_call(SBI_SM_CALL_PLUGIN, PLUGIN_ID_MULTIMEM, MULTIMEM_GET_OTHER_REGION_SIZE)
    }

    fn query_multimem_addr(&mut self) -> u64 {
        sbi_sm_call(SBI_SM_CALL_PLUGIN, PLUGIN_ID_MULTIMEM, MULTIMEM_GET_OTHER_REGION_ADDR)
    }
}
