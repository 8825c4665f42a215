//! x86-specific Performance Counter Implementation
//!
//! The hardware backends of [`RegisterPort`] and [`FastCounterRead`]: `rdmsr`,
//! `wrmsr` and CR4 for the privileged side, `rdpmc` for the reader.

use crate::{CoreId, FastCounterRead, PortError, RegisterPort};
use alloc::vec;
use alloc::vec::Vec;
use core::arch::asm;
use log::trace;
use ::x86::controlregs::{cr4, cr4_write, Cr4};
use ::x86::cpuid::CpuId;

/// Reads a performance counter with `rdpmc`
///
/// # Arguments
///
/// * `selector` - The counter to read: the general-purpose index, or the fixed
///   index with bit 30 set
///
/// # Safety
///
/// Faults unless running at CPL0 or CR4.PCE is set, and for selectors the
/// processor does not implement.
#[inline(always)]
pub unsafe fn read_pmc(selector: u32) -> u64 {
    let mut value: u64;
    unsafe {
        asm!(
        "rdpmc",
        "mov {value:e}, edx",
        "shl {value}, 32",
        "mov {value:e}, eax",
        in("ecx") selector,
        out("rax") _,
        out("rdx") _,
        value = out(reg) value,
        options(nomem, nostack)
        );
    }
    value
}

/// The `rdpmc` fast path.
///
/// Only valid on a core whose counters were armed with user-mode reads
/// granted; the reading thread has to stay pinned to that core.
#[derive(Debug, Clone, Copy)]
pub struct Rdpmc {
    _private: (),
}

impl Rdpmc {
    /// # Safety
    ///
    /// Every later read faults unless the calling thread runs at CPL0 or on a
    /// core where user-mode reads were granted.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl FastCounterRead for Rdpmc {
    #[inline(always)]
    fn read_counter(&self, selector: u32) -> u64 {
        // Safety: guaranteed by the contract of `Rdpmc::new`.
        unsafe { read_pmc(selector) }
    }
}

/// Initial local APIC ID of the executing processor.
pub fn current_core() -> CoreId {
    let apic_id = CpuId::new()
        .get_feature_info()
        .map(|info| info.initial_local_apic_id())
        .unwrap_or(0);
    CoreId(apic_id as u32)
}

/// Direct MSR and CR4 access on the executing processor.
///
/// A bare `rdmsr`/`wrmsr` cannot be recovered from a #GP, so this port cannot
/// report faults; it only refuses cores other than its own. Broadcasting
/// requires running the operation on every core, e.g. from an IPI handler.
#[derive(Debug)]
pub struct LocalCpuPort {
    core: CoreId,
}

impl LocalCpuPort {
    /// # Safety
    ///
    /// The caller runs at CPL0 and stays on the current processor for the
    /// lifetime of the port.
    pub unsafe fn new() -> Self {
        Self {
            core: current_core(),
        }
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    fn reach(&self, core: CoreId) -> Result<(), PortError> {
        if core == self.core {
            Ok(())
        } else {
            Err(PortError::Unreachable(core))
        }
    }
}

impl RegisterPort for LocalCpuPort {
    fn read(&mut self, core: CoreId, msr: u32) -> Result<u64, PortError> {
        self.reach(core)?;
        // Safety: CPL0 on this core, see `LocalCpuPort::new`.
        Ok(unsafe { ::x86::msr::rdmsr(msr) })
    }

    fn write(&mut self, core: CoreId, msr: u32, value: u64) -> Result<(), PortError> {
        self.reach(core)?;
        // Safety: CPL0 on this core, see `LocalCpuPort::new`.
        unsafe { ::x86::msr::wrmsr(msr, value) };
        Ok(())
    }

    fn set_user_read(&mut self, core: CoreId, enabled: bool) -> Result<(), PortError> {
        self.reach(core)?;
        // Safety: CPL0 on this core, see `LocalCpuPort::new`.
        unsafe {
            let mut flags = cr4();
            flags.set(Cr4::CR4_ENABLE_PPMC, enabled);
            cr4_write(flags);
        }
        trace!("core {}: CR4.PCE = {}", core, enabled);
        Ok(())
    }

    fn online_cores(&self) -> Vec<CoreId> {
        vec![self.core]
    }
}
