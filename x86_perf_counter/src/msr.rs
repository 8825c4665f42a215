//! MSR addresses of the architectural performance monitoring registers.
//!
//! See the Intel SDM Vol. 4, "Architectural MSRs".

/// IA32_FIXED_CTR0, fixed counter 0 (instructions retired). Fixed counter `n`
/// lives at `IA32_FIXED_CTR0 + n`.
pub const IA32_FIXED_CTR0: u32 = 0x309;

/// IA32_FIXED_CTR_CTRL, four control bits per fixed counter.
pub const IA32_FIXED_CTR_CTRL: u32 = 0x38d;

/// IA32_PERF_GLOBAL_CTRL, one enable bit per counter.
pub const IA32_PERF_GLOBAL_CTRL: u32 = 0x38f;

/// IA32_PERFEVTSEL0, event select of general-purpose counter 0.
pub const IA32_PERFEVTSEL0: u32 = 0x186;

/// IA32_A_PMC0, full-width alias of general-purpose counter 0.
///
/// Writes through the alias set all 48 bits, writes through IA32_PMC0 (0xc1)
/// sign-extend bit 31.
pub const IA32_A_PMC0: u32 = 0x4c1;

/// Counter register of fixed counter `index`.
pub const fn fixed_counter(index: usize) -> u32 {
    IA32_FIXED_CTR0 + index as u32
}

/// Counter register of general-purpose counter `index`.
pub const fn general_counter(index: usize) -> u32 {
    IA32_A_PMC0 + index as u32
}

/// Event select register of general-purpose counter `index`.
pub const fn event_select(index: usize) -> u32 {
    IA32_PERFEVTSEL0 + index as u32
}
