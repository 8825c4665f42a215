//! # x86 Performance Counter
//!
//! Programs the fixed-function and general-purpose counters of the x86 PMU
//! from a privileged context, and reads them back from an unprivileged one
//! with `rdpmc`.
//!
//! The counter geometry is fixed: three fixed counters (instructions retired,
//! core cycles, reference cycles) and eight general-purpose counters, all 48
//! bits wide. All register traffic goes through [`RegisterPort`] and all
//! counter reads through [`FastCounterRead`], so the sequencing logic in
//! [`Programmer`] and [`CounterReader`] runs unchanged against real hardware
//! or the in-memory backends of the `emulation` feature.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod error;
mod event;
pub mod msr;
mod port;
mod programmer;
mod reader;
pub mod registers;

#[cfg(any(test, feature = "emulation"))]
pub mod emulation;

#[cfg(target_arch = "x86_64")]
mod x86;

pub use error::{CounterError, PortError};
pub use event::{CounterSet, EventSpec};
pub use port::{CoreId, CoreSelection, RegisterPort};
pub use programmer::{CounterState, Programmer, ProgrammerConfig};
pub use registers::FixedRing;
pub use reader::{
    delta, fixed_selector, CounterDeltas, CounterReader, FastCounterRead, SampleBuffer,
};
#[cfg(target_arch = "x86_64")]
pub use self::x86::*;

/// Number of fixed-function counters programmed by [`Programmer`].
pub const FIXED_COUNTERS: usize = 3;

/// Number of general-purpose counters, and so the maximum size of a [`CounterSet`].
pub const GENERAL_COUNTERS: usize = 8;

/// Total number of counters sampled by [`CounterReader`].
pub const TOTAL_COUNTERS: usize = FIXED_COUNTERS + GENERAL_COUNTERS;

/// Width of every counter in bits.
pub const COUNTER_WIDTH: u32 = 48;

/// Mask selecting the implemented bits of a counter.
pub const COUNTER_MASK: u64 = (1 << COUNTER_WIDTH) - 1;

/// Value preloaded into every counter on start.
///
/// Bit 47 is set so the full counter width is in use from the first event,
/// and the counter sits far away from wrapping to zero during short
/// measurement windows.
pub const COUNTER_INITIAL_VALUE: u64 = 0x8000_0000_0001;
