//! Samples the PMU around a piece of work from user mode.
//!
//! A run arms the counters through a [`ControlChannel`] (the kernel's control
//! device node, or a [`pmu_device::PmuDevice`] hosted in this process over the
//! Linux `msr` driver), reads every counter with `rdpmc` before and after the
//! work, disarms, and reports the per-counter increments.

mod affinity;
pub mod catalog;
mod channel;
mod error;
pub mod msr;
mod report;
mod sampler;

pub use affinity::pin_to_core;
pub use channel::{ControlChannel, DeviceFile};
pub use error::SampleError;
pub use report::Report;
pub use sampler::{Mark, Sampler};
