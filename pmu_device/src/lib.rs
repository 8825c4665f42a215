//! The control device of the PMU: the only way a caller outside the
//! privileged context reaches the [`Programmer`](x86_perf_counter::Programmer).
//!
//! The protocol has two opcodes, [`Opcode::Start`] carrying a fixed-size
//! event table and [`Opcode::Stop`] carrying nothing. At most one session may
//! hold the device open.
#![cfg_attr(not(test), no_std)]

pub mod abi;
mod device;
mod error;

pub use abi::{Opcode, RawPmuEvent, RawStartParam, START_PARAM_SIZE};
pub use device::{PmuDevice, Session};
pub use error::{DeviceError, TransferFault};

/// Name of the device node the control device is published under.
pub const DEVICE_NAME: &str = "acrn_pmu";

/// Path of the device node.
pub const DEVICE_PATH: &str = "/dev/acrn_pmu";
