use thiserror::Error;
use x86_perf_counter::CounterError;

/// The payload could not be copied across the trust boundary.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("expected a {expected} byte start parameter, got {actual} bytes")]
pub struct TransferFault {
    pub expected: usize,
    pub actual: usize,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device is already open")]
    Busy,
    #[error(transparent)]
    Transfer(#[from] TransferFault),
    #[error("unrecognized control opcode {0}")]
    UnrecognizedOpcode(u32),
    #[error(transparent)]
    Counter(#[from] CounterError),
    #[error("device has been unloaded")]
    Unloaded,
}
