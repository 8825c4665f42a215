use crate::port::CoreId;
use crate::GENERAL_COUNTERS;
use thiserror::Error;

/// A register access through a [`RegisterPort`](crate::RegisterPort) failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    #[error("core {0} cannot be reached from this register port")]
    Unreachable(CoreId),
    #[error("access to MSR {msr:#x} on core {core} faulted")]
    Msr { core: CoreId, msr: u32 },
    #[error("user-mode counter reads could not be changed on core {0}")]
    UserRead(CoreId),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterError {
    #[error("{count} events requested, only {max} general-purpose counters exist", max = GENERAL_COUNTERS)]
    OutOfRangeCount { count: u64 },
    #[error("counters already armed with {active} events, stop them first")]
    AlreadyRunning { active: usize },
    #[error(transparent)]
    Port(#[from] PortError),
}
