use crate::PortError;
use alloc::vec::Vec;
use core::fmt;

/// Identifier of a logical processor, as understood by the [`RegisterPort`]
/// it is handed to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreId(pub u32);

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for CoreId {
    fn from(value: u32) -> Self {
        CoreId(value)
    }
}

/// Which processors an operation applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreSelection {
    Core(CoreId),
    /// Every core the port reports as online.
    All,
}

/// Privileged access to the per-core performance monitoring state.
///
/// MSRs and the CR4.PCE bit exist once per logical processor, so every
/// access names the core it targets. Implementations that cannot reach a core
/// return [`PortError::Unreachable`] instead of silently touching another one.
pub trait RegisterPort {
    /// Reads MSR `msr` on `core`.
    fn read(&mut self, core: CoreId, msr: u32) -> Result<u64, PortError>;

    /// Writes `value` to MSR `msr` on `core`.
    fn write(&mut self, core: CoreId, msr: u32, value: u64) -> Result<(), PortError>;

    /// Grants or revokes unprivileged `rdpmc` on `core` (CR4.PCE).
    ///
    /// This changes how every instruction stream on that core may read the
    /// counters, not only the caller's.
    fn set_user_read(&mut self, core: CoreId, enabled: bool) -> Result<(), PortError>;

    /// Cores reachable through this port, for broadcast operations.
    fn online_cores(&self) -> Vec<CoreId>;

    /// Resolves a selection into the cores it names.
    fn select(&self, selection: CoreSelection) -> Vec<CoreId> {
        match selection {
            CoreSelection::Core(core) => alloc::vec![core],
            CoreSelection::All => self.online_cores(),
        }
    }
}

impl<P: RegisterPort + ?Sized> RegisterPort for &mut P {
    fn read(&mut self, core: CoreId, msr: u32) -> Result<u64, PortError> {
        (**self).read(core, msr)
    }

    fn write(&mut self, core: CoreId, msr: u32, value: u64) -> Result<(), PortError> {
        (**self).write(core, msr, value)
    }

    fn set_user_read(&mut self, core: CoreId, enabled: bool) -> Result<(), PortError> {
        (**self).set_user_read(core, enabled)
    }

    fn online_cores(&self) -> Vec<CoreId> {
        (**self).online_cores()
    }
}
