//! Arms and disarms the counter array of one processor.
//!
//! The register sequence is order sensitive: every counter is loaded and
//! configured before IA32_PERF_GLOBAL_CTRL enables the array, and on the way
//! down the global disable comes first so no counter keeps running while the
//! per-counter state is cleared.

use crate::msr::{self, IA32_FIXED_CTR_CTRL, IA32_PERF_GLOBAL_CTRL};
use crate::registers::{FixedCounterControl, GlobalControl, PerfEventSelect};
use crate::{
    CoreId, CoreSelection, CounterError, CounterSet, EventSpec, PortError, RegisterPort,
    COUNTER_INITIAL_VALUE, FIXED_COUNTERS, GENERAL_COUNTERS,
};
use log::{debug, error, info, trace, warn};

use crate::registers::FixedRing;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgrammerConfig {
    /// Value loaded into every counter before it is enabled.
    pub initial_value: u64,
    /// Privilege levels counted by the three fixed counters.
    pub fixed_ring: FixedRing,
    /// Encode the edge, any-thread and invert qualifiers of each event into
    /// its event select. When off, those fields of [`EventSpec`] are ignored.
    pub encode_qualifiers: bool,
}

impl Default for ProgrammerConfig {
    fn default() -> Self {
        Self {
            initial_value: COUNTER_INITIAL_VALUE,
            fixed_ring: FixedRing::ALL,
            encode_qualifiers: true,
        }
    }
}

/// What the [`Programmer`] has armed on its core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterState {
    /// The events of the last successful start.
    pub event_table: CounterSet,
    /// General-purpose counters in use, 0 while disarmed.
    pub active_event_count: usize,
    pub armed: bool,
}

impl CounterState {
    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

/// Owns the counter state of one core and sequences its MSR writes.
pub struct Programmer<P: RegisterPort> {
    port: P,
    core: CoreId,
    config: ProgrammerConfig,
    state: CounterState,
}

impl<P: RegisterPort> Programmer<P> {
    /// A programmer for the counters of `core`, reached through `port`.
    ///
    /// # Arguments
    ///
    /// * `port` - register access; must reach `core` for start and stop
    /// * `core` - the core whose counters are armed and disarmed
    /// * `config` - initial counter value and fixed counter rings
    ///
    /// No register is touched until the first [`start`](Self::start).
    pub fn new(port: P, core: CoreId, config: ProgrammerConfig) -> Self {
        Self {
            port,
            core,
            config,
            state: CounterState::default(),
        }
    }

    /// The core [`start`](Self::start) and [`stop`](Self::stop) program.
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// The configuration given to [`new`](Self::new).
    pub fn config(&self) -> &ProgrammerConfig {
        &self.config
    }

    pub fn state(&self) -> &CounterState {
        &self.state
    }

    /// The register port, for inspecting what was programmed.
    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Gives the port back without disarming anything.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Arms the fixed counters and one general-purpose counter per event of
    /// `events`, enables the whole array and grants user-mode `rdpmc`.
    ///
    /// Either every register is programmed and the state records `events`, or
    /// the counters are driven back to disabled and the state stays disarmed.
    ///
    /// # Errors
    ///
    /// - [`CounterError::AlreadyRunning`] if a previous start was not
    ///   stopped; no register is touched.
    /// - [`CounterError::Port`] if a register access failed.
    pub fn start(&mut self, events: &CounterSet) -> Result<(), CounterError> {
        if self.state.armed {
            warn!(
                "core {}: start requested while {} events are armed",
                self.core, self.state.active_event_count
            );
            return Err(CounterError::AlreadyRunning {
                active: self.state.active_event_count,
            });
        }

        let table = *events;
        info!("core {}: pmu event count = {}", self.core, table.len());

        if let Err(err) = self.arm(&table) {
            error!("core {}: arming counters failed, rolling back: {}", self.core, err);
            // the arming error is the one returned
            if let Err(rollback) = self.disarm() {
                error!("core {}: rollback failed too: {}", self.core, rollback);
            }
            self.state = CounterState::default();
            return Err(err);
        }

        self.state = CounterState {
            event_table: table,
            active_event_count: table.len(),
            armed: true,
        };
        Ok(())
    }

    /// Disables counting and revokes user-mode `rdpmc`.
    ///
    /// Every step runs even if an earlier one failed; the first failure is
    /// returned. Stopping disarmed counters repeats the same writes.
    pub fn stop(&mut self) -> Result<(), CounterError> {
        if !self.state.armed {
            debug!("core {}: stop requested while disarmed", self.core);
        }
        let result = self.disarm();
        self.state = CounterState::default();
        info!("core {}: counters disarmed", self.core);
        result
    }

    /// Globally disables counting and revokes user-mode `rdpmc` on every
    /// online core.
    ///
    /// [`start`](Self::start)/[`stop`](Self::stop) only keep the programmed
    /// core symmetric; this clears whatever an earlier session left enabled
    /// anywhere else.
    pub fn teardown_all_cores(&mut self) -> Result<(), CounterError> {
        let mut first_error = None;
        let mut record = |result: Result<(), PortError>| {
            if let Err(err) = result {
                first_error.get_or_insert(CounterError::Port(err));
            }
        };

        record(self.disable_counting(CoreSelection::All));
        record(self.set_user_read(CoreSelection::All, false));
        self.state = CounterState::default();
        info!("pmu torn down on all cores");

        first_error.map_or(Ok(()), Err)
    }

    /// Writes the global disable on the selected cores. Unreachable cores are
    /// logged and skipped, the first failure is returned.
    pub fn disable_counting(&mut self, selection: CoreSelection) -> Result<(), PortError> {
        let mut first_error = None;
        for core in self.port.select(selection) {
            if let Err(err) = self.write_on(core, IA32_PERF_GLOBAL_CTRL, GlobalControl::DISABLED) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Grants or revokes user-mode `rdpmc` on the selected cores.
    pub fn set_user_read(&mut self, selection: CoreSelection, enabled: bool) -> Result<(), PortError> {
        let mut first_error = None;
        for core in self.port.select(selection) {
            trace!("core {}: user rdpmc {}", core, if enabled { "on" } else { "off" });
            if let Err(err) = self.port.set_user_read(core, enabled) {
                warn!("core {}: changing user rdpmc failed: {}", core, err);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn arm(&mut self, table: &CounterSet) -> Result<(), CounterError> {
        for index in 0..FIXED_COUNTERS {
            self.arm_fixed(index)?;
        }

        for (index, event) in table.iter().enumerate() {
            debug!(
                "core {}: set up pmu event {:#x} umask {:#x} cmask {:#x} os {} user {}",
                self.core,
                event.selector,
                event.sub_selector,
                event.count_mask,
                event.count_os,
                event.count_user
            );
            self.arm_general(index, event)?;
        }

        // stale enables left by other tools would count under the global enable
        for index in table.len()..GENERAL_COUNTERS {
            self.clear_general_enable(index)?;
        }

        self.write(IA32_PERF_GLOBAL_CTRL, GlobalControl::ALL_COUNTERS)?;
        self.set_user_read(CoreSelection::Core(self.core), true)?;
        Ok(())
    }

    fn disarm(&mut self) -> Result<(), CounterError> {
        let mut first_error = None;
        let mut record = |result: Result<(), PortError>| {
            if let Err(err) = result {
                first_error.get_or_insert(CounterError::Port(err));
            }
        };

        record(self.write(IA32_PERF_GLOBAL_CTRL, GlobalControl::DISABLED));
        for index in 0..FIXED_COUNTERS {
            record(self.disarm_fixed(index));
        }
        for index in 0..GENERAL_COUNTERS {
            record(self.clear_general_enable(index));
        }
        record(self.set_user_read(CoreSelection::Core(self.core), false));

        first_error.map_or(Ok(()), Err)
    }

    fn arm_fixed(&mut self, index: usize) -> Result<(), PortError> {
        self.write(msr::fixed_counter(index), self.config.initial_value)?;

        let mut control = FixedCounterControl(self.read(IA32_FIXED_CTR_CTRL)?);
        control.set_ring(index, self.config.fixed_ring);
        self.write(IA32_FIXED_CTR_CTRL, control.0)
    }

    fn disarm_fixed(&mut self, index: usize) -> Result<(), PortError> {
        let mut control = FixedCounterControl(self.read(IA32_FIXED_CTR_CTRL)?);
        control.clear(index);
        self.write(IA32_FIXED_CTR_CTRL, control.0)
    }

    fn arm_general(&mut self, index: usize, event: &EventSpec) -> Result<(), PortError> {
        self.write(msr::general_counter(index), self.config.initial_value)?;

        let select = PerfEventSelect::for_event(event, self.config.encode_qualifiers);
        self.write(msr::event_select(index), select.raw())
    }

    fn clear_general_enable(&mut self, index: usize) -> Result<(), PortError> {
        let mut select = PerfEventSelect::from_raw(self.read(msr::event_select(index))?);
        if !select.enable_counters() {
            return Ok(());
        }
        select.set_enable_counters(false);
        self.write(msr::event_select(index), select.raw())
    }

    fn read(&mut self, msr: u32) -> Result<u64, PortError> {
        self.port.read(self.core, msr).inspect_err(|err| {
            warn!("core {}: rdmsr {:#x} failed: {}", self.core, msr, err);
        })
    }

    fn write(&mut self, msr: u32, value: u64) -> Result<(), PortError> {
        self.write_on(self.core, msr, value)
    }

    fn write_on(&mut self, core: CoreId, msr: u32, value: u64) -> Result<(), PortError> {
        trace!("core {}: wrmsr {:#x} <- {:#x}", core, msr, value);
        self.port.write(core, msr, value).inspect_err(|err| {
            warn!("core {}: wrmsr {:#x} <- {:#x} failed: {}", core, msr, value, err);
        })
    }
}
