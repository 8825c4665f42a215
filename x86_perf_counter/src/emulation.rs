//! In-memory stand-ins for the PMU, used where real MSRs and `rdpmc` are not
//! available (unit tests, non-x86 hosts).

use crate::msr::{self, IA32_FIXED_CTR_CTRL, IA32_PERF_GLOBAL_CTRL};
use crate::registers::{FixedCounterControl, PerfEventSelect};
use crate::{
    CoreId, FastCounterRead, PortError, RegisterPort, COUNTER_MASK, FIXED_COUNTERS,
    GENERAL_COUNTERS,
};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::{Ref, RefCell, RefMut};

/// One recorded MSR write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsrWrite {
    pub core: CoreId,
    pub msr: u32,
    pub value: u64,
}

/// A register file per core. Unwritten MSRs read as zero.
#[derive(Debug, Default)]
pub struct EmulatedPort {
    cores: u32,
    msrs: BTreeMap<(CoreId, u32), u64>,
    user_read: BTreeMap<CoreId, bool>,
    writes: Vec<MsrWrite>,
    failing_msr: Option<u32>,
}

impl EmulatedPort {
    /// A port reaching cores `0..cores`.
    pub fn new(cores: u32) -> Self {
        Self {
            cores,
            ..Default::default()
        }
    }

    pub fn msr(&self, core: CoreId, msr: u32) -> u64 {
        self.msrs.get(&(core, msr)).copied().unwrap_or(0)
    }

    /// Presets a register without recording a write.
    pub fn set_msr(&mut self, core: CoreId, msr: u32, value: u64) {
        self.msrs.insert((core, msr), value);
    }

    pub fn user_read(&self, core: CoreId) -> bool {
        self.user_read.get(&core).copied().unwrap_or(false)
    }

    pub fn set_user_read_bit(&mut self, core: CoreId, enabled: bool) {
        self.user_read.insert(core, enabled);
    }

    /// Every write since creation or the last [`clear_writes`](Self::clear_writes).
    pub fn writes(&self) -> &[MsrWrite] {
        &self.writes
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    /// Makes every later write to `msr` fail, on all cores.
    pub fn fail_writes_to(&mut self, msr: u32) {
        self.failing_msr = Some(msr);
    }

    fn reach(&self, core: CoreId) -> Result<(), PortError> {
        if core.0 < self.cores {
            Ok(())
        } else {
            Err(PortError::Unreachable(core))
        }
    }
}

impl RegisterPort for EmulatedPort {
    fn read(&mut self, core: CoreId, msr: u32) -> Result<u64, PortError> {
        self.reach(core)?;
        Ok(self.msr(core, msr))
    }

    fn write(&mut self, core: CoreId, msr: u32, value: u64) -> Result<(), PortError> {
        self.reach(core)?;
        if self.failing_msr == Some(msr) {
            return Err(PortError::Msr { core, msr });
        }
        self.msrs.insert((core, msr), value);
        self.writes.push(MsrWrite { core, msr, value });
        Ok(())
    }

    fn set_user_read(&mut self, core: CoreId, enabled: bool) -> Result<(), PortError> {
        self.reach(core)?;
        self.user_read.insert(core, enabled);
        Ok(())
    }

    fn online_cores(&self) -> Vec<CoreId> {
        (0..self.cores).map(CoreId).collect()
    }
}

/// Counters that advance by a fixed step every time they are read.
#[derive(Debug, Default)]
pub struct EmulatedCounters {
    step: u64,
    values: RefCell<BTreeMap<u32, u64>>,
    reads: RefCell<Vec<u32>>,
}

impl EmulatedCounters {
    pub fn new(step: u64) -> Self {
        Self {
            step,
            ..Default::default()
        }
    }

    pub fn set(&self, selector: u32, value: u64) {
        self.values.borrow_mut().insert(selector, value);
    }

    /// Advances every counter set so far by `amount`, as if work ran.
    pub fn advance(&self, amount: u64) {
        for value in self.values.borrow_mut().values_mut() {
            *value = value.wrapping_add(amount);
        }
    }

    /// Selectors read so far, in order.
    pub fn reads(&self) -> Vec<u32> {
        self.reads.borrow().clone()
    }
}

impl FastCounterRead for EmulatedCounters {
    fn read_counter(&self, selector: u32) -> u64 {
        self.reads.borrow_mut().push(selector);
        let mut values = self.values.borrow_mut();
        let value = values.entry(selector).or_insert(0);
        let current = *value;
        *value = value.wrapping_add(self.step);
        current
    }
}

/// An [`EmulatedPort`] whose counters count.
///
/// `&EmulatedPmu` is both the [`RegisterPort`] a programmer arms and the
/// [`FastCounterRead`] a reader samples, so reads see exactly what was
/// programmed: a counter reads back the value loaded into its MSR and gains
/// `step` per read only while both its own enable and its
/// IA32_PERF_GLOBAL_CTRL bit are set.
#[derive(Debug)]
pub struct EmulatedPmu {
    port: RefCell<EmulatedPort>,
    reader_core: CoreId,
    step: u64,
}

impl EmulatedPmu {
    /// A PMU of `cores` cores, sampled from core 0.
    pub fn new(cores: u32, step: u64) -> Self {
        Self {
            port: RefCell::new(EmulatedPort::new(cores)),
            reader_core: CoreId(0),
            step,
        }
    }

    /// Samples the counters of `core` instead of core 0.
    pub fn reading_from(mut self, core: CoreId) -> Self {
        self.reader_core = core;
        self
    }

    pub fn port(&self) -> Ref<'_, EmulatedPort> {
        self.port.borrow()
    }

    pub fn port_mut(&self) -> RefMut<'_, EmulatedPort> {
        self.port.borrow_mut()
    }

    /// The counter MSR `selector` names and whether it currently counts.
    fn decode(port: &EmulatedPort, core: CoreId, selector: u32) -> Option<(u32, bool)> {
        let global = port.msr(core, IA32_PERF_GLOBAL_CTRL);
        let fixed = crate::fixed_selector(0);
        if selector & fixed != 0 {
            let index = (selector & !fixed) as usize;
            if index >= FIXED_COUNTERS {
                return None;
            }
            let control = FixedCounterControl(port.msr(core, IA32_FIXED_CTR_CTRL));
            // OS and USR, the low two bits of the field
            let armed = control.field(index) & 0b11 != 0;
            let counting = armed && global & (1 << (32 + index)) != 0;
            Some((msr::fixed_counter(index), counting))
        } else {
            let index = selector as usize;
            if index >= GENERAL_COUNTERS {
                return None;
            }
            let select = PerfEventSelect::from_raw(port.msr(core, msr::event_select(index)));
            let counting = select.enable_counters() && global & (1 << index) != 0;
            Some((msr::general_counter(index), counting))
        }
    }
}

impl RegisterPort for &EmulatedPmu {
    fn read(&mut self, core: CoreId, msr: u32) -> Result<u64, PortError> {
        self.port.borrow_mut().read(core, msr)
    }

    fn write(&mut self, core: CoreId, msr: u32, value: u64) -> Result<(), PortError> {
        self.port.borrow_mut().write(core, msr, value)
    }

    fn set_user_read(&mut self, core: CoreId, enabled: bool) -> Result<(), PortError> {
        self.port.borrow_mut().set_user_read(core, enabled)
    }

    fn online_cores(&self) -> Vec<CoreId> {
        self.port.borrow().online_cores()
    }
}

impl FastCounterRead for EmulatedPmu {
    /// Selectors naming no counter read as zero.
    fn read_counter(&self, selector: u32) -> u64 {
        let core = self.reader_core;
        let mut port = self.port.borrow_mut();
        let Some((counter, counting)) = Self::decode(&port, core, selector) else {
            return 0;
        };
        let current = port.msr(core, counter);
        if counting {
            port.set_msr(core, counter, current.wrapping_add(self.step) & COUNTER_MASK);
        }
        current & COUNTER_MASK
    }
}
