use crate::abi::{self, Opcode};
use crate::DeviceError;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{debug, info, warn};
use spin::Mutex;
use x86_perf_counter::{CounterSet, CounterState, Programmer, RegisterPort};

/// The control device wrapped around a [`Programmer`].
///
/// Opening is exclusive: the first [`open`](Self::open) wins and every later
/// one fails with [`DeviceError::Busy`] until the [`Session`] is dropped.
/// Unloading (explicitly or by dropping the device) tears the counters down on
/// every core.
pub struct PmuDevice<P: RegisterPort> {
    open: AtomicBool,
    programmer: Mutex<Option<Programmer<P>>>,
}

impl<P: RegisterPort> PmuDevice<P> {
    pub fn new(programmer: Programmer<P>) -> Self {
        info!("pmu device registered on core {}", programmer.core());
        Self {
            open: AtomicBool::new(false),
            programmer: Mutex::new(Some(programmer)),
        }
    }

    /// Claims the device.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Busy`] while another session holds it.
    pub fn open(&self) -> Result<Session<'_, P>, DeviceError> {
        if self
            .open
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            warn!("pmu device is already open");
            return Err(DeviceError::Busy);
        }
        debug!("pmu device opened");
        Ok(Session { device: self })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// The counter state of the wrapped programmer.
    pub fn state(&self) -> Result<CounterState, DeviceError> {
        self.with_programmer(|programmer| *programmer.state())
    }

    /// Runs `f` with exclusive access to the programmer.
    pub fn with_programmer<T>(
        &self,
        f: impl FnOnce(&mut Programmer<P>) -> T,
    ) -> Result<T, DeviceError> {
        let mut programmer = self.programmer.lock();
        match programmer.as_mut() {
            Some(programmer) => Ok(f(programmer)),
            None => Err(DeviceError::Unloaded),
        }
    }

    /// Globally disables counting and revokes user reads on every core, then
    /// releases the programmer.
    pub fn unload(mut self) -> Result<(), DeviceError> {
        match self.programmer.get_mut().take() {
            Some(mut programmer) => Ok(programmer.teardown_all_cores()?),
            None => Err(DeviceError::Unloaded),
        }
    }
}

impl<P: RegisterPort> Drop for PmuDevice<P> {
    fn drop(&mut self) {
        if let Some(mut programmer) = self.programmer.get_mut().take() {
            if let Err(err) = programmer.teardown_all_cores() {
                warn!("pmu teardown failed: {}", err);
            }
        }
    }
}

/// An open handle on a [`PmuDevice`]. Dropping it releases the device but
/// leaves the counters as they are.
pub struct Session<'a, P: RegisterPort> {
    device: &'a PmuDevice<P>,
}

impl<P: RegisterPort> Session<'_, P> {
    /// Dispatches one control request.
    ///
    /// The start payload is copied and validated in full before the
    /// programmer is touched, so a rejected payload leaves every register as
    /// it was.
    pub fn control(&self, opcode: u32, payload: &[u8]) -> Result<(), DeviceError> {
        let opcode = Opcode::try_from(opcode).inspect_err(|_| {
            warn!("unrecognized pmu control opcode {}", opcode);
        })?;

        match opcode {
            Opcode::Start => {
                let events = abi::transfer(payload).inspect_err(|err| {
                    warn!("pmu start rejected: {}", err);
                })?;
                self.start(&events)
            }
            Opcode::Stop => Ok(self.device.with_programmer(|programmer| programmer.stop())??),
        }
    }

    /// [`Opcode::Start`] with `events` encoded the way an ioctl caller would.
    pub fn request_start(&self, events: &CounterSet) -> Result<(), DeviceError> {
        self.control(Opcode::Start.into(), &abi::encode(events))
    }

    pub fn request_stop(&self) -> Result<(), DeviceError> {
        self.control(Opcode::Stop.into(), &[])
    }

    /// Reserved; transfers nothing.
    pub fn read(&self, _buf: &mut [u8]) -> usize {
        0
    }

    /// Reserved; transfers nothing.
    pub fn write(&self, _buf: &[u8]) -> usize {
        0
    }

    fn start(&self, events: &CounterSet) -> Result<(), DeviceError> {
        info!("pmu event count = {}", events.len());
        Ok(self.device.with_programmer(|programmer| programmer.start(events))??)
    }
}

impl<P: RegisterPort> Drop for Session<'_, P> {
    fn drop(&mut self) {
        self.device.open.store(false, Ordering::Release);
        debug!("pmu device released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{encode, START_PARAM_SIZE};
    use crate::TransferFault;
    use x86_perf_counter::emulation::EmulatedPort;
    use x86_perf_counter::msr::{IA32_PERFEVTSEL0, IA32_PERF_GLOBAL_CTRL};
    use x86_perf_counter::registers::GlobalControl;
    use x86_perf_counter::{CoreId, CounterError, EventSpec, ProgrammerConfig};

    fn device(port: &mut EmulatedPort) -> PmuDevice<&mut EmulatedPort> {
        PmuDevice::new(Programmer::new(port, CoreId(0), ProgrammerConfig::default()))
    }

    fn writes(device: &PmuDevice<&mut EmulatedPort>) -> usize {
        device
            .with_programmer(|programmer| programmer.port().writes().len())
            .unwrap()
    }

    fn events() -> CounterSet {
        CounterSet::new(&[EventSpec::new(0x0e, 0x01), EventSpec::new(0xc2, 0x02)]).unwrap()
    }

    #[test]
    fn test_second_open_is_busy() {
        let mut port = EmulatedPort::new(1);
        let device = device(&mut port);

        let session = device.open().unwrap();
        assert!(device.is_open());
        assert!(matches!(device.open(), Err(DeviceError::Busy)));

        drop(session);
        assert!(!device.is_open());
        assert!(device.open().is_ok());
    }

    #[test]
    fn test_start_and_stop_through_session() {
        let mut port = EmulatedPort::new(1);
        let device = device(&mut port);
        let session = device.open().unwrap();

        session.request_start(&events()).unwrap();
        let state = device.state().unwrap();
        assert!(state.is_armed());
        assert_eq!(state.active_event_count, 2);
        assert_eq!(
            device
                .with_programmer(|p| p.port().msr(CoreId(0), IA32_PERFEVTSEL0))
                .unwrap(),
            0x43010e
        );

        session.request_stop().unwrap();
        assert!(!device.state().unwrap().is_armed());
    }

    #[test]
    fn test_truncated_start_touches_no_register() {
        let mut port = EmulatedPort::new(1);
        let device = device(&mut port);
        let session = device.open().unwrap();

        let payload = encode(&events());
        assert_eq!(
            session.control(1, &payload[..40]),
            Err(DeviceError::Transfer(TransferFault {
                expected: START_PARAM_SIZE,
                actual: 40
            }))
        );
        assert_eq!(writes(&device), 0);
        assert!(!device.state().unwrap().is_armed());
    }

    #[test]
    fn test_out_of_range_count_touches_no_register() {
        let mut port = EmulatedPort::new(1);
        let device = device(&mut port);
        let session = device.open().unwrap();

        let mut payload = encode(&events());
        payload[..8].copy_from_slice(&9u64.to_ne_bytes());
        assert_eq!(
            session.control(1, &payload),
            Err(DeviceError::Counter(CounterError::OutOfRangeCount { count: 9 }))
        );
        assert_eq!(writes(&device), 0);
    }

    #[test]
    fn test_unknown_opcode_is_rejected() {
        let mut port = EmulatedPort::new(1);
        let device = device(&mut port);
        let session = device.open().unwrap();

        assert_eq!(
            session.control(7, &[]),
            Err(DeviceError::UnrecognizedOpcode(7))
        );
        assert_eq!(writes(&device), 0);
    }

    #[test]
    fn test_start_while_running_is_rejected() {
        let mut port = EmulatedPort::new(1);
        let device = device(&mut port);
        let session = device.open().unwrap();

        session.request_start(&events()).unwrap();
        assert_eq!(
            session.request_start(&CounterSet::empty()),
            Err(DeviceError::Counter(CounterError::AlreadyRunning { active: 2 }))
        );
        assert_eq!(device.state().unwrap().active_event_count, 2);
    }

    #[test]
    fn test_read_and_write_are_no_ops() {
        let mut port = EmulatedPort::new(1);
        let device = device(&mut port);
        let session = device.open().unwrap();

        let mut buf = [0xaau8; 16];
        assert_eq!(session.read(&mut buf), 0);
        assert_eq!(buf, [0xaa; 16]);
        assert_eq!(session.write(&buf), 0);
        assert_eq!(writes(&device), 0);
    }

    #[test]
    fn test_unload_tears_down_every_core() {
        let mut port = EmulatedPort::new(3);
        for core in 0..3 {
            port.set_msr(CoreId(core), IA32_PERF_GLOBAL_CTRL, GlobalControl::ALL_COUNTERS);
            port.set_user_read_bit(CoreId(core), true);
        }

        let device = device(&mut port);
        device.open().unwrap().request_start(&events()).unwrap();
        device.unload().unwrap();

        for core in 0..3 {
            assert_eq!(port.msr(CoreId(core), IA32_PERF_GLOBAL_CTRL), 0);
            assert!(!port.user_read(CoreId(core)));
        }
    }

    #[test]
    fn test_drop_tears_down() {
        let mut port = EmulatedPort::new(2);
        port.set_user_read_bit(CoreId(1), true);
        {
            let device = device(&mut port);
            device.open().unwrap().request_start(&events()).unwrap();
        }
        assert_eq!(port.msr(CoreId(0), IA32_PERF_GLOBAL_CTRL), 0);
        assert!(!port.user_read(CoreId(0)));
        assert!(!port.user_read(CoreId(1)));
    }
}
