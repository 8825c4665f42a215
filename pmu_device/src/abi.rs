//! Wire format of the control channel.
//!
//! The start payload is the C layout shared with ioctl callers: a native
//! endian `u64` event count followed by eight 8-byte event records, 72 bytes
//! in total, whatever the count. Both records are plain bytes, so the payload
//! is reinterpreted in place with `zerocopy` instead of being parsed.

use crate::{DeviceError, TransferFault};
use core::mem::size_of;
use x86_perf_counter::{CounterError, CounterSet, EventSpec, GENERAL_COUNTERS};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    /// Arm the counters with the [`RawStartParam`] payload.
    Start = 1,
    /// Disarm the counters, no payload.
    Stop = 2,
}

impl TryFrom<u32> for Opcode {
    type Error = DeviceError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Opcode::Start),
            2 => Ok(Opcode::Stop),
            other => Err(DeviceError::UnrecognizedOpcode(other)),
        }
    }
}

impl From<Opcode> for u32 {
    fn from(value: Opcode) -> Self {
        value as u32
    }
}

/// One event record; every flag byte is true when non-zero.
#[repr(C)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct RawPmuEvent {
    pub event: u8,
    pub umask: u8,
    pub cmask: u8,
    pub any: u8,
    pub inv: u8,
    pub edg: u8,
    pub user: u8,
    pub os: u8,
}

impl From<&EventSpec> for RawPmuEvent {
    fn from(value: &EventSpec) -> Self {
        Self {
            event: value.selector,
            umask: value.sub_selector,
            cmask: value.count_mask,
            any: value.any_thread as u8,
            inv: value.invert_mask as u8,
            edg: value.edge_detect as u8,
            user: value.count_user as u8,
            os: value.count_os as u8,
        }
    }
}

impl From<RawPmuEvent> for EventSpec {
    fn from(value: RawPmuEvent) -> Self {
        EventSpec {
            selector: value.event,
            sub_selector: value.umask,
            count_mask: value.cmask,
            any_thread: value.any != 0,
            invert_mask: value.inv != 0,
            edge_detect: value.edg != 0,
            count_user: value.user != 0,
            count_os: value.os != 0,
        }
    }
}

/// Payload of [`Opcode::Start`].
#[repr(C)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct RawStartParam {
    pub count: u64,
    pub events: [RawPmuEvent; GENERAL_COUNTERS],
}

pub const START_PARAM_SIZE: usize = size_of::<RawStartParam>();

const _: () = assert!(START_PARAM_SIZE == 72);

impl RawStartParam {
    /// Copies a payload out of untrusted memory.
    ///
    /// # Errors
    ///
    /// [`TransferFault`] unless `bytes` is exactly [`START_PARAM_SIZE`] long.
    pub fn copy_from(bytes: &[u8]) -> Result<Self, TransferFault> {
        Self::read_from_bytes(bytes).map_err(|_| TransferFault {
            expected: START_PARAM_SIZE,
            actual: bytes.len(),
        })
    }

    /// The events the payload names.
    ///
    /// # Errors
    ///
    /// [`CounterError::OutOfRangeCount`] if `count` exceeds the eight records.
    pub fn counter_set(&self) -> Result<CounterSet, CounterError> {
        if self.count > GENERAL_COUNTERS as u64 {
            return Err(CounterError::OutOfRangeCount { count: self.count });
        }
        let mut set = CounterSet::empty();
        for raw in &self.events[..self.count as usize] {
            set.push(EventSpec::from(*raw))?;
        }
        Ok(set)
    }
}

impl From<&CounterSet> for RawStartParam {
    fn from(value: &CounterSet) -> Self {
        let mut param = RawStartParam {
            count: value.len() as u64,
            ..Default::default()
        };
        for (raw, event) in param.events.iter_mut().zip(value.iter()) {
            *raw = RawPmuEvent::from(event);
        }
        param
    }
}

/// Copies a start payload across the trust boundary into an owned, validated
/// [`CounterSet`].
pub fn transfer(untrusted: &[u8]) -> Result<CounterSet, DeviceError> {
    let param = RawStartParam::copy_from(untrusted)?;
    Ok(param.counter_set()?)
}

/// Encodes `set` as a start payload.
pub fn encode(set: &CounterSet) -> [u8; START_PARAM_SIZE] {
    let mut bytes = [0u8; START_PARAM_SIZE];
    bytes.copy_from_slice(RawStartParam::from(set).as_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_set() -> CounterSet {
        CounterSet::new(&[
            EventSpec::new(0xa3, 0x14).with_count_mask(20),
            EventSpec::new(0xa6, 0x40),
            EventSpec::new(0x08, 0x10).with_count_mask(1).with_rings(true, false),
        ])
        .unwrap()
    }

    #[test]
    fn test_transfer_recovers_encoded_set() {
        let set = reference_set();
        assert_eq!(transfer(&encode(&set)), Ok(set));
    }

    #[test]
    fn test_record_layout() {
        let bytes = encode(&reference_set());
        assert_eq!(u64::from_ne_bytes(bytes[..8].try_into().unwrap()), 3);
        // event, umask, cmask, any, inv, edg, user, os
        assert_eq!(&bytes[8..16], &[0xa3, 0x14, 20, 0, 0, 0, 1, 1]);
        assert_eq!(&bytes[24..32], &[0x08, 0x10, 1, 0, 0, 0, 1, 0]);
        assert!(bytes[32..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_truncated_payload_is_a_transfer_fault() {
        let bytes = encode(&reference_set());
        assert_eq!(
            transfer(&bytes[..START_PARAM_SIZE - 1]),
            Err(DeviceError::Transfer(TransferFault {
                expected: START_PARAM_SIZE,
                actual: START_PARAM_SIZE - 1
            }))
        );
        assert!(matches!(transfer(&[]), Err(DeviceError::Transfer(_))));
    }

    #[test]
    fn test_oversized_payload_is_a_transfer_fault() {
        let mut bytes = [0u8; START_PARAM_SIZE + 8];
        bytes[..START_PARAM_SIZE].copy_from_slice(&encode(&reference_set()));
        assert!(matches!(transfer(&bytes), Err(DeviceError::Transfer(_))));
    }

    #[test]
    fn test_count_of_nine_is_out_of_range() {
        let mut bytes = encode(&reference_set());
        bytes[..8].copy_from_slice(&9u64.to_ne_bytes());
        assert_eq!(
            transfer(&bytes),
            Err(DeviceError::Counter(CounterError::OutOfRangeCount { count: 9 }))
        );

        bytes[..8].copy_from_slice(&u64::MAX.to_ne_bytes());
        assert!(matches!(
            transfer(&bytes),
            Err(DeviceError::Counter(CounterError::OutOfRangeCount { .. }))
        ));
    }

    #[test]
    fn test_nonzero_flag_bytes_are_true() {
        let mut bytes = encode(&CounterSet::new(&[EventSpec::new(0x3c, 0)]).unwrap());
        bytes[8 + 3] = 0x80; // any
        bytes[8 + 5] = 7; // edg
        let set = transfer(&bytes).unwrap();
        let event = set.get(0).unwrap();
        assert!(event.any_thread);
        assert!(event.edge_detect);
        assert!(!event.invert_mask);
    }

    #[test]
    fn test_opcodes() {
        assert_eq!(Opcode::try_from(1), Ok(Opcode::Start));
        assert_eq!(Opcode::try_from(2), Ok(Opcode::Stop));
        assert_eq!(Opcode::try_from(3), Err(DeviceError::UnrecognizedOpcode(3)));
        assert_eq!(u32::from(Opcode::Stop), 2);
    }
}
