//! Bit layouts of the performance monitoring control registers.

use crate::{EventSpec, FIXED_COUNTERS, GENERAL_COUNTERS};
use bitfield::bitfield;

bitfield! {
    /// IA32_PERFEVTSELx, the configuration of one general-purpose counter.
    ///
    /// Pin control (bit 19) and the APIC interrupt enable (bit 20) are never
    /// set by this crate.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct PerfEventSelect(u64);
    impl Debug;

    /// Event select, picks the event unit on the core.
    pub event_select, set_event_select: 7, 0;
    /// UMASK, narrows down what the selected event unit counts.
    pub umask, set_umask: 15, 8;
    /// Count while CPL > 0.
    pub user_mode, set_user_mode: 16;
    /// Count while CPL = 0.
    pub os_mode, set_os_mode: 17;
    /// Count deasserted-to-asserted transitions instead of cycles.
    pub edge_detect, set_edge_detect: 18;
    /// Toggle the PMi pins on increment.
    pub pin_control, set_pin_control: 19;
    /// Raise a PMI through the local APIC on overflow.
    pub apic_interrupt, set_apic_interrupt: 20;
    /// Count for both hyperthreads of the core.
    pub any_thread, set_any_thread: 21;
    /// EN, the per-counter enable. Counting also needs the matching
    /// IA32_PERF_GLOBAL_CTRL bit.
    pub enable_counters, set_enable_counters: 22;
    /// Count cycles where the event fires fewer than CMASK times.
    pub invert, set_invert: 23;
    /// CMASK, 0 counts every occurrence.
    pub counter_mask, set_counter_mask: 31, 24;
}

impl PerfEventSelect {
    pub const ENABLE: u64 = 1 << 22;
    pub const USR: u64 = 1 << 16;
    pub const OS: u64 = 1 << 17;

    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Builds the enabled event select value for `event`.
    ///
    /// The edge, any-thread and invert qualifiers are only encoded when
    /// `encode_qualifiers` is set; without it the value carries exactly
    /// enable, USR, OS, event, umask and cmask.
    pub fn for_event<A: AsRef<EventSpec>>(event: A, encode_qualifiers: bool) -> Self {
        let mut select = Self(0);
        select.apply_event_spec(event, encode_qualifiers);
        select.set_enable_counters(true);
        select
    }

    /// Copies the fields of `event` into the register, leaving the enable
    /// bit as it is.
    pub fn apply_event_spec<A: AsRef<EventSpec>>(
        &mut self,
        event: A,
        encode_qualifiers: bool,
    ) -> &mut Self {
        let event = event.as_ref();
        self.set_event_select(event.selector as u64);
        self.set_umask(event.sub_selector as u64);
        self.set_counter_mask(event.count_mask as u64);
        self.set_user_mode(event.count_user);
        self.set_os_mode(event.count_os);
        if encode_qualifiers {
            self.set_edge_detect(event.edge_detect);
            self.set_any_thread(event.any_thread);
            self.set_invert(event.invert_mask);
        }
        self
    }
}

/// Privilege levels a fixed counter counts in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedRing {
    pub user: bool,
    pub os: bool,
}

impl FixedRing {
    pub const ALL: FixedRing = FixedRing {
        user: true,
        os: true,
    };

    const fn bits(self) -> u64 {
        (self.os as u64) | ((self.user as u64) << 1)
    }
}

impl Default for FixedRing {
    fn default() -> Self {
        Self::ALL
    }
}

/// IA32_FIXED_CTR_CTRL: four bits per fixed counter, counter `n` owning bits
/// `4n..4n+4` (OS, USR, AnyThread, PMI from low to high).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedCounterControl(pub u64);

impl FixedCounterControl {
    const FIELD_WIDTH: usize = 4;

    pub const fn field_mask(index: usize) -> u64 {
        0xf << (index * Self::FIELD_WIDTH)
    }

    pub const fn field(&self, index: usize) -> u64 {
        (self.0 & Self::field_mask(index)) >> (index * Self::FIELD_WIDTH)
    }

    /// Replaces the field of counter `index`, leaving the other counters alone.
    pub fn set_ring(&mut self, index: usize, ring: FixedRing) -> &mut Self {
        self.0 &= !Self::field_mask(index);
        self.0 |= ring.bits() << (index * Self::FIELD_WIDTH);
        self
    }

    pub fn clear(&mut self, index: usize) -> &mut Self {
        self.0 &= !Self::field_mask(index);
        self
    }
}

/// IA32_PERF_GLOBAL_CTRL: general-purpose enables in the low bits, fixed
/// counter enables from bit 32.
pub struct GlobalControl;

impl GlobalControl {
    pub const DISABLED: u64 = 0;

    /// Every general-purpose and fixed counter enabled, `0x7_0000_00ff`.
    pub const ALL_COUNTERS: u64 =
        (((1 << FIXED_COUNTERS) - 1) << 32) | ((1 << GENERAL_COUNTERS) - 1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_select_matches_reference_layout() {
        let event = EventSpec::new(0x0e, 0x01);
        let select = PerfEventSelect::for_event(event, false);
        assert_eq!(
            select.raw(),
            PerfEventSelect::ENABLE | PerfEventSelect::USR | PerfEventSelect::OS | 0x0e | (0x01 << 8)
        );
        assert_eq!(select.raw(), 0x43010e);
    }

    #[test]
    fn test_event_select_counter_mask() {
        let event = EventSpec::new(0xa3, 0x14).with_count_mask(20);
        let select = PerfEventSelect::for_event(event, true);
        assert_eq!(select.counter_mask(), 20);
        assert_eq!(select.raw() >> 24, 20);
        assert_eq!(select.umask(), 0x14);
        assert_eq!(select.event_select(), 0xa3);
    }

    #[test]
    fn test_event_select_qualifiers_follow_encoding() {
        let event = EventSpec::new(0x08, 0x10)
            .with_edge_detect(true)
            .with_any_thread(true)
            .with_invert_mask(true);

        let plain = PerfEventSelect::for_event(event, false);
        assert!(!plain.edge_detect());
        assert!(!plain.any_thread());
        assert!(!plain.invert());

        let full = PerfEventSelect::for_event(event, true);
        assert!(full.edge_detect());
        assert!(full.any_thread());
        assert!(full.invert());
        assert_eq!(full.raw() & !plain.raw(), (1 << 18) | (1 << 21) | (1 << 23));
    }

    #[test]
    fn test_event_select_ring_bits() {
        let user_only = PerfEventSelect::for_event(EventSpec::new(0xc0, 0).with_rings(true, false), true);
        assert!(user_only.user_mode());
        assert!(!user_only.os_mode());
        assert!(user_only.enable_counters());
    }

    #[test]
    fn test_fixed_control_read_modify_write() {
        let mut control = FixedCounterControl(0xf00 | 0xb);
        control.set_ring(1, FixedRing::ALL);
        assert_eq!(control.0, 0xf00 | 0x30 | 0xb);

        control.set_ring(0, FixedRing { user: true, os: false });
        assert_eq!(control.field(0), 0x2);
        assert_eq!(control.field(2), 0xf);

        control.clear(1);
        assert_eq!(control.field(1), 0);
        assert_eq!(control.0, 0xf00 | 0x2);
    }

    #[test]
    fn test_global_enable_value() {
        assert_eq!(GlobalControl::ALL_COUNTERS, (0x7 << 32) | 0xff);
    }
}
