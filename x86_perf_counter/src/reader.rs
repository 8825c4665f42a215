//! Unprivileged sampling of the counter array.
//!
//! Reads are only meaningful while a [`Programmer`](crate::Programmer) has the
//! counters armed and user-mode `rdpmc` granted on the core the reader runs
//! on; a reader on another core samples that core's counters instead.

use crate::{COUNTER_MASK, FIXED_COUNTERS, GENERAL_COUNTERS, TOTAL_COUNTERS};
use core::fmt;

/// `rdpmc` selector bit choosing the fixed-function counters.
const FIXED_COUNTER_TYPE: u32 = 1 << 30;

/// The `rdpmc` selector of fixed counter `index`.
pub const fn fixed_selector(index: usize) -> u32 {
    index as u32 | FIXED_COUNTER_TYPE
}

/// A non-destructive, unprivileged read of one counter.
pub trait FastCounterRead {
    /// Reads the counter named by `selector`: general-purpose counters by
    /// their index, fixed counters by [`fixed_selector`].
    fn read_counter(&self, selector: u32) -> u64;
}

impl<R: FastCounterRead + ?Sized> FastCounterRead for &R {
    fn read_counter(&self, selector: u32) -> u64 {
        (**self).read_counter(selector)
    }
}

/// Values of every counter at one point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SampleBuffer {
    pub fixed: [u64; FIXED_COUNTERS],
    pub general: [u64; GENERAL_COUNTERS],
}

/// Samples all eleven counters through a [`FastCounterRead`] source.
///
/// Sampling never writes a register, so a reader can be shared freely with
/// the code being measured on the same core.
pub struct CounterReader<R> {
    source: R,
}

impl<R: FastCounterRead> CounterReader<R> {
    /// # Arguments
    ///
    /// * `source` - `Rdpmc` on hardware, an emulated source
    ///   elsewhere
    pub fn new(source: R) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &R {
        &self.source
    }

    /// Reads the three fixed counters, then the eight general-purpose ones.
    #[inline(always)]
    pub fn sample_all(&self) -> SampleBuffer {
        let mut buffer = SampleBuffer::default();
        self.sample_into(&mut buffer);
        buffer
    }

    /// Like [`sample_all`](Self::sample_all), overwriting `buffer`.
    #[inline(always)]
    pub fn sample_into(&self, buffer: &mut SampleBuffer) {
        for (index, value) in buffer.fixed.iter_mut().enumerate() {
            *value = self.source.read_counter(fixed_selector(index));
        }
        for (index, value) in buffer.general.iter_mut().enumerate() {
            *value = self.source.read_counter(index as u32);
        }
    }
}

/// Per-counter increments between two samples, fixed counters first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterDeltas(pub [u64; TOTAL_COUNTERS]);

impl CounterDeltas {
    pub fn fixed(&self) -> &[u64] {
        &self.0[..FIXED_COUNTERS]
    }

    pub fn general(&self) -> &[u64] {
        &self.0[FIXED_COUNTERS..]
    }

    pub fn iter(&self) -> core::slice::Iter<'_, u64> {
        self.0.iter()
    }
}

impl fmt::Display for CounterDeltas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", value)?;
        }
        Ok(())
    }
}

/// Counter increments from `start` to `end`.
///
/// The difference is taken modulo the 48-bit counter width, so a counter that
/// wrapped once in between still yields its increment. An interval in which a
/// counter advances by 2^48 or more cannot be told apart from a shorter one.
pub fn delta(start: &SampleBuffer, end: &SampleBuffer) -> CounterDeltas {
    let starts = start.fixed.iter().chain(start.general.iter());
    let ends = end.fixed.iter().chain(end.general.iter());

    let mut deltas = CounterDeltas::default();
    for (slot, (s, e)) in deltas.0.iter_mut().zip(starts.zip(ends)) {
        *slot = e.wrapping_sub(*s) & COUNTER_MASK;
    }
    deltas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulation::EmulatedCounters;
    use crate::COUNTER_INITIAL_VALUE;

    #[test]
    fn test_delta_of_same_sample_is_zero() {
        let sample = SampleBuffer {
            fixed: [1, 2, 3],
            general: [4, 5, 6, 7, 8, 9, 10, 11],
        };
        assert_eq!(delta(&sample, &sample), CounterDeltas::default());
    }

    #[test]
    fn test_delta_is_index_wise() {
        let start = SampleBuffer {
            fixed: [100, 200, 300],
            general: [0; GENERAL_COUNTERS],
        };
        let mut end = start;
        end.fixed[1] += 7;
        end.general[5] = 42;

        let deltas = delta(&start, &end);
        assert_eq!(deltas.fixed(), &[0, 7, 0]);
        assert_eq!(deltas.general(), &[0, 0, 0, 0, 0, 42, 0, 0]);
    }

    #[test]
    fn test_delta_across_counter_wrap() {
        let mut start = SampleBuffer::default();
        let mut end = SampleBuffer::default();
        start.general[0] = COUNTER_MASK - 4;
        end.general[0] = 5;
        assert_eq!(delta(&start, &end).general()[0], 10);
    }

    #[test]
    fn test_sample_order_and_selectors() {
        let counters = EmulatedCounters::new(0);
        counters.set(fixed_selector(2), 33);
        counters.set(7, 77);

        let sample = CounterReader::new(&counters).sample_all();
        assert_eq!(sample.fixed, [0, 0, 33]);
        assert_eq!(sample.general[7], 77);
        assert_eq!(
            counters.reads(),
            [
                fixed_selector(0),
                fixed_selector(1),
                fixed_selector(2),
                0,
                1,
                2,
                3,
                4,
                5,
                6,
                7
            ]
        );
    }

    #[test]
    fn test_back_to_back_samples_are_bounded() {
        let counters = EmulatedCounters::new(1);
        for index in 0..FIXED_COUNTERS {
            counters.set(fixed_selector(index), COUNTER_INITIAL_VALUE);
        }
        for index in 0..GENERAL_COUNTERS {
            counters.set(index as u32, COUNTER_INITIAL_VALUE);
        }

        let reader = CounterReader::new(&counters);
        let start = reader.sample_all();
        let end = reader.sample_all();
        for value in delta(&start, &end).iter() {
            assert!(*value <= 1);
        }
    }

    #[test]
    fn test_deltas_display() {
        let mut deltas = CounterDeltas::default();
        deltas.0[0] = 12;
        deltas.0[10] = 3;
        assert_eq!(deltas.to_string(), "12 0 0 0 0 0 0 0 0 0 3");
    }
}
