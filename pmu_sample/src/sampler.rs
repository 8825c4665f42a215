use crate::{ControlChannel, Report, SampleError};
use log::info;
use x86_perf_counter::{delta, CounterReader, CounterSet, FastCounterRead, SampleBuffer};

/// Counter and time stamp values at the beginning of an interval.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Mark {
    pub tsc: u64,
    pub counters: SampleBuffer,
}

/// Drives one sampling run: arm the counters, take start and end samples
/// around the work being measured, disarm.
pub struct Sampler<C, R> {
    channel: C,
    reader: CounterReader<R>,
    clock: fn() -> u64,
}

impl<C: ControlChannel, R: FastCounterRead> Sampler<C, R> {
    /// `clock` supplies the time stamp of each sample, normally `rdtsc`.
    pub fn new(channel: C, source: R, clock: fn() -> u64) -> Self {
        Self {
            channel,
            reader: CounterReader::new(source),
            clock,
        }
    }

    pub fn start(&mut self, events: &CounterSet) -> Result<(), SampleError> {
        info!("PMU ENABLED");
        self.channel.request_start(events)
    }

    pub fn stop(&mut self) -> Result<(), SampleError> {
        self.channel.request_stop()
    }

    #[inline(always)]
    pub fn read_start(&self) -> Mark {
        let tsc = (self.clock)();
        let counters = self.reader.sample_all();
        Mark { tsc, counters }
    }

    #[inline(always)]
    pub fn read_end(&self, start: &Mark) -> Report {
        let counters = self.reader.sample_all();
        let tsc = (self.clock)();
        Report {
            tsc: tsc.wrapping_sub(start.tsc),
            deltas: delta(&start.counters, &counters),
        }
    }

    /// Runs `work` between a start and an end sample.
    pub fn measure<T>(&self, work: impl FnOnce() -> T) -> (T, Report) {
        let start = self.read_start();
        let result = work();
        let report = self.read_end(&start);
        (result, report)
    }

    /// The channel start and stop requests go through.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }
}
