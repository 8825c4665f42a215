use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::fmt;
use x86_perf_counter::CounterDeltas;

/// The result of one measured interval.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Report {
    /// Time stamp counter ticks between the two samples.
    pub tsc: u64,
    pub deltas: CounterDeltas,
}

/// One line: the tsc delta, the three fixed counters, the eight
/// general-purpose counters.
impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.tsc, self.deltas)
    }
}

impl Serialize for Report {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut report = serializer.serialize_struct("Report", 3)?;
        report.serialize_field("tsc", &self.tsc)?;
        report.serialize_field("fixed", self.deltas.fixed())?;
        report.serialize_field("general", self.deltas.general())?;
        report.end()
    }
}
