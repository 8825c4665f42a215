//! The built-in event sets, one per top-down analysis level, and custom sets
//! loaded from JSON.

use crate::SampleError;
use std::fs;
use std::path::Path;
use x86_perf_counter::{CounterError, CounterSet, EventSpec};

/// An event together with its Intel mnemonic.
#[derive(Clone, Copy, Debug)]
pub struct NamedEvent {
    pub name: &'static str,
    pub event: EventSpec,
}

const fn named(name: &'static str, event: EventSpec) -> NamedEvent {
    NamedEvent { name, event }
}

#[derive(Clone, Copy, Debug)]
pub struct EventLevel {
    pub level: u64,
    pub description: &'static str,
    pub events: &'static [NamedEvent],
}

impl EventLevel {
    /// The level's events in counter order.
    ///
    /// # Errors
    ///
    /// [`CounterError::OutOfRangeCount`] if the level names more events than
    /// there are general-purpose counters.
    pub fn counter_set(&self) -> Result<CounterSet, CounterError> {
        let events: Vec<EventSpec> = self.events.iter().map(|named| named.event).collect();
        CounterSet::new(&events)
    }
}

const IDQ_UOPS_NOT_DELIVERED_CORE: NamedEvent =
    named("IDQ_UOPS_NOT_DELIVERED.CORE", EventSpec::new(0x9c, 0x01));
const UOPS_ISSUED_ANY: NamedEvent = named("UOPS_ISSUED.ANY", EventSpec::new(0x0e, 0x01));
const UOPS_RETIRED_RETIRE_SLOTS: NamedEvent =
    named("UOPS_RETIRED.RETIRE_SLOTS", EventSpec::new(0xc2, 0x02));
const INT_MISC_RECOVERY_CYCLES: NamedEvent =
    named("INT_MISC.RECOVERY_CYCLES", EventSpec::new(0x0d, 0x01));
const CYCLE_ACTIVITY_STALLS_MEM_ANY: NamedEvent = named(
    "CYCLE_ACTIVITY.STALLS_MEM_ANY",
    EventSpec::new(0xa3, 0x14).with_count_mask(20),
);
const EXE_ACTIVITY_BOUND_ON_STORES: NamedEvent =
    named("EXE_ACTIVITY.BOUND_ON_STORES", EventSpec::new(0xa6, 0x40));

pub const LEVELS: &[EventLevel] = &[
    EventLevel {
        level: 1,
        description: "top-down level 1",
        events: &[
            IDQ_UOPS_NOT_DELIVERED_CORE,
            UOPS_ISSUED_ANY,
            UOPS_RETIRED_RETIRE_SLOTS,
            INT_MISC_RECOVERY_CYCLES,
        ],
    },
    EventLevel {
        level: 2,
        description: "top-down level 2",
        events: &[
            CYCLE_ACTIVITY_STALLS_MEM_ANY,
            EXE_ACTIVITY_BOUND_ON_STORES,
            named("EXE_ACTIVITY.EXE_BOUND_0_PORTS", EventSpec::new(0xa6, 0x01)),
            named("EXE_ACTIVITY.1_PORTS_UTIL", EventSpec::new(0xa6, 0x02)),
            IDQ_UOPS_NOT_DELIVERED_CORE,
            UOPS_ISSUED_ANY,
            UOPS_RETIRED_RETIRE_SLOTS,
            INT_MISC_RECOVERY_CYCLES,
        ],
    },
    EventLevel {
        level: 3,
        description: "memory bound",
        events: &[
            CYCLE_ACTIVITY_STALLS_MEM_ANY,
            named(
                "CYCLE_ACTIVITY.STALLS_L1D_MISS",
                EventSpec::new(0xa3, 0x08).with_count_mask(8),
            ),
            named(
                "CYCLE_ACTIVITY.STALLS_L2_MISS",
                EventSpec::new(0xa3, 0x05).with_count_mask(5),
            ),
            named(
                "CYCLE_ACTIVITY.STALLS_L3_MISS",
                EventSpec::new(0xa3, 0x06).with_count_mask(6),
            ),
            EXE_ACTIVITY_BOUND_ON_STORES,
            named("DTLB_LOAD_MISSES.STLB_HIT", EventSpec::new(0x08, 0x20)),
            named(
                "DTLB_LOAD_MISSES.WALK_ACTIVE",
                EventSpec::new(0x08, 0x10).with_count_mask(1),
            ),
            named("LD_BLOCKS.STORE_FORWARD", EventSpec::new(0x03, 0x02)),
        ],
    },
    EventLevel {
        level: 4,
        description: "L1 bound, part 0",
        events: &[
            named("L1D_PEND_MISS.PENDING", EventSpec::new(0x48, 0x01)),
            named("MEM_LOAD_RETIRED.L1_MISS", EventSpec::new(0xd1, 0x08)),
            named("MEM_LOAD_RETIRED.FB_HIT", EventSpec::new(0xd1, 0x40)),
            named("L1D_PEND_MISS.FB_FULL", EventSpec::new(0x48, 0x02)),
            named("LD_BLOCKS.NO_SR", EventSpec::new(0x03, 0x08)),
            named("LD_BLOCKS_PARTIAL.ADDRESS_ALIAS", EventSpec::new(0x07, 0x01)),
        ],
    },
    EventLevel {
        level: 5,
        description: "L1 bound, part 1",
        events: &[
            named("MEM_INST_RETIRED.LOCK_LOADS", EventSpec::new(0xd0, 0x21)),
            named("MEM_INST_RETIRED.ALL_STORES", EventSpec::new(0xd0, 0x82)),
            named("CPU_CLK_UNHALTED.THREAD", EventSpec::new(0x3c, 0x00)),
            named(
                "OFFCORE_REQUESTS_OUTSTANDING.CYCLES_WITH_DEMAND_RFO",
                EventSpec::new(0x60, 0x04).with_count_mask(1),
            ),
        ],
    },
];

/// Looks up a built-in level.
pub fn level(level: u64) -> Result<&'static EventLevel, SampleError> {
    LEVELS
        .iter()
        .find(|entry| entry.level == level)
        .ok_or(SampleError::UnrecognizedLevel(level))
}

/// Parses a JSON array of events, e.g.
/// `[{"selector": 60}, {"selector": 8, "sub_selector": 16, "count_mask": 1}]`.
pub fn parse_events(json: &str) -> Result<CounterSet, SampleError> {
    let events: Vec<EventSpec> = serde_json::from_str(json)?;
    Ok(CounterSet::new(&events)?)
}

pub fn load_events(path: impl AsRef<Path>) -> Result<CounterSet, SampleError> {
    let path = path.as_ref();
    let json = fs::read_to_string(path).map_err(SampleError::io(path))?;
    parse_events(&json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use x86_perf_counter::GENERAL_COUNTERS;

    #[test]
    fn test_levels_fit() {
        for entry in LEVELS {
            assert!(entry.events.len() <= GENERAL_COUNTERS, "level {}", entry.level);
            assert_eq!(entry.counter_set().unwrap().len(), entry.events.len());
        }
    }

    #[test]
    fn test_oversized_level_is_rejected() {
        static EVENTS: [NamedEvent; GENERAL_COUNTERS + 1] = [UOPS_ISSUED_ANY; GENERAL_COUNTERS + 1];
        let entry = EventLevel {
            level: 9,
            description: "too many",
            events: &EVENTS,
        };
        assert_eq!(
            entry.counter_set(),
            Err(CounterError::OutOfRangeCount { count: 9 })
        );
    }

    #[test]
    fn test_level_sizes() {
        let sizes: Vec<_> = (1..=5).map(|l| level(l).unwrap().events.len()).collect();
        assert_eq!(sizes, [4, 8, 8, 6, 4]);
    }

    #[test]
    fn test_catalog_counts_both_rings() {
        for entry in LEVELS {
            for named in entry.events {
                assert!(named.event.count_user && named.event.count_os, "{}", named.name);
            }
        }
    }

    #[test]
    fn test_level_one_order() {
        let set = level(1).unwrap().counter_set().unwrap();
        let selectors: Vec<_> = set.iter().map(|e| (e.selector, e.sub_selector)).collect();
        assert_eq!(selectors, [(0x9c, 0x01), (0x0e, 0x01), (0xc2, 0x02), (0x0d, 0x01)]);
    }

    #[test]
    fn test_unknown_level() {
        assert!(matches!(level(0), Err(SampleError::UnrecognizedLevel(0))));
        assert!(matches!(level(6), Err(SampleError::UnrecognizedLevel(6))));
    }

    #[test]
    fn test_parse_events() {
        let set = parse_events(
            r#"[{"selector": 60}, {"selector": 8, "sub_selector": 16, "count_mask": 1}]"#,
        )
        .unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(1), Some(&EventSpec::new(0x08, 0x10).with_count_mask(1)));
    }

    #[test]
    fn test_parse_rejects_nine_events() {
        let json = format!("[{}]", vec![r#"{"selector": 60}"#; 9].join(","));
        assert!(matches!(
            parse_events(&json),
            Err(SampleError::Counter(CounterError::OutOfRangeCount { count: 9 }))
        ));
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        assert!(matches!(parse_events("[{"), Err(SampleError::EventFile(_))));
        assert!(matches!(
            parse_events(r#"[{"sub_selector": 1}]"#),
            Err(SampleError::EventFile(_))
        ));
    }

    #[test]
    fn test_load_events_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"selector": 14, "sub_selector": 1}}]"#).unwrap();
        let set = load_events(file.path()).unwrap();
        assert_eq!(set.as_slice(), &[EventSpec::new(0x0e, 0x01)]);

        assert!(matches!(
            load_events("/nonexistent/events.json"),
            Err(SampleError::Io { .. })
        ));
    }
}
