use crate::{CounterError, GENERAL_COUNTERS};
use core::slice;
use serde::{Deserialize, Serialize};

/// One micro-architectural event to be counted by a general-purpose counter.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq, Hash)]
pub struct EventSpec {
    /// Event select, bits 0..=7 of IA32_PERFEVTSELx.
    pub selector: u8,
    /// Unit mask (umask), bits 8..=15.
    #[serde(default)]
    pub sub_selector: u8,
    /// Counter mask (cmask), bits 24..=31. When non-zero the counter only
    /// increments in cycles where the event occurred at least this often.
    #[serde(default)]
    pub count_mask: u8,
    #[serde(default)]
    pub any_thread: bool,
    #[serde(default)]
    pub invert_mask: bool,
    #[serde(default)]
    pub edge_detect: bool,
    /// Count in ring 3. Defaults to on when deserialized.
    #[serde(default = "enabled")]
    pub count_user: bool,
    /// Count in ring 0. Defaults to on when deserialized.
    #[serde(default = "enabled")]
    pub count_os: bool,
}

fn enabled() -> bool {
    true
}

impl EventSpec {
    /// An event counted in both user and kernel mode, the way every event of
    /// the built-in catalog is counted.
    pub const fn new(selector: u8, sub_selector: u8) -> Self {
        Self {
            selector,
            sub_selector,
            count_mask: 0,
            any_thread: false,
            invert_mask: false,
            edge_detect: false,
            count_user: true,
            count_os: true,
        }
    }

    pub const fn with_count_mask(mut self, count_mask: u8) -> Self {
        self.count_mask = count_mask;
        self
    }

    pub const fn with_edge_detect(mut self, edge_detect: bool) -> Self {
        self.edge_detect = edge_detect;
        self
    }

    pub const fn with_invert_mask(mut self, invert_mask: bool) -> Self {
        self.invert_mask = invert_mask;
        self
    }

    pub const fn with_any_thread(mut self, any_thread: bool) -> Self {
        self.any_thread = any_thread;
        self
    }

    pub const fn with_rings(mut self, count_user: bool, count_os: bool) -> Self {
        self.count_user = count_user;
        self.count_os = count_os;
        self
    }
}

impl AsRef<EventSpec> for EventSpec {
    fn as_ref(&self) -> &EventSpec {
        self
    }
}

/// An ordered set of at most [`GENERAL_COUNTERS`] events. The position of an
/// event is the index of the general-purpose counter it is programmed into.
///
/// The set is a fixed-size value, so handing it to the
/// [`Programmer`](crate::Programmer) always copies it.
#[derive(Clone, Copy, Debug)]
pub struct CounterSet {
    events: [EventSpec; GENERAL_COUNTERS],
    count: usize,
}

impl CounterSet {
    /// A set with no events; every general-purpose counter stays disabled.
    pub const fn empty() -> Self {
        Self {
            events: [EventSpec::new(0, 0); GENERAL_COUNTERS],
            count: 0,
        }
    }

    /// Builds a set from `events`, in order.
    ///
    /// # Errors
    ///
    /// [`CounterError::OutOfRangeCount`] if more events are given than there
    /// are general-purpose counters.
    pub fn new(events: &[EventSpec]) -> Result<Self, CounterError> {
        if events.len() > GENERAL_COUNTERS {
            return Err(CounterError::OutOfRangeCount {
                count: events.len() as u64,
            });
        }
        let mut set = Self::empty();
        set.events[..events.len()].copy_from_slice(events);
        set.count = events.len();
        Ok(set)
    }

    /// Appends `event`, assigning it the next free counter index.
    pub fn push(&mut self, event: EventSpec) -> Result<usize, CounterError> {
        if self.count == GENERAL_COUNTERS {
            return Err(CounterError::OutOfRangeCount {
                count: self.count as u64 + 1,
            });
        }
        let index = self.count;
        self.events[index] = event;
        self.count += 1;
        Ok(index)
    }

    /// Number of events, which is also the number of counters in use.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The event programmed into general-purpose counter `index`.
    pub fn get(&self, index: usize) -> Option<&EventSpec> {
        self.as_slice().get(index)
    }

    /// The events, without the unused tail of the table.
    pub fn as_slice(&self) -> &[EventSpec] {
        &self.events[..self.count]
    }

    /// Iterates in counter order.
    pub fn iter(&self) -> slice::Iter<'_, EventSpec> {
        self.as_slice().iter()
    }
}

impl Default for CounterSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for CounterSet {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for CounterSet {}

impl<'a> IntoIterator for &'a CounterSet {
    type Item = &'a EventSpec;
    type IntoIter = slice::Iter<'a, EventSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl TryFrom<&[EventSpec]> for CounterSet {
    type Error = CounterError;

    fn try_from(value: &[EventSpec]) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_set_keeps_insertion_order() {
        let events = [EventSpec::new(0x9c, 0x01), EventSpec::new(0x0e, 0x01)];
        let set = CounterSet::new(&events).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(0), Some(&events[0]));
        assert_eq!(set.get(1), Some(&events[1]));
        assert_eq!(set.get(2), None);
    }

    #[test]
    fn test_counter_set_rejects_nine_events() {
        let events = [EventSpec::new(0x3c, 0); 9];
        assert_eq!(
            CounterSet::new(&events),
            Err(CounterError::OutOfRangeCount { count: 9 })
        );
    }

    #[test]
    fn test_push_stops_at_counter_limit() {
        let mut set = CounterSet::empty();
        for i in 0..GENERAL_COUNTERS {
            assert_eq!(set.push(EventSpec::new(i as u8, 0)), Ok(i));
        }
        assert_eq!(
            set.push(EventSpec::new(0xff, 0)),
            Err(CounterError::OutOfRangeCount { count: 9 })
        );
        assert_eq!(set.len(), GENERAL_COUNTERS);
    }

    #[test]
    fn test_deserialized_event_counts_both_rings() {
        let event: EventSpec = serde_json::from_str(r#"{"selector": 60}"#).unwrap();
        assert_eq!(event, EventSpec::new(0x3c, 0));

        let event: EventSpec =
            serde_json::from_str(r#"{"selector": 8, "sub_selector": 16, "count_os": false}"#)
                .unwrap();
        assert_eq!(event, EventSpec::new(0x08, 0x10).with_rings(true, false));
    }

    #[test]
    fn test_builder_sets_qualifiers() {
        let event = EventSpec::new(0xa3, 0x14)
            .with_count_mask(20)
            .with_edge_detect(true)
            .with_rings(true, false);
        assert_eq!(event.count_mask, 20);
        assert!(event.edge_detect);
        assert!(event.count_user);
        assert!(!event.count_os);
        assert!(!event.any_thread);
    }
}
