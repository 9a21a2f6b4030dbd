use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Lesson number within a school day.
pub type Slot = u8;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];
}

/// Weekdays that take part in compatibility checks unless configured otherwise.
///
/// Availability entered for Saturday or Sunday is stored but never produces
/// an overlap with this set.
pub const SCHOOL_WEEK: [Weekday; 5] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
];

/// Weekly availability: for each weekday, the lesson slots someone is free.
///
/// Serialized as `{"mon": [1, 3], "tue": []}`. Missing days are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Availability(BTreeMap<Weekday, BTreeSet<Slot>>);

impl Availability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `slots` to `day`, keeping whatever was there already.
    pub fn with(mut self, day: Weekday, slots: impl IntoIterator<Item = Slot>) -> Self {
        self.0.entry(day).or_default().extend(slots);
        self
    }

    pub fn slots(&self, day: Weekday) -> Option<&BTreeSet<Slot>> {
        self.0.get(&day)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeSet::is_empty)
    }
}

/// Decides which weekdays count when testing two availabilities for overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapPolicy {
    weekdays: BTreeSet<Weekday>,
}

impl Default for OverlapPolicy {
    fn default() -> Self {
        Self::new(SCHOOL_WEEK)
    }
}

impl OverlapPolicy {
    pub fn new(weekdays: impl IntoIterator<Item = Weekday>) -> Self {
        Self {
            weekdays: weekdays.into_iter().collect(),
        }
    }

    /// True when `a` and `b` share a slot on any participating weekday.
    pub fn overlaps(&self, a: &Availability, b: &Availability) -> bool {
        self.weekdays.iter().any(|day| match (a.slots(*day), b.slots(*day)) {
            (Some(left), Some(right)) => !left.is_disjoint(right),
            _ => false,
        })
    }
}

/// [`OverlapPolicy::overlaps`] over [`SCHOOL_WEEK`].
pub fn overlaps(a: &Availability, b: &Availability) -> bool {
    OverlapPolicy::default().overlaps(a, b)
}
