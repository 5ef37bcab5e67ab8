//! Signal registry.
//!
//! Holds the current value and metadata of every signal announced by the
//! controller, in the order the snapshot announced them. Lookups are by
//! full dotted name; charts use leaf names and live in `super::chart`.

use crate::hep::proto::{ChartSpec, Direction, SnapshotRecord, Widget};
use std::collections::HashMap;

/// Current state of a single signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    /// Full dotted name, e.g. `living.light`.
    pub name: String,
    pub value: String,
    pub direction: Direction,
    pub widget: Widget,
    pub chart: Option<ChartSpec>,
}

/// Result of applying a live value change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The signal was known and its value was replaced.
    Updated,
    /// No signal with that name exists, a fresh snapshot is needed.
    Unknown,
}

/// Insertion-ordered set of signals with by-name lookup.
pub struct SignalRegistry {
    signals: Vec<Signal>,
    index: HashMap<String, usize>,
}

impl SignalRegistry {
    pub fn new() -> SignalRegistry {
        SignalRegistry {
            signals: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Forgets all signals. Iteration order restarts from scratch.
    pub fn clear(&mut self) {
        self.signals.clear();
        self.index.clear();
    }

    /// Inserts or replaces a signal from a snapshot record. A replaced
    /// signal keeps its original position in iteration order.
    pub fn upsert(&mut self, rec: SnapshotRecord) -> &Signal {
        let signal = Signal {
            name: rec.name,
            value: rec.value,
            direction: rec.direction,
            widget: rec.widget,
            chart: rec.chart,
        };
        match self.index.get(&signal.name) {
            Some(&i) => {
                self.signals[i] = signal;
                &self.signals[i]
            }
            None => {
                self.index.insert(signal.name.clone(), self.signals.len());
                self.signals.push(signal);
                self.signals.last().unwrap()
            }
        }
    }

    /// Applies a live value change to a known signal.
    pub fn update(&mut self, name: &str, value: &str) -> UpdateOutcome {
        match self.index.get(name) {
            Some(&i) => {
                self.signals[i].value = value.to_string();
                UpdateOutcome::Updated
            }
            None => UpdateOutcome::Unknown,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Signal> {
        self.index.get(name).map(|&i| &self.signals[i])
    }

    /// Iterates signals in announcement order.
    pub fn iter(&self) -> impl Iterator<Item = &Signal> {
        self.signals.iter()
    }
}

impl Default for SignalRegistry {
    fn default() -> SignalRegistry {
        SignalRegistry::new()
    }
}
