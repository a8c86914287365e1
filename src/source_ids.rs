//! Bounded history of recently accepted source ids.

use std::collections::VecDeque;

use crate::identity::SourceId;

/// Default number of source ids a host remembers.
pub const DEFAULT_SOURCE_ID_HISTORY: usize = 100;

/// Fixed-capacity FIFO ring of previously seen source ids.
///
/// Membership drives command de-duplication. When full, pushing evicts the
/// oldest entry. Lookups never reorder entries.
#[derive(Debug, Clone)]
pub struct SourceIdHistory {
    capacity: usize,
    entries: VecDeque<SourceId>,
}

impl SourceIdHistory {
    /// Create an empty history holding at most `capacity` ids.
    ///
    /// A capacity of zero disables de-duplication.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Record a source id, evicting the oldest one if the ring is full.
    pub fn push(&mut self, id: SourceId) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(id);
    }

    /// Whether `id` is among the remembered source ids.
    pub fn contains(&self, id: &SourceId) -> bool {
        self.entries.iter().any(|seen| seen == id)
    }

    /// Number of ids currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of ids held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for SourceIdHistory {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCE_ID_HISTORY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(n: usize) -> SourceId {
        SourceId::new(format!("cmd-{n}")).unwrap()
    }

    #[test]
    fn remembers_pushed_ids() {
        let mut history = SourceIdHistory::new(3);
        history.push(sid(1));
        assert!(history.contains(&sid(1)));
        assert!(!history.contains(&sid(2)));
    }

    #[test]
    fn evicts_oldest_on_overflow() {
        let mut history = SourceIdHistory::new(3);
        for n in 1..=4 {
            history.push(sid(n));
        }
        assert_eq!(history.len(), 3);
        assert!(!history.contains(&sid(1)));
        assert!(history.contains(&sid(2)));
        assert!(history.contains(&sid(4)));
    }

    #[test]
    fn lookup_does_not_refresh_entries() {
        let mut history = SourceIdHistory::new(2);
        history.push(sid(1));
        history.push(sid(2));
        // Pure FIFO: touching id 1 must not protect it from eviction.
        assert!(history.contains(&sid(1)));
        history.push(sid(3));
        assert!(!history.contains(&sid(1)));
        assert!(history.contains(&sid(2)));
    }

    #[test]
    fn zero_capacity_remembers_nothing() {
        let mut history = SourceIdHistory::new(0);
        history.push(sid(1));
        assert!(history.is_empty());
        assert!(!history.contains(&sid(1)));
    }

    #[test]
    fn default_capacity_is_one_hundred() {
        assert_eq!(SourceIdHistory::default().capacity(), 100);
    }
}
