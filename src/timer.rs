// src/timer.rs
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

/// Idle-eviction deadline registry.
///
/// An ordered index over (deadline, connection id) plus a back-reference
/// keyed by connection id, so the head always holds the earliest deadline
/// and an interior entry can be removed or reinserted without scanning.
/// At most one live entry exists per connection; `add` on an existing id
/// replaces its deadline.
///
/// Pure data structure plus callback dispatch: no I/O, and it is only ever
/// touched from the reactor thread.
#[derive(Debug, Default)]
pub struct TimerList {
    ordered: BTreeSet<(Instant, usize)>,
    deadlines: HashMap<usize, Instant>,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: usize, deadline: Instant) {
        if let Some(old) = self.deadlines.insert(id, deadline) {
            self.ordered.remove(&(old, id));
        }
        self.ordered.insert((deadline, id));
    }

    /// Remove and reinsert to keep the global ordering.
    pub fn adjust(&mut self, id: usize, deadline: Instant) {
        self.add(id, deadline);
    }

    pub fn remove(&mut self, id: usize) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => {
                self.ordered.remove(&(deadline, id));
                true
            }
            None => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.ordered.first().map(|&(deadline, _)| deadline)
    }

    /// Fire `evict` for every entry with deadline <= now, in non-decreasing
    /// deadline order, stopping at the first still-live deadline. The entry
    /// is removed before the callback runs, so the callback owns all
    /// remaining connection state.
    pub fn tick(&mut self, now: Instant, mut evict: impl FnMut(usize)) -> usize {
        let mut fired = 0;
        while let Some(&(deadline, id)) = self.ordered.first() {
            if deadline > now {
                break;
            }
            self.ordered.remove(&(deadline, id));
            self.deadlines.remove(&id);
            evict(id);
            fired += 1;
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn tick_evicts_exactly_expired_in_order() {
        let mut timers = TimerList::new();
        let base = Instant::now();
        timers.add(1, base + Duration::from_secs(1));
        timers.add(2, base + Duration::from_secs(2));
        timers.add(3, base + Duration::from_secs(3));
        timers.add(4, base + Duration::from_secs(10));

        let mut evicted = Vec::new();
        let fired = timers.tick(base + Duration::from_secs(3), |id| evicted.push(id));
        assert_eq!(fired, 3);
        assert_eq!(evicted, vec![1, 2, 3]);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_deadline(), Some(base + Duration::from_secs(10)));
    }

    #[test]
    fn adjust_moves_entry_toward_tail() {
        let mut timers = TimerList::new();
        let base = Instant::now();
        timers.add(1, base + Duration::from_secs(1));
        timers.add(2, base + Duration::from_secs(2));

        timers.adjust(1, base + Duration::from_secs(5));
        assert_eq!(timers.len(), 2);

        let mut evicted = Vec::new();
        timers.tick(base + Duration::from_secs(3), |id| evicted.push(id));
        assert_eq!(evicted, vec![2]);

        evicted.clear();
        timers.tick(base + Duration::from_secs(5), |id| evicted.push(id));
        assert_eq!(evicted, vec![1]);
        assert!(timers.is_empty());
    }

    #[test]
    fn at_most_one_entry_per_connection() {
        let mut timers = TimerList::new();
        let base = Instant::now();
        timers.add(7, base + Duration::from_secs(1));
        timers.add(7, base + Duration::from_secs(2));
        assert_eq!(timers.len(), 1);

        let mut evicted = Vec::new();
        timers.tick(base + Duration::from_secs(1), |id| evicted.push(id));
        assert!(evicted.is_empty());
        timers.tick(base + Duration::from_secs(2), |id| evicted.push(id));
        assert_eq!(evicted, vec![7]);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut timers = TimerList::new();
        let base = Instant::now();
        timers.add(9, base);
        assert!(timers.remove(9));
        assert!(!timers.remove(9));
        assert!(timers.is_empty());

        let fired = timers.tick(base + Duration::from_secs(1), |_| panic!("nothing to evict"));
        assert_eq!(fired, 0);
    }

    #[test]
    fn identical_deadlines_coexist() {
        let mut timers = TimerList::new();
        let base = Instant::now();
        timers.add(1, base);
        timers.add(2, base);
        let mut evicted = Vec::new();
        timers.tick(base, |id| evicted.push(id));
        evicted.sort();
        assert_eq!(evicted, vec![1, 2]);
    }
}
