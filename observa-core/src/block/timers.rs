//! Time-ordered event queue
//!
//! Entries are keyed by wake time plus a sequence number, so timers added
//! for the same instant fire in insertion order. Expiry first stages every
//! due key, then removes the staged keys, then hands the events out; a key
//! is staged at most once, so an event is delivered exactly once however
//! many timers expire in the same tick.

use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::event::{Event, EventType, ObjectRef};

/// A scheduled event and where it goes
#[derive(Debug)]
pub struct Timer {
    pub event: Event,
    /// `None` delivers to the block itself
    pub target: Option<ObjectRef>,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: BTreeMap<(Instant, u64), Timer>,
    staged: Vec<(Instant, u64)>,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, at: Instant, event: Event, target: Option<ObjectRef>) {
        let key = (at, self.seq);
        self.seq += 1;
        self.entries.insert(key, Timer { event, target });
    }

    /// Earliest wake time
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(at, _)| *at)
    }

    /// Drop every timer carrying this event type. Returns how many went.
    pub fn delete_type(&mut self, kind: EventType) -> usize {
        for (key, timer) in &self.entries {
            if timer.event.kind() == kind {
                stage(&mut self.staged, *key);
            }
        }
        self.flush().len()
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Timer> {
        for key in self.entries.keys() {
            if key.0 > now {
                break;
            }
            stage(&mut self.staged, *key);
        }
        self.flush()
    }

    fn flush(&mut self) -> Vec<Timer> {
        let mut staged = std::mem::take(&mut self.staged);
        staged.sort();
        staged
            .into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }
}

fn stage(staged: &mut Vec<(Instant, u64)>, key: (Instant, u64)) {
    if !staged.contains(&key) {
        staged.push(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ev(n: u32) -> Event {
        Event::new(EventType::local(n))
    }

    #[test]
    fn test_expired_delivered_once_in_order() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.add(now + Duration::from_millis(20), ev(2), None);
        timers.add(now + Duration::from_millis(10), ev(1), None);
        timers.add(now + Duration::from_millis(10), ev(3), Some(ObjectRef::Block));
        timers.add(now + Duration::from_secs(5), ev(4), None);

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));

        let fired = timers.take_expired(now + Duration::from_millis(30));
        let kinds: Vec<_> = fired.iter().map(|t| t.event.kind()).collect();
        assert_eq!(kinds, vec![EventType::local(1), EventType::local(3), EventType::local(2)]);
        assert_eq!(fired[1].target, Some(ObjectRef::Block));

        assert!(timers.take_expired(now + Duration::from_millis(30)).is_empty());
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_nothing_due() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.add(now + Duration::from_secs(1), ev(1), None);
        assert!(timers.take_expired(now).is_empty());
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_delete_type() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.add(now, ev(1), None);
        timers.add(now, ev(2), None);
        timers.add(now + Duration::from_secs(1), ev(1), None);

        assert_eq!(timers.delete_type(EventType::local(1)), 2);
        assert_eq!(timers.delete_type(EventType::local(1)), 0);
        assert_eq!(timers.take_expired(now).len(), 1);
        assert!(timers.is_empty());
    }
}
