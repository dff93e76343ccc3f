//! # Poll Plan
//!
//! Ranges with the same poll interval share one [`PollEntry`], even across
//! devices, so a slow-changing group costs one device switch per round
//! instead of one per device. Entries are kept in a min-heap by due time.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::time::Duration;

use tokio::time::Instant;

use crate::range::RegisterRange;

/// Ranges polled together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollEntry {
    pub interval: Duration,
    /// Ordered by device, then kind and address
    pub ranges: Vec<RegisterRange>,
    pub due_at: Instant,
}

/// Schedule of all poll entries of a client.
#[derive(Debug, Default)]
pub struct PollPlan {
    entries: Vec<PollEntry>,
    queue: BinaryHeap<Reverse<(Instant, usize)>>,
}

impl PollPlan {
    /// Group ranges by poll interval; every entry is due at `now`.
    pub fn new(ranges: impl IntoIterator<Item = RegisterRange>, now: Instant) -> Self {
        let mut groups: BTreeMap<Duration, Vec<RegisterRange>> = BTreeMap::new();
        for range in ranges {
            groups.entry(range.poll_interval).or_default().push(range);
        }

        let mut plan = Self::default();
        for (interval, mut ranges) in groups {
            ranges.sort_by_key(|r| (r.device, r.kind, r.start_address));
            plan.queue.push(Reverse((now, plan.entries.len())));
            plan.entries.push(PollEntry {
                interval,
                ranges,
                due_at: now,
            });
        }
        plan
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn entries(&self) -> &[PollEntry] {
        &self.entries
    }

    #[inline]
    pub fn entry(&self, index: usize) -> Option<&PollEntry> {
        self.entries.get(index)
    }

    /// Due time of the earliest entry.
    pub fn next_due(&self) -> Option<Instant> {
        self.queue.peek().map(|Reverse((due, _))| *due)
    }

    /// Take the earliest entry if it is due at `now`.
    ///
    /// The entry stays out of the queue until [`PollPlan::reschedule`].
    pub fn pop_due(&mut self, now: Instant) -> Option<usize> {
        match self.queue.peek() {
            Some(Reverse((due, _))) if *due <= now => self.queue.pop().map(|Reverse((_, index))| index),
            _ => None,
        }
    }

    /// Put an entry back one interval after its previous due time, or one
    /// interval after `now` if polling fell behind.
    pub fn reschedule(&mut self, index: usize, now: Instant) {
        let Some(entry) = self.entries.get_mut(index) else {
            return;
        };
        let mut next = entry.due_at + entry.interval;
        if next <= now {
            next = now + entry.interval;
        }
        entry.due_at = next;
        self.queue.push(Reverse((next, index)));
    }

    /// Replace one range of an entry with `replacement` (possibly nothing).
    pub fn replace_range(&mut self, index: usize, position: usize, replacement: Vec<RegisterRange>) {
        if let Some(entry) = self.entries.get_mut(index) {
            if position < entry.ranges.len() {
                entry.ranges.splice(position..=position, replacement);
            }
        }
    }
}
