//! Due-time ordered queue of pending instances.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::clock::Timestamp;
use crate::types::JobInstance;

/// Heap entry. Ordered by due time, then by insertion sequence so equally
/// due instances come out first-in first-out.
#[derive(Debug)]
struct Queued {
    due_time: Timestamp,
    seq: u64,
    instance: JobInstance,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.due_time == other.due_time && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due_time
            .cmp(&other.due_time)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of [`JobInstance`]s keyed by due time.
///
/// Knows nothing about job identity: two instances with the same key are
/// both kept. Exclusion is [`JobKeyLock`](crate::JobKeyLock)'s job.
#[derive(Debug, Default)]
pub struct JobQueue {
    heap: BinaryHeap<Reverse<Queued>>,
    next_seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instance: JobInstance) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Queued {
            due_time: instance.due_time,
            seq,
            instance,
        }));
    }

    /// Remove and return every instance due at or before `now`, earliest
    /// first, FIFO among ties.
    pub fn peek_due(&mut self, now: Timestamp) -> Vec<JobInstance> {
        let mut due = Vec::new();
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(queued)| queued.due_time <= now)
        {
            if let Some(Reverse(queued)) = self.heap.pop() {
                due.push(queued.instance);
            }
        }
        due
    }

    /// Due time of the earliest queued instance.
    pub fn next_due(&self) -> Option<Timestamp> {
        self.heap.peek().map(|Reverse(queued)| queued.due_time)
    }

    /// Keep only instances matching `keep`. Returns how many were dropped.
    pub fn retain(&mut self, mut keep: impl FnMut(&JobInstance) -> bool) -> usize {
        let before = self.heap.len();
        self.heap.retain(|Reverse(queued)| keep(&queued.instance));
        before - self.heap.len()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::types::JobDefinition;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn instance(id: u64, key: &str, due_secs: u64) -> JobInstance {
        let def = Arc::new(JobDefinition::new(
            key.to_string(),
            None,
            Arc::new(handler_fn(|_| async { Ok(()) })),
            3,
            Duration::from_secs(10),
        ));
        JobInstance::new(id, def, Timestamp::from_secs(due_secs))
    }

    fn ids(instances: &[JobInstance]) -> Vec<u64> {
        instances.iter().map(|i| i.id).collect()
    }

    #[test]
    fn test_peek_due_orders_by_time() {
        let mut queue = JobQueue::new();
        queue.insert(instance(1, "a", 30));
        queue.insert(instance(2, "b", 10));
        queue.insert(instance(3, "c", 20));

        assert_eq!(ids(&queue.peek_due(Timestamp::from_secs(25))), vec![2, 3]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_due(), Some(Timestamp::from_secs(30)));
    }

    #[test]
    fn test_ties_are_fifo() {
        let mut queue = JobQueue::new();
        for id in 1..=5 {
            queue.insert(instance(id, "same", 10));
        }
        assert_eq!(
            ids(&queue.peek_due(Timestamp::from_secs(10))),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn test_nothing_due_before_time() {
        let mut queue = JobQueue::new();
        queue.insert(instance(1, "a", 10));
        assert!(queue.peek_due(Timestamp::from_secs(9)).is_empty());
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_duplicate_keys_are_kept() {
        let mut queue = JobQueue::new();
        queue.insert(instance(1, "dup", 0));
        queue.insert(instance(2, "dup", 0));
        assert_eq!(queue.peek_due(Timestamp::ZERO).len(), 2);
    }

    #[test]
    fn test_retain_drops_matching() {
        let mut queue = JobQueue::new();
        queue.insert(instance(1, "keep", 5));
        queue.insert(instance(2, "drop", 1));
        queue.insert(instance(3, "drop", 9));

        assert_eq!(queue.retain(|i| i.key() != "drop"), 2);
        assert_eq!(queue.next_due(), Some(Timestamp::from_secs(5)));
    }

    #[test]
    fn test_empty_queue() {
        let mut queue = JobQueue::new();
        assert!(queue.is_empty());
        assert!(queue.next_due().is_none());
        assert!(queue.peek_due(Timestamp::from_secs(1_000)).is_empty());
    }

    proptest! {
        // Output is sorted by (due time, insertion order) and contains
        // exactly the due instances
        #[test]
        fn peek_due_is_stable_sort(dues in prop::collection::vec(0u64..50, 0..64), now in 0u64..60) {
            let mut queue = JobQueue::new();
            for (id, due) in dues.iter().enumerate() {
                queue.insert(instance(id as u64, "k", *due));
            }

            let got = ids(&queue.peek_due(Timestamp::from_secs(now)));

            let mut expected: Vec<(u64, u64)> = dues
                .iter()
                .enumerate()
                .filter(|(_, due)| **due <= now)
                .map(|(id, due)| (*due, id as u64))
                .collect();
            expected.sort();
            let expected: Vec<u64> = expected.into_iter().map(|(_, id)| id).collect();

            prop_assert_eq!(got, expected);
            prop_assert!(queue.next_due().is_none_or(|next| next > Timestamp::from_secs(now)));
        }
    }
}
