//! Per-key exclusion for running jobs.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::clock::Timestamp;
use crate::types::InstanceId;

/// Who currently holds a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockEntry {
    pub holder: InstanceId,
    pub acquired_at: Timestamp,
}

/// Non-blocking per-key trylock.
///
/// Backed by a sharded map, so contention is per shard rather than global:
/// deciding whether `a` may run never waits on a decision about `b` unless
/// they hash to the same shard.
#[derive(Debug, Default)]
pub struct JobKeyLock {
    entries: DashMap<String, LockEntry>,
}

impl JobKeyLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `key` for `holder` if nobody else has it. Never blocks.
    pub fn try_acquire(&self, key: &str, holder: InstanceId, now: Timestamp) -> bool {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(LockEntry {
                    holder,
                    acquired_at: now,
                });
                true
            }
        }
    }

    /// Drop whatever entry exists for `key`. Releasing a free key is a no-op.
    pub fn release(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop the entry only if `holder` still owns it.
    ///
    /// A handler that outlives its timeout releases through here, so it can't
    /// free a lock that was force-released and re-acquired in the meantime.
    pub fn release_held(&self, key: &str, holder: InstanceId) -> bool {
        self.entries
            .remove_if(key, |_, entry| entry.holder == holder)
            .is_some()
    }

    pub fn holder(&self, key: &str) -> Option<InstanceId> {
        self.entries.get(key).map(|entry| entry.holder)
    }

    pub fn entry(&self, key: &str) -> Option<LockEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_acquire_then_contend() {
        let locks = JobKeyLock::new();
        assert!(locks.try_acquire("ping", 1, Timestamp::ZERO));
        assert!(!locks.try_acquire("ping", 2, Timestamp::from_secs(1)));
        assert_eq!(locks.holder("ping"), Some(1));

        // Unrelated keys are independent
        assert!(locks.try_acquire("pong", 3, Timestamp::ZERO));
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_entry_records_acquisition_time() {
        let locks = JobKeyLock::new();
        locks.try_acquire("ping", 7, Timestamp::from_secs(42));
        assert_eq!(
            locks.entry("ping"),
            Some(LockEntry {
                holder: 7,
                acquired_at: Timestamp::from_secs(42)
            })
        );
    }

    #[test]
    fn test_double_release_is_harmless() {
        let locks = JobKeyLock::new();
        locks.try_acquire("ping", 1, Timestamp::ZERO);
        locks.release("ping");
        locks.release("ping");
        locks.release("never-held");
        assert!(locks.is_empty());
        assert!(locks.try_acquire("ping", 2, Timestamp::ZERO));
    }

    #[test]
    fn test_release_held_ignores_stale_holder() {
        let locks = JobKeyLock::new();
        locks.try_acquire("ping", 1, Timestamp::ZERO);

        // Forced release, then a newer instance takes the key
        locks.release("ping");
        locks.try_acquire("ping", 2, Timestamp::from_secs(5));

        // The original holder finally returns
        assert!(!locks.release_held("ping", 1));
        assert_eq!(locks.holder("ping"), Some(2));

        assert!(locks.release_held("ping", 2));
        assert!(!locks.is_locked("ping"));
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let locks = Arc::new(JobKeyLock::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..16)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if locks.try_acquire("shared", i, Timestamp::ZERO) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug, Clone)]
    enum LockOp {
        Acquire { key: u8, holder: u64 },
        Release { key: u8 },
        ReleaseHeld { key: u8, holder: u64 },
    }

    fn lock_op() -> impl Strategy<Value = LockOp> {
        prop_oneof![
            3 => (0u8..4, 0u64..8).prop_map(|(key, holder)| LockOp::Acquire { key, holder }),
            1 => (0u8..4).prop_map(|key| LockOp::Release { key }),
            1 => (0u8..4, 0u64..8).prop_map(|(key, holder)| LockOp::ReleaseHeld { key, holder }),
        ]
    }

    proptest! {
        // The lock behaves like a map with insert-if-absent, checked against a model
        #[test]
        fn lock_matches_model(ops in prop::collection::vec(lock_op(), 1..64)) {
            let locks = JobKeyLock::new();
            let mut model: HashMap<String, u64> = HashMap::new();

            for op in ops {
                match op {
                    LockOp::Acquire { key, holder } => {
                        let key = key.to_string();
                        let expected = !model.contains_key(&key);
                        if expected {
                            model.insert(key.clone(), holder);
                        }
                        prop_assert_eq!(locks.try_acquire(&key, holder, Timestamp::ZERO), expected);
                    }
                    LockOp::Release { key } => {
                        let key = key.to_string();
                        model.remove(&key);
                        locks.release(&key);
                    }
                    LockOp::ReleaseHeld { key, holder } => {
                        let key = key.to_string();
                        let expected = model.get(&key) == Some(&holder);
                        if expected {
                            model.remove(&key);
                        }
                        prop_assert_eq!(locks.release_held(&key, holder), expected);
                    }
                }
                prop_assert_eq!(locks.len(), model.len());
            }
        }
    }
}
