// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-instance exclusion.
//!
//! Each instance gets its own lock, created the first time someone asks for
//! it. The arena only holds weak references, so a lock disappears as soon as
//! nobody holds its guard; dead entries are swept out as the map grows.
//! Acquisition never waits: a caller that finds the lock held is told so
//! immediately and must retry later.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use slog::{debug, Logger};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Smallest map size at which dead entries are swept.
const MIN_SWEEP_THRESHOLD: usize = 64;

struct Arena {
    locks: HashMap<Uuid, Weak<tokio::sync::Mutex<()>>>,
    sweep_threshold: usize,
}

pub(crate) struct InstanceLocks {
    arena: Mutex<Arena>,
    log: Logger,
}

/// Proof that the holder has exclusive use of one instance's lifecycle.
#[derive(Debug)]
pub(crate) struct InstanceGuard {
    _guard: OwnedMutexGuard<()>,
}

impl InstanceLocks {
    pub(crate) fn new(log: Logger) -> Self {
        Self {
            arena: Mutex::new(Arena {
                locks: HashMap::new(),
                sweep_threshold: MIN_SWEEP_THRESHOLD,
            }),
            log,
        }
    }

    /// Takes the lock for `instance` if nobody else holds it.
    pub(crate) fn try_acquire(&self, instance: Uuid) -> Option<InstanceGuard> {
        let lock = {
            let mut arena = self.arena.lock().unwrap();
            if arena.locks.len() >= arena.sweep_threshold {
                self.sweep(&mut arena);
            }

            match arena.locks.get(&instance).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    arena.locks.insert(instance, Arc::downgrade(&lock));
                    lock
                }
            }
        };

        lock.try_lock_owned().ok().map(|guard| InstanceGuard { _guard: guard })
    }

    /// Number of entries in the arena, live or not yet swept.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.arena.lock().unwrap().locks.len()
    }

    fn sweep(&self, arena: &mut Arena) {
        let before = arena.locks.len();
        arena.locks.retain(|_, lock| lock.strong_count() > 0);
        let after = arena.locks.len();
        arena.sweep_threshold = (after * 2).max(MIN_SWEEP_THRESHOLD);
        debug!(self.log, "swept instance lock arena";
               "before" => before,
               "after" => after);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn second_acquire_fails_until_release() {
        let locks = InstanceLocks::new(test_logger());
        let id = Uuid::new_v4();

        let guard = locks.try_acquire(id).unwrap();
        assert!(locks.try_acquire(id).is_none());

        // Unrelated instances are not affected.
        assert!(locks.try_acquire(Uuid::new_v4()).is_some());

        drop(guard);
        assert!(locks.try_acquire(id).is_some());
    }

    #[test]
    fn idle_locks_are_reclaimed() {
        let locks = InstanceLocks::new(test_logger());
        let held = locks.try_acquire(Uuid::new_v4()).unwrap();
        for _ in 0..MIN_SWEEP_THRESHOLD * 4 {
            let guard = locks.try_acquire(Uuid::new_v4());
            assert!(guard.is_some());
        }

        // Every released lock is eligible for reclamation; the arena never
        // grows far beyond the sweep threshold.
        assert!(locks.len() <= MIN_SWEEP_THRESHOLD + 1);
        drop(held);
    }
}
