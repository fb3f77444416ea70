use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
struct Slot {
    lock: Arc<AsyncMutex<()>>,
    /// Holders plus waiters.
    users: usize,
}

type Slots<K> = Arc<Mutex<HashMap<K, Slot>>>;

/// One async mutex per key, created on demand and dropped once nobody holds
/// or waits on it. The map itself is only locked for lookup and cleanup,
/// never across an await.
pub(crate) struct KeyedLocks<K> {
    slots: Slots<K>,
}

/// Owns its place in the map, so it can move into a spawned task. Dropping
/// it while still waiting gives the place back just like releasing the lock.
pub(crate) struct KeyedGuard<K: Eq + Hash> {
    guard: Option<OwnedMutexGuard<()>>,
    key: K,
    slots: Slots<K>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) async fn lock(&self, key: K) -> KeyedGuard<K> {
        let (lock, mut held) = {
            let mut slots = lock_slots(&self.slots);
            let slot = slots.entry(key.clone()).or_default();
            slot.users += 1;
            let held = KeyedGuard {
                guard: None,
                key,
                slots: Arc::clone(&self.slots),
            };
            (Arc::clone(&slot.lock), held)
        };
        held.guard = Some(lock.lock_owned().await);
        held
    }
}

impl<K: Eq + Hash> KeyedLocks<K> {
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock_slots(&self.slots).len()
    }
}

fn lock_slots<K>(slots: &Mutex<HashMap<K, Slot>>) -> MutexGuard<'_, HashMap<K, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = lock_slots(&self.slots);
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                slots.remove(&self.key);
            }
        }
    }
}
