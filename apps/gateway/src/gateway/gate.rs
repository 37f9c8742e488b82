//! Per-key async serialization.
//!
//! Collaborator writes for one user (presence) or one stream (viewer count)
//! must land in the order the in-memory state changed. Holding the key's gate
//! across "decide, then write" gives that order without a global lock.
//! Gates exist only while someone holds or awaits them.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct KeyedGate<K: Eq + Hash + Clone> {
    gates: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedGate<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedGate<K> {
    pub fn new() -> Self {
        Self {
            gates: DashMap::new(),
        }
    }

    /// Wait until no one else holds `key`, then hold it until the guard drops.
    pub async fn enter(&self, key: K) -> GateGuard<'_, K> {
        let gate = self.gates.entry(key.clone()).or_default().clone();
        let guard = gate.lock_owned().await;
        GateGuard {
            owner: self,
            key,
            guard: Some(guard),
        }
    }
}

pub struct GateGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a KeyedGate<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for GateGuard<'_, K> {
    fn drop(&mut self) {
        self.guard.take();
        // Clones are only handed out under the shard lock, so a count of one
        // means nobody is waiting on this gate.
        self.owner
            .gates
            .remove_if(&self.key, |_, gate| Arc::strong_count(gate) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let gate = Arc::new(KeyedGate::<String>::new());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let first = gate.enter("k".to_string()).await;
        let task = {
            let gate = gate.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let _guard = gate.enter("k".to_string()).await;
                order.lock().push("second");
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        order.lock().push("first");
        drop(first);
        task.await.unwrap();

        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert!(gate.gates.is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let gate = KeyedGate::<String>::new();
        let _a = gate.enter("a".to_string()).await;
        let _b = gate.enter("b".to_string()).await;
        assert_eq!(gate.gates.len(), 2);
    }
}
