use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed mutex map serializing event handling per permit.
///
/// Events for a single permit must be processed in delivery order;
/// different permits may proceed concurrently. Entries hold only a [`Weak`]
/// so retired permits do not pin their locks; dead entries are swept
/// lazily once the map grows.
#[derive(Debug, Default)]
pub struct PermitLocks {
    inner: DashMap<String, Weak<Mutex<()>>>,
}

const SWEEP_THRESHOLD: usize = 64;

impl PermitLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, permit_id: &str) -> OwnedMutexGuard<()> {
        if self.inner.len() > SWEEP_THRESHOLD {
            self.inner.retain(|_, weak| weak.strong_count() > 0);
        }

        let lock = match self.inner.entry(permit_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => match entry.get().upgrade() {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    entry.insert(Arc::downgrade(&lock));
                    lock
                }
            },
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let lock = Arc::new(Mutex::new(()));
                entry.insert(Arc::downgrade(&lock));
                lock
            }
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_permit_is_serialized() {
        let locks = Arc::new(PermitLocks::new());
        let guard = locks.acquire("p1").await;

        let locks2 = locks.clone();
        let contender = tokio::spawn(async move {
            let _guard = locks2.acquire("p1").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished(), "second acquire must wait");

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender should finish once the guard drops")
            .unwrap();
    }

    #[tokio::test]
    async fn different_permits_do_not_block() {
        let locks = PermitLocks::new();
        let _g1 = locks.acquire("p1").await;
        // Must not deadlock.
        let _g2 = locks.acquire("p2").await;
    }

    #[tokio::test]
    async fn dead_entries_are_swept() {
        let locks = PermitLocks::new();
        for i in 0..(SWEEP_THRESHOLD + 1) {
            let guard = locks.acquire(&format!("p{}", i)).await;
            drop(guard);
        }
        // One more acquire triggers the sweep; only the live entry remains.
        let _guard = locks.acquire("fresh").await;
        assert!(locks.len() <= 2);
    }
}
