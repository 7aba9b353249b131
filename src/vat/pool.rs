//! WorkerPool — the resident vat workers, capped, least recently used out.
//!
//! An evicted vat loses nothing durable: its next delivery rebuilds the
//! worker from the transcript.

use std::collections::BTreeMap;

use crate::slots::VatId;

use super::VatManager;

pub struct WorkerPool {
    resident: BTreeMap<VatId, (u64, VatManager)>,
    capacity: usize,
    clock: u64,
}

impl WorkerPool {
    /// A pool holding at most `capacity` workers (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            resident: BTreeMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    /// Park `vat`'s worker as the most recently used, evicting the least
    /// recently used ones past capacity. Returns the evicted vats.
    pub fn insert(&mut self, vat: VatId, manager: VatManager) -> Vec<VatId> {
        self.clock += 1;
        self.resident.insert(vat, (self.clock, manager));

        let mut evicted = Vec::new();
        while self.resident.len() > self.capacity {
            let Some(oldest) = self
                .resident
                .iter()
                .min_by_key(|(_, (stamp, _))| *stamp)
                .map(|(v, _)| *v)
            else {
                break;
            };
            self.resident.remove(&oldest);
            tracing::debug!("{oldest}: worker evicted to make room for {vat}");
            evicted.push(oldest);
        }
        evicted
    }

    pub fn remove(&mut self, vat: &VatId) -> Option<VatManager> {
        self.resident.remove(vat).map(|(_, manager)| manager)
    }

    pub fn clear(&mut self) {
        self.resident.clear();
    }

    /// Vats with a live worker, in vat order.
    pub fn online(&self) -> Vec<VatId> {
        self.resident.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vat::{DeliveryResult, Syscall, VatDelivery, VatDispatch};

    struct Idle;

    impl VatDispatch for Idle {
        fn dispatch(&mut self, _: VatDelivery, _: &mut Syscall<'_>) -> DeliveryResult {
            Ok(())
        }
    }

    fn worker(vat: u32) -> VatManager {
        VatManager::spawn(VatId(vat), Box::new(Idle))
    }

    #[tokio::test]
    async fn evicts_least_recently_used() {
        let mut pool = WorkerPool::new(2);
        assert!(pool.insert(VatId(1), worker(1)).is_empty());
        assert!(pool.insert(VatId(2), worker(2)).is_empty());

        // Touch v1 so v2 becomes the oldest.
        let v1 = pool.remove(&VatId(1)).unwrap();
        assert!(pool.insert(VatId(1), v1).is_empty());

        assert_eq!(pool.insert(VatId(3), worker(3)), vec![VatId(2)]);
        assert_eq!(pool.online(), vec![VatId(1), VatId(3)]);
        assert!(pool.remove(&VatId(2)).is_none());
    }

    #[tokio::test]
    async fn capacity_is_at_least_one() {
        let mut pool = WorkerPool::new(0);
        assert!(pool.insert(VatId(1), worker(1)).is_empty());
        assert_eq!(pool.insert(VatId(2), worker(2)), vec![VatId(1)]);
        pool.clear();
        assert!(pool.online().is_empty());
    }
}
