use sluice_core::EntityKey;
use std::collections::HashMap;

/// Outcome of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquire {
    Granted,
    /// Held by the transaction carried.
    Busy(u64),
}

/// Exclusive row locks plus the wait-for graph used to detect deadlocks.
///
/// Every waiting transaction waits for exactly one row, so the graph has at most one outgoing
/// edge per node: waiter, row it waits for, holder of that row.
#[derive(Default, Debug)]
pub(crate) struct LockTable {
    holders: HashMap<EntityKey, u64>,
    waits: HashMap<u64, EntityKey>,
}

impl LockTable {
    pub(crate) fn try_acquire(&mut self, key: &EntityKey, transaction: u64) -> Acquire {
        match self.holders.get(key) {
            Some(holder) if *holder != transaction => Acquire::Busy(*holder),
            Some(..) => Acquire::Granted,
            None => {
                self.holders.insert(key.clone(), transaction);
                Acquire::Granted
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn holder(&self, key: &EntityKey) -> Option<u64> {
        self.holders.get(key).copied()
    }

    pub(crate) fn release(&mut self, key: &EntityKey, transaction: u64) {
        if self.holders.get(key) == Some(&transaction) {
            self.holders.remove(key);
        }
    }

    pub(crate) fn release_all(&mut self, transaction: u64) {
        self.holders.retain(|_, v| *v != transaction);
        self.waits.remove(&transaction);
    }

    pub(crate) fn held(&self) -> usize {
        self.holders.len()
    }

    /// Record that `waiter` waits for `key`, unless that closes a cycle.
    ///
    /// On a cycle the chain of transactions involved is returned, starting with the waiter.
    pub(crate) fn wait_for(&mut self, waiter: u64, key: &EntityKey) -> Result<(), Vec<u64>> {
        let mut chain = vec![waiter];
        let mut current = self.holders.get(key).copied();
        while let Some(transaction) = current {
            if transaction == waiter {
                return Err(chain);
            }
            if chain.contains(&transaction) {
                // A cycle not involving the waiter, it will be resolved by one of its members.
                break;
            }
            chain.push(transaction);
            current = self
                .waits
                .get(&transaction)
                .and_then(|v| self.holders.get(v))
                .copied();
        }
        self.waits.insert(waiter, key.clone());
        Ok(())
    }

    pub(crate) fn stop_waiting(&mut self, waiter: u64) {
        self.waits.remove(&waiter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_transactions_in_reverse_order_deadlock() {
        let a = EntityKey::new("accounts", 1);
        let b = EntityKey::new("accounts", 2);
        let mut table = LockTable::default();
        assert_eq!(table.try_acquire(&a, 1), Acquire::Granted);
        assert_eq!(table.try_acquire(&b, 2), Acquire::Granted);
        assert_eq!(table.try_acquire(&b, 1), Acquire::Busy(2));
        assert!(table.wait_for(1, &b).is_ok());
        assert_eq!(table.try_acquire(&a, 2), Acquire::Busy(1));
        assert_eq!(table.wait_for(2, &a), Err(vec![2, 1]));
        table.release_all(2);
        assert_eq!(table.try_acquire(&b, 1), Acquire::Granted);
        assert_eq!(table.held(), 2);
    }

    #[test]
    fn reentrant_and_chain_without_cycle() {
        let a = EntityKey::new("t", 1);
        let b = EntityKey::new("t", 2);
        let mut table = LockTable::default();
        assert_eq!(table.try_acquire(&a, 1), Acquire::Granted);
        assert_eq!(table.try_acquire(&a, 1), Acquire::Granted);
        assert_eq!(table.try_acquire(&b, 2), Acquire::Granted);
        assert!(table.wait_for(2, &a).is_ok());
        assert!(table.wait_for(3, &b).is_ok());
        table.stop_waiting(2);
        table.release(&a, 2);
        assert_eq!(table.holder(&a), Some(1));
    }
}
