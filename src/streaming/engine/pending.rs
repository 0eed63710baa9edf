use std::collections::{BTreeSet, HashMap};

use crate::streaming::engine::fingerprint::Fingerprint;
use crate::streaming::engine::types::{Address, HistoryEntry};

/// History fetches outstanding for one address.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HistoryExpectation {
    /// Status announced with the latest fetch.
    current: Fingerprint,
    /// Statuses of earlier fetches still in flight; their replies are stale.
    superseded: Vec<Fingerprint>,
}

/// Outstanding work of the engine.
///
/// A `(txid, height)` pair lives in at most one of `requested_tx`,
/// `missing_tx` and `failed_tx`. An address lives in `requested_histories`
/// exactly while a history fetch for it is outstanding.
#[derive(Debug, Default)]
pub struct PendingWork {
    /// Transaction fetches sent to the transport.
    requested_tx: BTreeSet<HistoryEntry>,

    /// Transactions we need but have not asked for yet.
    missing_tx: BTreeSet<HistoryEntry>,

    /// Fetches the server answered with an error. Not outstanding; the next
    /// status of an address holding them, or a reconnect, asks again.
    failed_tx: BTreeSet<HistoryEntry>,

    requested_histories: HashMap<Address, HistoryExpectation>,
}

impl PendingWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a needed transaction. No-op if it is already in flight.
    pub fn mark_missing(&mut self, entry: HistoryEntry) -> bool {
        if self.requested_tx.contains(&entry) {
            return false;
        }
        self.failed_tx.remove(&entry);
        self.missing_tx.insert(entry)
    }

    /// Requested or missing. Failed fetches are not tracked work.
    pub fn is_tracked(&self, entry: &HistoryEntry) -> bool {
        self.requested_tx.contains(entry) || self.missing_tx.contains(entry)
    }

    pub fn is_requested(&self, entry: &HistoryEntry) -> bool {
        self.requested_tx.contains(entry)
    }

    pub fn is_missing(&self, entry: &HistoryEntry) -> bool {
        self.missing_tx.contains(entry)
    }

    pub fn is_failed(&self, entry: &HistoryEntry) -> bool {
        self.failed_tx.contains(entry)
    }

    /// Moves every missing transaction to the requested set and returns them.
    pub fn take_missing(&mut self) -> Vec<HistoryEntry> {
        let missing = std::mem::take(&mut self.missing_tx);
        let mut taken = Vec::with_capacity(missing.len());
        for entry in missing {
            if self.requested_tx.insert(entry) {
                taken.push(entry);
            }
        }
        taken
    }

    /// Clears a delivered transaction. Returns false if it was never requested.
    pub fn complete_transaction(&mut self, entry: &HistoryEntry) -> bool {
        self.requested_tx.remove(entry)
    }

    /// The server refused a transaction fetch. Returns false if it was not
    /// in flight.
    pub fn fail_transaction(&mut self, entry: &HistoryEntry) -> bool {
        if !self.requested_tx.remove(entry) {
            return false;
        }
        self.failed_tx.insert(*entry);
        true
    }

    /// Queues the failed fetches among `entries` again.
    pub fn retry_failed<'e>(&mut self, entries: impl IntoIterator<Item = &'e HistoryEntry>) -> usize {
        let mut retried = 0;
        for entry in entries {
            if self.failed_tx.remove(entry) {
                self.missing_tx.insert(*entry);
                retried += 1;
            }
        }
        retried
    }

    /// Records an outstanding history fetch; returns the previous expectation,
    /// which stays known as superseded until its reply shows up.
    pub fn expect_history(&mut self, address: Address, status: Fingerprint) -> Option<Fingerprint> {
        match self.requested_histories.get_mut(&address) {
            Some(expectation) => {
                let previous = std::mem::replace(&mut expectation.current, status);
                expectation.superseded.push(previous);
                Some(previous)
            }
            None => {
                self.requested_histories.insert(
                    address,
                    HistoryExpectation {
                        current: status,
                        superseded: Vec::new(),
                    },
                );
                None
            }
        }
    }

    pub fn expected_history(&self, address: &str) -> Option<Fingerprint> {
        self.requested_histories.get(address).map(|e| e.current)
    }

    /// Consumes one superseded expectation matching `delivered`. True if the
    /// delivery answers an older fetch of `address`.
    pub fn take_superseded(&mut self, address: &str, delivered: &Fingerprint) -> bool {
        let Some(expectation) = self.requested_histories.get_mut(address) else {
            return false;
        };
        match expectation.superseded.iter().position(|fp| fp == delivered) {
            Some(index) => {
                expectation.superseded.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drops every outstanding fetch of `address`; returns the latest status.
    pub fn complete_history(&mut self, address: &str) -> Option<Fingerprint> {
        self.requested_histories.remove(address).map(|e| e.current)
    }

    /// Forgets what was in flight on a connection that went away.
    ///
    /// Requested and failed transactions go back to missing so they are asked
    /// for again; history fetches are dropped, re-subscribing brings their
    /// status back.
    pub fn rollback_in_flight(&mut self) {
        let requested = std::mem::take(&mut self.requested_tx);
        let failed = std::mem::take(&mut self.failed_tx);
        self.missing_tx.extend(requested);
        self.missing_tx.extend(failed);
        self.requested_histories.clear();
    }

    pub fn transactions_outstanding(&self) -> usize {
        self.requested_tx.len() + self.missing_tx.len()
    }

    pub fn histories_outstanding(&self) -> usize {
        self.requested_histories.len()
    }

    pub fn transactions_failed(&self) -> usize {
        self.failed_tx.len()
    }

    pub fn is_idle(&self) -> bool {
        self.transactions_outstanding() == 0 && self.requested_histories.is_empty()
    }

    pub fn requested_tx(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.requested_tx.iter()
    }

    pub fn missing_tx(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.missing_tx.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::{sha256d, Hash};
    use bitcoin::Txid;

    fn entry(tag: &[u8], height: i32) -> HistoryEntry {
        HistoryEntry::new(Txid::from_raw_hash(sha256d::Hash::hash(tag)), height)
    }

    #[test]
    fn missing_then_requested_never_both() {
        let mut pending = PendingWork::new();
        let e = entry(b"a", 10);

        assert!(pending.mark_missing(e));
        assert!(!pending.mark_missing(e));

        assert_eq!(pending.take_missing(), vec![e]);
        assert!(pending.is_requested(&e));
        assert!(!pending.is_missing(&e));

        // already in flight
        assert!(!pending.mark_missing(e));
        assert!(!pending.is_missing(&e));
    }

    #[test]
    fn same_txid_different_height_is_distinct_work() {
        let mut pending = PendingWork::new();
        pending.mark_missing(entry(b"a", 0));
        pending.mark_missing(entry(b"a", 12));
        assert_eq!(pending.transactions_outstanding(), 2);
    }

    #[test]
    fn complete_transaction_only_once() {
        let mut pending = PendingWork::new();
        let e = entry(b"a", 1);
        pending.mark_missing(e);
        pending.take_missing();

        assert!(pending.complete_transaction(&e));
        assert!(!pending.complete_transaction(&e));
        assert!(pending.is_idle());
    }

    #[test]
    fn failed_fetch_is_parked_until_retried() {
        let mut pending = PendingWork::new();
        let e = entry(b"a", 1);
        assert!(!pending.fail_transaction(&e));

        pending.mark_missing(e);
        pending.take_missing();
        assert!(pending.fail_transaction(&e));

        assert!(pending.is_failed(&e));
        assert!(!pending.is_tracked(&e));
        assert!(pending.is_idle());

        assert_eq!(pending.retry_failed([&e]), 1);
        assert_eq!(pending.retry_failed([&e]), 0);
        assert!(pending.is_missing(&e));
        assert_eq!(pending.transactions_failed(), 0);
    }

    #[test]
    fn marking_a_failed_fetch_missing_moves_it() {
        let mut pending = PendingWork::new();
        let e = entry(b"a", 1);
        pending.mark_missing(e);
        pending.take_missing();
        pending.fail_transaction(&e);

        assert!(pending.mark_missing(e));
        assert!(!pending.is_failed(&e));
        assert!(pending.is_missing(&e));
    }

    #[test]
    fn history_expectations() {
        let mut pending = PendingWork::new();
        assert_eq!(pending.expect_history("addrA".into(), Fingerprint::Empty), None);
        assert_eq!(
            pending.expect_history("addrA".into(), Fingerprint::Unenumerable),
            Some(Fingerprint::Empty)
        );
        assert_eq!(pending.expected_history("addrA"), Some(Fingerprint::Unenumerable));
        assert!(!pending.is_idle());

        assert_eq!(pending.complete_history("addrA"), Some(Fingerprint::Unenumerable));
        assert_eq!(pending.complete_history("addrA"), None);
        assert!(pending.is_idle());
    }

    #[test]
    fn superseded_expectation_is_consumed_once() {
        let mut pending = PendingWork::new();
        pending.expect_history("addrA".into(), Fingerprint::Empty);
        pending.expect_history("addrA".into(), Fingerprint::Unenumerable);

        assert!(!pending.take_superseded("addrA", &Fingerprint::Unenumerable));
        assert!(pending.take_superseded("addrA", &Fingerprint::Empty));
        assert!(!pending.take_superseded("addrA", &Fingerprint::Empty));
        assert!(!pending.take_superseded("addrB", &Fingerprint::Empty));
        assert_eq!(pending.expected_history("addrA"), Some(Fingerprint::Unenumerable));
    }

    #[test]
    fn rollback_requeues_transactions_and_drops_histories() {
        let mut pending = PendingWork::new();
        let a = entry(b"a", 1);
        let b = entry(b"b", 2);
        let c = entry(b"c", 3);
        pending.mark_missing(a);
        pending.mark_missing(c);
        pending.take_missing();
        pending.fail_transaction(&c);
        pending.mark_missing(b);
        pending.expect_history("addrA".into(), Fingerprint::Empty);

        pending.rollback_in_flight();

        assert!(pending.is_missing(&a));
        assert!(pending.is_missing(&b));
        assert!(pending.is_missing(&c));
        assert_eq!(pending.requested_tx().count(), 0);
        assert_eq!(pending.transactions_failed(), 0);
        assert_eq!(pending.histories_outstanding(), 0);
    }
}
