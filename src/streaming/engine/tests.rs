use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::consensus;
use bitcoin::transaction::Version;
use bitcoin::Transaction;

use crate::error::IntegrityError;
use crate::streaming::electrum::api::ReplyHandler;
use crate::streaming::electrum::mock::MockTransport;
use crate::streaming::engine::dispatcher::{Dispatcher, Outcome};
use crate::streaming::engine::fingerprint::Fingerprint;
use crate::streaming::engine::pending::PendingWork;
use crate::streaming::engine::types::{History, HistoryEntry, InboundMessage, ProtocolError, Request};
use crate::wallet::{MemoryWallet, WalletStore};

// =========================================================================
// Helpers
// =========================================================================

fn fake_tx(n: u32) -> Transaction {
    Transaction {
        version: Version(2),
        lock_time: LockTime::from_consensus(n),
        input: vec![],
        output: vec![],
    }
}

fn entry(n: u32, height: i32) -> HistoryEntry {
    HistoryEntry::new(fake_tx(n).compute_txid(), height)
}

struct Harness {
    wallet: MemoryWallet,
    transport: MockTransport,
    pending: PendingWork,
    replies: ReplyHandler,
}

impl Harness {
    fn new() -> Self {
        Self {
            wallet: MemoryWallet::new(["a".to_string(), "b".to_string()]),
            transport: MockTransport::new(),
            pending: PendingWork::new(),
            replies: Arc::new(|_: InboundMessage| {}),
        }
    }

    fn dispatch(&mut self, message: InboundMessage) -> Result<Outcome, IntegrityError> {
        Dispatcher {
            wallet: &self.wallet,
            transport: &self.transport,
            pending: &mut self.pending,
            replies: &self.replies,
        }
        .dispatch(message)
    }

    fn status(&mut self, address: &str, entries: &[HistoryEntry]) -> Outcome {
        self.dispatch(InboundMessage::AddressStatus {
            address: address.into(),
            status: Fingerprint::of_entries(entries),
        })
        .unwrap()
    }

    fn history(&mut self, address: &str, entries: &[HistoryEntry]) -> Result<Outcome, IntegrityError> {
        self.dispatch(InboundMessage::AddressHistory {
            address: address.into(),
            history: History::from_entries(entries.iter().copied()),
        })
    }
}

// =========================================================================
// Status
// =========================================================================

#[test]
fn matching_status_requests_nothing() {
    let mut h = Harness::new();
    let e = entry(1, 10);
    h.wallet.write_history("a", History::from_entries([e]));

    assert_eq!(h.status("a", &[e]), Outcome::Unchanged);
    assert_eq!(h.status("b", &[]), Outcome::Unchanged);
    assert!(h.transport.sent().is_empty());
}

#[test]
fn changed_status_requests_history_once() {
    let mut h = Harness::new();
    let e = entry(1, 10);

    assert_eq!(h.status("a", &[e]), Outcome::HistoryRequested);
    assert_eq!(h.status("a", &[e]), Outcome::Unchanged);

    assert_eq!(h.transport.sent(), vec![Request::GetHistory("a".into())]);
    assert_eq!(h.pending.expected_history("a"), Some(Fingerprint::of_entries(&[e])));
}

#[test]
fn status_back_to_local_drops_stale_fetch() {
    let mut h = Harness::new();
    let e = entry(1, 10);

    h.status("a", &[e]);
    assert_eq!(h.status("a", &[]), Outcome::Unchanged);
    assert_eq!(h.pending.expected_history("a"), None);

    // the late reply no longer matches anything
    assert_eq!(h.history("a", &[e]).unwrap(), Outcome::Discarded);
    assert!(h.wallet.current_history("a").is_empty());
}

// =========================================================================
// History
// =========================================================================

#[test]
fn history_marks_only_unknown_transactions() {
    let mut h = Harness::new();
    let (known, shared) = (entry(1, 10), entry(2, 11));
    h.wallet.write_transaction(known.txid, 10, fake_tx(1));

    h.status("a", &[known, shared]);
    assert_eq!(h.history("a", &[known, shared]).unwrap(), Outcome::HistoryStored { missing: 1 });
    assert!(h.pending.is_missing(&shared));
    assert!(!h.pending.is_tracked(&known));

    // same tx on another address is already tracked
    h.status("b", &[shared]);
    assert_eq!(h.history("b", &[shared]).unwrap(), Outcome::HistoryStored { missing: 0 });
    assert_eq!(h.pending.transactions_outstanding(), 1);
}

#[test]
fn mismatched_history_is_not_written() {
    let mut h = Harness::new();
    let (announced, delivered) = (entry(1, 10), entry(2, 10));

    h.status("a", &[announced]);
    let err = h.history("a", &[delivered]).unwrap_err();

    assert!(matches!(err, IntegrityError::FingerprintMismatch { ref address, .. } if address == "a"));
    assert!(h.wallet.current_history("a").is_empty());
    assert_eq!(h.pending.histories_outstanding(), 1);
    assert_eq!(h.pending.transactions_outstanding(), 0);
}

#[test]
fn reply_to_superseded_fetch_is_stale() {
    let mut h = Harness::new();
    let (e1, e2) = (entry(1, 10), entry(2, 11));

    h.status("a", &[e1]);
    assert_eq!(h.status("a", &[e1, e2]), Outcome::HistoryRequested);

    assert_eq!(h.history("a", &[e1]).unwrap(), Outcome::Discarded);
    assert!(h.wallet.current_history("a").is_empty());
    assert_eq!(h.pending.expected_history("a"), Some(Fingerprint::of_entries(&[e1, e2])));

    // consumed once: a second copy is a real mismatch
    assert!(matches!(
        h.history("a", &[e1]),
        Err(IntegrityError::FingerprintMismatch { .. })
    ));

    assert_eq!(h.history("a", &[e1, e2]).unwrap(), Outcome::HistoryStored { missing: 2 });
    assert_eq!(h.pending.histories_outstanding(), 0);
}

#[test]
fn superseded_pruned_reply_is_stale() {
    let mut h = Harness::new();
    let e = entry(1, 10);

    h.dispatch(InboundMessage::AddressStatus {
        address: "a".into(),
        status: Fingerprint::Unenumerable,
    })
    .unwrap();
    h.status("a", &[e]);

    assert_eq!(
        h.dispatch(InboundMessage::AddressHistory {
            address: "a".into(),
            history: History::Unenumerable,
        })
        .unwrap(),
        Outcome::Discarded
    );
    assert!(h.wallet.current_history("a").is_empty());
    assert_eq!(h.history("a", &[e]).unwrap(), Outcome::HistoryStored { missing: 1 });
}

#[test]
fn duplicate_entries_are_rejected() {
    let mut h = Harness::new();
    let e = entry(1, 10);

    h.status("a", &[e, e]);
    let err = h.history("a", &[e, e]).unwrap_err();
    assert_eq!(
        err,
        IntegrityError::DuplicateTxid {
            address: "a".into(),
            txid: e.txid
        }
    );
}

// =========================================================================
// Transactions
// =========================================================================

#[test]
fn unsolicited_transaction_is_discarded() {
    let mut h = Harness::new();
    let tx = fake_tx(1);

    let outcome = h
        .dispatch(InboundMessage::Transaction {
            txid: tx.compute_txid(),
            height: 1,
            raw: consensus::serialize(&tx),
        })
        .unwrap();

    assert_eq!(outcome, Outcome::Discarded);
    assert_eq!(h.wallet.transaction_count(), 0);
}

#[test]
fn wrong_body_is_txid_mismatch() {
    let mut h = Harness::new();
    let e = entry(1, 10);
    h.status("a", &[e]);
    h.history("a", &[e]).unwrap();
    h.pending.take_missing();

    let wrong = fake_tx(2);
    let err = h
        .dispatch(InboundMessage::Transaction {
            txid: e.txid,
            height: 10,
            raw: consensus::serialize(&wrong),
        })
        .unwrap_err();

    assert_eq!(
        err,
        IntegrityError::TxidMismatch {
            requested: e.txid,
            delivered: wrong.compute_txid()
        }
    );
    assert!(h.pending.is_requested(&e));
}

#[test]
fn requested_transaction_is_stored() {
    let mut h = Harness::new();
    let e = entry(1, 10);
    h.status("a", &[e]);
    h.history("a", &[e]).unwrap();
    assert_eq!(h.pending.take_missing(), vec![e]);

    let outcome = h
        .dispatch(InboundMessage::Transaction {
            txid: e.txid,
            height: 10,
            raw: consensus::serialize(&fake_tx(1)),
        })
        .unwrap();

    assert_eq!(outcome, Outcome::TransactionStored);
    assert!(h.wallet.is_known_transaction(&e.txid));
    assert!(h.pending.is_idle());
}

// =========================================================================
// Server errors
// =========================================================================

#[test]
fn refused_history_fetch_is_asked_again() {
    let mut h = Harness::new();
    let e = entry(1, 10);
    h.status("a", &[e]);

    let outcome = h
        .dispatch(InboundMessage::Failed {
            request: Request::GetHistory("a".into()),
            error: ProtocolError::new("busy"),
        })
        .unwrap();
    assert_eq!(outcome, Outcome::Discarded);
    assert_eq!(h.pending.expected_history("a"), None);
    assert!(h.pending.is_idle());

    assert_eq!(h.status("a", &[e]), Outcome::HistoryRequested);
    assert_eq!(
        h.transport.sent(),
        vec![Request::GetHistory("a".into()), Request::GetHistory("a".into())]
    );
}

#[test]
fn refused_transaction_waits_for_next_status() {
    let mut h = Harness::new();
    let e = entry(1, 10);
    h.status("a", &[e]);
    h.history("a", &[e]).unwrap();
    h.pending.take_missing();

    let outcome = h
        .dispatch(InboundMessage::Failed {
            request: Request::GetTransaction {
                txid: e.txid,
                height: 10,
            },
            error: ProtocolError::new("no such transaction"),
        })
        .unwrap();
    assert_eq!(outcome, Outcome::Discarded);
    assert!(h.pending.is_failed(&e));
    assert!(h.pending.is_idle());

    // status of another address leaves it parked
    h.status("b", &[]);
    assert!(h.pending.is_failed(&e));

    assert_eq!(h.status("a", &[e]), Outcome::Unchanged);
    assert!(h.pending.is_missing(&e));
    assert_eq!(h.pending.take_missing(), vec![e]);
}
