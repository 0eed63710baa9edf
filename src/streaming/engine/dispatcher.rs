use std::collections::HashSet;

use bitcoin::consensus;
use bitcoin::{Transaction, Txid};

use crate::error::IntegrityError;
use crate::streaming::electrum::api::{ReplyHandler, Transport};
use crate::streaming::engine::fingerprint::Fingerprint;
use crate::streaming::engine::pending::PendingWork;
use crate::streaming::engine::types::{Address, Height, History, HistoryEntry, InboundMessage, Request};
use crate::wallet::WalletStore;

/// What applying one message did to the tracked state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Local state already matches.
    Unchanged,
    HistoryRequested,
    /// History written; `missing` transactions were queued for fetching.
    HistoryStored { missing: usize },
    TransactionStored,
    /// Protocol error, unknown method, stale or unsolicited reply.
    Discarded,
}

/// Applies one inbound message at a time to the engine state.
pub struct Dispatcher<'a, W: ?Sized, T: ?Sized> {
    pub wallet: &'a W,
    pub transport: &'a T,
    pub pending: &'a mut PendingWork,
    pub replies: &'a ReplyHandler,
}

impl<'a, W, T> Dispatcher<'a, W, T>
where
    W: WalletStore + ?Sized,
    T: Transport + ?Sized,
{
    /// Integrity failures leave the engine state as it was before the message.
    pub fn dispatch(&mut self, message: InboundMessage) -> Result<Outcome, IntegrityError> {
        match message {
            InboundMessage::AddressStatus { address, status } => Ok(self.on_address_status(address, status)),
            InboundMessage::AddressHistory { address, history } => self.on_address_history(address, history),
            InboundMessage::Transaction { txid, height, raw } => self.on_transaction(txid, height, &raw),
            InboundMessage::Failed { request, error } => {
                log::warn!("[DISPATCH] server error for {:?}: {}", request, error);
                self.on_failed(request);
                Ok(Outcome::Discarded)
            }
            InboundMessage::Unrecognized { method, params } => {
                log::debug!("[DISPATCH] unknown message: {} {}", method, params);
                Ok(Outcome::Discarded)
            }
        }
    }

    /// A refused request stops counting as outstanding. The next status of
    /// the address (or a reconnect) asks again.
    fn on_failed(&mut self, request: Request) {
        match request {
            Request::GetTransaction { txid, height } => {
                if self.pending.fail_transaction(&HistoryEntry::new(txid, height)) {
                    log::debug!("[DISPATCH] tx {} parked until the next status", txid);
                }
            }
            Request::GetHistory(address) => {
                if self.pending.complete_history(&address).is_some() {
                    log::debug!("[DISPATCH] history fetch of {} dropped", address);
                }
            }
            // re-announced with the next session
            Request::Subscribe(_) => {}
        }
    }

    fn on_address_status(&mut self, address: Address, status: Fingerprint) -> Outcome {
        let local_history = self.wallet.current_history(&address);
        let retried = self.pending.retry_failed(local_history.entries());
        if retried > 0 {
            log::debug!("[DISPATCH] retrying {} failed transactions of {}", retried, address);
        }

        let local = Fingerprint::of(&local_history);
        if local == status {
            // A fetch still in flight is stale now; its reply will be dropped.
            if self.pending.complete_history(&address).is_some() {
                log::debug!("[DISPATCH] {} back to local state, dropping pending fetch", address);
            }
            log::trace!("[DISPATCH] {} unchanged ({})", address, status);
            return Outcome::Unchanged;
        }

        match self.pending.expected_history(&address) {
            Some(expected) if expected == status => {
                log::trace!("[DISPATCH] history of {} already requested", address);
                Outcome::Unchanged
            }
            previous => {
                if let Some(previous) = previous {
                    log::debug!(
                        "[DISPATCH] status of {} moved from {} to {} while fetching, asking again",
                        address,
                        previous,
                        status
                    );
                }
                log::debug!("[DISPATCH] {} changed: local {}, server {}", address, local, status);
                self.pending.expect_history(address.clone(), status);
                self.transport
                    .send(vec![Request::GetHistory(address)], self.replies.clone());
                Outcome::HistoryRequested
            }
        }
    }

    fn on_address_history(&mut self, address: Address, history: History) -> Result<Outcome, IntegrityError> {
        let Some(announced) = self.pending.expected_history(&address) else {
            log::debug!("[DISPATCH] unsolicited history for {}, ignoring", address);
            return Ok(Outcome::Discarded);
        };

        log::debug!("[DISPATCH] receiving history of {}: {} entries", address, history.entries().len());

        let entries = match history {
            History::Unenumerable => {
                if announced != Fingerprint::Unenumerable
                    && self.pending.take_superseded(&address, &Fingerprint::Unenumerable)
                {
                    log::debug!("[DISPATCH] stale pruned history for {}, newer fetch outstanding", address);
                    return Ok(Outcome::Discarded);
                }
                if announced != Fingerprint::Unenumerable {
                    log::warn!(
                        "[DISPATCH] {} announced {} but server returned a pruned history",
                        address,
                        announced
                    );
                }
                self.pending.complete_history(&address);
                self.wallet.write_history(&address, History::Unenumerable);
                return Ok(Outcome::HistoryStored { missing: 0 });
            }
            History::Entries(entries) => entries,
        };

        let mut seen: HashSet<Txid> = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if !seen.insert(entry.txid) {
                return Err(IntegrityError::DuplicateTxid {
                    address,
                    txid: entry.txid,
                });
            }
        }

        let delivered = Fingerprint::of_entries(&entries);
        if delivered != announced {
            if self.pending.take_superseded(&address, &delivered) {
                log::debug!("[DISPATCH] stale history for {} ({}), newer fetch outstanding", address, delivered);
                return Ok(Outcome::Discarded);
            }
            return Err(IntegrityError::FingerprintMismatch {
                address,
                announced,
                delivered,
            });
        }

        self.pending.complete_history(&address);
        self.wallet
            .write_history(&address, History::Entries(entries.clone()));

        let mut missing = 0;
        for entry in entries {
            if self.wallet.is_known_transaction(&entry.txid) || self.pending.is_tracked(&entry) {
                continue;
            }
            if self.pending.mark_missing(entry) {
                missing += 1;
            }
        }

        if missing > 0 {
            log::debug!("[DISPATCH] {} transactions missing for {}", missing, address);
        }
        Ok(Outcome::HistoryStored { missing })
    }

    fn on_transaction(&mut self, txid: Txid, height: Height, raw: &[u8]) -> Result<Outcome, IntegrityError> {
        let tx: Transaction =
            consensus::deserialize(raw).map_err(|e| IntegrityError::UndecodableTransaction {
                txid,
                reason: e.to_string(),
            })?;

        let delivered = tx.compute_txid();
        if delivered != txid {
            return Err(IntegrityError::TxidMismatch {
                requested: txid,
                delivered,
            });
        }

        if !self.pending.complete_transaction(&HistoryEntry::new(txid, height)) {
            log::debug!("[DISPATCH] unsolicited tx {} at {}, ignoring", txid, height);
            return Ok(Outcome::Discarded);
        }

        log::debug!("[DISPATCH] received tx {} ({} bytes)", txid, raw.len());
        self.wallet.write_transaction(txid, height, tx);
        Ok(Outcome::TransactionStored)
    }
}
