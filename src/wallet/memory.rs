use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bitcoin::{Transaction, Txid};

use crate::streaming::engine::types::{Address, Height, History};
use crate::wallet::WalletStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTransaction {
    pub height: Height,
    pub tx: Transaction,
}

/// Plain copy of the wallet contents, used for persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletSnapshot {
    pub addresses: Vec<Address>,
    pub histories: HashMap<Address, History>,
    pub transactions: HashMap<Txid, StoredTransaction>,
}

#[derive(Debug, Default)]
struct WalletState {
    watched: BTreeSet<Address>,
    /// Watched but not yet handed to the synchronizer.
    unannounced: Vec<Address>,
    histories: HashMap<Address, History>,
    transactions: HashMap<Txid, StoredTransaction>,
}

/// Watch-only, in-memory wallet store.
///
/// Readers (UI, CLI) and the synchronizer share it through an `Arc`; the
/// `RwLock` keeps reads consistent while the synchronizer writes.
#[derive(Debug, Default)]
pub struct MemoryWallet {
    state: RwLock<WalletState>,
    up_to_date: AtomicBool,
}

impl MemoryWallet {
    pub fn new(addresses: impl IntoIterator<Item = Address>) -> Self {
        let state = WalletState {
            watched: addresses.into_iter().collect(),
            ..WalletState::default()
        };
        Self {
            state: RwLock::new(state),
            up_to_date: AtomicBool::new(false),
        }
    }

    pub fn from_snapshot(snapshot: WalletSnapshot) -> Self {
        let state = WalletState {
            watched: snapshot.addresses.into_iter().collect(),
            unannounced: Vec::new(),
            histories: snapshot.histories,
            transactions: snapshot.transactions,
        };
        Self {
            state: RwLock::new(state),
            up_to_date: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> WalletSnapshot {
        let s = self.read();
        WalletSnapshot {
            addresses: s.watched.iter().cloned().collect(),
            histories: s.histories.clone(),
            transactions: s.transactions.clone(),
        }
    }

    /// Starts watching `address`. The next `synchronize_derivation` reports
    /// it. Returns false if it was already watched.
    pub fn watch(&self, address: impl Into<Address>) -> bool {
        let address = address.into();
        let mut s = self.write();
        if !s.watched.insert(address.clone()) {
            return false;
        }
        log::debug!("[WALLET] watching {}", address);
        s.unannounced.push(address);
        true
    }

    pub fn transaction(&self, txid: &Txid) -> Option<StoredTransaction> {
        self.read().transactions.get(txid).cloned()
    }

    pub fn transaction_count(&self) -> usize {
        self.read().transactions.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, WalletState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, WalletState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WalletStore for MemoryWallet {
    fn synchronize_derivation(&self) -> Vec<Address> {
        let mut s = self.write();
        std::mem::take(&mut s.unannounced)
    }

    fn all_histories(&self) -> HashMap<Address, History> {
        self.read().histories.clone()
    }

    fn is_known_transaction(&self, txid: &Txid) -> bool {
        self.read().transactions.contains_key(txid)
    }

    fn current_history(&self, address: &str) -> History {
        self.read().histories.get(address).cloned().unwrap_or_default()
    }

    fn write_history(&self, address: &str, history: History) {
        log::trace!("[WALLET] history for {} -> {} entries", address, history.entries().len());
        self.write().histories.insert(address.to_string(), history);
    }

    fn write_transaction(&self, txid: Txid, height: Height, tx: Transaction) {
        log::trace!("[WALLET] store tx {} at height {}", txid, height);
        self.write()
            .transactions
            .insert(txid, StoredTransaction { height, tx });
    }

    fn set_up_to_date(&self, up_to_date: bool) {
        self.up_to_date.store(up_to_date, Ordering::SeqCst);
    }

    fn is_up_to_date(&self) -> bool {
        self.up_to_date.load(Ordering::SeqCst)
    }

    fn watched_addresses(&self) -> Vec<Address> {
        self.read().watched.iter().cloned().collect()
    }
}
