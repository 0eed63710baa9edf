//! Wallet-store boundary.
//!
//! The synchronizer reads and writes wallet state only through
//! [`WalletStore`]. Implementations must make their reads safe while the
//! synchronizer writes; the engine never locks on their behalf.

use std::collections::HashMap;

use bitcoin::{Transaction, Txid};

use crate::streaming::engine::types::{Address, Height, History};

pub mod memory;

pub use memory::{MemoryWallet, StoredTransaction, WalletSnapshot};

pub trait WalletStore: Send + Sync {
    /// Creates whatever addresses are newly needed and returns them.
    fn synchronize_derivation(&self) -> Vec<Address>;

    fn all_histories(&self) -> HashMap<Address, History>;

    fn is_known_transaction(&self, txid: &Txid) -> bool;

    /// Empty history for addresses never seen.
    fn current_history(&self, address: &str) -> History;

    fn write_history(&self, address: &str, history: History);

    fn write_transaction(&self, txid: Txid, height: Height, tx: Transaction);

    fn set_up_to_date(&self, up_to_date: bool);

    fn is_up_to_date(&self) -> bool;

    fn watched_addresses(&self) -> Vec<Address>;
}
