//! JSON snapshot of a [`MemoryWallet`].
//!
//! Transactions are kept as consensus-encoded hex so the file stays readable
//! and the txids can be re-checked on load.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use bitcoin::{consensus, Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::streaming::engine::types::{Address, Height, History};
use crate::wallet::{MemoryWallet, StoredTransaction, WalletSnapshot};

pub const WALLET_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct WalletFile {
    version: u32,
    addresses: Vec<Address>,
    histories: BTreeMap<Address, History>,
    transactions: Vec<TxRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TxRecord {
    txid: Txid,
    height: Height,
    raw: String,
}

impl From<&WalletSnapshot> for WalletFile {
    fn from(snapshot: &WalletSnapshot) -> Self {
        let mut transactions: Vec<TxRecord> = snapshot
            .transactions
            .iter()
            .map(|(txid, stored)| TxRecord {
                txid: *txid,
                height: stored.height,
                raw: consensus::encode::serialize_hex(&stored.tx),
            })
            .collect();
        transactions.sort_by_key(|r| (r.height, r.txid));

        Self {
            version: WALLET_FILE_VERSION,
            addresses: snapshot.addresses.clone(),
            histories: snapshot.histories.clone().into_iter().collect(),
            transactions,
        }
    }
}

impl TryFrom<WalletFile> for WalletSnapshot {
    type Error = anyhow::Error;

    fn try_from(file: WalletFile) -> Result<Self> {
        if file.version != WALLET_FILE_VERSION {
            bail!("unsupported wallet file version {}", file.version);
        }

        let mut transactions = HashMap::with_capacity(file.transactions.len());
        for record in file.transactions {
            let raw = hex::decode(&record.raw).with_context(|| format!("bad hex for tx {}", record.txid))?;
            let tx: Transaction =
                consensus::deserialize(&raw).with_context(|| format!("bad transaction {}", record.txid))?;
            if tx.compute_txid() != record.txid {
                bail!("stored transaction {} hashes to {}", record.txid, tx.compute_txid());
            }
            transactions.insert(
                record.txid,
                StoredTransaction {
                    height: record.height,
                    tx,
                },
            );
        }

        Ok(WalletSnapshot {
            addresses: file.addresses,
            histories: file.histories.into_iter().collect(),
            transactions,
        })
    }
}

/// Opens the wallet at `path`, or starts an empty one if the file does not
/// exist yet. `addresses` are added to the watch list either way.
pub fn load_or_create(path: impl AsRef<Path>, addresses: &[Address]) -> Result<MemoryWallet> {
    let path = path.as_ref();

    let mut snapshot = if path.exists() {
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: WalletFile =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        let snapshot = WalletSnapshot::try_from(file)?;
        log::info!(
            "[WALLET] Loaded {} addresses, {} transactions from {}",
            snapshot.addresses.len(),
            snapshot.transactions.len(),
            path.display()
        );
        snapshot
    } else {
        log::info!("[WALLET] Creating new wallet at {}", path.display());
        WalletSnapshot::default()
    };

    for address in addresses {
        if !snapshot.addresses.contains(address) {
            snapshot.addresses.push(address.clone());
        }
    }

    Ok(MemoryWallet::from_snapshot(snapshot))
}

/// Writes the wallet to `path` through a temporary file, so a crash never
/// leaves a half-written snapshot behind.
pub fn save(wallet: &MemoryWallet, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = WalletFile::from(&wallet.snapshot());
    let data = serde_json::to_string_pretty(&file)?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;

    log::debug!("[WALLET] Saved {} transactions to {}", file.transactions.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::engine::types::HistoryEntry;
    use crate::wallet::WalletStore;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Global counter to ensure unique paths
    static TEST_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn temp_wallet_path() -> PathBuf {
        let mut dir = std::env::temp_dir();
        let count = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        dir.push(format!("wallet_sync_test_{}_{}", std::process::id(), count));
        fs::create_dir_all(&dir).expect("failed to create temp dir");
        dir.push("wallet.json");
        dir
    }

    fn tx(n: u32) -> Transaction {
        Transaction {
            version: Version(2),
            lock_time: LockTime::from_consensus(n),
            input: vec![],
            output: vec![],
        }
    }

    #[test]
    fn missing_file_creates_empty_wallet() {
        let path = temp_wallet_path();
        let wallet = load_or_create(&path, &["addrA".to_string()]).unwrap();

        assert_eq!(wallet.watched_addresses(), vec!["addrA".to_string()]);
        assert_eq!(wallet.transaction_count(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn saved_wallet_loads_back() {
        let path = temp_wallet_path();
        let wallet = load_or_create(&path, &["addrA".to_string()]).unwrap();

        let t1 = tx(1);
        let txid = t1.compute_txid();
        wallet.write_history("addrA", History::from_entries([HistoryEntry::new(txid, 12)]));
        wallet.write_history("addrB", History::Unenumerable);
        wallet.write_transaction(txid, 12, t1.clone());
        save(&wallet, &path).unwrap();

        let loaded = load_or_create(&path, &["addrC".to_string()]).unwrap();
        assert_eq!(
            loaded.watched_addresses(),
            vec!["addrA".to_string(), "addrC".to_string()]
        );
        assert_eq!(loaded.current_history("addrA"), wallet.current_history("addrA"));
        assert_eq!(loaded.current_history("addrB"), History::Unenumerable);
        assert_eq!(loaded.transaction(&txid).unwrap().tx, t1);
    }

    #[test]
    fn tampered_transaction_is_rejected() {
        let path = temp_wallet_path();
        let wallet = MemoryWallet::default();
        let t1 = tx(1);
        wallet.write_transaction(t1.compute_txid(), 1, t1);
        save(&wallet, &path).unwrap();

        let data = fs::read_to_string(&path).unwrap();
        let other = consensus::encode::serialize_hex(&tx(2));
        let mut file: serde_json::Value = serde_json::from_str(&data).unwrap();
        file["transactions"][0]["raw"] = serde_json::Value::String(other);
        fs::write(&path, file.to_string()).unwrap();

        assert!(load_or_create(&path, &[]).is_err());
    }
}
