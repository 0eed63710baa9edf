use bitcoin::Txid;

use crate::streaming::engine::fingerprint::Fingerprint;
use crate::streaming::engine::types::Address;

/// The server contradicted itself. Raised per message; the engine keeps
/// running and nothing from the offending message is written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("server sent history with non-unique txid {txid} for {address}")]
    DuplicateTxid { address: Address, txid: Txid },

    #[error("status mismatch for {address}: announced {announced}, delivered history hashes to {delivered}")]
    FingerprintMismatch {
        address: Address,
        announced: Fingerprint,
        delivered: Fingerprint,
    },

    #[error("requested transaction {requested} but server delivered {delivered}")]
    TxidMismatch { requested: Txid, delivered: Txid },

    #[error("transaction {txid} could not be decoded: {reason}")]
    UndecodableTransaction { txid: Txid, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("integrity failure: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("failed to spawn synchronizer thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("synchronizer thread panicked")]
    WorkerPanicked,
}
