//! Background synchronizer keeping a watch-only wallet in line with an
//! Electrum server through the subscribe/notify protocol.

pub mod config;
pub mod error;
pub mod persistence;
pub mod streaming;
pub mod wallet;

pub use config::{ElectrumConfig, SyncConfig};
pub use error::{IntegrityError, SyncError};
pub use streaming::electrum::{ElectrumTransport, MockTransport, Transport};
pub use streaming::engine::{Fingerprint, History, HistoryEntry, InboundMessage};
pub use streaming::runtime::{CancellationToken, Notification, SyncHandle, SyncStats, Synchronizer};
pub use wallet::{MemoryWallet, WalletStore};
