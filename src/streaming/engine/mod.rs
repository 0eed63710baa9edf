//! Reconciliation core.
//!
//! Everything in here is synchronous and deterministic: given the same wallet
//! contents and the same sequence of inbound messages, the same requests are
//! issued and the same writes happen.
//! - `fingerprint`: status digest over a history.
//! - `pending`: what is in flight and what is still missing.
//! - `dispatcher`: applies one inbound message to the above.

pub mod dispatcher;
pub mod fingerprint;
pub mod pending;
pub mod types;

pub use dispatcher::{Dispatcher, Outcome};
pub use fingerprint::Fingerprint;
pub use pending::PendingWork;
pub use types::{Address, Height, History, HistoryEntry, InboundMessage, ProtocolError, Request};

#[cfg(test)]
mod tests;
