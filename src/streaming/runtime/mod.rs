//! Imperative shell around the reconciliation core: the loop, the inbound
//! queue, subscriptions and notifications.

pub mod notify;
pub mod orchestrator;
pub mod subscription;


pub use notify::{Notification, UpdateNotifier};
pub use orchestrator::{CancellationToken, SyncHandle, SyncStats, Synchronizer};
pub use subscription::SubscriptionManager;
