use std::sync::Arc;
use std::time::Duration;

use crate::streaming::engine::types::{InboundMessage, Request};
use crate::streaming::runtime::notify::Notification;

/// Receives every asynchronous reply belonging to a batch of requests.
///
/// Implementations only enqueue; they never call back into the engine.
pub type ReplyHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Minimal transport interface used by the synchronizer.
///
/// The transport owns the connection, request/response correlation and
/// reconnection. Replies are delivered through the handler passed with the
/// requests, from whatever thread the transport runs on.
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Blocks until connected or `timeout` elapses. Returns the connection state.
    fn wait_until_connected(&self, timeout: Duration) -> bool;

    /// Bumped every time a connection becomes ready. A change means whatever
    /// was in flight or subscribed is gone, even if `is_connected` never
    /// reported false in between.
    fn connection_epoch(&self) -> u64;

    /// Identity of the server we talk to, for logs.
    fn main_server(&self) -> String;

    /// Sends subscription requests. The handler stays registered and also
    /// receives later status-change notifications.
    fn subscribe(&self, requests: Vec<Request>, replies: ReplyHandler);

    fn send(&self, requests: Vec<Request>, replies: ReplyHandler);

    /// True when the transport has nothing queued or in flight.
    fn is_up_to_date(&self) -> bool;

    fn trigger_notification(&self, notification: Notification);
}
