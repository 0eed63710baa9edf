use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::streaming::electrum::api::{ReplyHandler, Transport};
use crate::streaming::engine::types::{InboundMessage, Request};
use crate::streaming::runtime::notify::Notification;

#[derive(Default)]
struct MockState {
    connected: bool,
    epoch: u64,
    busy: bool,
    subscribed: Vec<Request>,
    sent: Vec<Request>,
    replies: Option<ReplyHandler>,
    notifications: Vec<Notification>,
}

/// Pure in-memory transport for tests.
///
/// Records every request; tests play the server by calling [`deliver`].
///
/// [`deliver`]: MockTransport::deliver
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Connected and idle.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                connected: true,
                epoch: 1,
                ..MockState::default()
            }),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        let mut s = self.lock();
        if connected && !s.connected {
            s.epoch += 1;
        }
        s.connected = connected;
    }

    /// Drops and re-establishes the connection between two polls.
    pub fn reconnect(&self) {
        let mut s = self.lock();
        s.connected = true;
        s.epoch += 1;
    }

    /// Pretend the server still has work in flight.
    pub fn set_busy(&self, busy: bool) {
        self.lock().busy = busy;
    }

    /// Hands `message` to the most recently registered reply handler.
    pub fn deliver(&self, message: InboundMessage) -> bool {
        let replies = self.lock().replies.clone();
        match replies {
            Some(replies) => {
                replies(message);
                true
            }
            None => {
                log::warn!("[MOCK] no reply handler registered, dropping {}", message.method());
                false
            }
        }
    }

    pub fn subscribed(&self) -> Vec<Request> {
        self.lock().subscribed.clone()
    }

    pub fn sent(&self) -> Vec<Request> {
        self.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<Request> {
        std::mem::take(&mut self.lock().sent)
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().notifications.clone()
    }

    pub fn notification_count(&self, notification: Notification) -> usize {
        self.lock()
            .notifications
            .iter()
            .filter(|n| **n == notification)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for MockTransport {
    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn wait_until_connected(&self, _timeout: Duration) -> bool {
        self.lock().connected
    }

    fn connection_epoch(&self) -> u64 {
        self.lock().epoch
    }

    fn main_server(&self) -> String {
        "mock".to_string()
    }

    fn subscribe(&self, requests: Vec<Request>, replies: ReplyHandler) {
        let mut s = self.lock();
        s.subscribed.extend(requests);
        s.replies = Some(replies);
    }

    fn send(&self, requests: Vec<Request>, replies: ReplyHandler) {
        let mut s = self.lock();
        s.sent.extend(requests);
        s.replies = Some(replies);
    }

    fn is_up_to_date(&self) -> bool {
        let s = self.lock();
        s.connected && !s.busy
    }

    fn trigger_notification(&self, notification: Notification) {
        self.lock().notifications.push(notification);
    }
}
