use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::streaming::electrum::api::{ReplyHandler, Transport};
use crate::streaming::engine::types::{Address, InboundMessage, Request};

/// Turns addresses into subscription requests and owns the reply handler
/// feeding the inbound queue.
pub struct SubscriptionManager {
    replies: ReplyHandler,
}

impl SubscriptionManager {
    pub fn new(inbound: Sender<InboundMessage>) -> Self {
        let replies: ReplyHandler = Arc::new(move |message: InboundMessage| {
            if let Err(e) = inbound.send(message) {
                log::warn!("[SYNC] inbound queue closed, dropping {}", e.0.method());
            }
        });
        Self { replies }
    }

    /// Handler to pass along with every request of this synchronizer.
    pub fn replies(&self) -> &ReplyHandler {
        &self.replies
    }

    /// Subscribes all `addresses` in one batch. Replies arrive later on the
    /// inbound queue. Re-subscribing an address is harmless.
    pub fn subscribe<T: Transport + ?Sized>(
        &self,
        transport: &T,
        addresses: impl IntoIterator<Item = Address>,
    ) -> usize {
        let requests: Vec<Request> = addresses.into_iter().map(Request::Subscribe).collect();
        if requests.is_empty() {
            return 0;
        }

        let count = requests.len();
        log::debug!("[SYNC] subscribing {} addresses", count);
        transport.subscribe(requests, self.replies.clone());
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::electrum::mock::MockTransport;
    use crate::streaming::engine::fingerprint::Fingerprint;

    #[test]
    fn batches_and_routes_replies_to_queue() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let manager = SubscriptionManager::new(tx);
        let transport = MockTransport::new();

        assert_eq!(manager.subscribe(&transport, vec!["a".to_string(), "b".to_string()]), 2);
        assert_eq!(
            transport.subscribed(),
            vec![Request::Subscribe("a".into()), Request::Subscribe("b".into())]
        );

        transport.deliver(InboundMessage::AddressStatus {
            address: "a".into(),
            status: Fingerprint::Empty,
        });
        assert!(matches!(rx.try_recv(), Ok(InboundMessage::AddressStatus { .. })));
    }

    #[test]
    fn empty_batch_is_not_sent() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let manager = SubscriptionManager::new(tx);
        let transport = MockTransport::new();

        assert_eq!(manager.subscribe(&transport, Vec::new()), 0);
        assert!(transport.subscribed().is_empty());
    }
}
