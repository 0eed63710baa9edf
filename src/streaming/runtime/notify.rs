use std::fmt;

use crate::streaming::electrum::api::Transport;

/// Signals sent to whoever renders wallet state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notification {
    /// The up-to-date flag flipped.
    Updated,
    /// Transaction bodies arrived and none are outstanding anymore.
    NewTransaction,
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Updated => "updated",
            Notification::NewTransaction => "new_transaction",
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Edge-triggered notification state.
///
/// Fires at most once per convergence event, never once per message.
#[derive(Debug)]
pub struct UpdateNotifier {
    updated: bool,
    new_data: bool,
}

impl Default for UpdateNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateNotifier {
    /// Starts armed so observers learn the initial state.
    pub fn new() -> Self {
        Self {
            updated: true,
            new_data: false,
        }
    }

    pub fn state_changed(&mut self) {
        self.updated = true;
    }

    pub fn transaction_received(&mut self) {
        self.new_data = true;
    }

    /// Fires `Updated` if the state changed since the last flush.
    pub fn flush_state<T: Transport + ?Sized>(&mut self, transport: &T) -> bool {
        if !self.updated {
            return false;
        }
        self.updated = false;
        transport.trigger_notification(Notification::Updated);
        true
    }

    /// Fires `Updated` + `NewTransaction` once received transactions leave
    /// nothing outstanding.
    pub fn flush_new_data<T: Transport + ?Sized>(&mut self, transport: &T, outstanding: usize) -> bool {
        if !self.new_data || outstanding > 0 {
            return false;
        }
        self.new_data = false;
        self.updated = false;
        transport.trigger_notification(Notification::Updated);
        transport.trigger_notification(Notification::NewTransaction);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::electrum::mock::MockTransport;

    #[test]
    fn initial_state_is_announced_once() {
        let transport = MockTransport::new();
        let mut notifier = UpdateNotifier::new();

        assert!(notifier.flush_state(&transport));
        assert!(!notifier.flush_state(&transport));
        assert_eq!(transport.notifications(), vec![Notification::Updated]);
    }

    #[test]
    fn new_data_waits_for_last_transaction() {
        let transport = MockTransport::new();
        let mut notifier = UpdateNotifier::new();
        notifier.flush_state(&transport);

        notifier.transaction_received();
        assert!(!notifier.flush_new_data(&transport, 2));
        notifier.transaction_received();
        assert!(!notifier.flush_new_data(&transport, 1));
        notifier.transaction_received();
        assert!(notifier.flush_new_data(&transport, 0));
        assert!(!notifier.flush_new_data(&transport, 0));

        assert_eq!(transport.notification_count(Notification::NewTransaction), 1);
    }
}
