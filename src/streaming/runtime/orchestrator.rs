use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::config::SyncConfig;
use crate::error::{IntegrityError, SyncError};
use crate::streaming::electrum::api::Transport;
use crate::streaming::engine::dispatcher::{Dispatcher, Outcome};
use crate::streaming::engine::pending::PendingWork;
use crate::streaming::engine::types::{InboundMessage, Request};
use crate::streaming::runtime::notify::UpdateNotifier;
use crate::streaming::runtime::subscription::SubscriptionManager;
use crate::wallet::WalletStore;

/// Shared stop flag, checked once at the top of every loop iteration.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters of what the loop has seen so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub messages: u64,
    pub histories_stored: u64,
    pub transactions_stored: u64,
    pub integrity_failures: u64,
    pub discarded: u64,
    pub sessions: u64,
}

/// **Synchronizer**
///
/// The reconciliation loop. It is the only mutator of [`PendingWork`] and the
/// only writer of wallet histories and transactions. Transports never touch it
/// directly; their replies go through the bounded inbound queue and are
/// applied here one by one, in arrival order.
pub struct Synchronizer<W: ?Sized, T: ?Sized> {
    wallet: Arc<W>,
    transport: Arc<T>,
    config: SyncConfig,

    pending: PendingWork,
    notifier: UpdateNotifier,
    subscriptions: SubscriptionManager,
    inbound: Receiver<InboundMessage>,

    cancel: CancellationToken,

    /// Connection epoch the subscriptions were last announced on.
    session_epoch: Option<u64>,

    stats: SyncStats,

    /// Start time for logging relative timestamps.
    t0: Instant,
}

impl<W, T> Synchronizer<W, T>
where
    W: WalletStore + ?Sized,
    T: Transport + ?Sized,
{
    pub fn new(wallet: Arc<W>, transport: Arc<T>, config: SyncConfig) -> Self {
        let (sender, inbound) = crossbeam_channel::bounded(config.queue_capacity);
        Self {
            wallet,
            transport,
            config,
            pending: PendingWork::new(),
            notifier: UpdateNotifier::new(),
            subscriptions: SubscriptionManager::new(sender),
            inbound,
            cancel: CancellationToken::new(),
            session_epoch: None,
            stats: SyncStats::default(),
            t0: Instant::now(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    pub fn pending(&self) -> &PendingWork {
        &self.pending
    }

    /// Runs until cancelled and returns the final counters.
    ///
    /// Cancellation is honoured between iterations; a running queue wait is
    /// allowed to finish.
    pub fn run(mut self) -> SyncStats {
        self.info("starting synchronizer");
        while !self.cancel.is_cancelled() {
            self.tick();
        }
        self.info(&format!("stopped: {:?}", self.stats));
        self.stats
    }

    /// One loop iteration. Handles at most one inbound message.
    pub fn tick(&mut self) {
        // 1. connectivity
        if !self.transport.is_connected() {
            if self.session_epoch.take().is_some() {
                self.info("transport disconnected, suspending");
                self.publish_up_to_date(false);
                self.notifier.flush_state(&*self.transport);
            }
            if !self.transport.wait_until_connected(self.config.reconnect_wait) {
                return;
            }
        }
        // a reconnect between two polls only shows as a new epoch
        let epoch = self.transport.connection_epoch();
        if self.session_epoch != Some(epoch) {
            self.open_session(epoch);
        }

        // 2. new addresses
        let new_addresses = self.wallet.synchronize_derivation();
        if !new_addresses.is_empty() {
            self.debug(&format!("{} new addresses", new_addresses.len()));
            self.subscriptions.subscribe(&*self.transport, new_addresses);
        }

        // 3. missing transactions
        self.request_missing_transactions();

        // 4. up-to-date flag
        let up_to_date =
            self.transport.is_up_to_date() && self.inbound.is_empty() && self.pending.is_idle();
        self.publish_up_to_date(up_to_date);
        self.notifier.flush_state(&*self.transport);

        // 5. next message
        let message = match self.inbound.recv_timeout(self.config.poll_interval) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => return,
            Err(RecvTimeoutError::Disconnected) => {
                // We hold a sender ourselves, so this only happens on teardown.
                log::error!("[SYNC] inbound queue disconnected");
                return;
            }
        };

        // 6. dispatch
        self.handle_message(message);
    }

    /// (Re)announces everything on a fresh connection.
    fn open_session(&mut self, epoch: u64) {
        self.stats.sessions += 1;
        self.info(&format!(
            "connected to {} (epoch {})",
            self.transport.main_server(),
            epoch
        ));

        self.pending.rollback_in_flight();

        for history in self.wallet.all_histories().into_values() {
            for entry in history.entries() {
                if !self.wallet.is_known_transaction(&entry.txid) {
                    self.pending.mark_missing(*entry);
                }
            }
        }
        let missing = self.pending.missing_tx().count();
        if missing > 0 {
            self.debug(&format!("{} transactions missing from wallet", missing));
        }

        let watched = self.wallet.watched_addresses();
        self.subscriptions.subscribe(&*self.transport, watched);
        self.session_epoch = Some(epoch);
    }

    fn request_missing_transactions(&mut self) {
        let requests: Vec<Request> = self
            .pending
            .take_missing()
            .into_iter()
            .map(|e| Request::GetTransaction {
                txid: e.txid,
                height: e.height,
            })
            .collect();

        if requests.is_empty() {
            return;
        }

        self.trace(&format!("requesting {} transactions", requests.len()));
        self.transport
            .send(requests, self.subscriptions.replies().clone());
    }

    fn publish_up_to_date(&mut self, up_to_date: bool) {
        if self.wallet.is_up_to_date() == up_to_date {
            return;
        }
        self.debug(&format!("up to date: {}", up_to_date));
        self.wallet.set_up_to_date(up_to_date);
        self.notifier.state_changed();
    }

    /// Per-message failures stop here; the loop only sees whether state moved.
    fn handle_message(&mut self, message: InboundMessage) {
        self.stats.messages += 1;
        self.trace(&format!("message: {}", message.method()));

        let mut dispatcher = Dispatcher {
            wallet: &*self.wallet,
            transport: &*self.transport,
            pending: &mut self.pending,
            replies: self.subscriptions.replies(),
        };

        match dispatcher.dispatch(message) {
            Ok(Outcome::TransactionStored) => {
                self.stats.transactions_stored += 1;
                self.notifier.transaction_received();
            }
            Ok(Outcome::HistoryStored { .. }) => self.stats.histories_stored += 1,
            Ok(Outcome::Discarded) => self.stats.discarded += 1,
            Ok(Outcome::Unchanged) | Ok(Outcome::HistoryRequested) => {}
            Err(e) => self.on_integrity_failure(e),
        }

        self.notifier
            .flush_new_data(&*self.transport, self.pending.transactions_outstanding());
    }

    fn on_integrity_failure(&mut self, e: IntegrityError) {
        self.stats.integrity_failures += 1;
        log::error!("[SYNC] {:>8}us: {}", self.t(), SyncError::from(e));
    }

    fn t(&self) -> u128 {
        self.t0.elapsed().as_micros()
    }

    fn info(&self, msg: &str) {
        log::info!("[SYNC] {:>8}us: {}", self.t(), msg);
    }

    fn debug(&self, msg: &str) {
        log::debug!("[SYNC] {:>8}us: {}", self.t(), msg);
    }

    fn trace(&self, msg: &str) {
        log::trace!("[SYNC] {:>8}us: {}", self.t(), msg);
    }
}

impl<W, T> Synchronizer<W, T>
where
    W: WalletStore + ?Sized + 'static,
    T: Transport + ?Sized + 'static,
{
    /// Runs the loop on its own named thread.
    pub fn spawn(self) -> Result<SyncHandle, SyncError> {
        let cancel = self.cancellation_token();
        let thread = std::thread::Builder::new()
            .name("synchronizer".to_string())
            .spawn(move || self.run())
            .map_err(SyncError::Spawn)?;
        Ok(SyncHandle { cancel, thread })
    }
}

/// Handle to a spawned synchronizer.
pub struct SyncHandle {
    cancel: CancellationToken,
    thread: JoinHandle<SyncStats>,
}

impl SyncHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels and waits for the loop to finish its current wait.
    pub fn stop(self) -> Result<SyncStats, SyncError> {
        self.cancel();
        self.join()
    }

    pub fn join(self) -> Result<SyncStats, SyncError> {
        self.thread.join().map_err(|_| SyncError::WorkerPanicked)
    }
}
