use std::time::Duration;

use bitcoin::Network;

/// How long the loop waits on the inbound queue before re-evaluating.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long one suspension waits for the transport before re-checking
/// cancellation.
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(1);

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

pub const DEFAULT_ELECTRUM_URL: &str = "ssl://electrum.blockstream.info:60002";
pub const CLIENT_NAME: &str = "electrum-wallet-synchronizer";
pub const PROTOCOL_VERSION: &str = "1.4";
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Tuning of the reconciliation loop.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub reconnect_wait: Duration,
    /// Capacity of the inbound queue; transports block when it is full.
    pub queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl SyncConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_reconnect_wait(mut self, reconnect_wait: Duration) -> Self {
        self.reconnect_wait = reconnect_wait;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }
}

/// Connection settings of the Electrum transport.
#[derive(Debug, Clone)]
pub struct ElectrumConfig {
    /// `ssl://host:port` or `tcp://host:port`. Bare `host:port` means ssl.
    pub url: String,
    /// Addresses from other networks are refused.
    pub network: Network,
    pub client_name: String,
    pub protocol_version: String,
    pub retry_delay: Duration,
}

impl ElectrumConfig {
    pub fn new(url: impl Into<String>, network: Network) -> Self {
        Self {
            url: url.into(),
            network,
            client_name: CLIENT_NAME.to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

impl Default for ElectrumConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ELECTRUM_URL, Network::Testnet)
    }
}
