//! Electrum Protocol Adapter (async implementation).
//!
//! Implements [`Transport`] on top of a Tokio background task. It is a facade
//! bridging the blocking world of the `Synchronizer` with the asynchronous
//! world of network I/O.
//!
//! # Architecture
//! * **Shared State**: `Arc<Shared>` (mutex + condvar) between the blocking
//!   callers and the background task.
//! * **Command Queue**: `subscribe`/`send` push requests to a queue; the
//!   writer loop drains it and writes JSON-RPC lines to the socket.
//! * **Reader Task**: parses every line, correlates it with the in-flight
//!   request (or the subscription, for notifications) and hands the decoded
//!   [`InboundMessage`] to the request's reply handler.
//! * **Reconnection**: on any socket failure everything in flight is dropped,
//!   the state flips to disconnected and a new connection is attempted after
//!   `retry_delay`.
//!
//! The engine speaks in addresses; the wire speaks in script hashes. Addresses
//! are parsed for the configured network and translated here.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_native_tls::TlsConnector;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::Network;

use crossbeam_channel::{Receiver, Sender};

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::ElectrumConfig;
use crate::streaming::electrum::api::{ReplyHandler, Transport};
use crate::streaming::engine::types::{Address, InboundMessage, ProtocolError, Request, METHOD_TRANSACTION_GET};
use crate::streaming::runtime::notify::Notification;

pub const METHOD_SCRIPTHASH_SUBSCRIBE: &str = "blockchain.scripthash.subscribe";
pub const METHOD_SCRIPTHASH_GET_HISTORY: &str = "blockchain.scripthash.get_history";

const FLUSH_INTERVAL: Duration = Duration::from_millis(10);

// =====================================================================
// Utils
// =====================================================================

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Generates a unique, monotonically increasing ID for JSON-RPC requests.
pub fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Convert script bytes to electrum scripthash hex (little endian).
///
/// Electrum uses the sha256 hash of the script, reversed, represented as hex.
pub fn electrum_scripthash(script: &[u8]) -> String {
    let hash = sha256::Hash::hash(script);
    let mut bytes = hash.to_byte_array();
    bytes.reverse();
    hex::encode(bytes)
}

/// Script hash of `address`, which must belong to `network`.
pub fn address_scripthash(address: &str, network: Network) -> Result<String> {
    let address = bitcoin::Address::from_str(address)
        .with_context(|| format!("invalid address {address:?}"))?
        .require_network(network)?;
    Ok(electrum_scripthash(address.script_pubkey().as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerAddr {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// `ssl://host:port`, `tcp://host:port` or bare `host:port` (ssl).
pub(crate) fn parse_server(s: &str) -> Result<ServerAddr> {
    let s = s.trim();
    let (tls, rest) = if let Some(rest) = s.strip_prefix("ssl://") {
        (true, rest)
    } else if let Some(rest) = s.strip_prefix("tcp://") {
        (false, rest)
    } else {
        (true, s)
    };

    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing port in server {s:?}"))?;
    if host.is_empty() {
        bail!("missing host in server {s:?}");
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("bad port in server {s:?}"))?;

    Ok(ServerAddr {
        host: host.to_string(),
        port,
        tls,
    })
}

/// A request as it goes on the wire.
#[derive(Debug, PartialEq)]
pub(crate) struct WireRequest {
    pub method: &'static str,
    pub params: Value,
    /// Set for script-hash keyed requests.
    pub scripthash: Option<String>,
}

pub(crate) fn wire_request(request: &Request, network: Network) -> Result<WireRequest> {
    match request {
        Request::Subscribe(address) | Request::GetHistory(address) => {
            let sh = address_scripthash(address, network)?;
            let method = match request {
                Request::Subscribe(_) => METHOD_SCRIPTHASH_SUBSCRIBE,
                _ => METHOD_SCRIPTHASH_GET_HISTORY,
            };
            Ok(WireRequest {
                method,
                params: json!([sh]),
                scripthash: Some(sh),
            })
        }
        Request::GetTransaction { txid, .. } => Ok(WireRequest {
            method: METHOD_TRANSACTION_GET,
            params: json!([txid.to_string()]),
            scripthash: None,
        }),
    }
}

// =====================================================================
// Shared State
// =====================================================================

/// A request together with the handler its replies go to.
pub(crate) struct Pending {
    pub request: Request,
    pub replies: ReplyHandler,
}

pub(crate) struct Subscription {
    pub address: Address,
    pub replies: ReplyHandler,
}

#[derive(Default)]
pub(crate) struct SharedState {
    pub connected: bool,

    /// Number of connections that became ready so far.
    pub epoch: u64,

    /// Requests waiting to be written to the socket.
    pub command_queue: VecDeque<Pending>,

    /// Request ID -> request (to correlate responses).
    pub inflight_requests: HashMap<u64, Pending>,

    /// Script hash -> subscribed address (to route notifications).
    pub subscriptions: HashMap<String, Subscription>,

    /// Receivers of engine notifications.
    pub observers: Vec<Sender<Notification>>,
}

pub(crate) struct Shared {
    state: Mutex<SharedState>,
    connected_cv: Condvar,
    shutdown: AtomicBool,
    pub network: Network,
}

impl Shared {
    pub(crate) fn new(network: Network) -> Self {
        Self {
            state: Mutex::new(SharedState::default()),
            connected_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            network,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_connected(&self) {
        {
            let mut s = self.lock();
            s.connected = true;
            s.epoch += 1;
        }
        self.connected_cv.notify_all();
    }

    /// Whatever was in flight died with the socket; the synchronizer asks
    /// again once it sees the new connection.
    fn mark_disconnected(&self) {
        let mut s = self.lock();
        s.connected = false;
        s.command_queue.clear();
        s.inflight_requests.clear();
        s.subscriptions.clear();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

// =====================================================================
// Public Client (blocking facade)
// =====================================================================

pub struct ElectrumTransport {
    shared: Arc<Shared>,
    server: String,
}

impl ElectrumTransport {
    /// Spawns the background connection thread and returns immediately.
    /// Use [`Transport::wait_until_connected`] to wait for the handshake.
    pub fn start(config: ElectrumConfig) -> Result<Self> {
        // Fail early on an unusable URL instead of retrying forever.
        parse_server(&config.url)?;

        let shared = Arc::new(Shared::new(config.network));
        let bg_shared = shared.clone();
        let server = config.url.clone();

        std::thread::Builder::new()
            .name("electrum-transport".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("[ADAPTER] cannot build tokio runtime: {}", e);
                        return;
                    }
                };
                rt.block_on(connection_loop(config, bg_shared));
            })
            .context("spawning electrum transport thread")?;

        Ok(Self { shared, server })
    }

    /// New receiver for the notifications the synchronizer triggers.
    pub fn notifications(&self) -> Receiver<Notification> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.shared.lock().observers.push(tx);
        rx
    }

    fn enqueue(&self, requests: Vec<Request>, replies: ReplyHandler) {
        let mut s = self.shared.lock();
        for request in requests {
            s.command_queue.push_back(Pending {
                request,
                replies: replies.clone(),
            });
        }
        log::trace!("[ADAPTER] queue len={}", s.command_queue.len());
    }
}

impl Drop for ElectrumTransport {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
    }
}

// =====================================================================
// Transport
// =====================================================================

impl Transport for ElectrumTransport {
    fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    fn wait_until_connected(&self, timeout: Duration) -> bool {
        let guard = self.shared.lock();
        let (guard, _) = self
            .shared
            .connected_cv
            .wait_timeout_while(guard, timeout, |s| !s.connected)
            .unwrap_or_else(PoisonError::into_inner);
        guard.connected
    }

    fn connection_epoch(&self) -> u64 {
        self.shared.lock().epoch
    }

    fn main_server(&self) -> String {
        self.server.clone()
    }

    fn subscribe(&self, requests: Vec<Request>, replies: ReplyHandler) {
        log::trace!("[ADAPTER] subscribe {} addresses", requests.len());
        self.enqueue(requests, replies);
    }

    fn send(&self, requests: Vec<Request>, replies: ReplyHandler) {
        log::trace!("[ADAPTER] send {} requests", requests.len());
        self.enqueue(requests, replies);
    }

    fn is_up_to_date(&self) -> bool {
        let s = self.shared.lock();
        s.connected && s.command_queue.is_empty() && s.inflight_requests.is_empty()
    }

    fn trigger_notification(&self, notification: Notification) {
        log::debug!("[ADAPTER] notify {}", notification);
        self.shared
            .lock()
            .observers
            .retain(|tx| tx.send(notification).is_ok());
    }
}

// =====================================================================
// Async Task
// =====================================================================

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<S: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for S {}

type BoxedStream = Box<dyn AsyncStream>;

async fn connection_loop(config: ElectrumConfig, shared: Arc<Shared>) {
    while !shared.is_shutdown() {
        match Connection::open(&config, shared.clone()).await {
            Ok(mut conn) => {
                if let Err(e) = conn.run().await {
                    log::warn!("[ADAPTER] connection to {} lost: {:#}", config.url, e);
                }
            }
            Err(e) => log::warn!("[ADAPTER] connecting to {} failed: {:#}", config.url, e),
        }

        shared.mark_disconnected();
        if shared.is_shutdown() {
            break;
        }
        tokio::time::sleep(config.retry_delay).await;
    }
    log::info!("[ADAPTER] transport shut down");
}

struct Connection {
    writer: WriteHalf<BoxedStream>,
    reader: JoinHandle<()>,
    shared: Arc<Shared>,
}

impl Connection {
    /// Establishes the TCP (and TLS) connection and performs the version handshake.
    async fn open(config: &ElectrumConfig, shared: Arc<Shared>) -> Result<Self> {
        let server = parse_server(&config.url)?;
        log::debug!("[ADAPTER] Connecting to {}:{} ...", server.host, server.port);

        let tcp = TcpStream::connect((server.host.as_str(), server.port)).await?;
        let stream: BoxedStream = if server.tls {
            let connector = TlsConnector::from(native_tls::TlsConnector::new()?);
            Box::new(connector.connect(&server.host, tcp).await?)
        } else {
            Box::new(tcp)
        };
        log::info!("[ADAPTER] connected to {} (tls={})", config.url, server.tls);

        let (r, w) = tokio::io::split(stream);
        let reader = tokio::spawn(read_loop(r, shared.clone()));

        let mut this = Self {
            writer: w,
            reader,
            shared,
        };

        this.send(&json!({
            "jsonrpc": "2.0",
            "id": next_id(),
            "method": "server.version",
            "params": [config.client_name, config.protocol_version]
        }))
        .await?;

        this.shared.mark_connected();
        log::info!("[ADAPTER] electrum connection ready");
        Ok(this)
    }

    /// The write loop. Returns when the socket dies or the transport is dropped.
    async fn run(&mut self) -> Result<()> {
        loop {
            if self.shared.is_shutdown() {
                return Ok(());
            }
            if self.reader.is_finished() {
                bail!("socket closed");
            }
            self.flush_outgoing().await?;
            tokio::time::sleep(FLUSH_INTERVAL).await;
        }
    }

    async fn flush_outgoing(&mut self) -> Result<()> {
        let commands: Vec<Pending> = {
            let mut s = self.shared.lock();
            s.command_queue.drain(..).collect()
        };

        for Pending { request, replies } in commands {
            let wire = match wire_request(&request, self.shared.network) {
                Ok(wire) => wire,
                Err(e) => {
                    log::warn!("[ADAPTER] cannot send {:?}: {:#}", request, e);
                    let failed = InboundMessage::Failed {
                        request,
                        error: ProtocolError::new(format!("{e:#}")),
                    };
                    tokio::task::block_in_place(|| replies(failed));
                    continue;
                }
            };

            let id = next_id();
            {
                let mut s = self.shared.lock();
                if let (Request::Subscribe(address), Some(sh)) = (&request, &wire.scripthash) {
                    s.subscriptions.insert(
                        sh.clone(),
                        Subscription {
                            address: address.clone(),
                            replies: replies.clone(),
                        },
                    );
                }
                s.inflight_requests.insert(id, Pending { request, replies });
            }

            self.send(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": wire.method,
                "params": wire.params
            }))
            .await?;
        }

        Ok(())
    }

    async fn send(&mut self, v: &Value) -> Result<()> {
        let s = v.to_string();
        log::trace!("[ADAPTER] >>> {}", s);
        self.writer.write_all(s.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(r: ReadHalf<BoxedStream>, shared: Arc<Shared>) {
    let mut reader = BufReader::new(r);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                log::error!("[ADAPTER] socket closed");
                break;
            }
            Ok(_) => handle_line(&line, &shared),
            Err(e) => {
                log::error!("[ADAPTER] read error: {:?}", e);
                break;
            }
        }
    }
}

// =====================================================================
// Message Processing
// =====================================================================

/// Reply handlers may block on a full inbound queue; the worker steps out of
/// the scheduler while they run so timers and the writer keep going.
pub(crate) fn handle_line(line: &str, shared: &Shared) {
    if let Err(e) = tokio::task::block_in_place(|| process_message(line, shared)) {
        log::error!("[ADAPTER] process_message error: {:#}", e);
    }
}

/// Routes one JSON-RPC line to the reply handler it belongs to.
pub(crate) fn process_message(line: &str, shared: &Shared) -> Result<()> {
    let msg: Value = serde_json::from_str(line)?;
    log::trace!("[ADAPTER] <<< {}", line.trim());

    let Some(id) = msg.get("id").filter(|id| !id.is_null()) else {
        return process_notification(&msg, shared);
    };

    let id = id
        .as_u64()
        .ok_or_else(|| anyhow!("response without numeric id"))?;

    let pending = shared.lock().inflight_requests.remove(&id);
    let Some(Pending { request, replies }) = pending else {
        // server.version and replies from a previous connection
        log::debug!("[ADAPTER] response with unknown id {}", id);
        return Ok(());
    };

    replies(InboundMessage::from_reply(request, msg.get("result"), msg.get("error")));
    Ok(())
}

fn process_notification(msg: &Value, shared: &Shared) -> Result<()> {
    let method = msg
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("message without id or method"))?;

    if method != METHOD_SCRIPTHASH_SUBSCRIBE {
        return process_other_notification(method, msg, shared);
    }

    let params = msg["params"]
        .as_array()
        .ok_or_else(|| anyhow!("invalid subscribe notification params"))?;
    let sh = params
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("invalid scripthash in notification"))?;

    let route = shared
        .lock()
        .subscriptions
        .get(sh)
        .map(|s| (s.address.clone(), s.replies.clone()));
    let Some((address, replies)) = route else {
        log::debug!("[ADAPTER] notification for unknown scripthash {}", sh);
        return Ok(());
    };

    log::debug!("[ADAPTER] status notification for {}", address);
    let status = params.get(1).unwrap_or(&Value::Null);
    replies(InboundMessage::from_reply(Request::Subscribe(address), Some(status), None));
    Ok(())
}

/// Notifications for methods we never subscribe to. They still reach the
/// engine, which logs and drops them.
fn process_other_notification(method: &str, msg: &Value, shared: &Shared) -> Result<()> {
    let replies = shared
        .lock()
        .subscriptions
        .values()
        .next()
        .map(|s| s.replies.clone());
    let Some(replies) = replies else {
        log::debug!("[ADAPTER] ignoring notification {} (no subscriptions)", method);
        return Ok(());
    };

    let params = msg.get("params").cloned().unwrap_or(Value::Null);
    replies(InboundMessage::from_json(method, &params, None, None));
    Ok(())
}
