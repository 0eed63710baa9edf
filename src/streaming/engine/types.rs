use std::fmt;

use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::streaming::engine::fingerprint::Fingerprint;

/// Opaque address identifier, owned by the wallet store.
pub type Address = String;

/// Confirmation height as reported by the server.
///
/// `> 0` is a block height, `0` is unconfirmed and `-1` is unconfirmed with
/// unconfirmed parents.
pub type Height = i32;

pub const METHOD_ADDRESS_SUBSCRIBE: &str = "blockchain.address.subscribe";
pub const METHOD_ADDRESS_GET_HISTORY: &str = "blockchain.address.get_history";
pub const METHOD_TRANSACTION_GET: &str = "blockchain.transaction.get";

/// Wire marker of a history that exists but cannot be enumerated.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub txid: Txid,
    pub height: Height,
}

impl HistoryEntry {
    pub fn new(txid: Txid, height: Height) -> Self {
        Self { txid, height }
    }
}

/// Ordered history of one address, as last known locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum History {
    Entries(Vec<HistoryEntry>),
    /// Pruned: the address has history but the server won't list it.
    Unenumerable,
}

impl Default for History {
    fn default() -> Self {
        History::Entries(Vec::new())
    }
}

impl History {
    pub fn from_entries(entries: impl IntoIterator<Item = HistoryEntry>) -> Self {
        History::Entries(entries.into_iter().collect())
    }

    /// Entries of an enumerable history; empty for `Unenumerable`.
    pub fn entries(&self) -> &[HistoryEntry] {
        match self {
            History::Entries(entries) => entries,
            History::Unenumerable => &[],
        }
    }

    pub fn is_unenumerable(&self) -> bool {
        matches!(self, History::Unenumerable)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, History::Entries(entries) if entries.is_empty())
    }
}

/// Outgoing protocol request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Request {
    Subscribe(Address),
    GetHistory(Address),
    GetTransaction { txid: Txid, height: Height },
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Subscribe(_) => METHOD_ADDRESS_SUBSCRIBE,
            Request::GetHistory(_) => METHOD_ADDRESS_GET_HISTORY,
            Request::GetTransaction { .. } => METHOD_TRANSACTION_GET,
        }
    }

    /// Rebuilds a request from its wire method and params.
    ///
    /// Returns `None` for methods the engine does not speak, and for params
    /// that do not fit them (a height outside `i32`, say).
    pub fn from_wire(method: &str, params: &Value) -> Option<Self> {
        let params = params.as_array()?;
        match method {
            METHOD_ADDRESS_SUBSCRIBE => Some(Request::Subscribe(params.first()?.as_str()?.to_string())),
            METHOD_ADDRESS_GET_HISTORY => {
                Some(Request::GetHistory(params.first()?.as_str()?.to_string()))
            }
            METHOD_TRANSACTION_GET => {
                let txid = params.first()?.as_str()?.parse().ok()?;
                let height = match params.get(1) {
                    Some(h) => Height::try_from(h.as_i64()?).ok()?,
                    None => 0,
                };
                Some(Request::GetTransaction { txid, height })
            }
            _ => None,
        }
    }
}

/// Error object returned by the server (or synthesized by a transport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: Option<i64>,
    pub message: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Reads a JSON-RPC error member, which servers send either as an object
    /// or as a bare string.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(message) => Self::new(message.clone()),
            Value::Object(obj) => Self {
                code: obj.get("code").and_then(Value::as_i64),
                message: obj
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string()),
            },
            other => Self::new(other.to_string()),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

/// One message taken off the inbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Subscription reply or status-change notification.
    AddressStatus { address: Address, status: Fingerprint },
    /// Result of a history fetch. May contain duplicates; the dispatcher
    /// decides whether to trust it.
    AddressHistory { address: Address, history: History },
    /// Result of a transaction fetch.
    Transaction { txid: Txid, height: Height, raw: Vec<u8> },
    /// The server answered `request` with an error.
    Failed { request: Request, error: ProtocolError },
    Unrecognized { method: String, params: Value },
}

#[derive(Deserialize)]
struct WireHistoryItem {
    tx_hash: Txid,
    height: Height,
}

impl InboundMessage {
    pub fn method(&self) -> &str {
        match self {
            InboundMessage::AddressStatus { .. } => METHOD_ADDRESS_SUBSCRIBE,
            InboundMessage::AddressHistory { .. } => METHOD_ADDRESS_GET_HISTORY,
            InboundMessage::Transaction { .. } => METHOD_TRANSACTION_GET,
            InboundMessage::Failed { request, .. } => request.method(),
            InboundMessage::Unrecognized { method, .. } => method,
        }
    }

    /// Decodes a raw `(method, params, result, error)` quadruple.
    ///
    /// Status notifications carry no result; their status is the second param.
    pub fn from_json(method: &str, params: &Value, result: Option<&Value>, error: Option<&Value>) -> Self {
        let Some(request) = Request::from_wire(method, params) else {
            return InboundMessage::Unrecognized {
                method: method.to_string(),
                params: params.clone(),
            };
        };

        let result = match (result, &request) {
            (None, Request::Subscribe(_)) if error.is_none() => params.get(1),
            (result, _) => result,
        };

        Self::from_reply(request, result, error)
    }

    /// Decodes the reply to a known request.
    pub fn from_reply(request: Request, result: Option<&Value>, error: Option<&Value>) -> Self {
        if let Some(error) = error.filter(|e| !e.is_null()) {
            return InboundMessage::Failed {
                request,
                error: ProtocolError::from_value(error),
            };
        }

        let null = Value::Null;
        let result = result.unwrap_or(&null);

        let decoded = match &request {
            Request::Subscribe(address) => Fingerprint::from_wire(result).map(|status| {
                InboundMessage::AddressStatus {
                    address: address.clone(),
                    status,
                }
            }),
            Request::GetHistory(address) => decode_history(result).map(|history| {
                InboundMessage::AddressHistory {
                    address: address.clone(),
                    history,
                }
            }),
            Request::GetTransaction { txid, height } => result
                .as_str()
                .ok_or_else(|| ProtocolError::new("transaction result is not a string"))
                .and_then(|hex_str| {
                    hex::decode(hex_str).map_err(|e| ProtocolError::new(format!("bad transaction hex: {e}")))
                })
                .map(|raw| InboundMessage::Transaction {
                    txid: *txid,
                    height: *height,
                    raw,
                }),
        };

        decoded.unwrap_or_else(|error| InboundMessage::Failed { request, error })
    }
}

fn decode_history(result: &Value) -> Result<History, ProtocolError> {
    let items = result
        .as_array()
        .ok_or_else(|| ProtocolError::new("history is not an array"))?;

    if let [Value::String(marker)] = items.as_slice() {
        if marker == WILDCARD {
            return Ok(History::Unenumerable);
        }
    }

    items
        .iter()
        .map(|item| {
            serde_json::from_value::<WireHistoryItem>(item.clone())
                .map(|w| HistoryEntry::new(w.tx_hash, w.height))
                .map_err(|e| ProtocolError::new(format!("bad history item {item}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(History::Entries)
}
