//! History fingerprints (Electrum "status").
//!
//! The server announces a digest of each address history instead of the
//! history itself. The engine recomputes the same digest locally to decide
//! whether anything needs fetching, and again over a fetched history to check
//! that the server delivered what it announced.

use std::fmt;

use bitcoin::hashes::{sha256, Hash, HashEngine};
use serde_json::Value;

use crate::streaming::engine::types::{History, HistoryEntry, ProtocolError, WILDCARD};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    /// No history at all. Sent as `null`.
    Empty,
    /// History exists but is not enumerable. Sent as `"*"`.
    Unenumerable,
    Digest(sha256::Hash),
}

impl Fingerprint {
    pub fn of(history: &History) -> Self {
        match history {
            History::Unenumerable => Fingerprint::Unenumerable,
            History::Entries(entries) => Self::of_entries(entries),
        }
    }

    /// sha256 over `"<txid>:<height>:"` for every entry, in order.
    pub fn of_entries(entries: &[HistoryEntry]) -> Self {
        if entries.is_empty() {
            return Fingerprint::Empty;
        }

        let mut engine = sha256::Hash::engine();
        for entry in entries {
            engine.input(format!("{}:{}:", entry.txid, entry.height).as_bytes());
        }
        Fingerprint::Digest(sha256::Hash::from_engine(engine))
    }

    pub fn from_wire(value: &Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Null => Ok(Fingerprint::Empty),
            Value::String(s) if s == WILDCARD => Ok(Fingerprint::Unenumerable),
            Value::String(s) => s
                .parse::<sha256::Hash>()
                .map(Fingerprint::Digest)
                .map_err(|e| ProtocolError::new(format!("bad status {s:?}: {e}"))),
            other => Err(ProtocolError::new(format!("bad status {other}"))),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::Empty => f.write_str("<empty>"),
            Fingerprint::Unenumerable => f.write_str(WILDCARD),
            Fingerprint::Digest(hash) => write!(f, "{}", hash),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::sha256d;
    use bitcoin::Txid;

    fn txid(tag: &[u8]) -> Txid {
        Txid::from_raw_hash(sha256d::Hash::hash(tag))
    }

    #[test]
    fn empty_history_has_sentinel() {
        assert_eq!(Fingerprint::of(&History::default()), Fingerprint::Empty);
        assert_eq!(Fingerprint::of(&History::Unenumerable), Fingerprint::Unenumerable);
    }

    #[test]
    fn digest_matches_electrum_status_preimage() {
        let a = txid(b"a");
        let b = txid(b"b");
        let entries = [HistoryEntry::new(a, 100), HistoryEntry::new(b, 0)];

        let preimage = format!("{}:100:{}:0:", a, b);
        let expected = sha256::Hash::hash(preimage.as_bytes());

        assert_eq!(Fingerprint::of_entries(&entries), Fingerprint::Digest(expected));
    }

    #[test]
    fn order_and_height_matter() {
        let a = HistoryEntry::new(txid(b"a"), 1);
        let b = HistoryEntry::new(txid(b"b"), 2);

        assert_ne!(Fingerprint::of_entries(&[a, b]), Fingerprint::of_entries(&[b, a]));
        assert_ne!(
            Fingerprint::of_entries(&[a]),
            Fingerprint::of_entries(&[HistoryEntry::new(a.txid, 0)])
        );
    }

    #[test]
    fn reads_status_from_wire() {
        assert_eq!(Fingerprint::from_wire(&Value::Null).unwrap(), Fingerprint::Empty);
        assert_eq!(Fingerprint::from_wire(&Value::from("*")).unwrap(), Fingerprint::Unenumerable);

        let digest = Fingerprint::of_entries(&[HistoryEntry::new(txid(b"x"), 42)]);
        assert_eq!(Fingerprint::from_wire(&Value::from(digest.to_string())).unwrap(), digest);
    }

    #[test]
    fn rejects_garbage_status() {
        assert!(Fingerprint::from_wire(&Value::from("nope")).is_err());
        assert!(Fingerprint::from_wire(&Value::from(7)).is_err());
    }
}
