//! Wire protocol: envelopes, entries and the codec seam.
//!
//! ```text
//! outgoing  {"seq": 12, "batch": [Entry, ...]}
//! snapshot  {"k": "page.count", "v": 3}
//! delta     {"k": "page.todos", "delta": true, "type": "list", "changes": [...]}
//! incoming  {"k": "form.name", "v": "Ada"}
//! ```
//!
//! Values travel as [`serde_json::Value`]; a [`Codec`] only turns whole
//! envelopes into text and incoming text into [`Incoming`] messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collections::CollectionKind;

/// Boxed error used as the source of codec failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Encoding and decoding failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A bound value (or change record) could not be serialized.
    #[error("value is not serializable: {0}")]
    Value(#[from] serde_json::Error),

    /// An envelope could not be encoded.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] BoxError),

    /// Incoming text is not a valid `{k, v}` message.
    #[error("malformed incoming message: {0}")]
    Decode(#[source] BoxError),
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Full value of one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Binding key.
    pub k: String,
    /// Current value.
    pub v: Value,
}

/// Incremental change list for one collection-valued key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaEntry {
    /// Binding key.
    pub k: String,
    /// Always `true`; lets clients tell deltas from snapshots.
    pub delta: bool,
    /// Collection kind the changes apply to.
    #[serde(rename = "type")]
    pub kind: CollectionKind,
    /// Change records in log order.
    pub changes: Vec<Value>,
}

/// One item of an envelope's batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Entry {
    /// Incremental update.
    Delta(DeltaEntry),
    /// Full value.
    Snapshot(SnapshotEntry),
}

impl Entry {
    /// Builds a snapshot entry.
    #[must_use]
    pub fn snapshot(key: impl Into<String>, value: Value) -> Self {
        Self::Snapshot(SnapshotEntry {
            k: key.into(),
            v: value,
        })
    }

    /// Builds a delta entry from a packet.
    #[must_use]
    pub fn delta(key: impl Into<String>, packet: DeltaPacket) -> Self {
        Self::Delta(DeltaEntry {
            k: key.into(),
            delta: true,
            kind: packet.kind,
            changes: packet.changes,
        })
    }

    /// Binding key the entry refers to.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Delta(d) => &d.k,
            Self::Snapshot(s) => &s.k,
        }
    }

    /// Returns `true` for delta entries.
    #[must_use]
    pub fn is_delta(&self) -> bool {
        matches!(self, Self::Delta(_))
    }
}

/// Outgoing message: a sequence number and a batch of entries.
///
/// Sequences are `u64`; the push core numbers its own envelopes and a replay
/// hub numbers every state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sequence number of the newest change in the batch.
    pub seq: u64,
    /// Entries, at most one per key.
    pub batch: Vec<Entry>,
}

impl Envelope {
    /// Creates an envelope.
    #[must_use]
    pub fn new(seq: u64, batch: Vec<Entry>) -> Self {
        Self { seq, batch }
    }

    /// Envelope with no entries.
    #[must_use]
    pub fn empty(seq: u64) -> Self {
        Self::new(seq, Vec::new())
    }

    /// Returns `true` if the batch has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Client write request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incoming {
    /// Registered key or dotted deep path.
    pub k: String,
    /// New value; a missing `v` decodes as `null`.
    #[serde(default)]
    pub v: Value,
}

/// Change records of one collection, already converted to JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaPacket {
    /// Collection kind.
    pub kind: CollectionKind,
    /// Records in log order.
    pub changes: Vec<Value>,
}

impl DeltaPacket {
    /// Converts typed records into a packet.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Value`] if a record cannot be serialized.
    pub fn from_records<R: Serialize>(
        kind: CollectionKind,
        records: &[R],
    ) -> Result<Self, CodecError> {
        let changes = records
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { kind, changes })
    }

    /// Appends `other`'s records. Callers check that the kinds match.
    pub fn concat(&mut self, other: DeltaPacket) {
        self.changes.extend(other.changes);
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns `true` if the packet carries no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Text encoding of envelopes and incoming messages.
pub trait Codec: Send + Sync + 'static {
    /// Encodes an outgoing envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the envelope cannot be represented.
    fn encode(&self, envelope: &Envelope) -> Result<String, CodecError>;

    /// Decodes an incoming `{k, v}` message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] for malformed input.
    fn decode(&self, text: &str) -> Result<Incoming, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<String, CodecError> {
        serde_json::to_string(envelope).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode(&self, text: &str) -> Result<Incoming, CodecError> {
        serde_json::from_str(text).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}
