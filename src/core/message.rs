use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::envelope::TxnId;

/// Scalar metadata value attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a JSON scalar, rejecting arrays, objects and null.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(MetaValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(MetaValue::Int)
                .or_else(|| n.as_f64().map(MetaValue::Float)),
            serde_json::Value::String(s) => Some(MetaValue::String(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Bool(b) => write!(f, "{b}"),
            MetaValue::Int(i) => write!(f, "{i}"),
            MetaValue::Float(v) => write!(f, "{v}"),
            MetaValue::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::String(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::String(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

/// Basic data unit passed between stages.
///
/// The payload is immutable once created; stages build new messages with
/// [`Message::derive`] so that provenance follows the data. Metadata may be
/// added or overwritten in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    payload: Bytes,
    metadata: BTreeMap<String, MetaValue>,
    /// Transactions this message owes acknowledgment to, sorted and deduplicated
    provenance: Vec<TxnId>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            metadata: BTreeMap::new(),
            provenance: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn metadata(&self) -> &BTreeMap<String, MetaValue> {
        &self.metadata
    }

    pub fn meta(&self, key: &str) -> Option<&MetaValue> {
        self.metadata.get(key)
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn remove_meta(&mut self, key: &str) -> Option<MetaValue> {
        self.metadata.remove(key)
    }

    pub fn provenance(&self) -> &[TxnId] {
        &self.provenance
    }

    /// New message with a different payload, keeping metadata and provenance.
    pub fn derive(&self, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            metadata: self.metadata.clone(),
            provenance: self.provenance.clone(),
        }
    }

    /// Collapse several messages into one. Metadata of the first message wins,
    /// provenance is the union of all inputs.
    pub fn merge<'a>(parts: impl IntoIterator<Item = &'a Message>, payload: impl Into<Bytes>) -> Self {
        let mut metadata = None;
        let mut provenance = Vec::new();
        for part in parts {
            if metadata.is_none() {
                metadata = Some(part.metadata.clone());
            }
            provenance.extend_from_slice(&part.provenance);
        }
        provenance.sort_unstable();
        provenance.dedup();

        Self {
            payload: payload.into(),
            metadata: metadata.unwrap_or_default(),
            provenance,
        }
    }

    pub(crate) fn stamp(&mut self, txn: TxnId) {
        if let Err(pos) = self.provenance.binary_search(&txn) {
            self.provenance.insert(pos, txn);
        }
    }

    pub(crate) fn restamp(&mut self, txn: TxnId) {
        self.provenance.clear();
        self.provenance.push(txn);
    }
}

/// Ordered group of messages acknowledged as a unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    messages: Vec<Message>,
}

impl Batch {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn single(message: Message) -> Self {
        Self {
            messages: vec![message],
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Message> {
        self.messages.iter_mut()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn append(&mut self, other: Batch) {
        self.messages.extend(other.messages);
    }

    /// Record `txn` as the origin of every message in the batch
    pub(crate) fn stamp(&mut self, txn: TxnId) {
        for message in &mut self.messages {
            message.stamp(txn);
        }
    }

    /// Replace every message's provenance with `txn` alone
    pub(crate) fn restamp(&mut self, txn: TxnId) {
        for message in &mut self.messages {
            message.restamp(txn);
        }
    }
}

impl FromIterator<Message> for Batch {
    fn from_iter<T: IntoIterator<Item = Message>>(iter: T) -> Self {
        Self {
            messages: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Batch {
    type Item = Message;
    type IntoIter = std::vec::IntoIter<Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}
