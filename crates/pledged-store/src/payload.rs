use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Schema tag of the error-outcome envelope.
pub const SCHEMA_ERROR: u32 = 0;
/// Schema tag of an aggregated promise-id list (macro-job results).
pub const SCHEMA_PROMISE_LIST: u32 = 1;

/// An application-defined payload: a schema tag plus opaque bytes. The core
/// never interprets the bytes; serialization of application values happens
/// outside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub schema: u32,
    pub bytes: Bytes,
}

impl Payload {
    pub fn new(schema: u32, bytes: impl Into<Bytes>) -> Self {
        Self {
            schema,
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Definitive result of a promise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// The computation produced a value.
    Value(Payload),
    /// The worker surfaced an execution error.
    Error { kind: String, message: String },
    /// The work was cancelled before producing a value.
    Canceled,
}

impl Outcome {
    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Outcome::Canceled)
    }
}

/// Registry of schema tags the embedding application understands. Blobs
/// whose tags are not registered decode as misses.
pub struct SchemaRegistry {
    known: RwLock<HashMap<u32, String>>,
}

impl SchemaRegistry {
    /// A registry pre-seeded with the reserved core tags.
    pub fn new() -> Self {
        let mut known = HashMap::new();
        known.insert(SCHEMA_ERROR, "core/error".to_string());
        known.insert(SCHEMA_PROMISE_LIST, "core/promise-list".to_string());
        Self {
            known: RwLock::new(known),
        }
    }

    pub fn register(&self, schema: u32, name: impl Into<String>) {
        self.known.write().insert(schema, name.into());
    }

    pub fn is_known(&self, schema: u32) -> bool {
        self.known.read().contains_key(&schema)
    }

    pub fn name_of(&self, schema: u32) -> Option<String> {
        self.known.read().get(&schema).cloned()
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_tags_are_known() {
        let reg = SchemaRegistry::new();
        assert!(reg.is_known(SCHEMA_ERROR));
        assert!(reg.is_known(SCHEMA_PROMISE_LIST));
        assert!(!reg.is_known(99));
    }

    #[test]
    fn register_makes_tag_known() {
        let reg = SchemaRegistry::new();
        reg.register(7, "app/blob");
        assert!(reg.is_known(7));
        assert_eq!(reg.name_of(7).as_deref(), Some("app/blob"));
    }
}
