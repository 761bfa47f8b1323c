use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Identity of a promise: `(service_id, sequence)`, unique within a server
/// instance and totally ordered. Serializes as `"<service_id>/<sequence>"`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PromiseId {
    pub service_id: u32,
    pub sequence: u64,
}

impl PromiseId {
    /// Fixed length of the little-endian KV key encoding.
    pub const KEY_LEN: usize = 12;

    pub fn new(service_id: u32, sequence: u64) -> Self {
        Self {
            service_id,
            sequence,
        }
    }

    /// 12-byte little-endian `(service_id: u32, sequence: u64)` key.
    pub fn to_key(&self) -> [u8; Self::KEY_LEN] {
        let mut key = [0u8; Self::KEY_LEN];
        key[..4].copy_from_slice(&self.service_id.to_le_bytes());
        key[4..].copy_from_slice(&self.sequence.to_le_bytes());
        key
    }

    pub fn from_key(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() != Self::KEY_LEN {
            return Err(StoreError::InvalidPromiseId(format!(
                "key must be {} bytes, got {}",
                Self::KEY_LEN,
                bytes.len()
            )));
        }
        let mut service = [0u8; 4];
        let mut sequence = [0u8; 8];
        service.copy_from_slice(&bytes[..4]);
        sequence.copy_from_slice(&bytes[4..]);
        Ok(Self {
            service_id: u32::from_le_bytes(service),
            sequence: u64::from_le_bytes(sequence),
        })
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_id, self.sequence)
    }
}

impl FromStr for PromiseId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::InvalidPromiseId(s.to_string());
        let (service, sequence) = s.split_once('/').ok_or_else(invalid)?;
        Ok(Self {
            service_id: service.parse().map_err(|_| invalid())?,
            sequence: sequence.parse().map_err(|_| invalid())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_roundtrip() {
        for id in [
            PromiseId::new(0, 0),
            PromiseId::new(1, 42),
            PromiseId::new(u32::MAX, u64::MAX),
        ] {
            let parsed: PromiseId = id.to_string().parse().unwrap();
            assert_eq!(parsed, id);
        }
    }

    #[test]
    fn key_roundtrip() {
        let id = PromiseId::new(7, 0x0102_0304_0506_0708);
        let key = id.to_key();
        assert_eq!(key.len(), PromiseId::KEY_LEN);
        assert_eq!(PromiseId::from_key(&key).unwrap(), id);
    }

    #[test]
    fn rejects_malformed_text() {
        assert!("".parse::<PromiseId>().is_err());
        assert!("12".parse::<PromiseId>().is_err());
        assert!("a/b".parse::<PromiseId>().is_err());
        assert!("1/2/3".parse::<PromiseId>().is_err());
    }

    #[test]
    fn ordered_by_service_then_sequence() {
        assert!(PromiseId::new(1, 99) < PromiseId::new(2, 0));
        assert!(PromiseId::new(1, 1) < PromiseId::new(1, 2));
    }
}
