//! On-disk promise blob codec.
//!
//! Wire layout: a 4-byte little-endian total value length followed by the
//! bincode-encoded body carrying schema-tagged input and outcome bytes.
//! Values larger than [`MAX_BLOB_LEN`] are never persisted.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::payload::{Outcome, Payload, SchemaRegistry};

/// Maximum length of a persisted value, length prefix included.
pub const MAX_BLOB_LEN: usize = 1 << 24;

const LEN_PREFIX: usize = 4;

#[derive(Serialize, Deserialize)]
struct BlobBody {
    input: Option<(u32, Vec<u8>)>,
    outcome: BlobOutcome,
}

#[derive(Serialize, Deserialize)]
enum BlobOutcome {
    Value(u32, Vec<u8>),
    Error { kind: String, message: String },
    Canceled,
}

/// Encode a completed promise into its persistent form.
pub fn encode_blob(input: Option<&Payload>, outcome: &Outcome) -> StoreResult<Vec<u8>> {
    let body = BlobBody {
        input: input.map(|p| (p.schema, p.bytes.to_vec())),
        outcome: match outcome {
            Outcome::Value(p) => BlobOutcome::Value(p.schema, p.bytes.to_vec()),
            Outcome::Error { kind, message } => BlobOutcome::Error {
                kind: kind.clone(),
                message: message.clone(),
            },
            Outcome::Canceled => BlobOutcome::Canceled,
        },
    };
    let encoded = bincode::serialize(&body)
        .map_err(|e| StoreError::Persistence(format!("blob encode: {e}")))?;
    let total = LEN_PREFIX + encoded.len();
    if total > MAX_BLOB_LEN {
        return Err(StoreError::OversizePayload { size: total });
    }
    let mut value = Vec::with_capacity(total);
    value.extend_from_slice(&(total as u32).to_le_bytes());
    value.extend_from_slice(&encoded);
    Ok(value)
}

/// Decode a persisted blob. Unknown schema tags and malformed framing are
/// reported as corruption; callers treat both as a miss.
pub fn decode_blob(
    registry: &SchemaRegistry,
    id: &str,
    value: &[u8],
) -> StoreResult<(Option<Payload>, Outcome)> {
    let corrupt = || StoreError::Corrupt { id: id.to_string() };
    if value.len() < LEN_PREFIX || value.len() > MAX_BLOB_LEN {
        return Err(corrupt());
    }
    let mut len = [0u8; LEN_PREFIX];
    len.copy_from_slice(&value[..LEN_PREFIX]);
    let total = u32::from_le_bytes(len) as usize;
    if total != value.len() {
        return Err(corrupt());
    }
    let body: BlobBody = bincode::deserialize(&value[LEN_PREFIX..]).map_err(|_| corrupt())?;

    let input = match body.input {
        Some((schema, bytes)) => {
            if !registry.is_known(schema) {
                return Err(corrupt());
            }
            Some(Payload::new(schema, bytes))
        }
        None => None,
    };
    let outcome = match body.outcome {
        BlobOutcome::Value(schema, bytes) => {
            if !registry.is_known(schema) {
                return Err(corrupt());
            }
            Outcome::Value(Payload::new(schema, bytes))
        }
        BlobOutcome::Error { kind, message } => Outcome::Error { kind, message },
        BlobOutcome::Canceled => Outcome::Canceled,
    };
    Ok((input, outcome))
}
