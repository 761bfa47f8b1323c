//! Promise identity, lifecycle and persistence.
//!
//! A promise is a first-class identity for a future or completed computation
//! result. Incomplete promises are held strongly in memory; once completed,
//! their payload is serialized into a size-capped blob, written to a fjall
//! keyspace, and the in-memory reference is demoted to a weak handle so the
//! object can be dropped and later rematerialized from disk by id.

pub mod blob;
pub mod error;
pub mod id;
pub mod kv;
pub mod payload;
pub mod promise;
pub mod store;

pub use blob::{decode_blob, encode_blob, MAX_BLOB_LEN};
pub use error::{StoreError, StoreResult};
pub use id::PromiseId;
pub use kv::{Store, StoreOptions, WriteTransaction, COL_META, COL_PROMISES};
pub use payload::{Outcome, Payload, SchemaRegistry, SCHEMA_ERROR, SCHEMA_PROMISE_LIST};
pub use promise::Promise;
pub use store::PromiseStore;
