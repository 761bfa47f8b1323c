use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pledged_common::StoreStats;
use tracing::{debug, error, warn};

use crate::blob::{decode_blob, encode_blob};
use crate::error::{StoreError, StoreResult};
use crate::id::PromiseId;
use crate::kv::{Store, StoreOptions, WriteTransaction, COL_META, COL_PROMISES};
use crate::payload::{Outcome, Payload, SchemaRegistry};
use crate::promise::Promise;

const META_SEQUENCE: &[u8] = b"promise_seq_high_water";

/// Housekeeping sweeps run once per this many create/get operations.
const SWEEP_INTERVAL: u64 = 256;

enum LiveRef {
    /// Incomplete promises are always strongly retained.
    Strong(Arc<Promise>),
    /// Completed-and-persisted promises may be dropped and rehydrated.
    Weak(Weak<Promise>),
}

/// Identity map and persistence engine for promises.
///
/// The live map allows lock-free reads and concurrent inserts; the
/// completion handler runs on whatever thread completes a promise and only
/// touches that promise's own map slot.
pub struct PromiseStore {
    service_id: u32,
    sequence: AtomicU64,
    live: DashMap<PromiseId, LiveRef>,
    kv: Store,
    registry: SchemaRegistry,
    op_ticks: AtomicU64,
    persisted: AtomicU64,
    swept: AtomicU64,
}

impl PromiseStore {
    pub fn open(
        service_id: u32,
        options: &StoreOptions,
        registry: SchemaRegistry,
    ) -> StoreResult<Arc<Self>> {
        let kv = Store::open(options)?;
        let sequence = match kv.get(COL_META, META_SEQUENCE)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes);
                u64::from_le_bytes(raw)
            }
            Some(_) => {
                return Err(StoreError::Persistence(
                    "malformed sequence high-water record".into(),
                ))
            }
            None => 1,
        };
        Ok(Arc::new(Self {
            service_id,
            sequence: AtomicU64::new(sequence),
            live: DashMap::new(),
            kv,
            registry,
            op_ticks: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            swept: AtomicU64::new(0),
        }))
    }

    pub fn service_id(&self) -> u32 {
        self.service_id
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Mint a fresh promise. Incomplete promises are strongly retained and
    /// wired to persist on completion; promises created already complete are
    /// persisted immediately when they fit the blob cap.
    pub fn create(
        self: &Arc<Self>,
        input: Option<Payload>,
        outcome: Option<Outcome>,
    ) -> Arc<Promise> {
        let id = PromiseId::new(self.service_id, self.sequence.fetch_add(1, Ordering::Relaxed));
        let promise = Promise::new(id, input, outcome);

        if promise.is_complete() {
            let persisted = self.persist_promise(&promise);
            let live_ref = if persisted {
                LiveRef::Weak(Arc::downgrade(&promise))
            } else {
                LiveRef::Strong(promise.clone())
            };
            self.live.insert(id, live_ref);
        } else {
            self.live.insert(id, LiveRef::Strong(promise.clone()));
            let store = Arc::downgrade(self);
            let registered = promise.subscribe(move |p| {
                if let Some(store) = store.upgrade() {
                    store.on_promise_complete(p);
                }
            });
            if !registered {
                // Completed between insert and subscribe; run the handler
                // ourselves so the promise still gets persisted.
                self.on_promise_complete(&promise);
            }
        }
        self.housekeeping_tick();
        promise
    }

    /// Look up a promise by id, rehydrating from disk if its live handle has
    /// been dropped. Read failures and corrupt blobs are reported as misses.
    pub fn get_by_id(self: &Arc<Self>, id: PromiseId) -> Option<Arc<Promise>> {
        self.housekeeping_tick();
        if let Some(live) = self.live.get(&id) {
            match &*live {
                LiveRef::Strong(p) => return Some(p.clone()),
                LiveRef::Weak(w) => {
                    if let Some(p) = w.upgrade() {
                        return Some(p);
                    }
                }
            }
        }

        let value = match self.kv.get(COL_PROMISES, &id.to_key()) {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                error!("promise {} read failed: {}", id, e);
                return None;
            }
        };
        match decode_blob(&self.registry, &id.to_string(), &value) {
            Ok((input, outcome)) => {
                let promise = Promise::new(id, input, Some(outcome));
                Some(self.install_rehydrated(promise))
            }
            Err(e) => {
                warn!("promise {} blob unusable: {}", id, e);
                None
            }
        }
    }

    /// Reserved operation: implementations may defer payload shedding to a
    /// schedule. This store sheds eagerly on completion, so it only records
    /// the request.
    pub fn schedule_promise_expiry(&self, promise: &Promise, after_ms: u64) {
        debug!(
            "expiry requested for promise {} in {}ms; store sheds on completion",
            promise.id(),
            after_ms
        );
    }

    pub fn stats(&self) -> StoreStats {
        let mut live_strong = 0;
        let mut live_weak = 0;
        for entry in self.live.iter() {
            match &*entry {
                LiveRef::Strong(_) => live_strong += 1,
                LiveRef::Weak(_) => live_weak += 1,
            }
        }
        StoreStats {
            live_strong,
            live_weak,
            persisted: self.persisted.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }

    /// Completion handler: serialize, write, and demote the live reference
    /// to weak. Oversize payloads and write failures leave the promise
    /// memory-resident so a completed promise is never neither live nor
    /// persisted.
    fn on_promise_complete(&self, promise: &Promise) {
        if !self.persist_promise(promise) {
            return;
        }
        if let Some(mut slot) = self.live.get_mut(&promise.id()) {
            if let LiveRef::Strong(arc) = &*slot {
                *slot = LiveRef::Weak(Arc::downgrade(arc));
            }
        }
    }

    fn persist_promise(&self, promise: &Promise) -> bool {
        let outcome = match promise.outcome() {
            Some(outcome) => outcome,
            None => return false,
        };
        let value = match encode_blob(promise.input().as_ref(), &outcome) {
            Ok(value) => value,
            Err(StoreError::OversizePayload { size }) => {
                warn!(
                    "promise {} stays memory-only: {} bytes over the blob cap",
                    promise.id(),
                    size
                );
                return false;
            }
            Err(e) => {
                error!("promise {} encode failed: {}", promise.id(), e);
                return false;
            }
        };

        let mut tx = WriteTransaction::new();
        tx.set(COL_PROMISES, promise.id().to_key().to_vec(), value);
        tx.set(
            COL_META,
            META_SEQUENCE.to_vec(),
            self.sequence.load(Ordering::Relaxed).to_le_bytes().to_vec(),
        );
        match tx.commit(&self.kv) {
            Ok(()) => {
                self.persisted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                error!("promise {} write failed: {}", promise.id(), e);
                false
            }
        }
    }

    /// Install a rehydrated promise, deduplicating against concurrent
    /// rehydrations so one canonical object exists per id.
    fn install_rehydrated(&self, promise: Arc<Promise>) -> Arc<Promise> {
        match self.live.entry(promise.id()) {
            Entry::Occupied(mut slot) => match &*slot.get() {
                LiveRef::Strong(existing) => existing.clone(),
                LiveRef::Weak(w) => match w.upgrade() {
                    Some(existing) => existing,
                    None => {
                        slot.insert(LiveRef::Weak(Arc::downgrade(&promise)));
                        promise
                    }
                },
            },
            Entry::Vacant(slot) => {
                slot.insert(LiveRef::Weak(Arc::downgrade(&promise)));
                promise
            }
        }
    }

    /// Opportunistic, rate-limited prune of dead weak handles.
    fn housekeeping_tick(&self) {
        if self.op_ticks.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL != 0 {
            return;
        }
        let mut pruned = 0u64;
        self.live.retain(|_, live| match live {
            LiveRef::Strong(_) => true,
            LiveRef::Weak(w) => {
                let alive = w.strong_count() > 0;
                if !alive {
                    pruned += 1;
                }
                alive
            }
        });
        if pruned > 0 {
            self.swept.fetch_add(pruned, Ordering::Relaxed);
            debug!("pruned {} dead promise handles", pruned);
        }
    }
}

impl std::fmt::Debug for PromiseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromiseStore")
            .field("service_id", &self.service_id)
            .field("live", &self.live.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MAX_BLOB_LEN;

    const SCHEMA_BYTES: u32 = 7;

    fn open_store() -> Arc<PromiseStore> {
        let registry = SchemaRegistry::new();
        registry.register(SCHEMA_BYTES, "test/bytes");
        PromiseStore::open(1, &StoreOptions::default(), registry).unwrap()
    }

    fn value(bytes: Vec<u8>) -> Outcome {
        Outcome::Value(Payload::new(SCHEMA_BYTES, bytes))
    }

    #[test]
    fn create_mints_unique_ordered_ids() {
        let store = open_store();
        let a = store.create(None, None);
        let b = store.create(None, None);
        assert_eq!(a.id().service_id, 1);
        assert!(a.id() < b.id());
    }

    #[test]
    fn completion_demotes_to_weak_and_rehydrates() {
        let store = open_store();
        let payload = vec![0x5A; 1024];
        let p = store.create(None, None);
        let id = p.id();
        assert_eq!(store.stats().live_strong, 1);

        assert!(p.complete(value(payload.clone())));
        let stats = store.stats();
        assert_eq!(stats.live_strong, 0);
        assert_eq!(stats.live_weak, 1);
        assert_eq!(stats.persisted, 1);

        // Drop every strong reference, then refetch from disk.
        drop(p);
        let back = store.get_by_id(id).expect("rehydrated");
        match back.outcome() {
            Some(Outcome::Value(got)) => assert_eq!(got.bytes.as_ref(), payload.as_slice()),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn incomplete_promises_stay_strong() {
        let store = open_store();
        let p = store.create(Some(Payload::new(SCHEMA_BYTES, vec![1])), None);
        let id = p.id();
        drop(p);
        // Still reachable: the store holds the only strong reference.
        let back = store.get_by_id(id).expect("live");
        assert!(!back.is_complete());
    }

    #[test]
    fn oversize_payload_stays_memory_only() {
        let store = open_store();
        let p = store.create(None, None);
        let id = p.id();
        assert!(p.complete(value(vec![0u8; MAX_BLOB_LEN + 1])));

        let stats = store.stats();
        assert_eq!(stats.persisted, 0);
        assert_eq!(stats.live_strong, 1, "oversize promise must stay retained");

        drop(p);
        // Still resolvable through the strong handle.
        assert!(store.get_by_id(id).is_some());
    }

    #[test]
    fn unknown_id_is_a_miss() {
        let store = open_store();
        assert!(store.get_by_id(PromiseId::new(1, 999)).is_none());
    }

    #[test]
    fn live_lookup_returns_canonical_object() {
        let store = open_store();
        let p = store.create(None, None);
        let again = store.get_by_id(p.id()).expect("live");
        assert!(Arc::ptr_eq(&p, &again));
    }

    #[test]
    fn sequence_high_water_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let options = StoreOptions {
            path: tmp.path().join("store").display().to_string(),
            ..Default::default()
        };
        let first_id = {
            let registry = SchemaRegistry::new();
            registry.register(SCHEMA_BYTES, "test/bytes");
            let store = PromiseStore::open(1, &options, registry).unwrap();
            let p = store.create(None, None);
            p.complete(value(vec![1, 2, 3]));
            p.id()
        };
        let registry = SchemaRegistry::new();
        registry.register(SCHEMA_BYTES, "test/bytes");
        let store = PromiseStore::open(1, &options, registry).unwrap();
        let fresh = store.create(None, None);
        assert!(fresh.id() > first_id, "restart must not re-mint persisted ids");
        // And the old promise is still fetchable.
        assert!(store.get_by_id(first_id).is_some());
    }

    #[test]
    fn housekeeping_prunes_dead_handles() {
        let store = open_store();
        let p = store.create(None, None);
        p.complete(value(vec![9; 16]));
        drop(p);
        // Drive enough operations to cross a sweep boundary.
        for _ in 0..(SWEEP_INTERVAL + 1) {
            let _ = store.get_by_id(PromiseId::new(1, u64::MAX));
        }
        assert!(store.stats().swept >= 1);
    }

    #[test]
    fn schedule_expiry_is_inert() {
        let store = open_store();
        let p = store.create(None, None);
        store.schedule_promise_expiry(&p, 1000);
        assert!(!p.is_complete());
        assert!(store.get_by_id(p.id()).is_some());
    }
}
