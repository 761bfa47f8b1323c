//! Macro-job expansion protocol: deduplication, joint cancellation, and the
//! enumeration state machine.

use std::sync::Arc;

use pledged_jobs::{
    ClientToken, Expansion, JobError, JobsManager, MacroJobMessage, QueueMessage, WorkDescriptor,
};
use pledged_sched::{ClientJobQueue, QueueKey};
use pledged_store::{Outcome, PromiseId, PromiseStore, SchemaRegistry, StoreOptions};

const STATE_ENUMERATING: i32 = 1;
const STATE_DEAD: i32 = -1;

fn open_store() -> Arc<PromiseStore> {
    PromiseStore::open(1, &StoreOptions::default(), SchemaRegistry::new()).unwrap()
}

fn queue(owner: &str) -> Arc<ClientJobQueue<QueueMessage>> {
    ClientJobQueue::new(QueueKey {
        owner: owner.into(),
        priority: 0,
        name: "batch".into(),
    })
}

/// An expansion of `n` micro-jobs, each minting a fresh child promise.
fn expansion_factory(store: &Arc<PromiseStore>, n: usize) -> impl FnMut() -> Expansion {
    let store = store.clone();
    move || {
        let store = store.clone();
        Box::new((0..n).map(move |i| {
            let store = store.clone();
            let retriever: pledged_jobs::PromiseRetriever =
                Box::new(move || Ok(store.create(None, None)));
            (retriever, WorkDescriptor::new(format!("item-{i}")))
        }))
    }
}

struct Setup {
    store: Arc<PromiseStore>,
    manager: Arc<JobsManager>,
    aggregate: Arc<pledged_store::Promise>,
}

fn setup() -> Setup {
    let store = open_store();
    let manager = JobsManager::new();
    let aggregate = store.create(None, None);
    Setup {
        store,
        manager,
        aggregate,
    }
}

fn join(
    s: &Setup,
    items: usize,
    owner: &str,
    client: &ClientToken,
) -> Arc<MacroJobMessage> {
    let mut factory = expansion_factory(&s.store, items);
    s.manager
        .register_macro_message(s.aggregate.clone(), &mut factory, queue(owner), client)
        .unwrap()
        .expect("aggregate promise is incomplete")
}

fn promise_list(outcome: Option<Outcome>) -> Vec<PromiseId> {
    match outcome {
        Some(Outcome::Value(payload)) => bincode::deserialize(&payload.bytes).unwrap(),
        other => panic!("expected a promise list, got {other:?}"),
    }
}

#[tokio::test]
async fn dedup_joins_one_shared_macro_job() {
    let s = setup();
    let a = join(&s, 3, "alice", &ClientToken::new());
    let b = join(&s, 3, "bob", &ClientToken::new());

    assert!(Arc::ptr_eq(a.source(), b.source()));
    assert_eq!(a.source().participant_count(), 2);
    assert_eq!(s.manager.client_request_count(), 2);
}

#[tokio::test]
async fn one_client_cancels_sibling_drives_to_completion() {
    // S1: A cancels after one yielded micro-job; B continues. The shared
    // result sees no cancellation and all three children are produced.
    let s = setup();
    let a = join(&s, 3, "alice", &ClientToken::new());
    let b = join(&s, 3, "bob", &ClientToken::new());
    let dispatcher = ClientToken::new();

    let mut a_yields = Vec::new();
    {
        let a2 = a.clone();
        let yielded = a
            .drive(&dispatcher, |m| {
                a_yields.push(m);
                a2.cancel(false);
                Ok(())
            })
            .unwrap();
        assert_eq!(yielded, 1);
    }
    assert!(!s.aggregate.is_complete(), "A's withdrawal must not complete the result");
    assert_eq!(a.source().participant_count(), 1);

    let mut b_yields = Vec::new();
    let yielded = b
        .drive(&dispatcher, |m| {
            b_yields.push(m);
            Ok(())
        })
        .unwrap();
    assert_eq!(yielded, 2, "B resumes where A stopped");

    let ids = promise_list(s.aggregate.outcome());
    assert_eq!(ids.len(), 3);
    for message in a_yields.iter().chain(&b_yields) {
        match message {
            QueueMessage::Micro(job) => assert!(ids.contains(&job.promise().id())),
            QueueMessage::Macro(_) => panic!("expansion must yield micro-jobs"),
        }
    }
}

#[tokio::test]
async fn all_clients_cancel_completes_with_cancellation() {
    // S2: both participants cancel before anything is yielded.
    let s = setup();
    let a = join(&s, 3, "alice", &ClientToken::new());
    let b = join(&s, 3, "bob", &ClientToken::new());

    a.cancel(false);
    assert!(!s.aggregate.is_complete());
    b.cancel(false);

    assert_eq!(s.aggregate.outcome(), Some(Outcome::Canceled));
    assert_eq!(a.source().participant_count(), -1);
    assert!(
        s.manager.macro_job(s.aggregate.id()).is_none(),
        "dead macro job must be unregistered"
    );
    assert_eq!(s.manager.client_request_count(), 0);
    assert_eq!(a.source().result().member_count(), 0);
}

#[tokio::test]
async fn resurrection_is_refused() {
    // S3: the sole participant cancels; a late joiner holding the same
    // MacroJob reference must be refused and build a fresh one.
    let s = setup();
    let client_a = ClientToken::new();
    let a = join(&s, 3, "alice", &client_a);
    let dead_job = a.source().clone();
    a.cancel(false);
    assert_eq!(dead_job.participant_count(), -1);

    let c = MacroJobMessage::new(
        dead_job.clone(),
        queue("carol"),
        ClientToken::new(),
        Arc::downgrade(&s.manager),
    );
    assert!(!dead_job.add_participant(&c));

    // Going through the manager builds a replacement job.
    let fresh = join(&s, 3, "carol", &ClientToken::new());
    assert!(!Arc::ptr_eq(fresh.source(), &dead_job));
    assert_eq!(fresh.source().participant_count(), 1);
}

#[tokio::test]
async fn second_enumeration_is_unsupported() {
    let s = setup();
    // Children never complete, so the first run stays enumerating (the
    // finish task is still waiting) when the second call arrives.
    let a = join(&s, 2, "alice", &ClientToken::new());
    let dispatcher = ClientToken::new();

    a.drive(&dispatcher, |_| Ok(())).unwrap();
    assert_eq!(a.state(), STATE_ENUMERATING);
    assert!(matches!(
        a.drive(&dispatcher, |_| Ok(())),
        Err(JobError::AlreadyEnumerated)
    ));
}

#[tokio::test]
async fn sibling_completion_short_circuits_enumeration() {
    let s = setup();
    let a = join(&s, 2, "alice", &ClientToken::new());
    let b = join(&s, 2, "bob", &ClientToken::new());
    let dispatcher = ClientToken::new();

    assert_eq!(a.drive(&dispatcher, |_| Ok(())).unwrap(), 2);
    assert!(s.aggregate.is_complete());

    // B's enumeration terminates promptly with nothing to do.
    let yielded = b.drive(&dispatcher, |_| Ok(())).unwrap();
    assert_eq!(yielded, 0);
    assert_eq!(b.state(), STATE_DEAD);
}

#[tokio::test]
async fn empty_expansion_completes_immediately() {
    let s = setup();
    let a = join(&s, 0, "alice", &ClientToken::new());
    let dispatcher = ClientToken::new();

    assert_eq!(a.drive(&dispatcher, |_| Ok(())).unwrap(), 0);
    assert!(promise_list(s.aggregate.outcome()).is_empty());
}

#[tokio::test]
async fn dispatcher_cancellation_cleans_up_the_sole_participant() {
    // The dispatcher's own token firing mid-expansion (a server shutdown)
    // must tear the participant down like any other exit: nothing stays
    // registered and the aggregate completes instead of hanging.
    let s = setup();
    let client = ClientToken::new();
    let a = join(&s, 3, "alice", &client);
    let dispatcher = ClientToken::new();

    let result = a.drive(&dispatcher, |_| {
        dispatcher.cancel();
        Ok(())
    });
    match result {
        Err(JobError::Canceled { token }) => assert_eq!(token, dispatcher.id()),
        other => panic!("expected the caller's own cancellation, got {other:?}"),
    }

    assert_eq!(a.state(), STATE_DEAD);
    assert_eq!(a.source().participant_count(), -1);
    assert!(
        s.manager.macro_job(s.aggregate.id()).is_none(),
        "dead macro job must be unregistered"
    );
    assert_eq!(
        s.manager.client_request_count(),
        0,
        "client tracking must not outlive the participant"
    );
    assert_eq!(s.aggregate.outcome(), Some(Outcome::Canceled));
}

#[tokio::test]
async fn dispatcher_cancellation_spares_live_siblings() {
    // Caller cancellation withdraws only this participant; a sibling still
    // drives the shared expansion to completion.
    let s = setup();
    let a = join(&s, 3, "alice", &ClientToken::new());
    let b = join(&s, 3, "bob", &ClientToken::new());
    let dispatcher_a = ClientToken::new();

    let result = a.drive(&dispatcher_a, |_| {
        dispatcher_a.cancel();
        Ok(())
    });
    assert!(matches!(result, Err(JobError::Canceled { .. })));
    assert!(
        !s.aggregate.is_complete(),
        "a surviving participant keeps the result open"
    );
    assert_eq!(a.source().participant_count(), 1);

    let dispatcher_b = ClientToken::new();
    let yielded = b.drive(&dispatcher_b, |_| Ok(())).unwrap();
    assert_eq!(yielded, 2, "B resumes where A stopped");
    assert_eq!(promise_list(s.aggregate.outcome()).len(), 3);
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let s = setup();
    let a = join(&s, 1, "alice", &ClientToken::new());
    a.cancel(false);
    a.cancel(false);
    assert_eq!(a.source().participant_count(), -1);
    assert_eq!(s.aggregate.outcome(), Some(Outcome::Canceled));
}

#[tokio::test]
async fn kill_cancels_every_participant() {
    let s = setup();
    let a = join(&s, 3, "alice", &ClientToken::new());
    let _b = join(&s, 3, "bob", &ClientToken::new());

    a.source().kill(false);
    assert_eq!(a.source().participant_count(), -1);
    assert_eq!(s.aggregate.outcome(), Some(Outcome::Canceled));
}

#[tokio::test]
async fn client_cancellation_routes_through_the_manager() {
    let s = setup();
    let client = ClientToken::new();
    let a = join(&s, 3, "alice", &client);

    assert!(s.manager.cancel_job(s.aggregate.id(), &client, false));
    assert!(a.is_cancelled());
    assert_eq!(s.aggregate.outcome(), Some(Outcome::Canceled));

    // The registration is gone now.
    assert!(!s.manager.cancel_job(s.aggregate.id(), &client, false));
}

#[tokio::test]
async fn same_client_does_not_double_track() {
    let s = setup();
    let client = ClientToken::new();
    let _a = join(&s, 3, "alice", &client);
    let _again = join(&s, 3, "alice", &client);
    assert_eq!(s.manager.client_request_count(), 1);
}

#[tokio::test]
async fn completed_aggregate_emits_no_message() {
    let s = setup();
    let done = s.store.create(None, Some(Outcome::Canceled));
    let mut factory = expansion_factory(&s.store, 3);
    let message = s
        .manager
        .register_macro_message(done, &mut factory, queue("alice"), &ClientToken::new())
        .unwrap();
    assert!(message.is_none());
}

#[tokio::test]
async fn finish_retires_the_driver_after_children_complete() {
    let s = setup();
    let a = join(&s, 2, "alice", &ClientToken::new());
    let dispatcher = ClientToken::new();

    let mut children = Vec::new();
    a.drive(&dispatcher, |m| {
        if let QueueMessage::Micro(job) = &m {
            children.push(job.promise());
        }
        Ok(())
    })
    .unwrap();
    assert!(s.aggregate.is_complete());
    assert_eq!(a.source().participant_count(), 1, "finish still pending");

    for child in &children {
        child.complete(Outcome::Canceled);
    }
    // Let the finish task observe the completions and clean up.
    for _ in 0..50 {
        if a.source().participant_count() == -1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(a.source().participant_count(), -1);
    assert_eq!(a.state(), STATE_DEAD);
    assert!(s.manager.macro_job(s.aggregate.id()).is_none());
}
