// crates/conduit-rpc/tests/dispatch.rs
//
// Integration tests for the dispatcher and the streaming session manager,
// driven through the public API with in-process peers.
//
// Covers the call-level guarantees: one terminal envelope per call, event
// order within a session, isolation between concurrent sessions, validation
// before invocation, cancellation, and idempotent peer tear-down.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use conduit_core::{
    CallEnvelope, Contract, ContractRegistry, ErrorKind, Peer, ProcedurePath, ResponseEnvelope,
    RpcError, Schema, SchemaValidator,
};
use conduit_rpc::api::{self, create_user_schema, user_schema};
use conduit_rpc::{Dispatched, Dispatcher, HandlerTable, PeerHandle};
use conduit_store::MemoryUserStore;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Peer that forwards every envelope into a channel.
struct ChannelPeer {
    tx: mpsc::UnboundedSender<ResponseEnvelope>,
}

#[async_trait]
impl Peer for ChannelPeer {
    async fn send(&self, envelope: ResponseEnvelope) -> Result<(), RpcError> {
        self.tx
            .send(envelope)
            .map_err(|_| RpcError::Transport("receiver dropped".into()))
    }

    fn close(&self) {}
}

fn attach(dispatcher: &Dispatcher) -> (PeerHandle, mpsc::UnboundedReceiver<ResponseEnvelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = dispatcher.sessions().attach(Arc::new(ChannelPeer { tx }));
    (handle, rx)
}

fn one_shot() -> (PeerHandle, mpsc::UnboundedReceiver<ResponseEnvelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PeerHandle::one_shot(Arc::new(ChannelPeer { tx })), rx)
}

fn call(path: &str, input: Value, call_id: &str) -> CallEnvelope {
    CallEnvelope::new(ProcedurePath::parse(path), input, call_id)
}

fn app_dispatcher() -> Dispatcher {
    api::build_dispatcher(Arc::new(MemoryUserStore::new()), Duration::from_millis(2)).unwrap()
}

/// Dispatcher with a few synthetic streaming procedures and a counting
/// create procedure.
fn test_dispatcher(create_calls: Arc<AtomicUsize>) -> Dispatcher {
    let mut contracts = ContractRegistry::new();
    contracts
        .register(Contract::unary("users.create", create_user_schema(), Schema::Any))
        .unwrap();
    contracts
        .register(Contract::streaming("seq.numbers", Schema::Any, Schema::Integer))
        .unwrap();
    contracts
        .register(Contract::streaming("seq.letters", Schema::Any, Schema::string()))
        .unwrap();
    contracts
        .register(Contract::streaming("seq.forever", Schema::Any, Schema::Integer))
        .unwrap();
    contracts
        .register(Contract::streaming("seq.explode", Schema::Any, Schema::Integer))
        .unwrap();
    contracts
        .register(Contract::streaming("seq.wrong", Schema::Any, Schema::Integer))
        .unwrap();

    let mut handlers = HandlerTable::new();
    handlers
        .unary("users.create", move |input: Value, _| {
            let calls = create_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RpcError>(input)
            }
        })
        .unwrap();
    handlers
        .streaming("seq.numbers", |_: Value, _| {
            futures::stream::iter([1, 2, 3]).then(|n| async move {
                tokio::task::yield_now().await;
                Ok::<_, RpcError>(n)
            })
        })
        .unwrap();
    handlers
        .streaming("seq.letters", |_: Value, _| {
            futures::stream::iter(["x", "y"]).then(|s| async move {
                tokio::task::yield_now().await;
                Ok::<_, RpcError>(s)
            })
        })
        .unwrap();
    handlers
        .streaming("seq.forever", |_: Value, _| {
            futures::stream::unfold(0u64, |n| async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                Some((Ok::<_, RpcError>(n), n + 1))
            })
        })
        .unwrap();
    handlers
        .streaming("seq.explode", |_: Value, _| {
            futures::stream::iter([1, 2]).map(|n| {
                if n == 2 {
                    panic!("second item explodes");
                }
                Ok::<_, RpcError>(n)
            })
        })
        .unwrap();
    handlers
        .streaming("seq.wrong", |_: Value, _| {
            futures::stream::iter([Ok::<_, RpcError>(json!(1)), Ok(json!("two"))])
        })
        .unwrap();

    Dispatcher::new(contracts, handlers, Arc::new(SchemaValidator)).unwrap()
}

async fn next(rx: &mut mpsc::UnboundedReceiver<ResponseEnvelope>) -> ResponseEnvelope {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an envelope")
        .expect("peer channel closed")
}

/// Collect envelopes until every listed callId has seen its terminal one.
async fn until_terminal(
    rx: &mut mpsc::UnboundedReceiver<ResponseEnvelope>,
    call_ids: &[&str],
) -> Vec<ResponseEnvelope> {
    let mut open: Vec<String> = call_ids.iter().map(|s| s.to_string()).collect();
    let mut out = Vec::new();
    while !open.is_empty() {
        let env = next(rx).await;
        if env.is_terminal() {
            open.retain(|id| *id != env.call_id);
        }
        out.push(env);
    }
    out
}

fn for_call<'a>(envelopes: &'a [ResponseEnvelope], call_id: &str) -> Vec<&'a ResponseEnvelope> {
    envelopes.iter().filter(|e| e.call_id == call_id).collect()
}

// ---------------------------------------------------------------------------
// Unary calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unary_calls_yield_exactly_one_envelope() {
    let dispatcher = app_dispatcher();
    let (handle, mut rx) = one_shot();

    let inputs = [
        ("users.create", json!({"email": "a@example.com", "name": "A"})),
        ("users.list", Value::Null),
        ("users.get", json!({"id": 1})),
        ("users.update", json!({"id": 1, "data": {"name": "B"}})),
        ("users.get", json!({"id": 99})),
        ("users.delete", json!({"id": 1})),
    ];
    for (i, (path, input)) in inputs.into_iter().enumerate() {
        let id = format!("u{}", i);
        dispatcher.handle(call(path, input, &id), &handle).await;
        let env = next(&mut rx).await;
        assert_eq!(env.call_id, id);
        assert!(matches!(env.kind(), "success" | "error"));
    }
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn user_lifecycle_through_dispatcher() {
    let dispatcher = app_dispatcher();
    let (handle, _rx) = one_shot();

    let created = dispatcher
        .dispatch(
            call("users.create", json!({"email": "ada@example.com", "name": "Ada"}), "1"),
            &handle,
        )
        .await
        .into_reply()
        .unwrap();
    let user = created.value().unwrap().clone();
    assert_eq!(user["id"], 1);
    assert_eq!(user["email"], "ada@example.com");
    assert!(user_schema().check(&user).is_ok());

    let list = dispatcher
        .dispatch(call("users.list", Value::Null, "2"), &handle)
        .await
        .into_reply()
        .unwrap();
    assert_eq!(list.value().unwrap().as_array().unwrap().len(), 1);

    let updated = dispatcher
        .dispatch(
            call("users.update", json!({"id": 1, "data": {"name": "Ada L."}}), "3"),
            &handle,
        )
        .await
        .into_reply()
        .unwrap();
    assert_eq!(updated.value().unwrap()["name"], "Ada L.");
    assert_eq!(updated.value().unwrap()["email"], "ada@example.com");

    let deleted = dispatcher
        .dispatch(call("users.delete", json!({"id": 1}), "4"), &handle)
        .await
        .into_reply()
        .unwrap();
    assert_eq!(deleted, ResponseEnvelope::success("4", json!({"success": true})));

    for (path, input) in [
        ("users.get", json!({"id": 1})),
        ("users.update", json!({"id": 1, "data": {}})),
        ("users.delete", json!({"id": 1})),
    ] {
        let reply = dispatcher
            .dispatch(call(path, input, "5"), &handle)
            .await
            .into_reply()
            .unwrap();
        assert_eq!(reply.error_kind(), Some(ErrorKind::NotFound), "{}", path);
        let wire = serde_json::to_value(&reply).unwrap();
        assert_eq!(wire["message"], "User not found");
    }
}

#[tokio::test]
async fn duplicate_email_is_a_validation_error_on_email() {
    let dispatcher = app_dispatcher();
    let (handle, _rx) = one_shot();
    let input = json!({"email": "dup@example.com", "name": "One"});

    dispatcher
        .dispatch(call("users.create", input.clone(), "1"), &handle)
        .await;
    let reply = dispatcher
        .dispatch(call("users.create", input, "2"), &handle)
        .await
        .into_reply()
        .unwrap();
    assert_eq!(reply.error_kind(), Some(ErrorKind::Validation));
    assert_eq!(serde_json::to_value(&reply).unwrap()["detail"], json!(["email"]));
}

#[tokio::test]
async fn invalid_email_never_reaches_the_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = test_dispatcher(calls.clone());
    let (handle, _rx) = one_shot();

    let reply = dispatcher
        .dispatch(
            call("users.create", json!({"email": "not-an-email", "name": "x"}), "v"),
            &handle,
        )
        .await
        .into_reply()
        .unwrap();
    assert_eq!(reply.error_kind(), Some(ErrorKind::Validation));
    assert_eq!(serde_json::to_value(&reply).unwrap()["detail"], json!(["email"]));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // A valid call does reach it.
    dispatcher
        .dispatch(
            call("users.create", json!({"email": "ok@example.com", "name": "x"}), "w"),
            &handle,
        )
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_path_is_not_found_for_any_peer_kind() {
    let dispatcher = app_dispatcher();
    let (one_shot, _rx1) = one_shot();
    let (persistent, _rx2) = attach(&dispatcher);

    for handle in [&one_shot, &persistent] {
        let reply = dispatcher
            .dispatch(call("users.nope", json!({}), "n"), handle)
            .await
            .into_reply()
            .unwrap();
        assert_eq!(reply.error_kind(), Some(ErrorKind::NotFound));
    }
}

// ---------------------------------------------------------------------------
// Streaming calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_sessions_keep_their_own_order() {
    let dispatcher = test_dispatcher(Arc::new(AtomicUsize::new(0)));
    let (handle, mut rx) = attach(&dispatcher);

    let a = dispatcher.dispatch(call("seq.numbers", Value::Null, "A"), &handle).await;
    let b = dispatcher.dispatch(call("seq.letters", Value::Null, "B"), &handle).await;
    assert!(matches!(a, Dispatched::Streaming(_)));
    assert!(matches!(b, Dispatched::Streaming(_)));

    let all = until_terminal(&mut rx, &["A", "B"]).await;

    let a: Vec<_> = for_call(&all, "A").into_iter().cloned().collect();
    assert_eq!(
        a,
        vec![
            ResponseEnvelope::event("A", json!(1)),
            ResponseEnvelope::event("A", json!(2)),
            ResponseEnvelope::event("A", json!(3)),
            ResponseEnvelope::complete("A"),
        ]
    );
    let b: Vec<_> = for_call(&all, "B").into_iter().cloned().collect();
    assert_eq!(
        b,
        vec![
            ResponseEnvelope::event("B", json!("x")),
            ResponseEnvelope::event("B", json!("y")),
            ResponseEnvelope::complete("B"),
        ]
    );
    assert_eq!(dispatcher.sessions().active_sessions(), 0);
}

#[tokio::test]
async fn cancel_mid_stream_emits_one_aborted_and_stops_events() {
    let dispatcher = test_dispatcher(Arc::new(AtomicUsize::new(0)));
    let (handle, mut rx) = attach(&dispatcher);

    dispatcher.dispatch(call("seq.forever", Value::Null, "f"), &handle).await;
    assert_eq!(next(&mut rx).await.kind(), "event");
    assert_eq!(next(&mut rx).await.kind(), "event");

    assert!(dispatcher.sessions().cancel(&handle.key(), "f"));

    let rest = until_terminal(&mut rx, &["f"]).await;
    assert_eq!(rest.last(), Some(&ResponseEnvelope::aborted("f")));
    assert!(rest[..rest.len() - 1].iter().all(|e| e.kind() == "event"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err(), "nothing may follow the terminal envelope");
}

#[tokio::test]
async fn panicking_stream_item_ends_with_handler_error() {
    let dispatcher = test_dispatcher(Arc::new(AtomicUsize::new(0)));
    let (handle, mut rx) = attach(&dispatcher);

    dispatcher.dispatch(call("seq.explode", Value::Null, "p"), &handle).await;
    let got = until_terminal(&mut rx, &["p"]).await;
    assert_eq!(got[0], ResponseEnvelope::event("p", json!(1)));
    assert_eq!(got[1].error_kind(), Some(ErrorKind::Handler));
    assert_eq!(got.len(), 2);

    // Other sessions on the same peer are unaffected.
    dispatcher.dispatch(call("seq.numbers", Value::Null, "q"), &handle).await;
    let got = until_terminal(&mut rx, &["q"]).await;
    assert_eq!(got.last(), Some(&ResponseEnvelope::complete("q")));
}

#[tokio::test]
async fn stream_output_is_checked_against_the_contract() {
    let dispatcher = test_dispatcher(Arc::new(AtomicUsize::new(0)));
    let (handle, mut rx) = attach(&dispatcher);

    dispatcher.dispatch(call("seq.wrong", Value::Null, "w"), &handle).await;
    let got = until_terminal(&mut rx, &["w"]).await;
    assert_eq!(got[0], ResponseEnvelope::event("w", json!(1)));
    assert_eq!(got[1].error_kind(), Some(ErrorKind::Handler));
}

#[tokio::test]
async fn duplicate_active_call_id_is_rejected() {
    let dispatcher = test_dispatcher(Arc::new(AtomicUsize::new(0)));
    let (handle, _rx) = attach(&dispatcher);

    dispatcher.dispatch(call("seq.forever", Value::Null, "d"), &handle).await;
    let reply = dispatcher
        .dispatch(call("seq.forever", Value::Null, "d"), &handle)
        .await
        .into_reply()
        .unwrap();
    assert_eq!(reply.error_kind(), Some(ErrorKind::Transport));
    assert_eq!(dispatcher.sessions().sessions_for(&handle.key()), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_call_id_can_be_started_again_at_once() {
    let dispatcher = test_dispatcher(Arc::new(AtomicUsize::new(0)));
    let (handle, mut rx) = attach(&dispatcher);

    dispatcher.dispatch(call("seq.forever", Value::Null, "r"), &handle).await;
    assert_eq!(next(&mut rx).await.kind(), "event");

    assert!(dispatcher.sessions().cancel(&handle.key(), "r"));
    let restarted = dispatcher
        .dispatch(call("seq.numbers", Value::Null, "r"), &handle)
        .await;
    assert!(matches!(restarted, Dispatched::Streaming(_)));

    let old = until_terminal(&mut rx, &["r"]).await;
    assert_eq!(old.last(), Some(&ResponseEnvelope::aborted("r")));
    let new = until_terminal(&mut rx, &["r"]).await;
    assert_eq!(
        new,
        vec![
            ResponseEnvelope::event("r", json!(1)),
            ResponseEnvelope::event("r", json!(2)),
            ResponseEnvelope::event("r", json!(3)),
            ResponseEnvelope::complete("r"),
        ]
    );
}

#[tokio::test]
async fn closing_a_peer_tears_down_every_session_once() {
    let dispatcher = test_dispatcher(Arc::new(AtomicUsize::new(0)));
    let (handle, _rx) = attach(&dispatcher);
    let (other, mut other_rx) = attach(&dispatcher);

    for id in ["s1", "s2", "s3"] {
        dispatcher.dispatch(call("seq.forever", Value::Null, id), &handle).await;
    }
    dispatcher.dispatch(call("seq.forever", Value::Null, "o"), &other).await;
    assert_eq!(dispatcher.sessions().sessions_for(&handle.key()), 3);

    assert_eq!(dispatcher.sessions().close_peer(&handle.key()), 3);
    assert_eq!(dispatcher.sessions().close_peer(&handle.key()), 0);
    assert_eq!(dispatcher.sessions().sessions_for(&handle.key()), 0);

    // The other peer keeps streaming.
    assert!(dispatcher.sessions().is_active(&other.key(), "o"));
    assert_eq!(next(&mut other_rx).await.call_id, "o");

    // New calls on the closed peer are refused.
    let reply = dispatcher
        .dispatch(call("seq.numbers", Value::Null, "late"), &handle)
        .await
        .into_reply()
        .unwrap();
    assert_eq!(reply.error_kind(), Some(ErrorKind::Transport));
}

#[tokio::test]
async fn time_stream_with_limit_completes() {
    let dispatcher = app_dispatcher();
    let (handle, mut rx) = attach(&dispatcher);

    dispatcher
        .dispatch(call("time.stream", json!({"limit": 3}), "t"), &handle)
        .await;
    let got = until_terminal(&mut rx, &["t"]).await;
    assert_eq!(got.len(), 4);
    for env in &got[..3] {
        let value = env.value().unwrap();
        assert!(value["timestamp"].is_string());
        assert!(value["formatted"].is_string());
    }
    assert_eq!(got[3], ResponseEnvelope::complete("t"));
}

#[tokio::test]
async fn streaming_on_a_one_shot_peer_is_refused() {
    let dispatcher = app_dispatcher();
    let (handle, _rx) = one_shot();
    let reply = dispatcher
        .dispatch(call("time.stream", Value::Null, "t"), &handle)
        .await
        .into_reply()
        .unwrap();
    assert_eq!(reply.error_kind(), Some(ErrorKind::Transport));
}
