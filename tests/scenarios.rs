//! End-to-end scenarios exercising a full vertical slice of each module
//! rather than one operation in isolation. Unit tests inside each crate
//! cover the individual mechanisms these scenarios compose.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;

use actormesh::distributed::codec::{decode_frames, encode_frame, now_ms, Envelope};
use actormesh::distributed::node::NodeId;
use actormesh::distributed::transport::{Transport, TransportConfig};
use actormesh::distributed::value::Value;
use actormesh::process::{self, Behavior, ExitReason, Handle, Process, StartOpts};
use actormesh::supervisor::{ChildSpec, Intensity, RestartPolicy, Strategy, Supervisor, SupervisorSpec};
use actormesh::{Cluster, ClusterConfig};

fn node(s: &str) -> NodeId {
    NodeId::parse(s).unwrap()
}

// S1 — local supervised counter.

struct Counter;

enum CounterCast {
    Inc,
    Crash,
}

#[async_trait]
impl Behavior for Counter {
    type Call = ();
    type Cast = CounterCast;
    type UserInfo = ();
    type Reply = i64;
    type State = i64;

    async fn init(&mut self) -> Result<Self::State, String> {
        Ok(0)
    }

    async fn handle_call(&mut self, _msg: (), state: Self::State) -> Result<(Self::Reply, Self::State), String> {
        Ok((state, state))
    }

    async fn handle_cast(&mut self, msg: CounterCast, state: Self::State) -> Result<Self::State, String> {
        match msg {
            CounterCast::Inc => Ok(state + 1),
            CounterCast::Crash => Err("boom".to_string()),
        }
    }
}

fn counter_child(id: &str, instances: Arc<Mutex<Vec<Handle<Counter>>>>) -> ChildSpec {
    let id = id.to_string();
    ChildSpec::new(id, RestartPolicy::Permanent, move || {
        let instances = instances.clone();
        async move {
            let handle: Handle<Counter> = process::start(Counter, StartOpts::default())
                .await
                .map_err(|e| e.to_string())?;
            instances.lock().unwrap().push(handle.clone());
            Ok(handle.as_process())
        }
    })
}

#[tokio::test]
async fn s1_supervised_counter_restarts_with_fresh_state() {
    let instances = Arc::new(Mutex::new(Vec::new()));
    let spec = SupervisorSpec::new(Strategy::OneForOne, vec![counter_child("counter", instances.clone())]);
    let supervisor = Supervisor::start(spec).await.unwrap();

    let current = || instances.lock().unwrap().last().unwrap().clone();

    current().cast(CounterCast::Inc);
    current().cast(CounterCast::Inc);
    current().cast(CounterCast::Inc);
    // Casts land in send order on a single mailbox; give the driver loop a
    // moment to work through all three before reading the result.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(current().call((), Duration::from_secs(1)).await.unwrap(), 3);

    current().cast(CounterCast::Crash);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(instances.lock().unwrap().len(), 2, "exactly one restart");
    assert_eq!(current().call((), Duration::from_secs(1)).await.unwrap(), 0);
}

// S2 — supervisor intensity terminates after too many restarts within the window.

struct Boomer;

#[async_trait]
impl Behavior for Boomer {
    type Call = ();
    type Cast = ();
    type UserInfo = ();
    type Reply = ();
    type State = ();

    async fn init(&mut self) -> Result<Self::State, String> {
        Ok(())
    }

    async fn handle_cast(&mut self, _msg: (), _state: Self::State) -> Result<Self::State, String> {
        Err("boom".to_string())
    }
}

fn boomer_child(id: &str, instances: Arc<Mutex<Vec<Handle<Boomer>>>>) -> ChildSpec {
    let id = id.to_string();
    ChildSpec::new(id, RestartPolicy::Permanent, move || {
        let instances = instances.clone();
        async move {
            let handle: Handle<Boomer> = process::start(Boomer, StartOpts::default())
                .await
                .map_err(|e| e.to_string())?;
            instances.lock().unwrap().push(handle.clone());
            Ok(handle.as_process())
        }
    })
}

#[tokio::test]
async fn s2_intensity_window_terminates_supervisor_after_too_many_restarts() {
    let instances = Arc::new(Mutex::new(Vec::new()));
    let spec = SupervisorSpec::new(Strategy::OneForOne, vec![boomer_child("boomer", instances.clone())]).intensity(Intensity {
        max_restarts: 3,
        within: Duration::from_secs(5),
    });
    let supervisor = Supervisor::start(spec).await.unwrap();

    // Four crashes inside the window: the first three each earn a
    // restart, the fourth exhausts the quota and brings the supervisor
    // itself down.
    for _ in 0..4 {
        let target = instances.lock().unwrap().last().unwrap().clone();
        target.cast(());
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    assert!(!supervisor.as_process().is_running(), "supervisor terminates once max_restarts is exceeded");
    let last = instances.lock().unwrap().last().unwrap().clone();
    assert!(!last.as_process().is_running());
}

// S3 — codec round trip preserves every dynamic wire shape through
// framing, (de)serialization and signature-free transit.

#[test]
fn s3_codec_round_trip_preserves_dynamic_payload() {
    let payload = Value::Object(vec![
        ("type".to_string(), Value::String("cast".to_string())),
        (
            "ref".to_string(),
            Value::Object(vec![
                ("id".to_string(), Value::String("srv".to_string())),
                ("nodeId".to_string(), Value::String("a@127.0.0.1:4000".to_string())),
            ]),
        ),
        (
            "msg".to_string(),
            Value::Object(vec![
                ("d".to_string(), Value::Date(1_706_000_000_000)),
                (
                    "e".to_string(),
                    Value::Error {
                        name: "Error".to_string(),
                        message: "boom".to_string(),
                        stack: None,
                    },
                ),
                ("big".to_string(), Value::BigInt("9007199254740993".to_string())),
                (
                    "m".to_string(),
                    Value::Map(vec![(Value::String("k".to_string()), Value::String("v".to_string()))]),
                ),
                ("s".to_string(), Value::Set(vec![Value::Number(1.0), Value::Number(2.0)])),
                (
                    "r".to_string(),
                    Value::RegExp {
                        source: "a+".to_string(),
                        flags: "gi".to_string(),
                    },
                ),
                ("u".to_string(), Value::Undefined),
                ("nan".to_string(), Value::Number(f64::NAN)),
                ("inf".to_string(), Value::Number(f64::INFINITY)),
            ]),
        ),
    ]);

    let from = node("a@127.0.0.1:4000");
    let envelope = Envelope::new(from, now_ms(), payload.clone());
    let body = envelope.to_bytes().unwrap();

    let mut framed = Vec::new();
    encode_frame(&body, &mut framed).unwrap();
    let mut buf = BytesMut::from(&framed[..]);
    let frames = decode_frames(&mut buf).unwrap();
    assert_eq!(frames.len(), 1);
    assert!(buf.is_empty(), "no partial frame left behind");

    let decoded = Envelope::from_bytes(&frames[0]).unwrap();
    assert_eq!(decoded.from, envelope.from);
    assert_eq!(decoded.timestamp_ms, envelope.timestamp_ms);

    match &decoded.payload {
        Value::Object(fields) => {
            let msg = fields.iter().find(|(k, _)| k == "msg").map(|(_, v)| v).unwrap();
            let Value::Object(msg_fields) = msg else { panic!("msg should decode as an object") };
            match msg_fields.iter().find(|(k, _)| k == "nan").map(|(_, v)| v).unwrap() {
                Value::Number(n) => assert!(n.is_nan()),
                other => panic!("expected NaN, got {other:?}"),
            }
        }
        other => panic!("expected object payload, got {other:?}"),
    }

    // Equality modulo two things `PartialEq` can't paper over: object key
    // order (serde_json's `Map` is BTreeMap-backed, so a decode comes back
    // key-sorted regardless of how it was built) and NaN (which never
    // compares equal to itself).
    fn normalize(value: Value) -> Value {
        match value {
            Value::Object(mut fields) => {
                fields.sort_by(|(a, _), (b, _)| a.cmp(b));
                Value::Object(fields.into_iter().filter(|(k, _)| k != "nan").map(|(k, v)| (k, normalize(v))).collect())
            }
            Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
            other => other,
        }
    }
    assert_eq!(normalize(decoded.payload), normalize(payload));
}

// S4 — heartbeat-based failure detection marks a silent peer down within
// the configured window.

#[tokio::test]
async fn s4_heartbeat_failure_detection_marks_silent_peer_down() {
    let mut config_a = ClusterConfig::new(node("a@127.0.0.1:0"), "127.0.0.1:0");
    config_a.heartbeat_interval = Duration::from_millis(150);
    config_a.heartbeat_miss_threshold = 3;
    let cluster_a = Cluster::start(config_a).await.unwrap();
    let node_a = NodeId::new("a", "127.0.0.1", cluster_a.bound_addr().port()).unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    cluster_a.on_node_down(Arc::new(move |n| {
        let _ = tx.send(n);
    }))
    .await;

    // B never runs its own heartbeat loop: a bare transport that dials in,
    // announces itself once, and then goes silent models a peer whose
    // heartbeat broadcaster has stopped.
    let node_b = node("b@127.0.0.1:0");
    let (transport_b, _events_b) = Transport::new(node_b.clone(), TransportConfig::default());
    transport_b.connect_to(&node_a).await.unwrap();
    let hello = Envelope::new(
        node_b.clone(),
        now_ms(),
        Value::Object(vec![("kind".to_string(), Value::String("heartbeat".to_string()))]),
    );
    transport_b.send(&node_a, &hello).await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(
        cluster_a.membership().status_of(&node_b).await,
        Some(actormesh::distributed::membership::MembershipStatus::Up)
    );

    let down = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap();
    assert_eq!(down, node_b);
    assert_eq!(
        cluster_a.membership().status_of(&node_b).await,
        Some(actormesh::distributed::membership::MembershipStatus::Down)
    );
}

// S5 — remote call succeeds, then a pending call rejects once its target
// node becomes unreachable.

#[tokio::test]
async fn s5_remote_call_succeeds_then_rejects_after_node_loss() {
    let config_a = ClusterConfig::new(node("a@127.0.0.1:0"), "127.0.0.1:0");
    let cluster_a = Cluster::start(config_a).await.unwrap();
    let node_a = NodeId::new("a", "127.0.0.1", cluster_a.bound_addr().port()).unwrap();

    let mut config_b = ClusterConfig::new(node("b@127.0.0.1:0"), "127.0.0.1:0");
    config_b.heartbeat_interval = Duration::from_millis(100);
    config_b.heartbeat_miss_threshold = 3;
    let cluster_b = Cluster::start(config_b).await.unwrap();

    cluster_a.remote_calls().register_server(
        "srv",
        Arc::new(|args: Value| {
            Box::pin(async move {
                let Value::Object(fields) = args else { return Err("expected an object".to_string()) };
                let Some(Value::Number(n)) = fields.iter().find(|(k, _)| k == "n").map(|(_, v)| v.clone()) else {
                    return Err("missing n".to_string());
                };
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Value::Number(n + 1.0))
            })
        }),
    );

    cluster_b.transport().connect_to(&node_a).await.unwrap();

    let reply = cluster_b
        .remote_calls()
        .call(node_a.clone(), "srv", Value::Object(vec![("n".to_string(), Value::Number(41.0))]), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply, Value::Number(42.0));

    // Kill A while a second call is in flight against it.
    let pending = {
        let cluster_b = Arc::clone(&cluster_b);
        let node_a = node_a.clone();
        tokio::spawn(async move {
            cluster_b
                .remote_calls()
                .call(node_a, "srv", Value::Object(vec![("n".to_string(), Value::Number(99.0))]), Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    cluster_a.stop().await;

    let result = tokio::time::timeout(Duration::from_secs(3), pending).await.unwrap().unwrap();
    assert!(
        matches!(result, Err(actormesh::distributed::ClusterError::NodeNotReachable(_))),
        "pending call should reject once the target node is detected down, got {result:?}"
    );
}

// S6 — a remote link propagates a crash across the wire.

enum DieCast {
    Die,
}

struct Dying;

#[async_trait]
impl Behavior for Dying {
    type Call = ();
    type Cast = DieCast;
    type UserInfo = ();
    type Reply = ();
    type State = ();

    async fn init(&mut self) -> Result<Self::State, String> {
        Ok(())
    }

    async fn handle_cast(&mut self, _msg: DieCast, _state: Self::State) -> Result<Self::State, String> {
        Err("boom".to_string())
    }
}

struct Idle;

#[async_trait]
impl Behavior for Idle {
    type Call = ();
    type Cast = ();
    type UserInfo = ();
    type Reply = ();
    type State = ();

    async fn init(&mut self) -> Result<Self::State, String> {
        Ok(())
    }
}

#[tokio::test]
async fn s6_remote_link_exit_propagates_crash_across_nodes() {
    let config_a = ClusterConfig::new(node("a@127.0.0.1:0"), "127.0.0.1:0");
    let cluster_a = Cluster::start(config_a).await.unwrap();
    let node_a = NodeId::new("a", "127.0.0.1", cluster_a.bound_addr().port()).unwrap();

    let config_b = ClusterConfig::new(node("b@127.0.0.1:0"), "127.0.0.1:0");
    let cluster_b = Cluster::start(config_b).await.unwrap();
    let node_b = NodeId::new("b", "127.0.0.1", cluster_b.bound_addr().port()).unwrap();

    cluster_b.transport().connect_to(&node_a).await.unwrap();

    let p: Handle<Dying> = process::start(Dying, StartOpts::default()).await.unwrap();
    let q: Handle<Idle> = process::start(Idle, StartOpts { trap_exit: false, ..Default::default() }).await.unwrap();

    cluster_a.remote_links().register_local(p.process_ref().id.to_string(), p.as_process());
    cluster_b.remote_links().register_local(q.process_ref().id.to_string(), q.as_process());

    let remote_q = cluster_a.remote_links().remote_target(node_b.clone(), q.process_ref().id.to_string());
    let _link = process::link(p.as_process(), remote_q);

    // Let the link_request/link_ack round trip settle before crashing P.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(cluster_a.remote_links().active_link_count(), 1);
    assert_eq!(cluster_b.remote_links().active_link_count(), 1);

    p.cast(DieCast::Die);

    let reason = tokio::time::timeout(Duration::from_secs(2), q.wait_stopped()).await.unwrap();
    match &reason {
        ExitReason::Error(message) => assert!(message.contains("boom"), "reason should carry P's error: {message}"),
        other => panic!("expected an error reason, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster_a.remote_links().active_link_count(), 0);
    assert_eq!(cluster_b.remote_links().active_link_count(), 0);
}
