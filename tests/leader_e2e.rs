//! End-to-end exercises: a real leader on a real unix socket, with real
//! shared-memory rings drained the way a follower worker would.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde_json::json;

use cplane::action::{self, Action};
use cplane::channel::Channel;
use cplane::leader::{Leader, LeaderOptions, SetupError};
use cplane::paths;
use cplane::schema::{
    self, ArrayGrammar, ArrayValue, Grammar, PackedLayout, ScalarType, ScalarValue, Schema,
    TableGrammar, TableValue, Value,
};

/// Schema: apps and links drive the graph; nexthops (compact table) and
/// weights (packed array) exercise the packed storage paths.
fn dataplane_grammar() -> Grammar {
    let nexthop_key = PackedLayout::new(&[("addr", ScalarType::Uint32)]).expect("key layout");
    let nexthop_value = PackedLayout::new(&[("port", ScalarType::Uint16)]).expect("value layout");
    let weight_elem = PackedLayout::new(&[("weight", ScalarType::Uint16)]).expect("weight layout");

    let mut fields = BTreeMap::new();
    fields.insert(
        "apps".to_string(),
        Grammar::Table(TableGrammar {
            keys: vec![("name".to_string(), ScalarType::String)],
            value: Box::new(Grammar::Struct {
                fields: BTreeMap::from([
                    ("kind".to_string(), Grammar::Scalar(ScalarType::String)),
                    ("arg".to_string(), Grammar::Scalar(ScalarType::String)),
                ]),
            }),
            key_layout: None,
            value_layout: None,
            string_key: Some("name".to_string()),
        }),
    );
    fields.insert(
        "links".to_string(),
        Grammar::Array(ArrayGrammar {
            element: Box::new(Grammar::Struct {
                fields: BTreeMap::from([
                    ("from".to_string(), Grammar::Scalar(ScalarType::String)),
                    ("to".to_string(), Grammar::Scalar(ScalarType::String)),
                ]),
            }),
            layout: None,
        }),
    );
    fields.insert(
        "nexthops".to_string(),
        Grammar::Table(TableGrammar {
            keys: vec![("addr".to_string(), ScalarType::Uint32)],
            value: Box::new(Grammar::Struct {
                fields: BTreeMap::from([(
                    "port".to_string(),
                    Grammar::Scalar(ScalarType::Uint16),
                )]),
            }),
            key_layout: Some(nexthop_key),
            value_layout: Some(nexthop_value),
            string_key: None,
        }),
    );
    fields.insert(
        "weights".to_string(),
        Grammar::Array(ArrayGrammar {
            element: Box::new(Grammar::Scalar(ScalarType::Uint16)),
            layout: Some(weight_elem),
        }),
    );
    Grammar::Struct { fields }
}

fn scalar_str(value: &Value) -> Option<&str> {
    match value {
        Value::Scalar(ScalarValue::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

/// Pure configuration → graph: apps come from the apps table, links from
/// the links array. The packed collections do not shape the graph.
fn setup(config: &Value) -> Result<cplane::AppGraph, SetupError> {
    let Value::Struct(fields) = config else {
        return Err(SetupError("configuration root must be a struct".into()));
    };
    let mut graph = cplane::AppGraph::new();
    if let Some(Value::Table(TableValue::StringKeyed(apps))) = fields.get("apps") {
        for (name, spec) in apps {
            let Value::Struct(spec) = spec else {
                return Err(SetupError(format!("app `{name}` is not a struct")));
            };
            let kind = spec.get("kind").and_then(scalar_str).unwrap_or_default();
            let arg = spec.get("arg").and_then(scalar_str).unwrap_or_default();
            graph.add_app(name, kind, arg);
        }
    }
    if let Some(Value::Array(ArrayValue::Generic(links))) = fields.get("links") {
        for link in links {
            let Value::Struct(link) = link else {
                return Err(SetupError("link is not a struct".into()));
            };
            let from = link.get("from").and_then(scalar_str).unwrap_or_default();
            let to = link.get("to").and_then(scalar_str).unwrap_or_default();
            graph.add_link(from, to);
        }
    }
    Ok(graph)
}

struct Harness {
    _dir: tempfile::TempDir,
    _shm: paths::ShmRootOverride,
    leader: Leader,
    schema_name: String,
}

fn empty_config() -> String {
    json!({"apps": [], "links": [], "nexthops": [], "weights": []}).to_string()
}

fn harness_with(name: &str, initial: &str, pids: Vec<u32>) -> Harness {
    cplane::telemetry::init(0);
    let dir = tempfile::tempdir().expect("tempdir");
    let shm = paths::override_shm_root_for_tests(Some(PathBuf::from(dir.path())));
    let schema_name = format!("dataplane-{name}");
    schema::register(Schema::new(&schema_name, dataplane_grammar()).expect("schema"));

    let options = LeaderOptions::new(&schema_name, initial, Box::new(setup))
        .with_socket_file_name(&format!("leader-{name}.sock"))
        .with_follower_pids(pids)
        .with_hz(1000);
    let leader = Leader::new(options).expect("leader starts");
    Harness {
        _dir: dir,
        _shm: shm,
        leader,
        schema_name,
    }
}

fn harness(name: &str, initial: &str) -> Harness {
    harness_with(name, initial, Vec::new())
}

fn harness_with_follower(
    name: &str,
    initial: &str,
    pid: u32,
    ring_bytes: usize,
) -> (Harness, Channel) {
    cplane::telemetry::init(0);
    let dir = tempfile::tempdir().expect("tempdir");
    let shm = paths::override_shm_root_for_tests(Some(PathBuf::from(dir.path())));
    let schema_name = format!("dataplane-{name}");
    schema::register(Schema::new(&schema_name, dataplane_grammar()).expect("schema"));

    // The follower's ring exists before the leader starts, as it would
    // under the process supervisor.
    let ring = Channel::create(&paths::follower_channel_path(pid), ring_bytes).expect("ring");

    let options = LeaderOptions::new(&schema_name, initial, Box::new(setup))
        .with_socket_file_name(&format!("leader-{name}.sock"))
        .with_follower_pids(vec![pid])
        .with_hz(1000);
    let leader = Leader::new(options).expect("leader starts");
    (
        Harness {
            _dir: dir,
            _shm: shm,
            leader,
            schema_name,
        },
        ring,
    )
}

/// Send one framed request, ticking the leader until the reply (or EOF)
/// arrives. Returns the reply payload, or None on EOF without a frame.
fn rpc(leader: &mut Leader, request: &serde_json::Value) -> Option<serde_json::Value> {
    let payload = serde_json::to_vec(request).expect("encode request");
    let mut stream = UnixStream::connect(leader.socket_path()).expect("connect");
    let mut framed = payload.len().to_string().into_bytes();
    framed.push(b'\n');
    framed.extend_from_slice(&payload);
    stream.write_all(&framed).expect("send request");
    stream
        .set_read_timeout(Some(Duration::from_millis(1)))
        .expect("read timeout");

    let mut buf = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut chunk = [0u8; 4096];
    loop {
        assert!(Instant::now() < deadline, "rpc timed out");
        leader.tick(Instant::now());
        match stream.read(&mut chunk) {
            Ok(0) => {
                assert!(buf.is_empty(), "connection died mid-reply");
                return None;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => panic!("read failed: {e}"),
        }
        if let Some(newline) = buf.iter().position(|&b| b == b'\n') {
            let len: usize = std::str::from_utf8(&buf[..newline])
                .expect("ascii length")
                .parse()
                .expect("decimal length");
            if buf.len() >= newline + 1 + len {
                let payload = &buf[newline + 1..newline + 1 + len];
                return Some(serde_json::from_slice(payload).expect("reply is json"));
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn get_config(leader: &mut Leader, schema: &str, path: &str) -> String {
    let reply = rpc(
        leader,
        &json!({"method": "get-config", "args": {"schema": schema, "path": path}}),
    )
    .expect("reply");
    reply["ok"]["config"]
        .as_str()
        .unwrap_or_else(|| panic!("expected config reply, got {reply}"))
        .to_string()
}

#[test]
fn describe_reports_the_native_schema() {
    let mut h = harness("describe", &empty_config());
    let reply = rpc(&mut h.leader, &json!({"method": "describe"})).expect("reply");
    assert_eq!(
        reply["ok"]["native_schema"].as_str(),
        Some(h.schema_name.as_str())
    );
}

#[test]
fn set_root_updates_config_and_ships_actions() {
    let pid = 70_101;
    let (mut h, mut ring) = harness_with_follower("setroot", &empty_config(), pid, 4096);

    let new_config = json!({
        "apps": [
            {"name": "fw", "kind": "Firewall", "arg": "{}"},
            {"name": "nic", "kind": "Intel", "arg": "{}"}
        ],
        "links": [{"from": "nic.tx", "to": "fw.rx"}],
        "nexthops": [],
        "weights": []
    });
    let reply = rpc(
        &mut h.leader,
        &json!({"method": "set-config", "args": {
            "schema": h.schema_name, "path": "/",
            "config": new_config.to_string(),
        }}),
    )
    .expect("reply");
    assert!(reply.get("ok").is_some(), "set-config failed: {reply}");

    let printed = get_config(&mut h.leader, &h.schema_name, "/apps[name=fw]/kind");
    assert_eq!(printed, "\"Firewall\"");

    // The graph always tracks setup(configuration).
    assert_eq!(
        h.leader.app_graph(),
        &setup(h.leader.configuration()).expect("setup")
    );

    // The diff of empty → {fw, nic, one link} lands in the ring in order:
    // adds first (sorted), then the link.
    h.leader.tick(Instant::now());
    let mut actions = Vec::new();
    while let Some(frame) = ring.pop() {
        actions.push(action::decode(&frame).expect("decode action"));
    }
    assert_eq!(
        actions,
        vec![
            Action::AddApp {
                name: "fw".into(),
                kind: "Firewall".into(),
                arg: "{}".into(),
            },
            Action::AddApp {
                name: "nic".into(),
                kind: "Intel".into(),
                arg: "{}".into(),
            },
            Action::Link {
                from: "nic.tx".into(),
                to: "fw.rx".into(),
            },
        ]
    );
}

#[test]
fn duplicate_key_add_leaves_the_table_untouched() {
    let initial = json!({
        "apps": [], "links": [], "weights": [],
        "nexthops": [{"addr": 1, "port": 80}]
    })
    .to_string();
    let mut h = harness("dupadd", &initial);

    let before = get_config(&mut h.leader, &h.schema_name, "/nexthops");
    let reply = rpc(
        &mut h.leader,
        &json!({"method": "add-config", "args": {
            "schema": h.schema_name, "path": "/nexthops",
            "config": json!([
                {"addr": 2, "port": 81},
                {"addr": 1, "port": 82}
            ]).to_string(),
        }}),
    )
    .expect("reply");
    assert_eq!(
        reply["err"]["code"].as_str(),
        Some("already_existing_entry"),
        "unexpected reply: {reply}"
    );

    let after = get_config(&mut h.leader, &h.schema_name, "/nexthops");
    assert_eq!(before, after);
}

#[test]
fn remove_from_packed_array_by_position() {
    let initial = json!({
        "apps": [], "links": [], "nexthops": [],
        "weights": [10, 20, 30, 40]
    })
    .to_string();
    let mut h = harness("arremove", &initial);

    let reply = rpc(
        &mut h.leader,
        &json!({"method": "remove-config", "args": {
            "schema": h.schema_name, "path": "/weights[position=2]",
        }}),
    )
    .expect("reply");
    assert!(reply.get("ok").is_some(), "remove failed: {reply}");
    assert_eq!(
        get_config(&mut h.leader, &h.schema_name, "/weights"),
        "[10,30,40]"
    );
}

#[test]
fn backpressure_preserves_order_across_ticks() {
    let pid = 70_102;
    // Each add-app frame for these names occupies 22 ring bytes; 48 bytes
    // holds exactly two.
    let (mut h, mut ring) = harness_with_follower("backpressure", &empty_config(), pid, 48);

    let apps: Vec<_> = (1..=5)
        .map(|i| json!({"name": format!("a{i}"), "kind": "K", "arg": ""}))
        .collect();
    let reply = rpc(
        &mut h.leader,
        &json!({"method": "set-config", "args": {
            "schema": h.schema_name, "path": "/",
            "config": json!({
                "apps": apps, "links": [], "nexthops": [], "weights": []
            }).to_string(),
        }}),
    )
    .expect("reply");
    assert!(reply.get("ok").is_some(), "set-config failed: {reply}");

    h.leader.tick(Instant::now());
    assert_eq!(h.leader.follower_backlog(pid), Some(3));

    let mut names = Vec::new();
    let mut drain = |ring: &mut Channel, names: &mut Vec<String>| {
        while let Some(frame) = ring.pop() {
            match action::decode(&frame).expect("decode") {
                Action::AddApp { name, .. } => names.push(name),
                other => panic!("unexpected action {other:?}"),
            }
        }
    };
    drain(&mut ring, &mut names);
    assert_eq!(names, ["a1", "a2"]);

    // Ring drained: the re-queued tail flows out over the next ticks, in
    // order.
    let deadline = Instant::now() + Duration::from_secs(5);
    while h.leader.follower_backlog(pid) != Some(0) {
        assert!(Instant::now() < deadline, "backlog never drained");
        std::thread::sleep(Duration::from_millis(2));
        h.leader.tick(Instant::now());
        drain(&mut ring, &mut names);
    }
    drain(&mut ring, &mut names);
    assert_eq!(names, ["a1", "a2", "a3", "a4", "a5"]);
}

#[test]
fn peer_crash_mid_payload_does_not_disturb_others() {
    let mut h = harness("crash", &empty_config());

    // A peer that promises 64 payload bytes, sends half, and hangs up.
    let mut crasher = UnixStream::connect(h.leader.socket_path()).expect("connect");
    crasher.write_all(b"64\nonly half of the promised").expect("partial write");
    h.leader.tick(Instant::now());
    drop(crasher);

    // Another peer's RPC proceeds normally.
    let reply = rpc(&mut h.leader, &json!({"method": "describe"})).expect("reply");
    assert_eq!(
        reply["ok"]["native_schema"].as_str(),
        Some(h.schema_name.as_str())
    );
}

#[test]
fn failed_rpc_leaves_leader_state_unchanged() {
    let initial = json!({
        "apps": [{"name": "fw", "kind": "Firewall", "arg": "{}"}],
        "links": [], "nexthops": [], "weights": [1]
    })
    .to_string();
    let mut h = harness("atomicity", &initial);
    let before = get_config(&mut h.leader, &h.schema_name, "/");

    // Schema mismatch on a mutation.
    let reply = rpc(
        &mut h.leader,
        &json!({"method": "set-config", "args": {
            "schema": "some-other-schema", "path": "/", "config": "{}",
        }}),
    )
    .expect("reply");
    assert_eq!(reply["err"]["code"].as_str(), Some("schema_mismatch"));

    // Bad payload under the sub-grammar.
    let reply = rpc(
        &mut h.leader,
        &json!({"method": "set-config", "args": {
            "schema": h.schema_name, "path": "/weights", "config": "[\"x\"]",
        }}),
    )
    .expect("reply");
    assert_eq!(reply["err"]["code"].as_str(), Some("type_mismatch"));

    // Unknown path.
    let reply = rpc(
        &mut h.leader,
        &json!({"method": "remove-config", "args": {
            "schema": h.schema_name, "path": "/weights[position=9]",
        }}),
    )
    .expect("reply");
    assert_eq!(reply["err"]["code"].as_str(), Some("not_found"));

    let describe = rpc(&mut h.leader, &json!({"method": "describe"})).expect("reply");
    assert_eq!(
        describe["ok"]["native_schema"].as_str(),
        Some(h.schema_name.as_str())
    );
    assert_eq!(get_config(&mut h.leader, &h.schema_name, "/"), before);
}

#[test]
fn follower_thread_drains_like_a_worker() {
    let pid = 70_103;
    let (mut h, ring) = harness_with_follower("worker", &empty_config(), pid, 4096);

    // The worker side: a thread that polls its ring and reports decoded
    // actions back, the way the dataplane process applies them.
    let (tx, rx) = crossbeam::channel::bounded::<Action>(16);
    let worker = std::thread::spawn(move || {
        let mut ring = ring;
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = 0;
        while seen < 2 && Instant::now() < deadline {
            match ring.pop() {
                Some(frame) => {
                    let action = action::decode(&frame).expect("decode action");
                    tx.send(action).expect("report action");
                    seen += 1;
                }
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    });

    let reply = rpc(
        &mut h.leader,
        &json!({"method": "set-config", "args": {
            "schema": h.schema_name, "path": "/",
            "config": json!({
                "apps": [
                    {"name": "fw", "kind": "Firewall", "arg": "{}"},
                    {"name": "nic", "kind": "Intel", "arg": "{}"}
                ],
                "links": [], "nexthops": [], "weights": []
            }).to_string(),
        }}),
    )
    .expect("reply");
    assert!(reply.get("ok").is_some(), "set-config failed: {reply}");

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while received.len() < 2 {
        assert!(Instant::now() < deadline, "worker never saw the actions");
        h.leader.tick(Instant::now());
        while let Ok(action) = rx.try_recv() {
            received.push(action);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    worker.join().expect("worker thread");

    assert_eq!(
        received,
        vec![
            Action::AddApp {
                name: "fw".into(),
                kind: "Firewall".into(),
                arg: "{}".into(),
            },
            Action::AddApp {
                name: "nic".into(),
                kind: "Intel".into(),
                arg: "{}".into(),
            },
        ]
    );
}

#[test]
fn stop_unlinks_the_control_socket() {
    let h = harness("stop", &empty_config());
    let socket = h.leader.socket_path().to_path_buf();
    assert!(socket.exists());
    h.leader.stop();
    assert!(!socket.exists());
}
