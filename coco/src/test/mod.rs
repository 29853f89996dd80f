//! End-to-end tests: a real frontend router, queue, worker and engine wired
//! together, with wiremock standing in for the downstream nodes.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use crate::api::{self, AppState};
use crate::blocklist::Blocklist;
use crate::endpoint::load_endpoints;
use crate::engine::Engine;
use crate::forwarder::Forwarder;
use crate::queue::RequestQueue;
use crate::state::State;
use crate::util::Host;
use crate::worker::Worker;

struct Stack {
    server: TestServer,
    storage_dir: PathBuf,
    _dir: TempDir,
    _shutdown: CancellationToken,
}

impl Stack {
    /// Read the active state as persisted on disk.
    fn active_state(&self) -> Value {
        let raw = fs::read(self.storage_dir.join("active")).unwrap();
        serde_json::from_slice(&raw).unwrap()
    }
}

/// Assemble frontend + queue + worker + engine over a `test` group with the
/// given hosts.
fn stack(
    endpoints: &[(&str, &str)],
    hosts: Vec<Host>,
    queue_length: usize,
    exclude_from_reset: &[&str],
) -> Stack {
    let dir = TempDir::new().unwrap();
    let endpoint_dir = dir.path().join("endpoints");
    fs::create_dir(&endpoint_dir).unwrap();
    for (name, yaml) in endpoints {
        fs::write(endpoint_dir.join(format!("{name}.yaml")), yaml).unwrap();
    }

    let groups = BTreeMap::from([("test".to_string(), hosts.clone())]);
    let endpoints = load_endpoints(&endpoint_dir, &groups).unwrap();

    let storage_dir = dir.path().join("storage");
    let state = State::new(
        &storage_dir,
        BTreeMap::new(),
        exclude_from_reset.iter().map(|s| s.to_string()).collect(),
    )
    .unwrap();
    let blocklist = Blocklist::new(dir.path().join("blocklist.json"), hosts).unwrap();
    let forwarder = Forwarder::new(groups, 1000, Duration::from_secs(10)).unwrap();
    let engine = Engine::new(endpoints.clone(), forwarder, state, blocklist);

    let (queue, receiver) = RequestQueue::new(queue_length);
    let shutdown = CancellationToken::new();
    tokio::spawn(Worker::new(engine, receiver).run(shutdown.clone()));

    let app_state = AppState {
        queue,
        registry: std::sync::Arc::new(api::build_registry(&endpoints)),
    };
    Stack {
        server: TestServer::new(api::router(app_state)).unwrap(),
        storage_dir,
        _dir: dir,
        _shutdown: shutdown,
    }
}

fn host_of(server: &MockServer) -> Host {
    let addr = server.address();
    Host::new(addr.ip().to_string(), addr.port())
}

async fn echo_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(|req: &Request| {
            let body: Value = req.body_json().unwrap_or(Value::Null);
            ResponseTemplate::new(200).set_body_json(body)
        })
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn plain_fanout_reaches_every_host_once() {
    let s1 = echo_server().await;
    let s2 = echo_server().await;
    let hosts = vec![host_of(&s1), host_of(&s2)];
    let stack = stack(
        &[(
            "test",
            "method: POST\ngroup: test\nvalues:\n  foo: int\n  bar: str\n",
        )],
        hosts.clone(),
        0,
        &[],
    );

    let response = stack
        .server
        .post("/test")
        .add_query_param("coco_report_type", "FULL")
        .json(&json!({"foo": 0, "bar": "1337"}))
        .await;
    response.assert_status_ok();

    let report: Value = response.json();
    assert_eq!(report["success"], json!(true));
    for host in &hosts {
        assert_eq!(report["test"][host.url()]["status"], json!(200));
        assert_eq!(report["test"][host.url()]["reply"], json!({"foo": 0, "bar": "1337"}));
    }
    // each node saw the call exactly once
    assert_eq!(s1.received_requests().await.unwrap().len(), 1);
    assert_eq!(s2.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn queue_overflow_drops_with_503_and_counts() {
    let node = echo_server().await;
    let stack = stack(
        &[("droptest", "method: POST\ngroup: test\n")],
        vec![host_of(&node)],
        3,
        &[],
    );

    let handle = crate::metrics::get_or_install_recorder();

    // block the worker, then spam the bounded queue
    let wait = stack.server.post("/wait").json(&json!({"duration": "2s"}));
    let spam = async {
        // give the worker time to dequeue the wait call
        tokio::time::sleep(Duration::from_millis(300)).await;
        tokio::join!(
            stack.server.post("/droptest"),
            stack.server.post("/droptest"),
            stack.server.post("/droptest"),
            stack.server.post("/droptest"),
        )
    };
    let (wait_response, (r1, r2, r3, r4)) = tokio::join!(wait, spam);
    wait_response.assert_status_ok();

    let statuses: Vec<u16> = [&r1, &r2, &r3, &r4]
        .iter()
        .map(|r| r.status_code().as_u16())
        .collect();
    assert_eq!(statuses.iter().filter(|s| **s == 200).count(), 3);
    assert_eq!(statuses.iter().filter(|s| **s == 503).count(), 1);

    let dropped = [&r1, &r2, &r3, &r4]
        .iter()
        .find(|r| r.status_code() == StatusCode::SERVICE_UNAVAILABLE)
        .map(|r| r.json::<Value>())
        .unwrap();
    assert_eq!(dropped, json!({"reply": "Coco queue is full.", "status": 503}));

    // exactly one drop recorded for this endpoint
    let exposition = handle.render();
    let line = exposition
        .lines()
        .find(|l| l.contains("coco_dropped_request_total") && l.contains(r#"endpoint="droptest""#))
        .expect("drop counter missing from exposition");
    assert!(line.trim_end().ends_with(" 1"), "unexpected drop count: {line}");
}

#[tokio::test]
async fn unmet_state_precondition_is_409_until_satisfied() {
    let node = echo_server().await;
    let endpoints = [
        (
            "test",
            "group: test\nrequire_state:\n  path: feeling/good\n  type: bool\n  value: true\n",
        ),
        (
            "feelgood",
            "method: POST\ncall:\n  forward: null\nvalues:\n  good: bool\nsave_state: [feeling]\n",
        ),
    ];
    let stack = stack(&endpoints, vec![host_of(&node)], 0, &[]);

    let rejected = stack.server.get("/test").await;
    rejected.assert_status(StatusCode::CONFLICT);
    // no fan-out happened
    assert!(node.received_requests().await.unwrap().is_empty());

    stack
        .server
        .post("/feelgood")
        .json(&json!({"good": true}))
        .await
        .assert_status_ok();

    let allowed = stack.server.get("/test").await;
    allowed.assert_status_ok();
    assert_eq!(node.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn reset_state_preserves_excluded_paths() {
    let endpoints = [
        (
            "save",
            "method: POST\ncall:\n  forward: null\nvalues:\n  val: int\nsave_state: [test_state]\n",
        ),
        (
            "save_excluded",
            "method: POST\ncall:\n  forward: null\nvalues:\n  val: int\nsave_state: [excluded]\n",
        ),
    ];
    let stack = stack(&endpoints, vec![], 0, &["excluded"]);

    stack.server.post("/save").json(&json!({"val": 5})).await.assert_status_ok();
    stack
        .server
        .post("/save_excluded")
        .json(&json!({"val": 5}))
        .await
        .assert_status_ok();
    assert_eq!(stack.active_state()["test_state"]["val"], json!(5));

    stack.server.post("/reset-state").await.assert_status_ok();

    let active = stack.active_state();
    assert_eq!(active["excluded"]["val"], json!(5));
    assert!(active.get("test_state").is_none());
}

#[tokio::test]
async fn snapshots_round_trip_over_http() {
    let endpoints = [
        (
            "save",
            "method: POST\ncall:\n  forward: null\nvalues:\n  val: int\nsave_state: [test_state]\n",
        ),
        (
            "save_excluded",
            "method: POST\ncall:\n  forward: null\nvalues:\n  val: int\nsave_state: [excluded]\n",
        ),
    ];
    let stack = stack(&endpoints, vec![], 0, &["excluded"]);

    stack.server.post("/save").json(&json!({"val": 1})).await.assert_status_ok();
    stack
        .server
        .post("/save-state")
        .json(&json!({"name": "backup"}))
        .await
        .assert_status_ok();

    // mutate both a normal and an excluded path after the save
    stack.server.post("/save").json(&json!({"val": 2})).await.assert_status_ok();
    stack
        .server
        .post("/save_excluded")
        .json(&json!({"val": 7}))
        .await
        .assert_status_ok();

    stack
        .server
        .post("/load-state")
        .json(&json!({"name": "backup"}))
        .await
        .assert_status_ok();

    let active = stack.active_state();
    // the saved value is back, the excluded mutation survived the load
    assert_eq!(active["test_state"]["val"], json!(1));
    assert_eq!(active["excluded"]["val"], json!(7));

    // overwriting needs the explicit flag
    let conflict = stack
        .server
        .post("/save-state")
        .json(&json!({"name": "backup"}))
        .await;
    conflict.assert_status(StatusCode::BAD_REQUEST);
    stack
        .server
        .post("/save-state")
        .json(&json!({"name": "backup", "overwrite": true}))
        .await
        .assert_status_ok();

    // the active name is reserved
    let reserved = stack
        .server
        .post("/save-state")
        .json(&json!({"name": "active"}))
        .await;
    reserved.assert_status(StatusCode::BAD_REQUEST);

    let listed = stack.server.get("/saved-states").await;
    let report: Value = listed.json();
    assert_eq!(report["saved-states"]["http://coco/"]["reply"], json!(["backup"]));
}

#[tokio::test]
async fn http_boundary_misuse_maps_to_4xx() {
    let node = echo_server().await;
    let stack = stack(
        &[("test", "method: POST\ngroup: test\nvalues:\n  foo: int\n")],
        vec![host_of(&node)],
        0,
        &[],
    );

    // unknown endpoint
    stack.server.get("/ghost").await.assert_status(StatusCode::NOT_FOUND);
    // wrong method
    stack.server.get("/test").await.assert_status(StatusCode::METHOD_NOT_ALLOWED);
    // malformed JSON
    let malformed = stack
        .server
        .post("/test")
        .content_type("application/json")
        .text("{not json")
        .await;
    malformed.assert_status(StatusCode::BAD_REQUEST);
    // missing required value
    stack
        .server
        .post("/test")
        .json(&json!({}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    // mis-typed required value
    stack
        .server
        .post("/test")
        .json(&json!({"foo": "bar"}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    // nothing ever reached the nodes
    assert!(node.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn blocklisted_hosts_are_excluded_from_fanout() {
    let s1 = echo_server().await;
    let s2 = echo_server().await;
    let h1 = host_of(&s1);
    let h2 = host_of(&s2);
    let stack = stack(
        &[("test", "method: POST\ngroup: test\n")],
        vec![h1.clone(), h2.clone()],
        0,
        &[],
    );

    stack
        .server
        .post("/update-blocklist")
        .json(&json!({"command": "add", "hosts": [h2.to_string()]}))
        .await
        .assert_status_ok();

    let listed = stack.server.get("/blocklist").await;
    let report: Value = listed.json();
    assert_eq!(report["blocklist"]["http://coco/"]["reply"], json!([h2.to_string()]));

    let response = stack
        .server
        .post("/test")
        .add_query_param("coco_report_type", "FULL")
        .json(&json!({}))
        .await;
    let report: Value = response.json();
    assert!(report["test"].get(h1.url()).is_some());
    assert!(report["test"].get(h2.url()).is_none());
    assert!(s2.received_requests().await.unwrap().is_empty());

    // unknown hosts reject the whole batch
    let rejected = stack
        .server
        .post("/update-blocklist")
        .json(&json!({"command": "add", "hosts": ["nope:1"]}))
        .await;
    rejected.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn default_report_type_is_codes_overview() {
    let s1 = echo_server().await;
    let s2 = echo_server().await;
    let stack = stack(
        &[("test", "method: POST\ngroup: test\n")],
        vec![host_of(&s1), host_of(&s2)],
        0,
        &[],
    );

    let response = stack.server.post("/test").json(&json!({})).await;
    let report: Value = response.json();
    assert_eq!(report["test"], json!({"200": 2}));
    assert_eq!(report["success"], json!(true));
}
