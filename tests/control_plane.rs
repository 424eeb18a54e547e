//! Control plane and HTTP API against an in-process consensus engine

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use dpasswd::api::{create_router, AppState, ControlPlane};
use dpasswd::fsm::{ApplyResponse, Fsm, LogEntry, StateMachine, Storage};
use dpasswd::raft::{ClusterConfiguration, Consensus, RaftState, Server};
use dpasswd::Error;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tower::ServiceExt;

const TIMEOUT: Duration = Duration::from_millis(500);

type ApplyOutcome = Box<dyn Fn() -> dpasswd::Result<Option<ApplyResponse>> + Send + Sync>;

/// Consensus that commits instantly through a real state machine.
struct FakeConsensus {
    state: Mutex<RaftState>,
    fsm: Fsm,
    index: AtomicU64,
    applies: AtomicUsize,
    changes: AtomicUsize,
    configuration: Mutex<ClusterConfiguration>,
    /// When set, `apply` returns this instead of committing
    apply_outcome: Mutex<Option<ApplyOutcome>>,
    /// When set, `configuration` fails with this message
    configuration_error: Mutex<Option<String>>,
}

impl FakeConsensus {
    fn new(state: RaftState, storage: Storage) -> Self {
        Self {
            state: Mutex::new(state),
            fsm: Fsm::new(storage),
            index: AtomicU64::new(1),
            applies: AtomicUsize::new(0),
            changes: AtomicUsize::new(0),
            configuration: Mutex::new(ClusterConfiguration {
                servers: vec![Server {
                    id: "node1".into(),
                    address: "127.0.0.1:4200".into(),
                }],
            }),
            apply_outcome: Mutex::new(None),
            configuration_error: Mutex::new(None),
        }
    }

    fn script_apply(
        &self,
        outcome: impl Fn() -> dpasswd::Result<Option<ApplyResponse>> + Send + Sync + 'static,
    ) {
        *self.apply_outcome.lock().unwrap() = Some(Box::new(outcome));
    }

    fn commit_normally(&self) {
        *self.apply_outcome.lock().unwrap() = None;
    }

    fn fail_configuration(&self, message: &str) {
        *self.configuration_error.lock().unwrap() = Some(message.to_string());
    }

    fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    fn changes(&self) -> usize {
        self.changes.load(Ordering::SeqCst)
    }
}

impl Consensus for FakeConsensus {
    fn state(&self) -> RaftState {
        *self.state.lock().unwrap()
    }

    async fn apply(
        &self,
        command: Vec<u8>,
        _timeout: Duration,
    ) -> dpasswd::Result<Option<ApplyResponse>> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.apply_outcome.lock().unwrap().as_ref() {
            return outcome();
        }
        let index = self.index.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.fsm.apply(&LogEntry::command(index, 1, command)))
    }

    async fn configuration(&self) -> dpasswd::Result<ClusterConfiguration> {
        if let Some(message) = self.configuration_error.lock().unwrap().clone() {
            return Err(Error::Apply(message));
        }
        Ok(self.configuration.lock().unwrap().clone())
    }

    async fn add_voter(
        &self,
        id: String,
        address: String,
        _timeout: Duration,
    ) -> dpasswd::Result<()> {
        self.changes.fetch_add(1, Ordering::SeqCst);
        let mut configuration = self.configuration.lock().unwrap();
        configuration.servers.retain(|s| s.id != id);
        configuration.servers.push(Server { id, address });
        Ok(())
    }

    async fn remove_server(&self, id: String, _timeout: Duration) -> dpasswd::Result<()> {
        self.changes.fetch_add(1, Ordering::SeqCst);
        let mut configuration = self.configuration.lock().unwrap();
        if !configuration.contains(&id) {
            return Err(Error::Apply(format!("unknown server {}", id)));
        }
        configuration.servers.retain(|s| s.id != id);
        Ok(())
    }

    fn stats(&self) -> BTreeMap<String, String> {
        let configuration = self.configuration.lock().unwrap();
        BTreeMap::from([
            ("node_id".to_string(), "node1".to_string()),
            ("state".to_string(), self.state().to_string()),
            (
                "num_peers".to_string(),
                configuration.servers.len().saturating_sub(1).to_string(),
            ),
            (
                "latest_configuration".to_string(),
                configuration.to_string(),
            ),
        ])
    }
}

struct Harness {
    consensus: Arc<FakeConsensus>,
    storage: Storage,
}

impl Harness {
    fn new(state: RaftState) -> Self {
        let storage = Storage::temporary().unwrap();
        let consensus = Arc::new(FakeConsensus::new(state, storage.clone()));
        Self { consensus, storage }
    }

    fn control(&self) -> ControlPlane<FakeConsensus> {
        ControlPlane::new(self.consensus.clone(), self.storage.clone(), TIMEOUT)
    }

    async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let state = AppState::new("node1", self.consensus.clone(), self.storage.clone(), TIMEOUT);
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = create_router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }
}

#[tokio::test]
async fn test_write_on_leader_then_read() {
    let h = Harness::new(RaftState::Leader);

    let (status, body) = h
        .call("POST", "/db", Some(json!({ "key": "alice", "value": "secret-blob" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "data stored successfully");
    assert_eq!(body["data"], json!({ "key": "alice", "value": "secret-blob" }));
    assert_eq!(h.consensus.applies(), 1);

    let (status, body) = h.call("GET", "/db/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "data fetched successfully");
    assert_eq!(body["data"]["value"], "secret-blob");
}

#[tokio::test]
async fn test_write_on_follower_is_rejected_before_consensus() {
    let h = Harness::new(RaftState::Follower);

    let (status, body) = h
        .call("POST", "/db", Some(json!({ "key": "alice", "value": "x" })))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "not the leader");

    let (status, _) = h.call("DELETE", "/db/alice", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(h.consensus.applies(), 0);
}

#[tokio::test]
async fn test_follower_serves_local_reads() {
    let h = Harness::new(RaftState::Follower);
    h.storage.set("alice", Some(&json!("stale-but-local"))).unwrap();

    let (status, body) = h.call("GET", "/db/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["value"], "stale-but-local");
}

#[tokio::test]
async fn test_delete_then_get_is_not_found() {
    let h = Harness::new(RaftState::Leader);
    h.call("POST", "/db", Some(json!({ "key": "bob", "value": {"v": 1} })))
        .await;

    let (status, body) = h.call("DELETE", "/db/bob", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "data removed successfully");

    let (status, body) = h.call("GET", "/db/bob", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body["error"],
        "error getting key bob from storage: Key not found"
    );
}

#[tokio::test]
async fn test_empty_key_never_reaches_consensus() {
    let h = Harness::new(RaftState::Leader);

    let (status, body) = h
        .call("POST", "/db", Some(json!({ "key": "   ", "value": "x" })))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "key is empty");

    let (status, _) = h.call("DELETE", "/db/%20", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(h.consensus.applies(), 0);
}

#[tokio::test]
async fn test_malformed_body_is_binding_error() {
    let h = Harness::new(RaftState::Leader);

    let state = AppState::new("node1", h.consensus.clone(), h.storage.clone(), TIMEOUT);
    let request = Request::builder()
        .method("POST")
        .uri("/db")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = create_router(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("error binding:"));
    assert_eq!(h.consensus.applies(), 0);
}

#[tokio::test]
async fn test_empty_value_is_accepted_without_storing() {
    let h = Harness::new(RaftState::Leader);

    let (status, _) = h
        .call("POST", "/db", Some(json!({ "key": "ghost", "value": "" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.consensus.applies(), 1);
    assert!(h.storage.is_empty());
}

#[tokio::test]
async fn test_control_plane_direct() {
    let h = Harness::new(RaftState::Leader);
    let control = h.control();

    let kv = assert_ok!(control.write("  carol ", json!({"pw": "c2Vj"})).await);
    assert_eq!(kv.key, "carol");
    assert_eq!(assert_ok!(control.read("carol")).value, json!({"pw": "c2Vj"}));

    assert_ok!(control.delete("carol").await);
    assert!(matches!(assert_err!(control.read("carol")), Error::NotFound(_)));

    // Deleting a missing key still commits
    assert_ok!(control.delete("carol").await);
    assert_eq!(h.consensus.applies(), 3);
}

#[tokio::test]
async fn test_missing_apply_response_is_protocol_error() {
    let h = Harness::new(RaftState::Leader);
    h.consensus.script_apply(|| Ok(None));

    let (status, body) = h
        .call("POST", "/db", Some(json!({ "key": "alice", "value": "x" })))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "error response is not match apply response");

    let (status, body) = h.call("DELETE", "/db/alice", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "error response is not match apply response");

    let err = assert_err!(h.control().write("alice", json!("x")).await);
    assert!(matches!(err, Error::UnexpectedResponseType));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_engine_failures_are_retryable() {
    let h = Harness::new(RaftState::Leader);

    h.consensus.script_apply(|| Err(Error::ApplyTimeout));
    let (status, body) = h
        .call("POST", "/db", Some(json!({ "key": "alice", "value": "x" })))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body["error"],
        "error applying data to raft cluster: timed out waiting for commit"
    );
    assert!(assert_err!(h.control().write("alice", json!("x")).await).is_retryable());

    h.consensus
        .script_apply(|| Err(Error::Apply("leadership lost".into())));
    let (status, body) = h.call("DELETE", "/db/alice", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "error applying data to raft cluster: leadership lost");
    assert!(assert_err!(h.control().delete("alice").await).is_retryable());

    // Retrying once the engine recovers succeeds
    h.consensus.commit_normally();
    let (status, _) = h
        .call("POST", "/db", Some(json!({ "key": "alice", "value": "x" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.storage.get("alice").unwrap(), json!("x"));
}

#[tokio::test]
async fn test_store_error_in_apply_response_reaches_caller() {
    let h = Harness::new(RaftState::Leader);
    h.consensus.script_apply(|| {
        let failure = sled::Error::Unsupported("disk full".into());
        Ok(Some(ApplyResponse::new(Err(Error::Store(failure)), Value::Null)))
    });

    let (status, body) = h
        .call("POST", "/db", Some(json!({ "key": "alice", "value": "x" })))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let error = body["error"].as_str().unwrap();
    assert!(error.starts_with("storage error:"), "{}", error);
    assert!(error.contains("disk full"), "{}", error);

    let err = assert_err!(h.control().write("alice", json!("x")).await);
    assert!(matches!(err, Error::Store(_)));
}

#[tokio::test]
async fn test_membership_without_configuration_is_rejected() {
    let h = Harness::new(RaftState::Leader);
    h.consensus.fail_configuration("raft is shutdown");

    let (status, body) = h
        .call(
            "POST",
            "/raft/join",
            Some(json!({ "node_id": "node2", "raft_address": "127.0.0.1:4201" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body["error"],
        "failed to get raft configuration: error applying data to raft cluster: raft is shutdown"
    );

    let (status, body) = h
        .call("POST", "/raft/remove", Some(json!({ "node_id": "node1" })))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("failed to get raft configuration:"));
    assert_eq!(h.consensus.changes(), 0);
}

#[tokio::test]
async fn test_join_and_remove_on_leader() {
    let h = Harness::new(RaftState::Leader);

    let (status, body) = h
        .call(
            "POST",
            "/raft/join",
            Some(json!({ "node_id": "node2", "raft_address": "127.0.0.1:4201" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "node node2 at 127.0.0.1:4201 joined successfully");
    assert_eq!(body["data"]["num_peers"], "1");

    let (status, body) = h
        .call("POST", "/raft/remove", Some(json!({ "node_id": "node2" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "node node2 removed successfully");
    assert_eq!(body["data"]["num_peers"], "0");
    assert_eq!(h.consensus.changes(), 2);
}

#[tokio::test]
async fn test_remove_failure_is_wrapped() {
    let h = Harness::new(RaftState::Leader);

    let (status, body) = h
        .call("POST", "/raft/remove", Some(json!({ "node_id": "node9" })))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body["error"],
        "error removing existing node node9: error applying data to raft cluster: unknown server node9"
    );
}

#[tokio::test]
async fn test_membership_on_follower_is_rejected() {
    let h = Harness::new(RaftState::Follower);

    let (status, body) = h
        .call(
            "POST",
            "/raft/join",
            Some(json!({ "node_id": "node2", "raft_address": "127.0.0.1:4201" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "not the leader");

    let (status, _) = h
        .call("POST", "/raft/remove", Some(json!({ "node_id": "node1" })))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(h.consensus.changes(), 0);
}

#[tokio::test]
async fn test_join_requires_fields() {
    let h = Harness::new(RaftState::Leader);

    let (status, body) = h
        .call("POST", "/raft/join", Some(json!({ "node_id": "node2" })))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "invalid request: raft_address is empty");
    assert_eq!(h.consensus.changes(), 0);
}

#[tokio::test]
async fn test_stats_and_health_on_any_node() {
    let h = Harness::new(RaftState::Follower);

    let (status, body) = h.call("GET", "/raft/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "raft cluster status");
    assert_eq!(body["data"]["state"], "Follower");

    let (status, body) = h.call("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["node_id"], "node1");
    assert_eq!(body["version"], dpasswd::VERSION);
}

#[tokio::test]
async fn test_health_reports_stopped_raft() {
    let h = Harness::new(RaftState::Leader);
    *h.consensus.state.lock().unwrap() = RaftState::Shutdown;

    let (status, body) = h.call("GET", "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["state"], "Shutdown");
}

#[tokio::test]
async fn test_export_feeds_restore() {
    let h = Harness::new(RaftState::Leader);
    for (key, value) in [("alice", json!("a")), ("bob", json!({"b": true}))] {
        h.call("POST", "/db", Some(json!({ "key": key, "value": value })))
            .await;
    }

    let state = AppState::new("node1", h.consensus.clone(), h.storage.clone(), TIMEOUT);
    let request = Request::builder()
        .uri("/admin/export")
        .body(Body::empty())
        .unwrap();
    let response = create_router(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let image = to_bytes(response.into_body(), usize::MAX).await.unwrap();

    let copy = Fsm::new(Storage::temporary().unwrap());
    let restored = copy
        .restore(Box::new(std::io::Cursor::new(image.to_vec())))
        .unwrap();
    assert_eq!(restored, 2);
    assert_eq!(copy.storage().get("bob").unwrap(), json!({"b": true}));
}
