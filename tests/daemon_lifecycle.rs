use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use serde_json::value::RawValue;
use serde_json::Value;

use harvestd::app::{AppInfo, AppState};
use harvestd::backend::{BackendClient, BackendError, BackendResponse, Command};
use harvestd::config::Config;
use harvestd::export::HealthMetrics;
use harvestd::harvest::metrics::{MetricData, MetricId};
use harvestd::harvest::TxnData;
use harvestd::processor::{Processor, ProcessorHandle, SpanBatch};

/// Scripted backend: per-method response queues with a generic 200 fallback.
struct MockBackend {
    calls: Mutex<Vec<Command>>,
    scripted: Mutex<HashMap<&'static str, VecDeque<BackendResponse>>>,
}

impl MockBackend {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            scripted: Mutex::new(HashMap::new()),
        }
    }

    fn script(&self, method: &'static str, status: u16, return_value: Value) {
        let body = serde_json::to_vec(&serde_json::json!({"return_value": return_value}))
            .expect("serializes");
        self.scripted
            .lock()
            .expect("lock")
            .entry(method)
            .or_default()
            .push_back(BackendResponse { status, body });
    }

    fn calls_for(&self, method: &str) -> Vec<Command> {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .filter(|c| c.name.as_str() == method)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BackendClient for MockBackend {
    async fn execute(&self, cmd: Command) -> Result<BackendResponse, BackendError> {
        let method = cmd.name.as_str();
        self.calls.lock().expect("lock").push(cmd);

        if let Some(queue) = self.scripted.lock().expect("lock").get_mut(method) {
            if let Some(response) = queue.pop_front() {
                return Ok(response);
            }
        }

        Ok(BackendResponse {
            status: 200,
            body: br#"{"return_value": {}}"#.to_vec(),
        })
    }
}

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.backend.connect_backoff = Duration::from_millis(50);
    cfg.harvest.report_period = Duration::from_millis(100);
    cfg.validate().expect("test config valid");
    cfg
}

fn app_info(name: &str) -> AppInfo {
    AppInfo {
        credential: "0123456789abcdef".to_string(),
        app_name: name.to_string(),
        language: "php".to_string(),
        agent_version: "11.0.0".to_string(),
        host: "worker-1".to_string(),
        display_host: None,
        redirect_host: None,
        high_security: false,
        security_policy_token: String::new(),
        trace_endpoint: None,
        identifier: None,
        settings: Value::Null,
        labels: Value::Null,
        environment: Value::Null,
        metadata: Value::Null,
    }
}

fn raw(s: &str) -> Box<RawValue> {
    RawValue::from_string(s.to_string()).expect("valid json")
}

fn spawn_daemon(backend: Arc<MockBackend>) -> ProcessorHandle {
    let health = Arc::new(HealthMetrics::new("127.0.0.1:0").expect("metrics register"));
    Processor::spawn(test_config(), backend, health)
}

/// Polls app-info until the application reports the wanted state.
async fn wait_for_state(
    processor: &ProcessorHandle,
    info: &AppInfo,
    wanted: AppState,
) -> harvestd::processor::AppInfoReply {
    let deadline = Instant::now() + Duration::from_secs(5);

    loop {
        let reply = processor
            .app_info(None, info.clone())
            .await
            .expect("processor alive");
        if reply.state == wanted {
            return reply;
        }
        assert!(
            Instant::now() < deadline,
            "application never reached {wanted:?}, last state {:?}",
            reply.state,
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_calls(backend: &MockBackend, method: &str, count: usize) -> Vec<Command> {
    let deadline = Instant::now() + Duration::from_secs(5);

    loop {
        let calls = backend.calls_for(method);
        if calls.len() >= count {
            return calls;
        }
        assert!(
            Instant::now() < deadline,
            "never saw {count} {method} calls, got {}",
            calls.len(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn connect_lifecycle_and_run_id_validity() {
    let backend = Arc::new(MockBackend::new());
    backend.script(
        "preconnect",
        200,
        serde_json::json!({"redirect_host": "collector-7.test"}),
    );
    backend.script(
        "connect",
        200,
        serde_json::json!({"agent_run_id": "R1", "sampling_target": 10}),
    );

    let processor = spawn_daemon(Arc::clone(&backend));
    let info = app_info("api");

    // First sight of the application: registered, not yet connected.
    let first = processor
        .app_info(None, info.clone())
        .await
        .expect("processor alive");
    assert!(matches!(first.state, AppState::Unknown | AppState::Connected));
    assert!(first.run_id_valid.is_none());

    // The handshake lands: state flips to Connected and the reply replays.
    let connected = wait_for_state(&processor, &info, AppState::Connected).await;
    let reply_bytes = connected.connect_reply.expect("reply bytes replayed");
    let reply: Value = serde_json::from_slice(&reply_bytes).expect("valid json");
    assert_eq!(reply["agent_run_id"], "R1");
    assert_eq!(connected.sampling_target, Some(10));
    assert!(connected.connect_timestamp.is_some());
    assert!(connected.harvest_frequency.is_some());

    // Connect went to the redirected host.
    let connects = backend.calls_for("connect");
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].host, "collector-7.test");

    // A current run id validates; a stale one does not, and the
    // application stays Connected either way.
    let valid = processor
        .app_info(Some("R1".to_string()), info.clone())
        .await
        .expect("processor alive");
    assert_eq!(valid.run_id_valid, Some(true));
    assert_eq!(valid.state, AppState::Connected);

    let stale = processor
        .app_info(Some("R0".to_string()), info.clone())
        .await
        .expect("processor alive");
    assert_eq!(stale.run_id_valid, Some(false));
    assert_eq!(stale.state, AppState::Connected);

    processor.shutdown().await;
}

#[tokio::test]
async fn custom_events_survive_save_and_retry() {
    let backend = Arc::new(MockBackend::new());
    backend.script("connect", 200, serde_json::json!({"agent_run_id": "R1"}));
    // First custom event delivery fails retryably, the second succeeds.
    backend
        .scripted
        .lock()
        .expect("lock")
        .entry("custom_event_data")
        .or_default()
        .push_back(BackendResponse {
            status: 503,
            body: Vec::new(),
        });

    let processor = spawn_daemon(Arc::clone(&backend));
    let info = app_info("api");
    wait_for_state(&processor, &info, AppState::Connected).await;

    let mut txn = TxnData::new("WebTransaction/index", SystemTime::now());
    txn.custom_events
        .push((0.9, raw(r#"{"type":"MyEvent","n":1}"#)));
    assert!(processor.submit_txn("R1".to_string(), txn));

    // Delivery one: rejected with 503. Delivery two: the same event again,
    // merged back instead of lost.
    let calls = wait_for_calls(&backend, "custom_event_data", 2).await;

    let first: Value = serde_json::from_slice(&calls[0].body).expect("valid json");
    assert_eq!(first[0], "R1");
    assert_eq!(first[1]["events_seen"], 1);
    assert_eq!(first[2].as_array().expect("events").len(), 1);

    let second: Value = serde_json::from_slice(&calls[1].body).expect("valid json");
    assert_eq!(second[1]["events_seen"], 1);
    assert_eq!(second[2].as_array().expect("events").len(), 1);
    assert_eq!(second[2][0]["type"], "MyEvent");

    processor.shutdown().await;
}

#[tokio::test]
async fn shutdown_drains_pending_data() {
    let backend = Arc::new(MockBackend::new());
    backend.script("connect", 200, serde_json::json!({"agent_run_id": "R7"}));

    let processor = spawn_daemon(Arc::clone(&backend));
    let info = app_info("batch-worker");
    wait_for_state(&processor, &info, AppState::Connected).await;

    let mut txn = TxnData::new("OtherTransaction/job", SystemTime::now());
    txn.metrics.add(
        MetricId::unscoped("OtherTransaction/job"),
        MetricData::from_duration(0.5, 0.5),
        true,
    );
    txn.analytic_event = Some((0.7, raw(r#"{"type":"Transaction"}"#)));
    assert!(processor.submit_txn("R7".to_string(), txn));

    // Give the actor a beat to absorb the submission, then stop.
    tokio::time::sleep(Duration::from_millis(30)).await;
    processor.shutdown().await;

    // The final synchronous harvest delivered both containers.
    let metric_calls = backend.calls_for("metric_data");
    assert!(!metric_calls.is_empty(), "metrics drained on shutdown");
    let analytic_calls = backend.calls_for("analytic_event_data");
    assert!(!analytic_calls.is_empty(), "events drained on shutdown");

    let body: Value =
        serde_json::from_slice(&metric_calls.last().expect("call").body).expect("valid json");
    assert_eq!(body[0], "R7");
    let rows = body[3].as_array().expect("metric rows");
    assert!(rows
        .iter()
        .any(|row| row[0]["name"] == "OtherTransaction/job"));
}

#[tokio::test]
async fn spans_land_in_reservoir_without_trace_endpoint() {
    let backend = Arc::new(MockBackend::new());
    backend.script("connect", 200, serde_json::json!({"agent_run_id": "R9"}));

    let processor = spawn_daemon(Arc::clone(&backend));
    let info = app_info("api");
    wait_for_state(&processor, &info, AppState::Connected).await;

    assert!(processor.submit_spans(SpanBatch {
        run_id: "R9".to_string(),
        spans: vec![(0.5, raw(r#"{"type":"Span","name":"GET /"}"#))],
    }));

    let calls = wait_for_calls(&backend, "span_event_data", 1).await;
    let body: Value = serde_json::from_slice(&calls[0].body).expect("valid json");
    assert_eq!(body[0], "R9");
    assert_eq!(body[2][0]["type"], "Span");

    processor.shutdown().await;
}

#[tokio::test]
async fn disconnect_status_terminates_the_run() {
    let backend = Arc::new(MockBackend::new());
    backend.script("connect", 200, serde_json::json!({"agent_run_id": "R2"}));
    backend
        .scripted
        .lock()
        .expect("lock")
        .entry("metric_data")
        .or_default()
        .push_back(BackendResponse {
            status: 410,
            body: Vec::new(),
        });

    let processor = spawn_daemon(Arc::clone(&backend));
    let info = app_info("api");
    wait_for_state(&processor, &info, AppState::Connected).await;

    let mut txn = TxnData::new("WebTransaction/index", SystemTime::now());
    txn.metrics.add(
        MetricId::unscoped("WebTransaction"),
        MetricData::from_count(1.0),
        true,
    );
    assert!(processor.submit_txn("R2".to_string(), txn));

    wait_for_calls(&backend, "metric_data", 1).await;
    let reply = wait_for_state(&processor, &info, AppState::Disconnected).await;

    // Disconnected applications keep answering app-info but carry no reply.
    assert!(reply.connect_reply.is_none());

    processor.shutdown().await;
}
