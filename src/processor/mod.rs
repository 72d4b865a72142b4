pub(crate) mod app_harvest;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::value::RawValue;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::{AppInfo, AppKey, AppState, Application};
use crate::backend::handshake::{self, ConnectOutcome, HandshakeConfig};
use crate::backend::{classify, BackendClient, BackendError, Command, CommandName, FailureClass};
use crate::config::Config;
use crate::export::HealthMetrics;
use crate::harvest::rules::MetricRules;
use crate::harvest::{
    DataKind, Harvest, HarvestCaps, HarvestKind, HarvestPayload, RetryContainer, TxnData,
};
use crate::scheduler::{self, HarvestScheduler};
use crate::utilization::{self, Utilization};

use self::app_harvest::{AppHarvest, SpanSink};

/// Reply to an app-info request: the application's current state plus
/// everything the agent needs to configure itself.
#[derive(Debug, Clone)]
pub struct AppInfoReply {
    pub state: AppState,
    pub connect_reply: Option<Vec<u8>>,
    pub security_policies: Option<Vec<u8>>,
    pub connect_timestamp: Option<u64>,
    pub harvest_frequency: Option<u64>,
    pub sampling_target: Option<u64>,
    /// Present only when the request carried a run id: whether that id
    /// still names the live Run.
    pub run_id_valid: Option<bool>,
}

/// A batch of span events submitted for one Run.
#[derive(Debug)]
pub struct SpanBatch {
    pub run_id: String,
    pub spans: Vec<(f32, Box<RawValue>)>,
}

/// Request/reply traffic. Served with priority over everything else.
enum Request {
    AppInfo {
        run_id: Option<String>,
        info: AppInfo,
        reply: oneshot::Sender<AppInfoReply>,
    },
}

/// Fire-and-forget traffic and internal task results.
enum Message {
    TxnData {
        run_id: String,
        data: TxnData,
    },
    SpanBatch(SpanBatch),
    HarvestTick {
        run_id: String,
        kind: HarvestKind,
    },
    ConnectResult {
        key: AppKey,
        outcome: Result<ConnectOutcome, BackendError>,
    },
    DeliveryResult {
        run_id: String,
        kind: DataKind,
        status: Option<u16>,
        retry: Option<RetryContainer>,
    },
    UtilizationReady(Utilization),
}

/// Follow-up work computed while registry entries were borrowed.
enum PostAction {
    None,
    Reconnect(AppKey),
}

/// Handle for submitting work to a running processor. This is the entire
/// inbound surface: app-info (request/reply), transaction data and span
/// batches (fire and forget), and shutdown.
pub struct ProcessorHandle {
    req_tx: mpsc::Sender<Request>,
    msg_tx: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl ProcessorHandle {
    /// Submits application info and waits for the state reply.
    pub async fn app_info(&self, run_id: Option<String>, info: AppInfo) -> Result<AppInfoReply> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.req_tx
            .send(Request::AppInfo {
                run_id,
                info,
                reply: reply_tx,
            })
            .await
            .ok()
            .context("processor stopped")?;

        reply_rx.await.context("processor dropped app-info reply")
    }

    /// Submits transaction data for a Run. Returns false when the queue is
    /// full or the processor has stopped; the data is dropped either way.
    pub fn submit_txn(&self, run_id: String, data: TxnData) -> bool {
        self.msg_tx
            .try_send(Message::TxnData { run_id, data })
            .is_ok()
    }

    /// Submits a span batch. Returns false when the queue is full or the
    /// processor has stopped.
    pub fn submit_spans(&self, batch: SpanBatch) -> bool {
        self.msg_tx.try_send(Message::SpanBatch(batch)).is_ok()
    }

    /// Stops intake, then synchronously harvests every live Run before
    /// returning. No data queued before this call is lost.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            warn!(error = %e, "processor join failed");
        }
    }
}

/// Single-consumer actor owning the application and run registries.
///
/// Every mutation of shared aggregation state happens inside `run`; timers,
/// network calls, and ingestion talk to it exclusively through the two
/// mailboxes. App-info requests outrank all other traffic.
pub struct Processor {
    cfg: Config,
    client: Arc<dyn BackendClient>,
    health: Arc<HealthMetrics>,
    apps: HashMap<AppKey, Application>,
    runs: HashMap<String, AppHarvest>,
    utilization: Option<Utilization>,
    msg_tx: mpsc::Sender<Message>,
}

impl Processor {
    /// Spawns the actor and the one-time host-facts gather task.
    pub fn spawn(
        cfg: Config,
        client: Arc<dyn BackendClient>,
        health: Arc<HealthMetrics>,
    ) -> ProcessorHandle {
        let (req_tx, req_rx) = mpsc::channel(64);
        let (msg_tx, msg_rx) = mpsc::channel(1024);
        let shutdown = CancellationToken::new();

        let processor = Processor {
            cfg,
            client,
            health,
            apps: HashMap::new(),
            runs: HashMap::new(),
            utilization: None,
            msg_tx: msg_tx.clone(),
        };

        // Host facts are gathered exactly once; connects wait for them.
        {
            let msg_tx = msg_tx.clone();
            tokio::spawn(async move {
                if let Ok(util) = tokio::task::spawn_blocking(utilization::gather).await {
                    let _ = msg_tx.send(Message::UtilizationReady(util)).await;
                }
            });
        }

        let join = tokio::spawn(processor.run(req_rx, msg_rx, shutdown.clone()));

        ProcessorHandle {
            req_tx,
            msg_tx,
            shutdown,
            join,
        }
    }

    async fn run(
        mut self,
        mut req_rx: mpsc::Receiver<Request>,
        mut msg_rx: mpsc::Receiver<Message>,
        shutdown: CancellationToken,
    ) {
        let sweep_period = self
            .cfg
            .app_inactivity_timeout
            .map_or(Duration::from_secs(3600), |t| t.max(Duration::from_secs(1)));
        let mut sweep = tokio::time::interval(sweep_period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sweep.tick().await;

        loop {
            tokio::select! {
                biased;

                Some(request) = req_rx.recv() => {
                    self.handle_request(request);
                }

                Some(message) = msg_rx.recv() => {
                    self.handle_message(message);
                }

                _ = sweep.tick(), if self.cfg.app_inactivity_timeout.is_some() => {
                    self.sweep_inactive();
                }

                _ = shutdown.cancelled() => break,
            }
        }

        // Stop intake: senders now fail, buffered traffic still drains.
        req_rx.close();
        msg_rx.close();

        while let Some(request) = req_rx.recv().await {
            self.handle_request(request);
        }
        while let Some(message) = msg_rx.recv().await {
            self.handle_message(message);
        }

        self.final_harvest().await;

        info!("processor stopped");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::AppInfo {
                run_id,
                info,
                reply,
            } => {
                let response = self.handle_app_info(run_id, info);
                let _ = reply.send(response);
            }
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::TxnData { run_id, data } => self.handle_txn_data(run_id, data),
            Message::SpanBatch(batch) => self.handle_span_batch(batch),
            Message::HarvestTick { run_id, kind } => self.handle_harvest_tick(run_id, kind),
            Message::ConnectResult { key, outcome } => self.handle_connect_result(key, outcome),
            Message::DeliveryResult {
                run_id,
                kind,
                status,
                retry,
            } => self.handle_delivery_result(run_id, kind, status, retry),
            Message::UtilizationReady(util) => self.handle_utilization_ready(util),
        }
    }

    // --- App info and connect ---

    fn handle_app_info(&mut self, query_run_id: Option<String>, info: AppInfo) -> AppInfoReply {
        let key = info.key();

        if !self.apps.contains_key(&key) {
            info!(
                app = %info.app_name,
                host = %info.host,
                "registering application",
            );
            self.apps.insert(key.clone(), Application::new(info));
            self.health.applications.set(self.apps.len() as f64);
        }

        let eligible = {
            let app = self.apps.get_mut(&key).expect("registered above");
            app.last_activity = Instant::now();
            app.connect_eligible(self.cfg.backend.connect_backoff, self.utilization.is_some())
        };

        if eligible {
            self.spawn_connect(&key);
        }

        let app = self.apps.get(&key).expect("registered above");

        AppInfoReply {
            state: app.state,
            connect_reply: app.reply_bytes.clone(),
            security_policies: app.policy_bytes.clone(),
            connect_timestamp: app.connect_time.map(unix_seconds),
            harvest_frequency: app
                .reply
                .as_ref()
                .map(|_| self.cfg.harvest.report_period.as_secs()),
            sampling_target: app.reply.as_ref().and_then(|r| r.sampling_target),
            run_id_valid: query_run_id
                .map(|id| app.run_id.as_deref() == Some(id.as_str())),
        }
    }

    fn spawn_connect(&mut self, key: &AppKey) {
        let info = {
            let Some(app) = self.apps.get_mut(key) else {
                return;
            };
            app.connect_in_flight = true;
            app.last_connect_attempt = Some(Instant::now());
            app.info.clone()
        };

        self.health.connect_attempts.inc();

        let client = Arc::clone(&self.client);
        let msg_tx = self.msg_tx.clone();
        let key = key.clone();
        let utilization = self.utilization.clone();
        let handshake_cfg = HandshakeConfig {
            default_host: self.cfg.backend.host.clone(),
            limits: self.cfg.harvest.limits,
            report_period: self.cfg.harvest.report_period,
        };
        let pid = std::process::id();

        tokio::spawn(async move {
            let outcome = handshake::connect_attempt(
                client.as_ref(),
                &handshake_cfg,
                &info,
                utilization.as_ref(),
                pid,
            )
            .await;

            let _ = msg_tx.send(Message::ConnectResult { key, outcome }).await;
        });
    }

    fn handle_connect_result(
        &mut self,
        key: AppKey,
        outcome: Result<ConnectOutcome, BackendError>,
    ) {
        let action = match outcome {
            Ok(outcome) => self.install_run(&key, outcome),
            Err(e) => self.record_connect_failure(&key, e),
        };

        if let PostAction::Reconnect(key) = action {
            let eligible = self.apps.get(&key).is_some_and(|app| {
                app.connect_eligible(self.cfg.backend.connect_backoff, self.utilization.is_some())
            });
            if eligible {
                self.spawn_connect(&key);
            }
        }
    }

    fn install_run(&mut self, key: &AppKey, outcome: ConnectOutcome) -> PostAction {
        let rules = match &outcome.reply.metric_name_rules {
            Some(value) => MetricRules::from_json(value).unwrap_or_else(|e| {
                warn!(error = %e, "metric rules rejected, renaming disabled");
                MetricRules::empty()
            }),
            None => MetricRules::empty(),
        };

        let reply = Arc::new(outcome.reply);
        let run_id = reply.agent_run_id.clone();

        let (credential, trace_endpoint) = {
            let Some(app) = self.apps.get_mut(key) else {
                return PostAction::None;
            };
            app.connect_in_flight = false;
            app.state = AppState::Connected;
            app.connect_time = Some(SystemTime::now());
            app.reply = Some(Arc::clone(&reply));
            app.reply_bytes = Some(outcome.reply_bytes);
            app.policy_bytes = outcome.policy_bytes;
            app.run_id = Some(run_id.clone());
            (app.info.credential.clone(), app.info.trace_endpoint.clone())
        };

        self.health.connects.inc();

        let caps = HarvestCaps {
            events: reply.clamped_limits(self.cfg.harvest.limits),
            max_metrics: self.cfg.harvest.max_metrics,
            max_txn_traces: self.cfg.harvest.max_txn_traces,
            max_slow_queries: self.cfg.harvest.max_slow_queries,
            max_error_traces: self.cfg.harvest.max_error_traces,
        };
        let harvest = Harvest::new(caps, SystemTime::now());

        let timers = scheduler::cadence_timers(&reply, self.cfg.harvest.report_period);
        let (sched, tick_rx) = HarvestScheduler::spawn(timers);

        let span_sink = trace_endpoint.map(|endpoint| {
            SpanSink::spawn(
                Arc::clone(&self.client),
                endpoint,
                credential.clone(),
                run_id.clone(),
            )
        });

        let binding = AppHarvest::new(
            key.clone(),
            run_id.clone(),
            outcome.host,
            credential,
            harvest,
            rules,
            sched,
            tick_rx,
            self.msg_tx.clone(),
            span_sink,
        );

        if let Some(stale) = self.runs.insert(run_id, binding) {
            warn!(run_id = %stale.run_id, "replacing stale run binding");
            tokio::spawn(async move {
                stale.close().await;
            });
        }
        self.health.active_runs.set(self.runs.len() as f64);

        PostAction::None
    }

    fn record_connect_failure(&mut self, key: &AppKey, error: BackendError) -> PostAction {
        let label = failure_label(&error);
        self.health.connect_failures.with_label_values(&[label]).inc();

        let Some(app) = self.apps.get_mut(key) else {
            return PostAction::None;
        };
        app.connect_in_flight = false;

        match error {
            BackendError::InvalidCredential => {
                warn!(app = %app.info.app_name, "connect rejected: invalid credential");
                app.state = AppState::InvalidLicense;
                PostAction::None
            }
            BackendError::Disconnect => {
                warn!(app = %app.info.app_name, "connect rejected permanently");
                app.state = AppState::Disconnected;
                PostAction::None
            }
            BackendError::PolicyMismatch(names) => {
                warn!(
                    app = %app.info.app_name,
                    policies = ?names,
                    "connect aborted: security policy mismatch",
                );
                app.state = AppState::InvalidSecurityPolicies;
                PostAction::None
            }
            BackendError::Restart => {
                // Stale-run answer during connect: clear the backoff and go
                // straight back around.
                debug!(app = %app.info.app_name, "connect answered with restart");
                app.reset_for_restart();
                PostAction::Reconnect(key.clone())
            }
            e => {
                // Transient: remain Unknown, next attempt is backoff-gated.
                debug!(app = %app.info.app_name, error = %e, "connect attempt failed");
                PostAction::None
            }
        }
    }

    fn handle_utilization_ready(&mut self, util: Utilization) {
        debug!(
            hostname = %util.hostname,
            cores = util.logical_processors,
            "host facts gathered",
        );
        self.utilization = Some(util);

        // Applications registered before the facts arrived can connect now.
        let backoff = self.cfg.backend.connect_backoff;
        let keys: Vec<AppKey> = self
            .apps
            .iter()
            .filter(|(_, app)| app.connect_eligible(backoff, true))
            .map(|(key, _)| key.clone())
            .collect();

        for key in keys {
            self.spawn_connect(&key);
        }
    }

    // --- Telemetry intake ---

    fn handle_txn_data(&mut self, run_id: String, data: TxnData) {
        let Some(run) = self.runs.get_mut(&run_id) else {
            self.health.txns_unknown_run.inc();
            debug!(run_id = %run_id, "transaction data for unknown run");
            return;
        };

        let (metrics, ignored) = data.metrics.apply_rules(&run.rules);
        if !ignored.is_empty() {
            self.health.txns_ignored.inc();
            debug!(
                txn = %data.name,
                ignored = ?ignored,
                "transaction dropped by ignore rule",
            );
            return;
        }

        run.harvest.merge_txn(metrics, data);

        if let Some(app) = self.apps.get_mut(&run.key) {
            app.last_activity = Instant::now();
        }
    }

    fn handle_span_batch(&mut self, batch: SpanBatch) {
        let Some(run) = self.runs.get_mut(&batch.run_id) else {
            self.health.txns_unknown_run.inc();
            debug!(run_id = %batch.run_id, "span batch for unknown run");
            return;
        };

        if let Some(sink) = &run.span_sink {
            if !sink.try_forward(batch) {
                warn!(run_id = %run.run_id, "span sink full, batch dropped");
            }
            return;
        }

        for (priority, span) in batch.spans {
            run.harvest.span_events.observe(span, priority);
        }
    }

    // --- Harvest and delivery ---

    fn handle_harvest_tick(&mut self, run_id: String, kind: HarvestKind) {
        let Some(run) = self.runs.get_mut(&run_id) else {
            return;
        };

        let payloads = run.harvest.swap_out(kind, &run_id, SystemTime::now());
        if payloads.is_empty() {
            return;
        }

        self.health
            .harvests
            .with_label_values(&[kind.as_str()])
            .inc();

        let host = run.host.clone();
        let credential = run.credential.clone();
        for payload in payloads {
            self.spawn_delivery(run_id.clone(), host.clone(), credential.clone(), payload);
        }
    }

    fn spawn_delivery(
        &self,
        run_id: String,
        host: String,
        credential: String,
        payload: HarvestPayload,
    ) {
        let client = Arc::clone(&self.client);
        let msg_tx = self.msg_tx.clone();
        let kind = payload.kind;

        tokio::spawn(async move {
            let command = Command {
                name: CommandName::for_data_kind(kind),
                host,
                credential,
                run_id: Some(run_id.clone()),
                body: payload.body,
            };

            let status = match client.execute(command).await {
                Ok(response) => Some(response.status),
                Err(e) => {
                    debug!(run_id = %run_id, kind = kind.as_str(), error = %e, "delivery failed in transport");
                    None
                }
            };

            let result = Message::DeliveryResult {
                run_id,
                kind,
                status,
                retry: payload.retry,
            };
            if msg_tx.send(result).await.is_err() {
                debug!("processor stopped, delivery result dropped");
            }
        });
    }

    fn handle_delivery_result(
        &mut self,
        run_id: String,
        kind: DataKind,
        status: Option<u16>,
        retry: Option<RetryContainer>,
    ) {
        let class = match status {
            Some(code) => {
                self.health
                    .delivery_status
                    .with_label_values(&[&code.to_string()])
                    .inc();
                classify(code)
            }
            // No status proves nothing was ingested; preserving the data is
            // the conservative choice.
            None => FailureClass {
                save: true,
                ..FailureClass::default()
            },
        };

        if class.success {
            debug!(run_id = %run_id, kind = kind.as_str(), "delivery accepted");
            return;
        }

        if class.disconnect {
            warn!(run_id = %run_id, "backend disconnected application");
            self.terminate_run(&run_id, AppState::Disconnected);
            return;
        }

        if class.restart {
            if class.invalid_credential {
                warn!(run_id = %run_id, "delivery rejected: invalid credential");
                self.terminate_run(&run_id, AppState::InvalidLicense);
            } else {
                info!(run_id = %run_id, "backend requested restart");
                self.restart_run(&run_id);
            }
            return;
        }

        if class.save {
            let merged = match (self.runs.get_mut(&run_id), retry) {
                (Some(run), Some(container)) => run.harvest.merge_back(container),
                _ => false,
            };

            if merged {
                self.health.payloads_saved.inc();
                debug!(run_id = %run_id, kind = kind.as_str(), "container saved for retry");
            } else {
                self.health.payloads_dropped.inc();
            }
            return;
        }

        self.health.payloads_dropped.inc();
        debug!(
            run_id = %run_id,
            kind = kind.as_str(),
            status = status.unwrap_or_default(),
            "delivery discarded",
        );
    }

    // --- Run teardown ---

    fn terminate_run(&mut self, run_id: &str, state: AppState) {
        let Some(run) = self.runs.remove(run_id) else {
            return;
        };
        self.health.active_runs.set(self.runs.len() as f64);

        let key = run.key.clone();
        tokio::spawn(async move {
            run.close().await;
        });

        if let Some(app) = self.apps.get_mut(&key) {
            app.state = state;
            app.run_id = None;
            app.reply = None;
            app.reply_bytes = None;
        }
    }

    fn restart_run(&mut self, run_id: &str) {
        let Some(run) = self.runs.remove(run_id) else {
            return;
        };
        self.health.active_runs.set(self.runs.len() as f64);

        let key = run.key.clone();
        tokio::spawn(async move {
            run.close().await;
        });

        if let Some(app) = self.apps.get_mut(&key) {
            app.reset_for_restart();
        }

        let eligible = self.apps.get(&key).is_some_and(|app| {
            app.connect_eligible(self.cfg.backend.connect_backoff, self.utilization.is_some())
        });
        if eligible {
            self.spawn_connect(&key);
        }
    }

    fn sweep_inactive(&mut self) {
        let Some(timeout) = self.cfg.app_inactivity_timeout else {
            return;
        };

        let stale: Vec<AppKey> = self
            .apps
            .iter()
            .filter(|(_, app)| app.last_activity.elapsed() > timeout)
            .map(|(key, _)| key.clone())
            .collect();

        for key in stale {
            let run_id = self.apps.get(&key).and_then(|app| app.run_id.clone());
            if let Some(run_id) = run_id {
                if let Some(run) = self.runs.remove(&run_id) {
                    tokio::spawn(async move {
                        run.close().await;
                    });
                }
            }

            if let Some(app) = self.apps.remove(&key) {
                info!(app = %app.info.app_name, "removing inactive application");
            }
        }

        self.health.applications.set(self.apps.len() as f64);
        self.health.active_runs.set(self.runs.len() as f64);
    }

    // --- Shutdown ---

    /// Final synchronous drain: every live Run's scheduler is stopped, its
    /// harvest swapped out completely, and each payload delivered inline.
    async fn final_harvest(&mut self) {
        let run_ids: Vec<String> = self.runs.keys().cloned().collect();

        for run_id in run_ids {
            let Some(run) = self.runs.remove(&run_id) else {
                continue;
            };

            let host = run.host.clone();
            let credential = run.credential.clone();
            let mut harvest = run.close().await;

            let payloads = harvest.swap_out(HarvestKind::All, &run_id, SystemTime::now());
            for payload in payloads {
                let command = Command {
                    name: CommandName::for_data_kind(payload.kind),
                    host: host.clone(),
                    credential: credential.clone(),
                    run_id: Some(run_id.clone()),
                    body: payload.body,
                };

                match self.client.execute(command).await {
                    Ok(response) if classify(response.status).success => {
                        debug!(run_id = %run_id, kind = payload.kind.as_str(), "final delivery accepted");
                    }
                    Ok(response) => {
                        warn!(
                            run_id = %run_id,
                            kind = payload.kind.as_str(),
                            status = response.status,
                            "final delivery rejected",
                        );
                    }
                    Err(e) => {
                        warn!(
                            run_id = %run_id,
                            kind = payload.kind.as_str(),
                            error = %e,
                            "final delivery failed",
                        );
                    }
                }
            }

            info!(run_id = %run_id, "run drained");
        }
    }
}

fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn failure_label(error: &BackendError) -> &'static str {
    match error {
        BackendError::Transport(_) => "transport",
        BackendError::Admission => "admission",
        BackendError::Parse(_) => "parse",
        BackendError::PolicyMismatch(_) => "policy_mismatch",
        BackendError::InvalidCredential => "invalid_credential",
        BackendError::Disconnect => "disconnect",
        BackendError::Restart => "restart",
        BackendError::Status(_) => "status",
    }
}
