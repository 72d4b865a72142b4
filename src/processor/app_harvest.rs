use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::AppKey;
use crate::backend::{BackendClient, Command, CommandName};
use crate::harvest::rules::MetricRules;
use crate::harvest::Harvest;
use crate::scheduler::{HarvestScheduler, HarvestTick};

use super::{Message, SpanBatch};

/// How long a closing span sink gets to drain before it is abandoned.
const SINK_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Everything bound to one connected Run: its harvest containers, compiled
/// rename rules, scheduler, delivery target, and the optional streaming
/// span sink.
///
/// Two tasks run for the lifetime of the binding: the scheduler's timers
/// and a relay that turns ticks into harvest-request messages on the
/// processor mailbox. Neither touches the harvest directly.
pub struct AppHarvest {
    pub key: AppKey,
    pub run_id: String,
    /// Post-redirect delivery host.
    pub host: String,
    pub credential: String,
    pub harvest: Harvest,
    pub rules: MetricRules,
    pub span_sink: Option<SpanSink>,
    scheduler: HarvestScheduler,
    relay: JoinHandle<()>,
}

impl AppHarvest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: AppKey,
        run_id: String,
        host: String,
        credential: String,
        harvest: Harvest,
        rules: MetricRules,
        scheduler: HarvestScheduler,
        mut tick_rx: mpsc::Receiver<HarvestTick>,
        msg_tx: mpsc::Sender<Message>,
        span_sink: Option<SpanSink>,
    ) -> Self {
        let relay_run_id = run_id.clone();
        let relay = tokio::spawn(async move {
            while let Some(HarvestTick { kind }) = tick_rx.recv().await {
                let message = Message::HarvestTick {
                    run_id: relay_run_id.clone(),
                    kind,
                };
                if msg_tx.send(message).await.is_err() {
                    return;
                }
            }
        });

        Self {
            key,
            run_id,
            host,
            credential,
            harvest,
            rules,
            span_sink,
            scheduler,
            relay,
        }
    }

    /// Tears the binding down: scheduler cancellation handshake first, then
    /// the tick relay (its queue closes once every timer acknowledged), then
    /// a bounded-grace sink shutdown. No task survives this call and no
    /// message is emitted after it returns. The harvest comes back to the
    /// caller for a final drain or disposal.
    pub async fn close(self) -> Harvest {
        self.scheduler.shutdown().await;

        if let Err(e) = self.relay.await {
            warn!(run_id = %self.run_id, error = %e, "tick relay join failed");
        }

        if let Some(sink) = self.span_sink {
            sink.close().await;
        }

        debug!(run_id = %self.run_id, "run binding closed");

        self.harvest
    }
}

/// Streaming span forwarder for applications with a trace endpoint.
///
/// Batches bypass the harvest cycle: a bounded queue feeds one forwarder
/// task that ships each batch as a span_event_data command on arrival.
/// Delivery failures on this path are logged and dropped.
pub struct SpanSink {
    tx: mpsc::Sender<SpanBatch>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SpanSink {
    pub fn spawn(
        client: Arc<dyn BackendClient>,
        host: String,
        credential: String,
        run_id: String,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<SpanBatch>(64);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        // Drain whatever is queued, then stop.
                        while let Ok(batch) = rx.try_recv() {
                            ship(client.as_ref(), &host, &credential, &run_id, batch).await;
                        }
                        return;
                    }
                    batch = rx.recv() => match batch {
                        Some(batch) => {
                            ship(client.as_ref(), &host, &credential, &run_id, batch).await;
                        }
                        None => return,
                    }
                }
            }
        });

        Self { tx, cancel, task }
    }

    /// Enqueues a batch without blocking. Returns false when the sink queue
    /// is full and the batch was dropped.
    pub fn try_forward(&self, batch: SpanBatch) -> bool {
        self.tx.try_send(batch).is_ok()
    }

    /// Bounded-grace shutdown: queued batches get one drain pass, then the
    /// task is abandoned if it overruns the grace period.
    pub async fn close(self) {
        self.cancel.cancel();
        drop(self.tx);

        if tokio::time::timeout(SINK_CLOSE_GRACE, self.task).await.is_err() {
            warn!("span sink did not stop within grace period");
        }
    }
}

/// Ships one span batch in the reservoir envelope.
async fn ship(
    client: &dyn BackendClient,
    host: &str,
    credential: &str,
    run_id: &str,
    batch: SpanBatch,
) {
    let count = batch.spans.len();
    let bodies: Vec<_> = batch.spans.into_iter().map(|(_, span)| span).collect();

    let properties = serde_json::json!({
        "reservoir_size": count,
        "events_seen": count,
    });

    let body = match serde_json::to_vec(&(run_id, properties, bodies)) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "serializing span batch failed");
            return;
        }
    };

    let result = client
        .execute(Command {
            name: CommandName::SpanEventData,
            host: host.to_string(),
            credential: credential.to_string(),
            run_id: Some(run_id.to_string()),
            body,
        })
        .await;

    match result {
        Ok(response) if crate::backend::classify(response.status).success => {
            debug!(count, "span batch streamed");
        }
        Ok(response) => {
            warn!(status = response.status, count, "span batch rejected");
        }
        Err(e) => {
            warn!(error = %e, count, "span batch delivery failed");
        }
    }
}
