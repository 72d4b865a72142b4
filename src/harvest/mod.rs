pub mod heap;
pub mod metrics;
pub mod reservoir;
pub mod rules;

use std::time::SystemTime;

use serde_json::value::RawValue;
use tracing::warn;

use crate::config::{HarvestConfig, HarvestLimits};

use self::heap::TopHeap;
use self::metrics::MetricTable;
use self::reservoir::SamplingReservoir;

/// The data kinds a harvest can deliver, each mapping to one backend command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Metrics,
    AnalyticEvents,
    CustomEvents,
    ErrorEvents,
    SpanEvents,
    LogEvents,
    ErrorTraces,
    SlowQueries,
    TxnTraces,
}

impl DataKind {
    /// Short label for logging and counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Metrics => "metrics",
            DataKind::AnalyticEvents => "analytic_events",
            DataKind::CustomEvents => "custom_events",
            DataKind::ErrorEvents => "error_events",
            DataKind::SpanEvents => "span_events",
            DataKind::LogEvents => "log_events",
            DataKind::ErrorTraces => "error_traces",
            DataKind::SlowQueries => "slow_queries",
            DataKind::TxnTraces => "txn_traces",
        }
    }
}

/// Scheduler granularity: either everything at once, the default group
/// (metrics, traces, log events), or one independently cadenced event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HarvestKind {
    All,
    Default,
    AnalyticEvents,
    CustomEvents,
    ErrorEvents,
    SpanEvents,
}

impl HarvestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarvestKind::All => "all",
            HarvestKind::Default => "default",
            HarvestKind::AnalyticEvents => "analytic_events",
            HarvestKind::CustomEvents => "custom_events",
            HarvestKind::ErrorEvents => "error_events",
            HarvestKind::SpanEvents => "span_events",
        }
    }
}

/// Effective container capacities for one Run: local configuration after
/// clamping by whatever the backend negotiated at connect time.
#[derive(Debug, Clone, Copy)]
pub struct HarvestCaps {
    pub events: HarvestLimits,
    pub max_metrics: usize,
    pub max_txn_traces: usize,
    pub max_slow_queries: usize,
    pub max_error_traces: usize,
}

impl HarvestCaps {
    pub fn from_config(cfg: &HarvestConfig) -> Self {
        Self {
            events: cfg.limits,
            max_metrics: cfg.max_metrics,
            max_txn_traces: cfg.max_txn_traces,
            max_slow_queries: cfg.max_slow_queries,
            max_error_traces: cfg.max_error_traces,
        }
    }
}

/// A container drained for delivery that is eligible to be merged back
/// should the delivery fail with a save-and-retry classification.
#[derive(Debug)]
pub enum RetryContainer {
    Metrics(MetricTable),
    Events(DataKind, SamplingReservoir),
}

/// One serialized body ready for a backend data command.
#[derive(Debug)]
pub struct HarvestPayload {
    pub kind: DataKind,
    pub body: Vec<u8>,
    /// Present for additive containers (metrics, event reservoirs); trace
    /// heaps are point-in-time diagnostics and are never retried.
    pub retry: Option<RetryContainer>,
}

/// Per-transaction submission from one instrumented process.
///
/// Metric names have not yet been pushed through the rename rules; the
/// processor applies them before this data reaches a Harvest.
#[derive(Debug)]
pub struct TxnData {
    /// Transaction name, for logging.
    pub name: String,
    pub metrics: MetricTable,
    pub analytic_event: Option<(f32, Box<RawValue>)>,
    pub custom_events: Vec<(f32, Box<RawValue>)>,
    pub error_events: Vec<(f32, Box<RawValue>)>,
    pub span_events: Vec<(f32, Box<RawValue>)>,
    pub log_events: Vec<(f32, Box<RawValue>)>,
    pub error_trace: Option<(u64, Box<RawValue>)>,
    pub slow_queries: Vec<(u64, Box<RawValue>)>,
    pub txn_trace: Option<(u64, Box<RawValue>)>,
}

impl TxnData {
    /// An empty submission carrying only a name and an empty metric table.
    pub fn new(name: impl Into<String>, period_start: SystemTime) -> Self {
        Self {
            name: name.into(),
            metrics: MetricTable::new(usize::MAX, period_start),
            analytic_event: None,
            custom_events: Vec::new(),
            error_events: Vec::new(),
            span_events: Vec::new(),
            log_events: Vec::new(),
            error_trace: None,
            slow_queries: Vec::new(),
            txn_trace: None,
        }
    }
}

/// All aggregation containers for one Run over one reporting interval.
///
/// Containers are replaced wholesale (never mutated in place) at each
/// harvest boundary per kind; a drained container is exclusively owned by
/// its delivery task from the moment of the swap.
#[derive(Debug)]
pub struct Harvest {
    caps: HarvestCaps,
    pub metrics: MetricTable,
    pub error_traces: TopHeap,
    pub slow_queries: TopHeap,
    pub txn_traces: TopHeap,
    pub analytic_events: SamplingReservoir,
    pub custom_events: SamplingReservoir,
    pub error_events: SamplingReservoir,
    pub span_events: SamplingReservoir,
    pub log_events: SamplingReservoir,
}

impl Harvest {
    /// Creates a fresh harvest with all containers empty.
    pub fn new(caps: HarvestCaps, now: SystemTime) -> Self {
        Self {
            caps,
            metrics: MetricTable::new(caps.max_metrics, now),
            error_traces: TopHeap::new(caps.max_error_traces),
            slow_queries: TopHeap::new(caps.max_slow_queries),
            txn_traces: TopHeap::new(caps.max_txn_traces),
            analytic_events: SamplingReservoir::new(caps.events.analytic_events),
            custom_events: SamplingReservoir::new(caps.events.custom_events),
            error_events: SamplingReservoir::new(caps.events.error_events),
            span_events: SamplingReservoir::new(caps.events.span_events),
            log_events: SamplingReservoir::new(caps.events.log_events),
        }
    }

    /// Merges one transaction's data. `metrics` is the submission's table
    /// after rule application; the rest comes straight from `txn`.
    pub fn merge_txn(&mut self, metrics: MetricTable, txn: TxnData) {
        self.metrics.merge(metrics);

        if let Some((priority, data)) = txn.analytic_event {
            self.analytic_events.observe(data, priority);
        }
        for (priority, data) in txn.custom_events {
            self.custom_events.observe(data, priority);
        }
        for (priority, data) in txn.error_events {
            self.error_events.observe(data, priority);
        }
        for (priority, data) in txn.span_events {
            self.span_events.observe(data, priority);
        }
        for (priority, data) in txn.log_events {
            self.log_events.observe(data, priority);
        }

        if let Some((magnitude, data)) = txn.error_trace {
            self.error_traces.observe(magnitude, data);
        }
        for (magnitude, data) in txn.slow_queries {
            self.slow_queries.observe(magnitude, data);
        }
        if let Some((magnitude, data)) = txn.txn_trace {
            self.txn_traces.observe(magnitude, data);
        }
    }

    /// Merges a failed-delivery container back, honoring its retry budget.
    /// Returns false when the container was dropped instead.
    pub fn merge_back(&mut self, retry: RetryContainer) -> bool {
        match retry {
            RetryContainer::Metrics(table) => self.metrics.merge_failed(table),
            RetryContainer::Events(kind, reservoir) => match kind {
                DataKind::AnalyticEvents => self.analytic_events.merge_failed(reservoir),
                DataKind::CustomEvents => self.custom_events.merge_failed(reservoir),
                DataKind::ErrorEvents => self.error_events.merge_failed(reservoir),
                DataKind::SpanEvents => self.span_events.merge_failed(reservoir),
                DataKind::LogEvents => self.log_events.merge_failed(reservoir),
                other => {
                    warn!(kind = other.as_str(), "non-retryable container in merge_back");
                    false
                }
            },
        }
    }

    /// Swaps the containers covered by `kind` for fresh ones and returns the
    /// serialized payloads of the drained containers. Empty containers yield
    /// no payload. The swap happens synchronously; ownership of each drained
    /// container moves into the returned payloads.
    pub fn swap_out(
        &mut self,
        kind: HarvestKind,
        run_id: &str,
        now: SystemTime,
    ) -> Vec<HarvestPayload> {
        let mut payloads = Vec::new();

        if matches!(kind, HarvestKind::All | HarvestKind::Default) {
            self.swap_metrics(run_id, now, &mut payloads);
            self.swap_traces(run_id, &mut payloads);
            self.swap_events(DataKind::LogEvents, run_id, &mut payloads);
        }

        match kind {
            HarvestKind::All => {
                self.swap_events(DataKind::AnalyticEvents, run_id, &mut payloads);
                self.swap_events(DataKind::CustomEvents, run_id, &mut payloads);
                self.swap_events(DataKind::ErrorEvents, run_id, &mut payloads);
                self.swap_events(DataKind::SpanEvents, run_id, &mut payloads);
            }
            HarvestKind::AnalyticEvents => {
                self.swap_events(DataKind::AnalyticEvents, run_id, &mut payloads);
            }
            HarvestKind::CustomEvents => {
                self.swap_events(DataKind::CustomEvents, run_id, &mut payloads);
            }
            HarvestKind::ErrorEvents => {
                self.swap_events(DataKind::ErrorEvents, run_id, &mut payloads);
            }
            HarvestKind::SpanEvents => {
                self.swap_events(DataKind::SpanEvents, run_id, &mut payloads);
            }
            HarvestKind::Default => {}
        }

        payloads
    }

    fn swap_metrics(&mut self, run_id: &str, now: SystemTime, out: &mut Vec<HarvestPayload>) {
        if self.metrics.is_empty() {
            return;
        }

        let drained = std::mem::replace(
            &mut self.metrics,
            MetricTable::new(self.caps.max_metrics, now),
        );

        if let Some(body) = drained.payload(run_id, now) {
            out.push(HarvestPayload {
                kind: DataKind::Metrics,
                body,
                retry: Some(RetryContainer::Metrics(drained)),
            });
        }
    }

    fn swap_events(&mut self, kind: DataKind, run_id: &str, out: &mut Vec<HarvestPayload>) {
        let (slot, capacity) = match kind {
            DataKind::AnalyticEvents => {
                (&mut self.analytic_events, self.caps.events.analytic_events)
            }
            DataKind::CustomEvents => (&mut self.custom_events, self.caps.events.custom_events),
            DataKind::ErrorEvents => (&mut self.error_events, self.caps.events.error_events),
            DataKind::SpanEvents => (&mut self.span_events, self.caps.events.span_events),
            DataKind::LogEvents => (&mut self.log_events, self.caps.events.log_events),
            _ => return,
        };

        if slot.is_empty() {
            return;
        }

        let drained = std::mem::replace(slot, SamplingReservoir::new(capacity));

        if let Some(body) = drained.payload(run_id) {
            out.push(HarvestPayload {
                kind,
                body,
                retry: Some(RetryContainer::Events(kind, drained)),
            });
        }
    }

    fn swap_traces(&mut self, run_id: &str, out: &mut Vec<HarvestPayload>) {
        let caps = self.caps;

        for (kind, capacity) in [
            (DataKind::ErrorTraces, caps.max_error_traces),
            (DataKind::SlowQueries, caps.max_slow_queries),
            (DataKind::TxnTraces, caps.max_txn_traces),
        ] {
            let slot = match kind {
                DataKind::ErrorTraces => &mut self.error_traces,
                DataKind::SlowQueries => &mut self.slow_queries,
                _ => &mut self.txn_traces,
            };

            if slot.is_empty() {
                continue;
            }

            let drained = std::mem::replace(slot, TopHeap::new(capacity));
            let bodies: Vec<Box<RawValue>> =
                drained.into_entries().into_iter().map(|e| e.data).collect();

            match serde_json::to_vec(&(run_id, &bodies)) {
                Ok(body) => out.push(HarvestPayload {
                    kind,
                    body,
                    retry: None,
                }),
                Err(e) => warn!(kind = kind.as_str(), error = %e, "serializing trace payload failed"),
            }
        }
    }

    /// True when every container is empty.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
            && self.error_traces.is_empty()
            && self.slow_queries.is_empty()
            && self.txn_traces.is_empty()
            && self.analytic_events.is_empty()
            && self.custom_events.is_empty()
            && self.error_events.is_empty()
            && self.span_events.is_empty()
            && self.log_events.is_empty()
    }
}
