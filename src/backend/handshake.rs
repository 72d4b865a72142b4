use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use tracing::{debug, info};

use crate::app::AppInfo;
use crate::config::HarvestLimits;
use crate::harvest::HarvestKind;
use crate::utilization::Utilization;

use super::policy::{self, AgreedPolicies, PolicyMenu};
use super::{classify, status_error, BackendClient, BackendError, Command, CommandName};

/// Immutable backend-issued configuration for one Run.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectReply {
    #[serde(deserialize_with = "run_id_from_wire")]
    pub agent_run_id: String,

    #[serde(default)]
    pub event_harvest_config: Option<EventHarvestConfig>,

    /// Metric rename rules in wire form; compiled lazily by the processor.
    #[serde(default)]
    pub metric_name_rules: Option<serde_json::Value>,

    /// Adaptive sampling target (transactions per sampling period).
    #[serde(default)]
    pub sampling_target: Option<u64>,

    #[serde(default)]
    pub sampling_target_period_in_seconds: Option<u64>,
}

/// Backend overrides for event cadence and reservoir capacities.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct EventHarvestConfig {
    #[serde(default)]
    pub report_period_ms: Option<u64>,

    #[serde(default)]
    pub harvest_limits: Option<HarvestLimitsWire>,
}

/// Wire shape of per-kind reservoir capacity overrides.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct HarvestLimitsWire {
    #[serde(default)]
    pub error_event_data: Option<usize>,

    #[serde(default)]
    pub analytic_event_data: Option<usize>,

    #[serde(default)]
    pub custom_event_data: Option<usize>,

    #[serde(default)]
    pub span_event_data: Option<usize>,

    #[serde(default)]
    pub log_event_data: Option<usize>,
}

/// Backends have issued both numeric and string run ids over time; both
/// normalize to a string.
fn run_id_from_wire<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "run id must be string or number, got {other}",
        ))),
    }
}

impl ConnectReply {
    /// Resolves the reporting period for a harvest kind: the backend value
    /// when nonzero, else the daemon default. Zero never escapes.
    pub fn report_period(&self, kind: HarvestKind, default: Duration) -> Duration {
        let event_period = self
            .event_harvest_config
            .and_then(|c| c.report_period_ms)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        match kind {
            HarvestKind::All | HarvestKind::Default => default,
            _ => event_period.unwrap_or(default),
        }
    }

    /// True when every event kind reports on the default cadence, in which
    /// case one unified timer harvests everything.
    pub fn unified_cadence(&self, default: Duration) -> bool {
        self.report_period(HarvestKind::AnalyticEvents, default) == default
    }

    /// Local capacities clamped by whatever the backend negotiated. The
    /// backend can lower a capacity, never raise it.
    pub fn clamped_limits(&self, local: HarvestLimits) -> HarvestLimits {
        let wire = self
            .event_harvest_config
            .and_then(|c| c.harvest_limits)
            .unwrap_or_default();

        HarvestLimits {
            analytic_events: clamp(local.analytic_events, wire.analytic_event_data),
            custom_events: clamp(local.custom_events, wire.custom_event_data),
            error_events: clamp(local.error_events, wire.error_event_data),
            span_events: clamp(local.span_events, wire.span_event_data),
            log_events: clamp(local.log_events, wire.log_event_data),
        }
    }
}

fn clamp(local: usize, wire: Option<usize>) -> usize {
    match wire {
        Some(limit) => local.min(limit),
        None => local,
    }
}

/// Everything a successful handshake yields: the parsed reply, the raw
/// reply bytes for replay to agents, the agreed policy JSON, and the
/// post-redirect host for all subsequent commands.
#[derive(Debug)]
pub struct ConnectOutcome {
    pub reply: ConnectReply,
    pub reply_bytes: Vec<u8>,
    pub policy_bytes: Option<Vec<u8>>,
    pub host: String,
}

/// Daemon-side parameters of the handshake.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub default_host: String,
    pub limits: HarvestLimits,
    pub report_period: Duration,
}

#[derive(Serialize)]
struct PreconnectPayload<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    security_policies_token: &'a str,
    high_security: bool,
}

#[derive(Deserialize, Default)]
struct PreconnectReply {
    #[serde(default)]
    redirect_host: String,
    #[serde(default)]
    security_policies: PolicyMenu,
}

#[derive(Serialize)]
struct EventHarvestConfigPayload {
    report_period_ms: u64,
    harvest_limits: HarvestLimitsPayload,
}

#[derive(Serialize)]
struct HarvestLimitsPayload {
    error_event_data: usize,
    analytic_event_data: usize,
    custom_event_data: usize,
    span_event_data: usize,
    log_event_data: usize,
}

#[derive(Serialize)]
struct ConnectPayload<'a> {
    pid: u32,
    language: &'a str,
    agent_version: &'a str,
    host: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_host: Option<&'a str>,
    settings: &'a serde_json::Value,
    app_name: Vec<&'a str>,
    high_security: bool,
    labels: &'a serde_json::Value,
    environment: &'a serde_json::Value,
    metadata: &'a serde_json::Value,
    identifier: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    utilization: Option<&'a Utilization>,
    #[serde(skip_serializing_if = "Option::is_none")]
    security_policies: Option<&'a AgreedPolicies>,
    event_harvest_config: EventHarvestConfigPayload,
}

#[derive(Deserialize)]
struct Envelope<'a> {
    #[serde(borrow)]
    return_value: &'a RawValue,
}

fn parse_return_value(body: &[u8]) -> Result<&RawValue, BackendError> {
    let envelope: Envelope<'_> = serde_json::from_slice(body)
        .map_err(|e| BackendError::Parse(format!("reply envelope: {e}")))?;
    Ok(envelope.return_value)
}

fn ensure_success(status: u16) -> Result<(), BackendError> {
    if classify(status).success {
        Ok(())
    } else {
        Err(status_error(status))
    }
}

/// Runs the two-phase preconnect/connect handshake for one application.
///
/// Phase 1 negotiates the redirect host and, when a policy token was
/// supplied, the security policy set; any policy mismatch aborts before a
/// connect attempt is made. Phase 2 sends the full application description
/// and requires a reply carrying a non-empty run id.
pub async fn connect_attempt(
    client: &dyn BackendClient,
    cfg: &HandshakeConfig,
    info: &AppInfo,
    utilization: Option<&Utilization>,
    pid: u32,
) -> Result<ConnectOutcome, BackendError> {
    let preconnect_host = info
        .redirect_host
        .clone()
        .unwrap_or_else(|| cfg.default_host.clone());

    let preconnect_body = serde_json::to_vec(&[PreconnectPayload {
        security_policies_token: &info.security_policy_token,
        high_security: info.high_security,
    }])
    .map_err(|e| BackendError::Parse(format!("preconnect payload: {e}")))?;

    let response = client
        .execute(Command {
            name: CommandName::Preconnect,
            host: preconnect_host.clone(),
            credential: info.credential.clone(),
            run_id: None,
            body: preconnect_body,
        })
        .await?;
    ensure_success(response.status)?;

    let preconnect: PreconnectReply = serde_json::from_str(parse_return_value(&response.body)?.get())
        .map_err(|e| BackendError::Parse(format!("preconnect reply: {e}")))?;

    let connect_host = if preconnect.redirect_host.is_empty() {
        preconnect_host
    } else {
        preconnect.redirect_host.clone()
    };

    debug!(
        app = %info.app_name,
        host = %connect_host,
        "preconnect complete",
    );

    // Policy negotiation only happens for token-carrying applications; a
    // mismatch is surfaced before connect is attempted.
    let agreed = if info.security_policy_token.is_empty() {
        None
    } else {
        Some(policy::negotiate(&preconnect.security_policies)?)
    };

    let connect_payload = ConnectPayload {
        pid,
        language: &info.language,
        agent_version: &info.agent_version,
        host: &info.host,
        display_host: info.display_host.as_deref(),
        settings: &info.settings,
        app_name: info.app_name.split(';').collect(),
        high_security: info.high_security,
        labels: &info.labels,
        environment: &info.environment,
        metadata: &info.metadata,
        identifier: info.identifier(),
        utilization,
        security_policies: agreed.as_ref(),
        event_harvest_config: EventHarvestConfigPayload {
            report_period_ms: cfg.report_period.as_millis() as u64,
            harvest_limits: HarvestLimitsPayload {
                error_event_data: cfg.limits.error_events,
                analytic_event_data: cfg.limits.analytic_events,
                custom_event_data: cfg.limits.custom_events,
                span_event_data: cfg.limits.span_events,
                log_event_data: cfg.limits.log_events,
            },
        },
    };

    let connect_body = serde_json::to_vec(&[connect_payload])
        .map_err(|e| BackendError::Parse(format!("connect payload: {e}")))?;

    let response = client
        .execute(Command {
            name: CommandName::Connect,
            host: connect_host.clone(),
            credential: info.credential.clone(),
            run_id: None,
            body: connect_body,
        })
        .await?;
    ensure_success(response.status)?;

    let return_value = parse_return_value(&response.body)?;
    let reply: ConnectReply = serde_json::from_str(return_value.get())
        .map_err(|e| BackendError::Parse(format!("connect reply: {e}")))?;

    if reply.agent_run_id.is_empty() {
        return Err(BackendError::Parse("connect reply missing run id".to_string()));
    }

    let policy_bytes = match &agreed {
        Some(set) => Some(
            serde_json::to_vec(set)
                .map_err(|e| BackendError::Parse(format!("policy set: {e}")))?,
        ),
        None => None,
    };

    info!(
        app = %info.app_name,
        run_id = %reply.agent_run_id,
        host = %connect_host,
        "application connected",
    );

    Ok(ConnectOutcome {
        reply,
        reply_bytes: return_value.get().as_bytes().to_vec(),
        policy_bytes,
        host: connect_host,
    })
}
