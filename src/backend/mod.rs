pub mod client;
pub mod handshake;
pub mod policy;

use async_trait::async_trait;
use thiserror::Error;

use crate::harvest::DataKind;

/// Wire protocol version spoken with the backend.
pub const PROTOCOL_VERSION: u32 = 17;

/// Symbolic backend method names, one per command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    Preconnect,
    Connect,
    MetricData,
    AnalyticEventData,
    CustomEventData,
    ErrorEventData,
    SpanEventData,
    LogEventData,
    ErrorData,
    SqlTraceData,
    TransactionSampleData,
}

impl CommandName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::Preconnect => "preconnect",
            CommandName::Connect => "connect",
            CommandName::MetricData => "metric_data",
            CommandName::AnalyticEventData => "analytic_event_data",
            CommandName::CustomEventData => "custom_event_data",
            CommandName::ErrorEventData => "error_event_data",
            CommandName::SpanEventData => "span_event_data",
            CommandName::LogEventData => "log_event_data",
            CommandName::ErrorData => "error_data",
            CommandName::SqlTraceData => "sql_trace_data",
            CommandName::TransactionSampleData => "transaction_sample_data",
        }
    }

    /// The command delivering one harvested data kind.
    pub fn for_data_kind(kind: DataKind) -> Self {
        match kind {
            DataKind::Metrics => CommandName::MetricData,
            DataKind::AnalyticEvents => CommandName::AnalyticEventData,
            DataKind::CustomEvents => CommandName::CustomEventData,
            DataKind::ErrorEvents => CommandName::ErrorEventData,
            DataKind::SpanEvents => CommandName::SpanEventData,
            DataKind::LogEvents => CommandName::LogEventData,
            DataKind::ErrorTraces => CommandName::ErrorData,
            DataKind::SlowQueries => CommandName::SqlTraceData,
            DataKind::TxnTraces => CommandName::TransactionSampleData,
        }
    }
}

/// One backend invocation: method, target, credential, optional run id,
/// serialized body. Compression and transport behavior belong to the
/// executing client.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: CommandName,
    pub host: String,
    pub credential: String,
    pub run_id: Option<String>,
    pub body: Vec<u8>,
}

/// Raw backend response: HTTP status plus body bytes.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Failure taxonomy for backend interactions.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The request never produced an HTTP status (timeout, refused
    /// connection, DNS failure).
    #[error("backend transport failure: {0}")]
    Transport(String),

    /// No outbound admission slot became available within the wait budget.
    #[error("no outbound slot available")]
    Admission,

    /// The backend answered but the reply could not be understood.
    #[error("malformed backend reply: {0}")]
    Parse(String),

    /// Local and backend security policy sets cannot be reconciled; the
    /// offending policy names are carried for operator logging.
    #[error("security policy mismatch: {0:?}")]
    PolicyMismatch(Vec<String>),

    /// Authentication failure. Terminal: requires external remediation.
    #[error("invalid credential")]
    InvalidCredential,

    /// The backend permanently rejected the application.
    #[error("application disconnected by backend")]
    Disconnect,

    /// The backend considers the run stale and wants a reconnect.
    #[error("backend requested restart")]
    Restart,

    /// Any other non-success status.
    #[error("backend returned status {0}")]
    Status(u16),
}

/// What a status code means for the data and the application, uniform
/// across preconnect, connect, and delivery calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureClass {
    pub success: bool,
    pub disconnect: bool,
    pub restart: bool,
    pub invalid_credential: bool,
    pub save: bool,
}

/// Classifies a backend HTTP status. Pure function of the status code.
pub fn classify(status: u16) -> FailureClass {
    match status {
        200..=299 => FailureClass {
            success: true,
            ..FailureClass::default()
        },
        410 => FailureClass {
            disconnect: true,
            ..FailureClass::default()
        },
        401 => FailureClass {
            restart: true,
            invalid_credential: true,
            ..FailureClass::default()
        },
        409 => FailureClass {
            restart: true,
            ..FailureClass::default()
        },
        408 | 429 | 500 | 503 => FailureClass {
            save: true,
            ..FailureClass::default()
        },
        _ => FailureClass::default(),
    }
}

/// Converts a classified non-success status into the matching typed error.
pub fn status_error(status: u16) -> BackendError {
    let class = classify(status);
    if class.invalid_credential {
        BackendError::InvalidCredential
    } else if class.disconnect {
        BackendError::Disconnect
    } else if class.restart {
        BackendError::Restart
    } else {
        BackendError::Status(status)
    }
}

/// Executes backend commands. Implemented over HTTP in `client`; tests
/// substitute scripted implementations.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn execute(&self, cmd: Command) -> Result<BackendResponse, BackendError>;
}
