use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::backend::handshake::ConnectReply;

/// One monitored workload's self-description, carried by every app-info
/// submission.
#[derive(Debug, Clone)]
pub struct AppInfo {
    pub credential: String,
    pub app_name: String,
    pub language: String,
    pub agent_version: String,
    pub host: String,
    pub display_host: Option<String>,
    /// Configured collector override; preconnect goes here when set.
    pub redirect_host: Option<String>,
    pub high_security: bool,
    pub security_policy_token: String,
    /// Span streaming destination; spans bypass the harvest cycle when set.
    pub trace_endpoint: Option<String>,
    pub identifier: Option<String>,
    pub settings: Value,
    pub labels: Value,
    pub environment: Value,
    pub metadata: Value,
}

impl AppInfo {
    /// The identity key for this workload. Two submissions with equal keys
    /// address the same Application.
    pub fn key(&self) -> AppKey {
        AppKey {
            credential: self.credential.clone(),
            app_name: self.app_name.clone(),
            redirect_host: self.redirect_host.clone().unwrap_or_default(),
            high_security: self.high_security,
            language: self.language.clone(),
            policy_hash: policy_token_hash(&self.security_policy_token),
            host: self.host.clone(),
            trace_endpoint: self.trace_endpoint.clone().unwrap_or_default(),
        }
    }

    /// Connect-payload identifier, defaulting to the application name.
    pub fn identifier(&self) -> &str {
        self.identifier.as_deref().unwrap_or(&self.app_name)
    }
}

/// Hex sha-256 of the security policy token; empty token hashes to the
/// empty string so policy-free applications share a key component.
fn policy_token_hash(token: &str) -> String {
    if token.is_empty() {
        return String::new();
    }

    let digest = Sha256::digest(token.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Composite application identity. Host is part of the key so distinct
/// hosts never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppKey {
    pub credential: String,
    pub app_name: String,
    pub redirect_host: String,
    pub high_security: bool,
    pub language: String,
    pub policy_hash: String,
    pub host: String,
    pub trace_endpoint: String,
}

/// Application connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Unknown,
    Connected,
    Disconnected,
    Restart,
    InvalidLicense,
    InvalidSecurityPolicies,
}

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppState::Unknown => "unknown",
            AppState::Connected => "connected",
            AppState::Disconnected => "disconnected",
            AppState::Restart => "restart",
            AppState::InvalidLicense => "invalid_license",
            AppState::InvalidSecurityPolicies => "invalid_security_policies",
        }
    }

    /// Terminal states never reconnect within this process lifetime.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppState::Disconnected | AppState::InvalidLicense | AppState::InvalidSecurityPolicies,
        )
    }
}

/// Registry entry for one monitored workload. Lives for the daemon
/// lifetime unless the optional inactivity timeout removes it.
#[derive(Debug)]
pub struct Application {
    pub info: AppInfo,
    pub state: AppState,
    pub last_connect_attempt: Option<Instant>,
    pub connect_time: Option<SystemTime>,
    pub reply: Option<Arc<ConnectReply>>,
    /// Raw connect reply JSON, replayed to agents on app-info.
    pub reply_bytes: Option<Vec<u8>>,
    /// Agreed security policy JSON, replayed to agents on app-info.
    pub policy_bytes: Option<Vec<u8>>,
    pub run_id: Option<String>,
    pub connect_in_flight: bool,
    pub last_activity: Instant,
}

impl Application {
    pub fn new(info: AppInfo) -> Self {
        Self {
            info,
            state: AppState::Unknown,
            last_connect_attempt: None,
            connect_time: None,
            reply: None,
            reply_bytes: None,
            policy_bytes: None,
            run_id: None,
            connect_in_flight: false,
            last_activity: Instant::now(),
        }
    }

    /// Connect eligibility guard: never-connected (Unknown) and
    /// restart-pending applications attempt to connect, at most once per
    /// backoff window, and never before host facts have been gathered.
    pub fn connect_eligible(&self, backoff: Duration, utilization_ready: bool) -> bool {
        matches!(self.state, AppState::Unknown | AppState::Restart)
            && !self.connect_in_flight
            && utilization_ready
            && self
                .last_connect_attempt
                .map_or(true, |at| at.elapsed() >= backoff)
    }

    /// Clears all run-scoped state, marking the application restart-pending
    /// with its backoff reset so the next attempt can fire immediately.
    pub fn reset_for_restart(&mut self) {
        self.state = AppState::Restart;
        self.run_id = None;
        self.reply = None;
        self.reply_bytes = None;
        self.connect_time = None;
        self.last_connect_attempt = None;
    }
}
