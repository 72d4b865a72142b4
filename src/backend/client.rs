use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::BackendConfig;

use super::{BackendClient, BackendError, BackendResponse, Command, PROTOCOL_VERSION};

/// HTTP executor for backend commands.
///
/// A counting admission gate bounds concurrent outbound requests globally;
/// a caller that cannot acquire a slot within the configured wait fails
/// with `BackendError::Admission` rather than blocking indefinitely.
/// Compression, TLS trust, and transport retries are reqwest's concern.
pub struct HttpBackendClient {
    http: reqwest::Client,
    gate: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl HttpBackendClient {
    /// Creates a new client from backend configuration.
    pub fn new(cfg: &BackendConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            gate: Arc::new(Semaphore::new(cfg.max_concurrent_requests)),
            acquire_timeout: cfg.acquire_timeout,
        })
    }

    /// Builds the invocation URL for one command.
    fn command_url(cmd: &Command) -> String {
        let mut url = format!(
            "https://{}/agent_listener/invoke_raw_method?marshal_format=json&protocol_version={}&method={}&license_key={}",
            cmd.host,
            PROTOCOL_VERSION,
            cmd.name.as_str(),
            cmd.credential,
        );

        if let Some(run_id) = &cmd.run_id {
            url.push_str("&run_id=");
            url.push_str(run_id);
        }

        url
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn execute(&self, cmd: Command) -> Result<BackendResponse, BackendError> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.gate).acquire_owned(),
        )
        .await
        .map_err(|_| BackendError::Admission)?
        .map_err(|_| BackendError::Admission)?;
        let _permit = permit;

        let method = cmd.name.as_str();
        let url = Self::command_url(&cmd);
        let started = Instant::now();

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .body(cmd.body)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?
            .to_vec();

        debug!(
            method,
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "backend command executed",
        );

        Ok(BackendResponse { status, body })
    }
}
