//! Analytics ingestion collaborator
//!
//! [`AnalyticsSink`] receives batches of [`OutputEvent`]s from the batching
//! sink's background task. [`HttpAnalyticsSink`] posts them to an ingestion
//! endpoint; [`LogAnalyticsSink`] only logs them, for dry runs and for
//! deployments without an endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::sync::event::OutputEvent;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("analytics endpoint rejected batch with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("analytics request failed: {0}")]
    Network(#[from] reqwest::Error),
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Submit one batch. Called at most once per batch; failures are not retried.
    async fn submit(&self, events: Vec<OutputEvent>) -> Result<(), SinkError>;
}

#[derive(Serialize)]
struct EventBatch<'a> {
    events: &'a [OutputEvent],
}

/// Posts batches as `{"events": [...]}` JSON.
pub struct HttpAnalyticsSink {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl HttpAnalyticsSink {
    pub fn new(endpoint: Url, api_key: Option<String>, timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("crm-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl AnalyticsSink for HttpAnalyticsSink {
    async fn submit(&self, events: Vec<OutputEvent>) -> Result<(), SinkError> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .json(&EventBatch { events: &events });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(events = events.len(), "submitted analytics batch");
        Ok(())
    }
}

/// Logs batch sizes and event names instead of shipping them.
#[derive(Debug, Default, Clone)]
pub struct LogAnalyticsSink;

#[async_trait]
impl AnalyticsSink for LogAnalyticsSink {
    async fn submit(&self, events: Vec<OutputEvent>) -> Result<(), SinkError> {
        info!(events = events.len(), "analytics batch (log sink)");
        for event in &events {
            debug!(
                name = %event.name,
                timestamp = %event.timestamp,
                identity = event.identity.as_deref().unwrap_or("-"),
                "event"
            );
        }
        Ok(())
    }
}
