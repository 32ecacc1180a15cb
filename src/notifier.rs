//! Fire-and-forget client for the chat notification agent.
//!
//! The agent endpoint is derived per pool from the configured service name.
//! Delivery failures are the caller's to log; they never fail a tick.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Serialize;
use thiserror::Error;

use crate::status::JobResult;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("notification agent returned {0}")]
    UnexpectedStatus(reqwest::StatusCode),

    #[error("cannot derive notification endpoint from service name {service:?}: {source}")]
    InvalidService {
        service: String,
        #[source]
        source: url::ParseError,
    },
}

/// Derive the agent endpoint from an in-cluster service name.
pub fn agent_endpoint(service_name: &str) -> Result<Url, NotifyError> {
    Url::parse(&format!("http://{}/notify", service_name)).map_err(|e| {
        NotifyError::InvalidService {
            service: service_name.to_string(),
            source: e,
        }
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResultPayload {
    pub channel: String,
    pub result: JobResult,
    pub extend: bool,
    pub pod_namespace: String,
    pub pod_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_info: Option<serde_json::Value>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn post_result(
        &self,
        endpoint: &Url,
        payload: &JobResultPayload,
    ) -> Result<(), NotifyError>;
}

pub struct AgentClient {
    client: reqwest::Client,
}

impl AgentClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client with static configuration");
        Self { client }
    }
}

impl Default for AgentClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for AgentClient {
    async fn post_result(
        &self,
        endpoint: &Url,
        payload: &JobResultPayload,
    ) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(endpoint.clone())
            .json(payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NotifyError::UnexpectedStatus(response.status()));
        }
        Ok(())
    }
}
