//! Client for the status endpoint served by every runner pod.
//!
//! The in-pod supervisor is the sole authority on a pod's lifecycle state;
//! the manager loop only reads it. A pod whose endpoint is unreachable is
//! skipped for the tick, never deleted.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Port the supervisor listens on inside each runner pod.
pub const STATUS_PORT: u16 = 8090;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("status endpoint returned {0}")]
    UnexpectedStatus(reqwest::StatusCode),

    #[error("no status recorded for {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerPodState {
    Initializing,
    Running,
    Debugging,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    Success,
    Failure,
    Cancelled,
    Unknown,
    Unfinished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerPodStatus {
    pub state: RunnerPodState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub result: JobResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extend: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_info: Option<serde_json::Value>,
}

#[async_trait]
pub trait StatusClient: Send + Sync {
    async fn get_status(&self, pod_ip: &str) -> Result<RunnerPodStatus, StatusError>;
}

pub struct HttpStatusClient {
    client: reqwest::Client,
}

impl HttpStatusClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client with static configuration");
        Self { client }
    }
}

impl Default for HttpStatusClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusClient for HttpStatusClient {
    async fn get_status(&self, pod_ip: &str) -> Result<RunnerPodStatus, StatusError> {
        let url = format!("http://{}:{}/status", pod_ip, STATUS_PORT);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(StatusError::UnexpectedStatus(response.status()));
        }
        Ok(response.json().await?)
    }
}
