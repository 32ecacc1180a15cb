//! Gateway to the CI provider's self-hosted runner registry.
//!
//! The manager only needs four operations, so they are modelled as a trait
//! and the HTTP implementation stays behind it. Runner tags double as pool
//! identities: every runner registered for a pool carries the pool's
//! `<namespace>/<name>` label, and listing filters on it.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider returned unexpected status {status} for {operation}")]
    UnexpectedStatus {
        operation: &'static str,
        status: reqwest::StatusCode,
    },

    #[error("invalid provider configuration: {0}")]
    Configuration(String),
}

/// A runner registration held by the CI provider.
#[derive(Debug, Clone)]
pub struct Runner {
    pub id: i64,
    pub name: String,
    pub online: bool,
    pub busy: bool,
    pub labels: Vec<String>,
}

impl Runner {
    pub fn has_labels(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|w| self.labels.contains(w))
    }
}

#[async_trait]
pub trait RunnerProvider: Send + Sync {
    fn organization_name(&self) -> &str;

    /// Runners registered for `repository` whose labels contain every element
    /// of `filter_labels`.
    async fn list_runners(
        &self,
        repository: &str,
        filter_labels: &[String],
    ) -> Result<Vec<Runner>, ProviderError>;

    /// Deregister a runner. A runner that is already gone counts as removed.
    async fn remove_runner(&self, repository: &str, id: i64) -> Result<(), ProviderError>;

    /// Short-lived token a new runner uses to register itself.
    async fn create_registration_token(&self, repository: &str)
        -> Result<String, ProviderError>;
}

const PER_PAGE: usize = 100;

#[derive(Debug, Deserialize)]
struct ApiRunnerLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiRunner {
    id: i64,
    name: String,
    status: String,
    busy: bool,
    #[serde(default)]
    labels: Vec<ApiRunnerLabel>,
}

#[derive(Debug, Deserialize)]
struct ApiRunnerList {
    total_count: usize,
    #[serde(default)]
    runners: Vec<ApiRunner>,
}

#[derive(Debug, Deserialize)]
struct ApiRegistrationToken {
    token: String,
}

impl From<ApiRunner> for Runner {
    fn from(r: ApiRunner) -> Self {
        Runner {
            id: r.id,
            online: r.status == "online",
            busy: r.busy,
            labels: r.labels.into_iter().map(|l| l.name).collect(),
            name: r.name,
        }
    }
}

/// REST implementation of the gateway.
pub struct HttpRunnerProvider {
    client: reqwest::Client,
    base_url: String,
    organization: String,
}

impl HttpRunnerProvider {
    pub fn new(
        base_url: &str,
        token: &str,
        organization: &str,
    ) -> Result<Self, ProviderError> {
        if organization.is_empty() {
            return Err(ProviderError::Configuration(
                "organization name must not be empty".to_string(),
            ));
        }
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ProviderError::Configuration(e.to_string()))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            organization: organization.to_string(),
        })
    }

    fn runners_url(&self, repository: &str) -> String {
        format!(
            "{}/orgs/{}/repos/{}/actions/runners",
            self.base_url, self.organization, repository
        )
    }
}

#[async_trait]
impl RunnerProvider for HttpRunnerProvider {
    fn organization_name(&self) -> &str {
        &self.organization
    }

    async fn list_runners(
        &self,
        repository: &str,
        filter_labels: &[String],
    ) -> Result<Vec<Runner>, ProviderError> {
        let mut runners = Vec::new();
        let mut page = 1;
        loop {
            let response = self
                .client
                .get(self.runners_url(repository))
                .query(&[("per_page", PER_PAGE), ("page", page)])
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(ProviderError::UnexpectedStatus {
                    operation: "list runners",
                    status: response.status(),
                });
            }
            let list: ApiRunnerList = response.json().await?;
            let fetched = list.runners.len();
            runners.extend(list.runners.into_iter().map(Runner::from));
            if fetched == 0 || runners.len() >= list.total_count {
                break;
            }
            page += 1;
        }
        runners.retain(|r| r.has_labels(filter_labels));
        Ok(runners)
    }

    async fn remove_runner(&self, repository: &str, id: i64) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(format!("{}/{}", self.runners_url(repository), id))
            .send()
            .await?;
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(ProviderError::UnexpectedStatus {
                operation: "remove runner",
                status: response.status(),
            })
        }
    }

    async fn create_registration_token(
        &self,
        repository: &str,
    ) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(format!("{}/registration-token", self.runners_url(repository)))
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::CREATED {
            return Err(ProviderError::UnexpectedStatus {
                operation: "create registration token",
                status: response.status(),
            });
        }
        let token: ApiRegistrationToken = response.json().await?;
        Ok(token.token)
    }
}
