use std::time::Duration;

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util;

/// RunnerPool declares a fleet of self-hosted CI runners bound to one
/// repository.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "quarry.quarrylabs.io",
    version = "v1alpha1",
    kind = "RunnerPool",
    plural = "runnerpools",
    namespaced
)]
#[kube(status = "RunnerPoolStatus")]
#[kube(shortname = "rp")]
#[serde(rename_all = "camelCase")]
pub struct RunnerPoolSpec {
    /// Repository the runners register against.
    pub repository_name: String,

    /// Desired number of always-available runners.
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Upper bound on replicas plus detached (job-holding) pods.
    /// Defaults to `replicas`, which disables detaching.
    #[serde(default)]
    pub max_runner_pods: Option<i32>,

    /// Idle pods older than this are recycled, e.g. "24h".
    #[serde(default = "default_recreate_deadline")]
    pub recreate_deadline: String,

    /// Container image for the runner pods. Falls back to the operator's
    /// default image.
    #[serde(default)]
    pub image: Option<String>,

    /// Optional chat notification target for finished jobs.
    #[serde(default)]
    pub notification: NotificationConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    /// In-cluster service name of the notification agent. Empty disables
    /// notifications.
    #[serde(default)]
    pub agent_service: String,

    /// Channel notified unless a job overrides it.
    #[serde(default)]
    pub channel: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct RunnerPoolStatus {
    /// True once the pool's Deployment has been created.
    pub bound: bool,
}

fn default_replicas() -> i32 {
    1
}

fn default_recreate_deadline() -> String {
    "24h".to_string()
}

#[derive(Debug, Error)]
pub enum PoolSpecError {
    #[error("replicas must not be negative, got {0}")]
    NegativeReplicas(i32),

    #[error("maxRunnerPods ({max}) must not be less than replicas ({replicas})")]
    MaxBelowReplicas { max: i32, replicas: i32 },

    #[error("invalid recreateDeadline {value:?}: {source}")]
    BadRecreateDeadline {
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("repository {0:?} is not registered with this operator")]
    UnknownRepository(String),
}

impl RunnerPool {
    /// `<namespace>/<name>`, the loop registry key and CI-provider tag.
    pub fn pool_id(&self) -> String {
        util::namespaced_name(&self.namespace().unwrap_or_default(), &self.name_any())
    }

    pub fn effective_max_runner_pods(&self) -> i32 {
        self.spec
            .max_runner_pods
            .unwrap_or(self.spec.replicas)
            .max(self.spec.replicas)
    }

    pub fn recreate_deadline(&self) -> Result<Duration, PoolSpecError> {
        humantime::parse_duration(&self.spec.recreate_deadline).map_err(|e| {
            PoolSpecError::BadRecreateDeadline {
                value: self.spec.recreate_deadline.clone(),
                source: e,
            }
        })
    }

    /// Spec-level validation. Admission webhooks are not part of this
    /// operator, so the reconciler rejects invalid pools here.
    pub fn validate(&self, allowed_repositories: &[String]) -> Result<(), PoolSpecError> {
        if self.spec.replicas < 0 {
            return Err(PoolSpecError::NegativeReplicas(self.spec.replicas));
        }
        if let Some(max) = self.spec.max_runner_pods {
            if max < self.spec.replicas {
                return Err(PoolSpecError::MaxBelowReplicas {
                    max,
                    replicas: self.spec.replicas,
                });
            }
        }
        self.recreate_deadline()?;
        if !allowed_repositories.is_empty()
            && !allowed_repositories.contains(&self.spec.repository_name)
        {
            return Err(PoolSpecError::UnknownRepository(
                self.spec.repository_name.clone(),
            ));
        }
        Ok(())
    }
}
