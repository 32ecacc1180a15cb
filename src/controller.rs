//! Reconciler bridge between RunnerPool events and the runner manager.
//!
//! Apply renders the pool's workload (registration-token Secret plus
//! Deployment) and hands the pool to the manager; Cleanup stops the manager
//! loop and removes the workload. The finalizer is only released once Stop
//! succeeds, so a failed provider drain is retried by requeue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec,
    PodTemplateSpec, Secret, SecretKeySelector,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::crd::RunnerPool;
use crate::manager::RunnerManager;
use crate::provider::RunnerProvider;
use crate::status::STATUS_PORT;
use crate::util;

pub const RUNNER_POOL_FINALIZER: &str = "quarry.quarrylabs.io/runnerpool";

const TOKEN_SECRET_KEY: &str = "token";

#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("invalid runner pool: {0}")]
    InvalidPool(#[from] crate::crd::PoolSpecError),

    #[error("provider error: {0}")]
    Provider(#[from] crate::provider::ProviderError),

    #[error("runner manager error: {0}")]
    Manager(anyhow::Error),

    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

pub struct Context {
    pub client: Client,
    pub manager: Arc<RunnerManager>,
    pub provider: Arc<dyn RunnerProvider>,
    pub repository_names: Vec<String>,
    pub runner_image: String,
}

pub struct PoolController {
    client: Client,
    namespace: Option<String>,
    context: Arc<Context>,
}

impl PoolController {
    pub fn new(client: Client, namespace: Option<String>, context: Arc<Context>) -> Self {
        Self {
            client,
            namespace,
            context,
        }
    }

    pub async fn run(self) {
        let pools: Api<RunnerPool> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        info!("starting RunnerPool controller");

        Controller::new(pools, watcher::Config::default().any_semantic())
            .shutdown_on_signal()
            .run(reconcile, error_policy, self.context)
            .filter_map(|x| async move { x.ok() })
            .for_each(|_| futures::future::ready(()))
            .await;
    }
}

async fn reconcile(pool: Arc<RunnerPool>, ctx: Arc<Context>) -> Result<Action, Error> {
    let ns = pool.namespace().unwrap_or_default();
    let pools: Api<RunnerPool> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&pools, RUNNER_POOL_FINALIZER, pool, |event| async {
        match event {
            Finalizer::Apply(pool) => apply(&pool, ctx.clone()).await,
            Finalizer::Cleanup(pool) => cleanup(&pool, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

fn error_policy(pool: Arc<RunnerPool>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(pool = %pool.pool_id(), error = %error, "reconcile failed");
    Action::requeue(Duration::from_secs(60))
}

async fn apply(pool: &RunnerPool, ctx: Arc<Context>) -> Result<Action, Error> {
    pool.validate(&ctx.repository_names)?;

    let ns = pool.namespace().unwrap_or_default();
    let name = pool.name_any();
    info!(pool = %pool.pool_id(), "applying runner pool");

    ensure_token_secret(pool, &ctx, &ns, &name).await?;
    ensure_deployment(pool, &ctx, &ns, &name).await?;

    let pools: Api<RunnerPool> = Api::namespaced(ctx.client.clone(), &ns);
    let status = Patch::Merge(json!({"status": {"bound": true}}));
    pools
        .patch_status(&name, &PatchParams::default(), &status)
        .await?;

    ctx.manager
        .start_or_update(pool)
        .await
        .map_err(Error::Manager)?;

    Ok(Action::requeue(Duration::from_secs(300)))
}

async fn cleanup(pool: &RunnerPool, ctx: Arc<Context>) -> Result<Action, Error> {
    let ns = pool.namespace().unwrap_or_default();
    let name = pool.name_any();
    info!(pool = %pool.pool_id(), "cleaning up runner pool");

    // Keep the finalizer until the provider-side drain has succeeded.
    ctx.manager.stop(pool).await.map_err(Error::Manager)?;

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &ns);
    match deployments.delete(&name, &DeleteParams::default()).await {
        Ok(_) => info!(pool = %pool.pool_id(), "deleted deployment"),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
    match secrets
        .delete(&token_secret_name(&name), &DeleteParams::default())
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    Ok(Action::await_change())
}

fn token_secret_name(pool_name: &str) -> String {
    format!("{}-runner-token", pool_name)
}

fn pool_labels(pool: &RunnerPool) -> BTreeMap<String, String> {
    let mut labels = util::pool_selector_labels(&pool.name_any());
    labels.insert(
        util::APP_MANAGED_BY_LABEL.to_string(),
        util::MANAGER_NAME.to_string(),
    );
    labels
}

async fn ensure_token_secret(
    pool: &RunnerPool,
    ctx: &Context,
    ns: &str,
    name: &str,
) -> Result<(), Error> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), ns);
    let secret_name = token_secret_name(name);

    match secrets.get(&secret_name).await {
        Ok(_) => return Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    let token = ctx
        .provider
        .create_registration_token(&pool.spec.repository_name)
        .await?;

    let mut string_data = BTreeMap::new();
    string_data.insert(TOKEN_SECRET_KEY.to_string(), token);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.clone()),
            namespace: Some(ns.to_string()),
            labels: Some(pool_labels(pool)),
            owner_references: Some(vec![pool.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        string_data: Some(string_data),
        ..Default::default()
    };

    match secrets.create(&PostParams::default(), &secret).await {
        Ok(_) => info!(pool = %pool.pool_id(), "created registration token secret"),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn ensure_deployment(
    pool: &RunnerPool,
    ctx: &Context,
    ns: &str,
    name: &str,
) -> Result<(), Error> {
    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), ns);

    let image = pool
        .spec
        .image
        .clone()
        .unwrap_or_else(|| ctx.runner_image.clone());

    let env = vec![
        EnvVar {
            name: "POD_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvVar {
            name: "POD_NAMESPACE".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.namespace".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvVar {
            name: "RUNNER_ORG".to_string(),
            value: Some(ctx.provider.organization_name().to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "RUNNER_REPO".to_string(),
            value: Some(pool.spec.repository_name.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "RUNNER_POOL".to_string(),
            value: Some(pool.pool_id()),
            ..Default::default()
        },
        EnvVar {
            name: "RUNNER_TOKEN".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: Some(token_secret_name(name)),
                    key: TOKEN_SECRET_KEY.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            labels: Some(pool_labels(pool)),
            owner_references: Some(vec![pool.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(pool.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(util::pool_selector_labels(&pool.name_any())),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(util::pool_selector_labels(&pool.name_any())),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "runner".to_string(),
                        image: Some(image),
                        env: Some(env),
                        ports: Some(vec![ContainerPort {
                            name: Some("status".to_string()),
                            container_port: i32::from(STATUS_PORT),
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    match deployments.create(&PostParams::default(), &deployment).await {
        Ok(_) => info!(pool = %pool.pool_id(), "created deployment"),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            let patch = Patch::Merge(&deployment);
            deployments
                .patch(name, &PatchParams::default(), &patch)
                .await?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
