//! Per-pool reconciliation: the RunnerManager supervisor and its manager
//! loops.
//!
//! The supervisor is a registry plus teardown orchestrator; all reconciling
//! happens in the loops. Each loop wakes on a fixed period and runs one tick:
//! gather pods, provider runners, and pod statuses; publish gauges; maintain
//! the pods; deregister offline orphans. Loops are independent tasks, so a
//! provider outage for one repository only stalls the pools bound to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use reqwest::Url;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::crd::RunnerPool;
use crate::metrics;
use crate::notifier::{agent_endpoint, JobResultPayload, Notifier};
use crate::pod_client::PodClient;
use crate::provider::{Runner, RunnerProvider};
use crate::status::{RunnerPodState, RunnerPodStatus, StatusClient};
use crate::util::{self, TEMPLATE_HASH_LABEL};

/// Mutable pool configuration, written by the supervisor's update path and
/// copied out by every tick before it touches anything external.
#[derive(Clone)]
struct PoolConfig {
    replicas: i32,
    max_runner_pods: i32,
    chat_channel: String,
    chat_endpoint: Option<Url>,
}

impl PoolConfig {
    fn from_pool(rp: &RunnerPool) -> Result<Self> {
        let chat_endpoint = if rp.spec.notification.agent_service.is_empty() {
            None
        } else {
            Some(agent_endpoint(&rp.spec.notification.agent_service)?)
        };
        Ok(Self {
            replicas: rp.spec.replicas,
            max_runner_pods: rp.effective_max_runner_pods(),
            chat_channel: rp.spec.notification.channel.clone(),
            chat_endpoint,
        })
    }
}

/// Handle to a started loop, kept in the supervisor's registry.
struct LoopHandle {
    config: Arc<Mutex<PoolConfig>>,
    cancel: CancellationToken,
    join: JoinHandle<Vec<String>>,
}

impl LoopHandle {
    fn update(&self, rp: &RunnerPool) -> Result<()> {
        let config = PoolConfig::from_pool(rp)?;
        *self.config.lock().unwrap() = config;
        Ok(())
    }

    /// Cancel the loop and wait for it to finish. Returns the runner names
    /// of the loop's last tick so their gauges can be purged.
    async fn shutdown(self) -> Result<Vec<String>> {
        self.cancel.cancel();
        self.join.await.context("manager loop task failed")
    }
}

pub(crate) struct ManagerLoop {
    pool_namespace: String,
    pool_name: String,
    repository: String,
    interval: Duration,
    recreate_deadline: chrono::Duration,

    pods: Arc<dyn PodClient>,
    provider: Arc<dyn RunnerProvider>,
    status: Arc<dyn StatusClient>,
    notifier: Arc<dyn Notifier>,

    config: Arc<Mutex<PoolConfig>>,

    // Owned by the loop task only.
    last_check_time: DateTime<Utc>,
    prev_runner_names: Vec<String>,
}

impl ManagerLoop {
    pub(crate) fn new(
        interval: Duration,
        pods: Arc<dyn PodClient>,
        provider: Arc<dyn RunnerProvider>,
        status: Arc<dyn StatusClient>,
        notifier: Arc<dyn Notifier>,
        rp: &RunnerPool,
    ) -> Result<Self> {
        let recreate_deadline = chrono::Duration::from_std(rp.recreate_deadline()?)
            .context("recreate deadline out of range")?;
        let config = PoolConfig::from_pool(rp)?;
        Ok(Self {
            pool_namespace: rp.namespace().unwrap_or_default(),
            pool_name: rp.name_any(),
            repository: rp.spec.repository_name.clone(),
            interval,
            recreate_deadline,
            pods,
            provider,
            status,
            notifier,
            config: Arc::new(Mutex::new(config)),
            last_check_time: Utc::now(),
            prev_runner_names: Vec::new(),
        })
    }

    fn pool_id(&self) -> String {
        util::namespaced_name(&self.pool_namespace, &self.pool_name)
    }

    fn start(mut self) -> LoopHandle {
        let config = Arc::clone(&self.config);
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + self.interval,
                self.interval,
            );
            info!(pool = %self.pool_id(), "starting manager loop");
            loop {
                tokio::select! {
                    _ = child.cancelled() => {
                        info!(pool = %self.pool_id(), "stopping manager loop");
                        break;
                    }
                    _ = ticker.tick() => {
                        match tokio::time::timeout(self.interval, self.run_once()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                error!(pool = %self.pool_id(), error = %e, "reconciliation tick failed");
                            }
                            Err(_) => {
                                error!(pool = %self.pool_id(), "reconciliation tick timed out");
                            }
                        }
                    }
                }
            }
            self.prev_runner_names
        });
        LoopHandle {
            config,
            cancel,
            join,
        }
    }

    pub(crate) async fn run_once(&mut self) -> Result<()> {
        let pods = self
            .pods
            .list_runner_pods(&self.pool_namespace, &self.pool_name)
            .await
            .context("failed to list runner pods")?;
        let runners = self
            .provider
            .list_runners(&self.repository, &[self.pool_id()])
            .await
            .context("failed to list provider runners")?;
        let statuses = self.fetch_statuses(&pods).await;

        self.update_metrics(&runners);
        self.maintain_runner_pods(&pods, &runners, &statuses).await;
        self.delete_offline_runners(&runners, &pods).await?;
        Ok(())
    }

    /// Statuses keyed by pod name. Pods without an IP or with an unreachable
    /// endpoint are left out; later phases skip them.
    async fn fetch_statuses(&self, pods: &[Pod]) -> HashMap<String, RunnerPodStatus> {
        let mut statuses = HashMap::new();
        for pod in pods {
            let name = pod.name_any();
            let ip = pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.clone())
                .filter(|ip| !ip.is_empty());
            let Some(ip) = ip else { continue };
            match self.status.get_status(&ip).await {
                Ok(status) => {
                    statuses.insert(name, status);
                }
                Err(e) => {
                    warn!(pool = %self.pool_id(), pod = %name, error = %e,
                        "failed to get runner pod status, skipping maintenance this tick");
                }
            }
        }
        statuses
    }

    fn update_metrics(&mut self, runners: &[Runner]) {
        let pool_id = self.pool_id();
        let replicas = self.config.lock().unwrap().replicas;
        metrics::update_runner_pool(&pool_id, replicas);

        let current: Vec<String> = runners.iter().map(|r| r.name.clone()).collect();
        for runner in runners {
            metrics::update_runner(&pool_id, &runner.name, runner.online, runner.busy);
        }
        // The provider garbage-collects offline runners asynchronously;
        // gauges for runners that vanished between ticks must follow.
        for removed in util::difference(&self.prev_runner_names, &current) {
            metrics::delete_runner(&pool_id, &removed);
        }
        self.prev_runner_names = current;
    }

    async fn maintain_runner_pods(
        &mut self,
        pods: &[Pod],
        runners: &[Runner],
        statuses: &HashMap<String, RunnerPodStatus>,
    ) {
        let now = Utc::now();
        let last_check = self.last_check_time;

        let num_unlabeled = pods
            .iter()
            .filter(|p| !p.labels().contains_key(TEMPLATE_HASH_LABEL))
            .count() as i32;
        let config = self.config.lock().unwrap().clone();
        let mut num_removable = (config.max_runner_pods - config.replicas - num_unlabeled).max(0);

        for pod in pods {
            let name = pod.name_any();
            let Some(status) = statuses.get(&name) else {
                continue;
            };

            // The in-pod supervisor has declared itself unrecoverable.
            if status.state == RunnerPodState::Stale {
                self.delete_pod_logged(pod, "stale").await;
                continue;
            }

            if status.state == RunnerPodState::Debugging {
                if let Some(finished_at) = status.finished_at {
                    if finished_at > last_check && config.chat_endpoint.is_some() {
                        self.notify(&config, pod, status).await;
                    }
                }
                if let Some(deletion_time) = status.deletion_time {
                    if now >= deletion_time {
                        self.delete_pod_logged(pod, "debug deadline reached").await;
                        continue;
                    }
                }
            }

            let busy = runner_busy(runners, &name);
            let debugging = status.state == RunnerPodState::Debugging;

            if let Some(created) = pod.creation_timestamp() {
                if now >= created.0 + self.recreate_deadline && !(busy || debugging) {
                    self.delete_pod_logged(pod, "recreate deadline exceeded")
                        .await;
                    continue;
                }
            }

            // A busy or held pod is detached from ReplicaSet control so a
            // replacement spawns while the job finishes undisturbed.
            if (busy || debugging)
                && num_removable > 0
                && pod.labels().contains_key(TEMPLATE_HASH_LABEL)
            {
                let mut detached = pod.clone();
                detached.labels_mut().remove(TEMPLATE_HASH_LABEL);
                match self.pods.update_pod(&detached).await {
                    Ok(()) => {
                        num_removable -= 1;
                        info!(pool = %self.pool_id(), pod = %name, "detached runner pod");
                    }
                    Err(e) => {
                        warn!(pool = %self.pool_id(), pod = %name, error = %e,
                            "failed to detach runner pod");
                    }
                }
            }
        }

        // Updated at the bottom of the phase so a finished-job edge observed
        // during gathering is reported exactly once.
        self.last_check_time = now;
    }

    async fn notify(&self, config: &PoolConfig, pod: &Pod, status: &RunnerPodStatus) {
        let Some(endpoint) = config.chat_endpoint.as_ref() else {
            return;
        };
        let channel = status
            .slack_channel
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| config.chat_channel.clone());
        let payload = JobResultPayload {
            channel,
            result: status.result,
            extend: status.extend.unwrap_or(false),
            pod_namespace: pod.namespace().unwrap_or_default(),
            pod_name: pod.name_any(),
            job_info: status.job_info.clone(),
        };
        match self.notifier.post_result(endpoint, &payload).await {
            Ok(()) => {
                info!(pool = %self.pool_id(), pod = %payload.pod_name, "sent job result notification");
            }
            Err(e) => {
                warn!(pool = %self.pool_id(), pod = %payload.pod_name, error = %e,
                    "failed to send job result notification");
            }
        }
    }

    async fn delete_pod_logged(&self, pod: &Pod, reason: &str) {
        let name = pod.name_any();
        match self.pods.delete_pod(&self.pool_namespace, &name).await {
            Ok(()) => info!(pool = %self.pool_id(), pod = %name, reason, "deleted runner pod"),
            Err(e) => {
                error!(pool = %self.pool_id(), pod = %name, reason, error = %e,
                    "failed to delete runner pod");
            }
        }
    }

    /// A runner that is offline with no same-named pod is an orphan left
    /// behind by a deleted pod; deregister it. Online or pod-backed runners
    /// are never touched here.
    async fn delete_offline_runners(&self, runners: &[Runner], pods: &[Pod]) -> Result<()> {
        for runner in runners {
            if runner.online || pod_exists(pods, &runner.name) {
                continue;
            }
            self.provider
                .remove_runner(&self.repository, runner.id)
                .await
                .with_context(|| format!("failed to remove runner {}", runner.name))?;
            info!(pool = %self.pool_id(), runner = %runner.name, runner_id = runner.id,
                "deregistered offline runner");
        }
        Ok(())
    }
}

fn runner_busy(runners: &[Runner], name: &str) -> bool {
    runners
        .iter()
        .find(|r| r.name == name)
        .map_or(false, |r| r.busy)
}

fn pod_exists(pods: &[Pod], name: &str) -> bool {
    pods.iter().any(|p| p.name_any() == name)
}

/// Registry of manager loops keyed by pool identity.
pub struct RunnerManager {
    interval: Duration,
    pods: Arc<dyn PodClient>,
    provider: Arc<dyn RunnerProvider>,
    status: Arc<dyn StatusClient>,
    notifier: Arc<dyn Notifier>,
    loops: tokio::sync::Mutex<HashMap<String, LoopHandle>>,
}

impl RunnerManager {
    pub fn new(
        interval: Duration,
        pods: Arc<dyn PodClient>,
        provider: Arc<dyn RunnerProvider>,
        status: Arc<dyn StatusClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            interval,
            pods,
            provider,
            status,
            notifier,
            loops: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Start a loop for a new pool, or push the mutable fields into a live
    /// one. Calling this repeatedly with an identical spec is a no-op.
    pub async fn start_or_update(&self, rp: &RunnerPool) -> Result<()> {
        let pool_id = rp.pool_id();
        let mut loops = self.loops.lock().await;
        if let Some(handle) = loops.get(&pool_id) {
            return handle.update(rp);
        }
        let manager_loop = ManagerLoop::new(
            self.interval,
            Arc::clone(&self.pods),
            Arc::clone(&self.provider),
            Arc::clone(&self.status),
            Arc::clone(&self.notifier),
            rp,
        )?;
        loops.insert(pool_id, manager_loop.start());
        Ok(())
    }

    /// Stop the pool's loop, purge its gauges, then deregister every provider
    /// runner still tagged with the pool identity. Every runner listed is
    /// attempted; the first error is returned afterwards so the caller can
    /// requeue.
    pub async fn stop(&self, rp: &RunnerPool) -> Result<()> {
        let pool_id = rp.pool_id();
        let handle = self.loops.lock().await.remove(&pool_id);
        if let Some(handle) = handle {
            let prev_runner_names = handle.shutdown().await?;
            for name in &prev_runner_names {
                metrics::delete_runner(&pool_id, name);
            }
            metrics::delete_runner_pool(&pool_id);
        }

        let runners = self
            .provider
            .list_runners(&rp.spec.repository_name, std::slice::from_ref(&pool_id))
            .await
            .context("failed to list provider runners")?;
        let mut first_err = None;
        for runner in runners {
            match self
                .provider
                .remove_runner(&rp.spec.repository_name, runner.id)
                .await
            {
                Ok(()) => {
                    info!(pool = %pool_id, runner = %runner.name, runner_id = runner.id,
                        "deregistered runner");
                }
                Err(e) => {
                    error!(pool = %pool_id, runner = %runner.name, runner_id = runner.id,
                        error = %e, "failed to deregister runner");
                    if first_err.is_none() {
                        first_err = Some(anyhow::Error::from(e));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) async fn live_pools(&self) -> Vec<String> {
        let mut pools: Vec<String> = self.loops.lock().await.keys().cloned().collect();
        pools.sort();
        pools
    }

    #[cfg(test)]
    pub(crate) async fn pool_replicas(&self, pool_id: &str) -> Option<i32> {
        self.loops
            .lock()
            .await
            .get(pool_id)
            .map(|h| h.config.lock().unwrap().replicas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::testutil::make_pool;
    use crate::metrics::gauge_value;
    use crate::notifier::fake::RecordingNotifier;
    use crate::pod_client::fake::FakePodClient;
    use crate::provider::fake::FakeRunnerProvider;
    use crate::status::fake::FakeStatusClient;
    use crate::status::JobResult;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::ObjectMeta;

    struct Fixture {
        pods: Arc<FakePodClient>,
        provider: Arc<FakeRunnerProvider>,
        status: Arc<FakeStatusClient>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Fixture {
        fn new() -> Self {
            let _ = metrics::init();
            Self {
                pods: Arc::new(FakePodClient::new()),
                provider: Arc::new(FakeRunnerProvider::new("test-org")),
                status: Arc::new(FakeStatusClient::new()),
                notifier: Arc::new(RecordingNotifier::new()),
            }
        }

        fn manager_loop(&self, rp: &RunnerPool) -> ManagerLoop {
            ManagerLoop::new(
                Duration::from_secs(3600),
                self.pods.clone(),
                self.provider.clone(),
                self.status.clone(),
                self.notifier.clone(),
                rp,
            )
            .unwrap()
        }

        fn manager(&self, interval: Duration) -> RunnerManager {
            RunnerManager::new(
                interval,
                self.pods.clone(),
                self.provider.clone(),
                self.status.clone(),
                self.notifier.clone(),
            )
        }
    }

    fn make_pod(
        namespace: &str,
        pool: &str,
        name: &str,
        ip: &str,
        template_hash: bool,
        age: chrono::Duration,
    ) -> Pod {
        let mut labels = util::pool_selector_labels(pool);
        if template_hash {
            labels.insert(TEMPLATE_HASH_LABEL.to_string(), "6c549f95b".to_string());
        }
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                creation_timestamp: Some(Time(Utc::now() - age)),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: Some(ip.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn make_runner(id: i64, name: &str, online: bool, busy: bool, pool_id: &str) -> Runner {
        Runner {
            id,
            name: name.to_string(),
            online,
            busy,
            labels: vec![pool_id.to_string()],
        }
    }

    fn running_status() -> RunnerPodStatus {
        RunnerPodStatus {
            state: RunnerPodState::Running,
            deletion_time: None,
            finished_at: None,
            result: JobResult::Unfinished,
            extend: None,
            slack_channel: None,
            job_info: None,
        }
    }

    #[tokio::test]
    async fn offline_orphan_runners_are_deregistered() {
        let fx = Fixture::new();
        let pool = make_pool("mgr1-ns", "rp1", "repo1");
        fx.provider.set_runners(
            "repo1",
            vec![
                make_runner(1, "pod1", false, false, "mgr1-ns/rp1"),
                make_runner(2, "pod2", false, false, "mgr1-ns/rp1"),
            ],
        );

        let mut ml = fx.manager_loop(&pool);
        ml.run_once().await.unwrap();
        assert!(fx.provider.runners("repo1").is_empty());

        // The next tick's diff removes the gauges of the vanished runners.
        ml.run_once().await.unwrap();
        for name in ["pod1", "pod2"] {
            assert_eq!(
                gauge_value(
                    "quarry_runner_online",
                    &[("runnerpool", "mgr1-ns/rp1"), ("runner", name)]
                ),
                None
            );
        }
    }

    #[tokio::test]
    async fn online_or_pod_backed_runners_are_kept() {
        let fx = Fixture::new();
        let pool = make_pool("mgr2-ns", "rp1", "repo1");
        for (name, ip) in [("pod1", "10.0.0.1"), ("pod2", "10.0.0.2")] {
            fx.pods
                .add_pod(make_pod("mgr2-ns", "rp1", name, ip, true, chrono::Duration::zero()));
            fx.status.set_status(ip, running_status());
        }
        fx.provider.set_runners(
            "repo1",
            vec![
                make_runner(1, "pod1", false, false, "mgr2-ns/rp1"),
                make_runner(2, "pod2", true, true, "mgr2-ns/rp1"),
                make_runner(3, "pod3", true, false, "mgr2-ns/rp1"),
            ],
        );

        let mut ml = fx.manager_loop(&pool);
        ml.run_once().await.unwrap();

        assert_eq!(fx.provider.runners("repo1").len(), 3);
        assert_eq!(
            gauge_value(
                "quarry_runner_online",
                &[("runnerpool", "mgr2-ns/rp1"), ("runner", "pod1")]
            ),
            Some(0.0)
        );
        assert_eq!(
            gauge_value(
                "quarry_runner_busy",
                &[("runnerpool", "mgr2-ns/rp1"), ("runner", "pod2")]
            ),
            Some(1.0)
        );
        assert_eq!(
            gauge_value(
                "quarry_runner_busy",
                &[("runnerpool", "mgr2-ns/rp1"), ("runner", "pod3")]
            ),
            Some(0.0)
        );
    }

    #[tokio::test]
    async fn runners_of_other_pools_are_ignored() {
        let fx = Fixture::new();
        let pool = make_pool("mgr3-ns", "rp1", "repo1");
        fx.provider.set_runners(
            "repo1",
            vec![make_runner(1, "pod9", false, false, "mgr3-ns/rp3")],
        );

        let mut ml = fx.manager_loop(&pool);
        ml.run_once().await.unwrap();

        assert_eq!(fx.provider.runners("repo1").len(), 1);
        assert_eq!(
            gauge_value(
                "quarry_runner_online",
                &[("runnerpool", "mgr3-ns/rp1"), ("runner", "pod9")]
            ),
            None
        );
    }

    #[tokio::test]
    async fn debugging_pod_past_deadline_is_deleted_and_notified_once() {
        let fx = Fixture::new();
        let mut pool = make_pool("mgr4-ns", "rp1", "repo1");
        pool.spec.notification.agent_service = "slack-agent".to_string();
        pool.spec.notification.channel = "#general".to_string();

        fx.pods.add_pod(make_pod(
            "mgr4-ns",
            "rp1",
            "pod1",
            "10.0.4.1",
            true,
            chrono::Duration::minutes(30),
        ));

        let mut ml = fx.manager_loop(&pool);
        fx.status.set_status(
            "10.0.4.1",
            RunnerPodStatus {
                state: RunnerPodState::Debugging,
                deletion_time: Some(Utc::now() - chrono::Duration::seconds(1)),
                finished_at: Some(Utc::now() + chrono::Duration::milliseconds(2)),
                result: JobResult::Failure,
                extend: Some(true),
                slack_channel: Some("#override".to_string()),
                job_info: None,
            },
        );

        ml.run_once().await.unwrap();

        assert!(fx.pods.pods().is_empty());
        let posted = fx.notifier.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].channel, "#override");
        assert_eq!(posted[0].result, JobResult::Failure);
        assert!(posted[0].extend);
        assert_eq!(posted[0].pod_name, "pod1");

        ml.run_once().await.unwrap();
        assert_eq!(fx.notifier.posted().len(), 1);
    }

    #[tokio::test]
    async fn notification_falls_back_to_pool_channel() {
        let fx = Fixture::new();
        let mut pool = make_pool("mgr5-ns", "rp1", "repo1");
        pool.spec.notification.agent_service = "slack-agent".to_string();
        pool.spec.notification.channel = "#general".to_string();

        fx.pods.add_pod(make_pod(
            "mgr5-ns",
            "rp1",
            "pod1",
            "10.0.5.1",
            true,
            chrono::Duration::minutes(5),
        ));

        let mut ml = fx.manager_loop(&pool);
        fx.status.set_status(
            "10.0.5.1",
            RunnerPodStatus {
                state: RunnerPodState::Debugging,
                deletion_time: Some(Utc::now() + chrono::Duration::hours(1)),
                finished_at: Some(Utc::now() + chrono::Duration::milliseconds(2)),
                result: JobResult::Success,
                extend: None,
                slack_channel: None,
                job_info: None,
            },
        );

        ml.run_once().await.unwrap();

        // Deadline is in the future, so the pod is held for debugging.
        assert_eq!(fx.pods.pods().len(), 1);
        let posted = fx.notifier.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].channel, "#general");
        assert!(!posted[0].extend);
    }

    #[tokio::test]
    async fn stale_pod_is_deleted() {
        let fx = Fixture::new();
        let pool = make_pool("mgr6-ns", "rp1", "repo1");
        fx.pods.add_pod(make_pod(
            "mgr6-ns",
            "rp1",
            "pod1",
            "10.0.6.1",
            true,
            chrono::Duration::zero(),
        ));
        let mut status = running_status();
        status.state = RunnerPodState::Stale;
        fx.status.set_status("10.0.6.1", status);

        let mut ml = fx.manager_loop(&pool);
        ml.run_once().await.unwrap();
        assert!(fx.pods.pods().is_empty());
    }

    #[tokio::test]
    async fn idle_pod_over_recreate_deadline_is_recycled() {
        let fx = Fixture::new();
        let mut pool = make_pool("mgr7-ns", "rp1", "repo1");
        pool.spec.recreate_deadline = "24h".to_string();

        fx.pods.add_pod(make_pod(
            "mgr7-ns",
            "rp1",
            "pod-old-idle",
            "10.0.7.1",
            true,
            chrono::Duration::hours(25),
        ));
        fx.pods.add_pod(make_pod(
            "mgr7-ns",
            "rp1",
            "pod-old-busy",
            "10.0.7.2",
            true,
            chrono::Duration::hours(25),
        ));
        fx.status.set_status("10.0.7.1", running_status());
        fx.status.set_status("10.0.7.2", running_status());
        fx.provider.set_runners(
            "repo1",
            vec![make_runner(1, "pod-old-busy", true, true, "mgr7-ns/rp1")],
        );

        let mut ml = fx.manager_loop(&pool);
        ml.run_once().await.unwrap();

        let names: Vec<String> = fx.pods.pods().iter().map(|p| p.name_any()).collect();
        assert_eq!(names, vec!["pod-old-busy"]);
    }

    #[tokio::test]
    async fn busy_pods_detach_only_up_to_the_cap() {
        let fx = Fixture::new();
        let mut pool = make_pool("mgr8-ns", "rp1", "repo1");
        pool.spec.replicas = 2;
        pool.spec.max_runner_pods = Some(3);

        for (name, ip) in [("pod1", "10.0.8.1"), ("pod2", "10.0.8.2")] {
            fx.pods
                .add_pod(make_pod("mgr8-ns", "rp1", name, ip, true, chrono::Duration::zero()));
            fx.status.set_status(ip, running_status());
        }
        fx.provider.set_runners(
            "repo1",
            vec![
                make_runner(1, "pod1", true, true, "mgr8-ns/rp1"),
                make_runner(2, "pod2", true, true, "mgr8-ns/rp1"),
            ],
        );

        let mut ml = fx.manager_loop(&pool);
        ml.run_once().await.unwrap();

        let unlabeled: Vec<String> = fx
            .pods
            .pods()
            .iter()
            .filter(|p| !p.labels().contains_key(TEMPLATE_HASH_LABEL))
            .map(|p| p.name_any())
            .collect();
        assert_eq!(unlabeled, vec!["pod1"]);

        // One pod is already detached, so the cap is used up.
        ml.run_once().await.unwrap();
        let unlabeled = fx
            .pods
            .pods()
            .iter()
            .filter(|p| !p.labels().contains_key(TEMPLATE_HASH_LABEL))
            .count();
        assert_eq!(unlabeled, 1);
    }

    #[tokio::test]
    async fn pod_with_unreachable_status_endpoint_is_left_alone() {
        let fx = Fixture::new();
        let pool = make_pool("mgr9-ns", "rp1", "repo1");
        fx.pods.add_pod(make_pod(
            "mgr9-ns",
            "rp1",
            "pod1",
            "10.0.9.1",
            true,
            chrono::Duration::hours(48),
        ));

        let mut ml = fx.manager_loop(&pool);
        ml.run_once().await.unwrap();
        assert_eq!(fx.pods.pods().len(), 1);
    }

    #[tokio::test]
    async fn reticking_unchanged_inputs_mutates_nothing() {
        let fx = Fixture::new();
        let pool = make_pool("mgr10-ns", "rp1", "repo1");
        fx.pods.add_pod(make_pod(
            "mgr10-ns",
            "rp1",
            "pod1",
            "10.0.10.1",
            true,
            chrono::Duration::minutes(1),
        ));
        fx.status.set_status("10.0.10.1", running_status());
        fx.provider.set_runners(
            "repo1",
            vec![make_runner(1, "pod1", true, false, "mgr10-ns/rp1")],
        );

        let mut ml = fx.manager_loop(&pool);
        ml.run_once().await.unwrap();
        ml.run_once().await.unwrap();

        let pods = fx.pods.pods();
        assert_eq!(pods.len(), 1);
        assert!(pods[0].labels().contains_key(TEMPLATE_HASH_LABEL));
        assert_eq!(fx.provider.runners("repo1").len(), 1);
        assert!(fx.notifier.posted().is_empty());
    }

    #[tokio::test]
    async fn start_or_update_is_idempotent() {
        let fx = Fixture::new();
        let manager = fx.manager(Duration::from_secs(3600));
        let mut pool = make_pool("mgr11-ns", "rp1", "repo1");

        manager.start_or_update(&pool).await.unwrap();
        manager.start_or_update(&pool).await.unwrap();
        assert_eq!(manager.live_pools().await, vec!["mgr11-ns/rp1"]);
        assert_eq!(manager.pool_replicas("mgr11-ns/rp1").await, Some(1));

        pool.spec.replicas = 4;
        manager.start_or_update(&pool).await.unwrap();
        assert_eq!(manager.live_pools().await, vec!["mgr11-ns/rp1"]);
        assert_eq!(manager.pool_replicas("mgr11-ns/rp1").await, Some(4));
    }

    #[tokio::test]
    async fn start_or_update_rejects_bad_agent_service() {
        let fx = Fixture::new();
        let manager = fx.manager(Duration::from_secs(3600));
        let mut pool = make_pool("mgr12-ns", "rp1", "repo1");
        pool.spec.notification.agent_service = "bad service".to_string();

        assert!(manager.start_or_update(&pool).await.is_err());
        assert!(manager.live_pools().await.is_empty());
    }

    #[tokio::test]
    async fn stop_purges_loop_metrics_and_runners() {
        let fx = Fixture::new();
        let manager = fx.manager(Duration::from_millis(50));
        let pool = make_pool("mgr13-ns", "rp1", "repo1");
        fx.provider.set_runners(
            "repo1",
            vec![
                make_runner(1, "pod1", true, true, "mgr13-ns/rp1"),
                make_runner(2, "pod2", true, false, "mgr13-ns/rp1"),
                make_runner(3, "pod3", true, false, "mgr13-ns/rp1"),
            ],
        );

        manager.start_or_update(&pool).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(
            gauge_value("quarry_runnerpool_replicas", &[("runnerpool", "mgr13-ns/rp1")]),
            Some(1.0)
        );
        assert_eq!(
            gauge_value(
                "quarry_runner_online",
                &[("runnerpool", "mgr13-ns/rp1"), ("runner", "pod1")]
            ),
            Some(1.0)
        );

        manager.stop(&pool).await.unwrap();

        assert!(manager.live_pools().await.is_empty());
        assert!(fx.provider.runners("repo1").is_empty());
        assert_eq!(
            gauge_value("quarry_runnerpool_replicas", &[("runnerpool", "mgr13-ns/rp1")]),
            None
        );
        for name in ["pod1", "pod2", "pod3"] {
            assert_eq!(
                gauge_value(
                    "quarry_runner_online",
                    &[("runnerpool", "mgr13-ns/rp1"), ("runner", name)]
                ),
                None
            );
        }
    }

    #[tokio::test]
    async fn stop_attempts_every_runner_and_reports_first_error() {
        let fx = Fixture::new();
        let manager = fx.manager(Duration::from_secs(3600));
        let pool = make_pool("mgr14-ns", "rp1", "repo1");
        fx.provider.set_runners(
            "repo1",
            vec![
                make_runner(1, "pod1", false, false, "mgr14-ns/rp1"),
                make_runner(2, "pod2", false, false, "mgr14-ns/rp1"),
            ],
        );
        fx.provider
            .fail_remove
            .store(true, std::sync::atomic::Ordering::SeqCst);

        manager.start_or_update(&pool).await.unwrap();
        assert!(manager.stop(&pool).await.is_err());
        // The loop entry is gone; a retried Stop drains the remaining runners.
        assert!(manager.live_pools().await.is_empty());

        fx.provider
            .fail_remove
            .store(false, std::sync::atomic::Ordering::SeqCst);
        manager.stop(&pool).await.unwrap();
        assert!(fx.provider.runners("repo1").is_empty());
    }
}
