//! The publish state machine.
//!
//! A request moves through `ReceivingRequest → ReconcilingPriorAttempt →
//! EnsuringTarget → Deploying`, synchronously, before the caller gets an
//! answer. Everything after that (polling the platform, or running the local
//! docker build) continues as a background task tracked in [`TaskRegistry`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PollingConfig;
use crate::errors::{PublishError, PublishResult};

use super::backend::{DeploymentBackend, LocalDockerBackend, RemoteApiBackend};
use super::models::{Project, REMOTE_TOTAL_STEPS};
use super::progress::{StepTracker, parse_step};
use super::store::SharedStore;
use super::supervisor::ProcessSupervisor;

/// How long shutdown waits for cancelled tasks to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct TrackedTask {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Background publish work keyed by project id.
///
/// Starting a task for a project that still has one running only logs a
/// warning: both keep going and the last progress write wins.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<tokio::sync::Mutex<HashMap<String, TrackedTask>>>,
    generations: Arc<AtomicU64>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `work` for a project. The task removes its own entry on exit
    /// unless a newer task has replaced it.
    pub async fn spawn<F, Fut>(&self, project_id: &str, work: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // Held across spawn so the task cannot deregister before it is inserted.
        let mut tasks = self.tasks.lock().await;

        if let Some(existing) = tasks.get(project_id)
            && !existing.handle.is_finished()
        {
            tracing::warn!(
                project_id,
                generation = existing.generation,
                "publish already running for project, starting another"
            );
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let fut = work(cancel.clone());
        let registry = self.clone();
        let key = project_id.to_string();
        let handle = tokio::spawn(async move {
            fut.await;
            registry.deregister(&key, generation).await;
        });

        tasks.insert(
            project_id.to_string(),
            TrackedTask {
                generation,
                cancel,
                handle,
            },
        );
    }

    async fn deregister(&self, project_id: &str, generation: u64) {
        let mut tasks = self.tasks.lock().await;
        if tasks.get(project_id).map(|t| t.generation) == Some(generation) {
            tasks.remove(project_id);
        }
    }

    pub async fn is_active(&self, project_id: &str) -> bool {
        self.tasks
            .lock()
            .await
            .get(project_id)
            .is_some_and(|t| !t.handle.is_finished())
    }

    pub async fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    /// Signal the project's task to stop. Returns false if none was registered.
    pub async fn cancel(&self, project_id: &str) -> bool {
        match self.tasks.lock().await.get(project_id) {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait for the project's current task to finish.
    pub async fn wait(&self, project_id: &str) {
        let handle = self.tasks.lock().await.remove(project_id).map(|t| t.handle);
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(project_id, error = %e, "publish task panicked");
        }
    }

    /// Cancel every task and wait (bounded) for them to exit.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, TrackedTask)> = self.tasks.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }
        tracing::info!(count = drained.len(), "cancelling publish tasks");
        for (_, task) in &drained {
            task.cancel.cancel();
        }
        for (project_id, task) in drained {
            match tokio::time::timeout(SHUTDOWN_GRACE, task.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(project_id = %project_id, error = %e, "publish task panicked"),
                Err(_) => tracing::warn!(project_id = %project_id, "publish task did not stop in time"),
            }
        }
    }
}

/// What the synchronous phase of a publish settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAccepted {
    pub project_id: String,
    /// Remote application id; absent for local builds.
    pub target_id: Option<String>,
    pub total_steps: u32,
}

/// Drives a publish from the authenticated request to the background task.
pub struct PublishOrchestrator {
    store: SharedStore,
    backend: DeploymentBackend,
    auth_token: String,
    poll_interval: Duration,
    poll_timeout: Duration,
    tasks: TaskRegistry,
}

impl PublishOrchestrator {
    pub fn new(
        store: SharedStore,
        backend: DeploymentBackend,
        auth_token: impl Into<String>,
        polling: &PollingConfig,
    ) -> Self {
        Self {
            store,
            backend,
            auth_token: auth_token.into(),
            poll_interval: polling.interval(),
            poll_timeout: polling.timeout(),
            tasks: TaskRegistry::new(),
        }
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_timeout = timeout;
        self
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn backend(&self) -> &DeploymentBackend {
        &self.backend
    }

    /// Check the shared secret. An empty configured token accepts nothing.
    pub fn authenticate(&self, auth_key: Option<&str>) -> PublishResult<()> {
        match auth_key {
            Some(key) if !self.auth_token.is_empty() && key == self.auth_token => Ok(()),
            _ => Err(PublishError::Unauthenticated),
        }
    }

    /// Run the synchronous part of a publish and hand the rest to a
    /// background task. Nothing is written unless the caller is authenticated
    /// and owns the project.
    #[tracing::instrument(skip(self, auth_key), fields(backend = self.backend.kind().as_str()))]
    pub async fn publish(
        &self,
        auth_key: Option<&str>,
        project_id: &str,
        owner_id: &str,
    ) -> PublishResult<PublishAccepted> {
        self.authenticate(auth_key)?;

        let project = self
            .store
            .find_project(project_id, owner_id)
            .await?
            .ok_or_else(|| PublishError::ProjectNotFound {
                project_id: project_id.to_string(),
                owner_id: owner_id.to_string(),
            })?;

        let total_steps = self.backend.total_steps();
        match &self.backend {
            DeploymentBackend::Remote(remote) => {
                // A failed create or trigger leaves the previous progress in place.
                let target_id = self.ensure_and_deploy(remote, &project).await?;
                self.store.set_build_progress(&project.id, 0, total_steps).await?;
                self.spawn_polling(remote.clone(), &project, target_id.clone()).await;
                Ok(PublishAccepted {
                    project_id: project.id,
                    target_id: Some(target_id),
                    total_steps,
                })
            }
            DeploymentBackend::LocalDocker(local) => {
                if let Some(pid) = project.supervised_process_id {
                    local.supervisor().reap(self.store.as_ref(), &project.id, Some(pid)).await?;
                }
                self.store.set_build_progress(&project.id, 0, total_steps).await?;
                self.spawn_local_build(local.clone(), &project).await;
                Ok(PublishAccepted {
                    project_id: project.id,
                    target_id: None,
                    total_steps,
                })
            }
        }
    }

    async fn ensure_and_deploy(&self, remote: &RemoteApiBackend, project: &Project) -> PublishResult<String> {
        let target = remote.ensure_target(project).await?;
        let mut target_id = target.id;
        let mut deploy_requested = target.deploy_requested;
        if target.created && !self.store.set_deployment_target(&project.id, &target_id).await? {
            let stored = self.recorded_target(project).await?;
            tracing::warn!(
                project_id = %project.id,
                app_id = %stored,
                orphaned_app_id = %target_id,
                "another publish recorded an application first, deploying the stored one"
            );
            target_id = stored;
            deploy_requested = false;
        }
        if !deploy_requested {
            remote.trigger(&target_id).await?;
        }
        Ok(target_id)
    }

    /// The application id currently stored on the project row.
    async fn recorded_target(&self, project: &Project) -> PublishResult<String> {
        self.store
            .find_project(&project.id, &project.owner_id)
            .await?
            .map(|p| p.deployment_target_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| PublishError::ProjectNotFound {
                project_id: project.id.clone(),
                owner_id: project.owner_id.clone(),
            })
    }

    async fn spawn_polling(&self, remote: RemoteApiBackend, project: &Project, target_id: String) {
        let store = self.store.clone();
        let project_id = project.id.clone();
        let interval = self.poll_interval;
        let timeout = self.poll_timeout;
        self.tasks
            .spawn(&project.id, move |cancel| async move {
                let polling = poll_deployment(&store, &remote, &project_id, &target_id, interval);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!(project_id = %project_id, "deployment polling cancelled");
                    }
                    result = tokio::time::timeout(timeout, polling) => match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::error!(project_id = %project_id, error = %e, "deployment polling failed");
                        }
                        Err(_) => {
                            tracing::error!(
                                project_id = %project_id,
                                timeout_secs = timeout.as_secs(),
                                "deployment did not finish in time, stopped polling"
                            );
                        }
                    },
                }
            })
            .await;
    }

    async fn spawn_local_build(&self, local: LocalDockerBackend, project: &Project) {
        let store = self.store.clone();
        let project = project.clone();
        let project_id = project.id.clone();
        self.tasks
            .spawn(&project_id, move |cancel| async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let pid = local.supervisor().running_pid(&project.id);
                        tracing::warn!(project_id = %project.id, ?pid, "local build cancelled");
                        ProcessSupervisor::kill(pid);
                    }
                    result = local.build_and_run(store.as_ref(), &project) => {
                        if let Err(e) = result {
                            tracing::error!(project_id = %project.id, error = %e, "local build failed");
                        }
                    }
                }
            })
            .await;
    }

    /// Cancel all background work. Called on server shutdown.
    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
    }
}

/// Follow a platform deployment until it reports `finished`, persisting each
/// step that moves the progress forward.
async fn poll_deployment(
    store: &SharedStore,
    remote: &RemoteApiBackend,
    project_id: &str,
    target_id: &str,
    interval: Duration,
) -> PublishResult<()> {
    let Some(deployment) = remote.find_active_deployment(target_id).await? else {
        tracing::info!(project_id, app_id = target_id, "no active deployment found");
        return Ok(());
    };
    tracing::info!(project_id, deployment_uuid = %deployment.deployment_uuid, "polling deployment");

    let mut tracker = StepTracker::new();
    loop {
        let log = remote.fetch_log(&deployment).await?;
        if let Some(step) = parse_step(&log.chunks())
            && tracker.advance(step)
        {
            tracing::info!(project_id, step, "build progress");
            store
                .set_build_progress(project_id, step, REMOTE_TOTAL_STEPS)
                .await?;
        }
        if log.is_terminal() {
            tracing::info!(project_id, last_step = tracker.last(), "deployment finished");
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
}
