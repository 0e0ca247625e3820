//! Local builds through the docker CLI.
//!
//! A publish runs three sub-phases against the host's docker daemon: build the
//! image from the rendered Dockerfile, tear down whatever the previous image
//! left behind, then push the new image. Build progress comes from BuildKit's
//! plain output on stderr.

use tokio::process::Command;

use crate::config::{AppBuildConfig, LocalDockerConfig};
use crate::errors::{PublishError, PublishResult};
use crate::publish::models::{LOCAL_DOCKER_TOTAL_STEPS, Project};
use crate::publish::progress::{StepTracker, parse_step};
use crate::publish::store::ProjectStore;
use crate::publish::supervisor::{ProcessSupervisor, SupervisedProcess};

use super::render_dockerfile;

/// Step reported once the image has been built.
pub const BUILD_DONE_STEP: u32 = 12;
/// Step reported once old containers and images are gone.
pub const TEARDOWN_DONE_STEP: u32 = 13;

const LABEL_KEY: &str = "publisher.project";

#[derive(Clone)]
pub struct LocalDockerBackend {
    supervisor: ProcessSupervisor,
    app: AppBuildConfig,
    docker: LocalDockerConfig,
}

impl LocalDockerBackend {
    pub fn new(supervisor: ProcessSupervisor, app: AppBuildConfig, docker: LocalDockerConfig) -> Self {
        Self {
            supervisor,
            app,
            docker,
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn image_tag(&self, project: &Project) -> String {
        format!("{}/{}:latest", self.docker.registry.trim_end_matches('/'), project.slug)
    }

    pub fn label(&self, project: &Project) -> String {
        format!("{}={}", LABEL_KEY, project.slug)
    }

    /// Build, tear down and push. The persisted supervised-process id is only
    /// cleared when all three succeed.
    pub async fn build_and_run(&self, store: &dyn ProjectStore, project: &Project) -> PublishResult<()> {
        self.build(store, project).await?;
        self.report(store, project, BUILD_DONE_STEP).await?;

        self.teardown(project).await?;
        self.report(store, project, TEARDOWN_DONE_STEP).await?;

        let tag = self.image_tag(project);
        self.run(&["push".to_string(), tag]).await?;
        self.report(store, project, LOCAL_DOCKER_TOTAL_STEPS).await?;

        store.set_supervised_process(&project.id, None).await?;
        tracing::info!(project_id = %project.id, image = %self.image_tag(project), "local publish complete");
        Ok(())
    }

    async fn report(&self, store: &dyn ProjectStore, project: &Project, step: u32) -> PublishResult<()> {
        tracing::info!(project_id = %project.id, step, "build progress");
        store
            .set_build_progress(&project.id, step, LOCAL_DOCKER_TOTAL_STEPS)
            .await
    }

    async fn build(&self, store: &dyn ProjectStore, project: &Project) -> PublishResult<()> {
        let args = vec![
            "build".to_string(),
            "--progress=plain".to_string(),
            "--label".to_string(),
            self.label(project),
            "-t".to_string(),
            self.image_tag(project),
            "-".to_string(),
        ];
        let dockerfile = render_dockerfile(&self.app, project);
        let mut process = self.supervisor.spawn(
            &project.id,
            &self.docker.docker_bin,
            &args,
            Some(dockerfile.into_bytes()),
        )?;
        let pid = process.pid();
        tracing::info!(project_id = %project.id, ?pid, "docker build started");

        let result = self.supervise_build(store, project, &mut process).await;
        self.supervisor.release(&project.id, pid);
        result
    }

    async fn supervise_build(
        &self,
        store: &dyn ProjectStore,
        project: &Project,
        process: &mut SupervisedProcess,
    ) -> PublishResult<()> {
        let pid = process.pid();
        if let Err(e) = self.supervisor.track(store, &project.id, pid).await {
            ProcessSupervisor::kill(pid);
            let _ = process.wait().await;
            return Err(e);
        }

        if let Err(e) = self.follow_build(store, project, process).await {
            tracing::error!(project_id = %project.id, ?pid, error = %e, "aborting docker build");
            ProcessSupervisor::kill(pid);
            let _ = process.wait().await;
            return Err(e);
        }

        match process.wait().await? {
            Some(0) => Ok(()),
            code => Err(PublishError::CommandFailed {
                command: process.command().to_string(),
                code,
            }),
        }
    }

    /// Feed stderr to the step parser until the stream closes. Stdout is
    /// drained in the background so the pipe never fills.
    async fn follow_build(
        &self,
        store: &dyn ProjectStore,
        project: &Project,
        process: &mut SupervisedProcess,
    ) -> PublishResult<()> {
        if let Some(mut stdout) = process.take_stdout() {
            let project_id = project.id.clone();
            tokio::spawn(async move {
                while let Ok(Some(line)) = stdout.next_line().await {
                    tracing::trace!(project_id = %project_id, "{}", line);
                }
            });
        }

        let Some(mut stderr) = process.take_stderr() else {
            return Ok(());
        };
        let mut tracker = StepTracker::new();
        loop {
            let line = match stderr.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(project_id = %project.id, error = %e, "build output unreadable, waiting for exit");
                    break;
                }
            };
            tracing::debug!(project_id = %project.id, "{}", line);
            // Steps past the build range belong to teardown and push.
            let Some(step) = parse_step(&[line.as_str()]).map(|s| s.min(BUILD_DONE_STEP - 1)) else {
                continue;
            };
            if tracker.advance(step) {
                self.report(store, project, step).await?;
            }
        }
        Ok(())
    }

    /// Remove the project's containers and the images its previous builds left.
    async fn teardown(&self, project: &Project) -> PublishResult<()> {
        let filter = format!("label={}", self.label(project));
        let listed = self
            .run(&["ps".into(), "-aq".into(), "--filter".into(), filter.clone()])
            .await?;
        let containers: Vec<String> = listed.split_whitespace().map(String::from).collect();
        if !containers.is_empty() {
            tracing::info!(project_id = %project.id, count = containers.len(), "removing containers");
            let mut args = vec!["rm".to_string(), "-f".to_string()];
            args.extend(containers);
            self.run(&args).await?;
        }
        self.run(&[
            "image".into(),
            "prune".into(),
            "-f".into(),
            "--filter".into(),
            filter,
        ])
        .await?;
        Ok(())
    }

    /// Run a short docker command to completion and return its stdout.
    async fn run(&self, args: &[String]) -> PublishResult<String> {
        let command = format!(
            "{} {}",
            self.docker.docker_bin,
            args.first().map(String::as_str).unwrap_or("")
        );
        let output = Command::new(&self.docker.docker_bin)
            .args(args)
            .output()
            .await
            .map_err(|source| PublishError::SpawnFailed {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            tracing::warn!(
                command = %command,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "docker command failed"
            );
            return Err(PublishError::CommandFailed {
                command,
                code: output.status.code(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
