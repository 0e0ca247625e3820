//! Publishing through a remote hosting platform.
//!
//! [`PlatformApi`] is the seam over the platform's REST surface and
//! [`RemoteApiBackend`] layers application reuse, conflict retries and
//! deployment lookup on top of it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

use crate::config::{AppBuildConfig, RemoteApiConfig};
use crate::errors::{PublishError, PublishResult};
use crate::publish::models::Project;

use super::{DeploymentHandle, DeploymentLog, EnsuredTarget, render_dockerfile};

/// Body of the "create application from inline Dockerfile" call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreateApplication {
    pub name: String,
    pub domains: String,
    pub server_uuid: String,
    pub project_uuid: String,
    pub environment_name: String,
    /// Base64-encoded Dockerfile.
    pub dockerfile: String,
    pub instant_deploy: bool,
}

/// The hosting platform's REST surface.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Create an application and return its id. A domain collision must be
    /// reported as [`PublishError::DomainConflict`].
    async fn create_application(&self, request: &CreateApplication) -> PublishResult<String>;

    async fn update_domains(
        &self,
        app_id: &str,
        domains: &str,
        instant_deploy: bool,
    ) -> PublishResult<()>;

    async fn deploy(&self, app_id: &str) -> PublishResult<()>;

    async fn list_deployments(&self) -> PublishResult<Vec<DeploymentHandle>>;

    async fn deployment(&self, deployment_uuid: &str) -> PublishResult<DeploymentLog>;
}

/// Bounded exponential backoff for domain-conflict retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): doubles each time, capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(retry);
        self.initial_delay.saturating_mul(multiplier).min(self.max_delay)
    }
}

/// Cluster placement for newly created applications.
#[derive(Debug, Clone, Default)]
struct Placement {
    server_uuid: String,
    project_uuid: String,
    environment_name: String,
}

/// Deploys through the remote platform and observes progress by polling.
#[derive(Clone)]
pub struct RemoteApiBackend {
    api: Arc<dyn PlatformApi>,
    app: AppBuildConfig,
    placement: Placement,
    retry: RetryPolicy,
    update_domains_on_redeploy: bool,
}

impl RemoteApiBackend {
    pub fn new(api: Arc<dyn PlatformApi>, app: AppBuildConfig, remote: &RemoteApiConfig) -> Self {
        Self {
            api,
            app,
            placement: Placement {
                server_uuid: remote.server_uuid.clone(),
                project_uuid: remote.project_uuid.clone(),
                environment_name: remote.environment_name.clone(),
            },
            retry: RetryPolicy {
                max_attempts: remote.create_max_attempts.max(1),
                ..RetryPolicy::default()
            },
            update_domains_on_redeploy: remote.update_domains_on_redeploy,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Create the project's application, or reuse the existing one.
    pub async fn ensure_target(&self, project: &Project) -> PublishResult<EnsuredTarget> {
        let domains = project.domains(&self.app.main_host_domain);

        if project.has_deployment_target() {
            let id = project.deployment_target_id.clone();
            if !self.update_domains_on_redeploy {
                return Ok(EnsuredTarget {
                    id,
                    created: false,
                    deploy_requested: false,
                });
            }
            tracing::info!(project_id = %project.id, app_id = %id, %domains, "updating application domains");
            self.api.update_domains(&id, &domains, true).await?;
            return Ok(EnsuredTarget {
                id,
                created: false,
                deploy_requested: true,
            });
        }

        let dockerfile = render_dockerfile(&self.app, project);
        let request = CreateApplication {
            name: project.slug.clone(),
            domains,
            server_uuid: self.placement.server_uuid.clone(),
            project_uuid: self.placement.project_uuid.clone(),
            environment_name: self.placement.environment_name.clone(),
            dockerfile: STANDARD.encode(dockerfile),
            instant_deploy: false,
        };
        let id = self.create_with_retry(&request).await?;
        tracing::info!(project_id = %project.id, app_id = %id, "created application");
        Ok(EnsuredTarget {
            id,
            created: true,
            deploy_requested: false,
        })
    }

    /// The platform sometimes rejects a domain it has not finished releasing
    /// after a deletion, so conflicts are retried. Any other error is final.
    async fn create_with_retry(&self, request: &CreateApplication) -> PublishResult<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.api.create_application(request).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_domain_conflict() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt - 1);
                    tracing::warn!(
                        name = %request.name,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "domain conflict creating application, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn trigger(&self, target_id: &str) -> PublishResult<()> {
        tracing::info!(app_id = %target_id, "triggering deploy");
        self.api.deploy(target_id).await
    }

    /// The running deployment whose URL mentions the target id.
    pub async fn find_active_deployment(
        &self,
        target_id: &str,
    ) -> PublishResult<Option<DeploymentHandle>> {
        let deployments = self.api.list_deployments().await?;
        Ok(deployments
            .into_iter()
            .find(|d| d.deployment_url.contains(target_id)))
    }

    pub async fn fetch_log(&self, deployment: &DeploymentHandle) -> PublishResult<DeploymentLog> {
        self.api.deployment(&deployment.deployment_uuid).await
    }
}
