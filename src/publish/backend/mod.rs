//! Deployment backends.
//!
//! Two variants share one capability: the remote platform API, which builds
//! and deploys on the platform and is observed by polling its logs, and the
//! local docker CLI, which builds on this host under [`ProcessSupervisor`].
//!
//! [`ProcessSupervisor`]: super::supervisor::ProcessSupervisor

pub mod coolify;
pub mod docker;
pub mod remote;

pub use coolify::CoolifyClient;
pub use docker::LocalDockerBackend;
pub use remote::{PlatformApi, RemoteApiBackend, RetryPolicy};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{AppBuildConfig, BackendKind, PublisherConfig};
use crate::errors::PublishResult;

use super::models::{LOCAL_DOCKER_TOTAL_STEPS, Project, REMOTE_TOTAL_STEPS};
use super::progress::parse_remote_log;
use super::supervisor::ProcessSupervisor;

/// Platform status that ends the polling loop.
pub const TERMINAL_STATUS: &str = "finished";

/// Outcome of making sure a deployment target exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredTarget {
    pub id: String,
    /// A new target was created and its id must be persisted.
    pub created: bool,
    /// The call already asked the platform to deploy; no separate trigger.
    pub deploy_requested: bool,
}

/// A deployment currently running on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentHandle {
    pub deployment_uuid: String,
    pub deployment_url: String,
}

/// Log snapshot and status of a platform deployment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentLog {
    #[serde(default)]
    pub logs: String,
    #[serde(default)]
    pub status: String,
}

impl DeploymentLog {
    pub fn is_terminal(&self) -> bool {
        self.status == TERMINAL_STATUS
    }

    pub fn chunks(&self) -> Vec<String> {
        parse_remote_log(&self.logs)
    }
}

/// The backend selected at startup.
#[derive(Clone)]
pub enum DeploymentBackend {
    Remote(RemoteApiBackend),
    LocalDocker(LocalDockerBackend),
}

impl DeploymentBackend {
    pub fn from_config(config: &PublisherConfig, supervisor: ProcessSupervisor) -> PublishResult<Self> {
        Ok(match config.backend {
            BackendKind::Remote => {
                let client = CoolifyClient::from_config(&config.remote)?;
                Self::Remote(RemoteApiBackend::new(
                    Arc::new(client),
                    config.app.clone(),
                    &config.remote,
                ))
            }
            BackendKind::LocalDocker => Self::LocalDocker(LocalDockerBackend::new(
                supervisor,
                config.app.clone(),
                config.docker.clone(),
            )),
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Remote(_) => BackendKind::Remote,
            Self::LocalDocker(_) => BackendKind::LocalDocker,
        }
    }

    /// Fixed step count reported for the whole attempt.
    pub fn total_steps(&self) -> u32 {
        match self {
            Self::Remote(_) => REMOTE_TOTAL_STEPS,
            Self::LocalDocker(_) => LOCAL_DOCKER_TOTAL_STEPS,
        }
    }
}

/// Render the two-stage Dockerfile that builds a generated application and
/// serves its static export through nginx.
pub fn render_dockerfile(app: &AppBuildConfig, project: &Project) -> String {
    let mut lines = vec![
        format!("FROM {} AS installer", app.base_image),
        format!("ENV PG_URL={}", app.app_database_url),
        format!("ENV PROJECT_ID={}", project.id),
    ];
    lines.extend(
        project
            .env
            .iter()
            .map(|(key, value)| format!("ENV {}={}", key, value)),
    );
    lines.push(format!("ENV NEXT_PUBLIC_UMAMI_URL={}", app.umami_url));
    lines.push(format!(
        "ENV NEXT_PUBLIC_ICONIFY_API_URL={}",
        app.iconify_api_url
    ));
    lines.extend(
        [
            "RUN pnpm run build",
            "FROM nginx:1.27.0 AS runner",
            "WORKDIR /app",
            "COPY --from=installer /app/nginx.conf /etc/nginx/conf.d/default.conf",
            "COPY --from=installer /app/out /var/www/out",
        ]
        .map(String::from),
    );
    let mut dockerfile = lines.join("\n");
    dockerfile.push('\n');
    dockerfile
}
