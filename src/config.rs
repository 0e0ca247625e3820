use std::time::Duration;

use clap::{Args, Parser, ValueEnum};

use crate::errors::{PublishError, PublishResult};

/// Which deployment backend drives builds. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Remote hosting platform REST API (Coolify).
    Remote,
    /// Docker CLI on this host.
    LocalDocker,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::LocalDocker => "local-docker",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Runtime configuration for the publisher.
///
/// Every option falls back to an environment variable so the service can be
/// configured entirely through the environment (or a `.env` file).
#[derive(Debug, Clone, Parser)]
#[command(name = "publisher")]
#[command(version, about = "Publish generated web applications and track build progress")]
pub struct PublisherConfig {
    #[arg(long, env = "LISTEN_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value = "3000")]
    pub port: u16,

    /// Postgres URL, or `sqlite:<path>` / `sqlite::memory:` for local use.
    #[arg(long, env = "PG_URL")]
    pub database_url: String,

    /// Shared secret expected in the `X-Auth-Key` header.
    #[arg(long, env = "GENERATOR_SERVER_TOKEN", hide_env_values = true)]
    pub auth_token: String,

    #[arg(long, env = "PUBLISH_BACKEND", value_enum, default_value = "remote")]
    pub backend: BackendKind,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "pretty")]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub app: AppBuildConfig,

    #[command(flatten)]
    pub remote: RemoteApiConfig,

    #[command(flatten)]
    pub docker: LocalDockerConfig,

    #[command(flatten)]
    pub polling: PollingConfig,
}

/// Values baked into every generated application's image.
#[derive(Debug, Clone, Default, Args)]
pub struct AppBuildConfig {
    /// Domain under which `{slug}.{domain}` hostnames are published.
    #[arg(long, env = "MAIN_HOST_DOMAIN", default_value = "")]
    pub main_host_domain: String,

    #[arg(long, env = "APP_DOCKER_BASE_IMAGE", default_value = "")]
    pub base_image: String,

    #[arg(long, env = "APP_PG_URL", default_value = "", hide_env_values = true)]
    pub app_database_url: String,

    #[arg(long, env = "APP_NEXT_PUBLIC_UMAMI_URL", default_value = "")]
    pub umami_url: String,

    #[arg(long, env = "APP_NEXT_PUBLIC_ICONIFY_API_URL", default_value = "")]
    pub iconify_api_url: String,
}

#[derive(Debug, Clone, Default, Args)]
pub struct RemoteApiConfig {
    #[arg(long = "coolify-base-url", env = "COOLIFY_BASE_URL", default_value = "")]
    pub base_url: String,

    #[arg(
        long = "coolify-api-token",
        env = "COOLIFY_API_TOKEN",
        default_value = "",
        hide_env_values = true
    )]
    pub api_token: String,

    #[arg(long = "coolify-server-uuid", env = "COOLIFY_SERVER_UUID", default_value = "")]
    pub server_uuid: String,

    #[arg(long = "coolify-project-uuid", env = "COOLIFY_PROJECT_UUID", default_value = "")]
    pub project_uuid: String,

    #[arg(
        long = "coolify-environment",
        env = "COOLIFY_PROJECT_ENVIRONMENT_NAME",
        default_value = "production"
    )]
    pub environment_name: String,

    /// Timeout applied to every request sent to the platform.
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value = "30")]
    pub http_timeout_secs: u64,

    /// Upper bound on create attempts while the platform reports a domain conflict.
    #[arg(long, env = "CREATE_MAX_ATTEMPTS", default_value = "10")]
    pub create_max_attempts: u32,

    /// Call the application PATCH endpoint on redeploy. Off by default: the
    /// platform currently rejects domain updates.
    #[arg(long, env = "UPDATE_DOMAINS_ON_REDEPLOY", default_value = "false")]
    pub update_domains_on_redeploy: bool,
}

#[derive(Debug, Clone, Args)]
pub struct LocalDockerConfig {
    #[arg(long, env = "DOCKER_BIN", default_value = "docker")]
    pub docker_bin: String,

    /// Registry prefix for `{registry}/{slug}:latest` image tags.
    #[arg(long, env = "APP_DOCKER_REGISTRY", default_value = "")]
    pub registry: String,
}

impl Default for LocalDockerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            registry: String::new(),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct PollingConfig {
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "5")]
    pub poll_interval_secs: u64,

    /// Give up on a deployment that has not finished after this long.
    #[arg(long, env = "POLL_TIMEOUT_SECS", default_value = "3600")]
    pub poll_timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            poll_timeout_secs: 3600,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

impl PublisherConfig {
    /// Check that the settings required by the selected backend are present.
    pub fn validate(&self) -> PublishResult<()> {
        let mut missing = Vec::new();
        if self.auth_token.is_empty() {
            missing.push("GENERATOR_SERVER_TOKEN");
        }
        if self.app.main_host_domain.is_empty() && self.backend == BackendKind::Remote {
            missing.push("MAIN_HOST_DOMAIN");
        }
        if self.app.base_image.is_empty() {
            missing.push("APP_DOCKER_BASE_IMAGE");
        }

        match self.backend {
            BackendKind::Remote => {
                let remote = [
                    ("COOLIFY_BASE_URL", &self.remote.base_url),
                    ("COOLIFY_API_TOKEN", &self.remote.api_token),
                    ("COOLIFY_SERVER_UUID", &self.remote.server_uuid),
                    ("COOLIFY_PROJECT_UUID", &self.remote.project_uuid),
                ];
                missing.extend(
                    remote
                        .iter()
                        .filter(|(_, value)| value.is_empty())
                        .map(|(name, _)| *name),
                );
                if self.remote.create_max_attempts == 0 {
                    return Err(PublishError::Config(
                        "CREATE_MAX_ATTEMPTS must be at least 1".to_string(),
                    ));
                }
            }
            BackendKind::LocalDocker => {
                if self.docker.registry.is_empty() {
                    missing.push("APP_DOCKER_REGISTRY");
                }
            }
        }

        if self.polling.poll_interval_secs == 0 {
            return Err(PublishError::Config(
                "POLL_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(PublishError::Config(format!(
                "missing required settings: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
