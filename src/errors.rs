//! Typed error hierarchy for the publisher.
//!
//! A single enum, `PublishError`, covers the request path, the deployment
//! backends and persistence. The HTTP layer maps variants to status codes in
//! `publish::api`; background tasks log and swallow them.

use thiserror::Error;

pub type PublishResult<T> = Result<T, PublishError>;

/// Errors raised while publishing a project.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Missing or invalid auth key")]
    Unauthenticated,

    #[error("Project {project_id} not found for user {owner_id}")]
    ProjectNotFound { project_id: String, owner_id: String },

    /// The platform refused the domain, usually because it has not finished
    /// releasing it after a deletion. Retried by the create path.
    #[error("Domain conflict while creating application {name}: {message}")]
    DomainConflict { name: String, message: String },

    #[error("Platform returned {status} for {endpoint}: {message}")]
    Platform {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Platform request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with code {code:?}")]
    CommandFailed { command: String, code: Option<i32> },

    #[error("Database error: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl PublishError {
    pub fn persistence(err: impl Into<anyhow::Error>) -> Self {
        Self::Persistence(err.into())
    }

    /// True for the only error kind the create path retries.
    pub fn is_domain_conflict(&self) -> bool {
        matches!(self, Self::DomainConflict { .. })
    }

    /// Errors that originate from the deployment backend rather than from
    /// the caller or our own database.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Self::DomainConflict { .. }
                | Self::Platform { .. }
                | Self::Transport(_)
                | Self::SpawnFailed { .. }
                | Self::CommandFailed { .. }
        )
    }
}

impl From<sqlx::Error> for PublishError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.into())
    }
}

impl From<rusqlite::Error> for PublishError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence(err.into())
    }
}
