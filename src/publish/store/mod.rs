//! Project row persistence.
//!
//! The project table is owned by the provisioning flow; the publisher reads
//! identity and config fields and writes only the deployment target id, the
//! supervised process id and the two build counters. Production runs against
//! Postgres; SQLite backs local development and tests.

mod postgres;
mod sqlite;

pub use postgres::PostgresProjectStore;
pub use sqlite::{DbHandle, SqliteProjectStore};

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::PublishResult;

use super::models::Project;

/// Read/update access to the publish-relevant fields of a project.
///
/// Writes are not serialized across callers: two attempts writing progress
/// for the same project race and the last write wins.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Load a project scoped by both its id and its owner.
    async fn find_project(&self, project_id: &str, owner_id: &str)
    -> PublishResult<Option<Project>>;

    /// Record the backend's target id. Only succeeds while the stored id is
    /// empty; returns whether the row was updated.
    async fn set_deployment_target(&self, project_id: &str, target_id: &str)
    -> PublishResult<bool>;

    async fn set_build_progress(
        &self,
        project_id: &str,
        last_step: u32,
        total_steps: u32,
    ) -> PublishResult<()>;

    /// Persist (or clear, with `None`) the pid of the project's local build.
    async fn set_supervised_process(&self, project_id: &str, pid: Option<u32>)
    -> PublishResult<()>;
}

pub type SharedStore = Arc<dyn ProjectStore>;

/// Open a store from a connection URL: `sqlite:<path>`, `sqlite::memory:`, or
/// any Postgres URL.
pub async fn connect(url: &str) -> PublishResult<SharedStore> {
    if let Some(target) = url.strip_prefix("sqlite:") {
        let store = if target == ":memory:" {
            SqliteProjectStore::in_memory()?
        } else {
            SqliteProjectStore::open(std::path::Path::new(target))?
        };
        tracing::info!(url, "using SQLite project store");
        return Ok(Arc::new(store));
    }
    let store = PostgresProjectStore::connect(url).await?;
    tracing::info!("using Postgres project store");
    Ok(Arc::new(store))
}
