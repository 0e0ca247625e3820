//! SQLite-backed [`ProjectStore`] for local runs and tests.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::{PublishError, PublishResult};
use crate::publish::models::{Project, env_from_json};

use super::ProjectStore;

/// One SQLite connection shared across tasks. Each call borrows it on the
/// blocking pool.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Connection>>,
}

impl DbHandle {
    pub fn new(conn: Connection) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(conn)),
        }
    }

    /// Run `f` against the connection off the async workers. Captures must
    /// be owned.
    pub async fn call<F, R>(&self, f: F) -> PublishResult<R>
    where
        F: FnOnce(&Connection) -> PublishResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| PublishError::persistence(anyhow::anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")
        .map_err(PublishError::Persistence)?
    }
}

/// SQLite-backed project store for local development and tests.
///
/// Unlike Postgres, the table is created on open and rows can be seeded with
/// [`SqliteProjectStore::upsert_project`].
#[derive(Clone)]
pub struct SqliteProjectStore {
    db: DbHandle,
}

impl SqliteProjectStore {
    pub fn open(path: &Path) -> PublishResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .context("Failed to create database directory")
                .map_err(PublishError::Persistence)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> PublishResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> PublishResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS project (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                business_name_slug TEXT NOT NULL,
                custom_domain TEXT,
                use_custom_domain INTEGER NOT NULL DEFAULT 0,
                app_id TEXT NOT NULL DEFAULT '',
                build_pid INTEGER,
                build_last_step INTEGER NOT NULL DEFAULT 0,
                build_total_step INTEGER NOT NULL DEFAULT 0,
                env TEXT NOT NULL DEFAULT '{}'
            );
            ",
        )?;
        Ok(Self {
            db: DbHandle::new(conn),
        })
    }

    /// Insert or replace a project row.
    pub async fn upsert_project(&self, project: &Project) -> PublishResult<()> {
        let project = project.clone();
        let env = serde_json::to_string(&project.env)
            .context("Failed to encode project env")
            .map_err(PublishError::Persistence)?;
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO project (
                        id, user_id, business_name_slug, custom_domain, use_custom_domain,
                        app_id, build_pid, build_last_step, build_total_step, env
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        project.id,
                        project.owner_id,
                        project.slug,
                        project.custom_domain,
                        project.use_custom_domain,
                        project.deployment_target_id,
                        project.supervised_process_id,
                        project.build_last_step,
                        project.build_total_step,
                        env,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Load a project by id alone. Not part of [`ProjectStore`]: the publish
    /// path must always scope reads by owner.
    pub async fn get_project(&self, project_id: &str) -> PublishResult<Option<Project>> {
        let project_id = project_id.to_string();
        self.db
            .call(move |conn| {
                let project = conn
                    .query_row(
                        &format!("{} WHERE id = ?1", SELECT_PROJECT),
                        params![project_id],
                        row_to_project,
                    )
                    .optional()?;
                Ok(project)
            })
            .await
    }
}

const SELECT_PROJECT: &str = "SELECT id, user_id, business_name_slug, custom_domain, \
     use_custom_domain, app_id, build_pid, build_last_step, build_total_step, env FROM project";

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let env: String = row.get("env")?;
    let env = serde_json::from_str::<serde_json::Value>(&env)
        .map(|v| env_from_json(&v))
        .unwrap_or_default();
    Ok(Project {
        id: row.get("id")?,
        owner_id: row.get("user_id")?,
        slug: row.get("business_name_slug")?,
        custom_domain: row.get("custom_domain")?,
        use_custom_domain: row.get("use_custom_domain")?,
        deployment_target_id: row.get("app_id")?,
        supervised_process_id: row.get("build_pid")?,
        build_last_step: row.get("build_last_step")?,
        build_total_step: row.get("build_total_step")?,
        env,
    })
}

#[async_trait]
impl ProjectStore for SqliteProjectStore {
    async fn find_project(
        &self,
        project_id: &str,
        owner_id: &str,
    ) -> PublishResult<Option<Project>> {
        let project_id = project_id.to_string();
        let owner_id = owner_id.to_string();
        self.db
            .call(move |conn| {
                let project = conn
                    .query_row(
                        &format!("{} WHERE id = ?1 AND user_id = ?2", SELECT_PROJECT),
                        params![project_id, owner_id],
                        row_to_project,
                    )
                    .optional()?;
                Ok(project)
            })
            .await
    }

    async fn set_deployment_target(&self, project_id: &str, target_id: &str) -> PublishResult<bool> {
        let project_id = project_id.to_string();
        let target_id = target_id.to_string();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE project SET app_id = ?1 WHERE id = ?2 AND app_id = ''",
                    params![target_id, project_id],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    async fn set_build_progress(
        &self,
        project_id: &str,
        last_step: u32,
        total_steps: u32,
    ) -> PublishResult<()> {
        let project_id = project_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE project SET build_last_step = ?1, build_total_step = ?2 WHERE id = ?3",
                    params![last_step, total_steps, project_id],
                )?;
                Ok(())
            })
            .await
    }

    async fn set_supervised_process(&self, project_id: &str, pid: Option<u32>) -> PublishResult<()> {
        let project_id = project_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE project SET build_pid = ?1 WHERE id = ?2",
                    params![pid, project_id],
                )?;
                Ok(())
            })
            .await
    }
}
