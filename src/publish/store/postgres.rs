//! PostgreSQL project store.
//!
//! The `project` table belongs to the provisioning flow, so no schema is
//! created here. Ids are compared as text so both `uuid` and `text` primary
//! keys work.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};

use crate::errors::{PublishError, PublishResult};
use crate::publish::models::{Project, env_from_json};

use super::ProjectStore;

#[derive(Clone)]
pub struct PostgresProjectStore {
    pool: PgPool,
}

impl PostgresProjectStore {
    pub async fn connect(url: &str) -> PublishResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    fn row_to_project(row: &PgRow) -> PublishResult<Project> {
        let pid: Option<i32> = row.try_get("build_pid")?;
        let last: Option<i32> = row.try_get("build_last_step")?;
        let total: Option<i32> = row.try_get("build_total_step")?;
        let env: Option<serde_json::Value> = row.try_get("env")?;

        Ok(Project {
            id: row.try_get("id")?,
            owner_id: row.try_get("user_id")?,
            slug: row.try_get("business_name_slug")?,
            custom_domain: row.try_get("custom_domain")?,
            use_custom_domain: row
                .try_get::<Option<bool>, _>("use_custom_domain")?
                .unwrap_or(false),
            deployment_target_id: row
                .try_get::<Option<String>, _>("app_id")?
                .unwrap_or_default(),
            supervised_process_id: pid.and_then(|p| u32::try_from(p).ok()).filter(|p| *p > 0),
            build_last_step: last.and_then(|s| u32::try_from(s).ok()).unwrap_or(0),
            build_total_step: total.and_then(|s| u32::try_from(s).ok()).unwrap_or(0),
            env: env.as_ref().map(env_from_json).unwrap_or_default(),
        })
    }
}

fn to_db_int(value: u32, field: &str) -> PublishResult<i32> {
    i32::try_from(value)
        .map_err(|_| PublishError::persistence(anyhow::anyhow!("{} {} out of range", field, value)))
}

#[async_trait]
impl ProjectStore for PostgresProjectStore {
    async fn find_project(
        &self,
        project_id: &str,
        owner_id: &str,
    ) -> PublishResult<Option<Project>> {
        let row = sqlx::query(
            r#"
            SELECT
                id::text AS id,
                user_id::text AS user_id,
                business_name_slug,
                custom_domain,
                use_custom_domain,
                app_id,
                build_pid,
                build_last_step,
                build_total_step,
                env
            FROM project
            WHERE id::text = $1
              AND user_id::text = $2
            "#,
        )
        .bind(project_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_project).transpose()
    }

    async fn set_deployment_target(&self, project_id: &str, target_id: &str) -> PublishResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE project
            SET app_id = $1
            WHERE id::text = $2
              AND (app_id IS NULL OR app_id = '')
            "#,
        )
        .bind(target_id)
        .bind(project_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_build_progress(
        &self,
        project_id: &str,
        last_step: u32,
        total_steps: u32,
    ) -> PublishResult<()> {
        sqlx::query(
            r#"
            UPDATE project
            SET build_last_step = $1, build_total_step = $2
            WHERE id::text = $3
            "#,
        )
        .bind(to_db_int(last_step, "build_last_step")?)
        .bind(to_db_int(total_steps, "build_total_step")?)
        .bind(project_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_supervised_process(&self, project_id: &str, pid: Option<u32>) -> PublishResult<()> {
        let pid = pid.map(|p| to_db_int(p, "build_pid")).transpose()?;
        sqlx::query("UPDATE project SET build_pid = $1 WHERE id::text = $2")
            .bind(pid)
            .bind(project_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
