//! Task outcome persistence
//!
//! Every operation writes the result row and mirrors the status onto the
//! parent scan inside one transaction.

use async_trait::async_trait;
use chrono::Utc;
use neurodx_common::{Result, TaskStatus};
use sqlx::{PgPool, Postgres, Transaction};

/// Durable record of task outcomes
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert the result row in `processing` and mark the scan `processing`
    async fn create(&self, scan_id: i64) -> Result<()>;

    /// Record a successful outcome (`done`)
    async fn complete(
        &self,
        scan_id: i64,
        diagnosis: i32,
        confidence: f32,
        artifact_key: &str,
    ) -> Result<()>;

    /// Record a failure (`failed`) with its message
    async fn fail(&self, scan_id: i64, error_message: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn set_scan_status(
    tx: &mut Transaction<'_, Postgres>,
    scan_id: i64,
    status: TaskStatus,
) -> Result<()> {
    sqlx::query("UPDATE mri_scans SET status = $1 WHERE id = $2")
        .bind(status.as_str())
        .bind(scan_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create(&self, scan_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO mri_analysis_results (scan_id, started_at, status)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(scan_id)
        .bind(Utc::now())
        .bind(TaskStatus::Processing.as_str())
        .execute(&mut *tx)
        .await?;

        set_scan_status(&mut tx, scan_id, TaskStatus::Processing).await?;
        tx.commit().await?;

        tracing::debug!(scan_id, "Task record created");
        Ok(())
    }

    async fn complete(
        &self,
        scan_id: i64,
        diagnosis: i32,
        confidence: f32,
        artifact_key: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE mri_analysis_results
            SET diagnosis = $1,
                confidence = $2,
                gradcam_url = $3,
                status = $4,
                completed_at = $5
            WHERE scan_id = $6
            "#,
        )
        .bind(diagnosis)
        .bind(confidence as f64)
        .bind(artifact_key)
        .bind(TaskStatus::Done.as_str())
        .bind(Utc::now())
        .bind(scan_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            // Dropping the transaction rolls it back
            return Err(neurodx_common::Error::RecordNotFound(scan_id));
        }

        set_scan_status(&mut tx, scan_id, TaskStatus::Done).await?;
        tx.commit().await?;

        tracing::debug!(scan_id, "Task record completed");
        Ok(())
    }

    async fn fail(&self, scan_id: i64, error_message: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE mri_analysis_results
            SET status = $1,
                error_message = $2,
                completed_at = $3
            WHERE scan_id = $4
            "#,
        )
        .bind(TaskStatus::Failed.as_str())
        .bind(error_message)
        .bind(Utc::now())
        .bind(scan_id)
        .execute(&mut *tx)
        .await?;

        set_scan_status(&mut tx, scan_id, TaskStatus::Failed).await?;
        tx.commit().await?;

        tracing::debug!(scan_id, "Task record failed");
        Ok(())
    }
}
