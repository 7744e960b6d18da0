use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::models::{RunFilter, RunRecord};

/// 运行记录仓储
pub struct RunRepository {
    pool: SqlitePool,
}

impl RunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 创建运行记录
    pub async fn create(&self, run: &RunRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs
            (script_name, description, start_time, end_time, duration_ms,
             total_actions, success_count, failed_count, skipped_count, passed, properties)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.script_name)
        .bind(&run.description)
        .bind(run.start_time)
        .bind(run.end_time)
        .bind(run.duration_ms)
        .bind(run.total_actions)
        .bind(run.success_count)
        .bind(run.failed_count)
        .bind(run.skipped_count)
        .bind(run.passed)
        .bind(&run.properties)
        .execute(&self.pool)
        .await?;

        let run_id = result.last_insert_rowid();
        debug!("Created run record with ID: {}", run_id);
        Ok(run_id)
    }

    /// 写入运行结束时的统计
    pub async fn finish(&self, run: &RunRecord) -> Result<()> {
        let end_time = run.end_time.unwrap_or_else(Utc::now);
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET end_time = ?, duration_ms = ?, total_actions = ?, success_count = ?,
                failed_count = ?, skipped_count = ?, passed = ?, properties = ?
            WHERE id = ?
            "#,
        )
        .bind(end_time)
        .bind(run.duration_ms)
        .bind(run.total_actions)
        .bind(run.success_count)
        .bind(run.failed_count)
        .bind(run.skipped_count)
        .bind(run.passed)
        .bind(&run.properties)
        .bind(run.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("Run {} not found", run.id)));
        }
        Ok(())
    }

    /// 根据ID获取运行记录
    pub async fn get_by_id(&self, id: i64) -> Result<Option<RunRecord>> {
        let run = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT id, script_name, description, start_time, end_time, duration_ms,
                   total_actions, success_count, failed_count, skipped_count, passed, properties
            FROM runs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(run)
    }

    /// 查询运行记录列表
    pub async fn list(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let mut query = String::from(
            r#"
            SELECT id, script_name, description, start_time, end_time, duration_ms,
                   total_actions, success_count, failed_count, skipped_count, passed, properties
            FROM runs
            WHERE 1=1
            "#,
        );

        if filter.script_name.is_some() {
            query.push_str(" AND script_name = ?");
        }
        if filter.passed.is_some() {
            query.push_str(" AND passed = ?");
        }

        query.push_str(" ORDER BY start_time DESC, id DESC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {}", limit));
            if let Some(offset) = filter.offset {
                query.push_str(&format!(" OFFSET {}", offset));
            }
        }

        let mut sql_query = sqlx::query_as::<_, RunRecord>(&query);
        if let Some(script_name) = &filter.script_name {
            sql_query = sql_query.bind(script_name);
        }
        if let Some(passed) = filter.passed {
            sql_query = sql_query.bind(passed);
        }

        Ok(sql_query.fetch_all(&self.pool).await?)
    }

    /// 删除运行记录(级联删除事件和属性)
    pub async fn delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("Run {} not found", id)));
        }

        debug!("Deleted run {}", id);
        Ok(())
    }

    /// 脚本最近 N 天的通过率 (百分比)
    pub async fn pass_rate(&self, script_name: &str, days: i64) -> Result<f64> {
        let since = Utc::now() - chrono::Duration::days(days);

        let result: (Option<f64>,) = sqlx::query_as(
            r#"
            SELECT CAST(SUM(CASE WHEN passed = 1 THEN 1 ELSE 0 END) AS REAL) / COUNT(*) * 100
            FROM runs
            WHERE script_name = ? AND start_time >= ?
            "#,
        )
        .bind(script_name)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(result.0.unwrap_or(0.0))
    }
}
