use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::Result;
use crate::models::TestPropertyRecord;

/// 测试属性仓储
pub struct PropertyRepository {
    pool: SqlitePool,
}

impl PropertyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, run_id: i64, name: &str, value: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO test_properties (run_id, name, value, recorded_at) VALUES (?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(name)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// 运行的全部测试属性 (按记录顺序)
    pub async fn list_for_run(&self, run_id: i64) -> Result<Vec<TestPropertyRecord>> {
        let records = sqlx::query_as::<_, TestPropertyRecord>(
            r#"
            SELECT id, run_id, name, value, recorded_at
            FROM test_properties
            WHERE run_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
