use dtf_common::Event;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::Result;
use crate::models::{EventFilter, EventRecord};

/// 事件仓储
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 追加事件
    pub async fn insert(&self, run_id: i64, seq: i64, event: &Event) -> Result<i64> {
        let record = EventRecord::from_event(run_id, seq, event)?;
        let result = sqlx::query(
            r#"
            INSERT INTO events (run_id, seq, name, timestamp, duration_ms, attributes)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.run_id)
        .bind(record.seq)
        .bind(&record.name)
        .bind(record.timestamp)
        .bind(record.duration_ms)
        .bind(&record.attributes)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// 按过滤条件查询，保持记录顺序
    pub async fn list(&self, filter: &EventFilter) -> Result<Vec<EventRecord>> {
        let mut query = String::from(
            r#"
            SELECT id, run_id, seq, name, timestamp, duration_ms, attributes
            FROM events
            WHERE 1=1
            "#,
        );

        if filter.run_id.is_some() {
            query.push_str(" AND run_id = ?");
        }
        if filter.name.is_some() {
            query.push_str(" AND name = ?");
        }
        if filter.from.is_some() {
            query.push_str(" AND timestamp >= ?");
        }
        if filter.to.is_some() {
            query.push_str(" AND timestamp <= ?");
        }

        query.push_str(" ORDER BY run_id ASC, seq ASC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {}", limit));
        }

        let mut sql_query = sqlx::query_as::<_, EventRecord>(&query);
        if let Some(run_id) = filter.run_id {
            sql_query = sql_query.bind(run_id);
        }
        if let Some(name) = &filter.name {
            sql_query = sql_query.bind(name);
        }
        if let Some(from) = filter.from {
            sql_query = sql_query.bind(from);
        }
        if let Some(to) = filter.to {
            sql_query = sql_query.bind(to);
        }

        let records = sql_query.fetch_all(&self.pool).await?;
        debug!("Loaded {} events", records.len());
        Ok(records)
    }

    /// 查询并还原为事件
    pub async fn events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        self.list(filter)
            .await?
            .iter()
            .map(EventRecord::to_event)
            .collect()
    }

    /// 运行的事件数
    pub async fn count(&self, run_id: i64) -> Result<i64> {
        let result: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events WHERE run_id = ?")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(result.0)
    }
}
