use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{Result, StorageError};

/// 按版本顺序排列的建表脚本，`user_version` 记录已应用到第几版
const SCHEMA: &[(u32, &str)] = &[(1, include_str!("../migrations/001_initial.sql"))];

/// 记录库句柄，持有连接池并保证表结构为最新
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// 打开 (必要时创建) 记录库文件，路径支持 `~`
    ///
    /// ```no_run
    /// # use dtf_storage::StorageManager;
    /// # async fn example() -> dtf_storage::Result<()> {
    /// let records = StorageManager::new("~/.config/dtf/records.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(db_path: &str) -> Result<Self> {
        let path = PathBuf::from(shellexpand::tilde(db_path).as_ref());
        let open_err = |reason: String| StorageError::Open {
            path: path.clone(),
            reason,
        };

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| open_err(e.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| open_err(e.to_string()))?;

        info!("记录库已打开: {}", path.display());
        Self::prepare(pool).await
    }

    /// 内存记录库，只有一条连接，连接关闭后数据即丢失
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Open {
                path: Path::new(":memory:").to_path_buf(),
                reason: e.to_string(),
            })?;

        Self::prepare(pool).await
    }

    async fn prepare(pool: SqlitePool) -> Result<Self> {
        let manager = Self { pool };
        manager.upgrade_schema().await?;
        Ok(manager)
    }

    /// 依次应用尚未执行的建表脚本，每一版在独立事务内完成
    async fn upgrade_schema(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let (current,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(&mut *conn)
            .await?;

        for (version, sql) in SCHEMA.iter().filter(|(v, _)| i64::from(*v) > current) {
            debug!("应用记录库结构第 {} 版", version);
            let schema_err = |e: sqlx::Error| StorageError::Schema {
                version: *version,
                reason: e.to_string(),
            };

            let mut tx = conn.begin().await.map_err(schema_err)?;
            sqlx::query(sql).execute(&mut *tx).await.map_err(schema_err)?;
            // PRAGMA 不接受绑定参数
            sqlx::query(&format!("PRAGMA user_version = {}", version))
                .execute(&mut *tx)
                .await
                .map_err(schema_err)?;
            tx.commit().await.map_err(schema_err)?;
        }

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 已应用的结构版本
    pub async fn schema_version(&self) -> Result<u32> {
        let (version,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(version.max(0) as u32)
    }

    /// 等待进行中的写入完成后关闭连接池
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// 确认连接可用
    pub async fn health_check(&self) -> Result<()> {
        self.pool.acquire().await?.ping().await?;
        Ok(())
    }
}
