//! DTF 记录存储
//!
//! 运行记录、事件流和测试属性的 SQLite 持久化，供记录器的数据库
//! sink 和 `dtf report` 使用。

mod connection;
mod error;
mod models;
mod repositories;

pub use connection::StorageManager;
pub use error::{Result, StorageError};
pub use models::*;
pub use repositories::*;

use sqlx::SqlitePool;

/// 统一的数据访问层入口
pub struct Storage {
    pool: SqlitePool,
    runs: RunRepository,
    events: EventRepository,
    properties: PropertyRepository,
}

impl Storage {
    /// 从 StorageManager 创建 Storage
    pub fn from_manager(manager: &StorageManager) -> Self {
        let pool = manager.pool().clone();
        Self {
            pool: pool.clone(),
            runs: RunRepository::new(pool.clone()),
            events: EventRepository::new(pool.clone()),
            properties: PropertyRepository::new(pool),
        }
    }

    /// 获取运行记录仓储
    pub fn runs(&self) -> &RunRepository {
        &self.runs
    }

    /// 获取事件仓储
    pub fn events(&self) -> &EventRepository {
        &self.events
    }

    /// 获取测试属性仓储
    pub fn properties(&self) -> &PropertyRepository {
        &self.properties
    }

    /// 获取数据库连接池
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
