use std::path::PathBuf;
use thiserror::Error;

/// 记录库错误
#[derive(Error, Debug)]
pub enum StorageError {
    /// 无法打开记录库文件
    #[error("无法打开记录库 {path:?}: {reason}")]
    Open { path: PathBuf, reason: String },

    /// 建表脚本执行失败
    #[error("记录库第 {version} 版结构升级失败: {reason}")]
    Schema { version: u32, reason: String },

    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    /// 事件属性 JSON 编解码失败
    #[error("事件属性编解码失败: {0}")]
    Attributes(#[from] serde_json::Error),

    /// 指定的运行记录不存在
    #[error("记录不存在: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
