//! DTF 通信层
//!
//! 负责把序列化后的动作子树发送给远程 Agent，并按关联 ID 取回结果。
//! 通信层本身不做重试，重试策略由调度器决定。

pub mod config;
pub mod connection;
pub mod directory;
pub mod manager;
pub mod pool;
pub mod protocol;

pub use config::{ReconnectConfig, TransportConfig};
pub use connection::{AgentConnection, ConnectionEvent, ConnectionState};
pub use directory::{AgentDirectory, Member, Membership, MembershipSource, Selector, StaticMembership};
pub use manager::TransportManager;
pub use pool::{ConnectionPool, DispatchCallback, PendingRequest};
pub use protocol::WireMessage;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// 通信层错误
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("与 Agent {agent} 通信失败: {message}")]
    CommFailure { agent: String, message: String },

    #[error("等待 Agent {0} 响应超时")]
    Timeout(String),

    #[error("连接已断开")]
    Disconnected,

    #[error("Agent {0} 不可达 (连续失败次数过多)")]
    AgentUnreachable(String),

    #[error("选择器 {0} 没有可用的 Agent")]
    NoAvailableAgent(String),

    #[error("Agent {0} 不存在")]
    UnknownAgent(String),

    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransportError {
    pub fn comm(agent: &str, message: impl Into<String>) -> Self {
        Self::CommFailure {
            agent: agent.to_string(),
            message: message.into(),
        }
    }

    /// 是否属于可由调度器重试的传输失败
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CommFailure { .. } | Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Agent 信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Agent 名称
    pub name: String,

    /// 监听地址 (host:port)
    pub address: String,

    /// 角色 (用于 role: 选择器)
    #[serde(default)]
    pub roles: Vec<String>,

    /// 元数据
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AgentInfo {
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            roles: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// WebSocket URL
    pub fn url(&self) -> String {
        if self.address.starts_with("ws://") || self.address.starts_with("wss://") {
            self.address.clone()
        } else {
            format!("ws://{}", self.address)
        }
    }
}
