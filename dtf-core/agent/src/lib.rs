//! DTF Agent
//!
//! 监听 WebSocket 连接，执行调度端派发的动作子树并按关联 ID 回复结果。
//! 调度端登记的线程会收到子树中 log 动作产生的远程日志。

pub mod client;
pub mod server;
pub mod service;

pub use client::{ClientInfo, ClientManager, SessionForwarder};
pub use server::{AgentConfig, AgentServer};
pub use service::AgentService;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("客户端未连接: {0}")]
    ClientNotConnected(String),

    #[error("握手失败: {0}")]
    Handshake(String),

    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<dtf_transport::TransportError> for AgentError {
    fn from(err: dtf_transport::TransportError) -> Self {
        Self::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
