//! DTF 执行器
//!
//! 负责遍历动作树：解析引用、求值属性、本地执行或派发到远程 Agent，
//! 并把每个动作的结果作为事件记录下来。

pub mod archive;
pub mod dispatcher;
pub mod plugins;
pub mod recorder;
pub mod report;
pub mod runner;
pub mod stats;

pub use archive::{ArchiveClient, MemoryArchive};
pub use dispatcher::{Dispatcher, LogForwarder, Outcome, Phase, StopHandle};
pub use plugins::{ActionHandler, CommandPlugin, PluginCapability, PluginManifest, PluginRegistry};
pub use recorder::{
    parse_attr_value, Cursor, EventQuery, FileSink, MemorySink, Recorder, RecordingSink,
    SqliteSink, ACTION_EVENT,
};
pub use report::{ActionReport, RunReport};
pub use runner::ScriptRunner;
pub use stats::{calc_stats, StatsReport};

use dtf_common::ErrorPayload;
use dtf_script::ScriptError;
use dtf_storage::StorageError;
use dtf_transport::TransportError;
use thiserror::Error;
use tracing::{error, info};

/// 执行器错误
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("脚本解析失败: {0}")]
    Parse(String),

    #[error("引用解析失败: {0}")]
    Reference(String),

    #[error("属性 {attribute} 取值无效: {message}")]
    Attribute { attribute: String, message: String },

    #[error("通信失败: {0}")]
    CommFailure(String),

    #[error("没有可用的 Agent: {0}")]
    NoAvailableAgent(String),

    #[error("远程执行失败 ({agent}): [{kind}] {message}")]
    RemoteExecution {
        agent: String,
        kind: String,
        message: String,
    },

    #[error("动作执行失败: {0}")]
    ActionFailed(String),

    #[error("统计失败: {0}")]
    Aggregation(String),

    #[error("执行已停止")]
    Stopped,

    #[error("插件错误: {0}")]
    Plugin(String),

    #[error("存储客户端错误: {0}")]
    Archive(String),

    #[error("记录存储错误: {0}")]
    Storage(#[from] StorageError),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("配置错误: {0}")]
    Config(String),
}

impl ExecutorError {
    /// 错误类别 (跨进程传递时使用)
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::Reference(_) => "reference",
            Self::Attribute { .. } => "attribute",
            Self::CommFailure(_) => "comm_failure",
            Self::NoAvailableAgent(_) => "no_available_agent",
            Self::RemoteExecution { .. } => "remote_execution",
            Self::ActionFailed(_) => "action_failed",
            Self::Aggregation(_) => "aggregation",
            Self::Stopped => "stopped",
            Self::Plugin(_) => "plugin",
            Self::Archive(_) => "archive",
            Self::Storage(_) => "storage",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }

    /// 由 Agent 返回的异常载荷重建
    pub fn from_remote(agent: &str, payload: &ErrorPayload) -> Self {
        Self::RemoteExecution {
            agent: agent.to_string(),
            kind: payload.kind.clone(),
            message: payload.message.clone(),
        }
    }
}

impl From<ScriptError> for ExecutorError {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::Parse(msg) => Self::Parse(msg),
            ScriptError::Reference(msg) => Self::Reference(msg),
            ScriptError::Attribute { attribute, message } => Self::Attribute { attribute, message },
            ScriptError::Io(e) => Self::Io(e),
        }
    }
}

impl From<TransportError> for ExecutorError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NoAvailableAgent(_) | TransportError::UnknownAgent(_) => {
                Self::NoAvailableAgent(err.to_string())
            }
            other => Self::CommFailure(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// 沿动作树向上传递的失败
///
/// 同一个失败只记录一次事件、只输出一次错误日志。
#[derive(Error, Debug)]
#[error("{action}: {error}")]
pub struct ActionFailure {
    /// 失败的动作标签
    pub action: String,

    pub error: ExecutorError,

    logged: bool,
    recorded: bool,
}

impl ActionFailure {
    pub fn new(action: &str, error: ExecutorError) -> Self {
        Self {
            action: action.to_string(),
            error,
            logged: false,
            recorded: false,
        }
    }

    /// 不产生事件的失败 (引用解析失败、停止)
    pub fn silent(action: &str, error: ExecutorError) -> Self {
        Self {
            recorded: true,
            ..Self::new(action, error)
        }
    }

    pub fn is_logged(&self) -> bool {
        self.logged
    }

    pub fn is_recorded(&self) -> bool {
        self.recorded
    }

    pub(crate) fn mark_recorded(&mut self) {
        self.recorded = true;
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.error, ExecutorError::Stopped)
    }

    /// 输出错误日志 (仅第一次生效)
    pub fn log_once(&mut self) {
        if self.logged {
            return;
        }
        self.logged = true;
        if self.is_stopped() {
            info!(action = %self.action, "执行已停止");
        } else {
            error!(action = %self.action, "动作执行失败: {}", self.error);
        }
    }
}
