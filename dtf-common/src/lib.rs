//! DTF 通用类型定义
//!
//! 此 crate 包含调度端与远程 Agent 之间共享的类型：动作执行结果、
//! 事件记录、执行状态快照以及远程日志记录。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 全局上下文中约定的键
pub mod context_keys {
    /// 当前逻辑线程 ID
    pub const THREAD_ID: &str = "dtf.thread";

    /// 发起远程子执行的调度端线程 ID (用于远程日志回推)
    pub const REMOTE_THREAD: &str = "dtf.remote_thread";

    /// 当前执行所在的 Agent 名称
    pub const AGENT: &str = "dtf.agent";
}

/// 动作执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failed,
    Skipped,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 远程异常载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// 错误类别 (parse / reference / comm_failure / action_failed ...)
    pub kind: String,

    /// 错误信息
    pub message: String,
}

/// 动作执行结果
///
/// 每个被调度的动作产生一次，创建后不再修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// 动作标签
    pub action: String,

    /// 执行状态
    pub status: ActionStatus,

    /// 失败时的异常载荷
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,

    /// 开始时间
    pub started_at: DateTime<Utc>,

    /// 耗时（毫秒）
    pub duration_ms: u64,

    /// 结构化输出 (例如命令的 stdout)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// 执行该动作的 Agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl ActionResult {
    pub fn success(action: &str, started_at: DateTime<Utc>, duration_ms: u64) -> Self {
        Self {
            action: action.to_string(),
            status: ActionStatus::Success,
            error: None,
            started_at,
            duration_ms,
            output: None,
            agent: None,
        }
    }

    pub fn failed(
        action: &str,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        error: ErrorPayload,
    ) -> Self {
        Self {
            action: action.to_string(),
            status: ActionStatus::Failed,
            error: Some(error),
            started_at,
            duration_ms,
            output: None,
            agent: None,
        }
    }

    pub fn skipped(action: &str) -> Self {
        Self {
            action: action.to_string(),
            status: ActionStatus::Skipped,
            error: None,
            started_at: Utc::now(),
            duration_ms: 0,
            output: None,
            agent: None,
        }
    }

    pub fn with_output(mut self, output: Option<String>) -> Self {
        self.output = output;
        self
    }

    pub fn with_agent(mut self, agent: &str) -> Self {
        self.agent = Some(agent.to_string());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// 事件属性值
///
/// 只有 `Int` / `Float` 参与数值统计。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl AttrValue {
    /// 数值视图，非数值类型返回 None
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Text(_) => "text",
        }
    }
}

impl std::fmt::Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// 事件记录
///
/// 追加到事件流后不再修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 事件名称
    pub name: String,

    /// 时间戳 (开始时间)
    pub timestamp: DateTime<Utc>,

    /// 耗时（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// 属性
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
}

impl Event {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            timestamp: Utc::now(),
            duration_ms: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    /// 文本属性
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(AttrValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// 结束时间 (timestamp + duration)
    pub fn end_time(&self) -> DateTime<Utc> {
        self.timestamp + chrono::Duration::milliseconds(self.duration_ms.unwrap_or(0) as i64)
    }
}

/// 执行状态快照
///
/// 远程执行时随动作子树一起发送的最小状态切片。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// 属性
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// 全局上下文 (例如远程线程关联 ID)
    #[serde(default)]
    pub global_context: BTreeMap<String, String>,
}

/// 远程日志记录 (Agent 主动推送给调度端)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteLogRecord {
    /// 调度端线程 ID
    pub thread_id: String,

    /// 产生日志的 Agent
    pub agent: String,

    /// 日志级别
    pub level: String,

    /// 日志内容
    pub message: String,

    /// 时间戳
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_value_numeric() {
        assert_eq!(AttrValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(AttrValue::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(AttrValue::Text("3".to_string()).as_f64(), None);
        assert!(!AttrValue::Bool(true).is_numeric());
    }

    #[test]
    fn test_attr_value_wire_format() {
        let json = serde_json::to_string(&AttrValue::Int(7)).unwrap();
        assert_eq!(json, r#"{"int":7}"#);

        let back: AttrValue = serde_json::from_str(r#"{"float":1.5}"#).unwrap();
        assert_eq!(back, AttrValue::Float(1.5));
    }

    #[test]
    fn test_event_end_time() {
        let event = Event::new("put").with_duration(1500);
        let delta = event.end_time() - event.timestamp;
        assert_eq!(delta.num_milliseconds(), 1500);
    }

    #[test]
    fn test_action_result_builders() {
        let now = Utc::now();
        let result = ActionResult::success("exec", now, 12)
            .with_output(Some("ok".to_string()))
            .with_agent("agent-1");
        assert!(result.is_success());
        assert_eq!(result.agent.as_deref(), Some("agent-1"));

        let failed = ActionResult::failed(
            "exec",
            now,
            3,
            ErrorPayload {
                kind: "action_failed".to_string(),
                message: "boom".to_string(),
            },
        );
        assert_eq!(failed.status, ActionStatus::Failed);
        assert_eq!(failed.error.unwrap().message, "boom");
    }
}
