//! 运行报告

use chrono::{DateTime, Utc};
use dtf_common::{ActionStatus, Event};
use serde::{Deserialize, Serialize};

use crate::recorder::ACTION_EVENT;

/// 运行报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// 脚本名称
    pub script_name: String,

    /// 脚本描述
    pub description: Option<String>,

    /// 是否通过
    pub passed: bool,

    /// 是否被中途停止
    #[serde(default)]
    pub stopped: bool,

    /// 开始时间
    pub started_at: DateTime<Utc>,

    /// 执行的动作数
    pub actions_executed: usize,

    /// 成功的动作数
    pub passed_count: usize,

    /// 失败的动作数
    pub failed_count: usize,

    /// 总耗时（毫秒）
    pub duration_ms: u64,

    /// 终止运行的错误
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// 数据库中的运行 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<i64>,

    /// 测试属性
    #[serde(default)]
    pub properties: Vec<(String, String)>,

    /// 动作报告列表
    pub actions: Vec<ActionReport>,
}

impl RunReport {
    pub fn new(name: &str) -> Self {
        Self {
            script_name: name.to_string(),
            description: None,
            passed: true,
            stopped: false,
            started_at: Utc::now(),
            actions_executed: 0,
            passed_count: 0,
            failed_count: 0,
            duration_ms: 0,
            error: None,
            run_id: None,
            properties: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn add_action(&mut self, action: ActionReport) {
        self.actions_executed += 1;

        match action.status {
            ActionStatus::Success => self.passed_count += 1,
            ActionStatus::Failed => {
                self.failed_count += 1;
                self.passed = false;
            }
            ActionStatus::Skipped => {}
        }

        self.actions.push(action);
    }

    /// 从事件流汇总动作报告
    pub fn collect_events(&mut self, events: &[Event]) {
        for event in events.iter().filter(|e| e.name == ACTION_EVENT) {
            self.add_action(ActionReport::from_event(event));
        }
    }

    /// 导出为 JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// 导出为 YAML
    pub fn to_yaml(&self) -> serde_yaml::Result<String> {
        serde_yaml::to_string(self)
    }
}

/// 动作报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionReport {
    /// 动作标签
    pub action: String,

    /// 动作类型
    pub kind: String,

    pub status: ActionStatus,

    /// 逻辑线程
    pub thread: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,

    /// 耗时（毫秒）
    pub duration_ms: u64,
}

impl ActionReport {
    pub fn from_event(event: &Event) -> Self {
        let status = match event.text("status") {
            Some("success") => ActionStatus::Success,
            Some("skipped") => ActionStatus::Skipped,
            _ => ActionStatus::Failed,
        };
        Self {
            action: event.text("action").unwrap_or_default().to_string(),
            kind: event.text("type").unwrap_or_default().to_string(),
            status,
            thread: event.text("thread").unwrap_or("main").to_string(),
            agent: event.text("agent").map(str::to_string),
            error: event.text("error").map(str::to_string),
            started_at: event.timestamp,
            duration_ms: event.duration_ms.unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action_event(label: &str, status: &str) -> Event {
        Event::new(ACTION_EVENT)
            .with_duration(3)
            .with_attr("action", label)
            .with_attr("type", "log")
            .with_attr("status", status)
            .with_attr("thread", "main")
    }

    #[test]
    fn test_collect_events() {
        let mut report = RunReport::new("smoke");
        report.collect_events(&[
            action_event("A", "success"),
            Event::new("put"),
            action_event("B", "failed").with_attr("error", "boom"),
        ]);

        assert!(!report.passed);
        assert_eq!(report.actions_executed, 2);
        assert_eq!(report.passed_count, 1);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.actions[1].error.as_deref(), Some("boom"));
        assert_eq!(report.actions[0].duration_ms, 3);
    }

    #[test]
    fn test_export() {
        let mut report = RunReport::new("smoke");
        report.add_action(ActionReport::from_event(&action_event("A", "success")));

        let json = report.to_json().unwrap();
        assert!(json.contains("\"script_name\": \"smoke\""));
        let yaml = report.to_yaml().unwrap();
        assert!(yaml.contains("passed: true"));
    }
}
