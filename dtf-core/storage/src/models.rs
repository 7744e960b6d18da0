use chrono::{DateTime, Utc};
use dtf_common::{AttrValue, Event};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

use crate::error::Result;

/// 运行记录数据库模型
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunRecord {
    pub id: i64,
    pub script_name: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub total_actions: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub skipped_count: i64,
    pub passed: bool,
    pub properties: Option<String>, // JSON object
}

impl RunRecord {
    /// 新建一条进行中的运行记录
    pub fn started(script_name: &str, description: Option<String>) -> Self {
        Self {
            id: 0,
            script_name: script_name.to_string(),
            description,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            total_actions: 0,
            success_count: 0,
            failed_count: 0,
            skipped_count: 0,
            passed: false,
            properties: None,
        }
    }
}

/// 事件数据库模型
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventRecord {
    pub id: i64,
    pub run_id: i64,
    pub seq: i64,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub attributes: String, // JSON object
}

impl EventRecord {
    pub fn from_event(run_id: i64, seq: i64, event: &Event) -> Result<Self> {
        Ok(Self {
            id: 0,
            run_id,
            seq,
            name: event.name.clone(),
            timestamp: event.timestamp,
            duration_ms: event.duration_ms.map(|d| d as i64),
            attributes: serde_json::to_string(&event.attributes)?,
        })
    }

    pub fn to_event(&self) -> Result<Event> {
        let attributes: BTreeMap<String, AttrValue> = serde_json::from_str(&self.attributes)?;
        Ok(Event {
            name: self.name.clone(),
            timestamp: self.timestamp,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
            attributes,
        })
    }
}

/// 测试属性数据库模型
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TestPropertyRecord {
    pub id: i64,
    pub run_id: i64,
    pub name: String,
    pub value: String,
    pub recorded_at: DateTime<Utc>,
}

/// 运行记录查询过滤器
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub script_name: Option<String>,
    pub passed: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// 事件查询过滤器
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub run_id: Option<i64>,
    pub name: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl EventFilter {
    pub fn for_run(run_id: i64) -> Self {
        Self {
            run_id: Some(run_id),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}
