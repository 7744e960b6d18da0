//! 结果记录器
//!
//! 所有事件追加到一条有序的事件流，并同步转发给配置的记录后端。
//! 后端写入失败只会告警，事件流本身始终可用于查询和统计。

use async_trait::async_trait;
use dtf_common::{AttrValue, Event};
use dtf_storage::Storage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{ExecutorError, Result};

/// 每个动作执行后记录的事件名称
pub const ACTION_EVENT: &str = "dtf.action";

/// 解析带类型前缀的属性值 (`int:` / `float:` / `bool:`)，其余按文本处理
pub fn parse_attr_value(attribute: &str, raw: &str) -> Result<AttrValue> {
    let invalid = |message: String| ExecutorError::Attribute {
        attribute: attribute.to_string(),
        message,
    };

    if let Some(v) = raw.strip_prefix("int:") {
        v.trim()
            .parse::<i64>()
            .map(AttrValue::Int)
            .map_err(|_| invalid(format!("`{}` 不是整数", v)))
    } else if let Some(v) = raw.strip_prefix("float:") {
        v.trim()
            .parse::<f64>()
            .map(AttrValue::Float)
            .map_err(|_| invalid(format!("`{}` 不是浮点数", v)))
    } else if let Some(v) = raw.strip_prefix("bool:") {
        v.trim()
            .parse::<bool>()
            .map(AttrValue::Bool)
            .map_err(|_| invalid(format!("`{}` 不是布尔值", v)))
    } else {
        Ok(AttrValue::Text(raw.to_string()))
    }
}

/// 事件查询条件
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// 事件名称
    pub name: Option<String>,

    /// 属性等值条件
    pub attributes: Vec<(String, AttrValue)>,
}

impl EventQuery {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.attributes.push((key.to_string(), value.into()));
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(name) = &self.name {
            if &event.name != name {
                return false;
            }
        }
        self.attributes
            .iter()
            .all(|(k, v)| event.attr(k) == Some(v))
    }
}

/// 事件游标 (按记录顺序)
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    events: Vec<Event>,
}

impl Cursor {
    pub fn from_events(events: Vec<Event>) -> Self {
        Self { events }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_vec(self) -> Vec<Event> {
        self.events
    }
}

/// 记录后端
#[async_trait]
pub trait RecordingSink: Send + Sync {
    fn name(&self) -> &str;

    async fn on_event(&self, event: &Event) -> Result<()>;

    async fn on_property(&self, _name: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// 内存后端，提供事件游标
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
    properties: Mutex<Vec<(String, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cursor(&self, query: &EventQuery) -> Cursor {
        let events = self.events.lock().await;
        Cursor::from_events(events.iter().filter(|e| query.matches(e)).cloned().collect())
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    pub async fn properties(&self) -> Vec<(String, String)> {
        self.properties.lock().await.clone()
    }
}

#[async_trait]
impl RecordingSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn on_event(&self, event: &Event) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }

    async fn on_property(&self, name: &str, value: &str) -> Result<()> {
        self.properties
            .lock()
            .await
            .push((name.to_string(), value.to_string()));
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum FileRecord<'a> {
    Event(&'a Event),
    Property { name: &'a str, value: &'a str },
}

/// 文件后端 (JSON Lines)
pub struct FileSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl FileSink {
    /// 以追加模式打开文件，必要时创建父目录
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_line(&self, record: &FileRecord<'_>) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| ExecutorError::Config(format!("事件序列化失败: {}", e)))?;
        line.push('\n');
        self.file.lock().await.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordingSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn on_event(&self, event: &Event) -> Result<()> {
        self.write_line(&FileRecord::Event(event)).await
    }

    async fn on_property(&self, name: &str, value: &str) -> Result<()> {
        self.write_line(&FileRecord::Property { name, value }).await
    }

    async fn flush(&self) -> Result<()> {
        self.file.lock().await.flush().await?;
        Ok(())
    }
}

/// 数据库后端
pub struct SqliteSink {
    storage: Arc<Storage>,
    run_id: i64,
    seq: AtomicI64,
}

impl SqliteSink {
    pub fn new(storage: Arc<Storage>, run_id: i64) -> Self {
        Self {
            storage,
            run_id,
            seq: AtomicI64::new(0),
        }
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }
}

#[async_trait]
impl RecordingSink for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn on_event(&self, event: &Event) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.storage.events().insert(self.run_id, seq, event).await?;
        Ok(())
    }

    async fn on_property(&self, name: &str, value: &str) -> Result<()> {
        self.storage
            .properties()
            .insert(self.run_id, name, value)
            .await?;
        Ok(())
    }
}

/// 结果记录器
///
/// 在调度器的所有逻辑线程之间共享，事件按到达顺序追加。
pub struct Recorder {
    memory: Arc<MemorySink>,
    sinks: Vec<Arc<dyn RecordingSink>>,

    /// 保证所有后端看到同一顺序
    order: Mutex<()>,
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            memory: Arc::new(MemorySink::new()),
            sinks: Vec::new(),
            order: Mutex::new(()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RecordingSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// 追加事件
    pub async fn record(&self, event: Event) {
        let _order = self.order.lock().await;
        debug!(event = %event.name, "记录事件");

        // 内存后端不会失败
        let _ = self.memory.on_event(&event).await;
        for sink in &self.sinks {
            if let Err(e) = sink.on_event(&event).await {
                warn!("记录后端 {} 写入事件失败: {}", sink.name(), e);
            }
        }
    }

    /// 记录测试属性
    pub async fn record_property(&self, name: &str, value: &str) {
        let _order = self.order.lock().await;
        let _ = self.memory.on_property(name, value).await;
        for sink in &self.sinks {
            if let Err(e) = sink.on_property(name, value).await {
                warn!("记录后端 {} 写入属性失败: {}", sink.name(), e);
            }
        }
    }

    pub async fn cursor(&self, query: &EventQuery) -> Cursor {
        self.memory.cursor(query).await
    }

    pub async fn events(&self) -> Vec<Event> {
        self.memory.events().await
    }

    pub async fn properties(&self) -> Vec<(String, String)> {
        self.memory.properties().await
    }

    pub async fn flush(&self) {
        for sink in &self.sinks {
            if let Err(e) = sink.flush().await {
                warn!("记录后端 {} 刷新失败: {}", sink.name(), e);
            }
        }
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}
